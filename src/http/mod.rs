pub mod routes;

use std::{future::Future, sync::Arc};

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tokio::net::TcpListener;

use crate::broker::{Broker, BrokerError};

pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route(
            "/topics",
            get(routes::list_topics).post(routes::create_topic),
        )
        .route("/produce", post(routes::produce))
        .route("/consume", get(routes::consume))
        .route("/ack", post(routes::acknowledge))
        .route("/dashboard", get(routes::dashboard))
        .route("/dead-letters", get(routes::dead_letters))
        .with_state(broker)
}

/// Serves until `shutdown` resolves, then drains in-flight requests.
pub async fn serve<F>(
    listener: TcpListener,
    broker: Arc<Broker>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "http listening");
    }

    axum::serve(listener, router(broker))
        .with_graceful_shutdown(shutdown)
        .await
}

#[derive(Debug)]
pub struct ApiError(pub BrokerError);

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            BrokerError::Validation(_) => StatusCode::BAD_REQUEST,
            BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::Conflict(_) | BrokerError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            BrokerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
