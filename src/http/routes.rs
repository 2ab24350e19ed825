use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    broker::{Broker, BrokerError, DashboardMetrics, DeliveredMessage, ProducedMessage},
    http::ApiError,
    storage::{MessageId, MessageStatus, Offset, PartitionId, PartitionNumber, TopicId},
    util::UnixMillis,
};

const DEFAULT_DEAD_LETTER_LIMIT: usize = 100;

type ApiResult<T> = Result<Json<T>, ApiError>;

fn body<T>(req: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    req.map(|Json(v)| v)
        .map_err(|e| BrokerError::Validation(e.body_text()).into())
}

/// Stored payloads are JSON bytes; anything else is surfaced as a string.
fn payload_value(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[derive(Deserialize)]
pub struct CreateTopicRequest {
    pub name: String,
    #[serde(default)]
    pub partitions: i64,
}

#[derive(Serialize, Deserialize)]
pub struct CreateTopicResponse {
    pub id: TopicId,
    pub name: String,
    pub partitions: usize,
}

pub async fn create_topic(
    State(broker): State<Arc<Broker>>,
    req: Result<Json<CreateTopicRequest>, JsonRejection>,
) -> ApiResult<CreateTopicResponse> {
    let req = body(req)?;
    let topic = broker.create_topic(&req.name, req.partitions).await?;

    Ok(Json(CreateTopicResponse {
        id: topic.id,
        name: topic.name,
        partitions: topic.partitions.len(),
    }))
}

#[derive(Serialize, Deserialize)]
pub struct TopicView {
    pub id: TopicId,
    pub name: String,
    pub partitions: Vec<PartitionNumber>,
}

pub async fn list_topics(State(broker): State<Arc<Broker>>) -> ApiResult<Vec<TopicView>> {
    let topics = broker.list_topics().await?;

    Ok(Json(
        topics
            .into_iter()
            .map(|t| TopicView {
                id: t.id,
                name: t.name,
                partitions: t.partitions.iter().map(|p| p.number).collect(),
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
pub struct ProduceRequest {
    pub topic: String,
    #[serde(default)]
    pub key: Option<String>,
    pub payload: Value,
}

pub async fn produce(
    State(broker): State<Arc<Broker>>,
    req: Result<Json<ProduceRequest>, JsonRejection>,
) -> ApiResult<ProducedMessage> {
    let req = body(req)?;
    let payload = serde_json::to_vec(&req.payload)
        .map_err(|e| BrokerError::Validation(format!("payload: {e}")))?;

    let produced = broker
        .produce(&req.topic, req.key.as_deref(), &payload)
        .await?;
    Ok(Json(produced))
}

#[derive(Deserialize)]
pub struct ConsumeParams {
    pub topic: Option<String>,
    pub group: Option<String>,
    pub batch: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct ConsumedMessage {
    pub id: MessageId,
    pub payload: Value,
    pub partition: PartitionNumber,
    pub offset: Offset,
}

impl From<DeliveredMessage> for ConsumedMessage {
    fn from(m: DeliveredMessage) -> Self {
        Self {
            id: m.id,
            payload: payload_value(&m.payload),
            partition: m.partition,
            offset: m.offset,
        }
    }
}

pub async fn consume(
    State(broker): State<Arc<Broker>>,
    Query(params): Query<ConsumeParams>,
) -> ApiResult<Vec<ConsumedMessage>> {
    let (Some(topic), Some(group)) = (params.topic, params.group) else {
        return Err(BrokerError::Validation("missing topic or group".into()).into());
    };
    // Unparseable batch sizes fall back to the default, like an absent one.
    let batch = params.batch.and_then(|b| b.parse::<usize>().ok());

    let delivered = broker.consume(&topic, &group, batch).await?;
    Ok(Json(delivered.into_iter().map(Into::into).collect()))
}

#[derive(Deserialize)]
pub struct AckRequest {
    pub message_id: MessageId,
    pub status: String,
}

#[derive(Serialize, Deserialize)]
pub struct AckResponse {
    pub message_id: MessageId,
    pub status: MessageStatus,
    pub attempt_count: u32,
}

pub async fn acknowledge(
    State(broker): State<Arc<Broker>>,
    req: Result<Json<AckRequest>, JsonRejection>,
) -> ApiResult<AckResponse> {
    let req = body(req)?;
    let msg = broker.acknowledge(req.message_id, &req.status).await?;

    Ok(Json(AckResponse {
        message_id: msg.id,
        status: msg.status,
        attempt_count: msg.attempt_count,
    }))
}

pub async fn dashboard(State(broker): State<Arc<Broker>>) -> ApiResult<DashboardMetrics> {
    Ok(Json(broker.dashboard().await?))
}

#[derive(Deserialize)]
pub struct DeadLetterParams {
    pub limit: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct DeadLetterView {
    pub message_id: MessageId,
    pub partition_id: PartitionId,
    pub offset: Offset,
    pub payload: Value,
    pub dead_at: UnixMillis,
}

pub async fn dead_letters(
    State(broker): State<Arc<Broker>>,
    Query(params): Query<DeadLetterParams>,
) -> ApiResult<Vec<DeadLetterView>> {
    let limit = params
        .limit
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);
    let letters = broker.dead_letters(limit).await?;

    Ok(Json(
        letters
            .into_iter()
            .map(|dl| DeadLetterView {
                message_id: dl.message_id,
                partition_id: dl.partition_id,
                offset: dl.offset,
                payload: payload_value(&dl.payload),
                dead_at: dl.dead_at,
            })
            .collect(),
    ))
}
