use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    broker::{
        BrokerError,
        delivery::{DeliveryStateMachine, Transition},
    },
    storage::Storage,
};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: super::delivery::MAX_RETRIES,
            interval: Duration::from_secs(10),
            batch_size: 10,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub scanned: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Changed by someone else between the scan and the swap.
    pub skipped: usize,
    pub errors: usize,
}

/// Periodically moves failed messages back to pending, or to the dead-letter
/// store once their retry budget is spent.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    storage: Arc<dyn Storage>,
    delivery: DeliveryStateMachine,
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(storage: Arc<dyn Storage>, policy: RetryPolicy) -> Self {
        let delivery = DeliveryStateMachine::new(storage.clone(), policy.max_retries);
        Self {
            storage,
            delivery,
            policy,
        }
    }

    /// One pass over the oldest failed messages. Only the initial scan can
    /// fail the cycle; per-message errors are logged and counted.
    pub async fn run_cycle(&self) -> Result<CycleReport, BrokerError> {
        let batch = self.storage.failed_batch(self.policy.batch_size).await?;

        let mut report = CycleReport {
            scanned: batch.len(),
            ..CycleReport::default()
        };

        for msg in &batch {
            match self.delivery.retry(msg).await {
                Ok(Some((Transition::DeadLetter, next))) => {
                    report.dead_lettered += 1;
                    tracing::info!(
                        message_id = %next.id,
                        partition = %next.partition_id,
                        offset = next.offset,
                        attempts = next.attempt_count,
                        "moved message to dead letters"
                    );
                }
                Ok(Some((_, next))) => {
                    report.requeued += 1;
                    tracing::debug!(
                        message_id = %next.id,
                        attempt = next.attempt_count + 1,
                        "requeued message"
                    );
                }
                Ok(None) => {
                    report.skipped += 1;
                }
                Err(err) => {
                    report.errors += 1;
                    tracing::warn!(message_id = %msg.id, error = %err, "retry failed, skipping");
                }
            }
        }

        Ok(report)
    }

    /// Runs cycles every `interval` until `shutdown` fires. The first cycle
    /// starts one interval after the call.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval_ms = self.policy.interval.as_millis() as u64,
            batch = self.policy.batch_size,
            max_retries = self.policy.max_retries,
            "retry scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.policy.interval) => {}
            }

            match self.run_cycle().await {
                Ok(report) if report.scanned > 0 => {
                    tracing::debug!(?report, "retry cycle finished");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "retry scan failed");
                }
            }
        }

        tracing::info!("retry scheduler stopped");
    }
}
