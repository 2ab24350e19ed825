use std::{fmt, str::FromStr, sync::Arc};

use crate::{
    broker::BrokerError,
    storage::{DeadLetterRecord, MessageId, MessageRecord, MessageStatus, Storage},
    util::{UnixMillis, unix_millis},
};

pub const MAX_RETRIES: u32 = 3;

// Bound on read-decide-swap rounds when a message keeps changing underneath.
const SWAP_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// pending -> acknowledged
    Acknowledge,
    /// pending | failed -> failed
    Fail,
    /// failed -> pending (retry scheduler only)
    Requeue,
    /// failed -> dead (retry scheduler only)
    DeadLetter,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transition::Acknowledge => "acknowledge",
            Transition::Fail => "fail",
            Transition::Requeue => "requeue",
            Transition::DeadLetter => "dead-letter",
        };
        f.write_str(s)
    }
}

/// What a consumer may report for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acknowledged,
    Failed,
}

impl FromStr for Settlement {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "acknowledged" => Ok(Settlement::Acknowledged),
            "failed" => Ok(Settlement::Failed),
            other => Err(BrokerError::Validation(format!(
                "invalid status value: {other:?}"
            ))),
        }
    }
}

impl From<Settlement> for Transition {
    fn from(s: Settlement) -> Self {
        match s {
            Settlement::Acknowledged => Transition::Acknowledge,
            Settlement::Failed => Transition::Fail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub next: MessageRecord,
    pub dead_letter: Option<DeadLetterRecord>,
}

/// The scheduler's choice for a failed message: dead-letter once the next
/// attempt would reach the limit, requeue otherwise.
pub fn retry_decision(msg: &MessageRecord, max_retries: u32) -> Transition {
    if msg.attempt_count + 1 >= max_retries {
        Transition::DeadLetter
    } else {
        Transition::Requeue
    }
}

/// Pure transition function. Never touches storage.
pub fn apply(
    msg: &MessageRecord,
    transition: Transition,
    now: UnixMillis,
    max_retries: u32,
) -> Result<Applied, BrokerError> {
    use MessageStatus::*;

    let mut next = msg.clone();
    let mut dead_letter = None;

    match (msg.status, transition) {
        (Pending, Transition::Acknowledge) => {
            next.status = Acknowledged;
            next.acked_at = Some(now);
        }
        (Pending | Failed, Transition::Fail) => {
            next.status = Failed;
            next.attempt_count += 1;
            next.last_attempt_at = Some(now);
        }
        (Failed, Transition::Requeue) if msg.attempt_count + 1 < max_retries => {
            next.status = Pending;
        }
        (Failed, Transition::DeadLetter) if msg.attempt_count + 1 >= max_retries => {
            next.status = Dead;
            next.attempt_count += 1;
            dead_letter = Some(DeadLetterRecord {
                message_id: msg.id,
                partition_id: msg.partition_id,
                offset: msg.offset,
                payload: msg.payload.clone(),
                dead_at: now,
            });
        }
        (status, transition) => {
            return Err(BrokerError::InvalidTransition {
                message_id: msg.id,
                status,
                transition,
            });
        }
    }

    Ok(Applied { next, dead_letter })
}

/// Applies transitions against storage with compare-and-swap, so a
/// transition only lands on the exact state it was computed from.
#[derive(Debug, Clone)]
pub struct DeliveryStateMachine {
    storage: Arc<dyn Storage>,
    max_retries: u32,
}

impl DeliveryStateMachine {
    pub fn new(storage: Arc<dyn Storage>, max_retries: u32) -> Self {
        Self {
            storage,
            max_retries,
        }
    }

    pub async fn settle(
        &self,
        id: MessageId,
        settlement: Settlement,
    ) -> Result<MessageRecord, BrokerError> {
        self.transition(id, settlement.into()).await
    }

    pub async fn transition(
        &self,
        id: MessageId,
        transition: Transition,
    ) -> Result<MessageRecord, BrokerError> {
        for _ in 0..SWAP_ATTEMPTS {
            let current = self
                .storage
                .message(id)
                .await?
                .ok_or_else(|| BrokerError::NotFound(format!("message {id}")))?;

            let applied = apply(&current, transition, unix_millis(), self.max_retries)?;

            if self
                .storage
                .compare_and_swap_message(&current, &applied.next, applied.dead_letter.as_ref())
                .await?
            {
                tracing::debug!(
                    message_id = %id,
                    %transition,
                    status = %applied.next.status,
                    attempts = applied.next.attempt_count,
                    "transition applied"
                );
                return Ok(applied.next);
            }

            tracing::debug!(message_id = %id, %transition, "message changed concurrently, retrying");
        }

        Err(BrokerError::Conflict(format!(
            "message {id} changed concurrently during {transition}"
        )))
    }

    /// One retry-scheduler step for a failed message snapshot. Returns
    /// `None` if the message moved on since the snapshot was taken.
    pub async fn retry(
        &self,
        msg: &MessageRecord,
    ) -> Result<Option<(Transition, MessageRecord)>, BrokerError> {
        let transition = retry_decision(msg, self.max_retries);
        let applied = apply(msg, transition, unix_millis(), self.max_retries)?;

        let swapped = self
            .storage
            .compare_and_swap_message(msg, &applied.next, applied.dead_letter.as_ref())
            .await?;

        Ok(swapped.then_some((transition, applied.next)))
    }
}
