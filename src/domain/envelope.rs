use super::queue::QueueName;
use crate::error::{PipelineError, Result};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Unacknowledged,
    Acked,
    NackedRequeued,
    NackedDiscarded,
}

#[derive(Debug)]
struct HandleState {
    ack: AckState,
    permit: Option<OwnedSemaphorePermit>,
}

/// Opaque acknowledgment handle for one delivered message.
///
/// A handle accepts exactly one terminal transition out of `Unacknowledged`.
/// It also carries the prefetch slot of the subscription that received the
/// message; the slot is handed back when the handle is settled.
#[derive(Debug)]
pub struct DeliveryHandle {
    tag: u64,
    state: Mutex<HandleState>,
}

impl DeliveryHandle {
    pub fn new(tag: u64, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            tag,
            state: Mutex::new(HandleState {
                ack: AckState::Unacknowledged,
                permit,
            }),
        }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub async fn state(&self) -> AckState {
        self.state.lock().await.ack
    }

    /// Moves the handle to a terminal state, returning its prefetch slot.
    pub async fn settle(&self, outcome: AckState) -> Result<Option<OwnedSemaphorePermit>> {
        let mut state = self.state.lock().await;
        if state.ack != AckState::Unacknowledged || outcome == AckState::Unacknowledged {
            return Err(PipelineError::AlreadySettled { tag: self.tag });
        }
        state.ack = outcome;
        Ok(state.permit.take())
    }
}

/// A message handed to a consumer together with its acknowledgment handle.
#[derive(Debug)]
pub struct Delivery {
    pub queue: QueueName,
    pub body: Vec<u8>,
    /// Number of times this message has been delivered, starting at 1.
    pub delivery_count: u32,
    pub handle: DeliveryHandle,
}

impl Delivery {
    pub fn tag(&self) -> u64 {
        self.handle.tag()
    }

    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

/// A message a stage wants forwarded once the current delivery is processed.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub queue: QueueName,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn json<T: Serialize>(queue: QueueName, payload: &T) -> Result<Self> {
        Ok(Self {
            queue,
            body: serde_json::to_vec(payload)?,
        })
    }
}

#[derive(Debug)]
pub enum Verdict {
    Ack,
    NackRequeue(PipelineError),
}

/// What a stage handler decided about one delivery.
#[derive(Debug)]
pub struct StageDecision {
    pub outbound: Vec<OutboundMessage>,
    pub verdict: Verdict,
}

impl StageDecision {
    pub fn ack(outbound: Vec<OutboundMessage>) -> Self {
        Self {
            outbound,
            verdict: Verdict::Ack,
        }
    }

    pub fn retry(error: PipelineError) -> Self {
        Self {
            outbound: Vec::new(),
            verdict: Verdict::NackRequeue(error),
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self.verdict, Verdict::Ack)
    }
}

impl From<Result<Vec<OutboundMessage>>> for StageDecision {
    fn from(result: Result<Vec<OutboundMessage>>) -> Self {
        match result {
            Ok(outbound) => StageDecision::ack(outbound),
            Err(e) => StageDecision::retry(e),
        }
    }
}
