use super::envelope::Delivery;
use super::order::PaymentRequest;
use super::queue::QueueName;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// The only seam through which the pipeline touches the broker.
#[async_trait]
pub trait QueueGateway: Send + Sync {
    /// Declares a durable queue. Declaring an existing queue is a no-op.
    async fn declare_queue(&self, queue: QueueName) -> Result<()>;
    async fn publish(&self, queue: QueueName, payload: Vec<u8>, persistent: bool) -> Result<()>;
    /// Registers a consumer that holds at most `prefetch` unsettled deliveries.
    async fn subscribe(&self, queue: QueueName, prefetch: u16) -> Result<SubscriptionBox>;
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;
    /// Releases the connection. Unsettled deliveries go back to their queues.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. Returns `None` once the connection is closed.
    async fn next_delivery(&mut self) -> Option<Delivery>;
}

pub type GatewayRef = Arc<dyn QueueGateway>;
pub type SubscriptionBox = Box<dyn Subscription>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Approved,
    Declined { reason: String },
}

/// Decides whether a payment goes through.
///
/// A declined payment is a normal business outcome. Errors are reserved for
/// failing to reach a decision at all.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn authorize(&self, request: &PaymentRequest) -> Result<PaymentOutcome>;
}

pub type PaymentGatewayRef = Arc<dyn PaymentGateway>;
