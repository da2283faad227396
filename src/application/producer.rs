use crate::domain::order::Order;
use crate::domain::ports::GatewayRef;
use crate::domain::queue::QueueName;
use crate::error::Result;
use rust_decimal_macros::dec;
use tracing::info;

/// The two orders the producer demo submits when no input file is given.
pub fn sample_orders() -> Vec<Order> {
    vec![
        Order::pending(
            "ORD-001",
            "CUST-123",
            vec!["laptop".to_string(), "mouse".to_string()],
            dec!(999.99),
        ),
        Order::pending(
            "ORD-002",
            "CUST-456",
            vec!["phone".to_string(), "case".to_string()],
            dec!(599.99),
        ),
    ]
}

/// Entry point for upstream systems submitting orders.
///
/// Publishing is attempted once. Retrying a failed publish is up to the
/// caller.
pub struct OrderProducer {
    gateway: GatewayRef,
}

impl OrderProducer {
    pub fn new(gateway: GatewayRef) -> Self {
        Self { gateway }
    }

    /// Validates an order and publishes it persistently to the order queue.
    pub async fn publish_order(&self, order: &Order) -> Result<()> {
        order.validate()?;
        let body = serde_json::to_vec(order)?;
        self.gateway.publish(QueueName::Order, body, true).await?;
        info!(order_id = %order.order_id, "Order published to queue");
        Ok(())
    }
}
