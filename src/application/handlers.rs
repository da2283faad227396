use crate::domain::envelope::{OutboundMessage, StageDecision};
use crate::domain::order::{Order, OrderStatus, PaymentRequest};
use crate::domain::ports::{PaymentGatewayRef, PaymentOutcome};
use crate::domain::queue::QueueName;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::info;

/// Business logic bound to one queue.
///
/// `process` turns a raw payload into the messages to forward. `handle`
/// wraps that into a decision: forward and ack on success, nack and requeue
/// on any error. Declined payments and non-pending orders are successes.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> &'static str;

    async fn process(&self, body: &[u8]) -> Result<Vec<OutboundMessage>>;

    async fn handle(&self, body: &[u8]) -> StageDecision {
        self.process(body).await.into()
    }
}

/// Validates orders and forwards pending ones to payment.
pub struct OrderStageHandler {
    validation_latency: Duration,
}

impl OrderStageHandler {
    pub fn new(validation_latency: Duration) -> Self {
        Self { validation_latency }
    }
}

#[async_trait]
impl StageHandler for OrderStageHandler {
    fn stage(&self) -> &'static str {
        "order"
    }

    async fn process(&self, body: &[u8]) -> Result<Vec<OutboundMessage>> {
        let order: Order = serde_json::from_slice(body)?;
        order
            .validate()
            .map_err(|e| PipelineError::MalformedMessage(e.to_string()))?;
        info!(order_id = %order.order_id, "Processing order");

        tokio::time::sleep(self.validation_latency).await;

        if order.status != OrderStatus::Pending {
            info!(order_id = %order.order_id, status = ?order.status, "Order is not pending, leaving pipeline");
            return Ok(Vec::new());
        }

        let payment = OutboundMessage::json(QueueName::Payment, &order.payment_request())?;
        info!(order_id = %order.order_id, "Order routed to payment processing");
        Ok(vec![payment])
    }
}

/// Charges the customer and routes to inventory or to the notification sink.
pub struct PaymentStageHandler {
    gateway: PaymentGatewayRef,
}

impl PaymentStageHandler {
    pub fn new(gateway: PaymentGatewayRef) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl StageHandler for PaymentStageHandler {
    fn stage(&self) -> &'static str {
        "payment"
    }

    async fn process(&self, body: &[u8]) -> Result<Vec<OutboundMessage>> {
        let request: PaymentRequest = serde_json::from_slice(body)?;
        if request.order_id.trim().is_empty() || request.amount < Decimal::ZERO {
            return Err(PipelineError::MalformedMessage(format!(
                "invalid payment request for order '{}'",
                request.order_id
            )));
        }
        info!(order_id = %request.order_id, amount = %request.amount, "Processing payment");

        let outbound = match self.gateway.authorize(&request).await? {
            PaymentOutcome::Approved => {
                info!(order_id = %request.order_id, "Payment successful");
                OutboundMessage::json(QueueName::Inventory, &request.inventory_request())?
            }
            PaymentOutcome::Declined { reason } => {
                info!(order_id = %request.order_id, %reason, "Payment failed");
                OutboundMessage::json(
                    QueueName::Notification,
                    &request.failure_notification(reason),
                )?
            }
        };
        Ok(vec![outbound])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::Verdict;
    use crate::domain::order::{FailureNotification, InventoryRequest, NotificationType};
    use crate::domain::ports::PaymentGateway;
    use crate::infrastructure::payment::FixedPaymentGateway;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn order_json(status: &str) -> Vec<u8> {
        format!(
            r#"{{"order_id":"ORD-001","customer_id":"CUST-123","items":["laptop","mouse"],
                "total":999.99,"status":"{status}","timestamp":"2025-01-01T10:00:00Z"}}"#
        )
        .into_bytes()
    }

    fn payment_json() -> Vec<u8> {
        br#"{"order_id":"ORD-001","amount":999.99,"customer_id":"CUST-123","timestamp":"2025-01-01T10:00:00Z"}"#
            .to_vec()
    }

    fn payment_handler(gateway: impl PaymentGateway + 'static) -> PaymentStageHandler {
        PaymentStageHandler::new(Arc::new(gateway))
    }

    #[tokio::test]
    async fn test_pending_order_routes_to_payment() {
        let handler = OrderStageHandler::new(Duration::ZERO);
        let decision = handler.handle(&order_json("pending")).await;

        assert!(decision.is_ack());
        assert_eq!(decision.outbound.len(), 1);
        assert_eq!(decision.outbound[0].queue, QueueName::Payment);

        let payment: PaymentRequest = serde_json::from_slice(&decision.outbound[0].body).unwrap();
        assert_eq!(payment.order_id, "ORD-001");
        assert_eq!(payment.amount, dec!(999.99));
        assert_eq!(payment.customer_id, "CUST-123");
    }

    #[tokio::test]
    async fn test_order_with_local_timestamp_routes_to_payment() {
        let handler = OrderStageHandler::new(Duration::ZERO);
        let body = br#"{"order_id":"ORD-001","customer_id":"CUST-123","items":["laptop","mouse"],
            "total":999.99,"status":"pending","timestamp":"2025-01-01T10:00:00.123456"}"#;
        let decision = handler.handle(body).await;

        assert!(decision.is_ack());
        assert_eq!(decision.outbound.len(), 1);
        let payment: PaymentRequest = serde_json::from_slice(&decision.outbound[0].body).unwrap();
        assert_eq!(payment.order_id, "ORD-001");
    }

    #[tokio::test]
    async fn test_non_pending_orders_are_acked_without_routing() {
        let handler = OrderStageHandler::new(Duration::ZERO);
        for status in ["paid", "failed"] {
            let decision = handler.handle(&order_json(status)).await;
            assert!(decision.is_ack());
            assert!(decision.outbound.is_empty());
        }
    }

    #[tokio::test]
    async fn test_malformed_order_is_requeued() {
        let handler = OrderStageHandler::new(Duration::ZERO);
        for body in [&b"not json"[..], &br#"{"order_id":"ORD-001"}"#[..]] {
            let decision = handler.handle(body).await;
            assert!(matches!(
                decision.verdict,
                Verdict::NackRequeue(PipelineError::MalformedMessage(_))
            ));
            assert!(decision.outbound.is_empty());
        }
    }

    #[tokio::test]
    async fn test_negative_total_is_malformed() {
        let handler = OrderStageHandler::new(Duration::ZERO);
        let body = br#"{"order_id":"ORD-9","customer_id":"C","items":[],"total":-5,
            "status":"pending","timestamp":"2025-01-01T10:00:00Z"}"#;
        let result = handler.process(body).await;
        assert!(matches!(result, Err(PipelineError::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn test_approved_payment_routes_to_inventory() {
        let handler = payment_handler(FixedPaymentGateway::approve_all());
        let decision = handler.handle(&payment_json()).await;

        assert!(decision.is_ack());
        assert_eq!(decision.outbound.len(), 1);
        assert_eq!(decision.outbound[0].queue, QueueName::Inventory);

        let inventory: InventoryRequest =
            serde_json::from_slice(&decision.outbound[0].body).unwrap();
        assert_eq!(inventory.order_id, "ORD-001");
        assert_eq!(inventory.status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn test_declined_payment_routes_to_notification() {
        let handler = payment_handler(FixedPaymentGateway::decline_all());
        let decision = handler.handle(&payment_json()).await;

        assert!(decision.is_ack());
        assert_eq!(decision.outbound.len(), 1);
        assert_eq!(decision.outbound[0].queue, QueueName::Notification);

        let notification: FailureNotification =
            serde_json::from_slice(&decision.outbound[0].body).unwrap();
        assert_eq!(notification.r#type, NotificationType::PaymentFailed);
        assert_eq!(notification.order_id, "ORD-001");
        assert_eq!(notification.customer_id, "CUST-123");
    }

    struct UnreachableGateway;

    #[async_trait]
    impl PaymentGateway for UnreachableGateway {
        async fn authorize(&self, _request: &PaymentRequest) -> Result<PaymentOutcome> {
            Err(PipelineError::PaymentGateway("processor timed out".to_string()))
        }
    }

    #[tokio::test]
    async fn test_gateway_error_is_requeued() {
        let handler = payment_handler(UnreachableGateway);
        let decision = handler.handle(&payment_json()).await;
        assert!(matches!(
            decision.verdict,
            Verdict::NackRequeue(PipelineError::PaymentGateway(_))
        ));
        assert!(decision.outbound.is_empty());
    }
}
