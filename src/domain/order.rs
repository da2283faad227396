use crate::error::PipelineError;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// Reads RFC 3339 timestamps, and ISO-8601 local times without an offset as
/// UTC (`2025-01-01T10:00:00.123456`).
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>()
        .map(|naive| naive.and_utc())
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp {raw:?}: {e}")))
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
}

/// A customer order as submitted by an upstream system.
///
/// Orders are immutable once published; every later stage works on a message
/// derived from it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Order {
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
    pub status: OrderStatus,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl Order {
    /// Creates a pending order stamped with the current time.
    pub fn pending(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        items: Vec<String>,
        total: Decimal,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            items,
            total,
            status: OrderStatus::Pending,
            timestamp: Utc::now(),
        }
    }

    /// Checks the invariants every published order must hold.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.order_id.trim().is_empty() {
            return Err(PipelineError::Validation(
                "order_id must not be empty".to_string(),
            ));
        }
        if self.total < Decimal::ZERO {
            return Err(PipelineError::Validation(format!(
                "order {} has a negative total",
                self.order_id
            )));
        }
        Ok(())
    }

    pub fn payment_request(&self) -> PaymentRequest {
        PaymentRequest {
            order_id: self.order_id.clone(),
            amount: self.total,
            customer_id: self.customer_id.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PaymentRequest {
    pub order_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub customer_id: String,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl PaymentRequest {
    pub fn inventory_request(&self) -> InventoryRequest {
        InventoryRequest {
            order_id: self.order_id.clone(),
            customer_id: self.customer_id.clone(),
            status: OrderStatus::Paid,
            timestamp: self.timestamp,
        }
    }

    pub fn failure_notification(&self, message: impl Into<String>) -> FailureNotification {
        FailureNotification {
            r#type: NotificationType::PaymentFailed,
            order_id: self.order_id.clone(),
            customer_id: self.customer_id.clone(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct InventoryRequest {
    pub order_id: String,
    pub customer_id: String,
    pub status: OrderStatus,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    PaymentFailed,
}

/// Terminal message for the notification service.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct FailureNotification {
    pub r#type: NotificationType,
    pub order_id: String,
    pub customer_id: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_deserializes_numeric_total() {
        let json = r#"{
            "order_id": "ORD-001",
            "customer_id": "CUST-123",
            "items": ["laptop", "mouse"],
            "total": 999.99,
            "status": "pending",
            "timestamp": "2025-01-01T10:00:00Z"
        }"#;

        let order: Order = serde_json::from_str(json).unwrap();
        assert_eq!(order.total, dec!(999.99));
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.items, vec!["laptop", "mouse"]);
    }

    #[test]
    fn test_order_accepts_timestamp_without_offset() {
        let json = r#"{
            "order_id": "ORD-001",
            "customer_id": "CUST-123",
            "items": ["laptop", "mouse"],
            "total": 999.99,
            "status": "pending",
            "timestamp": "2025-01-01T10:00:00.123456"
        }"#;

        let order: Order = serde_json::from_str(json).unwrap();
        let expected: DateTime<Utc> = "2025-01-01T10:00:00.123456Z".parse().unwrap();
        assert_eq!(order.timestamp, expected);

        // Derived messages are written back out as RFC 3339.
        let payment = serde_json::to_value(order.payment_request()).unwrap();
        assert_eq!(payment["timestamp"], "2025-01-01T10:00:00.123456Z");
    }

    #[test]
    fn test_offset_timestamp_is_normalized_to_utc() {
        let json = r#"{"order_id":"ORD-1","amount":5.0,"customer_id":"C","timestamp":"2025-01-01T12:00:00+02:00"}"#;
        let payment: PaymentRequest = serde_json::from_str(json).unwrap();
        let expected: DateTime<Utc> = "2025-01-01T10:00:00Z".parse().unwrap();
        assert_eq!(payment.timestamp, expected);
    }

    #[test]
    fn test_garbage_timestamp_is_rejected() {
        let json = r#"{"order_id":"ORD-1","amount":5.0,"customer_id":"C","timestamp":"yesterday"}"#;
        assert!(serde_json::from_str::<PaymentRequest>(json).is_err());
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let json = r#"{
            "order_id": "ORD-001",
            "customer_id": "CUST-123",
            "items": [],
            "total": 1.0,
            "status": "shipped",
            "timestamp": "2025-01-01T10:00:00Z"
        }"#;

        assert!(serde_json::from_str::<Order>(json).is_err());
    }

    #[test]
    fn test_order_validation() {
        let order = Order::pending("ORD-1", "CUST-1", vec![], dec!(0));
        assert!(order.validate().is_ok());

        let blank = Order::pending("  ", "CUST-1", vec![], dec!(1));
        assert!(matches!(
            blank.validate(),
            Err(PipelineError::Validation(_))
        ));

        let negative = Order::pending("ORD-2", "CUST-1", vec![], dec!(-0.01));
        assert!(matches!(
            negative.validate(),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_derived_messages_preserve_identity() {
        let order = Order::pending("ORD-7", "CUST-9", vec!["phone".into()], dec!(599.99));
        let payment = order.payment_request();
        assert_eq!(payment.order_id, "ORD-7");
        assert_eq!(payment.amount, dec!(599.99));
        assert_eq!(payment.timestamp, order.timestamp);

        let inventory = payment.inventory_request();
        assert_eq!(inventory.status, OrderStatus::Paid);
        assert_eq!(inventory.customer_id, "CUST-9");
    }

    #[test]
    fn test_failure_notification_wire_format() {
        let order = Order::pending("ORD-1", "CUST-1", vec![], dec!(10));
        let notification = order.payment_request().failure_notification("declined");
        let value = serde_json::to_value(&notification).unwrap();

        assert_eq!(value["type"], "payment_failed");
        assert_eq!(value["order_id"], "ORD-1");
        assert_eq!(value["message"], "declined");
    }
}
