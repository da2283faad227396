use std::fmt;

/// The durable queues making up the fulfillment topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueName {
    Order,
    Payment,
    Inventory,
    Shipping,
    Notification,
    DeadLetter,
}

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        QueueName::Order,
        QueueName::Payment,
        QueueName::Inventory,
        QueueName::Shipping,
        QueueName::Notification,
        QueueName::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Order => "order_queue",
            QueueName::Payment => "payment_queue",
            QueueName::Inventory => "inventory_queue",
            QueueName::Shipping => "shipping_queue",
            QueueName::Notification => "notification_queue",
            QueueName::DeadLetter => "dead_letter_queue",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
