#![allow(dead_code)]

use orderflow::domain::ports::QueueGateway;
use orderflow::domain::queue::QueueName;
use orderflow::infrastructure::in_memory::InMemoryBroker;
use std::time::Duration;

pub fn order_json(order_id: &str, status: &str, total: &str) -> Vec<u8> {
    format!(
        r#"{{"order_id":"{order_id}","customer_id":"CUST-123","items":["laptop","mouse"],"total":{total},"status":"{status}","timestamp":"2025-01-01T10:00:00Z"}}"#
    )
    .into_bytes()
}

pub async fn declared_broker() -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    for queue in QueueName::ALL {
        broker.declare_queue(queue).await.unwrap();
    }
    broker
}

/// Polls until `queue` holds at least `count` messages or five seconds pass.
pub async fn wait_for(broker: &InMemoryBroker, queue: QueueName, count: usize) {
    for _ in 0..500 {
        if broker.outstanding(queue).await.unwrap() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {count} messages on {queue}");
}

/// Polls until the order and payment queues are empty.
pub async fn wait_until_drained(broker: &InMemoryBroker) {
    for _ in 0..500 {
        let pending = broker.outstanding(QueueName::Order).await.unwrap()
            + broker.outstanding(QueueName::Payment).await.unwrap();
        if pending == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for the pipeline to drain");
}
