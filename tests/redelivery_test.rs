mod common;

use common::{declared_broker, order_json, wait_for};
use orderflow::application::router::{PipelineRouter, Settlement};
use orderflow::config::PipelineConfig;
use orderflow::domain::order::PaymentRequest;
use orderflow::domain::ports::QueueGateway;
use orderflow::domain::queue::QueueName;
use orderflow::infrastructure::in_memory::InMemoryBroker;
use orderflow::infrastructure::payment::FixedPaymentGateway;
use std::sync::Arc;

fn fulfillment(broker: &InMemoryBroker, max: Option<u32>) -> PipelineRouter {
    let config = PipelineConfig {
        max_deliveries: max,
        ..PipelineConfig::immediate(1.0)
    };
    PipelineRouter::fulfillment(
        Arc::new(broker.clone()),
        Arc::new(FixedPaymentGateway::approve_all()),
        &config,
    )
}

#[tokio::test]
async fn test_redelivered_order_yields_identical_payment_requests() {
    let broker = declared_broker().await;
    let router = fulfillment(&broker, None);
    let body = order_json("ORD-001", "pending", "999.99");

    // At-least-once delivery: the same order arrives twice.
    broker.publish(QueueName::Order, body.clone(), true).await.unwrap();
    broker.publish(QueueName::Order, body, true).await.unwrap();

    let mut orders = broker.subscribe(QueueName::Order, 1).await.unwrap();
    for _ in 0..2 {
        let delivery = orders.next_delivery().await.unwrap();
        assert_eq!(router.dispatch(&delivery).await.unwrap(), Settlement::Acked);
    }

    let payments = broker.drain(QueueName::Payment).await.unwrap();
    assert_eq!(payments.len(), 2);
    assert_eq!(payments[0], payments[1]);

    let payment: PaymentRequest = serde_json::from_slice(&payments[0]).unwrap();
    assert_eq!(payment.order_id, "ORD-001");
}

#[tokio::test]
async fn test_malformed_message_is_requeued_then_dead_lettered() {
    let broker = declared_broker().await;
    let running = fulfillment(&broker, Some(3)).start().await.unwrap();

    broker
        .publish(QueueName::Payment, b"{not json".to_vec(), true)
        .await
        .unwrap();
    wait_for(&broker, QueueName::DeadLetter, 1).await;

    // The consumer loop survived the poison message and still routes orders.
    broker
        .publish(
            QueueName::Order,
            order_json("ORD-002", "pending", "599.99"),
            true,
        )
        .await
        .unwrap();
    wait_for(&broker, QueueName::Inventory, 1).await;
    running.shutdown().await.unwrap();

    assert_eq!(
        broker.drain(QueueName::DeadLetter).await.unwrap(),
        vec![b"{not json".to_vec()]
    );
    assert_eq!(broker.outstanding(QueueName::Payment).await.unwrap(), 0);
}

#[tokio::test]
async fn test_malformed_message_is_never_acked() {
    let broker = declared_broker().await;
    let router = fulfillment(&broker, None);
    broker
        .publish(QueueName::Order, b"[]".to_vec(), true)
        .await
        .unwrap();

    let mut orders = broker.subscribe(QueueName::Order, 1).await.unwrap();
    let delivery = orders.next_delivery().await.unwrap();
    assert_eq!(
        router.dispatch(&delivery).await.unwrap(),
        Settlement::Requeued
    );

    let redelivery = orders.next_delivery().await.unwrap();
    assert!(redelivery.redelivered());
    assert_eq!(redelivery.body, b"[]");
}
