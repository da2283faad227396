use super::handlers::{OrderStageHandler, PaymentStageHandler, StageHandler};
use crate::config::PipelineConfig;
use crate::domain::envelope::{Delivery, StageDecision, Verdict};
use crate::domain::ports::{GatewayRef, PaymentGatewayRef, QueueGateway, SubscriptionBox};
use crate::domain::queue::QueueName;
use crate::error::{PipelineError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, Span, error, info, info_span, warn};

pub type HandlerRef = Arc<dyn StageHandler>;

/// Declares the six durable queues. Safe to call from every process that
/// connects.
pub async fn declare_topology(gateway: &dyn QueueGateway) -> Result<()> {
    for queue in QueueName::ALL {
        gateway.declare_queue(queue).await?;
    }
    info!("Queues declared");
    Ok(())
}

/// How a delivery was finally settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    DeadLettered,
}

/// Turns stage decisions into publishes followed by exactly one ack or nack.
#[derive(Clone)]
struct Dispatcher {
    gateway: GatewayRef,
    max_deliveries: Option<u32>,
}

impl Dispatcher {
    async fn dispatch(&self, handler: &HandlerRef, delivery: &Delivery) -> Result<Settlement> {
        self.settle(handler, delivery)
            .instrument(Self::span(delivery))
            .await
    }

    fn span(delivery: &Delivery) -> Span {
        info_span!(
            "delivery",
            queue = %delivery.queue,
            tag = delivery.tag(),
            attempt = delivery.delivery_count,
            redelivered = delivery.redelivered()
        )
    }

    async fn settle(&self, handler: &HandlerRef, delivery: &Delivery) -> Result<Settlement> {
        let decision = Self::decide(Arc::clone(handler), delivery.body.clone()).await;

        match decision.verdict {
            Verdict::Ack => {
                for message in decision.outbound {
                    let queue = message.queue;
                    if let Err(e) = self.gateway.publish(queue, message.body, true).await {
                        error!(%queue, error = %e, "Forwarding failed, returning message to queue");
                        self.gateway.nack(delivery, true).await?;
                        return Ok(Settlement::Requeued);
                    }
                }
                self.gateway.ack(delivery).await?;
                Ok(Settlement::Acked)
            }
            Verdict::NackRequeue(e) => {
                let exhausted = self
                    .max_deliveries
                    .is_some_and(|max| delivery.delivery_count >= max);
                if e.is_malformed() && exhausted {
                    warn!(error = %e, "Redelivery budget spent, dead-lettering message");
                    self.gateway.nack(delivery, false).await?;
                    Ok(Settlement::DeadLettered)
                } else {
                    warn!(error = %e, "Processing failed, requeueing message");
                    self.gateway.nack(delivery, true).await?;
                    Ok(Settlement::Requeued)
                }
            }
        }
    }

    /// Runs the handler on its own task so a panic becomes a requeue instead
    /// of taking the consumer loop down.
    async fn decide(handler: HandlerRef, body: Vec<u8>) -> StageDecision {
        let task = tokio::spawn(async move { handler.handle(&body).await }.in_current_span());
        match task.await {
            Ok(decision) => decision,
            Err(e) => StageDecision::retry(PipelineError::HandlerCrashed(e.to_string())),
        }
    }
}

/// Owns the queue topology and the routing table from queues to stages.
pub struct PipelineRouter {
    gateway: GatewayRef,
    routes: BTreeMap<QueueName, HandlerRef>,
    prefetch: u16,
    dispatcher: Dispatcher,
}

impl PipelineRouter {
    /// Creates a router with an empty routing table.
    pub fn new(gateway: GatewayRef, prefetch: u16, max_deliveries: Option<u32>) -> Self {
        Self {
            dispatcher: Dispatcher {
                gateway: Arc::clone(&gateway),
                max_deliveries,
            },
            gateway,
            routes: BTreeMap::new(),
            prefetch,
        }
    }

    /// The fulfillment routing table: orders and payments are handled here,
    /// every other queue is a sink for downstream services.
    pub fn fulfillment(
        gateway: GatewayRef,
        payments: PaymentGatewayRef,
        config: &PipelineConfig,
    ) -> Self {
        Self::new(gateway, config.prefetch, config.max_deliveries)
            .bind(
                QueueName::Order,
                Arc::new(OrderStageHandler::new(config.validation_latency)),
            )
            .bind(QueueName::Payment, Arc::new(PaymentStageHandler::new(payments)))
    }

    pub fn bind(mut self, queue: QueueName, handler: HandlerRef) -> Self {
        self.routes.insert(queue, handler);
        self
    }

    pub fn bound_queues(&self) -> Vec<QueueName> {
        self.routes.keys().copied().collect()
    }

    /// Declares every queue of the topology, bound or not.
    pub async fn declare_topology(&self) -> Result<()> {
        declare_topology(self.gateway.as_ref()).await
    }

    /// Processes one delivery with the handler bound to its queue.
    pub async fn dispatch(&self, delivery: &Delivery) -> Result<Settlement> {
        let handler = self
            .routes
            .get(&delivery.queue)
            .ok_or_else(|| PipelineError::UnknownQueue(delivery.queue.to_string()))?;
        self.dispatcher.dispatch(handler, delivery).await
    }

    /// Declares the topology and starts one consumer loop per bound queue.
    pub async fn start(self) -> Result<RunningPipeline> {
        self.declare_topology().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        for (queue, handler) in &self.routes {
            let subscription = self.gateway.subscribe(*queue, self.prefetch).await?;
            tasks.spawn(consume(
                self.dispatcher.clone(),
                *queue,
                Arc::clone(handler),
                subscription,
                shutdown_rx.clone(),
            ));
        }
        info!(consumers = tasks.len(), queues = ?self.bound_queues(), "Pipeline started");

        Ok(RunningPipeline {
            gateway: self.gateway,
            shutdown_tx,
            tasks,
        })
    }
}

async fn consume(
    dispatcher: Dispatcher,
    queue: QueueName,
    handler: HandlerRef,
    mut subscription: SubscriptionBox,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(%queue, stage = handler.stage(), "Consumer started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let delivery = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            delivery = subscription.next_delivery() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        // In-flight work always runs to its ack or nack, even during shutdown.
        if let Err(e) = dispatcher.dispatch(&handler, &delivery).await {
            error!(%queue, tag = delivery.tag(), error = %e, "Failed to settle delivery");
        }
    }
    info!(%queue, "Consumer stopped");
}

/// A started pipeline. Dropping it aborts the consumers without releasing the
/// connection; call [`RunningPipeline::shutdown`] to stop them cleanly.
pub struct RunningPipeline {
    gateway: GatewayRef,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl RunningPipeline {
    /// Stops taking deliveries, waits for in-flight ones to settle, then
    /// closes the gateway.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Stopping consumers");
        let _ = self.shutdown_tx.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Consumer task ended abnormally");
            }
        }
        self.gateway.close().await
    }
}
