use super::spool::{Spool, SpoolRecord};
use crate::domain::envelope::{AckState, Delivery, DeliveryHandle};
use crate::domain::ports::{QueueGateway, Subscription, SubscriptionBox};
use crate::domain::queue::QueueName;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, info, warn};

/// How often an idle subscription looks for messages spooled by other
/// processes.
const SPOOL_POLL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct StoredMessage {
    body: Vec<u8>,
    delivery_count: u32,
    spool_id: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    /// Spool records already loaded by this process.
    spooled: HashSet<String>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<QueueName, QueueState>,
    closed: bool,
}

/// What has to happen to a spool record once its message is settled.
enum SpoolChange {
    Keep,
    Remove(String),
    DeadLetter(String, Vec<u8>),
}

struct Shared {
    state: Mutex<BrokerState>,
    signals: [Notify; QueueName::ALL.len()],
    next_tag: AtomicU64,
    spool: Option<Spool>,
}

impl Shared {
    fn signal(&self, queue: QueueName) -> &Notify {
        &self.signals[queue as usize]
    }

    /// Loads spool records of `queue` this process has not seen yet and
    /// returns how many messages became ready.
    async fn refresh(&self, queue: QueueName) -> Result<usize> {
        let Some(spool) = &self.spool else {
            return Ok(0);
        };
        let known = match self.state.lock().await.queues.get(&queue) {
            Some(q) => q.spooled.clone(),
            None => return Ok(0),
        };
        let found = spool.scan(queue, &known).await?;
        if found.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(0);
        }
        let Some(q) = state.queues.get_mut(&queue) else {
            return Ok(0);
        };
        let mut restored = 0;
        for (id, record) in found {
            if !q.spooled.insert(id.clone()) {
                continue;
            }
            if let Some(record) = record {
                q.ready.push_back(StoredMessage {
                    body: record.body,
                    delivery_count: record.delivery_count,
                    spool_id: Some(id),
                });
                restored += 1;
            }
        }
        Ok(restored)
    }

    async fn apply(&self, queue: QueueName, change: SpoolChange) -> Result<()> {
        let Some(spool) = &self.spool else {
            return Ok(());
        };
        match change {
            SpoolChange::Keep => Ok(()),
            SpoolChange::Remove(id) => spool.remove(queue, &id).await,
            SpoolChange::DeadLetter(id, body) => {
                let record = SpoolRecord {
                    body,
                    delivery_count: 0,
                };
                spool.write(QueueName::DeadLetter, &id, &record).await?;
                spool.remove(queue, &id).await
            }
        }
    }
}

/// An in-process broker with durable queues, prefetch limits and
/// acknowledgment tracking.
///
/// When opened with a spool directory, every persistent message is kept on
/// disk from publish until it is acked, so it outlives the process. Brokers
/// in different processes sharing a spool see each other's messages.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Opens a broker without a spool; nothing survives the process.
    pub fn new() -> Self {
        Self::with_spool(None)
    }

    fn with_spool(spool: Option<Spool>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                signals: std::array::from_fn(|_| Notify::new()),
                next_tag: AtomicU64::new(1),
                spool,
            }),
        }
    }

    /// Opens a broker, creating the spool directory if one is given.
    pub async fn connect(spool: Option<PathBuf>) -> Result<Self> {
        let spool = match spool {
            Some(dir) => {
                let spool = Spool::open(dir.clone()).await?;
                info!(spool = %dir.display(), "Broker connected with durable spool");
                Some(spool)
            }
            None => {
                info!("Broker connected without spool");
                None
            }
        };
        Ok(Self::with_spool(spool))
    }

    /// Ready plus unacknowledged messages in a queue.
    pub async fn outstanding(&self, queue: QueueName) -> Result<usize> {
        let state = self.shared.state.lock().await;
        let q = state
            .queues
            .get(&queue)
            .ok_or_else(|| PipelineError::UnknownQueue(queue.to_string()))?;
        Ok(q.ready.len() + q.unacked.len())
    }

    /// Removes and returns every ready message in a queue. Drained messages
    /// count as consumed and leave the spool.
    pub async fn drain(&self, queue: QueueName) -> Result<Vec<Vec<u8>>> {
        let drained: Vec<StoredMessage> = {
            let mut state = self.shared.state.lock().await;
            let q = state
                .queues
                .get_mut(&queue)
                .ok_or_else(|| PipelineError::UnknownQueue(queue.to_string()))?;
            q.ready.drain(..).collect()
        };
        let mut bodies = Vec::with_capacity(drained.len());
        for message in drained {
            if let Some(id) = message.spool_id {
                self.shared.apply(queue, SpoolChange::Remove(id)).await?;
            }
            bodies.push(message.body);
        }
        Ok(bodies)
    }

    #[cfg(test)]
    pub(crate) async fn is_closed(&self) -> bool {
        self.shared.state.lock().await.closed
    }

    fn closed_error() -> PipelineError {
        PipelineError::Transport("connection closed".to_string())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueGateway for InMemoryBroker {
    async fn declare_queue(&self, queue: QueueName) -> Result<()> {
        if self.shared.state.lock().await.queues.contains_key(&queue) {
            return Ok(());
        }
        if let Some(spool) = &self.shared.spool {
            spool.prepare(queue).await?;
        }
        {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Err(Self::closed_error());
            }
            if state.queues.contains_key(&queue) {
                return Ok(());
            }
            state.queues.insert(queue, QueueState::default());
        }

        let restored = self.shared.refresh(queue).await?;
        if restored > 0 {
            info!(%queue, count = restored, "Restored persistent messages");
        }
        debug!(%queue, "Queue declared");
        Ok(())
    }

    async fn publish(&self, queue: QueueName, payload: Vec<u8>, persistent: bool) -> Result<()> {
        {
            let state = self.shared.state.lock().await;
            if state.closed {
                return Err(Self::closed_error());
            }
            if !state.queues.contains_key(&queue) {
                return Err(PipelineError::UnknownQueue(queue.to_string()));
            }
        }

        // Persistent messages reach the disk before the publish is confirmed.
        let spool_id = match &self.shared.spool {
            Some(spool) if persistent => {
                let id = spool.next_id();
                let record = SpoolRecord {
                    body: payload.clone(),
                    delivery_count: 0,
                };
                spool.write(queue, &id, &record).await?;
                Some(id)
            }
            _ => None,
        };

        let accepted = {
            let mut state = self.shared.state.lock().await;
            let closed = state.closed;
            match state.queues.get_mut(&queue) {
                Some(q) if !closed => {
                    // A concurrent refresh may already have loaded the record.
                    let fresh = spool_id.as_ref().is_none_or(|id| q.spooled.insert(id.clone()));
                    if fresh {
                        q.ready.push_back(StoredMessage {
                            body: payload,
                            delivery_count: 0,
                            spool_id: spool_id.clone(),
                        });
                    }
                    true
                }
                _ => false,
            }
        };
        if !accepted {
            if let Some(id) = spool_id {
                self.shared.apply(queue, SpoolChange::Remove(id)).await?;
            }
            return Err(Self::closed_error());
        }

        self.shared.signal(queue).notify_one();
        debug!(%queue, persistent, "Message published");
        Ok(())
    }

    async fn subscribe(&self, queue: QueueName, prefetch: u16) -> Result<SubscriptionBox> {
        let state = self.shared.state.lock().await;
        if state.closed {
            return Err(Self::closed_error());
        }
        if !state.queues.contains_key(&queue) {
            return Err(PipelineError::UnknownQueue(queue.to_string()));
        }
        // A prefetch of zero means "unlimited", as in AMQP.
        let slots = match prefetch {
            0 => Semaphore::MAX_PERMITS,
            n => usize::from(n),
        };
        Ok(Box::new(InMemorySubscription {
            shared: Arc::clone(&self.shared),
            queue,
            slots: Arc::new(Semaphore::new(slots)),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let (permit, change) = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Err(Self::closed_error());
            }
            let permit = delivery.handle.settle(AckState::Acked).await?;
            let change = state
                .queues
                .get_mut(&delivery.queue)
                .and_then(|q| q.unacked.remove(&delivery.tag()))
                .and_then(|message| message.spool_id)
                .map_or(SpoolChange::Keep, SpoolChange::Remove);
            (permit, change)
        };
        drop(permit);
        self.shared.apply(delivery.queue, change).await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let outcome = if requeue {
            AckState::NackedRequeued
        } else {
            AckState::NackedDiscarded
        };
        let (permit, signal, change) = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Err(Self::closed_error());
            }
            let permit = delivery.handle.settle(outcome).await?;
            let message = state
                .queues
                .get_mut(&delivery.queue)
                .and_then(|q| q.unacked.remove(&delivery.tag()));

            let (signal, change) = match message {
                Some(message) if requeue => {
                    if let Some(q) = state.queues.get_mut(&delivery.queue) {
                        q.ready.push_front(message);
                    }
                    (Some(delivery.queue), SpoolChange::Keep)
                }
                Some(mut message) if delivery.queue != QueueName::DeadLetter => {
                    match state.queues.get_mut(&QueueName::DeadLetter) {
                        Some(dead_letters) => {
                            let change = match &message.spool_id {
                                Some(id) => {
                                    dead_letters.spooled.insert(id.clone());
                                    SpoolChange::DeadLetter(id.clone(), message.body.clone())
                                }
                                None => SpoolChange::Keep,
                            };
                            message.delivery_count = 0;
                            dead_letters.ready.push_back(message);
                            warn!(queue = %delivery.queue, tag = delivery.tag(), "Message dead-lettered");
                            (Some(QueueName::DeadLetter), change)
                        }
                        None => {
                            warn!(queue = %delivery.queue, tag = delivery.tag(), "Message discarded, no dead-letter queue declared");
                            (None, message.spool_id.map_or(SpoolChange::Keep, SpoolChange::Remove))
                        }
                    }
                }
                Some(message) => {
                    warn!(tag = delivery.tag(), "Dead-lettered message discarded");
                    (None, message.spool_id.map_or(SpoolChange::Keep, SpoolChange::Remove))
                }
                None => (None, SpoolChange::Keep),
            };
            (permit, signal, change)
        };
        if let Some(queue) = signal {
            self.shared.signal(queue).notify_one();
        }
        drop(permit);
        self.shared.apply(delivery.queue, change).await
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;

            for q in state.queues.values_mut() {
                let mut returned: Vec<(u64, StoredMessage)> = q.unacked.drain().collect();
                returned.sort_by_key(|(tag, _)| *tag);
                for (_, message) in returned.into_iter().rev() {
                    q.ready.push_front(message);
                }
            }
        }

        for signal in &self.shared.signals {
            signal.notify_waiters();
        }
        info!("Broker connection closed");
        Ok(())
    }
}

struct InMemorySubscription {
    shared: Arc<Shared>,
    queue: QueueName,
    slots: Arc<Semaphore>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        let permit = Arc::clone(&self.slots).acquire_owned().await.ok()?;
        let signal = self.shared.signal(self.queue);
        loop {
            let notified = signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock().await;
                if state.closed {
                    return None;
                }
                let q = state.queues.get_mut(&self.queue)?;
                if let Some(mut message) = q.ready.pop_front() {
                    message.delivery_count += 1;
                    let tag = self.shared.next_tag.fetch_add(1, Ordering::Relaxed);
                    let delivery = Delivery {
                        queue: self.queue,
                        body: message.body.clone(),
                        delivery_count: message.delivery_count,
                        handle: DeliveryHandle::new(tag, Some(permit)),
                    };
                    q.unacked.insert(tag, message);
                    return Some(delivery);
                }
            }

            if self.shared.spool.is_none() {
                notified.await;
                continue;
            }
            // Other processes only announce themselves through the spool.
            match self.shared.refresh(self.queue).await {
                Ok(0) => {
                    let _ = tokio::time::timeout(SPOOL_POLL, notified).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "Failed to read spool");
                    let _ = tokio::time::timeout(SPOOL_POLL, notified).await;
                }
            }
        }
    }
}
