//! # Event Bus
//!
//! Priority- and schedule-aware delivery of messages to per-topic handlers.
//!
//! ## Delivery Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              EventBus                                   │
//! │                                                                         │
//! │  publish() ──┬── scheduled_at in future ──► scheduled heap (by due)    │
//! │              │                                   │                      │
//! │              │                    scheduler tick │ matured              │
//! │              ▼                                   ▼                      │
//! │   ┌──────────┬──────┬────────┬─────┬────────────┐                       │
//! │   │ CRITICAL │ HIGH │ NORMAL │ LOW │ BACKGROUND │  FIFO per tier        │
//! │   └──────────┴──────┴────────┴─────┴────────────┘                       │
//! │              │ strict priority                                          │
//! │              ▼                                                          │
//! │      direct handlers? ──yes──► handle() ──► Completed                   │
//! │              │                    │ error                               │
//! │              no                   ▼                                     │
//! │              │             retry_count < max ──► heap after             │
//! │              ▼                    │             retry_delay * 2^(n-1)   │
//! │      batch buffer per topic       └──► Failed + dead letter             │
//! │      (size or wait) ──► handle_batch() under max_concurrent_batches     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is at-least-once; handlers must be idempotent.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use keystone_core::{MessageStatus, Priority};

use crate::config::BusSettings;
use crate::dead_letter::{DeadLetter, DeadLetterOrigin, DeadLetterQueue};
use crate::error::{ErrorKind, SyncError, SyncResult};

// =============================================================================
// Messages
// =============================================================================

/// A message travelling through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Value,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// Next delivery time for delayed or retried messages.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Bus counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub retried: u64,
    pub failed: u64,
    pub expired: u64,
    pub cancelled: u64,
    pub batches: u64,
}

/// Snapshot returned by [`EventBus::queue_status`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Queued messages per priority tier.
    pub queues: BTreeMap<String, usize>,
    pub scheduled: usize,
    pub batch_buffered: usize,
    pub active_batches: usize,
    pub running: bool,
    pub stats: BusStats,
    pub config: BusSettings,
}

// =============================================================================
// Handlers
// =============================================================================

/// Handles one message at a time.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> SyncResult<()>;
}

/// Handles a set of messages of one topic at once.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, messages: &[Message]) -> SyncResult<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<()>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> SyncResult<()> {
        (self.0)(message.clone()).await
    }
}

/// Wraps an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct BatchFnHandler<F>(F);

#[async_trait]
impl<F, Fut> BatchHandler for BatchFnHandler<F>
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<()>> + Send + 'static,
{
    async fn handle_batch(&self, messages: &[Message]) -> SyncResult<()> {
        (self.0)(messages.to_vec()).await
    }
}

/// Wraps an async closure as a [`BatchHandler`].
pub fn batch_handler_fn<F, Fut>(f: F) -> Arc<dyn BatchHandler>
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<()>> + Send + 'static,
{
    Arc::new(BatchFnHandler(f))
}

// =============================================================================
// State
// =============================================================================

struct Tracked {
    message: Message,
    created: Instant,
    finished: Option<Instant>,
}

struct BatchBuffer {
    messages: Vec<Message>,
    opened: Instant,
}

#[derive(Default)]
struct BusState {
    tiers: [VecDeque<String>; 5],
    scheduled: BinaryHeap<Reverse<(Instant, u64, String)>>,
    messages: HashMap<String, Tracked>,
    batches: HashMap<String, BatchBuffer>,
    seq: u64,
    stats: BusStats,
}

impl BusState {
    fn queued(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum::<usize>() + self.scheduled.len()
    }

    fn schedule(&mut self, id: String, due: Instant) {
        self.seq += 1;
        self.scheduled.push(Reverse((due, self.seq, id)));
    }
}

/// Finished messages stay queryable this long when message TTL is off.
const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

// =============================================================================
// Event Bus
// =============================================================================

/// Priority event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    settings: BusSettings,
    state: Mutex<BusState>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    batch_handlers: RwLock<HashMap<String, Arc<dyn BatchHandler>>>,
    dead_letters: DeadLetterQueue,
    wakeup: Notify,
    batch_slots: Arc<Semaphore>,
    batches_in_flight: AtomicUsize,
    shutting_down: AtomicBool,
    workers: Mutex<Option<(watch::Sender<bool>, Vec<JoinHandle<()>>)>>,
}

impl EventBus {
    pub fn new(settings: BusSettings, dead_letters: DeadLetterQueue) -> Self {
        let slots = settings.max_concurrent_batches.max(1);
        EventBus {
            inner: Arc::new(BusInner {
                settings,
                state: Mutex::new(BusState::default()),
                handlers: RwLock::new(HashMap::new()),
                batch_handlers: RwLock::new(HashMap::new()),
                dead_letters,
                wakeup: Notify::new(),
                batch_slots: Arc::new(Semaphore::new(slots)),
                batches_in_flight: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
                workers: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &BusSettings {
        &self.inner.settings
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Queues a message and returns its id.
    ///
    /// A `scheduled_at` in the future defers delivery until then.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Value,
        priority: Priority,
        scheduled_at: Option<DateTime<Utc>>,
        metadata: Option<Map<String, Value>>,
    ) -> SyncResult<String> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }

        let now = Utc::now();
        let delay = scheduled_at.and_then(|at| (at - now).to_std().ok());
        let message = Message {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            priority,
            created_at: now,
            scheduled_at: delay.and(scheduled_at),
            status: MessageStatus::Pending,
            retry_count: 0,
            max_retries: self.inner.settings.max_retries,
            last_error: None,
            metadata: metadata.unwrap_or_default(),
        };
        let id = message.id.clone();

        let depth = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            match delay {
                Some(delay) if !delay.is_zero() => {
                    state.schedule(id.clone(), Instant::now() + delay);
                }
                _ => state.tiers[priority.index()].push_back(id.clone()),
            }
            state.messages.insert(
                id.clone(),
                Tracked {
                    message,
                    created: Instant::now(),
                    finished: None,
                },
            );
            state.stats.published += 1;
            state.queued()
        };

        if depth > self.inner.settings.backpressure_threshold {
            warn!(
                depth,
                threshold = self.inner.settings.backpressure_threshold,
                "Event bus backpressure: queue depth above threshold"
            );
        }

        debug!(message_id = %id, topic = %topic, priority = %priority, "Message published");
        self.inner.wakeup.notify_one();
        Ok(id)
    }

    /// Publishes several payloads on one topic at one priority.
    pub async fn publish_batch(
        &self,
        topic: &str,
        payloads: Vec<Value>,
        priority: Priority,
    ) -> SyncResult<Vec<String>> {
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            ids.push(self.publish(topic, payload, priority, None, None).await?);
        }
        Ok(ids)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    pub async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) {
        self.inner
            .handlers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        info!(topic = %topic, "Handler subscribed");
    }

    /// Registers the batch handler of `topic`, replacing any previous one.
    pub async fn subscribe_batch(&self, topic: &str, handler: Arc<dyn BatchHandler>) {
        self.inner
            .batch_handlers
            .write()
            .await
            .insert(topic.to_string(), handler);
        info!(topic = %topic, "Batch handler subscribed");
    }

    // =========================================================================
    // Admin
    // =========================================================================

    /// Cancels a queued or scheduled message. Already running or finished
    /// messages are left alone.
    pub async fn cancel(&self, message_id: &str) -> bool {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let Some(tracked) = state.messages.get_mut(message_id) else {
            return false;
        };
        if !matches!(
            tracked.message.status,
            MessageStatus::Pending | MessageStatus::Retry
        ) {
            return false;
        }

        tracked.message.status = MessageStatus::Cancelled;
        tracked.finished = Some(Instant::now());
        for tier in state.tiers.iter_mut() {
            tier.retain(|id| id != message_id);
        }
        state.scheduled.retain(|Reverse((_, _, id))| id != message_id);
        state.stats.cancelled += 1;

        info!(message_id = %message_id, "Message cancelled");
        true
    }

    /// Cancels every queued, scheduled or buffered message, optionally only
    /// those of `topic`. Returns how many were cancelled.
    pub async fn clear(&self, topic: Option<&str>) -> usize {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();

        let matches_topic = |message: &Message| topic.map_or(true, |t| message.topic == t);

        let mut cleared = Vec::new();
        for tracked in state.messages.values_mut() {
            let queued = matches!(
                tracked.message.status,
                MessageStatus::Pending | MessageStatus::Retry
            );
            if queued && matches_topic(&tracked.message) {
                tracked.message.status = MessageStatus::Cancelled;
                tracked.finished = Some(now);
                cleared.push(tracked.message.id.clone());
            }
        }

        let buffered: Vec<String> = state
            .batches
            .keys()
            .filter(|t| topic.map_or(true, |wanted| wanted == t.as_str()))
            .cloned()
            .collect();
        for buffer_topic in buffered {
            if let Some(buffer) = state.batches.remove(&buffer_topic) {
                for message in buffer.messages {
                    if let Some(tracked) = state.messages.get_mut(&message.id) {
                        tracked.message.status = MessageStatus::Cancelled;
                        tracked.finished = Some(now);
                    }
                    cleared.push(message.id);
                }
            }
        }

        for tier in state.tiers.iter_mut() {
            tier.retain(|id| !cleared.contains(id));
        }
        state
            .scheduled
            .retain(|Reverse((_, _, id))| !cleared.contains(id));
        state.stats.cancelled += cleared.len() as u64;

        info!(topic = ?topic, cleared = cleared.len(), "Queues cleared");
        cleared.len()
    }

    pub async fn message(&self, message_id: &str) -> Option<Message> {
        self.inner
            .state
            .lock()
            .await
            .messages
            .get(message_id)
            .map(|t| t.message.clone())
    }

    pub async fn message_status(&self, message_id: &str) -> Option<MessageStatus> {
        self.inner
            .state
            .lock()
            .await
            .messages
            .get(message_id)
            .map(|t| t.message.status)
    }

    /// Bus messages that ran out of retries.
    pub async fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        Ok(self
            .inner
            .dead_letters
            .list(usize::MAX)
            .await?
            .into_iter()
            .filter(|entry| entry.origin == DeadLetterOrigin::Bus)
            .collect())
    }

    pub async fn queue_status(&self) -> QueueStatus {
        let state = self.inner.state.lock().await;
        let queues = Priority::ALL
            .iter()
            .map(|p| (p.to_string(), state.tiers[p.index()].len()))
            .collect();

        QueueStatus {
            queues,
            scheduled: state.scheduled.len(),
            batch_buffered: state.batches.values().map(|b| b.messages.len()).sum(),
            active_batches: self.inner.settings.max_concurrent_batches.max(1)
                - self.inner.batch_slots.available_permits(),
            running: self.inner.workers.try_lock().map_or(true, |w| w.is_some()),
            stats: state.stats.clone(),
            config: self.inner.settings.clone(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the delivery and scheduler loops. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut workers = self.inner.workers.lock().await;
        if workers.is_some() {
            return;
        }
        self.inner.shutting_down.store(false, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let delivery = tokio::spawn(self.clone().run_delivery(shutdown_rx.clone()));
        let scheduler = tokio::spawn(self.clone().run_scheduler(shutdown_rx));
        *workers = Some((shutdown_tx, vec![delivery, scheduler]));

        info!(
            max_retries = self.inner.settings.max_retries,
            max_batch_size = self.inner.settings.max_batch_size,
            "Event bus started"
        );
    }

    /// Stops both loops, flushes buffered batches and waits for running
    /// batch handlers.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let workers = self.inner.workers.lock().await.take();
        if let Some((shutdown_tx, handles)) = workers {
            let _ = shutdown_tx.send(true);
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(?e, "Event bus task panicked");
                }
            }
        }

        let buffers: Vec<(String, Vec<Message>)> = {
            let mut state = self.inner.state.lock().await;
            state
                .batches
                .drain()
                .map(|(topic, buffer)| (topic, buffer.messages))
                .collect()
        };
        for (topic, messages) in buffers {
            self.flush_batch(topic, messages).await;
        }

        while self.inner.batches_in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        info!("Event bus stopped");
    }

    async fn run_delivery(self, mut shutdown: watch::Receiver<bool>) {
        info!("Event bus delivery loop starting");
        loop {
            while let Some(message) = self.next_ready().await {
                self.dispatch(message).await;
                if *shutdown.borrow() {
                    break;
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Event bus delivery loop stopping");
                    break;
                }
                _ = self.inner.wakeup.notified() => {}
                _ = tokio::time::sleep(self.inner.settings.scheduler_interval()) => {}
            }
        }
    }

    async fn run_scheduler(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.settings.scheduler_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    info!("Event bus scheduler stopping");
                    break;
                }
            }
        }
    }

    /// Promotes matured scheduled messages, flushes aged batches and prunes
    /// finished messages.
    async fn tick(&self) {
        let now = Instant::now();
        let batch_wait = self.inner.settings.batch_wait();
        let retention = self
            .inner
            .settings
            .message_ttl()
            .unwrap_or(DEFAULT_RETENTION);

        let (promoted, aged) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;

            let mut promoted = 0;
            while let Some(Reverse((due, _, _))) = state.scheduled.peek() {
                if *due > now {
                    break;
                }
                let Some(Reverse((_, _, id))) = state.scheduled.pop() else {
                    break;
                };
                if let Some(tracked) = state.messages.get_mut(&id) {
                    if matches!(
                        tracked.message.status,
                        MessageStatus::Pending | MessageStatus::Retry
                    ) {
                        tracked.message.status = MessageStatus::Pending;
                        state.tiers[tracked.message.priority.index()].push_back(id);
                        promoted += 1;
                    }
                }
            }

            let aged_topics: Vec<String> = state
                .batches
                .iter()
                .filter(|(_, b)| now.duration_since(b.opened) >= batch_wait)
                .map(|(t, _)| t.clone())
                .collect();
            let aged: Vec<(String, Vec<Message>)> = aged_topics
                .into_iter()
                .filter_map(|t| state.batches.remove(&t).map(|b| (t, b.messages)))
                .collect();

            state.messages.retain(|_, t| match t.finished {
                Some(at) if t.message.status != MessageStatus::Failed => {
                    now.duration_since(at) < retention
                }
                _ => true,
            });

            (promoted, aged)
        };

        if promoted > 0 {
            debug!(promoted, "Scheduled messages matured");
            self.inner.wakeup.notify_one();
        }
        for (topic, messages) in aged {
            self.flush_batch(topic, messages).await;
        }
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Pops the next deliverable message, strict priority then FIFO.
    async fn next_ready(&self) -> Option<Message> {
        let ttl = self.inner.settings.message_ttl();
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        for tier in 0..state.tiers.len() {
            while let Some(id) = state.tiers[tier].pop_front() {
                let Some(tracked) = state.messages.get_mut(&id) else {
                    continue;
                };
                if tracked.message.status != MessageStatus::Pending {
                    continue;
                }

                if let Some(ttl) = ttl {
                    if tracked.created.elapsed() > ttl {
                        tracked.message.status = MessageStatus::Expired;
                        tracked.finished = Some(Instant::now());
                        state.stats.expired += 1;
                        warn!(
                            message_id = %id,
                            topic = %tracked.message.topic,
                            error_kind = %ErrorKind::MessageExpired,
                            "Message expired before delivery"
                        );
                        continue;
                    }
                }

                tracked.message.status = MessageStatus::Processing;
                return Some(tracked.message.clone());
            }
        }
        None
    }

    async fn dispatch(&self, message: Message) {
        let handlers = self
            .inner
            .handlers
            .read()
            .await
            .get(&message.topic)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            self.buffer_for_batch(message).await;
            return;
        }

        let mut outcome = Ok(());
        for handler in handlers {
            if let Err(e) = handler.handle(&message).await {
                outcome = Err(e);
                break;
            }
        }

        match outcome {
            Ok(()) => self.complete(&[message.id]).await,
            Err(e) => self.fail(&message.id, e.to_string()).await,
        }
    }

    async fn buffer_for_batch(&self, message: Message) {
        let has_batch_handler = self
            .inner
            .batch_handlers
            .read()
            .await
            .contains_key(&message.topic);

        if !has_batch_handler {
            let mut state = self.inner.state.lock().await;
            if let Some(tracked) = state.messages.get_mut(&message.id) {
                tracked.message.status = MessageStatus::Failed;
                tracked.message.last_error = Some(format!("No subscriber for topic {}", message.topic));
                tracked.finished = Some(Instant::now());
            }
            state.stats.failed += 1;
            warn!(message_id = %message.id, topic = %message.topic, "No subscriber for topic");
            return;
        }

        let full = {
            let mut state = self.inner.state.lock().await;
            let topic = message.topic.clone();
            let buffer = state.batches.entry(topic.clone()).or_insert_with(|| BatchBuffer {
                messages: Vec::new(),
                opened: Instant::now(),
            });
            buffer.messages.push(message);
            if buffer.messages.len() >= self.inner.settings.max_batch_size {
                state.batches.remove(&topic).map(|b| (topic, b.messages))
            } else {
                None
            }
        };

        if let Some((topic, messages)) = full {
            self.flush_batch(topic, messages).await;
        }
    }

    /// Hands a batch to its handler on a separate task, bounded by
    /// `max_concurrent_batches`.
    async fn flush_batch(&self, topic: String, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let Some(handler) = self.inner.batch_handlers.read().await.get(&topic).cloned() else {
            return;
        };

        let bus = self.clone();
        let slots = self.inner.batch_slots.clone();
        self.inner.batches_in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            if let Ok(_permit) = slots.acquire_owned().await {
                bus.inner.state.lock().await.stats.batches += 1;
                debug!(topic = %topic, size = messages.len(), "Processing batch");

                match handler.handle_batch(&messages).await {
                    Ok(()) => {
                        let ids: Vec<String> = messages.into_iter().map(|m| m.id).collect();
                        bus.complete(&ids).await;
                    }
                    Err(e) => {
                        error!(topic = %topic, error_kind = %e.kind(), ?e, "Batch handler failed");
                        let reason = e.to_string();
                        for message in messages {
                            bus.fail(&message.id, reason.clone()).await;
                        }
                    }
                }
            }
            bus.inner.batches_in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn complete(&self, ids: &[String]) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();
        for id in ids {
            if let Some(tracked) = state.messages.get_mut(id) {
                tracked.message.status = MessageStatus::Completed;
                tracked.finished = Some(now);
                state.stats.delivered += 1;
            }
        }
    }

    /// Schedules a retry, or marks the message FAILED and dead-letters it
    /// once `max_retries` retries are spent.
    async fn fail(&self, message_id: &str, reason: String) {
        let failed = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;

            let Some(tracked) = state.messages.get_mut(message_id) else {
                return;
            };
            if tracked.message.status == MessageStatus::Cancelled {
                return;
            }
            tracked.message.last_error = Some(reason.clone());

            if tracked.message.retry_count < tracked.message.max_retries {
                tracked.message.retry_count += 1;
                let attempt = tracked.message.retry_count;
                let delay = self.inner.settings.retry_delay_for(attempt);
                tracked.message.status = MessageStatus::Retry;
                tracked.message.scheduled_at = chrono::Duration::from_std(delay)
                    .ok()
                    .map(|d| Utc::now() + d);
                state.schedule(message_id.to_string(), Instant::now() + delay);
                state.stats.retried += 1;

                warn!(
                    message_id = %message_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Handler failed, retry scheduled"
                );
                return;
            }

            tracked.message.status = MessageStatus::Failed;
            tracked.finished = Some(Instant::now());
            state.stats.failed += 1;
            tracked.message.clone()
        };

        let payload = serde_json::to_value(&failed).unwrap_or(Value::Null);
        if let Err(e) = self
            .inner
            .dead_letters
            .add(
                DeadLetterOrigin::Bus,
                message_id,
                payload,
                &reason,
                failed.retry_count + 1,
            )
            .await
        {
            error!(message_id = %message_id, error_kind = %e.kind(), ?e, "Failed to record dead letter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_store::MemoryStore;
    use serde_json::json;

    fn bus(settings: BusSettings) -> EventBus {
        EventBus::new(settings, DeadLetterQueue::new(Arc::new(MemoryStore::new())))
    }

    fn fast_settings() -> BusSettings {
        BusSettings {
            scheduler_interval_ms: 5,
            ..BusSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_priority() {
        let bus = bus(fast_settings());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        bus.subscribe(
            "work",
            handler_fn(move |message: Message| {
                let sink = sink.clone();
                async move {
                    sink.lock().await.push(message.payload["name"].as_str().unwrap_or("").to_string());
                    Ok(())
                }
            }),
        )
        .await;

        bus.publish("work", json!({ "name": "low" }), Priority::Low, None, None)
            .await
            .unwrap();
        bus.publish("work", json!({ "name": "critical" }), Priority::Critical, None, None)
            .await
            .unwrap();

        bus.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.shutdown().await;

        assert_eq!(*seen.lock().await, vec!["critical", "low"]);
        assert_eq!(bus.queue_status().await.stats.delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_then_dead_letter() {
        let bus = bus(BusSettings {
            max_retries: 3,
            retry_delay: 0.04,
            ..fast_settings()
        });
        let calls = Arc::new(Mutex::new(Vec::new()));

        let sink = calls.clone();
        bus.subscribe(
            "flaky",
            handler_fn(move |_message: Message| {
                let sink = sink.clone();
                async move {
                    sink.lock().await.push(Instant::now());
                    Err(SyncError::HandlerFailed("downstream refused".into()))
                }
            }),
        )
        .await;

        bus.start().await;
        let id = bus
            .publish("flaky", json!({}), Priority::Normal, None, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        bus.shutdown().await;

        let calls = calls.lock().await;
        assert_eq!(calls.len(), 4);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(40));
        assert!(gaps[0] < gaps[1]);
        assert!(gaps[1] < gaps[2]);

        let message = bus.message(&id).await.unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.retry_count, 3);

        let letters = bus.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reference_id, id);
        assert!(letters[0].error_message.contains("downstream refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_retry_chain_stays_within_delay_ceiling() {
        let bus = bus(BusSettings {
            max_retries: 80,
            retry_delay: 0.001,
            max_retry_delay: 0.01,
            ..fast_settings()
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        bus.subscribe(
            "stubborn",
            handler_fn(move |_message: Message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::HandlerFailed("still down".into()))
                }
            }),
        )
        .await;

        bus.start().await;
        let id = bus
            .publish("stubborn", json!({}), Priority::Normal, None, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        // Delivery loop is still alive after the late, huge-exponent retries.
        let follow_up = bus
            .publish("stubborn", json!({}), Priority::Normal, None, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.shutdown().await;

        let message = bus.message(&id).await.unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.retry_count, 80);
        assert!(calls.load(Ordering::SeqCst) >= 82);
        assert_ne!(bus.message_status(&follow_up).await, Some(MessageStatus::Pending));
        assert_eq!(bus.dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_by_size_then_wait() {
        let bus = bus(BusSettings {
            max_batch_size: 3,
            max_batch_wait_time: 0.05,
            ..fast_settings()
        });
        let sizes = Arc::new(Mutex::new(Vec::new()));

        let sink = sizes.clone();
        bus.subscribe_batch(
            "metrics",
            batch_handler_fn(move |messages: Vec<Message>| {
                let sink = sink.clone();
                async move {
                    sink.lock().await.push(messages.len());
                    Ok(())
                }
            }),
        )
        .await;

        let ids = bus
            .publish_batch("metrics", (0..5).map(|i| json!({ "i": i })).collect(), Priority::Normal)
            .await
            .unwrap();

        bus.start().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        bus.shutdown().await;

        assert_eq!(*sizes.lock().await, vec![3, 2]);
        for id in ids {
            assert_eq!(bus.message_status(&id).await, Some(MessageStatus::Completed));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_clear() {
        let bus = bus(fast_settings());
        let later = Utc::now() + chrono::Duration::hours(1);

        let scheduled = bus
            .publish("a", json!({}), Priority::Normal, Some(later), None)
            .await
            .unwrap();
        bus.publish("a", json!({}), Priority::High, None, None).await.unwrap();
        bus.publish("b", json!({}), Priority::Low, None, None).await.unwrap();

        assert_eq!(bus.queue_status().await.scheduled, 1);
        assert!(bus.cancel(&scheduled).await);
        assert!(!bus.cancel(&scheduled).await);
        assert_eq!(bus.message_status(&scheduled).await, Some(MessageStatus::Cancelled));
        assert_eq!(bus.queue_status().await.scheduled, 0);

        assert_eq!(bus.clear(Some("a")).await, 1);
        let status = bus.queue_status().await;
        assert_eq!(status.queues["high"], 0);
        assert_eq!(status.queues["low"], 1);
        assert_eq!(bus.clear(None).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_messages_are_not_delivered() {
        let bus = bus(BusSettings {
            message_ttl_seconds: 1,
            ..fast_settings()
        });
        let delivered = Arc::new(AtomicUsize::new(0));

        let counter = delivered.clone();
        bus.subscribe(
            "t",
            handler_fn(move |_message: Message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await;

        let id = bus.publish("t", json!({}), Priority::Normal, None, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        bus.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.shutdown().await;

        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(bus.message_status(&id).await, Some(MessageStatus::Expired));
        assert!(matches!(
            bus.publish("t", json!({}), Priority::Normal, None, None).await,
            Err(SyncError::ShuttingDown)
        ));
    }
}
