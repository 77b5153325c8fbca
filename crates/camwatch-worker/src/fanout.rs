//! Broadcast fanout of live previews.
//!
//! The processing cycle offers messages into a bounded [`HandoffQueue`]
//! (never blocking, oldest dropped on overflow). One async loop per task
//! drains it a message at a time and delivers to every attached
//! [`Subscriber`]; a subscriber whose send fails is removed on the spot.
//! Message building (overlay drawing and JPEG encoding) runs on the blocking
//! pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use camwatch_models::TaskId;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;

/// Bounded multi-producer hand-off that drops the oldest item when full.
#[derive(Debug)]
pub struct HandoffQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    ready: Notify,
    dropped: AtomicU64,
}

impl<T> HandoffQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. Returns `false` if an older item was evicted.
    pub fn try_send(&self, item: T) -> bool {
        let evicted = {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            let evicted = if items.len() >= self.capacity {
                items.pop_front().is_some()
            } else {
                false
            };
            items.push_back(item);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        !evicted
    }

    pub fn try_recv(&self) -> Option<T> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Wait for the next item.
    pub async fn recv(&self) -> T {
        loop {
            if let Some(item) = self.try_recv() {
                return item;
            }
            self.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A live-preview consumer.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn id(&self) -> &str;

    /// Deliver one JSON message. An error means the subscriber is gone.
    async fn send(&self, message: &str) -> WorkerResult<()>;
}

/// Subscriber backed by a bounded tokio channel (e.g. a WebSocket writer task).
pub struct ChannelSubscriber {
    id: String,
    tx: mpsc::Sender<String>,
    send_timeout: Duration,
}

impl ChannelSubscriber {
    pub fn new(id: impl Into<String>, tx: mpsc::Sender<String>) -> Self {
        Self {
            id: id.into(),
            tx,
            send_timeout: Duration::from_secs(1),
        }
    }

    /// Create a subscriber together with the receiving end of its channel.
    pub fn channel(id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(id, tx), rx)
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: &str) -> WorkerResult<()> {
        match self.tx.try_send(message.to_string()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                match tokio::time::timeout(self.send_timeout, self.tx.send(msg)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(WorkerError::subscriber_gone(&self.id)),
                    Err(_) => Err(WorkerError::timeout(format!(
                        "subscriber {} did not drain in {:?}",
                        self.id, self.send_timeout
                    ))),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(WorkerError::subscriber_gone(&self.id))
            }
        }
    }
}

/// Fanout counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    /// Messages built (encode work performed).
    pub encodes: u64,
    /// Individual subscriber deliveries.
    pub sent: u64,
    /// Subscribers removed after a failed send.
    pub removed: u64,
    /// Messages evicted from the hand-off queue.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    encodes: AtomicU64,
    sent: AtomicU64,
    removed: AtomicU64,
}

type SubscriberList = Arc<Mutex<Vec<Arc<dyn Subscriber>>>>;

/// The delivery loop currently owning a fanout, tagged with the generation it
/// was spawned under.
struct LoopHandle {
    generation: u64,
    handle: JoinHandle<()>,
}

type WorkerSlot = Arc<Mutex<Option<LoopHandle>>>;

/// Per-task broadcast fanout.
pub struct Fanout {
    task_id: TaskId,
    subscribers: SubscriberList,
    queue: Arc<HandoffQueue<String>>,
    worker: WorkerSlot,
    generation: AtomicU64,
    runtime: Handle,
    counters: Arc<Counters>,
}

impl Fanout {
    /// Create a fanout whose delivery loop runs on `runtime`.
    pub fn new(task_id: TaskId, queue_capacity: usize, runtime: Handle) -> Self {
        Self {
            task_id,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            queue: Arc::new(HandoffQueue::new(queue_capacity)),
            worker: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
            runtime,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Attach a subscriber, replacing any with the same id, and make sure
    /// the delivery loop is running.
    pub fn attach(&self, subscriber: Arc<dyn Subscriber>) -> usize {
        let count = {
            let mut subs = lock(&self.subscribers);
            subs.retain(|s| s.id() != subscriber.id());
            subs.push(subscriber);
            subs.len()
        };
        metrics::set_subscribers(self.task_id.as_str(), count);
        self.ensure_running();
        count
    }

    /// Detach a subscriber. Detaching the last one stops the delivery loop.
    pub fn detach(&self, subscriber_id: &str) -> bool {
        let (removed, remaining) = {
            let mut subs = lock(&self.subscribers);
            let before = subs.len();
            subs.retain(|s| s.id() != subscriber_id);
            (subs.len() != before, subs.len())
        };
        metrics::set_subscribers(self.task_id.as_str(), remaining);
        if remaining == 0 {
            self.stop_loop();
        }
        removed
    }

    pub fn has_subscribers(&self) -> bool {
        !lock(&self.subscribers).is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Offer a message built by `build` on the blocking pool. With no
    /// subscribers `build` is not called and nothing is queued.
    pub async fn offer<F>(&self, build: F) -> bool
    where
        F: FnOnce() -> WorkerResult<String> + Send + 'static,
    {
        if !self.has_subscribers() {
            return false;
        }
        self.counters.encodes.fetch_add(1, Ordering::Relaxed);
        let built = tokio::task::spawn_blocking(build)
            .await
            .map_err(|e| WorkerError::task_failed(format!("preview build join error: {}", e)))
            .and_then(|result| result);
        match built {
            Ok(message) => {
                if !self.queue.try_send(message) {
                    metrics::record_preview_dropped(self.task_id.as_str());
                    debug!(task_id = %self.task_id, "Preview queue full, dropped oldest message");
                }
                true
            }
            Err(e) => {
                warn!(task_id = %self.task_id, "Failed to build preview message: {}", e);
                false
            }
        }
    }

    /// Remove every subscriber and stop the delivery loop.
    pub fn shutdown(&self) {
        lock(&self.subscribers).clear();
        metrics::set_subscribers(self.task_id.as_str(), 0);
        self.stop_loop();
    }

    pub fn is_running(&self) -> bool {
        lock_worker(&self.worker)
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            encodes: self.counters.encodes.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            removed: self.counters.removed.load(Ordering::Relaxed),
            dropped: self.queue.dropped(),
        }
    }

    /// Spawn a delivery loop unless one is registered. A loop deregisters
    /// itself under the same lock before exiting, so an `attach` racing with
    /// its exit always ends up with a live loop.
    fn ensure_running(&self) {
        let mut worker = lock_worker(&self.worker);
        if worker
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
        {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        info!(task_id = %self.task_id, generation, "Starting preview fanout loop");
        let handle = self.runtime.spawn(deliver_loop(
            DeliveryContext {
                task_id: self.task_id.clone(),
                subscribers: self.subscribers.clone(),
                queue: self.queue.clone(),
                counters: self.counters.clone(),
                worker: self.worker.clone(),
            },
            generation,
        ));
        *worker = Some(LoopHandle { generation, handle });
    }

    fn stop_loop(&self) {
        if let Some(current) = lock_worker(&self.worker).take() {
            current.handle.abort();
            debug!(task_id = %self.task_id, "Stopped preview fanout loop");
        }
        self.queue.clear();
    }
}

impl Drop for Fanout {
    fn drop(&mut self) {
        self.stop_loop();
    }
}

fn lock(subs: &SubscriberList) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Subscriber>>> {
    subs.lock().unwrap_or_else(|e| e.into_inner())
}

fn lock_worker(worker: &WorkerSlot) -> std::sync::MutexGuard<'_, Option<LoopHandle>> {
    worker.lock().unwrap_or_else(|e| e.into_inner())
}

/// Deregister the loop of `generation` if nobody is attached.
///
/// Returns `true` when the loop must exit. Both checks happen under the
/// worker lock, which `attach` takes after adding its subscriber.
fn retire_if_idle(worker: &WorkerSlot, subscribers: &SubscriberList, generation: u64) -> bool {
    let mut worker = lock_worker(worker);
    if !lock(subscribers).is_empty() {
        return false;
    }
    if worker
        .as_ref()
        .map(|w| w.generation == generation)
        .unwrap_or(false)
    {
        *worker = None;
    }
    true
}

struct DeliveryContext {
    task_id: TaskId,
    subscribers: SubscriberList,
    queue: Arc<HandoffQueue<String>>,
    counters: Arc<Counters>,
    worker: WorkerSlot,
}

async fn deliver_loop(ctx: DeliveryContext, generation: u64) {
    let DeliveryContext {
        task_id,
        subscribers,
        queue,
        counters,
        worker,
    } = ctx;

    loop {
        let message = queue.recv().await;
        let mut targets: Vec<Arc<dyn Subscriber>> = lock(&subscribers).clone();
        if targets.is_empty() {
            if retire_if_idle(&worker, &subscribers, generation) {
                break;
            }
            targets = lock(&subscribers).clone();
        }

        let results = join_all(targets.iter().map(|s| s.send(&message))).await;

        let mut failed = Vec::new();
        let mut delivered = 0usize;
        for (sub, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(task_id = %task_id, subscriber = sub.id(), "Dropping subscriber: {}", e);
                    failed.push(sub.id().to_string());
                }
            }
        }

        counters.sent.fetch_add(delivered as u64, Ordering::Relaxed);
        metrics::record_preview_sent(task_id.as_str(), delivered);

        if !failed.is_empty() {
            let remaining = {
                let mut subs = lock(&subscribers);
                subs.retain(|s| !failed.iter().any(|id| id == s.id()));
                subs.len()
            };
            counters
                .removed
                .fetch_add(failed.len() as u64, Ordering::Relaxed);
            metrics::set_subscribers(task_id.as_str(), remaining);
            if remaining == 0 {
                queue.clear();
                if retire_if_idle(&worker, &subscribers, generation) {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FailingSubscriber;

    #[async_trait]
    impl Subscriber for FailingSubscriber {
        fn id(&self) -> &str {
            "broken"
        }

        async fn send(&self, _message: &str) -> WorkerResult<()> {
            Err(WorkerError::subscriber_gone("broken"))
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_handoff_drops_oldest() {
        let queue = HandoffQueue::new(2);
        assert!(queue.try_send(1));
        assert!(queue.try_send(2));
        assert!(!queue.try_send(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_recv(), Some(2));
        assert_eq!(queue.try_recv(), Some(3));
    }

    #[tokio::test]
    async fn test_no_subscribers_skips_encoding() {
        let fanout = Fanout::new(TaskId::from("cam-1"), 4, Handle::current());
        let built = Arc::new(AtomicBool::new(false));
        let flag = built.clone();
        assert!(
            !fanout
                .offer(move || {
                    flag.store(true, Ordering::SeqCst);
                    Ok("{}".to_string())
                })
                .await
        );
        assert!(!built.load(Ordering::SeqCst));
        assert_eq!(fanout.stats().encodes, 0);
        assert!(!fanout.is_running());
    }

    #[tokio::test]
    async fn test_preview_is_built_off_the_runtime_thread() {
        let fanout = Fanout::new(TaskId::from("cam-1"), 4, Handle::current());
        let (sub, mut rx) = ChannelSubscriber::channel("a", 4);
        fanout.attach(Arc::new(sub));

        let runtime_thread = std::thread::current().id();
        let built_on = Arc::new(Mutex::new(None));
        let record = built_on.clone();
        assert!(
            fanout
                .offer(move || {
                    *record.lock().unwrap() = Some(std::thread::current().id());
                    Ok("frame".to_string())
                })
                .await
        );

        assert_eq!(rx.recv().await.as_deref(), Some("frame"));
        let built_on = built_on.lock().unwrap().unwrap();
        assert_ne!(built_on, runtime_thread);
    }

    #[tokio::test]
    async fn test_failed_build_queues_nothing() {
        let fanout = Fanout::new(TaskId::from("cam-1"), 4, Handle::current());
        let (sub, _rx) = ChannelSubscriber::channel("a", 4);
        fanout.attach(Arc::new(sub));

        let queued = fanout
            .offer(|| Err(WorkerError::task_failed("encoder exploded")))
            .await;
        assert!(!queued);
        assert_eq!(fanout.stats().encodes, 1);
        assert!(fanout.queue.is_empty());
    }

    #[tokio::test]
    async fn test_delivers_to_every_subscriber() {
        let fanout = Fanout::new(TaskId::from("cam-1"), 4, Handle::current());
        let (a, mut rx_a) = ChannelSubscriber::channel("a", 4);
        let (b, mut rx_b) = ChannelSubscriber::channel("b", 4);
        fanout.attach(Arc::new(a));
        fanout.attach(Arc::new(b));

        assert!(fanout.offer(|| Ok("frame-1".to_string())).await);

        assert_eq!(rx_a.recv().await.as_deref(), Some("frame-1"));
        assert_eq!(rx_b.recv().await.as_deref(), Some("frame-1"));
        assert_eq!(fanout.stats().encodes, 1);
    }

    #[tokio::test]
    async fn test_failed_send_removes_subscriber() {
        let fanout = Fanout::new(TaskId::from("cam-1"), 4, Handle::current());
        let (good, mut rx) = ChannelSubscriber::channel("good", 4);
        fanout.attach(Arc::new(good));
        fanout.attach(Arc::new(FailingSubscriber));
        assert_eq!(fanout.subscriber_count(), 2);

        fanout.offer(|| Ok("frame".to_string())).await;
        assert_eq!(rx.recv().await.as_deref(), Some("frame"));

        wait_until(|| fanout.subscriber_count() == 1).await;
        assert_eq!(fanout.stats().removed, 1);
    }

    #[tokio::test]
    async fn test_closed_channel_subscriber_is_dropped() {
        let fanout = Fanout::new(TaskId::from("cam-1"), 4, Handle::current());
        let (sub, rx) = ChannelSubscriber::channel("gone", 1);
        drop(rx);
        fanout.attach(Arc::new(sub));

        fanout.offer(|| Ok("frame".to_string())).await;

        wait_until(|| fanout.subscriber_count() == 0).await;
        wait_until(|| !fanout.is_running()).await;
    }

    #[tokio::test]
    async fn test_detach_last_stops_and_attach_restarts() {
        let fanout = Fanout::new(TaskId::from("cam-1"), 4, Handle::current());
        let (sub, _rx) = ChannelSubscriber::channel("a", 4);
        fanout.attach(Arc::new(sub));
        assert!(fanout.is_running());

        assert!(fanout.detach("a"));
        assert!(!fanout.is_running());
        assert!(!fanout.detach("a"));

        let (sub, mut rx) = ChannelSubscriber::channel("b", 4);
        fanout.attach(Arc::new(sub));
        assert!(fanout.is_running());
        fanout.offer(|| Ok("again".to_string())).await;
        assert_eq!(rx.recv().await.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn test_loop_only_retires_when_idle_under_worker_lock() {
        let fanout = Fanout::new(TaskId::from("cam-1"), 4, Handle::current());
        let (a, _rx_a) = ChannelSubscriber::channel("a", 4);
        fanout.attach(Arc::new(a));
        let generation = lock_worker(&fanout.worker).as_ref().unwrap().generation;

        // A subscriber is attached, so the loop must keep going.
        assert!(!retire_if_idle(&fanout.worker, &fanout.subscribers, generation));
        assert!(fanout.is_running());

        // Last subscriber gone: the loop deregisters itself.
        lock(&fanout.subscribers).clear();
        assert!(retire_if_idle(&fanout.worker, &fanout.subscribers, generation));
        assert!(lock_worker(&fanout.worker).is_none());

        // An attach after retirement spawns a fresh loop, which a stale
        // generation cannot deregister.
        let (b, _rx_b) = ChannelSubscriber::channel("b", 4);
        fanout.attach(Arc::new(b));
        assert!(fanout.is_running());
        assert!(!retire_if_idle(&fanout.worker, &fanout.subscribers, generation));
        lock(&fanout.subscribers).clear();
        assert!(retire_if_idle(&fanout.worker, &fanout.subscribers, generation));
        assert!(lock_worker(&fanout.worker).is_some());

        let (c, mut rx_c) = ChannelSubscriber::channel("c", 4);
        fanout.attach(Arc::new(c));
        fanout.offer(|| Ok("still-live".to_string())).await;
        assert_eq!(rx_c.recv().await.as_deref(), Some("still-live"));
    }
}
