use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;

use pkg_ipmanager::IpEvent;
use pkg_store::StoreEvent;

/// Why a reconcile was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskReason {
    InitialSync,
    StoreChange,
    IpChange,
    PortAllocation,
    Resync,
}

impl std::fmt::Display for TaskReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskReason::InitialSync => "initial-sync",
            TaskReason::StoreChange => "store-change",
            TaskReason::IpChange => "ip-change",
            TaskReason::PortAllocation => "port-allocation",
            TaskReason::Resync => "resync",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub key: String,
    pub reason: TaskReason,
    /// A skippable task is dropped while an equal one is still pending.
    pub skippable: bool,
}

impl Task {
    pub fn initial_sync() -> Self {
        Self {
            key: TaskReason::InitialSync.to_string(),
            reason: TaskReason::InitialSync,
            skippable: false,
        }
    }

    pub fn resync() -> Self {
        Self {
            key: TaskReason::Resync.to_string(),
            reason: TaskReason::Resync,
            skippable: true,
        }
    }

    pub fn store_change(event: &StoreEvent) -> Self {
        Self {
            key: event.task_key(),
            reason: TaskReason::StoreChange,
            skippable: true,
        }
    }

    pub fn ip_change(event: &IpEvent) -> Self {
        Self {
            key: format!("ip/{}", event.ip()),
            reason: TaskReason::IpChange,
            skippable: true,
        }
    }

    pub fn port_allocation(service_id: &str, container_port: u16) -> Self {
        Self {
            key: format!("port/{}/{}", service_id, container_port),
            reason: TaskReason::PortAllocation,
            skippable: true,
        }
    }
}

/// Token bucket limiting how often tasks are handed out.
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate,
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    /// Take a token, or return how long to wait for the next one.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        if self.rate <= 0.0 {
            return Ok(());
        }
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.rate))
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Task>,
    skippable_keys: HashSet<String>,
    closed: bool,
}

/// Rate-limited FIFO work queue with coalescing of skippable tasks.
/// Built for one consumer.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    bucket: Mutex<TokenBucket>,
    notify: Notify,
}

impl TaskQueue {
    /// `rate` tasks per second with bursts of `burst`. A rate of zero
    /// disables limiting.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            bucket: Mutex::new(TokenBucket::new(rate, burst)),
            notify: Notify::new(),
        }
    }

    /// Enqueue `task`. Returns false if it was coalesced or the queue is closed.
    pub fn add(&self, task: Task) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return false;
        }
        if task.skippable && !state.skippable_keys.insert(task.key.clone()) {
            debug!(key = %task.key, "Coalesced task");
            return false;
        }
        state.pending.push_back(task);
        drop(state);
        self.notify.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting tasks. Pending ones are still handed out, without rate
    /// limiting, after which [`TaskQueue::get`] returns `None`.
    pub fn close(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Task> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let task = state.pending.pop_front()?;
        if task.skippable {
            state.skippable_keys.remove(&task.key);
        }
        Some(task)
    }

    /// Wait for the next task. Tasks arriving while the caller waits for a
    /// token still coalesce with the pending ones.
    pub async fn get(&self) -> Option<Task> {
        loop {
            let closed = {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.pending.is_empty() && state.closed {
                    return None;
                }
                if !state.pending.is_empty() {
                    Some(state.closed)
                } else {
                    None
                }
            };
            match closed {
                Some(true) => return self.pop(),
                Some(false) => break,
                None => self.notify.notified().await,
            }
        }

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
                bucket.try_take(Instant::now())
            };
            match wait {
                Ok(()) => return self.pop(),
                Err(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::watch::ResourceKind;
    use std::sync::Arc;

    #[tokio::test]
    async fn skippable_tasks_coalesce() {
        let queue = TaskQueue::new(0.0, 1);
        let ev = StoreEvent::upsert(ResourceKind::Endpoints, "default/svc-a");
        assert!(queue.add(Task::store_change(&ev)));
        assert!(!queue.add(Task::store_change(&ev)));
        assert!(queue.add(Task::initial_sync()));
        assert!(queue.add(Task::initial_sync()));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.get().await.unwrap().reason, TaskReason::StoreChange);
        // Once handed out, the key may be queued again.
        assert!(queue.add(Task::store_change(&ev)));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = TaskQueue::new(1.0, 1);
        queue.add(Task::resync());
        queue.add(Task::initial_sync());
        queue.close();

        assert!(!queue.add(Task::port_allocation("svc", 80)));
        assert_eq!(queue.get().await.unwrap().reason, TaskReason::Resync);
        assert_eq!(queue.get().await.unwrap().reason, TaskReason::InitialSync);
        assert!(queue.get().await.is_none());
    }

    #[tokio::test]
    async fn get_waits_for_add() {
        let queue = Arc::new(TaskQueue::new(0.0, 1));
        let q = queue.clone();
        let consumer = tokio::spawn(async move { q.get().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add(Task::resync());
        assert_eq!(consumer.await.unwrap().unwrap().reason, TaskReason::Resync);
    }

    #[tokio::test]
    async fn close_wakes_idle_consumer() {
        let queue = Arc::new(TaskQueue::new(0.0, 1));
        let q = queue.clone();
        let consumer = tokio::spawn(async move { q.get().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(consumer.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rate_is_limited() {
        let queue = TaskQueue::new(20.0, 1);
        for i in 0..3 {
            queue.add(Task::port_allocation("svc", i));
        }
        let start = Instant::now();
        for _ in 0..3 {
            queue.get().await.unwrap();
        }
        // One token up front, then two at 50ms each.
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn bucket_refills() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(1.0, 2);
        assert!(bucket.try_take(t0).is_ok());
        assert!(bucket.try_take(t0).is_ok());
        assert!(bucket.try_take(t0).is_err());
        assert!(bucket.try_take(t0 + Duration::from_secs(1)).is_ok());
    }
}
