use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio::time::{Duration, Instant, interval};

/// Work scheduled under a conversation's FIFO.
pub type QueueTask = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

pub enum Enqueued {
    /// The task ran (or failed); the conversation order was respected.
    Executed(anyhow::Result<Value>),
    /// A task with this message id was already accepted.
    Duplicate,
}

struct Entry {
    timestamp: i64,
    task: QueueTask,
    waiter: oneshot::Sender<anyhow::Result<Value>>,
}

#[derive(Default)]
struct QueueState {
    /// Ascending timestamp; ties keep arrival order.
    pending: Vec<Entry>,
    processing: bool,
    last_processed_timestamp: i64,
    seen_ids: HashSet<String>,
}

/// Single-runner FIFO for one conversation. Tasks are reordered by client
/// timestamp at enqueue; exactly one executes at a time.
pub struct JobQueue {
    job_id: String,
    state: Mutex<QueueState>,
}

impl JobQueue {
    fn new(job_id: String) -> Self {
        Self {
            job_id,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Returns a waiter for the task's completion, or `None` when the
    /// message id was seen before. Starts the runner if idle.
    fn enqueue(
        self: &Arc<Self>,
        message_id: &str,
        timestamp: i64,
        task: QueueTask,
    ) -> Option<oneshot::Receiver<anyhow::Result<Value>>> {
        let (tx, rx) = oneshot::channel();
        let start_runner = {
            let mut st = self.state.lock().unwrap();
            if !st.seen_ids.insert(message_id.to_string()) {
                return None;
            }
            let at = st.pending.partition_point(|e| e.timestamp <= timestamp);
            st.pending.insert(
                at,
                Entry {
                    timestamp,
                    task,
                    waiter: tx,
                },
            );
            if st.processing {
                false
            } else {
                st.processing = true;
                true
            }
        };

        if start_runner {
            let queue = Arc::clone(self);
            tokio::spawn(async move { queue.run().await });
        }

        Some(rx)
    }

    async fn run(self: Arc<Self>) {
        loop {
            let (entry, late_after) = {
                let mut st = self.state.lock().unwrap();
                if st.pending.is_empty() {
                    st.processing = false;
                    return;
                }
                let entry = st.pending.remove(0);
                let late = (entry.timestamp < st.last_processed_timestamp)
                    .then_some(st.last_processed_timestamp);
                (entry, late)
            };

            if let Some(newest) = late_after {
                tracing::warn!(
                    job_id = %self.job_id,
                    timestamp = entry.timestamp,
                    last_processed = newest,
                    "Late-arriving message executed after a newer timestamp"
                );
            }

            let timestamp = entry.timestamp;
            let result = entry.task.await;

            {
                let mut st = self.state.lock().unwrap();
                st.last_processed_timestamp = st.last_processed_timestamp.max(timestamp);
            }

            let _ = entry.waiter.send(result);
        }
    }

    fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    fn is_processing(&self) -> bool {
        self.state.lock().unwrap().processing
    }

    fn last_processed_timestamp(&self) -> i64 {
        self.state.lock().unwrap().last_processed_timestamp
    }

    #[cfg(test)]
    fn pending_timestamps(&self) -> Vec<i64> {
        self.state
            .lock()
            .unwrap()
            .pending
            .iter()
            .map(|e| e.timestamp)
            .collect()
    }
}

/// Owns all per-conversation queues plus the idle sweeper that reclaims
/// quiet ones. Queues for different conversations run concurrently.
pub struct MessageQueueManager {
    queues: DashMap<String, Arc<JobQueue>>,
    last_activity: DashMap<String, Instant>,
    idle_after: Duration,
    shutdown: Notify,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MessageQueueManager {
    pub fn new(idle_after: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            queues: DashMap::new(),
            last_activity: DashMap::new(),
            idle_after,
            shutdown: Notify::new(),
            sweeper: Mutex::new(None),
        });

        let sweeper = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let mut ticker = interval(manager.idle_after);
                ticker.tick().await; // first tick fires immediately
                loop {
                    tokio::select! {
                        _ = manager.shutdown.notified() => return,
                        _ = ticker.tick() => manager.sweep(),
                    }
                }
            })
        };
        *manager.sweeper.lock().unwrap() = Some(sweeper);

        manager
    }

    pub async fn enqueue(
        &self,
        job_id: &str,
        message_id: &str,
        timestamp: i64,
        task: QueueTask,
    ) -> Enqueued {
        let queue = self
            .queues
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(JobQueue::new(job_id.to_string())))
            .clone();
        self.last_activity.insert(job_id.to_string(), Instant::now());

        match queue.enqueue(message_id, timestamp, task) {
            None => Enqueued::Duplicate,
            Some(rx) => {
                let result = rx
                    .await
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("queue runner dropped the task")));
                self.last_activity.insert(job_id.to_string(), Instant::now());
                Enqueued::Executed(result)
            }
        }
    }

    pub fn pending_count(&self, job_id: &str) -> usize {
        self.queues.get(job_id).map(|q| q.pending_count()).unwrap_or(0)
    }

    pub fn is_processing(&self, job_id: &str) -> bool {
        self.queues.get(job_id).map(|q| q.is_processing()).unwrap_or(false)
    }

    pub fn last_processed_timestamp(&self, job_id: &str) -> i64 {
        self.queues
            .get(job_id)
            .map(|q| q.last_processed_timestamp())
            .unwrap_or(0)
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn sweep(&self) {
        let now = Instant::now();
        let idle: Vec<String> = self
            .queues
            .iter()
            .filter(|entry| {
                let quiet = entry.value().pending_count() == 0 && !entry.value().is_processing();
                let stale = self
                    .last_activity
                    .get(entry.key())
                    .map(|at| now.duration_since(*at) > self.idle_after)
                    .unwrap_or(true);
                quiet && stale
            })
            .map(|entry| entry.key().clone())
            .collect();

        for job_id in idle {
            self.queues.remove(&job_id);
            self.last_activity.remove(&job_id);
            tracing::debug!(job_id = %job_id, "Swept idle message queue");
        }
    }

    /// Stop the sweeper and drop all queues. In-flight tasks finish on their
    /// runner tasks; new enqueues after destroy land on fresh queues.
    pub async fn destroy(&self) {
        self.shutdown.notify_one();
        let handle = self.sweeper.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.queues.clear();
        self.last_activity.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recording_task(
        order: &Arc<Mutex<Vec<i64>>>,
        stamp: i64,
    ) -> QueueTask {
        let order = Arc::clone(order);
        Box::pin(async move {
            order.lock().unwrap().push(stamp);
            Ok(json!(stamp))
        })
    }

    fn gated_task(
        order: &Arc<Mutex<Vec<i64>>>,
        stamp: i64,
        gate: oneshot::Receiver<()>,
    ) -> QueueTask {
        let order = Arc::clone(order);
        Box::pin(async move {
            let _ = gate.await;
            order.lock().unwrap().push(stamp);
            Ok(json!(stamp))
        })
    }

    #[tokio::test]
    async fn reorders_pending_tasks_by_timestamp() {
        let manager = MessageQueueManager::new(Duration::from_secs(300));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (gate_tx, gate_rx) = oneshot::channel();

        // Hold the runner on the first task so later enqueues pile up.
        let mgr = Arc::clone(&manager);
        let blocker = {
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                mgr.enqueue("j2", "a", 200, gated_task(&order, 200, gate_rx))
                    .await
            })
        };
        tokio::task::yield_now().await;

        let mgr = Arc::clone(&manager);
        let later = {
            let order = Arc::clone(&order);
            tokio::spawn(
                async move { mgr.enqueue("j2", "c", 300, recording_task(&order, 300)).await },
            )
        };
        tokio::task::yield_now().await;

        let mgr = Arc::clone(&manager);
        let earlier = {
            let order = Arc::clone(&order);
            tokio::spawn(
                async move { mgr.enqueue("j2", "b", 100, recording_task(&order, 100)).await },
            )
        };
        tokio::task::yield_now().await;

        // The queue itself is sorted before the gate opens.
        let queue = manager.queues.get("j2").unwrap().clone();
        assert_eq!(queue.pending_timestamps(), vec![100, 300]);

        gate_tx.send(()).unwrap();
        for handle in [blocker, later, earlier] {
            match handle.await.unwrap() {
                Enqueued::Executed(res) => assert!(res.is_ok()),
                Enqueued::Duplicate => panic!("unexpected duplicate"),
            }
        }

        assert_eq!(*order.lock().unwrap(), vec![200, 100, 300]);
        assert_eq!(manager.last_processed_timestamp("j2"), 300);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn duplicate_message_id_is_reported() {
        let manager = MessageQueueManager::new(Duration::from_secs(300));
        let order = Arc::new(Mutex::new(Vec::new()));

        match manager
            .enqueue("j1", "m1", 10, recording_task(&order, 10))
            .await
        {
            Enqueued::Executed(res) => assert!(res.is_ok()),
            Enqueued::Duplicate => panic!("first enqueue must execute"),
        }

        match manager
            .enqueue("j1", "m1", 10, recording_task(&order, 10))
            .await
        {
            Enqueued::Duplicate => {}
            Enqueued::Executed(_) => panic!("second enqueue must dedupe"),
        }

        assert_eq!(order.lock().unwrap().len(), 1);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn jobs_do_not_block_each_other() {
        let manager = MessageQueueManager::new(Duration::from_secs(300));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (gate_tx, gate_rx) = oneshot::channel();

        let mgr = Arc::clone(&manager);
        let blocked = {
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                mgr.enqueue("slow", "s1", 1, gated_task(&order, 1, gate_rx))
                    .await
            })
        };
        tokio::task::yield_now().await;

        // A different conversation proceeds while "slow" is held.
        match manager
            .enqueue("fast", "f1", 2, recording_task(&order, 2))
            .await
        {
            Enqueued::Executed(res) => assert!(res.is_ok()),
            Enqueued::Duplicate => panic!("unexpected duplicate"),
        }
        assert_eq!(*order.lock().unwrap(), vec![2]);

        gate_tx.send(()).unwrap();
        blocked.await.unwrap();
        manager.destroy().await;
    }

    #[tokio::test]
    async fn late_arrival_executes_and_timestamp_stays_monotonic() {
        let manager = MessageQueueManager::new(Duration::from_secs(300));
        let order = Arc::new(Mutex::new(Vec::new()));

        manager
            .enqueue("j3", "new", 500, recording_task(&order, 500))
            .await;
        manager
            .enqueue("j3", "old", 100, recording_task(&order, 100))
            .await;

        assert_eq!(*order.lock().unwrap(), vec![500, 100]);
        assert_eq!(manager.last_processed_timestamp("j3"), 500);
        manager.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_queues_are_swept() {
        let manager = MessageQueueManager::new(Duration::from_secs(300));
        let order = Arc::new(Mutex::new(Vec::new()));

        manager
            .enqueue("idle", "m1", 1, recording_task(&order, 1))
            .await;
        assert_eq!(manager.queue_count(), 1);

        tokio::time::advance(Duration::from_secs(601)).await;
        tokio::task::yield_now().await;

        assert_eq!(manager.queue_count(), 0);
        manager.destroy().await;
    }
}
