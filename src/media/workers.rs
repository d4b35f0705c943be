use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag, WorkerSettings};
use mediasoup::worker_manager::WorkerManager;
use tokio::sync::Mutex;
use tokio::time::{Instant, interval};

use crate::config::{MediaConfig, WorkerDiedPolicy};
use crate::error::GatewayError;

/// Snapshot of one worker used by the selection logic and the health probe.
#[derive(Debug, Clone)]
pub struct WorkerView {
    pub slot: usize,
    pub pid: u32,
    pub online: bool,
    pub routers: u32,
    pub transports: u32,
    pub cpu_percent: f64,
    pub score: f64,
}

struct SampleState {
    cpu_percent: f64,
    score: f64,
    last_cpu_ms: Option<u64>,
    last_sample: Option<Instant>,
}

struct WorkerSlot {
    slot: usize,
    worker: Worker,
    pid: u32,
    online: AtomicBool,
    routers: AtomicU32,
    transports: AtomicU32,
    sample: Mutex<SampleState>,
}

impl WorkerSlot {
    fn new(slot: usize, worker: Worker) -> Arc<Self> {
        let pid = worker.pid();
        Arc::new(Self {
            slot,
            worker,
            pid,
            online: AtomicBool::new(true),
            routers: AtomicU32::new(0),
            transports: AtomicU32::new(0),
            sample: Mutex::new(SampleState {
                cpu_percent: 0.0,
                score: 0.0,
                last_cpu_ms: None,
                last_sample: None,
            }),
        })
    }

    fn view(&self, score: f64, cpu_percent: f64) -> WorkerView {
        WorkerView {
            slot: self.slot,
            pid: self.pid,
            online: self.online.load(Ordering::Relaxed),
            routers: self.routers.load(Ordering::Relaxed),
            transports: self.transports.load(Ordering::Relaxed),
            cpu_percent,
            score,
        }
    }
}

/// Owns the media worker processes. Rooms stick to a worker by FNV-1a hash
/// of their id; overloaded or dead workers fail over to the least-loaded
/// live one.
pub struct WorkerPool {
    manager: WorkerManager,
    cfg: MediaConfig,
    slots: std::sync::Mutex<Vec<Arc<WorkerSlot>>>,
}

impl WorkerPool {
    /// Spawn one worker per logical CPU (or the configured count) and start
    /// the CPU sampler.
    pub async fn spawn(cfg: MediaConfig) -> anyhow::Result<Arc<Self>> {
        let manager = WorkerManager::new();
        let count = cfg
            .num_workers
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));

        let pool = Arc::new(Self {
            manager,
            cfg,
            slots: std::sync::Mutex::new(Vec::with_capacity(count)),
        });

        for slot in 0..count {
            let worker = pool.create_worker().await?;
            let record = WorkerSlot::new(slot, worker);
            pool.install_death_handler(&record);
            pool.slots.lock().unwrap().push(record);
        }
        tracing::info!(workers = count, "Media worker pool started");

        pool.spawn_sampler();
        Ok(pool)
    }

    async fn create_worker(&self) -> anyhow::Result<Worker> {
        let mut settings = WorkerSettings::default();
        settings.log_level = parse_log_level(&self.cfg.worker_log_level);
        settings.log_tags = vec![WorkerLogTag::Info, WorkerLogTag::Ice, WorkerLogTag::Dtls];
        let worker = self
            .manager
            .create_worker(settings)
            .await
            .map_err(|e| anyhow::anyhow!("failed to create media worker: {e}"))?;
        Ok(worker)
    }

    fn install_death_handler(self: &Arc<Self>, record: &Arc<WorkerSlot>) {
        let pool: Weak<WorkerPool> = Arc::downgrade(self);
        let slot = record.slot;
        let pid = record.pid;
        // Weak: the worker handle owns this callback, so a strong reference
        // back to the slot would never drop.
        let slot_ref = Arc::downgrade(record);
        record
            .worker
            .on_dead(move |reason| {
                if let Some(slot_record) = slot_ref.upgrade() {
                    slot_record.online.store(false, Ordering::Relaxed);
                }
                tracing::error!(slot, pid, ?reason, "Media worker died");
                if let Some(pool) = pool.upgrade() {
                    tokio::spawn(async move { pool.handle_worker_death(slot).await });
                }
            })
            .detach();
    }

    async fn handle_worker_death(self: Arc<Self>, slot: usize) {
        match self.cfg.worker_died_policy {
            WorkerDiedPolicy::Exit => {
                tracing::error!(slot, "Worker died and policy is exit, terminating process");
                std::process::exit(1);
            }
            WorkerDiedPolicy::Respawn => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                match self.create_worker().await {
                    Ok(worker) => {
                        let record = WorkerSlot::new(slot, worker);
                        self.install_death_handler(&record);
                        let pid = record.pid;
                        {
                            let mut slots = self.slots.lock().unwrap();
                            if let Some(entry) = slots.iter_mut().find(|s| s.slot == slot) {
                                *entry = Arc::clone(&record);
                            } else {
                                slots.push(Arc::clone(&record));
                            }
                        }
                        self.sample_one(&record).await;
                        tracing::info!(slot, pid, "Respawned media worker");
                    }
                    Err(e) => {
                        tracing::error!(slot, error = %e, "Failed to respawn media worker");
                    }
                }
            }
        }
    }

    fn spawn_sampler(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let period = Duration::from_millis(self.cfg.sampler_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { return };
                let slots: Vec<Arc<WorkerSlot>> = pool.slots.lock().unwrap().clone();
                for slot in slots {
                    pool.sample_one(&slot).await;
                }
            }
        });
    }

    async fn sample_one(&self, slot: &Arc<WorkerSlot>) {
        let now = Instant::now();
        let usage = slot.worker.get_resource_usage().await;
        let mut sample = slot.sample.lock().await;
        match usage {
            Ok(usage) => {
                let cpu_ms = usage.ru_utime + usage.ru_stime;
                if let (Some(prev_cpu), Some(prev_at)) = (sample.last_cpu_ms, sample.last_sample) {
                    let wall_ms = now.duration_since(prev_at).as_millis().max(1) as f64;
                    sample.cpu_percent = cpu_ms.saturating_sub(prev_cpu) as f64 / wall_ms;
                }
                sample.last_cpu_ms = Some(cpu_ms);
                sample.last_sample = Some(now);
                sample.score = score(
                    &self.cfg,
                    sample.cpu_percent,
                    slot.routers.load(Ordering::Relaxed),
                    slot.transports.load(Ordering::Relaxed),
                );
            }
            Err(e) => {
                tracing::warn!(pid = slot.pid, error = %e, "Worker resource sampling failed");
                sample.score = f64::INFINITY;
            }
        }
    }

    /// Deterministic worker for a room: FNV-1a of the room id modulo the
    /// live-worker count, falling back to the least-loaded live worker when
    /// the sticky choice is overloaded.
    pub async fn pick_for_room(&self, room_id: &str) -> Result<Worker, GatewayError> {
        let slots: Vec<Arc<WorkerSlot>> = self.slots.lock().unwrap().clone();
        let mut live = Vec::new();
        for slot in &slots {
            if slot.online.load(Ordering::Relaxed) {
                let score = slot.sample.lock().await.score;
                live.push((Arc::clone(slot), score));
            }
        }
        if live.is_empty() {
            return Err(GatewayError::NoWorkersAvailable);
        }

        let views: Vec<(usize, f64)> = live.iter().map(|(s, score)| (s.slot, *score)).collect();
        let chosen = pick_slot(room_id, &views, self.cfg.overload_threshold);
        let (slot, _) = live
            .into_iter()
            .find(|(s, _)| s.slot == chosen)
            .expect("picked slot is live");
        Ok(slot.worker.clone())
    }

    /// Cheapest live worker regardless of room affinity.
    pub async fn pick_least_loaded(&self) -> Result<Worker, GatewayError> {
        let slots: Vec<Arc<WorkerSlot>> = self.slots.lock().unwrap().clone();
        let mut best: Option<(Arc<WorkerSlot>, f64)> = None;
        for slot in slots {
            if !slot.online.load(Ordering::Relaxed) {
                continue;
            }
            let score = slot.sample.lock().await.score;
            match &best {
                Some((_, current)) if *current <= score => {}
                _ => best = Some((slot, score)),
            }
        }
        best.map(|(slot, _)| slot.worker.clone())
            .ok_or(GatewayError::NoWorkersAvailable)
    }

    pub fn inc_routers(&self, pid: u32, delta: i32) {
        self.bump(pid, delta, |slot| &slot.routers);
    }

    pub fn inc_transports(&self, pid: u32, delta: i32) {
        self.bump(pid, delta, |slot| &slot.transports);
    }

    fn bump(&self, pid: u32, delta: i32, field: impl Fn(&WorkerSlot) -> &AtomicU32) {
        let slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.iter().find(|s| s.pid == pid) {
            let counter = field(slot);
            if delta >= 0 {
                counter.fetch_add(delta as u32, Ordering::Relaxed);
            } else {
                let dec = (-delta) as u32;
                let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(dec))
                });
            }
        }
    }

    pub async fn views(&self) -> Vec<WorkerView> {
        let slots: Vec<Arc<WorkerSlot>> = self.slots.lock().unwrap().clone();
        let mut views = Vec::with_capacity(slots.len());
        for slot in slots {
            let sample = slot.sample.lock().await;
            views.push(slot.view(sample.score, sample.cpu_percent));
        }
        views
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.online.load(Ordering::Relaxed))
            .count()
    }
}

fn parse_log_level(level: &str) -> WorkerLogLevel {
    match level {
        "debug" => WorkerLogLevel::Debug,
        "warn" => WorkerLogLevel::Warn,
        "none" => WorkerLogLevel::None,
        _ => WorkerLogLevel::Error,
    }
}

fn score(cfg: &MediaConfig, cpu_percent: f64, routers: u32, transports: u32) -> f64 {
    cfg.weight_cpu * cpu_percent
        + cfg.weight_routers * routers as f64
        + cfg.weight_transports * transports as f64
}

pub fn fnv1a_32(input: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in input.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Selection over `(slot, score)` pairs of live workers.
fn pick_slot(room_id: &str, live: &[(usize, f64)], overload_threshold: f64) -> usize {
    let sticky = live[fnv1a_32(room_id) as usize % live.len()];
    if sticky.1 < overload_threshold {
        return sticky.0;
    }
    live.iter()
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(slot, _)| *slot)
        .unwrap_or(sticky.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        // Standard FNV-1a 32-bit test vectors.
        assert_eq!(fnv1a_32(""), 0x811c9dc5);
        assert_eq!(fnv1a_32("a"), 0xe40c292c);
        assert_eq!(fnv1a_32("foobar"), 0xbf9cf968);
    }

    #[test]
    fn sticky_pick_is_deterministic() {
        let live = vec![(0, 1.0), (1, 1.0), (2, 1.0)];
        let first = pick_slot("room-42", &live, 16.0);
        for _ in 0..10 {
            assert_eq!(pick_slot("room-42", &live, 16.0), first);
        }
    }

    #[test]
    fn overloaded_sticky_falls_back_to_least_loaded() {
        let room = "r1";
        let live = vec![(0, 100.0), (1, 100.0), (2, 100.0)];
        let sticky = pick_slot(room, &live, 1000.0);

        // Overload the sticky slot; selection must move to the cheapest.
        let mut loaded = live.clone();
        for entry in loaded.iter_mut() {
            entry.1 = if entry.0 == sticky { 50.0 } else { 5.0 };
        }
        let picked = pick_slot(room, &loaded, 16.0);
        assert_ne!(picked, sticky);
        assert_eq!(loaded.iter().find(|(s, _)| *s == picked).unwrap().1, 5.0);
    }

    #[test]
    fn infinite_scores_are_never_preferred() {
        // Whether the sticky hash lands on slot 0 (overloaded, falls back)
        // or slot 1 (healthy, sticks), the failed-sampling worker loses.
        let live = vec![(0, f64::INFINITY), (1, 2.0)];
        assert_eq!(pick_slot("any-room", &live, 16.0), 1);
    }

    #[test]
    fn score_weights_apply() {
        let cfg = MediaConfig::default();
        let value = score(&cfg, 0.5, 4, 10);
        let expected =
            cfg.weight_cpu * 0.5 + cfg.weight_routers * 4.0 + cfg.weight_transports * 10.0;
        assert!((value - expected).abs() < f64::EPSILON);
    }
}
