//! Worker: queues and executes jobs, maintains peer links
//!
//! Each worker runs two loops: an adaptive tick loop (sleep pacing,
//! peer discovery, probabilistic job relay) and a lazily-started job
//! execution loop. They synchronize only on the shared job queue.

mod queue;

pub use queue::*;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::CoordinatorHandle;
use crate::job::{FactoryRegistry, Job, JobSink};
use crate::link::Link;

// ─────────────────────────────────────────────────────────────────
// Tuning
// ─────────────────────────────────────────────────────────────────

/// Tunable coefficients for one worker
#[derive(Debug, Clone)]
pub struct WorkerTuning {
    /// Target queue capacity; the hard bound is twice this
    pub max_jobs: usize,

    /// Queue floor below which no relaying happens
    pub min_jobs: usize,

    /// Peer link capacity
    pub max_peers: usize,

    /// Failed-job retry buffer capacity
    pub max_failed_jobs: usize,

    /// Relay probability slope over queue occupancy
    pub relay_p: f64,

    /// Peer discovery probability at zero peers
    pub connect_p: f64,

    /// Relay probability floor once the queue is above `min_jobs`
    pub min_job_p: f64,

    /// Weight of peer-link occupancy in the relay probability
    pub peer_relay_c: f64,

    /// Probability of relaying upstream instead of to a peer
    pub parental_relay_p: f64,

    /// Denominator coefficient of the activity rating
    pub activity_c: f64,

    /// Numerator of the sleep multiplier
    pub activity_sleep_c: f64,

    /// Offset added to activity in the sleep multiplier denominator
    pub activity_sleep_offset: f64,

    /// Weight of the parent-activity term in the sleep multiplier
    pub peer_activity_sleep_c: f64,

    /// Sleep ceiling as a multiple of `min_sleep`
    pub max_sleep_c: f64,

    /// Sleep floor
    pub min_sleep: Duration,

    /// Idle pause of the execution loop when no job is available
    pub exec_idle: Duration,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        Self {
            max_jobs: 8,
            min_jobs: 2,
            max_peers: 8,
            max_failed_jobs: 16,
            relay_p: 0.4,
            connect_p: 0.25,
            min_job_p: 0.05,
            peer_relay_c: 0.2,
            parental_relay_p: 0.3,
            activity_c: 1.0,
            activity_sleep_c: 1.0,
            activity_sleep_offset: 0.25,
            peer_activity_sleep_c: 0.5,
            max_sleep_c: 8.0,
            min_sleep: Duration::from_millis(250),
            exec_idle: Duration::from_secs(5),
        }
    }
}

/// Activity rating for a given queue length: > 1 when idle, < 1 when
/// congested, strictly decreasing in queue size.
pub fn activity_rating(queue_len: usize, tuning: &WorkerTuning) -> f64 {
    let max_jobs = tuning.max_jobs.max(1) as f64;
    1.0 + (tuning.min_jobs as f64 - queue_len as f64) / (tuning.activity_c * max_jobs)
}

/// Recompute the sleep interval from the current one. Always lands in
/// `[min_sleep, min_sleep * max_sleep_c]`.
pub fn compute_next_sleep(
    current: Duration,
    activity: f64,
    parent_activity_ratio: f64,
    tuning: &WorkerTuning,
) -> Duration {
    let floor = tuning.min_sleep.as_secs_f64();
    let ceiling = floor * tuning.max_sleep_c.max(1.0);

    let denom = (activity + tuning.activity_sleep_offset).max(0.05);
    let multiplier = tuning.activity_sleep_c / denom
        - tuning.peer_activity_sleep_c * (1.0 - parent_activity_ratio).max(0.0);

    let next = if multiplier.is_finite() && multiplier > 0.0 {
        current.as_secs_f64() * multiplier
    } else {
        floor
    };

    Duration::from_secs_f64(next.clamp(floor, ceiling))
}

// ─────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────

/// Point-in-time view of a worker, for events and diagnostics
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: String,
    pub queued: usize,
    pub failed: usize,
    pub peers: usize,
    pub activity: f64,
    pub sleep_ms: u64,
    pub completed_jobs: u64,
    pub errored_jobs: u64,
    pub relayed_jobs: u64,
}

// ─────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────

/// A unit that queues and executes jobs and maintains peer links
pub struct Worker {
    id: String,
    tuning: WorkerTuning,
    queue: JobQueue,
    failed: FailedJobBuffer,
    links: RwLock<Vec<Link>>,

    sleep_ms: AtomicU64,
    completed_jobs: AtomicU64,
    errored_jobs: AtomicU64,
    relayed_jobs: AtomicU64,
    work_time_ms: AtomicU64,
    comm_time_ms: AtomicU64,

    registry: Arc<FactoryRegistry>,
    sink: Arc<dyn JobSink>,
    coordinator: CoordinatorHandle,

    exec_running: AtomicBool,
    job_notify: tokio::sync::Notify,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        tuning: WorkerTuning,
        registry: Arc<FactoryRegistry>,
        sink: Arc<dyn JobSink>,
        coordinator: CoordinatorHandle,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let sleep_ms = tuning.min_sleep.as_millis() as u64;
        Arc::new(Self {
            id: id.into(),
            queue: JobQueue::new(tuning.max_jobs * 2),
            failed: FailedJobBuffer::new(tuning.max_failed_jobs),
            links: RwLock::new(Vec::new()),
            sleep_ms: AtomicU64::new(sleep_ms),
            completed_jobs: AtomicU64::new(0),
            errored_jobs: AtomicU64::new(0),
            relayed_jobs: AtomicU64::new(0),
            work_time_ms: AtomicU64::new(0),
            comm_time_ms: AtomicU64::new(0),
            registry,
            sink,
            coordinator,
            exec_running: AtomicBool::new(false),
            job_notify: tokio::sync::Notify::new(),
            shutdown,
            tuning,
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.read().len()
    }

    pub fn completed_jobs(&self) -> u64 {
        self.completed_jobs.load(Ordering::Relaxed)
    }

    pub fn errored_jobs(&self) -> u64 {
        self.errored_jobs.load(Ordering::Relaxed)
    }

    pub fn relayed_jobs(&self) -> u64 {
        self.relayed_jobs.load(Ordering::Relaxed)
    }

    pub fn current_sleep_ms(&self) -> u64 {
        self.sleep_ms.load(Ordering::Relaxed)
    }

    /// Mean execution time per completed job, in milliseconds
    pub fn mean_job_time_ms(&self) -> f64 {
        let completed = self.completed_jobs.load(Ordering::Relaxed);
        if completed == 0 {
            0.0
        } else {
            self.work_time_ms.load(Ordering::Relaxed) as f64 / completed as f64
        }
    }

    /// Current activity rating from queue occupancy
    pub fn activity_rating(&self) -> f64 {
        activity_rating(self.queue.len(), &self.tuning)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            queued: self.queue.len(),
            failed: self.failed.len(),
            peers: self.link_count(),
            activity: self.activity_rating(),
            sleep_ms: self.current_sleep_ms(),
            completed_jobs: self.completed_jobs(),
            errored_jobs: self.errored_jobs(),
            relayed_jobs: self.relayed_jobs(),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Job Intake
    // ─────────────────────────────────────────────────────────────

    /// Queue a job for execution. Duplicates are a logged no-op and a
    /// full queue refuses visibly. The execution loop starts lazily
    /// on the first accepted job.
    pub fn add_job(self: &Arc<Self>, job: Box<dyn Job>) -> AddJobOutcome {
        let task_id = job.task_id().to_string();
        let outcome = self.queue.push(job);
        match outcome {
            AddJobOutcome::Queued => {
                self.ensure_exec_loop();
                self.job_notify.notify_one();
            }
            AddJobOutcome::Duplicate => {
                debug!(worker = %self.id, task_id = %task_id, "Duplicate job ignored");
            }
            AddJobOutcome::Rejected => {
                warn!(
                    worker = %self.id,
                    task_id = %task_id,
                    capacity = self.queue.capacity(),
                    "Job rejected, queue full"
                );
            }
        }
        outcome
    }

    fn ensure_exec_loop(self: &Arc<Self>) {
        if !self.exec_running.swap(true, Ordering::SeqCst) {
            let worker = Arc::clone(self);
            tokio::spawn(async move {
                worker.run_exec_loop().await;
            });
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Links
    // ─────────────────────────────────────────────────────────────

    /// Adopt a new peer link, refusing beyond the peer cap
    pub fn add_link(&self, link: Link) -> bool {
        let mut links = self.links.write();
        if links.len() >= self.tuning.max_peers {
            return false;
        }
        if links
            .iter()
            .any(|l| l.remote_worker_id() == link.remote_worker_id())
        {
            return false;
        }
        debug!(worker = %self.id, remote = %link.remote_worker_id(), "Peer link added");
        links.push(link);
        true
    }

    /// Whether this worker already has a link to `remote_worker_id`
    pub fn has_link_to(&self, remote_worker_id: &str) -> bool {
        self.links
            .read()
            .iter()
            .any(|l| l.remote_worker_id() == remote_worker_id)
    }

    /// Drop the link to one remote worker and tell the coordinator
    pub fn drop_link(&self, remote_worker_id: &str) {
        let mut links = self.links.write();
        let before = links.len();
        links.retain(|l| l.remote_worker_id() != remote_worker_id);
        if links.len() < before {
            debug!(worker = %self.id, remote = %remote_worker_id, "Peer link dropped");
            self.coordinator.link_failed(&self.id, remote_worker_id);
        }
    }

    /// Drop every link riding on a disconnected transport
    pub fn drop_links_for_transport(&self, transport_id: Uuid) -> usize {
        let mut links = self.links.write();
        let before = links.len();
        links.retain(|l| l.transport_id() != transport_id);
        before - links.len()
    }

    // ─────────────────────────────────────────────────────────────
    // Kill Fan-out
    // ─────────────────────────────────────────────────────────────

    /// Remove a task's jobs locally, then relay the kill to peers
    /// with a decremented count; relaying stops at zero.
    pub async fn kill(&self, task_id: &str, relay_count: u32) {
        let removed = self.queue.remove_task(task_id) + self.failed.remove_task(task_id);
        if removed > 0 {
            info!(worker = %self.id, task_id, removed, "Task jobs purged");
        }

        if relay_count == 0 {
            return;
        }

        let snapshot: Vec<Link> = self.links.read().clone();
        for link in snapshot {
            if let Err(e) = link.send_kill(task_id, relay_count - 1).await {
                debug!(
                    worker = %self.id,
                    remote = %link.remote_worker_id(),
                    error = %e,
                    "Kill relay failed"
                );
                self.drop_link(link.remote_worker_id());
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Tick Loop
    // ─────────────────────────────────────────────────────────────

    /// Start the adaptive tick loop
    pub fn start(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            info!(worker = %worker.id, "Worker tick loop started");
            loop {
                if worker.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                worker.tick().await;
                let sleep_ms = worker.sleep_ms.load(Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            }
            debug!(worker = %worker.id, "Worker tick loop stopped");
        });
    }

    /// One tick: rate, repace, discover, relay
    pub async fn tick(self: &Arc<Self>) {
        let activity = self.activity_rating();

        // Sleep recompute against the parent's reported activity
        let parent_ratio = self.coordinator.parent_activity() / activity.max(0.05);
        let current = Duration::from_millis(self.sleep_ms.load(Ordering::Relaxed));
        let next = compute_next_sleep(current, activity, parent_ratio, &self.tuning);
        self.sleep_ms
            .store(next.as_millis() as u64, Ordering::Relaxed);

        // Peer discovery, damped by how full the peer set already is
        let peers = self.link_count();
        if peers < self.tuning.max_peers {
            let p = self.tuning.connect_p * (1.0 - peers as f64 / self.tuning.max_peers as f64);
            if rand::thread_rng().gen::<f64>() < p {
                let started = Instant::now();
                if let Some(link) = self.coordinator.request_peer_link(&self.id).await {
                    if !self.add_link(link) {
                        debug!(worker = %self.id, "Discovered link discarded (cap or duplicate)");
                    }
                }
                self.comm_time_ms
                    .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
            }
        }

        // Relay decision
        let queue_len = self.queue.len();
        if queue_len > self.tuning.min_jobs {
            let r = self.relay_probability(queue_len);
            if rand::thread_rng().gen::<f64>() < r {
                if let Some(job) = self.queue.pop() {
                    self.relay(job).await;
                }
            }
        }
    }

    /// Relay probability: ramps linearly above `min_jobs`, roughly
    /// doubling past `max_jobs`, plus a peer-occupancy term.
    fn relay_probability(&self, queue_len: usize) -> f64 {
        let t = &self.tuning;
        let span = t.max_jobs.saturating_sub(t.min_jobs).max(1) as f64;
        let occupancy = ((queue_len as f64 - t.min_jobs as f64) / span).min(2.0);
        let peer_term = t.peer_relay_c * self.link_count() as f64 / t.max_peers.max(1) as f64;
        (t.min_job_p + t.relay_p * occupancy + peer_term).clamp(0.0, 1.0)
    }

    /// Hand one job to the parent or to a weighted-sampled peer
    async fn relay(self: &Arc<Self>, job: Box<dyn Job>) {
        let no_peers = self.link_count() == 0;
        let parental =
            no_peers || rand::thread_rng().gen::<f64>() < self.tuning.parental_relay_p;

        if parental {
            match self.coordinator.relay_upstream(&self.id, job.encode()).await {
                Ok(()) => {
                    self.relayed_jobs.fetch_add(1, Ordering::Relaxed);
                    debug!(worker = %self.id, task_id = %job.task_id(), "Job relayed upstream");
                }
                Err(_) => {
                    // Coordinator gone; keep the job
                    let _ = self.queue.push(job);
                }
            }
            return;
        }

        let link = match self.pick_peer() {
            Some(link) => link,
            None => {
                let _ = self.queue.push(job);
                return;
            }
        };

        let started = Instant::now();
        match link.send_job(job.as_ref()).await {
            Ok(()) => {
                self.relayed_jobs.fetch_add(1, Ordering::Relaxed);
                self.comm_time_ms
                    .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                debug!(
                    worker = %self.id,
                    remote = %link.remote_worker_id(),
                    task_id = %job.task_id(),
                    "Job relayed to peer"
                );
            }
            Err(e) => {
                warn!(
                    worker = %self.id,
                    remote = %link.remote_worker_id(),
                    error = %e,
                    "Peer send failed, dropping link"
                );
                self.drop_link(link.remote_worker_id());
                let _ = self.queue.push(job);
            }
        }
    }

    /// Weighted random peer choice: weight is how much less loaded the
    /// peer claims to be; degenerate weights fall back to uniform.
    fn pick_peer(&self) -> Option<Link> {
        let links: Vec<Link> = self.links.read().clone();
        if links.is_empty() {
            return None;
        }

        let weights: Vec<f64> = links
            .iter()
            .map(|l| (1.0 - l.remote_activity()).max(0.0))
            .collect();
        let total: f64 = weights.iter().sum();

        let mut rng = rand::thread_rng();
        if !total.is_finite() || total <= 0.0 {
            let idx = rng.gen_range(0..links.len());
            return links.into_iter().nth(idx);
        }

        let mut draw = rng.gen::<f64>() * total;
        for (link, weight) in links.iter().zip(&weights) {
            draw -= weight;
            if draw <= 0.0 {
                return Some(link.clone());
            }
        }
        links.into_iter().last()
    }

    // ─────────────────────────────────────────────────────────────
    // Execution Loop
    // ─────────────────────────────────────────────────────────────

    async fn run_exec_loop(self: Arc<Self>) {
        info!(worker = %self.id, "Job execution loop started");
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let job = self.queue.pop().or_else(|| self.next_retry());
            match job {
                Some(job) => {
                    let started = Instant::now();
                    match job.run(self.sink.as_ref()).await {
                        Ok(()) => {
                            self.completed_jobs.fetch_add(1, Ordering::Relaxed);
                            self.work_time_ms
                                .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            // Keep the job for a later retry, bounded
                            self.errored_jobs.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                worker = %self.id,
                                task_id = %job.task_id(),
                                error = %e,
                                "Job failed, retained for retry"
                            );
                            self.failed.push(job.task_id(), job.encode());
                            // Pace retries so a permanently failing job
                            // cannot spin the loop hot
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.job_notify.notified() => {}
                        _ = tokio::time::sleep(self.tuning.exec_idle) => {}
                    }
                }
            }
        }
        debug!(worker = %self.id, "Job execution loop stopped");
    }

    /// Next decodable entry from the failed-job buffer
    fn next_retry(&self) -> Option<Box<dyn Job>> {
        while let Some(entry) = self.failed.pop() {
            match self.registry.decode_job(&entry.encoded) {
                Ok(job) => return Some(job),
                Err(e) => {
                    warn!(
                        worker = %self.id,
                        task_id = %entry.task_id,
                        error = %e,
                        "Undecodable retry entry dropped"
                    );
                    self.errored_jobs.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("queued", &self.queue.len())
            .field("peers", &self.link_count())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{register_mock, MockJob, NullSink};

    fn make_worker(tuning: WorkerTuning) -> Arc<Worker> {
        let registry = Arc::new(FactoryRegistry::new());
        register_mock(&registry).unwrap();
        Worker::new(
            "w-test",
            tuning,
            registry,
            Arc::new(NullSink),
            CoordinatorHandle::detached(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_activity_strictly_decreasing() {
        let tuning = WorkerTuning::default();
        let mut previous = f64::INFINITY;
        for queue_len in 0..=(tuning.max_jobs * 2) {
            let rating = activity_rating(queue_len, &tuning);
            assert!(rating < previous, "rating not decreasing at {queue_len}");
            previous = rating;
        }
    }

    #[test]
    fn test_activity_sign_around_min_jobs() {
        let tuning = WorkerTuning::default();
        assert!(activity_rating(0, &tuning) > 1.0);
        assert_eq!(activity_rating(tuning.min_jobs, &tuning), 1.0);
        assert!(activity_rating(tuning.max_jobs, &tuning) < 1.0);
    }

    #[test]
    fn test_sleep_always_clamped() {
        let tuning = WorkerTuning::default();
        let floor = tuning.min_sleep;
        let ceiling = tuning.min_sleep.mul_f64(tuning.max_sleep_c);

        let mut sleep = tuning.min_sleep;
        for queue_len in [0usize, 1, 2, 4, 8, 12, 16, 16, 0, 16, 0] {
            let activity = activity_rating(queue_len, &tuning);
            for ratio in [0.0, 0.5, 1.0, 2.0] {
                sleep = compute_next_sleep(sleep, activity, ratio, &tuning);
                assert!(sleep >= floor, "sleep below floor for q={queue_len}");
                assert!(sleep <= ceiling, "sleep above ceiling for q={queue_len}");
            }
        }
    }

    #[tokio::test]
    async fn test_add_job_duplicate_is_idempotent() {
        let worker = make_worker(WorkerTuning::default());

        assert_eq!(
            worker.add_job(Box::new(MockJob::new("t", 0))),
            AddJobOutcome::Queued
        );
        let len_after_first = worker.queue_len();
        assert_eq!(
            worker.add_job(Box::new(MockJob::new("t", 0))),
            AddJobOutcome::Duplicate
        );
        assert_eq!(worker.queue_len(), len_after_first);
    }

    #[tokio::test]
    async fn test_add_job_rejects_when_full() {
        let tuning = WorkerTuning {
            max_jobs: 2, // hard bound 4
            ..WorkerTuning::default()
        };
        let worker = make_worker(tuning);

        for seq in 0..4 {
            assert_eq!(
                worker.add_job(Box::new(MockJob::new("t", seq))),
                AddJobOutcome::Queued
            );
        }
        assert_eq!(
            worker.add_job(Box::new(MockJob::new("t", 99))),
            AddJobOutcome::Rejected
        );
        assert_eq!(worker.queue_len(), 4);
    }

    #[test]
    fn test_relay_probability_ramps_and_saturates() {
        let worker = make_worker(WorkerTuning::default());
        let t = WorkerTuning::default();

        let at_min = worker.relay_probability(t.min_jobs);
        let at_max = worker.relay_probability(t.max_jobs);
        let beyond = worker.relay_probability(t.max_jobs * 2);

        assert!(at_min < at_max);
        assert!(at_max < beyond);
        assert!(beyond <= 1.0);
    }

    #[tokio::test]
    async fn test_kill_purges_queue_and_buffer() {
        let worker = make_worker(WorkerTuning::default());

        worker.add_job(Box::new(MockJob::new("doomed", 0)));
        worker.add_job(Box::new(MockJob::new("doomed", 1)));
        worker.add_job(Box::new(MockJob::new("keeper", 0)));
        worker.failed.push("doomed", MockJob::new("doomed", 7).encode());

        worker.kill("doomed", 0).await;

        assert_eq!(worker.queue_len(), 1);
        assert!(worker.failed.is_empty());
    }

    #[tokio::test]
    async fn test_exec_loop_runs_and_retries() {
        let worker = make_worker(WorkerTuning::default());

        worker.add_job(Box::new(MockJob::new("ok", 0)));
        worker.add_job(Box::new(MockJob::new("bad", 1).failing()));

        // Give the lazily-started loop time to drain both jobs
        for _ in 0..50 {
            if worker.completed_jobs() >= 1 && worker.errored_jobs() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(worker.completed_jobs(), 1);
        // The failing job errored and landed in the retry buffer
        assert!(worker.errored_jobs() >= 1);
    }

    #[test]
    fn test_link_cap_enforced() {
        let tuning = WorkerTuning {
            max_peers: 1,
            ..WorkerTuning::default()
        };
        let worker = make_worker(tuning);

        let transport = crate::transport::TransportLink::outbound(
            "127.0.0.1:1".parse().unwrap(),
            "node-a",
            None,
            Arc::new(crate::transport::SelfStatus::default()),
            crate::transport::TransportConfig::default(),
        )
        .unwrap();

        assert!(worker.add_link(Link::new("w-test", "r1", &transport)));
        assert!(!worker.add_link(Link::new("w-test", "r2", &transport)));
        assert!(!worker.add_link(Link::new("w-test", "r1", &transport)));
        assert_eq!(worker.link_count(), 1);

        assert_eq!(worker.drop_links_for_transport(transport.id()), 1);
        assert_eq!(worker.link_count(), 0);
    }
}
