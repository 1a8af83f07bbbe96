//! Coordinator: owns the workers and the server links
//!
//! The coordinator constructs a fixed set of workers, maintains a
//! dynamic set of upstream transport links (plus inbound accepted
//! links), drains job factories into the least-loaded worker, detects
//! isolation, keeps a persistent connection to a root server, and acts
//! as the mesh-wide protocol message handler.

mod dispatch;

pub use dispatch::*;

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::{FactoryRegistry, Job, JobFactory, JobSink};
use crate::link::Link;
use crate::protocol::{
    decode_status, status_value, Envelope, EnvelopeKind, STATUS_KEY_PEERS, PARENT_RECEIVER,
};
use crate::transport::{
    SelfStatus, TransportConfig, TransportLink, TransportListener,
};
use crate::worker::{AddJobOutcome, Worker, WorkerTuning};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Coordinator construction parameters
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Mesh-wide id of this node
    pub node_id: String,

    /// Fixed number of workers, set at construction
    pub worker_count: usize,

    /// Tuning applied to every worker
    pub worker_tuning: WorkerTuning,

    /// Base tick interval
    pub base_tick: Duration,

    /// Tick slowdown factor while fully idle
    pub idle_tick_factor: u32,

    /// Consecutive zero-server ticks before the Isolated event
    pub isolation_threshold: u32,

    /// Task factories drained per tick
    pub max_tasks: usize,

    /// Jobs pulled per factory per tick, scaled by factory priority
    pub jobs_per_task: f32,

    /// Server link cap
    pub max_servers: usize,

    /// Same-address duplicates beyond which the older link is evicted
    pub dup_addr_threshold: usize,

    /// Inbound listen address; `None` disables the accept loop
    pub listen_addr: Option<SocketAddr>,

    /// Root server for the persistent-reconnect loop
    pub root_addr: Option<SocketAddr>,

    /// Shared transport secret; enables frame encryption when set
    pub secret: Option<String>,

    /// Transport link tuning
    pub transport: TransportConfig,

    /// Activity history ring size
    pub history_cap: usize,

    /// Dial servers learned from peer-list replies
    pub learn_peers: bool,

    /// Recently-seen task descriptor dedup window
    pub seen_tasks_cap: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", &Uuid::new_v4().to_string()[..8]),
            worker_count: 2,
            worker_tuning: WorkerTuning::default(),
            base_tick: Duration::from_millis(500),
            idle_tick_factor: 10,
            isolation_threshold: 200,
            max_tasks: 4,
            jobs_per_task: 1.0,
            max_servers: 8,
            dup_addr_threshold: 2,
            listen_addr: None,
            root_addr: None,
            secret: None,
            transport: TransportConfig::default(),
            history_cap: 1024,
            learn_peers: true,
            seen_tasks_cap: 64,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────

/// Events surfaced to the embedding binary
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// The inbound TCP listener is bound
    ListenerReady { addr: SocketAddr },

    /// A server link was added
    ServerConnected { addr: SocketAddr },

    /// A server link went away
    ServerLost { addr: SocketAddr, permanent: bool },

    /// No servers for `isolation_threshold` consecutive ticks
    Isolated { idle_ticks: u32 },

    /// A task factory was registered from the mesh
    TaskAccepted { task_id: String },

    /// A task descriptor was refused
    TaskRejected { reason: String },

    /// Periodic activity summary
    Activity {
        mean_activity: f64,
        queued: usize,
        completed: u64,
        servers: usize,
    },
}

// ─────────────────────────────────────────────────────────────────
// Worker-facing Handle
// ─────────────────────────────────────────────────────────────────

/// Commands workers send to their coordinator
#[derive(Debug)]
pub enum CoordinatorCommand {
    /// Relay a popped job upstream (or back into local assignment)
    RelayUpstream { from_worker: String, encoded: String },

    /// Run the connection handshake for a new peer link
    RequestPeerLink {
        worker_id: String,
        reply: oneshot::Sender<Option<Link>>,
    },

    /// A peer link was dropped after a send failure
    LinkFailed {
        worker_id: String,
        remote_worker_id: String,
    },
}

/// Explicit back-reference from workers to their coordinator: a
/// command channel plus the shared parent-activity reading. No global
/// state is involved.
#[derive(Clone)]
pub struct CoordinatorHandle {
    command_tx: mpsc::Sender<CoordinatorCommand>,
    parent_activity: Arc<RwLock<f64>>,
}

impl CoordinatorHandle {
    /// A handle wired to nothing; upstream operations fail softly.
    /// Useful for standalone workers and tests.
    pub fn detached() -> Self {
        let (command_tx, _) = mpsc::channel(1);
        Self {
            command_tx,
            parent_activity: Arc::new(RwLock::new(1.0)),
        }
    }

    /// Mean activity rating the upstream servers last reported
    pub fn parent_activity(&self) -> f64 {
        *self.parent_activity.read()
    }

    /// Hand a job to the coordinator for upstream relay
    pub async fn relay_upstream(&self, from_worker: &str, encoded: String) -> Result<()> {
        self.command_tx
            .send(CoordinatorCommand::RelayUpstream {
                from_worker: from_worker.to_string(),
                encoded,
            })
            .await
            .map_err(|_| Error::Internal("coordinator command channel closed".to_string()))
    }

    /// Run the peer-link handshake; `None` on refusal or timeout
    pub async fn request_peer_link(&self, worker_id: &str) -> Option<Link> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(CoordinatorCommand::RequestPeerLink {
                worker_id: worker_id.to_string(),
                reply: reply_tx,
            })
            .await
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    /// Non-blocking notification of a dropped peer link
    pub fn link_failed(&self, worker_id: &str, remote_worker_id: &str) {
        let _ = self.command_tx.try_send(CoordinatorCommand::LinkFailed {
            worker_id: worker_id.to_string(),
            remote_worker_id: remote_worker_id.to_string(),
        });
    }
}

// ─────────────────────────────────────────────────────────────────
// Transport Bridge
// ─────────────────────────────────────────────────────────────────

/// Signals bridged from transport listener callbacks into the
/// coordinator's dispatch loop
enum TransportSignal {
    Envelope(Arc<TransportLink>, Envelope),
    Disconnected(Arc<TransportLink>, bool),
}

/// Listener registered on every transport link; forwards into the
/// dispatch channel without blocking the receive loop
struct CoordinatorListener {
    signal_tx: mpsc::Sender<TransportSignal>,
}

impl TransportListener for CoordinatorListener {
    fn on_envelope(&self, link: &Arc<TransportLink>, envelope: Envelope) {
        if self
            .signal_tx
            .try_send(TransportSignal::Envelope(Arc::clone(link), envelope))
            .is_err()
        {
            warn!(peer = %link.peer_addr(), "Dispatch queue full, envelope dropped");
        }
    }

    fn on_disconnected(&self, link: &Arc<TransportLink>, permanent: bool) {
        let _ = self
            .signal_tx
            .try_send(TransportSignal::Disconnected(Arc::clone(link), permanent));
    }
}

// ─────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────

/// Owns a fixed worker set plus the server transport links
pub struct Coordinator {
    config: CoordinatorConfig,
    workers: Vec<Arc<Worker>>,

    servers: RwLock<Vec<Arc<TransportLink>>>,
    accepted: RwLock<Vec<Arc<TransportLink>>>,
    pending_connects: Mutex<HashSet<SocketAddr>>,

    tasks: Mutex<Vec<Box<dyn JobFactory>>>,
    seen_tasks: Mutex<VecDeque<String>>,
    default_factory: Mutex<Option<Box<dyn JobFactory>>>,

    registry: Arc<FactoryRegistry>,
    resolver: Arc<dyn ResourceResolver>,

    self_status: Arc<SelfStatus>,
    parent_activity: Arc<RwLock<f64>>,
    history: Mutex<VecDeque<f64>>,
    idle_ticks: AtomicU32,

    event_tx: mpsc::Sender<MeshEvent>,
    signal_tx: mpsc::Sender<TransportSignal>,
    signal_rx: Mutex<Option<mpsc::Receiver<TransportSignal>>>,
    command_rx: Mutex<Option<mpsc::Receiver<CoordinatorCommand>>>,
    handle: CoordinatorHandle,

    shutdown: Arc<AtomicBool>,
}

impl Coordinator {
    /// Construct the coordinator and its fixed worker set. Returns
    /// the mesh event stream alongside.
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<FactoryRegistry>,
        resolver: Arc<dyn ResourceResolver>,
        sink: Arc<dyn JobSink>,
    ) -> (Arc<Self>, mpsc::Receiver<MeshEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(64);
        let (signal_tx, signal_rx) = mpsc::channel(256);

        let parent_activity = Arc::new(RwLock::new(1.0));
        let handle = CoordinatorHandle {
            command_tx,
            parent_activity: Arc::clone(&parent_activity),
        };
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers: Vec<Arc<Worker>> = (0..config.worker_count.max(1))
            .map(|i| {
                Worker::new(
                    format!("{}-w{}", config.node_id, i),
                    config.worker_tuning.clone(),
                    Arc::clone(&registry),
                    Arc::clone(&sink),
                    handle.clone(),
                    Arc::clone(&shutdown),
                )
            })
            .collect();

        let coordinator = Arc::new(Self {
            workers,
            servers: RwLock::new(Vec::new()),
            accepted: RwLock::new(Vec::new()),
            pending_connects: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
            seen_tasks: Mutex::new(VecDeque::new()),
            default_factory: Mutex::new(None),
            registry,
            resolver,
            self_status: Arc::new(SelfStatus::default()),
            parent_activity,
            history: Mutex::new(VecDeque::new()),
            idle_ticks: AtomicU32::new(0),
            event_tx,
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            command_rx: Mutex::new(Some(command_rx)),
            handle,
            shutdown,
            config,
        });

        (coordinator, event_rx)
    }

    // ─────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn server_count(&self) -> usize {
        self.servers.read().iter().filter(|s| !s.is_closed()).count()
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    pub fn registry(&self) -> &Arc<FactoryRegistry> {
        &self.registry
    }

    pub(crate) fn resolver(&self) -> &Arc<dyn ResourceResolver> {
        &self.resolver
    }

    /// Number of active task factories
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether a task factory with this id is active
    pub fn has_task(&self, task_id: &str) -> bool {
        self.tasks.lock().iter().any(|t| t.task_id() == task_id)
    }

    /// Install the node's own job source
    pub fn set_default_factory(&self, factory: Box<dyn JobFactory>) {
        *self.default_factory.lock() = Some(factory);
    }

    /// Recent mean-activity samples, newest last
    pub fn activity_history(&self) -> Vec<f64> {
        self.history.lock().iter().copied().collect()
    }

    /// Request all loops to stop
    pub fn trigger_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        if self.event_tx.try_send(event).is_err() {
            debug!("Event channel full, event dropped");
        }
    }

    fn make_listener(&self) -> Arc<dyn TransportListener> {
        Arc::new(CoordinatorListener {
            signal_tx: self.signal_tx.clone(),
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Startup
    // ─────────────────────────────────────────────────────────────

    /// Start every loop: workers, dispatch, commands, main tick, and
    /// the optional accept and root-reconnect loops.
    pub fn start(self: &Arc<Self>) {
        for worker in &self.workers {
            worker.start();
        }

        if let Some(signal_rx) = self.signal_rx.lock().take() {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                coordinator.run_signal_loop(signal_rx).await;
            });
        }

        if let Some(command_rx) = self.command_rx.lock().take() {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                coordinator.run_command_loop(command_rx).await;
            });
        }

        {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                coordinator.run_tick_loop().await;
            });
        }

        if let Some(listen_addr) = self.config.listen_addr {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                coordinator.run_accept_loop(listen_addr).await;
            });
        }

        if let Some(root_addr) = self.config.root_addr {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                coordinator.run_root_loop(root_addr).await;
            });
        }

        info!(
            node_id = %self.config.node_id,
            workers = self.workers.len(),
            "Coordinator started"
        );
    }

    // ─────────────────────────────────────────────────────────────
    // Server Set
    // ─────────────────────────────────────────────────────────────

    /// Dial an upstream server and adopt the link
    pub async fn connect_server(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<TransportLink>> {
        {
            let mut pending = self.pending_connects.lock();
            if !pending.insert(addr) {
                return Err(Error::Connection(format!("already connecting to {addr}")));
            }
        }

        let result = async {
            let link = TransportLink::outbound(
                addr,
                self.config.node_id.clone(),
                self.config.secret.as_deref(),
                Arc::clone(&self.self_status),
                self.config.transport.clone(),
            )?;
            link.add_listener(self.make_listener());
            link.attach().await?;
            Ok::<_, Error>(link)
        }
        .await;

        self.pending_connects.lock().remove(&addr);

        let link = result?;
        self.add_server(Arc::clone(&link)).await;
        Ok(link)
    }

    /// Adopt a server link, evicting older duplicates of the same
    /// resolved address once they reach the duplicate threshold.
    pub async fn add_server(self: &Arc<Self>, link: Arc<TransportLink>) {
        let addr = link.peer_addr();
        let evicted: Vec<Arc<TransportLink>> = {
            let mut servers = self.servers.write();
            servers.retain(|s| !s.is_closed());
            servers.push(Arc::clone(&link));

            let mut evicted = Vec::new();
            let same_addr: Vec<usize> = servers
                .iter()
                .enumerate()
                .filter(|(_, s)| s.peer_addr() == addr)
                .map(|(i, _)| i)
                .collect();
            if same_addr.len() >= self.config.dup_addr_threshold {
                // Keep the newest, evict the earlier duplicates
                for &idx in same_addr[..same_addr.len() - 1].iter().rev() {
                    evicted.push(servers.remove(idx));
                }
            }

            while servers.len() > self.config.max_servers {
                evicted.push(servers.remove(0));
            }
            evicted
        };

        for old in evicted {
            info!(addr = %old.peer_addr(), "Evicting duplicate server link");
            old.close().await;
        }

        self.emit(MeshEvent::ServerConnected { addr });
    }

    /// Remove and close one server link
    async fn drop_server(&self, link: &Arc<TransportLink>) {
        self.servers.write().retain(|s| s.id() != link.id());
        link.close().await;
    }

    /// Random non-closed server link
    fn pick_server(&self) -> Option<Arc<TransportLink>> {
        let servers = self.servers.read();
        let live: Vec<&Arc<TransportLink>> =
            servers.iter().filter(|s| !s.is_closed()).collect();
        if live.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..live.len());
        Some(Arc::clone(live[idx]))
    }

    // ─────────────────────────────────────────────────────────────
    // Job Assignment
    // ─────────────────────────────────────────────────────────────

    /// Assign a job to the least-loaded worker (highest activity
    /// rating, ties broken randomly); falls through to the next-best
    /// worker on a visible rejection.
    pub fn assign_job(&self, job: Box<dyn Job>) -> bool {
        let mut rated: Vec<(f64, usize)> = self
            .workers
            .iter()
            .enumerate()
            .map(|(i, w)| (w.activity_rating(), i))
            .collect();
        rated.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        // Random choice among the equally least-loaded
        let top = rated[0].0;
        let tie_count = rated.iter().take_while(|(r, _)| (top - r).abs() < 1e-9).count();
        if tie_count > 1 {
            rated[..tie_count].shuffle(&mut rand::thread_rng());
        }

        let encoded = job.encode();
        let task_id = job.task_id().to_string();
        let mut candidate = Some(job);

        for (_, idx) in rated {
            let job = match candidate.take() {
                Some(job) => job,
                None => match self.registry.decode_job(&encoded) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "Job re-decode failed");
                        return false;
                    }
                },
            };
            match self.workers[idx].add_job(job) {
                AddJobOutcome::Queued | AddJobOutcome::Duplicate => return true,
                AddJobOutcome::Rejected => continue,
            }
        }

        warn!(task_id = %task_id, "Every worker refused the job");
        false
    }

    // ─────────────────────────────────────────────────────────────
    // Main Tick
    // ─────────────────────────────────────────────────────────────

    /// One coordinator tick: refresh status, detect isolation, drain
    /// factories, assign jobs.
    pub async fn tick(self: &Arc<Self>) {
        for worker in &self.workers {
            let snap = worker.snapshot();
            tracing::trace!(
                worker = %snap.id,
                queued = snap.queued,
                peers = snap.peers,
                sleep_ms = snap.sleep_ms,
                completed = snap.completed_jobs,
                errored = snap.errored_jobs,
                relayed = snap.relayed_jobs,
                "Worker state"
            );
        }

        // Self-reported status for periodic piggyback broadcasts
        let ratings: Vec<f64> = self.workers.iter().map(|w| w.activity_rating()).collect();
        let mean_activity = ratings.iter().sum::<f64>() / ratings.len().max(1) as f64;
        let mean_jobtime = {
            let total: f64 = self.workers.iter().map(|w| w.mean_job_time_ms()).sum();
            total / self.workers.len().max(1) as f64
        };
        self.self_status.set(mean_jobtime, mean_activity);

        // Parent activity from the servers' last reports
        {
            let servers = self.servers.read();
            let reports: Vec<f64> = servers
                .iter()
                .map(|s| s.peer_status())
                .filter(|p| p.updated)
                .map(|p| p.activity)
                .collect();
            let parent = if reports.is_empty() {
                1.0
            } else {
                reports.iter().sum::<f64>() / reports.len() as f64
            };
            *self.parent_activity.write() = parent;
        }

        {
            let mut history = self.history.lock();
            while history.len() >= self.config.history_cap {
                history.pop_front();
            }
            history.push_back(mean_activity);
        }

        // Isolation detection
        if self.server_count() == 0 {
            let idle = self.idle_ticks.fetch_add(1, Ordering::Relaxed) + 1;
            if idle > self.config.isolation_threshold {
                warn!(idle_ticks = idle, "Node is isolated from the mesh");
                self.emit(MeshEvent::Isolated { idle_ticks: idle });
                self.idle_ticks.store(0, Ordering::Relaxed);
            }
        } else {
            self.idle_ticks.store(0, Ordering::Relaxed);
        }

        // Drain factories into the workers
        let mut produced: Vec<Box<dyn Job>> = Vec::new();
        {
            let mut default_factory = self.default_factory.lock();
            if let Some(factory) = default_factory.as_mut() {
                produced.extend(drain_factory(
                    factory.as_mut(),
                    self.config.jobs_per_task,
                ));
                if factory.is_complete() {
                    info!(task_id = %factory.task_id(), "Default factory complete");
                    *default_factory = None;
                }
            }
        }
        {
            let mut tasks = self.tasks.lock();
            let limit = tasks.len().min(self.config.max_tasks);
            for factory in tasks.iter_mut().take(limit) {
                produced.extend(drain_factory(factory.as_mut(), self.config.jobs_per_task));
            }
            tasks.retain(|t| {
                if t.is_complete() {
                    info!(task_id = %t.task_id(), "Task factory complete");
                    false
                } else {
                    true
                }
            });
        }
        for job in produced {
            self.assign_job(job);
        }

        let queued: usize = self.workers.iter().map(|w| w.queue_len()).sum();
        let completed: u64 = self.workers.iter().map(|w| w.completed_jobs()).sum();
        self.emit(MeshEvent::Activity {
            mean_activity,
            queued,
            completed,
            servers: self.server_count(),
        });
    }

    async fn run_tick_loop(self: Arc<Self>) {
        info!("Coordinator tick loop started");
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.tick().await;

            let fully_idle = self.server_count() == 0
                && self.tasks.lock().is_empty()
                && self.default_factory.lock().is_none();
            let interval = if fully_idle {
                self.config.base_tick * self.config.idle_tick_factor.max(1)
            } else {
                self.config.base_tick
            };
            tokio::time::sleep(interval).await;
        }
        debug!("Coordinator tick loop stopped");
    }

    // ─────────────────────────────────────────────────────────────
    // Signal & Command Loops
    // ─────────────────────────────────────────────────────────────

    async fn run_signal_loop(self: Arc<Self>, mut signal_rx: mpsc::Receiver<TransportSignal>) {
        while let Some(signal) = signal_rx.recv().await {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match signal {
                TransportSignal::Envelope(link, envelope) => {
                    self.handle_envelope(&link, envelope).await;
                }
                TransportSignal::Disconnected(link, permanent) => {
                    self.handle_disconnect(&link, permanent);
                }
            }
        }
        debug!("Signal loop stopped");
    }

    fn handle_disconnect(&self, link: &Arc<TransportLink>, permanent: bool) {
        let addr = link.peer_addr();
        self.servers.write().retain(|s| s.id() != link.id());
        self.accepted.write().retain(|s| s.id() != link.id());

        let mut dropped_links = 0;
        for worker in &self.workers {
            dropped_links += worker.drop_links_for_transport(link.id());
        }

        info!(
            addr = %addr,
            permanent,
            dropped_links,
            "Transport link disconnected"
        );
        self.emit(MeshEvent::ServerLost { addr, permanent });
    }

    async fn run_command_loop(self: Arc<Self>, mut command_rx: mpsc::Receiver<CoordinatorCommand>) {
        while let Some(command) = command_rx.recv().await {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match command {
                CoordinatorCommand::RelayUpstream {
                    from_worker,
                    encoded,
                } => {
                    self.relay_upstream(&from_worker, encoded).await;
                }
                CoordinatorCommand::RequestPeerLink { worker_id, reply } => {
                    let link = self.request_peer_link(&worker_id).await;
                    let _ = reply.send(link);
                }
                CoordinatorCommand::LinkFailed {
                    worker_id,
                    remote_worker_id,
                } => {
                    debug!(
                        worker = %worker_id,
                        remote = %remote_worker_id,
                        "Peer link reported failed"
                    );
                }
            }
        }
        debug!("Command loop stopped");
    }

    /// Relay a worker's job to a random server, falling back to local
    /// reassignment when the mesh is unreachable
    async fn relay_upstream(self: &Arc<Self>, from_worker: &str, encoded: String) {
        if let Some(server) = self.pick_server() {
            let envelope = Envelope::new(EnvelopeKind::Job, from_worker)
                .with_payload(encoded.clone())
                .addressed_to(PARENT_RECEIVER);
            match server.send(envelope).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(addr = %server.peer_addr(), error = %e, "Upstream relay failed, dropping server");
                    self.drop_server(&server).await;
                }
            }
        }

        match self.registry.decode_job(&encoded) {
            Ok(job) => {
                self.assign_job(job);
            }
            Err(e) => warn!(error = %e, "Relayed job could not be decoded"),
        }
    }

    /// Round-trip connection handshake through a random server
    async fn request_peer_link(self: &Arc<Self>, worker_id: &str) -> Option<Link> {
        let server = self.pick_server()?;

        let envelope = Envelope::new(EnvelopeKind::ConnectionRequest, worker_id)
            .with_payload(worker_id)
            .addressed_to(PARENT_RECEIVER);

        match server.request(envelope).await {
            Some(reply) => {
                let remote = reply.payload_str();
                if remote.is_empty() || remote == "false" {
                    debug!(worker = %worker_id, "Peer link refused by remote");
                    None
                } else {
                    debug!(worker = %worker_id, remote = %remote, "Peer link established");
                    Some(Link::new(worker_id, remote, &server))
                }
            }
            None => {
                // Handshake timed out; the server link is suspect
                warn!(addr = %server.peer_addr(), "Connection handshake timed out, dropping server");
                self.drop_server(&server).await;
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Accept Loop
    // ─────────────────────────────────────────────────────────────

    async fn run_accept_loop(self: Arc<Self>, listen_addr: SocketAddr) {
        let listener = match TcpListener::bind(listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %listen_addr, error = %e, "Failed to bind listener");
                return;
            }
        };
        let bound = listener.local_addr().unwrap_or(listen_addr);
        info!(addr = %bound, "Mesh listener ready");
        self.emit(MeshEvent::ListenerReady { addr: bound });

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(peer = %peer_addr, "Inbound connection");
                    match TransportLink::accepted(
                        stream,
                        self.config.node_id.clone(),
                        self.config.secret.as_deref(),
                        Arc::clone(&self.self_status),
                        self.config.transport.clone(),
                    ) {
                        Ok(link) => {
                            link.add_listener(self.make_listener());
                            link.start_receive();
                            self.accepted.write().push(link);
                        }
                        Err(e) => {
                            warn!(peer = %peer_addr, error = %e, "Inbound link setup failed");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        debug!("Accept loop stopped");
    }

    // ─────────────────────────────────────────────────────────────
    // Root Reconnect Loop
    // ─────────────────────────────────────────────────────────────

    /// Persistently re-dial the root server while no servers are
    /// connected
    async fn run_root_loop(self: Arc<Self>, root_addr: SocketAddr) {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            if self.server_count() == 0 {
                match self.connect_server(root_addr).await {
                    Ok(link) => {
                        info!(addr = %root_addr, "Root server connected");
                        backoff.reset();
                        if self.config.learn_peers {
                            self.learn_peers_from(&link).await;
                        }
                    }
                    Err(e) => {
                        warn!(addr = %root_addr, error = %e, "Root connect failed");
                    }
                }
            } else {
                backoff.reset();
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
        debug!("Root reconnect loop stopped");
    }

    /// Query a server for the peers it knows (blocking exchange)
    pub async fn query_peers(&self, link: &Arc<TransportLink>) -> Vec<String> {
        let envelope = Envelope::new(
            EnvelopeKind::ServerStatusQuery,
            self.config.node_id.clone(),
        )
        .with_payload("peers")
        .addressed_to(PARENT_RECEIVER);

        let Some(reply) = link.request(envelope).await else {
            return Vec::new();
        };

        let pairs = decode_status(reply.payload_str());
        match status_value(&pairs, STATUS_KEY_PEERS) {
            Some(list) => list
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Resolve a resource name through a random server (blocking
    /// exchange); `None` on timeout or when the peer cannot resolve it
    pub async fn request_resource(&self, name: &str) -> Option<String> {
        let server = self.pick_server()?;
        let envelope = Envelope::new(
            EnvelopeKind::ResourceRequest,
            self.config.node_id.clone(),
        )
        .with_payload(name)
        .addressed_to(PARENT_RECEIVER);

        let reply = server.request(envelope).await?;
        let uri = reply.payload_str();
        if uri.is_empty() {
            None
        } else {
            Some(uri.to_string())
        }
    }

    /// Ask a server for its peer list and dial previously unknown
    /// addresses, bounded by the server cap
    async fn learn_peers_from(self: &Arc<Self>, link: &Arc<TransportLink>) {
        for addr_str in self.query_peers(link).await {
            if self.server_count() >= self.config.max_servers {
                break;
            }
            let Ok(addr) = addr_str.parse::<SocketAddr>() else {
                debug!(addr = %addr_str, "Unparseable peer address ignored");
                continue;
            };
            let already = self
                .servers
                .read()
                .iter()
                .any(|s| s.peer_addr() == addr && !s.is_closed());
            if already {
                continue;
            }
            if let Err(e) = self.connect_server(addr).await {
                debug!(addr = %addr, error = %e, "Learned peer connect failed");
            }
        }
    }
}

/// Pull up to `jobs_per_task * priority` jobs from one factory
fn drain_factory(factory: &mut dyn JobFactory, jobs_per_task: f32) -> Vec<Box<dyn Job>> {
    let count = ((jobs_per_task * factory.priority()).ceil() as usize).max(1);
    let mut jobs = Vec::new();
    for _ in 0..count {
        match factory.next_job() {
            Some(job) => jobs.push(job),
            None => break,
        }
    }
    jobs
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{register_mock, MockJobFactory, NullSink};

    fn make_coordinator(config: CoordinatorConfig) -> (Arc<Coordinator>, mpsc::Receiver<MeshEvent>) {
        let registry = Arc::new(FactoryRegistry::new());
        register_mock(&registry).unwrap();
        Coordinator::new(
            config,
            registry,
            Arc::new(StaticResolver::default()),
            Arc::new(NullSink),
        )
    }

    #[tokio::test]
    async fn test_dedup_evicts_older_same_addr_links() {
        let (coordinator, _events) = make_coordinator(CoordinatorConfig::default());
        let addr: SocketAddr = "127.0.0.1:9400".parse().unwrap();

        for _ in 0..3 {
            let link = TransportLink::outbound(
                addr,
                "node-test",
                None,
                Arc::new(SelfStatus::default()),
                TransportConfig::default(),
            )
            .unwrap();
            coordinator.add_server(link).await;
        }

        assert_eq!(coordinator.server_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_addresses_coexist() {
        let (coordinator, _events) = make_coordinator(CoordinatorConfig::default());

        for port in [9401u16, 9402, 9403] {
            let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
            let link = TransportLink::outbound(
                addr,
                "node-test",
                None,
                Arc::new(SelfStatus::default()),
                TransportConfig::default(),
            )
            .unwrap();
            coordinator.add_server(link).await;
        }

        assert_eq!(coordinator.server_count(), 3);
    }

    #[tokio::test]
    async fn test_five_jobs_balance_across_two_workers() {
        let config = CoordinatorConfig {
            worker_count: 2,
            worker_tuning: WorkerTuning {
                max_jobs: 4,
                ..WorkerTuning::default()
            },
            jobs_per_task: 1.0,
            ..CoordinatorConfig::default()
        };
        let (coordinator, _events) = make_coordinator(config);

        // Freeze the workers' execution loops so queue sizes are stable
        coordinator.trigger_shutdown();

        coordinator.set_default_factory(Box::new(MockJobFactory::new("balance", 5)));
        for _ in 0..5 {
            coordinator.tick().await;
        }

        let q0 = coordinator.workers()[0].queue_len();
        let q1 = coordinator.workers()[1].queue_len();
        assert_eq!(q0 + q1, 5, "all five jobs assigned");
        assert!(q0.abs_diff(q1) <= 1, "queues differ by more than one: {q0} vs {q1}");
    }

    #[tokio::test]
    async fn test_completed_default_factory_is_removed() {
        let (coordinator, _events) = make_coordinator(CoordinatorConfig::default());
        coordinator.trigger_shutdown();

        coordinator.set_default_factory(Box::new(MockJobFactory::new("small", 1)));
        coordinator.tick().await;
        coordinator.tick().await;

        assert!(coordinator.default_factory.lock().is_none());
    }

    #[tokio::test]
    async fn test_assign_falls_through_on_rejection() {
        let config = CoordinatorConfig {
            worker_count: 2,
            worker_tuning: WorkerTuning {
                max_jobs: 1, // hard bound 2 per worker
                ..WorkerTuning::default()
            },
            ..CoordinatorConfig::default()
        };
        let (coordinator, _events) = make_coordinator(config);
        coordinator.trigger_shutdown();

        let mut factory = MockJobFactory::new("fill", 5);
        let mut accepted = 0;
        while let Some(job) = crate::job::JobFactory::next_job(&mut factory) {
            if coordinator.assign_job(job) {
                accepted += 1;
            }
        }

        // 2 + 2 slots exist; the fifth job is refused everywhere
        assert_eq!(accepted, 4);
        let total: usize = coordinator.workers().iter().map(|w| w.queue_len()).sum();
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn test_isolation_counter_fires_event() {
        let config = CoordinatorConfig {
            isolation_threshold: 3,
            ..CoordinatorConfig::default()
        };
        let (coordinator, mut events) = make_coordinator(config);
        coordinator.trigger_shutdown();

        for _ in 0..5 {
            coordinator.tick().await;
        }

        let mut isolated = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, MeshEvent::Isolated { .. }) {
                isolated = true;
            }
        }
        assert!(isolated);
    }

    #[test]
    fn test_drain_factory_respects_priority() {
        let mut factory = MockJobFactory::new("p", 10);
        crate::job::JobFactory::set(&mut factory, "priority", "2.0").unwrap();

        let jobs = drain_factory(&mut factory, 1.0);
        assert_eq!(jobs.len(), 2);

        let mut low = MockJobFactory::new("q", 10);
        crate::job::JobFactory::set(&mut low, "priority", "0.1").unwrap();
        let jobs = drain_factory(&mut low, 1.0);
        assert_eq!(jobs.len(), 1); // floor of one job per drained factory
    }

    // ───────────────────────────────────────────────────────────
    // Two-node scenarios over localhost
    // ───────────────────────────────────────────────────────────

    use crate::job::MockJob;
    use crate::protocol::encode_kill;

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            base_tick: Duration::from_millis(50),
            worker_tuning: WorkerTuning {
                min_sleep: Duration::from_millis(50),
                exec_idle: Duration::from_millis(100),
                connect_p: 0.0, // keep discovery out of deterministic tests
                ..WorkerTuning::default()
            },
            ..CoordinatorConfig::default()
        }
    }

    /// Start a node with an inbound listener and wait for its address
    async fn start_listening_node() -> (Arc<Coordinator>, mpsc::Receiver<MeshEvent>, SocketAddr) {
        let config = CoordinatorConfig {
            listen_addr: Some("127.0.0.1:0".parse().unwrap()),
            ..fast_config()
        };
        let (coordinator, mut events) = make_coordinator(config);
        coordinator.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let addr = loop {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .expect("listener did not come up")
                .expect("event stream closed");
            if let MeshEvent::ListenerReady { addr } = event {
                break addr;
            }
        };
        (coordinator, events, addr)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        condition()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_repeated_connects_leave_one_server() {
        let (_server, _sev, addr) = start_listening_node().await;
        let (client, _cev) = make_coordinator(fast_config());
        client.start();

        for _ in 0..3 {
            client.connect_server(addr).await.unwrap();
        }

        assert_eq!(client.server_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_handshake_builds_links_on_both_sides() {
        let (server, _sev, addr) = start_listening_node().await;
        let (client, _cev) = make_coordinator(fast_config());
        client.start();
        client.connect_server(addr).await.unwrap();

        let link = client.handle().request_peer_link("ext-w0").await;
        let link = link.expect("handshake failed");

        // The remote side picked one of its workers and linked it back
        let linked = server
            .workers()
            .iter()
            .any(|w| w.has_link_to("ext-w0"));
        assert!(linked);
        assert_eq!(link.local_worker_id(), "ext-w0");
        assert!(link.remote_worker_id().starts_with(server.node_id()));

        // The remote worker answers the liveness probe
        assert!(link.confirm().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_job_relayed_upstream_is_executed() {
        let (server, _sev, addr) = start_listening_node().await;
        let (client, _cev) = make_coordinator(fast_config());
        client.start();
        client.connect_server(addr).await.unwrap();

        let job = MockJob::new("remote-task", 0);
        client
            .handle()
            .relay_upstream("ext-w0", job.encode())
            .await
            .unwrap();

        let done = wait_until(
            || server.workers().iter().map(|w| w.completed_jobs()).sum::<u64>() >= 1,
            Duration::from_secs(10),
        )
        .await;
        assert!(done, "job never completed on the remote node");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_task_and_kill_propagate() {
        let (server, _sev, addr) = start_listening_node().await;
        let (client, _cev) = make_coordinator(fast_config());
        client.start();
        let transport = client.connect_server(addr).await.unwrap();

        // Register a long-running task on the remote node
        let descriptor = MockJobFactory::new("killme", 10_000).encode();
        transport
            .send(
                Envelope::new(EnvelopeKind::Task, client.node_id())
                    .with_payload(descriptor)
                    .addressed_to(PARENT_RECEIVER),
            )
            .await
            .unwrap();

        let registered = wait_until(|| server.has_task("killme"), Duration::from_secs(5)).await;
        assert!(registered, "task never registered");

        // Kill it mesh-wide with a relay budget
        transport
            .send(
                Envelope::new(EnvelopeKind::Kill, client.node_id())
                    .with_payload(encode_kill("killme", 2))
                    .addressed_to(PARENT_RECEIVER),
            )
            .await
            .unwrap();

        let removed = wait_until(|| !server.has_task("killme"), Duration::from_secs(5)).await;
        assert!(removed, "task survived the kill");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resource_resolution_over_mesh() {
        let registry = Arc::new(FactoryRegistry::new());
        register_mock(&registry).unwrap();
        let mut entries = std::collections::HashMap::new();
        entries.insert("model".to_string(), "file:///srv/base.bin".to_string());

        let (server, mut events) = Coordinator::new(
            CoordinatorConfig {
                listen_addr: Some("127.0.0.1:0".parse().unwrap()),
                ..fast_config()
            },
            registry,
            Arc::new(StaticResolver::new(entries)),
            Arc::new(NullSink),
        );
        server.start();
        let addr = loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("listener did not come up")
                .expect("event stream closed")
            {
                MeshEvent::ListenerReady { addr } => break addr,
                _ => continue,
            }
        };

        let (client, _cev) = make_coordinator(fast_config());
        client.start();
        client.connect_server(addr).await.unwrap();

        let uri = client.request_resource("model").await;
        assert_eq!(uri.as_deref(), Some("file:///srv/base.bin"));
        assert!(client.request_resource("missing").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_peer_list_query_excludes_requester() {
        let (_far, _fev, far_addr) = start_listening_node().await;
        let (near, _nev, near_addr) = start_listening_node().await;
        near.connect_server(far_addr).await.unwrap();

        let (client, _cev) = make_coordinator(fast_config());
        client.start();
        let link = client.connect_server(near_addr).await.unwrap();

        let peers = client.query_peers(&link).await;
        assert_eq!(peers, vec![far_addr.to_string()]);
    }

    #[tokio::test]
    async fn test_detached_handle_fails_softly() {
        let handle = CoordinatorHandle::detached();
        assert!(handle.relay_upstream("w", "mock|task:=t".to_string()).await.is_err());
        assert!(handle.request_peer_link("w").await.is_none());
        assert_eq!(handle.parent_activity(), 1.0);
    }
}
