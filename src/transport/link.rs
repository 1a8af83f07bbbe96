//! TransportLink: one socket connection to a remote node
//!
//! Owns the TCP stream, frames (and optionally encrypts) envelopes,
//! runs the receive loop, queues outbound sends until the link is
//! attached, reconnects on stream corruption, measures round-trip
//! time, and broadcasts connect/disconnect/message events to
//! listeners.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{
    encode_status, Envelope, EnvelopeKind, PARENT_RECEIVER, STATUS_KEY_ACTIVITY,
    STATUS_KEY_JOBTIME,
};

use super::crypto::FrameCipher;
use super::frame::{read_frame, write_frame};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Tuning for one transport link
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout for establishing (and re-establishing) the socket
    pub connect_timeout: Duration,

    /// Deadline for a correlated reply in request/response exchanges
    pub reply_timeout: Duration,

    /// Poll interval while waiting for a correlated reply
    pub reply_poll_interval: Duration,

    /// Idle time without inbound bytes before a confirmation probe
    pub idle_timeout: Duration,

    /// Consecutive reconnect attempts before permanent disconnect
    pub max_reconnect_attempts: u32,

    /// Delay between reconnect attempts
    pub reconnect_delay: Duration,

    /// Capacity of the inbound reply store (drop-oldest beyond this)
    pub inbox_capacity: usize,

    /// Fire a background ping/status probe every this many received messages
    pub ping_every_messages: u64,

    /// Payload size of the periodic ping probe
    pub ping_payload_len: usize,

    /// Deadline for the periodic ping probe
    pub ping_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(10),
            reply_poll_interval: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(45),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(500),
            inbox_capacity: 100,
            ping_every_messages: 40,
            ping_payload_len: 64,
            ping_timeout: Duration::from_secs(5),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Link State
// ─────────────────────────────────────────────────────────────────

/// Lifecycle state of a transport link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created but not attached; outbound sends are queued
    Connecting,
    /// Attached; writes go directly to the socket
    Connected,
    /// Stream corrupted; re-dialing the same address
    Reconnecting,
    /// Permanently closed
    Closed,
}

// ─────────────────────────────────────────────────────────────────
// Listeners
// ─────────────────────────────────────────────────────────────────

/// Callbacks fired by a transport link.
///
/// Invoked from the receive loop with a snapshot of the listener set,
/// so a listener may add or remove listeners (or drop the link)
/// reentrantly. Implementations must not block; hand work off to a
/// channel or task.
pub trait TransportListener: Send + Sync {
    /// The link attached (or re-attached after a reconnect)
    fn on_connected(&self, _link: &Arc<TransportLink>) {}

    /// An envelope arrived
    fn on_envelope(&self, link: &Arc<TransportLink>, envelope: Envelope);

    /// The link went down; `permanent` means the reconnect budget is spent
    fn on_disconnected(&self, link: &Arc<TransportLink>, permanent: bool);
}

// ─────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────

/// Self-reported node status piggybacked on periodic probes
#[derive(Debug, Default)]
pub struct SelfStatus {
    inner: RwLock<(f64, f64)>, // (jobtime_ms, activity)
}

impl SelfStatus {
    pub fn set(&self, jobtime_ms: f64, activity: f64) {
        *self.inner.write() = (jobtime_ms, activity);
    }

    pub fn get(&self) -> (f64, f64) {
        *self.inner.read()
    }
}

/// Last status the remote peer reported over this link
#[derive(Debug, Clone, Copy)]
pub struct PeerStatus {
    pub jobtime_ms: f64,
    pub activity: f64,
    pub updated: bool,
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self {
            jobtime_ms: 0.0,
            activity: 1.0,
            updated: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Transport Link
// ─────────────────────────────────────────────────────────────────

/// One socket connection with framing, optional encryption, queueing
/// and bounded reconnection
pub struct TransportLink {
    id: Uuid,
    local_id: String,
    peer_addr: SocketAddr,
    /// Dial-back address; `None` for accepted links (no reconnect)
    dial_addr: Option<SocketAddr>,
    cipher: Option<FrameCipher>,
    config: TransportConfig,

    state: RwLock<LinkState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader_slot: Mutex<Option<OwnedReadHalf>>,

    /// Outbound queue, active only while Connecting
    pending: Mutex<VecDeque<Envelope>>,

    /// Bounded inbound store used for correlated replies
    inbox: Mutex<VecDeque<Envelope>>,

    listeners: RwLock<Vec<Arc<dyn TransportListener>>>,

    self_status: Arc<SelfStatus>,
    peer_status: RwLock<PeerStatus>,

    messages_in: AtomicU64,
    window_count: AtomicU64,
    window_start: Mutex<Instant>,
    last_rtt_ms: AtomicI64,
    outstanding_pings: Mutex<HashSet<String>>,

    shutdown: AtomicBool,
    disconnect_notified: AtomicBool,
}

impl TransportLink {
    // ─────────────────────────────────────────────────────────────
    // Construction
    // ─────────────────────────────────────────────────────────────

    fn build(
        local_id: String,
        peer_addr: SocketAddr,
        dial_addr: Option<SocketAddr>,
        secret: Option<&str>,
        self_status: Arc<SelfStatus>,
        config: TransportConfig,
        state: LinkState,
    ) -> Result<Arc<Self>> {
        // A bad secret aborts construction of this one link only
        let cipher = secret.map(FrameCipher::from_secret).transpose()?;
        if let Some(ref c) = cipher {
            debug!(peer = %peer_addr, key = %c.fingerprint(), "Link secured");
        }

        Ok(Arc::new(Self {
            id: Uuid::new_v4(),
            local_id,
            peer_addr,
            dial_addr,
            cipher,
            config,
            state: RwLock::new(state),
            writer: tokio::sync::Mutex::new(None),
            reader_slot: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            inbox: Mutex::new(VecDeque::new()),
            listeners: RwLock::new(Vec::new()),
            self_status,
            peer_status: RwLock::new(PeerStatus::default()),
            messages_in: AtomicU64::new(0),
            window_count: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
            last_rtt_ms: AtomicI64::new(-1),
            outstanding_pings: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
            disconnect_notified: AtomicBool::new(false),
        }))
    }

    /// Create an outbound link in the Connecting state. Sends issued
    /// before [`attach`](Self::attach) completes are queued FIFO.
    pub fn outbound(
        addr: SocketAddr,
        local_id: impl Into<String>,
        secret: Option<&str>,
        self_status: Arc<SelfStatus>,
        config: TransportConfig,
    ) -> Result<Arc<Self>> {
        Self::build(
            local_id.into(),
            addr,
            Some(addr),
            secret,
            self_status,
            config,
            LinkState::Connecting,
        )
    }

    /// Dial the peer, flush the outbound queue, and start the receive
    /// loop. Listeners registered before this call never miss events.
    pub async fn attach(self: &Arc<Self>) -> Result<()> {
        let addr = self
            .dial_addr
            .ok_or_else(|| Error::Internal("attach on accepted link".to_string()))?;

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::connection_timeout(addr.to_string(), self.config.connect_timeout.as_secs())
            })?
            .map_err(|e| Error::connection_failed(addr.to_string(), e.to_string()))?;

        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *self.reader_slot.lock() = Some(read_half);

        self.flush_pending().await?;
        self.set_state(LinkState::Connected);
        // Drain anything queued in the window before the state flip
        self.flush_pending().await?;

        self.start_receive();
        self.notify_connected();

        info!(peer = %addr, link_id = %self.id, "Transport link attached");
        Ok(())
    }

    /// Convenience: outbound + attach in one call
    pub async fn connect(
        addr: SocketAddr,
        local_id: impl Into<String>,
        secret: Option<&str>,
        self_status: Arc<SelfStatus>,
        config: TransportConfig,
    ) -> Result<Arc<Self>> {
        let link = Self::outbound(addr, local_id, secret, self_status, config)?;
        link.attach().await?;
        Ok(link)
    }

    /// Wrap an accepted socket. The receive loop is not started yet so
    /// the caller can register listeners first; call
    /// [`start_receive`](Self::start_receive) when ready.
    pub fn accepted(
        stream: TcpStream,
        local_id: impl Into<String>,
        secret: Option<&str>,
        self_status: Arc<SelfStatus>,
        config: TransportConfig,
    ) -> Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let link = Self::build(
            local_id.into(),
            peer_addr,
            None,
            secret,
            self_status,
            config,
            LinkState::Connected,
        )?;
        *link.reader_slot.lock() = Some(read_half);
        // No contention before the link escapes this function
        *link.writer.try_lock().expect("fresh link writer") = Some(write_half);

        Ok(link)
    }

    /// Spawn the receive loop on the stored read half
    pub fn start_receive(self: &Arc<Self>) {
        let reader = self.reader_slot.lock().take();
        if let Some(reader) = reader {
            let link = Arc::clone(self);
            tokio::spawn(async move {
                link.run_receive_loop(reader).await;
            });
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    pub fn messages_in(&self) -> u64 {
        self.messages_in.load(Ordering::Relaxed)
    }

    /// Last measured round-trip time in milliseconds, -1 if unknown
    pub fn last_rtt_ms(&self) -> i64 {
        self.last_rtt_ms.load(Ordering::Relaxed)
    }

    /// Inbound message rate over the current window (messages/sec)
    pub fn message_rate(&self) -> f64 {
        let elapsed = {
            let mut start = self.window_start.lock();
            let elapsed = start.elapsed();
            if elapsed > Duration::from_secs(60) {
                *start = Instant::now();
                self.window_count.store(0, Ordering::Relaxed);
                return 0.0;
            }
            elapsed
        };
        let count = self.window_count.load(Ordering::Relaxed) as f64;
        if elapsed.as_secs_f64() < 0.001 {
            0.0
        } else {
            count / elapsed.as_secs_f64()
        }
    }

    pub fn peer_status(&self) -> PeerStatus {
        *self.peer_status.read()
    }

    /// Record the status the peer reported (recognized keys only)
    pub fn set_peer_status(&self, jobtime_ms: Option<f64>, activity: Option<f64>) {
        let mut status = self.peer_status.write();
        if let Some(j) = jobtime_ms {
            status.jobtime_ms = j;
        }
        if let Some(a) = activity {
            status.activity = a;
        }
        status.updated = true;
    }

    pub fn add_listener(&self, listener: Arc<dyn TransportListener>) {
        self.listeners.write().push(listener);
    }

    fn set_state(&self, state: LinkState) {
        *self.state.write() = state;
    }

    // ─────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────

    /// Send an envelope. Queued while Connecting, written directly
    /// under the write lock otherwise.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        match self.state() {
            LinkState::Closed => Err(Error::LinkClosed(self.peer_addr.to_string())),
            LinkState::Reconnecting => Err(Error::ConnectionLost {
                message: format!("link to {} is reconnecting", self.peer_addr),
            }),
            LinkState::Connecting => {
                self.pending.lock().push_back(envelope);
                Ok(())
            }
            LinkState::Connected => self.write_now(envelope).await,
        }
    }

    /// Serialize, encrypt and write one envelope under the write lock
    async fn write_now(&self, envelope: Envelope) -> Result<()> {
        let tag = envelope.wire_tag();
        let mut body = envelope
            .to_bytes()
            .map_err(|e| Error::Protocol(e.to_string()))?;
        if let Some(ref cipher) = self.cipher {
            body = cipher.seal(&body)?;
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionLost {
            message: format!("no socket to {}", self.peer_addr),
        })?;
        write_frame(writer, tag, &body).await
    }

    /// Drain the outbound queue in FIFO order
    async fn flush_pending(&self) -> Result<()> {
        loop {
            let batch: Vec<Envelope> = {
                let mut pending = self.pending.lock();
                pending.drain(..).collect()
            };
            if batch.is_empty() {
                return Ok(());
            }
            for envelope in batch {
                self.write_now(envelope).await?;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Request/Response
    // ─────────────────────────────────────────────────────────────

    /// Send a request envelope and poll the reply inbox for a
    /// correlated answer until the reply deadline. Returns `None` on
    /// timeout, send failure, or for fire-and-forget kinds.
    pub async fn request(&self, envelope: Envelope) -> Option<Envelope> {
        let matcher = reply_matcher(&envelope)?;
        let deadline = Instant::now() + self.config.reply_timeout;

        if let Err(e) = self.send(envelope).await {
            debug!(peer = %self.peer_addr, error = %e, "Request send failed");
            return None;
        }

        loop {
            if let Some(reply) = self.take_reply(&*matcher) {
                return Some(reply);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.config.reply_poll_interval).await;
        }
    }

    /// Remove and return the first inbox envelope matching `matcher`
    fn take_reply(&self, matcher: &(dyn Fn(&Envelope) -> bool + Send + Sync)) -> Option<Envelope> {
        let mut inbox = self.inbox.lock();
        let idx = inbox.iter().position(|e| matcher(e))?;
        inbox.remove(idx)
    }

    fn push_inbox(&self, envelope: Envelope) {
        let mut inbox = self.inbox.lock();
        while inbox.len() >= self.config.inbox_capacity {
            inbox.pop_front();
        }
        inbox.push_back(envelope);
    }

    // ─────────────────────────────────────────────────────────────
    // Ping
    // ─────────────────────────────────────────────────────────────

    /// Measure round-trip time with a random payload of `size`
    /// characters. Returns elapsed milliseconds, or -1 on
    /// timeout/error.
    pub async fn ping(&self, size: usize, timeout: Duration) -> i64 {
        let payload: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(size)
            .map(char::from)
            .collect();

        self.outstanding_pings.lock().insert(payload.clone());

        let envelope = Envelope::new(EnvelopeKind::Ping, self.local_id.as_str())
            .with_payload(payload.clone())
            .addressed_to(PARENT_RECEIVER);

        let start = Instant::now();
        let mut rtt_ms: i64 = -1;

        if self.send(envelope).await.is_ok() {
            let deadline = start + timeout;
            loop {
                let matched = self.take_reply(&|e: &Envelope| {
                    e.kind == EnvelopeKind::Ping && e.payload_str() == payload
                });
                if matched.is_some() {
                    rtt_ms = start.elapsed().as_millis() as i64;
                    break;
                }
                if Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(self.config.reply_poll_interval).await;
            }
        }

        self.outstanding_pings.lock().remove(&payload);
        if rtt_ms >= 0 {
            self.last_rtt_ms.store(rtt_ms, Ordering::Relaxed);
        }
        rtt_ms
    }

    /// Fire-and-forget broadcast of the local job-time/activity rating
    pub async fn broadcast_status(&self) -> Result<()> {
        let (jobtime_ms, activity) = self.self_status.get();
        let payload = encode_status(&[
            (STATUS_KEY_JOBTIME, format!("{jobtime_ms:.1}")),
            (STATUS_KEY_ACTIVITY, format!("{activity:.4}")),
        ]);
        let envelope = Envelope::new(EnvelopeKind::ServerStatus, self.local_id.as_str())
            .with_payload(payload)
            .addressed_to(PARENT_RECEIVER);
        self.send(envelope).await
    }

    // ─────────────────────────────────────────────────────────────
    // Receive Loop
    // ─────────────────────────────────────────────────────────────

    async fn run_receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            match tokio::time::timeout(self.config.idle_timeout, read_frame(&mut reader)).await {
                // Idle: probe the peer; a failed write means the
                // socket is gone and we take the reconnect path
                Err(_elapsed) => {
                    debug!(peer = %self.peer_addr, "Idle timeout, probing");
                    let probe = Envelope::new(
                        EnvelopeKind::ConnectionConfirmation,
                        self.local_id.as_str(),
                    )
                    .addressed_to(PARENT_RECEIVER);
                    if self.write_now(probe).await.is_err() {
                        match self.reconnect().await {
                            Some(new_reader) => reader = new_reader,
                            None => break,
                        }
                    }
                }

                // Stream corruption or end-of-stream
                Ok(Err(e)) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    debug!(peer = %self.peer_addr, error = %e, "Read failed");
                    match self.reconnect().await {
                        Some(new_reader) => reader = new_reader,
                        None => break,
                    }
                }

                Ok(Ok((_tag, body))) => {
                    let bytes = match self.cipher {
                        Some(ref cipher) => match cipher.open(&body) {
                            Ok(plain) => plain,
                            Err(e) => {
                                warn!(peer = %self.peer_addr, error = %e, "Undecryptable frame dropped");
                                continue;
                            }
                        },
                        None => body,
                    };

                    match Envelope::from_bytes(&bytes) {
                        Ok(envelope) => self.handle_incoming(envelope),
                        Err(e) => {
                            warn!(peer = %self.peer_addr, error = %e, "Unparseable envelope dropped");
                        }
                    }
                }
            }
        }

        self.finish_closed();
    }

    /// Route one inbound envelope: count it, serve pings, store it for
    /// correlation, and fan out to listeners.
    fn handle_incoming(self: &Arc<Self>, envelope: Envelope) {
        let total = self.messages_in.fetch_add(1, Ordering::Relaxed) + 1;
        self.window_count.fetch_add(1, Ordering::Relaxed);

        if envelope.kind == EnvelopeKind::Ping {
            let is_echo = self
                .outstanding_pings
                .lock()
                .contains(envelope.payload_str());
            if is_echo {
                self.push_inbox(envelope);
            } else {
                // Echo the payload back unchanged
                let reply = Envelope::new(EnvelopeKind::Ping, self.local_id.as_str())
                    .with_payload(envelope.payload_str())
                    .addressed_to(envelope.sender_id);
                let link = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = link.send(reply).await;
                });
            }
            return;
        }

        self.push_inbox(envelope.clone());

        // Snapshot before iterating so listeners may mutate the set
        let snapshot: Vec<Arc<dyn TransportListener>> = self.listeners.read().clone();
        for listener in &snapshot {
            listener.on_envelope(self, envelope.clone());
        }

        // Periodic background probe: ping plus status piggyback
        if self.config.ping_every_messages > 0 && total % self.config.ping_every_messages == 0 {
            let link = Arc::clone(self);
            tokio::spawn(async move {
                let size = link.config.ping_payload_len;
                let timeout = link.config.ping_timeout;
                let rtt = link.ping(size, timeout).await;
                debug!(peer = %link.peer_addr, rtt_ms = rtt, "Periodic ping");
                let _ = link.broadcast_status().await;
            });
        }
    }

    /// Bounded reconnect: close and re-dial the same address, up to
    /// `max_reconnect_attempts` times. Returns the new read half, or
    /// `None` once the budget is spent (or for accepted links).
    async fn reconnect(self: &Arc<Self>) -> Option<OwnedReadHalf> {
        let addr = match self.dial_addr {
            Some(addr) => addr,
            None => return None, // accepted link, nothing to re-dial
        };

        self.set_state(LinkState::Reconnecting);
        *self.writer.lock().await = None;

        for attempt in 1..=self.config.max_reconnect_attempts {
            if self.shutdown.load(Ordering::Relaxed) {
                return None;
            }
            tokio::time::sleep(self.config.reconnect_delay).await;

            info!(peer = %addr, attempt, "Reconnecting transport link");
            let connected = tokio::time::timeout(
                self.config.connect_timeout,
                TcpStream::connect(addr),
            )
            .await;

            match connected {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    let (read_half, write_half) = stream.into_split();
                    *self.writer.lock().await = Some(write_half);
                    self.set_state(LinkState::Connected);
                    self.notify_connected();
                    info!(peer = %addr, attempt, "Transport link re-established");
                    return Some(read_half);
                }
                Ok(Err(e)) => {
                    warn!(peer = %addr, attempt, error = %e, "Reconnect attempt failed");
                }
                Err(_) => {
                    warn!(peer = %addr, attempt, "Reconnect attempt timed out");
                }
            }
        }

        None
    }

    // ─────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────

    /// Explicitly close the link
    pub async fn close(self: &Arc<Self>) {
        self.shutdown.store(true, Ordering::Relaxed);
        *self.writer.lock().await = None;
        self.finish_closed();
    }

    fn finish_closed(self: &Arc<Self>) {
        self.set_state(LinkState::Closed);
        self.notify_disconnected(true);
    }

    fn notify_connected(self: &Arc<Self>) {
        let snapshot: Vec<Arc<dyn TransportListener>> = self.listeners.read().clone();
        for listener in &snapshot {
            listener.on_connected(self);
        }
    }

    fn notify_disconnected(self: &Arc<Self>, permanent: bool) {
        if self.disconnect_notified.swap(true, Ordering::Relaxed) {
            return;
        }
        let snapshot: Vec<Arc<dyn TransportListener>> = self.listeners.read().clone();
        for listener in &snapshot {
            listener.on_disconnected(self, permanent);
        }
    }
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("secured", &self.cipher.is_some())
            .finish()
    }
}

/// Build the correlation predicate for a request envelope. `None`
/// means the kind is fire-and-forget.
fn reply_matcher(request: &Envelope) -> Option<Box<dyn Fn(&Envelope) -> bool + Send + Sync>> {
    let requester = request.sender_id.clone();
    match request.kind {
        // Replies are addressed back to the requesting worker; an ack
        // always carries a payload, a probe never does
        EnvelopeKind::ConnectionRequest | EnvelopeKind::ConnectionConfirmation => {
            Some(Box::new(move |e| {
                e.kind == EnvelopeKind::ConnectionConfirmation
                    && e.receiver_id == requester
                    && e.payload.is_some()
            }))
        }
        EnvelopeKind::ServerStatusQuery => Some(Box::new(move |e| {
            e.kind == EnvelopeKind::ServerStatus && e.receiver_id == requester
        })),
        EnvelopeKind::ResourceRequest => Some(Box::new(move |e| {
            e.kind == EnvelopeKind::ResourceUri && e.receiver_id == requester
        })),
        EnvelopeKind::Ping => {
            let payload = request.payload.clone();
            Some(Box::new(move |e| {
                e.kind == EnvelopeKind::Ping && e.payload == payload
            }))
        }
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.inbox_capacity, 100);
        assert_eq!(config.ping_every_messages, 40);
        assert_eq!(config.reply_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_reply_matcher_connection_request() {
        let request = Envelope::new(EnvelopeKind::ConnectionRequest, "w1")
            .addressed_to(PARENT_RECEIVER);
        let matcher = reply_matcher(&request).unwrap();

        let good = Envelope::new(EnvelopeKind::ConnectionConfirmation, "w9")
            .with_payload("w9")
            .addressed_to("w1");
        assert!(matcher(&good));

        // Probe (no payload) must not satisfy the exchange
        let probe =
            Envelope::new(EnvelopeKind::ConnectionConfirmation, "w9").addressed_to("w1");
        assert!(!matcher(&probe));

        // Wrong receiver
        let stray = Envelope::new(EnvelopeKind::ConnectionConfirmation, "w9")
            .with_payload("w9")
            .addressed_to("w2");
        assert!(!matcher(&stray));
    }

    #[test]
    fn test_reply_matcher_ping_by_payload() {
        let request = Envelope::new(EnvelopeKind::Ping, "n1").with_payload("abc123");
        let matcher = reply_matcher(&request).unwrap();

        let echo = Envelope::new(EnvelopeKind::Ping, "n2")
            .with_payload("abc123")
            .addressed_to("n1");
        assert!(matcher(&echo));

        let other = Envelope::new(EnvelopeKind::Ping, "n2").with_payload("zzz");
        assert!(!matcher(&other));
    }

    #[test]
    fn test_fire_and_forget_has_no_matcher() {
        let job = Envelope::new(EnvelopeKind::Job, "w1");
        assert!(reply_matcher(&job).is_none());

        let kill = Envelope::new(EnvelopeKind::Kill, "w1");
        assert!(reply_matcher(&kill).is_none());
    }

    #[tokio::test]
    async fn test_outbound_queues_while_connecting() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let link = TransportLink::outbound(
            addr,
            "node-a",
            None,
            Arc::new(SelfStatus::default()),
            TransportConfig::default(),
        )
        .unwrap();

        assert_eq!(link.state(), LinkState::Connecting);
        link.send(Envelope::new(EnvelopeKind::StringMessage, "w1").with_payload("queued"))
            .await
            .unwrap();
        assert_eq!(link.pending.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_inbox_drops_oldest_beyond_capacity() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut config = TransportConfig::default();
        config.inbox_capacity = 3;
        let link = TransportLink::outbound(
            addr,
            "node-a",
            None,
            Arc::new(SelfStatus::default()),
            config,
        )
        .unwrap();

        for i in 0..5 {
            link.push_inbox(
                Envelope::new(EnvelopeKind::StringMessage, "peer")
                    .with_payload(format!("m{i}")),
            );
        }

        let inbox = link.inbox.lock();
        assert_eq!(inbox.len(), 3);
        assert_eq!(inbox.front().unwrap().payload_str(), "m2");
        assert_eq!(inbox.back().unwrap().payload_str(), "m4");
    }

    #[tokio::test]
    async fn test_take_reply_removes_match_only() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let link = TransportLink::outbound(
            addr,
            "node-a",
            None,
            Arc::new(SelfStatus::default()),
            TransportConfig::default(),
        )
        .unwrap();

        link.push_inbox(Envelope::new(EnvelopeKind::StringMessage, "p").with_payload("keep"));
        link.push_inbox(
            Envelope::new(EnvelopeKind::ResourceUri, "p")
                .with_payload("uri://x")
                .addressed_to("w1"),
        );

        let taken = link.take_reply(&|e: &Envelope| e.kind == EnvelopeKind::ResourceUri);
        assert!(taken.is_some());
        assert_eq!(link.inbox.lock().len(), 1);

        let again = link.take_reply(&|e: &Envelope| e.kind == EnvelopeKind::ResourceUri);
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_send_on_closed_link_errors() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let link = TransportLink::outbound(
            addr,
            "node-a",
            None,
            Arc::new(SelfStatus::default()),
            TransportConfig::default(),
        )
        .unwrap();
        link.close().await;

        let result = link
            .send(Envelope::new(EnvelopeKind::StringMessage, "w1"))
            .await;
        assert!(matches!(result, Err(Error::LinkClosed(_))));
    }

    struct CollectingListener(Arc<Mutex<Vec<Envelope>>>);

    impl TransportListener for CollectingListener {
        fn on_envelope(&self, _link: &Arc<TransportLink>, envelope: Envelope) {
            self.0.lock().push(envelope);
        }
        fn on_disconnected(&self, _link: &Arc<TransportLink>, _permanent: bool) {}
    }

    /// Bind a localhost listener that wraps every accepted socket in a
    /// receiving transport link (so pings are echoed)
    async fn spawn_echo_server(
        secret: Option<&'static str>,
    ) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                if let Ok(link) = TransportLink::accepted(
                    stream,
                    "echo-server",
                    secret,
                    Arc::new(SelfStatus::default()),
                    TransportConfig::default(),
                ) {
                    link.start_receive();
                    // Keep the link alive for the test's duration
                    std::mem::forget(link);
                }
            }
        });
        addr
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ping_echo_roundtrip() {
        let addr = spawn_echo_server(None).await;

        let link = TransportLink::connect(
            addr,
            "client",
            None,
            Arc::new(SelfStatus::default()),
            TransportConfig::default(),
        )
        .await
        .unwrap();

        let rtt = link.ping(64, Duration::from_secs(5)).await;
        assert!(rtt >= 0, "expected an echo, got {rtt}");
        assert_eq!(link.last_rtt_ms(), rtt);
        link.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_secured_ping_roundtrip() {
        let addr = spawn_echo_server(Some("mesh-secret")).await;

        let link = TransportLink::connect(
            addr,
            "client",
            Some("mesh-secret"),
            Arc::new(SelfStatus::default()),
            TransportConfig::default(),
        )
        .await
        .unwrap();

        let rtt = link.ping(32, Duration::from_secs(5)).await;
        assert!(rtt >= 0, "secured echo failed: {rtt}");
        link.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ping_mute_peer_returns_minus_one() {
        // Accepts the socket but never reads or writes
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let link = TransportLink::connect(
            addr,
            "client",
            None,
            Arc::new(SelfStatus::default()),
            TransportConfig::default(),
        )
        .await
        .unwrap();

        let started = Instant::now();
        let rtt = link.ping(100, Duration::from_millis(2000)).await;
        let elapsed = started.elapsed();

        assert_eq!(rtt, -1);
        assert!(elapsed >= Duration::from_millis(1900), "returned too early");
        assert!(elapsed < Duration::from_millis(4000), "returned too late");
        link.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_envelope_delivery_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let collected = Arc::new(Mutex::new(Vec::new()));
        let collected_server = Arc::clone(&collected);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let link = TransportLink::accepted(
                stream,
                "server",
                None,
                Arc::new(SelfStatus::default()),
                TransportConfig::default(),
            )
            .unwrap();
            link.add_listener(Arc::new(CollectingListener(collected_server)));
            link.start_receive();
            std::mem::forget(link);
        });

        let link = TransportLink::connect(
            addr,
            "client-node",
            None,
            Arc::new(SelfStatus::default()),
            TransportConfig::default(),
        )
        .await
        .unwrap();

        link.send(
            Envelope::new(EnvelopeKind::StringMessage, "w1")
                .with_payload("hello mesh")
                .addressed_to(PARENT_RECEIVER),
        )
        .await
        .unwrap();

        // Wait for the server's receive loop to dispatch
        for _ in 0..50 {
            if !collected.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let envelopes = collected.lock();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].kind, EnvelopeKind::StringMessage);
        assert_eq!(envelopes[0].payload_str(), "hello mesh");
        assert_eq!(envelopes[0].sender_id, "w1");
    }

    #[test]
    fn test_peer_status_partial_update() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let link = TransportLink::outbound(
            addr,
            "node-a",
            None,
            Arc::new(SelfStatus::default()),
            TransportConfig::default(),
        )
        .unwrap();

        assert!(!link.peer_status().updated);
        link.set_peer_status(Some(120.0), None);
        let status = link.peer_status();
        assert!(status.updated);
        assert_eq!(status.jobtime_ms, 120.0);
        assert_eq!(status.activity, 1.0); // untouched default
    }
}
