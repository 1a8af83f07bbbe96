//! Mesh-wide protocol dispatch
//!
//! Every inbound envelope lands here. Envelopes addressed to one of
//! our workers are routed straight to it; everything else is handled
//! at coordinator level. Request kinds are answered over the same
//! transport link they arrived on; replies for exchanges we initiated
//! are consumed from the transport inbox and ignored here.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::link::Link;
use crate::protocol::{
    decode_kill, decode_status, encode_status, status_value, Envelope, EnvelopeKind,
    STATUS_KEY_ACTIVITY, STATUS_KEY_JOBTIME, STATUS_KEY_PEERS,
};
use crate::transport::TransportLink;
use crate::worker::Worker;

use super::{Coordinator, MeshEvent};

// ─────────────────────────────────────────────────────────────────
// Resource Resolution
// ─────────────────────────────────────────────────────────────────

/// External collaborator that maps resource names to URIs
pub trait ResourceResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Resolver backed by a fixed name→URI table (usually from config)
#[derive(Debug, Default)]
pub struct StaticResolver {
    entries: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }
}

impl ResourceResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        self.entries.get(name).cloned()
    }
}

// ─────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────

impl Coordinator {
    /// Route one inbound envelope
    pub(super) async fn handle_envelope(self: &Arc<Self>, link: &Arc<TransportLink>, envelope: Envelope) {
        debug!(
            kind = %envelope.kind.type_name(),
            sender = %envelope.sender_id,
            receiver = %envelope.receiver_id,
            "Dispatching envelope"
        );

        // Worker-addressed traffic goes straight to that worker
        let target = self
            .workers()
            .iter()
            .find(|w| w.id() == envelope.receiver_id)
            .cloned();
        if let Some(worker) = target {
            self.handle_worker_envelope(link, &worker, envelope).await;
            return;
        }

        match envelope.kind {
            EnvelopeKind::Job => self.handle_inbound_job(&envelope),

            EnvelopeKind::StringMessage => {
                info!(sender = %envelope.sender_id, message = %envelope.payload_str(), "Mesh message");
            }

            EnvelopeKind::ConnectionRequest => {
                self.handle_connection_request(link, &envelope).await;
            }

            // An unsolicited probe asks for a liveness ack
            EnvelopeKind::ConnectionConfirmation if envelope.payload.is_none() => {
                self.acknowledge(link, &envelope).await;
            }
            EnvelopeKind::ConnectionConfirmation => {
                // Ack for an exchange we did not open; nothing to do
                debug!(sender = %envelope.sender_id, "Stray confirmation ignored");
            }

            EnvelopeKind::ServerStatusQuery => {
                self.handle_status_query(link, &envelope).await;
            }

            EnvelopeKind::ServerStatus => {
                self.apply_peer_status(link, &envelope);
            }

            EnvelopeKind::ResourceRequest => {
                self.handle_resource_request(link, &envelope).await;
            }

            EnvelopeKind::Task => {
                self.handle_task(&envelope);
            }

            EnvelopeKind::Kill => {
                self.handle_kill(&envelope).await;
            }

            // Served inside the transport receive loop
            EnvelopeKind::Ping => {}

            // Replies we initiated are consumed from the inbox
            EnvelopeKind::ResourceUri => {}
        }
    }

    /// Traffic addressed to one of our workers
    async fn handle_worker_envelope(
        self: &Arc<Self>,
        link: &Arc<TransportLink>,
        worker: &Arc<Worker>,
        envelope: Envelope,
    ) {
        match envelope.kind {
            EnvelopeKind::Job => match self.registry().decode_job(envelope.payload_str()) {
                Ok(job) => {
                    let outcome = worker.add_job(job);
                    debug!(worker = %worker.id(), outcome = ?outcome, "Peer job received");
                }
                Err(e) => {
                    warn!(worker = %worker.id(), error = %e, "Undecodable peer job dropped");
                }
            },

            EnvelopeKind::Kill => match decode_kill(envelope.payload_str()) {
                Ok((task_id, relay_count)) => {
                    worker.kill(&task_id, relay_count).await;
                }
                Err(e) => {
                    warn!(error = %e, "Malformed kill payload dropped");
                }
            },

            EnvelopeKind::ConnectionConfirmation if envelope.payload.is_none() => {
                self.acknowledge(link, &envelope).await;
            }

            EnvelopeKind::StringMessage => {
                info!(
                    worker = %worker.id(),
                    sender = %envelope.sender_id,
                    message = %envelope.payload_str(),
                    "Worker message"
                );
            }

            // Request/response replies are consumed from the inbox
            _ => {
                debug!(
                    kind = %envelope.kind.type_name(),
                    worker = %worker.id(),
                    "Worker-addressed envelope left to the inbox"
                );
            }
        }
    }

    /// Job addressed to the coordinator: assign to the least-loaded
    /// worker
    fn handle_inbound_job(self: &Arc<Self>, envelope: &Envelope) {
        match self.registry().decode_job(envelope.payload_str()) {
            Ok(job) => {
                self.assign_job(job);
            }
            Err(e) => {
                warn!(sender = %envelope.sender_id, error = %e, "Undecodable job dropped");
            }
        }
    }

    /// Pick the least-connected worker below its peer cap that is not
    /// already connected to the requester, build the link, confirm.
    async fn handle_connection_request(self: &Arc<Self>, link: &Arc<TransportLink>, envelope: &Envelope) {
        let requester = if envelope.payload_str().is_empty() {
            envelope.sender_id.clone()
        } else {
            envelope.payload_str().to_string()
        };

        let peer_cap = self.config.worker_tuning.max_peers;
        let candidate = self
            .workers()
            .iter()
            .filter(|w| w.id() != requester)
            .filter(|w| !w.has_link_to(&requester))
            .filter(|w| w.link_count() < peer_cap)
            .min_by_key(|w| w.link_count())
            .cloned();

        let reply_payload = match candidate {
            Some(worker) => {
                let peer_link = Link::new(worker.id(), requester.clone(), link);
                if worker.add_link(peer_link) {
                    info!(worker = %worker.id(), remote = %requester, "Connection accepted");
                    worker.id().to_string()
                } else {
                    "false".to_string()
                }
            }
            None => {
                debug!(remote = %requester, "No worker available for connection");
                "false".to_string()
            }
        };

        let sender = if reply_payload == "false" {
            self.node_id().to_string()
        } else {
            reply_payload.clone()
        };
        let reply = Envelope::new(EnvelopeKind::ConnectionConfirmation, sender)
            .with_payload(reply_payload)
            .addressed_to(requester);
        if let Err(e) = link.send(reply).await {
            warn!(error = %e, "Connection confirmation send failed");
        }
    }

    /// Auto-acknowledge an unsolicited confirmation probe
    async fn acknowledge(self: &Arc<Self>, link: &Arc<TransportLink>, envelope: &Envelope) {
        let reply = Envelope::new(EnvelopeKind::ConnectionConfirmation, self.node_id())
            .with_payload("true")
            .addressed_to(envelope.sender_id.clone());
        if let Err(e) = link.send(reply).await {
            debug!(error = %e, "Probe ack send failed");
        }
    }

    /// Answer a `peers` query with every known server except the
    /// requester's own link
    async fn handle_status_query(self: &Arc<Self>, link: &Arc<TransportLink>, envelope: &Envelope) {
        if envelope.payload_str() != "peers" {
            debug!(payload = %envelope.payload_str(), "Unknown status query ignored");
            return;
        }

        let peers: Vec<String> = self
            .servers
            .read()
            .iter()
            .filter(|s| s.id() != link.id() && !s.is_closed())
            .map(|s| s.peer_addr().to_string())
            .collect();
        let payload = encode_status(&[(STATUS_KEY_PEERS, peers.join(","))]);

        let reply = Envelope::new(EnvelopeKind::ServerStatus, self.node_id())
            .with_payload(payload)
            .addressed_to(envelope.sender_id.clone());
        if let Err(e) = link.send(reply).await {
            debug!(error = %e, "Status query reply failed");
        }
    }

    /// Apply a status broadcast to the sending peer's link
    fn apply_peer_status(&self, link: &Arc<TransportLink>, envelope: &Envelope) {
        let pairs = decode_status(envelope.payload_str());
        let jobtime = status_value(&pairs, STATUS_KEY_JOBTIME).and_then(|v| v.parse().ok());
        let activity = status_value(&pairs, STATUS_KEY_ACTIVITY).and_then(|v| v.parse().ok());

        if jobtime.is_none() && activity.is_none() {
            debug!(payload = %envelope.payload_str(), "Status broadcast without recognized keys");
            return;
        }
        link.set_peer_status(jobtime, activity);
    }

    /// Resolve a resource name through the injected collaborator
    async fn handle_resource_request(self: &Arc<Self>, link: &Arc<TransportLink>, envelope: &Envelope) {
        let name = envelope.payload_str();
        let uri = self.resolver().resolve(name).unwrap_or_default();
        if uri.is_empty() {
            debug!(name = %name, "Resource not resolvable");
        }

        let reply = Envelope::new(EnvelopeKind::ResourceUri, self.node_id())
            .with_payload(uri)
            .addressed_to(envelope.sender_id.clone());
        if let Err(e) = link.send(reply).await {
            debug!(error = %e, "Resource reply failed");
        }
    }

    /// Decode a task descriptor and register the factory. Decoding
    /// failures reject the task; they never reach the tick loop.
    fn handle_task(self: &Arc<Self>, envelope: &Envelope) {
        let descriptor = envelope.payload_str().to_string();

        // Recently-seen dedup, keyed on the raw descriptor
        {
            let mut seen = self.seen_tasks.lock();
            if seen.contains(&descriptor) {
                debug!("Recently seen task descriptor ignored");
                return;
            }
            while seen.len() >= self.config.seen_tasks_cap {
                seen.pop_front();
            }
            seen.push_back(descriptor.clone());
        }

        match self.registry().decode_factory(&descriptor) {
            Ok(factory) => {
                let task_id = factory.task_id().to_string();
                let added = {
                    let mut tasks = self.tasks.lock();
                    if tasks.iter().any(|t| t.task_id() == task_id) {
                        false
                    } else {
                        tasks.push(factory);
                        true
                    }
                };
                if added {
                    info!(task_id = %task_id, "Task registered");
                    self.emit(MeshEvent::TaskAccepted { task_id });
                } else {
                    debug!(task_id = %task_id, "Task already active");
                }
            }
            Err(e) => {
                warn!(error = %e, "Task descriptor rejected");
                self.emit(MeshEvent::TaskRejected {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Remove matching task factories and cascade the kill into every
    /// worker; each hop decrements the relay count exactly once.
    async fn handle_kill(self: &Arc<Self>, envelope: &Envelope) {
        let (task_id, relay_count) = match decode_kill(envelope.payload_str()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Malformed kill payload dropped");
                return;
            }
        };

        let removed = {
            let mut tasks = self.tasks.lock();
            let before = tasks.len();
            tasks.retain(|t| t.task_id() != task_id);
            before - tasks.len()
        };
        info!(task_id = %task_id, relay_count, removed, "Kill received");

        for worker in self.workers() {
            worker.kill(&task_id, relay_count).await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
