//! Link: a local-worker-to-remote-worker relationship
//!
//! Routes jobs and kill signals for one worker pair over a shared
//! transport link. The transport is held weakly: the link does not
//! control the socket's lifetime, and a dead upgrade surfaces as a
//! send failure so the owner drops the link.

use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::Job;
use crate::protocol::{encode_kill, Envelope, EnvelopeKind};
use crate::transport::TransportLink;

/// A logical peer relationship between one local and one remote worker
#[derive(Clone)]
pub struct Link {
    local_worker_id: String,
    remote_worker_id: String,
    transport: Weak<TransportLink>,
    transport_id: Uuid,
}

impl Link {
    pub fn new(
        local_worker_id: impl Into<String>,
        remote_worker_id: impl Into<String>,
        transport: &Arc<TransportLink>,
    ) -> Self {
        Self {
            local_worker_id: local_worker_id.into(),
            remote_worker_id: remote_worker_id.into(),
            transport: Arc::downgrade(transport),
            transport_id: transport.id(),
        }
    }

    pub fn local_worker_id(&self) -> &str {
        &self.local_worker_id
    }

    pub fn remote_worker_id(&self) -> &str {
        &self.remote_worker_id
    }

    /// Id of the transport this link rides on, for disconnect cleanup
    pub fn transport_id(&self) -> Uuid {
        self.transport_id
    }

    fn transport(&self) -> Result<Arc<TransportLink>> {
        self.transport
            .upgrade()
            .filter(|t| !t.is_closed())
            .ok_or_else(|| Error::LinkClosed(self.remote_worker_id.clone()))
    }

    /// Whether the underlying transport is still usable
    pub fn is_alive(&self) -> bool {
        self.transport().is_ok()
    }

    /// Activity rating the remote side last reported over this
    /// transport (1.0 until a report arrives)
    pub fn remote_activity(&self) -> f64 {
        self.transport
            .upgrade()
            .map(|t| t.peer_status().activity)
            .unwrap_or(1.0)
    }

    /// Forward a job to the remote worker. Transport failures
    /// propagate; the caller is expected to drop this link.
    pub async fn send_job(&self, job: &dyn Job) -> Result<()> {
        let transport = self.transport()?;
        let envelope = Envelope::new(EnvelopeKind::Job, self.local_worker_id.as_str())
            .with_payload(job.encode())
            .addressed_to(self.remote_worker_id.as_str());
        transport.send(envelope).await
    }

    /// Forward a kill order with an already-decremented relay count
    pub async fn send_kill(&self, task_id: &str, relay_count: u32) -> Result<()> {
        let transport = self.transport()?;
        let envelope = Envelope::new(EnvelopeKind::Kill, self.local_worker_id.as_str())
            .with_payload(encode_kill(task_id, relay_count))
            .addressed_to(self.remote_worker_id.as_str());
        transport.send(envelope).await
    }

    /// Probe the remote worker; blocks for a boolean acknowledgement
    pub async fn confirm(&self) -> bool {
        let transport = match self.transport() {
            Ok(t) => t,
            Err(_) => return false,
        };
        let envelope = Envelope::new(
            EnvelopeKind::ConnectionConfirmation,
            self.local_worker_id.as_str(),
        )
        .addressed_to(self.remote_worker_id.as_str());

        match transport.request(envelope).await {
            Some(reply) => reply.payload_str() == "true",
            None => false,
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("local", &self.local_worker_id)
            .field("remote", &self.remote_worker_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
