//! Envelope: the typed, addressed message unit
//!
//! Every frame on a transport link carries one JSON-serialized Envelope.
//! The envelope is a plain value type: request/response correlation and
//! transmission live on the transport layer, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Receiver id for messages addressed to the peer's coordinator rather
/// than to a specific worker (upstream relays, queries, task pushes).
pub const PARENT_RECEIVER: &str = "parent";

// ─────────────────────────────────────────────────────────────────
// Envelope Kind
// ─────────────────────────────────────────────────────────────────

/// All message kinds carried over the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    /// An encoded job, addressed to a specific worker or to a coordinator
    Job,

    /// Free-form text, logged by the receiver
    StringMessage,

    /// Request a new peer link; answered with a ConnectionConfirmation
    ConnectionRequest,

    /// Liveness probe / handshake ack; an empty payload asks for an ack,
    /// a "true"/"false" payload is the ack itself
    ConnectionConfirmation,

    /// Query server state; payload "peers" asks for the peer address list
    ServerStatusQuery,

    /// Status broadcast or query reply (`key:=value;...` payload)
    ServerStatus,

    /// Ask the peer to resolve a named resource to a URI
    ResourceRequest,

    /// Reply to a ResourceRequest
    ResourceUri,

    /// An encoded task factory descriptor
    Task,

    /// Cancel a task mesh-wide (`task_id|relay_count` payload)
    Kill,

    /// Round-trip probe; the receiver echoes the payload unchanged
    Ping,
}

impl EnvelopeKind {
    /// Stable name used in logs
    pub fn type_name(&self) -> &'static str {
        match self {
            EnvelopeKind::Job => "JOB",
            EnvelopeKind::StringMessage => "STRING_MESSAGE",
            EnvelopeKind::ConnectionRequest => "CONNECTION_REQUEST",
            EnvelopeKind::ConnectionConfirmation => "CONNECTION_CONFIRMATION",
            EnvelopeKind::ServerStatusQuery => "SERVER_STATUS_QUERY",
            EnvelopeKind::ServerStatus => "SERVER_STATUS",
            EnvelopeKind::ResourceRequest => "RESOURCE_REQUEST",
            EnvelopeKind::ResourceUri => "RESOURCE_URI",
            EnvelopeKind::Task => "TASK",
            EnvelopeKind::Kill => "KILL",
            EnvelopeKind::Ping => "PING",
        }
    }

    /// Kinds that open a blocking request/response exchange
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            EnvelopeKind::ConnectionRequest
                | EnvelopeKind::ConnectionConfirmation
                | EnvelopeKind::ServerStatusQuery
                | EnvelopeKind::ResourceRequest
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────

/// A typed, addressed message unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message ID
    pub id: Uuid,

    /// Message timestamp
    pub timestamp: DateTime<Utc>,

    /// Message kind
    pub kind: EnvelopeKind,

    /// Worker or coordinator id of the sender
    pub sender_id: String,

    /// Worker or coordinator id of the receiver; stamped immediately
    /// before transmission
    pub receiver_id: String,

    /// Kind-specific payload (see the codec module for the formats)
    #[serde(default)]
    pub payload: Option<String>,
}

impl Envelope {
    /// Create a new envelope with an empty receiver
    pub fn new(kind: EnvelopeKind, sender_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            sender_id: sender_id.into(),
            receiver_id: String::new(),
            payload: None,
        }
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Stamp the receiver id
    pub fn addressed_to(mut self, receiver_id: impl Into<String>) -> Self {
        self.receiver_id = receiver_id.into();
        self
    }

    /// Wire tag for this envelope: request kinds and pings travel as
    /// queries, everything else as plain messages
    pub fn wire_tag(&self) -> &'static str {
        if self.kind.is_request() || self.kind == EnvelopeKind::Ping {
            "query"
        } else {
            "msg"
        }
    }

    /// Payload as a &str, empty when absent
    pub fn payload_str(&self) -> &str {
        self.payload.as_deref().unwrap_or("")
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
