//! Rendezvous vocabulary: session identity, capability tags, and the
//! typed request/accept/reject commands exchanged to negotiate a
//! peer-to-peer channel.

use std::fmt;

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Identifier of one rendezvous session, shared by both parties.
///
/// Unique per connection.  Locally-initiated sessions draw monotonically
/// increasing ids from the directory; peer-initiated ids arrive on the
/// wire and are adopted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

// ---

impl SessionId {
    // ---
    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// The remote party's protocol identity (its account handle on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

// ---

impl PeerId {
    // ---
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// 16-byte tag naming the service a rendezvous session negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability([u8; 16]);

// ---

impl Capability {
    // ---
    /// Peer-to-peer file transfer.
    pub const FILE_TRANSFER: Capability = Capability(*b"PEERWAY-XFER\0\0\0\0");

    /// Live peer-to-peer messaging over a rendezvous channel.
    pub const LIVE_MESSAGE: Capability = Capability(*b"PEERWAY-LIVE\0\0\0\0");

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// RejectReason
// ---------------------------------------------------------------------------

/// Status code carried by a rendezvous reject.
///
/// Open-ended wire value with well-known constants, so unrecognized codes
/// pass through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectReason(pub u16);

// ---

impl RejectReason {
    // ---
    /// The user declined the request.
    pub const DECLINED: RejectReason = RejectReason(0x0001);

    /// The peer cannot take another session right now.
    pub const BUSY: RejectReason = RejectReason(0x0002);

    /// The capability is not supported by the peer.
    pub const UNSUPPORTED: RejectReason = RejectReason(0x0003);
}

// ---------------------------------------------------------------------------
// RendezvousCommand
// ---------------------------------------------------------------------------

/// Discriminant of a rendezvous command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousKind {
    /// Initiate (or re-propose) the session.
    Request,

    /// Accept the most recent proposal.
    Accept,

    /// Decline the session with a reason code.
    Reject(RejectReason),
}

// ---

/// One typed rendezvous command, correlated to a session by id and
/// carrying capability-specific payload bytes the engine never interprets.
#[derive(Debug, Clone)]
pub struct RendezvousCommand {
    // ---
    pub session: SessionId,
    pub capability: Capability,
    pub kind: RendezvousKind,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// RendezvousEvent
// ---------------------------------------------------------------------------

/// Inbound traffic routed through the session directory.
#[derive(Debug, Clone)]
pub enum RendezvousEvent {
    /// A rendezvous command from the peer.
    Command(RendezvousCommand),

    /// A free-form status response correlated by (peer, session id).
    Response { code: u16, payload: Vec<u8> },
}
