//! Application callback interfaces and the transfer state vocabulary.
//!
//! Handlers are held as non-owning (`Weak`) references by the engine and
//! invoked via snapshot iteration, so implementations may freely register
//! or deregister from inside a callback.  All methods default to no-ops;
//! implementors override only what they need.

use async_trait::async_trait;

use super::error::PeerwayError;
use super::rendezvous::{PeerId, RendezvousCommand, SessionId};

// ---------------------------------------------------------------------------
// TransferState
// ---------------------------------------------------------------------------

/// Observable lifecycle of one file transfer.
///
/// Forward path: `Resolving → Connecting → ConnectedDirect|ConnectedProxy
/// → Transferring → ChecksumVerify → Succeeded`.  Multi-file jobs cycle
/// `Transferring ↔ ChecksumVerify` once per file.  Any state may drop to
/// `Failed`; `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    // ---
    /// Resolving the peer's advertised endpoint.
    Resolving,

    /// Dialing the peer directly, or running the relay handshake.
    Connecting,

    /// Byte channel established socket-to-socket.
    ConnectedDirect,

    /// Byte channel established through a relay.
    ConnectedProxy,

    /// File bytes are flowing.
    Transferring,

    /// Verifying checksums / exchanging the final acknowledgement.
    ChecksumVerify,

    Succeeded,

    Failed,
}

// ---

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Succeeded | TransferState::Failed)
    }
}

// ---------------------------------------------------------------------------
// FailureKind / TransferOutcome
// ---------------------------------------------------------------------------

/// Coarse classification of a failed transfer, for handlers that branch
/// on the cause without parsing the detail string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Unexpected header or command at a step expecting a specific type.
    Protocol,

    /// Final checksum disagreement.
    Integrity,

    /// Socket / relay / file I/O failure, including deadline expiry.
    Connectivity,

    /// Explicit local stop.
    Cancelled,
}

// ---

impl From<&PeerwayError> for FailureKind {
    fn from(err: &PeerwayError) -> Self {
        match err {
            PeerwayError::Protocol(_) => FailureKind::Protocol,
            PeerwayError::Integrity { .. } => FailureKind::Integrity,
            PeerwayError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Connectivity,
        }
    }
}

// ---

/// Terminal result of a transfer, reported exactly once.
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    // ---
    Succeeded {
        bytes_transferred: u64,
    },

    Failed {
        kind: FailureKind,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// DirectoryHandler
// ---------------------------------------------------------------------------

/// Directory-level notifications.
#[async_trait]
pub trait DirectoryHandler: Send + Sync {
    // ---
    /// A peer-initiated session was seen for the first time.
    ///
    /// Fired exactly once per session id, outside the directory lock.
    async fn on_new_session(&self, session: SessionId, peer: PeerId) {
        let _ = (session, peer);
    }
}

// ---------------------------------------------------------------------------
// SessionHandler
// ---------------------------------------------------------------------------

/// Per-session event sink.  Events arrive in network-receive order.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    // ---
    async fn on_command(&self, session: SessionId, command: RendezvousCommand) {
        let _ = (session, command);
    }

    // ---

    async fn on_response(&self, session: SessionId, code: u16, payload: Vec<u8>) {
        let _ = (session, code, payload);
    }
}

// ---------------------------------------------------------------------------
// TransferHandler
// ---------------------------------------------------------------------------

/// Lifecycle events for one file transfer.
#[async_trait]
pub trait TransferHandler: Send + Sync {
    // ---
    /// Fired on every state transition.
    async fn on_state(&self, state: TransferState) {
        let _ = state;
    }

    // ---

    /// Fired on progress-interval boundaries while bytes flow.
    async fn on_progress(&self, file_index: usize, bytes: u64, total: u64) {
        let _ = (file_index, bytes, total);
    }

    // ---

    /// One file of the job finished and verified.
    async fn on_file_done(&self, file_index: usize) {
        let _ = file_index;
    }

    // ---

    /// A relay assigned the endpoint the peer must be told to join.
    ///
    /// Only fired on the proxy-initiate path; the application forwards the
    /// endpoint through its rendezvous messaging.
    async fn on_proxy_redirect(&self, addr: std::net::Ipv4Addr, port: u16) {
        let _ = (addr, port);
    }

    // ---

    /// Terminal event; fired exactly once.
    async fn on_finished(&self, outcome: TransferOutcome) {
        let _ = outcome;
    }
}
