//! Rendezvous sessions, relay fallback, and resumable file transfer for
//! the Peerway engine.
//!
//! # Structure
//!
//! - [`directory`] — [`RendezvousDirectory`]: id → session map, lazy
//!   creation, handler fan-out, idle eviction
//! - [`proxy`]     — relay handshake frames and both handshake roles
//! - [`transfer`]  — header codec, checksums, and the send/receive
//!   controller family with direct→relay connection fallback
//! - [`link`]      — [`PeerLink`]: connection-level lifecycle facade

pub mod directory;
pub mod link;
pub mod proxy;
pub mod transfer;

// --- directory
pub use directory::{spawn_evictor, RendezvousDirectory, RendezvousSession};

// --- link
pub use link::{LinkConfig, PeerLink};

// --- proxy
pub use proxy::{
    // ---
    read_relay_frame,
    relay_accept,
    relay_initiate,
    relay_wait_ready,
    write_relay_frame,
    RelayCommand,
    RelayFrame,
    RELAY_HEADER_LEN,
    RELAY_VERSION,
};

// --- transfer
pub use transfer::{
    // ---
    ConnectPlan,
    HeaderType,
    PeerEndpoint,
    ReceiveTransfer,
    RelayRole,
    SendTransfer,
    TransferConfig,
    TransferFile,
    TransferHandle,
    TransferHeader,
    TransferJob,
    TransferTarget,
};
