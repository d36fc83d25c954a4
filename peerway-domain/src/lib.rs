//! Core types, traits, and rate-class arithmetic for the Peerway engine.
//!
//! This crate defines the vocabulary of the system. The other crates
//! depend on `peerway-domain` and speak its types. No I/O lives here.
//!
//! # Structure
//!
//! - [`error`]      — [`PeerwayError`] and [`Result<T>`] alias
//! - [`rate`]       — rate-class descriptors and [`RateClassMonitor`]
//! - [`rendezvous`] — session/peer identity, [`RendezvousCommand`]
//! - [`handler`]    — callback traits and [`TransferState`]
//! - [`wire`]       — [`WireSink`] / [`RendezvousCodec`] connection seams

mod error;
mod handler;
mod rate;
mod rendezvous;
mod wire;

// --- error
pub use error::{PeerwayError, Result};

// --- rate
pub use rate::{
    // ---
    RateClassDescriptor,
    RateClassId,
    RateClassMonitor,
    RateClassUpdate,
    RateNoticeCode,
};

// --- rendezvous
pub use rendezvous::{
    // ---
    Capability,
    PeerId,
    RejectReason,
    RendezvousCommand,
    RendezvousEvent,
    RendezvousKind,
    SessionId,
};

// --- handler
pub use handler::{
    // ---
    DirectoryHandler,
    FailureKind,
    SessionHandler,
    TransferHandler,
    TransferOutcome,
    TransferState,
};

// --- wire
pub use wire::{ByteChannel, ByteStream, RendezvousCodec, WireSink};
