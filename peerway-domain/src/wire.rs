//! Seams to the connection layer.
//!
//! The typed binary record codec (length-prefixed tag/value encoding) that
//! frames every protocol message lives outside this engine.  Peerway only
//! moves opaque payloads: [`WireSink`] is where admitted requests leave
//! the engine, and [`RendezvousCodec`] is where rendezvous commands become
//! payload bytes on their way in.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::Result;
use super::rendezvous::{PeerId, RendezvousCommand, SessionId};

// ---------------------------------------------------------------------------
// WireSink
// ---------------------------------------------------------------------------

/// Outbound byte path of the connection.
///
/// The dispatch scheduler hands every admitted request here, one at a
/// time, in FIFO order within its rate class.  Implementations write to
/// the real socket; tests record.
#[async_trait]
pub trait WireSink: Send + Sync {
    // ---
    async fn send_frame(&self, payload: Vec<u8>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// RendezvousCodec
// ---------------------------------------------------------------------------

/// Builds wire payloads for outbound rendezvous traffic.
///
/// Implemented by the connection layer on top of its record codec; the
/// directory never sees the encoding.
pub trait RendezvousCodec: Send + Sync {
    // ---
    fn encode_command(&self, peer: &PeerId, command: &RendezvousCommand) -> Vec<u8>;

    fn encode_response(
        &self,
        peer: &PeerId,
        session: SessionId,
        code: u16,
        payload: &[u8],
    ) -> Vec<u8>;
}

// ---------------------------------------------------------------------------
// ByteChannel
// ---------------------------------------------------------------------------

/// Any duplex byte stream a transfer can run over: a direct socket, a
/// relayed socket, or an in-memory pipe in tests.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

// ---

/// Convenience alias for a heap-allocated [`ByteStream`].
pub type ByteChannel = Box<dyn ByteStream>;
