//! Relay handshake — the fallback path when peers cannot reach each
//! other directly.
//!
//! Both parties connect to a relay server and identify themselves by
//! session id before any transfer byte flows:
//!
//! ```text
//! initiator                relay                 acceptor
//!    │ ── INIT_SEND ──────►  │
//!    │ ◄────────── ACK ────  │   (relay assigns addr:port)
//!    │    …endpoint travels to the peer via rendezvous messaging…
//!    │                       │  ◄────── INIT_RECV ── │
//!    │ ◄──────── READY ────  │  ── READY ──────────► │
//!    │ ═══════════ transfer bytes relayed ══════════ │
//! ```
//!
//! Every handshake message is one fixed 8-byte frame header plus payload:
//!
//! ```text
//! offset  size  field
//!      0     2  payload length
//!      2     2  version (0x0001)
//!      4     2  command
//!      6     2  flags
//!      8     …  payload
//! ```

use std::net::Ipv4Addr;

// ---

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ---

use peerway_domain::{PeerId, PeerwayError, Result, SessionId};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Relay frame version.
pub const RELAY_VERSION: u16 = 0x0001;

/// Fixed frame header size: payload_len(2) + version(2) + command(2) + flags(2).
pub const RELAY_HEADER_LEN: usize = 8;

/// Relay payloads are tiny (ids and names); anything bigger is malformed.
const MAX_RELAY_PAYLOAD: usize = 512;

// ---------------------------------------------------------------------------
// RelayCommand
// ---------------------------------------------------------------------------

/// Discriminant of a relay handshake frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    // ---
    Error = 0x0001,
    InitSend = 0x0002,
    Ack = 0x0003,
    InitRecv = 0x0004,
    Ready = 0x0005,
}

// ---

impl RelayCommand {
    // ---
    fn from_wire(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(RelayCommand::Error),
            0x0002 => Some(RelayCommand::InitSend),
            0x0003 => Some(RelayCommand::Ack),
            0x0004 => Some(RelayCommand::InitRecv),
            0x0005 => Some(RelayCommand::Ready),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

// ---------------------------------------------------------------------------
// RelayFrame
// ---------------------------------------------------------------------------

/// One decoded relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    // ---
    pub command: RelayCommand,
    pub flags: u16,
    pub payload: Vec<u8>,
}

// ---

impl RelayFrame {
    // ---
    pub fn new(command: RelayCommand, payload: Vec<u8>) -> Self {
        Self {
            command,
            flags: 0,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame I/O
// ---------------------------------------------------------------------------

/// Write one relay frame to `stream`.
pub async fn write_relay_frame<W>(stream: &mut W, frame: &RelayFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // ---
    if frame.payload.len() > MAX_RELAY_PAYLOAD {
        return Err(PeerwayError::Protocol(format!(
            "relay payload of {} bytes, max {MAX_RELAY_PAYLOAD}",
            frame.payload.len()
        )));
    }

    let mut fixed = [0u8; RELAY_HEADER_LEN];
    fixed[0..2].copy_from_slice(&(frame.payload.len() as u16).to_be_bytes());
    fixed[2..4].copy_from_slice(&RELAY_VERSION.to_be_bytes());
    fixed[4..6].copy_from_slice(&frame.command.as_u16().to_be_bytes());
    fixed[6..8].copy_from_slice(&frame.flags.to_be_bytes());

    stream.write_all(&fixed).await?;
    stream.write_all(&frame.payload).await?;
    Ok(())
}

// ---

/// Read one relay frame from `stream`.
pub async fn read_relay_frame<R>(stream: &mut R) -> Result<RelayFrame>
where
    R: AsyncRead + Unpin,
{
    // ---
    let mut fixed = [0u8; RELAY_HEADER_LEN];
    stream.read_exact(&mut fixed).await?;

    let payload_len = u16::from_be_bytes([fixed[0], fixed[1]]) as usize;
    if payload_len > MAX_RELAY_PAYLOAD {
        return Err(PeerwayError::Protocol(format!(
            "relay payload of {payload_len} bytes, max {MAX_RELAY_PAYLOAD}"
        )));
    }

    let version = u16::from_be_bytes([fixed[2], fixed[3]]);
    if version != RELAY_VERSION {
        return Err(PeerwayError::Protocol(format!(
            "unsupported relay frame version {version:#06x}"
        )));
    }

    let raw_command = u16::from_be_bytes([fixed[4], fixed[5]]);
    let command = RelayCommand::from_wire(raw_command)
        .ok_or_else(|| PeerwayError::Protocol(format!("unknown relay command {raw_command:#06x}")))?;

    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;

    Ok(RelayFrame {
        command,
        flags: u16::from_be_bytes([fixed[6], fixed[7]]),
        payload,
    })
}

// ---------------------------------------------------------------------------
// Payload encoding
// ---------------------------------------------------------------------------

/// INIT_SEND / INIT_RECV payload: session id, u8-length-prefixed peer
/// name, and (INIT_RECV only) the relay port being joined.
fn encode_init(session: SessionId, name: &PeerId, port: Option<u16>) -> Result<Vec<u8>> {
    // ---
    let name_bytes = name.as_str().as_bytes();
    if name_bytes.len() > u8::MAX as usize {
        return Err(PeerwayError::Protocol(format!(
            "peer name of {} bytes does not fit the relay frame",
            name_bytes.len()
        )));
    }

    let mut payload = Vec::with_capacity(8 + 1 + name_bytes.len() + 2);
    payload.extend_from_slice(&session.as_u64().to_be_bytes());
    payload.push(name_bytes.len() as u8);
    payload.extend_from_slice(name_bytes);
    if let Some(port) = port {
        payload.extend_from_slice(&port.to_be_bytes());
    }
    Ok(payload)
}

// ---

fn decode_ack_endpoint(payload: &[u8]) -> Result<(Ipv4Addr, u16)> {
    // ---
    if payload.len() != 6 {
        return Err(PeerwayError::Protocol(format!(
            "relay ACK payload of {} bytes, expected 6",
            payload.len()
        )));
    }
    let addr = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
    let port = u16::from_be_bytes([payload[4], payload[5]]);
    Ok((addr, port))
}

// ---

fn relay_error(frame: &RelayFrame) -> PeerwayError {
    // ---
    let code = if frame.payload.len() >= 2 {
        u16::from_be_bytes([frame.payload[0], frame.payload[1]])
    } else {
        0
    };
    PeerwayError::Transport(format!("relay refused the handshake (code {code:#06x})"))
}

// ---------------------------------------------------------------------------
// Handshake roles
// ---------------------------------------------------------------------------

/// Initiator half: announce the session, learn the endpoint the peer
/// must join.  The caller forwards that endpoint through rendezvous
/// messaging, then parks on [`relay_wait_ready`].
pub async fn relay_initiate<S>(
    stream: &mut S,
    session: SessionId,
    local_name: &PeerId,
) -> Result<(Ipv4Addr, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    let init = RelayFrame::new(RelayCommand::InitSend, encode_init(session, local_name, None)?);
    write_relay_frame(stream, &init).await?;

    let reply = read_relay_frame(stream).await?;
    match reply.command {
        RelayCommand::Ack => {
            let (addr, port) = decode_ack_endpoint(&reply.payload)?;
            tracing::debug!(session = %session, %addr, port, "relay assigned endpoint");
            Ok((addr, port))
        }
        RelayCommand::Error => Err(relay_error(&reply)),
        other => Err(PeerwayError::Protocol(format!(
            "expected relay ACK, got {other:?}"
        ))),
    }
}

// ---

/// Block until the relay reports the peer has joined.
pub async fn relay_wait_ready<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    let frame = read_relay_frame(stream).await?;
    match frame.command {
        RelayCommand::Ready => Ok(()),
        RelayCommand::Error => Err(relay_error(&frame)),
        other => Err(PeerwayError::Protocol(format!(
            "expected relay READY, got {other:?}"
        ))),
    }
}

// ---

/// Acceptor half: join the endpoint the initiator advertised.  Returns
/// once the relay confirms both parties are bridged.
pub async fn relay_accept<S>(
    stream: &mut S,
    session: SessionId,
    local_name: &PeerId,
    port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    let init = RelayFrame::new(
        RelayCommand::InitRecv,
        encode_init(session, local_name, Some(port))?,
    );
    write_relay_frame(stream, &init).await?;
    relay_wait_ready(stream).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::io::Cursor;

    use super::*;

    // ---

    #[tokio::test]
    async fn frame_layout_is_bit_exact() {
        // ---
        let frame = RelayFrame::new(RelayCommand::Ack, vec![10, 0, 0, 1, 0x13, 0x88]);
        let mut buf: Vec<u8> = Vec::new();
        write_relay_frame(&mut buf, &frame).await.unwrap();

        assert_eq!(&buf[0..2], &[0x00, 0x06], "payload length");
        assert_eq!(&buf[2..4], &[0x00, 0x01], "version");
        assert_eq!(&buf[4..6], &[0x00, 0x03], "command ACK");
        assert_eq!(&buf[6..8], &[0x00, 0x00], "flags");
        assert_eq!(&buf[8..], &[10, 0, 0, 1, 0x13, 0x88]);
    }

    // ---

    #[tokio::test]
    async fn unknown_command_rejected() {
        // ---
        let frame = RelayFrame::new(RelayCommand::Ready, Vec::new());
        let mut buf: Vec<u8> = Vec::new();
        write_relay_frame(&mut buf, &frame).await.unwrap();
        buf[5] = 0x7F;

        let err = read_relay_frame(&mut Cursor::new(buf)).await.unwrap_err();
        assert!(matches!(err, PeerwayError::Protocol(_)));
    }

    // ---

    /// Full handshake over an in-memory relay: INIT_SEND/ACK on one leg,
    /// INIT_RECV/READY on the other, READY fan-out to the initiator.
    #[tokio::test]
    async fn both_roles_complete_against_a_relay() {
        // ---
        let (mut init_side, mut relay_a) = tokio::io::duplex(1024);
        let (mut accept_side, mut relay_b) = tokio::io::duplex(1024);

        let session = SessionId::from_u64(42);

        let relay = tokio::spawn(async move {
            // Leg A: initiator announces.
            let init = read_relay_frame(&mut relay_a).await.unwrap();
            assert_eq!(init.command, RelayCommand::InitSend);
            assert_eq!(&init.payload[0..8], &42u64.to_be_bytes());

            let ack = RelayFrame::new(RelayCommand::Ack, vec![127, 0, 0, 1, 0x13, 0x88]);
            write_relay_frame(&mut relay_a, &ack).await.unwrap();

            // Leg B: acceptor joins the advertised port.
            let join = read_relay_frame(&mut relay_b).await.unwrap();
            assert_eq!(join.command, RelayCommand::InitRecv);
            assert_eq!(&join.payload[0..8], &42u64.to_be_bytes());
            let tail = &join.payload[join.payload.len() - 2..];
            assert_eq!(u16::from_be_bytes([tail[0], tail[1]]), 5_000);

            // Bridge up: READY to both.
            let ready = RelayFrame::new(RelayCommand::Ready, Vec::new());
            write_relay_frame(&mut relay_b, &ready).await.unwrap();
            write_relay_frame(&mut relay_a, &ready).await.unwrap();
        });

        let (addr, port) = relay_initiate(&mut init_side, session, &PeerId::from("alice"))
            .await
            .unwrap();
        assert_eq!(addr, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(port, 5_000);

        relay_accept(&mut accept_side, session, &PeerId::from("bob"), port)
            .await
            .unwrap();
        relay_wait_ready(&mut init_side).await.unwrap();

        relay.await.unwrap();
    }

    // ---

    #[tokio::test]
    async fn relay_error_surfaces_as_transport_failure() {
        // ---
        let (mut client, mut server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let _ = read_relay_frame(&mut server).await.unwrap();
            let err = RelayFrame::new(RelayCommand::Error, 0x0010u16.to_be_bytes().to_vec());
            write_relay_frame(&mut server, &err).await.unwrap();
        });

        let err = relay_initiate(&mut client, SessionId::from_u64(7), &PeerId::from("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerwayError::Transport(_)));
    }
}
