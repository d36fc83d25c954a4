//! Wire framing for file-transfer headers.
//!
//! Every step of the per-file protocol is a fixed 50-byte big-endian
//! prelude followed by the segmented file name:
//!
//! ```text
//! offset  size  field
//!      0     2  format version (0x0001)
//!      2     2  header type
//!      4     2  total files in job
//!      6     2  files remaining (this file included)
//!      8     8  total job size
//!     16     8  file size
//!     24     8  bytes received
//!     32     4  checksum
//!     36     4  received checksum
//!     40     8  last-modified (unix seconds)
//!     48     2  name segment count
//!     50     …  segments: u16 length + UTF-8 bytes, each
//! ```
//!
//! `checksum` is always the sender's whole-file crc32; `received_checksum`
//! is whatever the receiver has verified so far (a resume claim carries
//! the prefix checksum here, the final acknowledgement the full one).
//! The name travels as path segments, never as an assembled path — the
//! receiver decides what the separator and root are.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ---

use peerway_domain::{PeerwayError, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Wire format version.  Bump when the fixed prelude layout changes.
pub const TRANSFER_VERSION: u16 = 0x0001;

/// Fixed prelude size in bytes (everything before the name segments).
pub const FIXED_HEADER_LEN: usize = 50;

/// Upper bound on one name segment, and on the segment count.  Anything
/// larger is a malformed header, not a legitimate file name.
const MAX_SEGMENT_LEN: usize = 1024;
const MAX_SEGMENTS: usize = 64;

// ---------------------------------------------------------------------------
// HeaderType
// ---------------------------------------------------------------------------

/// Discriminant of a transfer header.
///
/// The protocol position defines the meaning: an ACK right after SEND
/// means "start at zero", an ACK after the last byte is the final
/// acknowledgement.  Any type arriving at a step that expects a different
/// one is a fatal protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    // ---
    /// Sender → receiver: here comes a file.
    Send = 0x0101,

    /// Sender → receiver: resume offset settled, transfer starts there.
    ResumeSendHeader = 0x0106,

    /// Receiver → sender: plain acknowledgement (initial or final).
    Ack = 0x0202,

    /// Receiver → sender: resume claim (offset + prefix checksum).
    Resume = 0x0205,

    /// Receiver → sender: resume offset accepted.
    ResumeAck = 0x0207,
}

// ---

impl HeaderType {
    // ---
    fn from_wire(value: u16) -> Option<Self> {
        match value {
            0x0101 => Some(HeaderType::Send),
            0x0106 => Some(HeaderType::ResumeSendHeader),
            0x0202 => Some(HeaderType::Ack),
            0x0205 => Some(HeaderType::Resume),
            0x0207 => Some(HeaderType::ResumeAck),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

// ---------------------------------------------------------------------------
// TransferHeader
// ---------------------------------------------------------------------------

/// One decoded transfer header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    // ---
    pub header_type: HeaderType,
    pub total_files: u16,
    pub files_remaining: u16,
    pub total_size: u64,
    pub file_size: u64,
    pub bytes_received: u64,
    pub checksum: u32,
    pub received_checksum: u32,
    pub modified_time: u64,
    pub name_segments: Vec<String>,
}

// ---

impl TransferHeader {
    // ---

    /// A header with every numeric field zeroed and no name.
    pub fn bare(header_type: HeaderType) -> Self {
        // ---
        Self {
            header_type,
            total_files: 0,
            files_remaining: 0,
            total_size: 0,
            file_size: 0,
            bytes_received: 0,
            checksum: 0,
            received_checksum: 0,
            modified_time: 0,
            name_segments: Vec::new(),
        }
    }

    // ---

    /// Display form of the segmented name.
    pub fn display_name(&self) -> String {
        self.name_segments.join("/")
    }
}

// ---------------------------------------------------------------------------
// write_transfer_header
// ---------------------------------------------------------------------------

/// Encode `header` and write it to `stream`.
pub async fn write_transfer_header<W>(stream: &mut W, header: &TransferHeader) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // ---
    if header.name_segments.len() > MAX_SEGMENTS {
        return Err(PeerwayError::Protocol(format!(
            "file name has {} segments, max {MAX_SEGMENTS}",
            header.name_segments.len()
        )));
    }

    let mut fixed = [0u8; FIXED_HEADER_LEN];
    fixed[0..2].copy_from_slice(&TRANSFER_VERSION.to_be_bytes());
    fixed[2..4].copy_from_slice(&header.header_type.as_u16().to_be_bytes());
    fixed[4..6].copy_from_slice(&header.total_files.to_be_bytes());
    fixed[6..8].copy_from_slice(&header.files_remaining.to_be_bytes());
    fixed[8..16].copy_from_slice(&header.total_size.to_be_bytes());
    fixed[16..24].copy_from_slice(&header.file_size.to_be_bytes());
    fixed[24..32].copy_from_slice(&header.bytes_received.to_be_bytes());
    fixed[32..36].copy_from_slice(&header.checksum.to_be_bytes());
    fixed[36..40].copy_from_slice(&header.received_checksum.to_be_bytes());
    fixed[40..48].copy_from_slice(&header.modified_time.to_be_bytes());
    fixed[48..50].copy_from_slice(&(header.name_segments.len() as u16).to_be_bytes());

    stream.write_all(&fixed).await?;

    for segment in &header.name_segments {
        let bytes = segment.as_bytes();
        if bytes.len() > MAX_SEGMENT_LEN {
            return Err(PeerwayError::Protocol(format!(
                "file name segment of {} bytes, max {MAX_SEGMENT_LEN}",
                bytes.len()
            )));
        }
        stream.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
        stream.write_all(bytes).await?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// read_transfer_header
// ---------------------------------------------------------------------------

/// Read and decode one [`TransferHeader`] from `stream`.
///
/// Rejects unknown versions and header types, and oversized names.
pub async fn read_transfer_header<R>(stream: &mut R) -> Result<TransferHeader>
where
    R: AsyncRead + Unpin,
{
    // ---
    let mut fixed = [0u8; FIXED_HEADER_LEN];
    stream.read_exact(&mut fixed).await?;

    let version = u16::from_be_bytes([fixed[0], fixed[1]]);
    if version != TRANSFER_VERSION {
        return Err(PeerwayError::Protocol(format!(
            "unsupported transfer header version {version:#06x}"
        )));
    }

    let raw_type = u16::from_be_bytes([fixed[2], fixed[3]]);
    let header_type = HeaderType::from_wire(raw_type).ok_or_else(|| {
        PeerwayError::Protocol(format!("unknown transfer header type {raw_type:#06x}"))
    })?;

    let segment_count = u16::from_be_bytes([fixed[48], fixed[49]]) as usize;
    if segment_count > MAX_SEGMENTS {
        return Err(PeerwayError::Protocol(format!(
            "file name has {segment_count} segments, max {MAX_SEGMENTS}"
        )));
    }

    let mut name_segments = Vec::with_capacity(segment_count);
    for _ in 0..segment_count {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len > MAX_SEGMENT_LEN {
            return Err(PeerwayError::Protocol(format!(
                "file name segment of {len} bytes, max {MAX_SEGMENT_LEN}"
            )));
        }
        let mut bytes = vec![0u8; len];
        stream.read_exact(&mut bytes).await?;
        let segment = String::from_utf8(bytes)
            .map_err(|_| PeerwayError::Protocol("file name segment is not UTF-8".into()))?;
        name_segments.push(segment);
    }

    Ok(TransferHeader {
        header_type,
        total_files: u16::from_be_bytes([fixed[4], fixed[5]]),
        files_remaining: u16::from_be_bytes([fixed[6], fixed[7]]),
        total_size: u64::from_be_bytes(fixed[8..16].try_into().unwrap()),
        file_size: u64::from_be_bytes(fixed[16..24].try_into().unwrap()),
        bytes_received: u64::from_be_bytes(fixed[24..32].try_into().unwrap()),
        checksum: u32::from_be_bytes(fixed[32..36].try_into().unwrap()),
        received_checksum: u32::from_be_bytes(fixed[36..40].try_into().unwrap()),
        modified_time: u64::from_be_bytes(fixed[40..48].try_into().unwrap()),
        name_segments,
    })
}

// ---------------------------------------------------------------------------
// expect_header
// ---------------------------------------------------------------------------

/// Read one header and require a specific type.
///
/// The state machine advances on exact expectations; anything else is a
/// fatal protocol error for this transfer — no guessed recovery.
pub async fn expect_header<R>(stream: &mut R, expected: HeaderType) -> Result<TransferHeader>
where
    R: AsyncRead + Unpin,
{
    // ---
    let header = read_transfer_header(stream).await?;
    if header.header_type != expected {
        return Err(PeerwayError::Protocol(format!(
            "expected {expected:?} header, got {:?}",
            header.header_type
        )));
    }
    Ok(header)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
