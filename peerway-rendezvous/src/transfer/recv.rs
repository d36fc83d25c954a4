//! Receiver-side transfer controller.
//!
//! Mirrors the sender: for each announced file, either acknowledge a
//! fresh start or claim a resume offset backed by a checksum of the
//! partial file already on disk.  After the last byte the full file is
//! re-read and checksummed (deadline paused) — the final ACK carries the
//! verified byte count and checksum, and a disagreement with the
//! sender's claim fails the transfer.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ---

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

// ---

use peerway_domain::{
    //
    ByteChannel,
    PeerwayError,
    Result,
    TransferHandler,
    TransferState,
};

// ---

use super::checksum::{checksum_file, checksum_prefix};
use super::connect::{acquire, TransferTarget};
use super::headers::{
    //
    expect_header,
    write_transfer_header,
    HeaderType,
    TransferHeader,
};
use super::{sanitized_relative_path, TransferConfig, TransferCtx, TransferHandle};

// ---------------------------------------------------------------------------
// ReceiveTransfer
// ---------------------------------------------------------------------------

/// Receiver-side controller.  One spawned worker per job.
pub struct ReceiveTransfer;

// ---

impl ReceiveTransfer {
    // ---

    /// Start receiving into `dest_dir` from the peer reachable via
    /// `target`.  Set `resume` to pick up partial files left by an
    /// earlier interrupted attempt.
    pub fn spawn(
        dest_dir: PathBuf,
        resume: bool,
        target: TransferTarget,
        handler: Arc<dyn TransferHandler>,
        config: TransferConfig,
    ) -> TransferHandle {
        // ---
        TransferCtx::spawn(handler, config, move |ctx| {
            drive_recv(ctx, dest_dir, resume, target)
        })
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn drive_recv(
    ctx: Arc<TransferCtx>,
    dest_dir: PathBuf,
    resume: bool,
    target: TransferTarget,
) -> Result<u64> {
    // ---
    let mut channel = acquire(&ctx, target).await?;

    let mut bytes_moved = 0u64;
    let mut index = 0usize;

    loop {
        ctx.set_state(TransferState::Transferring).await;

        let header = ctx.step(expect_header(&mut channel, HeaderType::Send)).await?;
        ctx.deadline.touch();

        bytes_moved += receive_one_file(&ctx, &mut channel, &dest_dir, resume, &header, index).await?;
        ctx.handler().on_file_done(index).await;

        if header.files_remaining <= 1 {
            break;
        }
        index += 1;
    }

    Ok(bytes_moved)
}

// ---

async fn receive_one_file(
    ctx: &TransferCtx,
    channel: &mut ByteChannel,
    dest_dir: &Path,
    resume: bool,
    header: &TransferHeader,
    index: usize,
) -> Result<u64> {
    // ---
    let relative = sanitized_relative_path(&header.name_segments)?;
    let path = dest_dir.join(relative);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tracing::info!(
        name = %header.display_name(),
        size = header.file_size,
        "receiving file"
    );

    // Steps 2–3: claim a resume offset, or acknowledge a fresh start.
    let offset = negotiate_offset(ctx, channel, &path, resume, header).await?;

    // Step 4: raw bytes from the agreed offset.
    let received = write_file_bytes(ctx, channel, &path, header, index, offset).await?;

    // Step 5: verify what actually landed on disk, then report it.
    ctx.set_state(TransferState::ChecksumVerify).await;
    let full_checksum = ctx.checksum_step(checksum_file(&path)).await?;

    let mut fin = TransferHeader::bare(HeaderType::Ack);
    fin.file_size = header.file_size;
    fin.bytes_received = header.file_size;
    fin.checksum = header.checksum;
    fin.received_checksum = full_checksum;
    ctx.step(write_transfer_header(channel, &fin)).await?;
    ctx.step(async { Ok(channel.flush().await?) }).await?;

    if full_checksum != header.checksum {
        return Err(PeerwayError::Integrity {
            expected: header.checksum,
            actual: full_checksum,
        });
    }

    tracing::info!(name = %header.display_name(), received, "file received and verified");
    Ok(received)
}

// ---

/// Decide where this file starts.
///
/// A usable partial file (resume enabled, non-empty, no larger than the
/// announced size) produces a RESUME claim carrying our prefix checksum;
/// the sender settles the offset in a RESUME_SENDHEADER, which we bound
/// by our own length and confirm with RESUME_ACK.  Everything else is a
/// plain ACK at offset zero.
async fn negotiate_offset(
    ctx: &TransferCtx,
    channel: &mut ByteChannel,
    path: &Path,
    resume: bool,
    header: &TransferHeader,
) -> Result<u64> {
    // ---
    let existing = if resume {
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        }
    } else {
        0
    };

    if existing == 0 || existing > header.file_size {
        let ack = TransferHeader::bare(HeaderType::Ack);
        ctx.step(write_transfer_header(channel, &ack)).await?;
        ctx.step(async { Ok(channel.flush().await?) }).await?;
        return Ok(0);
    }

    // Local I/O failure while checksumming is not a mismatch — fail the
    // transfer rather than silently resuming at zero over a bad disk.
    let prefix_checksum = ctx.checksum_step(checksum_prefix(path, existing)).await?;

    let mut claim = TransferHeader::bare(HeaderType::Resume);
    claim.file_size = header.file_size;
    claim.bytes_received = existing;
    claim.checksum = header.checksum;
    claim.received_checksum = prefix_checksum;
    ctx.step(write_transfer_header(channel, &claim)).await?;
    ctx.step(async { Ok(channel.flush().await?) }).await?;

    let settled = ctx
        .step(expect_header(channel, HeaderType::ResumeSendHeader))
        .await?;
    ctx.deadline.touch();

    let offset = settled.bytes_received;
    if offset > existing {
        return Err(PeerwayError::Protocol(format!(
            "sender settled resume offset {offset} beyond our {existing} bytes"
        )));
    }

    let mut ack = TransferHeader::bare(HeaderType::ResumeAck);
    ack.bytes_received = offset;
    ctx.step(write_transfer_header(channel, &ack)).await?;
    ctx.step(async { Ok(channel.flush().await?) }).await?;

    tracing::info!(offset, existing, "resume offset settled");
    Ok(offset)
}

// ---

async fn write_file_bytes(
    ctx: &TransferCtx,
    channel: &mut ByteChannel,
    path: &Path,
    header: &TransferHeader,
    index: usize,
    offset: u64,
) -> Result<u64> {
    // ---
    let mut disk = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .await?;

    // Drop any tail beyond the agreed offset so a corrupt remainder can
    // never survive into the verified file.
    disk.set_len(offset).await?;
    if offset > 0 {
        disk.seek(SeekFrom::Start(offset)).await?;
    }

    let mut position = offset;
    let outcome = fill_from_channel(ctx, channel, &mut disk, header, index, &mut position).await;

    // Flush whatever landed, on every exit path — an interrupted attempt
    // must leave an intact partial file for the next resume.
    let flushed = disk.flush().await;
    outcome?;
    flushed?;

    Ok(position - offset)
}

// ---

async fn fill_from_channel(
    ctx: &TransferCtx,
    channel: &mut ByteChannel,
    disk: &mut File,
    header: &TransferHeader,
    index: usize,
    position: &mut u64,
) -> Result<()> {
    // ---
    let mut next_progress = *position + ctx.config.progress_interval;
    let mut buf = vec![0u8; ctx.config.chunk_size];

    while *position < header.file_size {
        let want = ((header.file_size - *position) as usize).min(buf.len());

        let n = ctx
            .step(async { Ok(channel.read(&mut buf[..want]).await?) })
            .await?;
        if n == 0 {
            return Err(PeerwayError::Transport(format!(
                "peer closed the channel at byte {position} of {}",
                header.file_size
            )));
        }

        ctx.step(async { Ok(disk.write_all(&buf[..n]).await?) })
            .await?;

        *position += n as u64;
        ctx.deadline.touch();

        while *position >= next_progress {
            ctx.handler()
                .on_progress(index, *position, header.file_size)
                .await;
            next_progress += ctx.config.progress_interval;
        }
    }

    Ok(())
}
