//! Sender-side transfer controller.
//!
//! Per-file sequence:
//!
//! 1. Checksum the file (deadline paused), write the SEND header.
//! 2. Read the peer's reply: ACK starts at zero, RESUME carries a
//!    claimed offset plus the peer's checksum of the bytes before it.
//! 3. A resume claim is honoured only after independently recomputing
//!    the checksum of our own first `claimed` bytes — a mismatch forces
//!    offset zero so we never resume on top of corrupted partial data.
//!    The settled offset goes back in a RESUME_SENDHEADER, answered by
//!    RESUME_ACK.
//! 4. Stream bytes from the agreed offset to end of file.
//! 5. Read the final ACK and verify the peer's byte count and checksum
//!    against our own records.
//!
//! Anything unexpected at any step fails the whole job; every opened
//! file handle is released on the way out.

use std::io::SeekFrom;
use std::sync::Arc;

// ---

use tokio::fs::File;
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
    read_transfer_header,
    write_transfer_header,
    HeaderType,
    TransferHeader,
};
use super::{TransferConfig, TransferCtx, TransferFile, TransferHandle, TransferJob};

// ---------------------------------------------------------------------------
// SendTransfer
// ---------------------------------------------------------------------------

/// Sender-side controller.  One spawned worker per job.
pub struct SendTransfer;

// ---

impl SendTransfer {
    // ---

    /// Start sending `job` to the peer reachable via `target`.
    pub fn spawn(
        job: TransferJob,
        target: TransferTarget,
        handler: Arc<dyn TransferHandler>,
        config: TransferConfig,
    ) -> TransferHandle {
        // ---
        TransferCtx::spawn(handler, config, move |ctx| drive_send(ctx, job, target))
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn drive_send(ctx: Arc<TransferCtx>, job: TransferJob, target: TransferTarget) -> Result<u64> {
    // ---
    if job.files.is_empty() {
        return Err(PeerwayError::Protocol("transfer job has no files".into()));
    }

    let mut channel = acquire(&ctx, target).await?;

    let mut bytes_moved = 0u64;
    for index in 0..job.files.len() {
        ctx.set_state(TransferState::Transferring).await;
        bytes_moved += send_one_file(&ctx, &mut channel, &job, index).await?;
        ctx.handler().on_file_done(index).await;
    }

    let _ = channel.shutdown().await;
    Ok(bytes_moved)
}

// ---

async fn send_one_file(
    ctx: &TransferCtx,
    channel: &mut ByteChannel,
    job: &TransferJob,
    index: usize,
) -> Result<u64> {
    // ---
    let file = &job.files[index];
    tracing::info!(name = %file.segments.join("/"), size = file.size, "sending file");

    // Step 1: whole-file checksum, then announce the file.
    let full_checksum = ctx.checksum_step(checksum_file(&file.path)).await?;

    let header = TransferHeader {
        header_type: HeaderType::Send,
        total_files: job.files.len() as u16,
        files_remaining: (job.files.len() - index) as u16,
        total_size: job.total_size(),
        file_size: file.size,
        bytes_received: 0,
        checksum: full_checksum,
        received_checksum: 0,
        modified_time: file.modified,
        name_segments: file.segments.clone(),
    };
    ctx.step(write_transfer_header(channel, &header)).await?;
    ctx.step(async { Ok(channel.flush().await?) }).await?;
    ctx.deadline.touch();

    // Step 2: the peer either starts fresh or claims a resume offset.
    let reply = ctx.step(read_transfer_header(channel)).await?;
    let offset = match reply.header_type {
        HeaderType::Ack => 0,
        HeaderType::Resume => {
            settle_resume(ctx, channel, file, &reply, full_checksum).await?
        }
        other => {
            return Err(PeerwayError::Protocol(format!(
                "expected Ack or Resume after Send, got {other:?}"
            )))
        }
    };

    // Step 4: raw bytes from the agreed offset.
    let sent = stream_file_bytes(ctx, channel, file, index, offset).await?;

    // Step 5: final acknowledgement — byte count and checksum must match
    // our own records.
    ctx.set_state(TransferState::ChecksumVerify).await;
    let fin = ctx.step(expect_header(channel, HeaderType::Ack)).await?;
    ctx.deadline.touch();

    if fin.bytes_received != file.size {
        return Err(PeerwayError::Protocol(format!(
            "peer reports {} bytes received, file is {}",
            fin.bytes_received, file.size
        )));
    }
    if fin.received_checksum != full_checksum {
        return Err(PeerwayError::Integrity {
            expected: full_checksum,
            actual: fin.received_checksum,
        });
    }

    tracing::info!(name = %file.segments.join("/"), sent, "file delivered and verified");
    Ok(sent)
}

// ---

/// Step 3: verify the peer's resume claim against our own disk before
/// honouring it.
///
/// A checksum mismatch silently restarts at zero.  An I/O failure while
/// recomputing is not a mismatch — it fails the transfer outright rather
/// than hiding a local disk fault behind a full retransmit.
async fn settle_resume(
    ctx: &TransferCtx,
    channel: &mut ByteChannel,
    file: &TransferFile,
    claim: &TransferHeader,
    full_checksum: u32,
) -> Result<u64> {
    // ---
    let claimed = claim.bytes_received;

    let offset = if claimed == 0 || claimed > file.size {
        0
    } else {
        let local_prefix = ctx
            .checksum_step(checksum_prefix(&file.path, claimed))
            .await?;
        if local_prefix == claim.received_checksum {
            claimed
        } else {
            tracing::warn!(
                claimed,
                "resume claim checksum mismatch — restarting at offset 0"
            );
            0
        }
    };

    let mut settle = TransferHeader::bare(HeaderType::ResumeSendHeader);
    settle.file_size = file.size;
    settle.bytes_received = offset;
    settle.checksum = full_checksum;
    settle.modified_time = file.modified;

    ctx.step(write_transfer_header(channel, &settle)).await?;
    ctx.step(async { Ok(channel.flush().await?) }).await?;
    ctx.step(expect_header(channel, HeaderType::ResumeAck)).await?;
    ctx.deadline.touch();

    tracing::info!(offset, "resume offset settled");
    Ok(offset)
}

// ---

async fn stream_file_bytes(
    ctx: &TransferCtx,
    channel: &mut ByteChannel,
    file: &TransferFile,
    index: usize,
    offset: u64,
) -> Result<u64> {
    // ---
    let mut disk = File::open(&file.path).await?;
    if offset > 0 {
        disk.seek(SeekFrom::Start(offset)).await?;
    }

    let mut position = offset;
    let mut next_progress = offset + ctx.config.progress_interval;
    let mut buf = vec![0u8; ctx.config.chunk_size];

    while position < file.size {
        let want = ((file.size - position) as usize).min(buf.len());

        let n = ctx
            .step(async { Ok(disk.read(&mut buf[..want]).await?) })
            .await?;
        if n == 0 {
            return Err(PeerwayError::Transport(format!(
                "file truncated mid-transfer at byte {position}"
            )));
        }

        ctx.step(async { Ok(channel.write_all(&buf[..n]).await?) })
            .await?;

        position += n as u64;
        ctx.deadline.touch();

        while position >= next_progress {
            ctx.handler().on_progress(index, position, file.size).await;
            next_progress += ctx.config.progress_interval;
        }
    }

    ctx.step(async { Ok(channel.flush().await?) }).await?;
    Ok(position - offset)
}
