//! End-to-end transfer scenarios over in-memory duplex channels.
//!
//! The two controllers talk to each other exactly as they would over a
//! socket; the duplex pipe stands in for the network so every scenario —
//! including the interrupted-then-resumed one — is deterministic.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

// ---

use peerway_domain::{
    //
    FailureKind,
    TransferHandler,
    TransferOutcome,
    TransferState,
};

// ---

use peerway_rendezvous::transfer::checksum_bytes;
use peerway_rendezvous::{
    //
    HeaderType,
    ReceiveTransfer,
    SendTransfer,
    TransferConfig,
    TransferFile,
    TransferHeader,
    TransferJob,
    TransferTarget,
};

// ---------------------------------------------------------------------------
// Test harness
// ---------------------------------------------------------------------------

/// Records every callback for later assertions.
#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<TransferState>>,
    outcomes: Mutex<Vec<TransferOutcome>>,
    files_done: AtomicUsize,
    progress_events: AtomicUsize,
}

// ---

#[async_trait]
impl TransferHandler for Recorder {
    async fn on_state(&self, state: TransferState) {
        self.states.lock().unwrap().push(state);
    }

    async fn on_progress(&self, _file_index: usize, _bytes: u64, _total: u64) {
        self.progress_events.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_file_done(&self, _file_index: usize) {
        self.files_done.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_finished(&self, outcome: TransferOutcome) {
        self.outcomes.lock().unwrap().push(outcome);
    }
}

// ---

impl Recorder {
    // ---
    fn outcome(&self) -> TransferOutcome {
        let outcomes = self.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1, "terminal event must fire exactly once");
        outcomes[0].clone()
    }

    fn succeeded_bytes(&self) -> u64 {
        match self.outcome() {
            TransferOutcome::Succeeded { bytes_transferred } => bytes_transferred,
            TransferOutcome::Failed { kind, reason } => {
                panic!("expected success, failed with {kind:?}: {reason}")
            }
        }
    }

    fn failure_kind(&self) -> FailureKind {
        match self.outcome() {
            TransferOutcome::Failed { kind, .. } => kind,
            TransferOutcome::Succeeded { .. } => panic!("expected failure, succeeded"),
        }
    }
}

// ---

/// Logging for debugging a failing scenario; output only shows for the
/// failing test thanks to the test writer.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ---

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

// ---

async fn write_source(dir: &Path, name: &str, data: &[u8]) -> TransferFile {
    let path = dir.join(name);
    tokio::fs::write(&path, data).await.unwrap();
    TransferFile::probe(&path).await.unwrap()
}

// ---

fn channel_pair() -> (TransferTarget, TransferTarget) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        TransferTarget::Channel(Box::new(a)),
        TransferTarget::Channel(Box::new(b)),
    )
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn clean_transfer_end_to_end() -> anyhow::Result<()> {
    // ---
    init_tracing();
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let data = pattern(300_000);
    let file = write_source(src.path(), "payload.bin", &data).await;

    let (send_target, recv_target) = channel_pair();
    let send_rec = Arc::new(Recorder::default());
    let recv_rec = Arc::new(Recorder::default());

    let sender = SendTransfer::spawn(
        TransferJob::new(vec![file]),
        send_target,
        Arc::clone(&send_rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );
    let receiver = ReceiveTransfer::spawn(
        dst.path().to_path_buf(),
        false,
        recv_target,
        Arc::clone(&recv_rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );

    sender.join().await;
    receiver.join().await;

    assert_eq!(send_rec.succeeded_bytes(), 300_000);
    assert_eq!(recv_rec.succeeded_bytes(), 300_000);
    assert_eq!(send_rec.files_done.load(Ordering::SeqCst), 1);
    assert!(send_rec.progress_events.load(Ordering::SeqCst) >= 1);

    let received = tokio::fs::read(dst.path().join("payload.bin")).await?;
    assert_eq!(received, data);

    // Both sides walked through the verification phase.
    for rec in [&send_rec, &recv_rec] {
        let states = rec.states.lock().unwrap().clone();
        assert!(states.contains(&TransferState::Transferring));
        assert!(states.contains(&TransferState::ChecksumVerify));
        assert_eq!(states.last(), Some(&TransferState::Succeeded));
    }
    Ok(())
}

// ---

/// The resume round trip: attempt one moves [0, K) and dies; attempt two
/// must move exactly [K, N) and the assembled file must carry the
/// full-file checksum.
#[tokio::test(flavor = "multi_thread")]
async fn interrupted_transfer_resumes_at_verified_offset() {
    // ---
    init_tracing();
    const N: usize = 300_000;
    const K: usize = 96 * 1024;

    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let data = pattern(N);
    let file = write_source(src.path(), "payload.bin", &data).await;
    let full_checksum = checksum_bytes(&data);

    // --- Attempt one: a sender that dies after K bytes. -------------------
    let (wire, recv_target) = {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (a, TransferTarget::Channel(Box::new(b)))
    };
    let rec1 = Arc::new(Recorder::default());
    let receiver = ReceiveTransfer::spawn(
        dst.path().to_path_buf(),
        true,
        recv_target,
        Arc::clone(&rec1) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );

    let mut wire = wire;
    let header = TransferHeader {
        header_type: HeaderType::Send,
        total_files: 1,
        files_remaining: 1,
        total_size: N as u64,
        file_size: N as u64,
        bytes_received: 0,
        checksum: full_checksum,
        received_checksum: 0,
        modified_time: 0,
        name_segments: vec!["payload.bin".into()],
    };
    peerway_rendezvous::transfer::write_transfer_header(&mut wire, &header)
        .await
        .unwrap();

    let ack = peerway_rendezvous::transfer::read_transfer_header(&mut wire)
        .await
        .unwrap();
    assert_eq!(ack.header_type, HeaderType::Ack, "fresh start expected");

    wire.write_all(&data[..K]).await.unwrap();
    wire.flush().await.unwrap();
    drop(wire); // the "network" dies here

    receiver.join().await;
    assert_eq!(rec1.failure_kind(), FailureKind::Connectivity);

    let partial = tokio::fs::read(dst.path().join("payload.bin")).await.unwrap();
    assert_eq!(partial.len(), K, "attempt one must leave exactly [0, K)");

    // --- Attempt two: real controllers, resume enabled. -------------------
    let (send_target, recv_target) = channel_pair();
    let send_rec = Arc::new(Recorder::default());
    let recv_rec = Arc::new(Recorder::default());

    let sender = SendTransfer::spawn(
        TransferJob::new(vec![file]),
        send_target,
        Arc::clone(&send_rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );
    let receiver = ReceiveTransfer::spawn(
        dst.path().to_path_buf(),
        true,
        recv_target,
        Arc::clone(&recv_rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );

    sender.join().await;
    receiver.join().await;

    // Exactly [K, N) moved on attempt two — the resume offset was honoured.
    assert_eq!(send_rec.succeeded_bytes(), (N - K) as u64);
    assert_eq!(recv_rec.succeeded_bytes(), (N - K) as u64);

    let received = tokio::fs::read(dst.path().join("payload.bin")).await.unwrap();
    assert_eq!(received.len(), N);
    assert_eq!(checksum_bytes(&received), full_checksum);
    assert_eq!(received, data);
}

// ---

/// A resume claim over corrupted partial data must be refused: the
/// sender restarts at offset zero and the final file still verifies.
#[tokio::test(flavor = "multi_thread")]
async fn corrupted_partial_restarts_at_zero() {
    // ---
    const N: usize = 200_000;
    const K: usize = 64 * 1024;

    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let data = pattern(N);
    let file = write_source(src.path(), "payload.bin", &data).await;

    // Plant K bytes of garbage where the partial file would be.
    let garbage: Vec<u8> = vec![0xAA; K];
    tokio::fs::write(dst.path().join("payload.bin"), &garbage)
        .await
        .unwrap();

    let (send_target, recv_target) = channel_pair();
    let send_rec = Arc::new(Recorder::default());
    let recv_rec = Arc::new(Recorder::default());

    let sender = SendTransfer::spawn(
        TransferJob::new(vec![file]),
        send_target,
        Arc::clone(&send_rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );
    let receiver = ReceiveTransfer::spawn(
        dst.path().to_path_buf(),
        true,
        recv_target,
        Arc::clone(&recv_rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );

    sender.join().await;
    receiver.join().await;

    // The whole file moved — the bogus claim bought the peer nothing.
    assert_eq!(send_rec.succeeded_bytes(), N as u64);

    let received = tokio::fs::read(dst.path().join("payload.bin")).await.unwrap();
    assert_eq!(received, data);
}

// ---

#[tokio::test(flavor = "multi_thread")]
async fn multi_file_job_delivers_in_order() {
    // ---
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();

    let first = pattern(150_000);
    let second = pattern(40_000);
    let file_a = write_source(src.path(), "a.bin", &first).await;
    let file_b = write_source(src.path(), "b.bin", &second).await;

    let (send_target, recv_target) = channel_pair();
    let send_rec = Arc::new(Recorder::default());
    let recv_rec = Arc::new(Recorder::default());

    let sender = SendTransfer::spawn(
        TransferJob::new(vec![file_a, file_b]),
        send_target,
        Arc::clone(&send_rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );
    let receiver = ReceiveTransfer::spawn(
        dst.path().to_path_buf(),
        false,
        recv_target,
        Arc::clone(&recv_rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );

    sender.join().await;
    receiver.join().await;

    assert_eq!(send_rec.succeeded_bytes(), 190_000);
    assert_eq!(send_rec.files_done.load(Ordering::SeqCst), 2);
    assert_eq!(recv_rec.files_done.load(Ordering::SeqCst), 2);

    let got_a = tokio::fs::read(dst.path().join("a.bin")).await.unwrap();
    let got_b = tokio::fs::read(dst.path().join("b.bin")).await.unwrap();
    assert_eq!(got_a, first);
    assert_eq!(got_b, second);
}

// ---

#[tokio::test(flavor = "multi_thread")]
async fn zero_byte_file_verifies() {
    // ---
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let file = write_source(src.path(), "empty.bin", &[]).await;

    let (send_target, recv_target) = channel_pair();
    let send_rec = Arc::new(Recorder::default());
    let recv_rec = Arc::new(Recorder::default());

    let sender = SendTransfer::spawn(
        TransferJob::new(vec![file]),
        send_target,
        Arc::clone(&send_rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );
    let receiver = ReceiveTransfer::spawn(
        dst.path().to_path_buf(),
        false,
        recv_target,
        Arc::clone(&recv_rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );

    sender.join().await;
    receiver.join().await;

    assert_eq!(send_rec.succeeded_bytes(), 0);
    let received = tokio::fs::read(dst.path().join("empty.bin")).await.unwrap();
    assert!(received.is_empty());
}

// ---

/// Cancellation mid-transfer: the worker stops without further I/O and
/// reports a terminal Cancelled outcome exactly once.
#[tokio::test(flavor = "multi_thread")]
async fn cancel_mid_transfer_reports_cancelled() {
    // ---
    let src = tempfile::tempdir().unwrap();
    let data = pattern(2_000_000);
    let file = write_source(src.path(), "big.bin", &data).await;

    // Tiny pipe and a peer that acknowledges the header, then never
    // reads again: the sender wedges inside the byte loop.
    let (mut wire, b) = tokio::io::duplex(8 * 1024);
    let send_rec = Arc::new(Recorder::default());
    let sender = SendTransfer::spawn(
        TransferJob::new(vec![file]),
        TransferTarget::Channel(Box::new(b)),
        Arc::clone(&send_rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );

    let peer = tokio::spawn(async move {
        let header = peerway_rendezvous::transfer::read_transfer_header(&mut wire)
            .await
            .unwrap();
        assert_eq!(header.header_type, HeaderType::Send);
        let ack = TransferHeader::bare(HeaderType::Ack);
        peerway_rendezvous::transfer::write_transfer_header(&mut wire, &ack)
            .await
            .unwrap();
        // Hold the channel open without draining it.
        std::future::pending::<()>().await;
    });

    // Wait until bytes are actually flowing, then pull the plug.
    let mut state_rx = sender.state_rx();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *state_rx.borrow() != TransferState::Transferring {
            state_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("sender never reached Transferring");

    sender.cancel();
    sender.join().await;

    assert_eq!(send_rec.failure_kind(), FailureKind::Cancelled);
    peer.abort();
}

// ---

#[tokio::test(flavor = "multi_thread")]
async fn empty_job_is_refused() {
    // ---
    let (send_target, _recv_target) = channel_pair();
    let rec = Arc::new(Recorder::default());

    let sender = SendTransfer::spawn(
        TransferJob::new(Vec::new()),
        send_target,
        Arc::clone(&rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );
    sender.join().await;

    assert_eq!(rec.failure_kind(), FailureKind::Protocol);
}

// ---

/// Nested wire names land under the receive root; hostile ones are
/// rejected before any byte is written.
#[tokio::test(flavor = "multi_thread")]
async fn nested_names_stay_under_the_receive_root() {
    // ---
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let data = pattern(10_000);

    let mut file = write_source(src.path(), "q3.pdf", &data).await;
    file.segments = vec!["reports".into(), "q3.pdf".into()];

    let (send_target, recv_target) = channel_pair();
    let send_rec = Arc::new(Recorder::default());
    let recv_rec = Arc::new(Recorder::default());

    let sender = SendTransfer::spawn(
        TransferJob::new(vec![file]),
        send_target,
        Arc::clone(&send_rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );
    let receiver = ReceiveTransfer::spawn(
        dst.path().to_path_buf(),
        false,
        recv_target,
        Arc::clone(&recv_rec) as Arc<dyn TransferHandler>,
        TransferConfig::default(),
    );

    sender.join().await;
    receiver.join().await;

    let received: Vec<u8> =
        tokio::fs::read(PathBuf::from(dst.path()).join("reports").join("q3.pdf"))
            .await
            .unwrap();
    assert_eq!(received, data);
}
