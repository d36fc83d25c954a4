//! [`PeerLink`] — connection-level facade.
//!
//! Ties together the pieces that share one connection's fate: the
//! dispatch scheduler, the session directory, and every transfer spawned
//! under them.  Stopping the link cancels all derived transfers, stops
//! the scheduler, and leaves the directory consistent.

use std::sync::Arc;
use std::time::Duration;

// ---

use tokio::sync::Mutex;

// ---

use peerway_domain::RendezvousCodec;
use peerway_throttle::{DispatchScheduler, SchedulerConfig};

// ---

use super::directory::{spawn_evictor, RendezvousDirectory};
use super::transfer::TransferHandle;

// ---------------------------------------------------------------------------
// LinkConfig
// ---------------------------------------------------------------------------

/// Link-wide housekeeping tunables.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    // ---
    pub scheduler: SchedulerConfig,

    /// Idle threshold for the session eviction sweep.
    pub session_idle_timeout: Duration,

    /// How often the eviction sweep runs.
    pub eviction_interval: Duration,
}

// ---

impl Default for LinkConfig {
    fn default() -> Self {
        // ---
        Self {
            scheduler: SchedulerConfig::default(),
            session_idle_timeout: Duration::from_secs(600),
            eviction_interval: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// PeerLink
// ---------------------------------------------------------------------------

/// One connection's engine: scheduler + directory + active transfers.
pub struct PeerLink {
    // ---
    scheduler: Arc<DispatchScheduler>,
    directory: Arc<RendezvousDirectory>,
    transfers: Mutex<Vec<TransferHandle>>,
}

// ---

impl PeerLink {
    // ---

    /// Assemble a link around an already-constructed scheduler, start the
    /// flush loop, and arm the session eviction sweep.
    pub fn new(
        scheduler: Arc<DispatchScheduler>,
        codec: Arc<dyn RendezvousCodec>,
        config: LinkConfig,
    ) -> Arc<Self> {
        // ---
        let directory = Arc::new(RendezvousDirectory::new(Arc::clone(&scheduler), codec));
        spawn_evictor(
            &directory,
            config.eviction_interval,
            config.session_idle_timeout,
        );
        scheduler.start();

        Arc::new(Self {
            scheduler,
            directory,
            transfers: Mutex::new(Vec::new()),
        })
    }

    // ---

    pub fn scheduler(&self) -> &Arc<DispatchScheduler> {
        &self.scheduler
    }

    pub fn directory(&self) -> &Arc<RendezvousDirectory> {
        &self.directory
    }

    // ---

    /// Track a transfer so link shutdown can reach it.
    ///
    /// Finished transfers are reaped opportunistically on each call.
    pub async fn register_transfer(&self, handle: TransferHandle) {
        // ---
        let mut transfers = self.transfers.lock().await;
        transfers.retain(|t| !t.state().is_terminal());
        transfers.push(handle);
    }

    pub async fn active_transfer_count(&self) -> usize {
        // ---
        self.transfers
            .lock()
            .await
            .iter()
            .filter(|t| !t.state().is_terminal())
            .count()
    }

    // ---

    /// Stop the connection: cancel every derived transfer (closing their
    /// channels and releasing file handles), then stop the scheduler.
    pub async fn shutdown(&self) {
        // ---
        let transfers: Vec<TransferHandle> = {
            let mut guard = self.transfers.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in &transfers {
            handle.cancel();
        }
        for handle in transfers {
            handle.join().await;
        }

        self.scheduler.stop();
        tracing::info!("link shut down");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use async_trait::async_trait;

    use peerway_domain::{
        //
        PeerId,
        RendezvousCommand,
        Result,
        SessionId,
        TransferHandler,
        TransferState,
        WireSink,
    };

    use crate::transfer::{ReceiveTransfer, TransferConfig, TransferTarget};

    use super::*;

    // ---

    struct NullSink;

    #[async_trait]
    impl WireSink for NullSink {
        async fn send_frame(&self, _payload: Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    struct NullCodec;

    impl RendezvousCodec for NullCodec {
        fn encode_command(&self, _peer: &PeerId, _command: &RendezvousCommand) -> Vec<u8> {
            Vec::new()
        }

        fn encode_response(
            &self,
            _peer: &PeerId,
            _session: SessionId,
            _code: u16,
            _payload: &[u8],
        ) -> Vec<u8> {
            Vec::new()
        }
    }

    struct NullHandler;

    #[async_trait]
    impl TransferHandler for NullHandler {}

    // ---

    /// Stopping the link cancels derived transfers and stops the
    /// scheduler loop.
    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_cancels_transfers_and_scheduler() {
        // ---
        let scheduler = Arc::new(DispatchScheduler::new(
            Arc::new(NullSink),
            SchedulerConfig::default(),
        ));
        let link = PeerLink::new(
            Arc::clone(&scheduler),
            Arc::new(NullCodec),
            LinkConfig::default(),
        );
        assert!(scheduler.is_running());

        // A receiver wedged on a channel nobody writes to.
        let (quiet, channel) = tokio::io::duplex(1024);
        let dir = tempfile::tempdir().unwrap();
        let handle = ReceiveTransfer::spawn(
            dir.path().to_path_buf(),
            false,
            TransferTarget::Channel(Box::new(channel)),
            Arc::new(NullHandler),
            TransferConfig::default(),
        );
        let state_rx = handle.state_rx();
        link.register_transfer(handle).await;
        assert_eq!(link.active_transfer_count().await, 1);

        link.shutdown().await;

        assert_eq!(*state_rx.borrow(), TransferState::Failed);
        assert!(!scheduler.is_running());
        assert_eq!(link.active_transfer_count().await, 0);
        drop(quiet);
    }
}
