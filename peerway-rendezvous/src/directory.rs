//! [`RendezvousDirectory`] — owns every rendezvous session of a
//! connection and routes inbound traffic to session handlers.
//!
//! # Locking discipline
//!
//! Session lookup/creation happens under one exclusive lock; handler
//! fan-out happens strictly outside it, over a pruned snapshot of `Weak`
//! registrations.  A handler that re-enters the directory from inside a
//! callback therefore cannot deadlock, and one added or removed
//! mid-dispatch is never double-invoked or skipped.
//!
//! # Ownership
//!
//! The directory owns sessions by id; handlers and controllers hold only
//! non-owning references.  Sessions with no live handler and no recent
//! activity are dropped by the eviction sweep ([`spawn_evictor`]), so the
//! id map cannot grow without bound over a long-lived connection.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

// ---

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ---

use peerway_domain::{
    //
    DirectoryHandler,
    PeerId,
    RateClassId,
    RendezvousCodec,
    RendezvousCommand,
    RendezvousEvent,
    Result,
    SessionHandler,
    SessionId,
};

// ---

use peerway_throttle::DispatchScheduler;

// ---------------------------------------------------------------------------
// RendezvousSession
// ---------------------------------------------------------------------------

/// One logical peer-to-peer channel, shared by id with the remote party.
///
/// Created lazily on first inbound or outbound reference; silent until
/// the first message flows.
pub struct RendezvousSession {
    // ---
    id: SessionId,
    peer: PeerId,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    handlers: Mutex<Vec<Weak<dyn SessionHandler>>>,
}

// ---

impl RendezvousSession {
    // ---

    fn new(id: SessionId, peer: PeerId) -> Arc<Self> {
        // ---
        let now = Instant::now();
        Arc::new(Self {
            id,
            peer,
            created_at: now,
            last_activity: Mutex::new(now),
            handlers: Mutex::new(Vec::new()),
        })
    }

    // ---

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    // ---

    /// Register a handler.  The session keeps only a `Weak` reference —
    /// dropping the handler deregisters it.
    pub async fn add_handler<H>(&self, handler: &Arc<H>)
    where
        H: SessionHandler + 'static,
    {
        // ---
        let handler: Arc<dyn SessionHandler> = handler.clone();
        let weak: Weak<dyn SessionHandler> = Arc::downgrade(&handler);
        self.handlers.lock().await.push(weak);
    }

    // ---

    /// Live handlers, pruning dead registrations as a side effect.
    async fn snapshot_handlers(&self) -> Vec<Arc<dyn SessionHandler>> {
        // ---
        let mut handlers = self.handlers.lock().await;
        handlers.retain(|weak| weak.strong_count() > 0);
        handlers.iter().filter_map(Weak::upgrade).collect()
    }

    // ---

    async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    async fn idle_for(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }

    async fn has_live_handlers(&self) -> bool {
        self.handlers
            .lock()
            .await
            .iter()
            .any(|weak| weak.strong_count() > 0)
    }
}

// ---------------------------------------------------------------------------
// RendezvousDirectory
// ---------------------------------------------------------------------------

struct DirectoryState {
    // ---
    sessions: HashMap<u64, Arc<RendezvousSession>>,

    /// Next locally-initiated session id.
    next_outbound: u64,
}

// ---

/// Maps session ids to sessions, creates them lazily, and fans protocol
/// events out to their handlers.
pub struct RendezvousDirectory {
    // ---
    state: Mutex<DirectoryState>,
    handlers: Mutex<Vec<Weak<dyn DirectoryHandler>>>,
    scheduler: Arc<DispatchScheduler>,
    codec: Arc<dyn RendezvousCodec>,
}

// ---

impl RendezvousDirectory {
    // ---

    pub fn new(scheduler: Arc<DispatchScheduler>, codec: Arc<dyn RendezvousCodec>) -> Self {
        // ---
        Self {
            state: Mutex::new(DirectoryState {
                sessions: HashMap::new(),
                next_outbound: 1,
            }),
            handlers: Mutex::new(Vec::new()),
            scheduler,
            codec,
        }
    }

    // ---

    /// Register a directory-level handler (new-session notifications).
    pub async fn add_handler<H>(&self, handler: &Arc<H>)
    where
        H: DirectoryHandler + 'static,
    {
        // ---
        let handler: Arc<dyn DirectoryHandler> = handler.clone();
        let weak: Weak<dyn DirectoryHandler> = Arc::downgrade(&handler);
        self.handlers.lock().await.push(weak);
    }

    // ---

    /// Allocate a fresh locally-initiated session.
    ///
    /// No notification fires — the session is silent until traffic flows.
    pub async fn create_outbound_session(&self, peer: PeerId) -> Arc<RendezvousSession> {
        // ---
        let mut state = self.state.lock().await;
        let id = SessionId::from_u64(state.next_outbound);
        state.next_outbound += 1;

        let session = RendezvousSession::new(id, peer);
        state.sessions.insert(id.as_u64(), Arc::clone(&session));
        tracing::debug!(session = %id, peer = %session.peer, "outbound session created");
        session
    }

    // ---

    /// Existing session for `id`, or a newly registered one.
    ///
    /// Both locally- and peer-initiated paths funnel through here, so
    /// exactly one session object exists per id for the connection's
    /// lifetime.  Fires `on_new_session` to directory handlers — outside
    /// the lock, exactly once per id.
    pub async fn lookup_or_create_inbound(
        &self,
        id: SessionId,
        peer: &PeerId,
    ) -> Arc<RendezvousSession> {
        // ---
        let (session, created) = {
            let mut state = self.state.lock().await;
            match state.sessions.get(&id.as_u64()).cloned() {
                Some(session) => (session, false),
                None => {
                    let session = RendezvousSession::new(id, peer.clone());
                    state.sessions.insert(id.as_u64(), Arc::clone(&session));
                    (session, true)
                }
            }
        };

        if created {
            tracing::info!(session = %id, peer = %peer, "new incoming session");
            for handler in self.snapshot_handlers().await {
                handler.on_new_session(id, peer.clone()).await;
            }
        }
        session
    }

    // ---

    /// Session for `id`, if one exists.
    pub async fn lookup(&self, id: SessionId) -> Option<Arc<RendezvousSession>> {
        // ---
        self.state.lock().await.sessions.get(&id.as_u64()).cloned()
    }

    // ---

    /// Route one inbound rendezvous command or status response to its
    /// session's handlers, creating the session on first reference.
    /// Events reach handlers in network-receive order.
    pub async fn dispatch_received(&self, peer: &PeerId, id: SessionId, event: RendezvousEvent) {
        // ---
        let session = self.lookup_or_create_inbound(id, peer).await;
        session.touch().await;

        let handlers = session.snapshot_handlers().await;
        if handlers.is_empty() {
            tracing::debug!(session = %id, "event with no session handlers registered");
        }

        match event {
            RendezvousEvent::Command(command) => {
                for handler in &handlers {
                    handler.on_command(id, command.clone()).await;
                }
            }
            RendezvousEvent::Response { code, payload } => {
                for handler in &handlers {
                    handler.on_response(id, code, payload.clone()).await;
                }
            }
        }
    }

    // ---

    /// Encode a rendezvous command and submit it through the rate-limited
    /// dispatch path on `class`.
    pub async fn send_command(
        &self,
        class: RateClassId,
        peer: &PeerId,
        command: &RendezvousCommand,
    ) -> Result<oneshot::Receiver<()>> {
        // ---
        if let Some(session) = self.lookup(command.session).await {
            session.touch().await;
        }
        let payload = self.codec.encode_command(peer, command);
        self.scheduler.enqueue(class, payload).await
    }

    // ---

    /// Encode a free-form status response and submit it through the
    /// rate-limited dispatch path on `class`.
    pub async fn send_response(
        &self,
        class: RateClassId,
        peer: &PeerId,
        session: SessionId,
        code: u16,
        payload: &[u8],
    ) -> Result<oneshot::Receiver<()>> {
        // ---
        if let Some(session) = self.lookup(session).await {
            session.touch().await;
        }
        let frame = self.codec.encode_response(peer, session, code, payload);
        self.scheduler.enqueue(class, frame).await
    }

    // ---

    /// Drop sessions with no live handler and no activity for
    /// `idle_timeout`.  Returns how many were evicted.
    pub async fn evict_idle(&self, idle_timeout: Duration) -> usize {
        // ---
        // Collect candidates without holding the state lock across the
        // per-session checks.
        let sessions: Vec<Arc<RendezvousSession>> = {
            let state = self.state.lock().await;
            state.sessions.values().cloned().collect()
        };

        let mut evict = Vec::new();
        for session in sessions {
            if !session.has_live_handlers().await && session.idle_for().await >= idle_timeout {
                evict.push(session.id());
            }
        }

        let mut state = self.state.lock().await;
        let mut evicted = 0;
        for id in evict {
            if state.sessions.remove(&id.as_u64()).is_some() {
                tracing::debug!(session = %id, "idle session evicted");
                evicted += 1;
            }
        }
        evicted
    }

    // ---

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    // ---

    async fn snapshot_handlers(&self) -> Vec<Arc<dyn DirectoryHandler>> {
        // ---
        let mut handlers = self.handlers.lock().await;
        handlers.retain(|weak| weak.strong_count() > 0);
        handlers.iter().filter_map(Weak::upgrade).collect()
    }
}

// ---------------------------------------------------------------------------
// Evictor task
// ---------------------------------------------------------------------------

/// Run [`RendezvousDirectory::evict_idle`] on an interval.
///
/// Holds only a `Weak` reference; the task exits once the directory is
/// dropped.
pub fn spawn_evictor(
    directory: &Arc<RendezvousDirectory>,
    interval: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    // ---
    let directory = Arc::downgrade(directory);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(directory) = directory.upgrade() else {
                return;
            };
            let evicted = directory.evict_idle(idle_timeout).await;
            if evicted > 0 {
                tracing::info!(evicted, "session eviction sweep");
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
