//! Channel establishment: resolve, dial direct, fall back to the relay.
//!
//! The connecting side first tries a plain socket to the peer's
//! advertised endpoint within `connect_timeout`.  On failure — or when
//! direct connectivity is disallowed — it runs the relay handshake
//! (`proxy`) in whichever role the rendezvous negotiation assigned.

use std::net::SocketAddr;

// ---

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

// ---

use peerway_domain::{ByteChannel, PeerId, PeerwayError, Result, SessionId, TransferState};

// ---

use crate::proxy::{relay_accept, relay_initiate, relay_wait_ready};

// ---

use super::TransferCtx;

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// A host:port pair as advertised over rendezvous (unresolved).
#[derive(Debug, Clone)]
pub struct PeerEndpoint {
    // ---
    pub host: String,
    pub port: u16,
}

// ---

impl PeerEndpoint {
    // ---
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

// ---

/// Which half of the relay handshake this side runs.
#[derive(Debug, Clone)]
pub enum RelayRole {
    // ---
    /// Open the relay, learn the endpoint, advertise it to the peer
    /// (via `on_proxy_redirect`), wait for the peer to join.
    Initiate { relay: PeerEndpoint },

    /// Join the endpoint the peer advertised.
    Accept { relay: PeerEndpoint, port: u16 },
}

// ---

/// How to reach the peer for one transfer.
#[derive(Debug, Clone)]
pub struct ConnectPlan {
    // ---
    /// The peer's advertised direct endpoint, if it published one.
    pub direct: Option<PeerEndpoint>,

    /// Relay fallback; `None` means direct-or-nothing.
    pub relay: Option<RelayRole>,

    /// Session identity presented during the relay handshake.
    pub session: SessionId,

    /// Our identity presented during the relay handshake.
    pub local_name: PeerId,
}

// ---

/// Where a transfer's bytes flow.
pub enum TransferTarget {
    // ---
    /// Dial out per the plan (direct, then relay).
    Connect(ConnectPlan),

    /// Pre-established channel — an accepted inbound socket, or an
    /// in-memory pipe in tests.
    Channel(ByteChannel),
}

// ---------------------------------------------------------------------------
// acquire / establish
// ---------------------------------------------------------------------------

/// Turn a [`TransferTarget`] into a live channel, driving the state
/// machine through `Resolving`/`Connecting` as appropriate.
pub(crate) async fn acquire(ctx: &TransferCtx, target: TransferTarget) -> Result<ByteChannel> {
    // ---
    match target {
        TransferTarget::Channel(channel) => {
            ctx.set_state(TransferState::ConnectedDirect).await;
            Ok(channel)
        }
        TransferTarget::Connect(plan) => establish(ctx, plan).await,
    }
}

// ---

async fn establish(ctx: &TransferCtx, plan: ConnectPlan) -> Result<ByteChannel> {
    // ---
    ctx.set_state(TransferState::Resolving).await;

    // Resolve the direct endpoint up front; a dead name is just another
    // reason to fall back.
    let direct_addrs: Vec<SocketAddr> = match &plan.direct {
        Some(endpoint) if ctx.config.allow_direct => {
            match ctx.step(resolve(endpoint)).await {
                Ok(addrs) => addrs,
                Err(e @ (PeerwayError::Cancelled | PeerwayError::TimedOut)) => return Err(e),
                Err(e) => {
                    tracing::debug!(host = %endpoint.host, "direct endpoint unresolvable: {e}");
                    Vec::new()
                }
            }
        }
        _ => Vec::new(),
    };

    ctx.set_state(TransferState::Connecting).await;

    // Direct attempt, bounded by connect_timeout per address.
    for addr in direct_addrs {
        match ctx
            .step(async {
                Ok(timeout(ctx.config.connect_timeout, TcpStream::connect(addr)).await)
            })
            .await?
        {
            Ok(Ok(stream)) => {
                tracing::info!(%addr, "direct connection established");
                ctx.set_state(TransferState::ConnectedDirect).await;
                return Ok(Box::new(stream));
            }
            Ok(Err(e)) => {
                tracing::debug!(%addr, "direct connect failed: {e}");
            }
            Err(_) => {
                tracing::debug!(%addr, "direct connect timed out");
            }
        }
    }

    // Relay fallback.
    let Some(role) = plan.relay.clone() else {
        return Err(PeerwayError::Transport(
            "peer unreachable directly and no relay is configured".into(),
        ));
    };

    let channel = connect_relay(ctx, &plan, role).await?;
    ctx.set_state(TransferState::ConnectedProxy).await;
    Ok(channel)
}

// ---

async fn connect_relay(
    ctx: &TransferCtx,
    plan: &ConnectPlan,
    role: RelayRole,
) -> Result<ByteChannel> {
    // ---
    let endpoint = match &role {
        RelayRole::Initiate { relay } | RelayRole::Accept { relay, .. } => relay.clone(),
    };

    let addrs = ctx.step(resolve(&endpoint)).await?;
    let Some(addr) = addrs.into_iter().next() else {
        return Err(PeerwayError::Transport(format!(
            "relay {} resolved to no addresses",
            endpoint.host
        )));
    };

    let mut stream = ctx
        .step(async {
            timeout(ctx.config.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| PeerwayError::Transport(format!("relay connect to {addr} timed out")))?
                .map_err(PeerwayError::from)
        })
        .await?;

    match role {
        RelayRole::Initiate { .. } => {
            let (assigned_addr, assigned_port) = ctx
                .step(relay_initiate(&mut stream, plan.session, &plan.local_name))
                .await?;

            // The application forwards the endpoint to the peer through
            // its rendezvous messaging; we park until the peer joins.
            ctx.handler()
                .on_proxy_redirect(assigned_addr, assigned_port)
                .await;

            ctx.step(async {
                timeout(ctx.config.relay_timeout, relay_wait_ready(&mut stream))
                    .await
                    .map_err(|_| {
                        PeerwayError::Transport("peer never joined the relay".into())
                    })?
            })
            .await?;
        }

        RelayRole::Accept { port, .. } => {
            ctx.step(async {
                timeout(
                    ctx.config.relay_timeout,
                    relay_accept(&mut stream, plan.session, &plan.local_name, port),
                )
                .await
                .map_err(|_| PeerwayError::Transport("relay bridge never became ready".into()))?
            })
            .await?;
        }
    }

    Ok(Box::new(stream))
}

// ---

async fn resolve(endpoint: &PeerEndpoint) -> Result<Vec<SocketAddr>> {
    // ---
    let addrs: Vec<SocketAddr> = lookup_host((endpoint.host.as_str(), endpoint.port))
        .await?
        .collect();
    if addrs.is_empty() {
        return Err(PeerwayError::Transport(format!(
            "{}:{} resolved to no addresses",
            endpoint.host, endpoint.port
        )));
    }
    Ok(addrs)
}
