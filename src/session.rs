use socket2::SockRef;
use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{net::TcpStream, time::timeout};
use tracing::{debug, info, warn};

use crate::relay::Pair;

/// Stages an inbound connection goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Connecting,
    Paired,
    Failed,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Accepted => "accepted",
            Self::Connecting => "connecting",
            Self::Paired => "paired",
            Self::Failed => "failed",
            Self::Closed => "closed",
        })
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to connect to {target}: {source}")]
    Failed {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Connect to {target} timed out after {timeout:?}")]
    TimedOut { target: String, timeout: Duration },
}

/// Counts sessions alive on one tunnel.
#[derive(Debug, Clone, Default)]
pub struct SessionCounter(Arc<AtomicUsize>);

impl SessionCounter {
    #[must_use]
    pub fn enter(&self) -> SessionGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        SessionGuard(self.0.clone())
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct SessionGuard(Arc<AtomicUsize>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What every session of one tunnel needs: where to connect and for how long
/// to wait.
#[derive(Debug)]
pub struct SessionContext {
    remote_host: String,
    remote_port: u16,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    sessions: SessionCounter,
    next_id: AtomicU64,
}

impl SessionContext {
    pub fn new(
        remote_host: impl Into<String>,
        remote_port: u16,
        connect_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            connect_timeout,
            idle_timeout,
            sessions: SessionCounter::default(),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    #[must_use]
    pub const fn sessions(&self) -> &SessionCounter {
        &self.sessions
    }

    /// Opens the outbound connection, bounded by the connect timeout. The
    /// timeout covers name resolution too.
    pub async fn connect(&self) -> Result<TcpStream, ConnectError> {
        let target = (self.remote_host.as_str(), self.remote_port);
        match timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConnectError::Failed {
                target: self.remote(),
                source,
            }),
            Err(_) => Err(ConnectError::TimedOut {
                target: self.remote(),
                timeout: self.connect_timeout,
            }),
        }
    }
}

/// An accepted client connection that has passed the whitelist.
///
/// Nothing reads from or writes to `inbound` until the outbound connection
/// exists: the stream is simply not polled while connecting.
#[derive(Debug)]
pub struct Session {
    id: u64,
    client_addr: SocketAddr,
    inbound: TcpStream,
    _live: SessionGuard,
}

impl Session {
    pub fn accepted(ctx: &SessionContext, inbound: TcpStream, client_addr: SocketAddr) -> Self {
        let id = ctx.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            session = id,
            client_addr = %client_addr,
            state = %SessionState::Accepted,
            "Session accepted"
        );
        Self {
            id,
            client_addr,
            inbound,
            _live: ctx.sessions.enter(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Drives the session to a terminal state: `Failed` when no outbound
    /// connection could be made, `Closed` once a pair has been relayed and
    /// released.
    #[tracing::instrument(
        name = "session",
        skip_all,
        fields(id = self.id, client_addr = %self.client_addr)
    )]
    pub async fn run(self, ctx: Arc<SessionContext>) -> SessionState {
        let Self { inbound, _live, .. } = self;
        let remote = ctx.remote();

        debug!(state = %SessionState::Connecting, remote = %remote, "Connecting to remote");
        let outbound = match ctx.connect().await {
            Ok(outbound) => outbound,
            Err(e) => {
                // inbound is dropped here without ever having been read
                warn!(
                    state = %SessionState::Failed,
                    error = %e,
                    "Connect failed, closing client connection"
                );
                return SessionState::Failed;
            }
        };

        enable_keepalive(&outbound);
        enable_keepalive(&inbound);

        info!(state = %SessionState::Paired, remote = %remote, "Connection paired");
        let stats = Pair::new(inbound, outbound).relay(ctx.idle_timeout).await;

        info!(
            state = %SessionState::Closed,
            reason = %stats.reason,
            client_to_backend = stats.client_to_backend,
            backend_to_client = stats.backend_to_client,
            "Connection pair released"
        );
        SessionState::Closed
    }
}

fn enable_keepalive(stream: &TcpStream) {
    if let Err(e) = SockRef::from(stream).set_keepalive(true) {
        debug!(error = %e, "Failed to enable TCP keep-alive");
    }
}
