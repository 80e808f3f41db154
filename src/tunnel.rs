use anyhow::{Context, Result};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::TcpListener,
    sync::oneshot,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::descriptor::TunnelDescriptor;
use crate::session::{Session, SessionContext, SessionCounter};
use crate::whitelist::Whitelist;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const NOT_ACTIVE: &str = "not active";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Down,
    Active,
    Failed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Down => "down",
            Self::Active => "active",
            Self::Failed => "failed",
        })
    }
}

/// Settings shared by every tunnel of a process.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub bind_ip: IpAddr,
    pub connect_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub whitelist: Arc<Whitelist>,
}

impl TunnelSettings {
    pub fn new(connect_timeout: Duration, whitelist: Whitelist) -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_timeout,
            idle_timeout: None,
            whitelist: Arc::new(whitelist),
        }
    }

    #[must_use]
    pub const fn with_bind_ip(mut self, bind_ip: IpAddr) -> Self {
        self.bind_ip = bind_ip;
        self
    }

    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

/// The listening side of an active tunnel.
struct Listening {
    local_addr: SocketAddr,
    sessions: SessionCounter,
    shutdown: oneshot::Sender<()>,
    accept_loop: JoinHandle<()>,
}

impl Listening {
    /// Stops accepting, terminates every open session and waits until the
    /// listening socket is released.
    async fn stop(self) -> Result<()> {
        // the accept loop may already be gone, its join result tells why
        let _ = self.shutdown.send(());
        self.accept_loop
            .await
            .context("accept loop terminated abnormally")
    }
}

/// One listen-port-to-backend forwarding rule.
///
/// Holds a bound listener exactly while `Active`.
pub struct Tunnel {
    text: String,
    descriptor: Option<TunnelDescriptor>,
    settings: TunnelSettings,
    state: TunnelState,
    status: String,
    listening: Option<Listening>,
}

impl Tunnel {
    /// Parses `text`; a descriptor that does not parse leaves the tunnel
    /// `Failed` for good, with the parse error as its status.
    pub fn new(text: &str, settings: TunnelSettings) -> Self {
        match text.parse::<TunnelDescriptor>() {
            Ok(descriptor) => Self {
                text: text.to_string(),
                descriptor: Some(descriptor),
                settings,
                state: TunnelState::Down,
                status: NOT_ACTIVE.to_string(),
                listening: None,
            },
            Err(e) => {
                error!(descriptor = %text, error = %e, "Invalid tunnel descriptor");
                Self::misconfigured(text, settings, e.to_string())
            }
        }
    }

    /// A tunnel that can never open because its configuration is unusable.
    pub fn misconfigured(text: &str, settings: TunnelSettings, reason: impl Into<String>) -> Self {
        Self {
            text: text.to_string(),
            descriptor: text.parse().ok(),
            settings,
            state: TunnelState::Failed,
            status: reason.into(),
            listening: None,
        }
    }

    /// Canonical descriptor text, or the configured text if it did not parse.
    #[must_use]
    pub fn key(&self) -> String {
        self.descriptor
            .as_ref()
            .map_or_else(|| self.text.clone(), ToString::to_string)
    }

    #[must_use]
    pub const fn descriptor(&self) -> Option<&TunnelDescriptor> {
        self.descriptor.as_ref()
    }

    #[must_use]
    pub const fn state(&self) -> TunnelState {
        self.state
    }

    #[must_use]
    pub fn status(&self) -> &str {
        &self.status
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.state, TunnelState::Active)
    }

    /// Bound address while active.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.as_ref().map(|l| l.local_addr)
    }

    /// Sessions currently open on this tunnel.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.session_counter().map_or(0, |sessions| sessions.current())
    }

    /// Handle on the live-session count of the current listener. It keeps
    /// counting after the tunnel is closed.
    #[must_use]
    pub fn session_counter(&self) -> Option<SessionCounter> {
        self.listening.as_ref().map(|l| l.sessions.clone())
    }

    /// Binds the listener and starts accepting. Only acts on a `Down` tunnel.
    pub async fn open(&mut self) {
        if self.state != TunnelState::Down {
            return;
        }
        let Some(descriptor) = self.descriptor.clone() else {
            return;
        };

        match self.listen(&descriptor).await {
            Ok(listening) => {
                self.status = format!(
                    "listening on {} -> {}",
                    listening.local_addr.port(),
                    descriptor.remote()
                );
                self.state = TunnelState::Active;
                self.listening = Some(listening);
                info!(tunnel = %descriptor, status = %self.status, "Tunnel opened");
            }
            Err(e) => {
                self.state = TunnelState::Failed;
                self.status = format!(
                    "failed on port {} -> {}: {e:#}",
                    descriptor.listen_port,
                    descriptor.remote()
                );
                error!(tunnel = %descriptor, status = %self.status, "Tunnel failed to open");
            }
        }
    }

    /// Releases the listener and forcibly ends its sessions. Only acts on an
    /// `Active` tunnel.
    pub async fn close(&mut self) {
        if self.state != TunnelState::Active {
            return;
        }
        let key = self.key();
        let Some(listening) = self.listening.take() else {
            self.state = TunnelState::Down;
            self.status = NOT_ACTIVE.to_string();
            return;
        };

        match listening.stop().await {
            Ok(()) => {
                self.state = TunnelState::Down;
                self.status = NOT_ACTIVE.to_string();
                info!(tunnel = %key, "Tunnel closed");
            }
            Err(e) => {
                self.state = TunnelState::Failed;
                self.status = format!("Unable to close because of {e:#}");
                error!(tunnel = %key, status = %self.status, "Tunnel failed to close");
            }
        }
    }

    async fn listen(&self, descriptor: &TunnelDescriptor) -> Result<Listening> {
        let bind_addr = SocketAddr::new(self.settings.bind_ip, descriptor.listen_port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to address {bind_addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to get bound listener local address")?;

        let ctx = Arc::new(SessionContext::new(
            descriptor.remote_host.clone(),
            descriptor.remote_port,
            self.settings.connect_timeout,
            self.settings.idle_timeout,
        ));
        let sessions = ctx.sessions().clone();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.settings.whitelist),
            ctx,
            shutdown_rx,
        ));

        Ok(Listening {
            local_addr,
            sessions,
            shutdown,
            accept_loop,
        })
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("key", &self.key())
            .field("state", &self.state)
            .field("status", &self.status)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

/// Accepts until told to stop (or until the `Tunnel` is dropped), then aborts
/// every session still running and drops the listener.
async fn accept_loop(
    listener: TcpListener,
    whitelist: Arc<Whitelist>,
    ctx: Arc<SessionContext>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, client_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                };

                if !whitelist.admit(client_addr.ip()) {
                    warn!(client_addr = %client_addr, "Rejected client outside the whitelist");
                    drop(stream);
                    continue;
                }

                let session = Session::accepted(&ctx, stream, client_addr);
                sessions.spawn(session.run(Arc::clone(&ctx)));
            }
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Session task panicked");
                }
            }
        }
    }

    let remaining = sessions.len();
    sessions.shutdown().await;
    debug!(remaining, remote = %ctx.remote(), "Accept loop stopped");
}
