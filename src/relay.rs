use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::{Instant, sleep_until},
};
use tracing::{debug, warn};

pub const BUFFER_SIZE: usize = 8192;

/// One end of a connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl Side {
    const fn peer(self) -> Self {
        match self {
            Self::Client => Self::Backend,
            Self::Backend => Self::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Backend => "backend",
        })
    }
}

/// Why a pair was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The side disconnected cleanly.
    Closed(Side),
    /// Reading from, or writing to, the side failed.
    Failed(Side),
    IdleTimeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(side) => write!(f, "{side} closed"),
            Self::Failed(side) => write!(f, "{side} failed"),
            Self::IdleTimeout => f.write_str("idle timeout"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub reason: CloseReason,
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// An inbound connection linked to the outbound connection opened for it.
pub struct Pair {
    client: TcpStream,
    backend: TcpStream,
}

impl Pair {
    #[must_use]
    pub const fn new(client: TcpStream, backend: TcpStream) -> Self {
        Self { client, backend }
    }

    /// Copies bytes both ways until either side goes away, then closes the
    /// other side once what was already read from the first has been written.
    ///
    /// With `idle_timeout` set, the pair is closed the same way when no bytes
    /// move in either direction for that long.
    pub async fn relay(self, idle_timeout: Option<Duration>) -> RelayStats {
        let (client_reader, client_writer) = self.client.into_split();
        let (backend_reader, backend_writer) = self.backend.into_split();

        let activity = Activity::new();
        let mut upstream = Leg::new(Side::Client, client_reader, backend_writer);
        let mut downstream = Leg::new(Side::Backend, backend_reader, client_writer);

        let reason = tokio::select! {
            reason = upstream.pump(&activity) => reason,
            reason = downstream.pump(&activity) => reason,
            () = activity.expired(idle_timeout) => CloseReason::IdleTimeout,
        };

        if reason == CloseReason::IdleTimeout {
            tokio::join!(upstream.close_peer(), downstream.close_peer());
        }

        RelayStats {
            reason,
            client_to_backend: upstream.bytes,
            backend_to_client: downstream.bytes,
        }
    }
}

/// One direction of a pair: reads from `source`, writes to `peer`.
///
/// `peer` is the association to the other session. It is taken exactly once,
/// when this direction closes it, and a missing peer means the data has
/// nowhere to go.
struct Leg {
    source: Side,
    reader: OwnedReadHalf,
    peer: Option<OwnedWriteHalf>,
    bytes: u64,
}

impl Leg {
    const fn new(source: Side, reader: OwnedReadHalf, peer: OwnedWriteHalf) -> Self {
        Self {
            source,
            reader,
            peer: Some(peer),
            bytes: 0,
        }
    }

    async fn pump(&mut self, activity: &Activity) -> CloseReason {
        let mut buffer = vec![0u8; BUFFER_SIZE];

        loop {
            match self.reader.read(&mut buffer).await {
                Ok(0) => {
                    debug!(side = %self.source, "Connection closed by peer");
                    self.close_peer().await;
                    return CloseReason::Closed(self.source);
                }
                Ok(n) => {
                    activity.touch();
                    let Some(peer) = self.peer.as_mut() else {
                        debug!(
                            side = %self.source,
                            bytes = n,
                            "Peer already released, dropping data"
                        );
                        continue;
                    };

                    debug!(from = %self.source, bytes = n, "Relaying data");
                    if let Err(e) = peer.write_all(&buffer[..n]).await {
                        warn!(
                            side = %self.source.peer(),
                            error = %e,
                            bytes = n,
                            "Failed to relay data"
                        );
                        self.peer = None;
                        return CloseReason::Failed(self.source.peer());
                    }
                    self.bytes += n as u64;
                    activity.touch();
                }
                Err(e) => {
                    debug!(side = %self.source, error = %e, "Read failed");
                    self.close_peer().await;
                    return CloseReason::Failed(self.source);
                }
            }
        }
    }

    /// Graceful close of the peer: the write half is shut down after any
    /// queued bytes. A peer that is already gone is left alone.
    async fn close_peer(&mut self) {
        if let Some(mut peer) = self.peer.take() {
            if let Err(e) = peer.shutdown().await {
                debug!(side = %self.source.peer(), error = %e, "Shutdown failed");
            }
        }
    }
}

/// Last time a byte moved in either direction, in milliseconds since the
/// pair was created.
///
/// Shared by reference with both legs across awaits; it has to be `Sync` for
/// the session future to stay `Send`.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    async fn expired(&self, limit: Option<Duration>) {
        let Some(limit) = limit else {
            return std::future::pending().await;
        };

        loop {
            let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
            let deadline = self.started + last + limit;
            if Instant::now() >= deadline {
                return;
            }
            sleep_until(deadline).await;
        }
    }
}
