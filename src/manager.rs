use futures_util::future::join_all;
use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::tunnel::{Tunnel, TunnelSettings, TunnelState};

pub const RUNNING_STATUS: &str = "TCP Proxy up and running";

/// Read-only snapshot for whoever reports tunnel state to an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: String,
    pub client_white_list: Vec<String>,
    /// Milliseconds.
    pub connect_timeout: u64,
    pub tunnels: BTreeMap<String, String>,
}

/// Owns the configured tunnels, in configuration order.
#[derive(Debug)]
pub struct TunnelManager {
    tunnels: Vec<Tunnel>,
    connect_timeout: Duration,
    client_white_list: Vec<String>,
}

impl TunnelManager {
    /// Builds and opens one tunnel per descriptor. Tunnels share no state, so
    /// they are opened concurrently; a failing one only fails itself.
    pub async fn build_all<S: AsRef<str>>(descriptors: &[S], settings: TunnelSettings) -> Self {
        let connect_timeout = settings.connect_timeout;
        let client_white_list = settings.whitelist.entries();

        let tunnels = join_all(descriptors.iter().map(|text| {
            let settings = settings.clone();
            async move {
                let mut tunnel = Tunnel::new(text.as_ref(), settings);
                tunnel.open().await;
                tunnel
            }
        }))
        .await;

        let manager = Self {
            tunnels,
            connect_timeout,
            client_white_list,
        };
        manager.log_summary();
        manager
    }

    /// Resolves the configured whitelist and builds every tunnel from it.
    ///
    /// If the whitelist cannot be resolved no tunnel is opened; each one is
    /// reported `Failed` with the resolution error.
    pub async fn from_config(config: &Config) -> Self {
        match config.tunnel_settings().await {
            Ok(settings) => Self::build_all(&config.tunnels, settings).await,
            Err(e) => {
                let reason = format!("Unable to proceed. {e:#}");
                error!(error = %reason, "Client whitelist could not be resolved");

                let settings = config.base_settings();
                let tunnels = config
                    .tunnels
                    .iter()
                    .map(|text| Tunnel::misconfigured(text, settings.clone(), reason.clone()))
                    .collect();
                Self {
                    tunnels,
                    connect_timeout: config.connect_timeout(),
                    client_white_list: config.client_white_list.clone(),
                }
            }
        }
    }

    #[must_use]
    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    /// Descriptor to status, for every tunnel.
    #[must_use]
    pub fn status(&self) -> BTreeMap<String, String> {
        self.tunnels
            .iter()
            .map(|tunnel| (tunnel.key(), tunnel.status().to_string()))
            .collect()
    }

    #[must_use]
    pub fn report(&self) -> StatusReport {
        StatusReport {
            status: RUNNING_STATUS.to_string(),
            client_white_list: self.client_white_list.clone(),
            connect_timeout: self.connect_timeout.as_millis() as u64,
            tunnels: self.status(),
        }
    }

    /// Closes every tunnel. A tunnel that fails to close is recorded as
    /// `Failed` and does not stop the others from closing.
    pub async fn close_all(&mut self) {
        join_all(self.tunnels.iter_mut().map(|tunnel| tunnel.close())).await;

        for tunnel in &self.tunnels {
            if tunnel.state() == TunnelState::Failed {
                warn!(
                    tunnel = %tunnel.key(),
                    status = %tunnel.status(),
                    "Tunnel not cleanly closed"
                );
            }
        }
        info!(tunnels = self.tunnels.len(), "All tunnels closed");
    }

    fn log_summary(&self) {
        let active = self.tunnels.iter().filter(|t| t.is_active()).count();
        info!(
            active,
            failed = self.tunnels.len() - active,
            connect_timeout_ms = self.connect_timeout.as_millis() as u64,
            client_white_list = %self.client_white_list.join(", "),
            "Tunnels built"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::test_support::{
        TEST_TIMEOUT, find_free_port, is_closed_by_peer, loopback, read_up_to, start_echo_server,
    };
    use crate::whitelist::Whitelist;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::{
        io::AsyncWriteExt,
        net::{TcpListener, TcpStream},
        time::timeout,
    };

    fn settings() -> TunnelSettings {
        TunnelSettings::new(Duration::from_millis(500), Whitelist::AllowAll)
            .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    mod building {
        use super::*;

        #[tokio::test]
        async fn bad_descriptor_does_not_block_siblings() {
            let (backend, _) = start_echo_server().await;
            let listen = find_free_port().await;
            let good = format!("{listen}:127.0.0.1:{backend}");

            let manager =
                TunnelManager::build_all(&["abc:host:80", good.as_str()], settings()).await;

            let tunnels = manager.tunnels();
            assert_eq!(tunnels.len(), 2);
            assert_eq!(tunnels[0].state(), TunnelState::Failed);
            assert_eq!(tunnels[1].state(), TunnelState::Active, "{}", tunnels[1].status());
        }

        #[tokio::test]
        async fn preserves_configuration_order() {
            let descriptors = ["0:127.0.0.1:1001", "bad", "0:127.0.0.1:1002"];
            let manager = TunnelManager::build_all(&descriptors, settings()).await;

            let keys: Vec<String> = manager.tunnels().iter().map(Tunnel::key).collect();
            assert_eq!(keys, descriptors);
        }

        #[tokio::test]
        async fn status_maps_descriptor_to_status() {
            let listen = find_free_port().await;
            let good = format!("{listen}:127.0.0.1:9");
            let manager =
                TunnelManager::build_all(&[good.as_str(), "8080:host"], settings()).await;

            let status = manager.status();
            assert_eq!(status[&good], format!("listening on {listen} -> 127.0.0.1:9"));
            assert_eq!(status["8080:host"], "Wrong tunnel description: 8080:host");

            // reading status leaves the tunnel set intact for shutdown
            assert_eq!(manager.status(), status);
        }

        #[tokio::test]
        async fn unresolvable_whitelist_fails_every_tunnel() {
            let config = parse_config(
                r#"
                tunnels = ["0:127.0.0.1:1001", "0:127.0.0.1:1002"]
                clientWhiteList = ["no-such-host.invalid"]
                connectTimeout = 500
                "#,
            )
            .unwrap();

            let manager = TunnelManager::from_config(&config).await;
            assert_eq!(manager.tunnels().len(), 2);
            for tunnel in manager.tunnels() {
                assert_eq!(tunnel.state(), TunnelState::Failed);
                assert!(tunnel.status().contains("no-such-host.invalid"), "{}", tunnel.status());
                assert!(tunnel.local_addr().is_none());
            }
            assert_eq!(manager.report().client_white_list, vec!["no-such-host.invalid"]);
        }
    }

    mod reporting {
        use super::*;

        #[tokio::test]
        async fn report_carries_timeout_whitelist_and_tunnels() {
            let settings = TunnelSettings::new(
                Duration::from_millis(2000),
                Whitelist::from_addrs(["10.0.0.5".parse::<IpAddr>().unwrap()]),
            )
            .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
            let manager = TunnelManager::build_all(&["x:y:z"], settings).await;

            let report = manager.report();
            assert_eq!(report.status, RUNNING_STATUS);
            assert_eq!(report.connect_timeout, 2000);
            assert_eq!(report.client_white_list, vec!["10.0.0.5"]);
            assert_eq!(report.tunnels.len(), 1);

            let rendered = toml::to_string(&report).unwrap();
            assert!(rendered.contains("connectTimeout = 2000"));
            assert!(rendered.contains("clientWhiteList"));
        }
    }

    mod traffic {
        use super::*;

        #[tokio::test]
        async fn concurrent_clients_are_paired_one_to_one() {
            let (backend, accepted) = start_echo_server().await;
            let listen = find_free_port().await;
            let descriptor = format!("{listen}:127.0.0.1:{backend}");
            let manager = TunnelManager::build_all(&[descriptor.as_str()], settings()).await;
            assert!(manager.tunnels()[0].is_active());

            let clients: Vec<_> = (0..16)
                .map(|i| {
                    tokio::spawn(async move {
                        let mut stream = TcpStream::connect(loopback(listen)).await.unwrap();
                        let message = format!("client {i:02} says hello").into_bytes();
                        stream.write_all(&message).await.unwrap();
                        let echoed = read_up_to(&mut stream, message.len()).await;
                        assert_eq!(echoed, message);
                    })
                })
                .collect();

            for client in clients {
                timeout(TEST_TIMEOUT, client).await.unwrap().unwrap();
            }
            assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 16);
        }

        #[tokio::test]
        async fn close_all_releases_every_port() {
            let (backend, _) = start_echo_server().await;
            let ports = [find_free_port().await, find_free_port().await];
            let descriptors: Vec<String> = ports
                .iter()
                .map(|port| format!("{port}:127.0.0.1:{backend}"))
                .collect();
            let mut manager = TunnelManager::build_all(&descriptors, settings()).await;

            let mut client = TcpStream::connect(loopback(ports[0])).await.unwrap();
            client.write_all(b"ping").await.unwrap();
            assert_eq!(read_up_to(&mut client, 4).await, b"ping");

            let counters: Vec<_> = manager
                .tunnels()
                .iter()
                .map(|tunnel| tunnel.session_counter().unwrap())
                .collect();
            assert_eq!(counters[0].current(), 1);

            timeout(TEST_TIMEOUT, manager.close_all()).await.unwrap();

            for tunnel in manager.tunnels() {
                assert_eq!(tunnel.state(), TunnelState::Down);
            }
            for counter in &counters {
                assert_eq!(counter.current(), 0);
            }
            assert!(is_closed_by_peer(&mut client).await);
            for port in ports {
                TcpListener::bind(loopback(port)).await.unwrap();
            }
            assert!(manager.status().values().all(|s| s == "not active"));
        }
    }
}
