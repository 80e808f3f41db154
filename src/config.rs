use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use std::{
    fs,
    net::{IpAddr, Ipv4Addr},
    path::Path,
    time::Duration,
};

use crate::tunnel::TunnelSettings;
use crate::whitelist::Whitelist;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

const fn default_connect_timeout() -> u64 {
    30_000
}

const fn default_idle_timeout() -> u64 {
    10
}

const fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// `<listenPort>:<remoteHost>:<remotePort>` per tunnel.
    #[serde(default)]
    pub tunnels: Vec<String>,
    /// Allowed client addresses; empty or `*` allows everyone.
    #[serde(default)]
    pub client_white_list: Vec<String>,
    #[serde(rename = "connectTimeout", default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Seconds without traffic in either direction before a pair is closed;
    /// `0` disables.
    #[serde(rename = "idleTimeout", default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.connect_timeout_ms > 0,
            "connectTimeout must be a positive number of milliseconds"
        );
        Ok(())
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Settings with an unrestricted whitelist.
    #[must_use]
    pub fn base_settings(&self) -> TunnelSettings {
        TunnelSettings::new(self.connect_timeout(), Whitelist::AllowAll)
            .with_bind_ip(self.bind_address)
            .with_idle_timeout(self.idle_timeout())
    }

    /// Settings with the client whitelist resolved. Resolution failure is a
    /// configuration error.
    pub async fn tunnel_settings(&self) -> Result<TunnelSettings> {
        let whitelist = Whitelist::resolve(&self.client_white_list)
            .await
            .context("Failed to resolve clientWhiteList")?;
        let mut settings = self.base_settings();
        settings.whitelist = whitelist.into();
        Ok(settings)
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).context("Failed to parse configuration as valid TOML")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Invalid configuration in {}", path.display()))
}
