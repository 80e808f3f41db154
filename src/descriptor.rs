use std::{fmt, str::FromStr};

use thiserror::Error;

/// Errors returned when a tunnel descriptor does not match
/// `<listenPort>:<remoteHost>:<remotePort>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("Wrong tunnel description: {0}")]
    Malformed(String),

    #[error("Wrong tunnel description: {text} (missing {field} port)")]
    MissingPort { field: &'static str, text: String },

    #[error("Wrong tunnel description: {text} (invalid {field} port '{value}')")]
    InvalidPort {
        field: &'static str,
        value: String,
        text: String,
    },

    #[error("Wrong tunnel description: {0} (missing remote host)")]
    MissingHost(String),
}

/// One forwarding rule: listen locally on `listen_port`, forward to
/// `remote_host:remote_port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelDescriptor {
    pub listen_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl TunnelDescriptor {
    pub fn new(listen_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            listen_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// Remote endpoint as `host:port`.
    #[must_use]
    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

impl fmt::Display for TunnelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.listen_port, self.remote_host, self.remote_port
        )
    }
}

impl FromStr for TunnelDescriptor {
    type Err = DescriptorError;

    /// The host token sits between the first and the last colon, so IPv6
    /// literals such as `8080:::1:80` parse with host `::1`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let malformed = || DescriptorError::Malformed(text.to_string());

        let (listen, rest) = text.split_once(':').ok_or_else(malformed)?;
        let (host, remote) = rest.rsplit_once(':').ok_or_else(malformed)?;

        let listen_port = parse_port(text, "listen", listen)?;
        let remote_port = parse_port(text, "remote", remote)?;
        if host.is_empty() {
            return Err(DescriptorError::MissingHost(text.to_string()));
        }

        Ok(Self::new(listen_port, host, remote_port))
    }
}

fn parse_port(text: &str, field: &'static str, digits: &str) -> Result<u16, DescriptorError> {
    if digits.is_empty() {
        return Err(DescriptorError::MissingPort {
            field,
            text: text.to_string(),
        });
    }

    let invalid = || DescriptorError::InvalidPort {
        field,
        value: digits.to_string(),
        text: text.to_string(),
    };

    // u16::from_str would also accept a leading '+'
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    digits.parse().map_err(|_| invalid())
}
