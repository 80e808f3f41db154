//! TCP Tunnels
//!
//! A multi-tunnel TCP port forwarder. Each tunnel listens on a local port and
//! relays every accepted connection, byte for byte, to a fixed remote
//! `host:port`, optionally admitting only whitelisted client addresses.

pub mod config;
pub mod descriptor;
pub mod manager;
pub mod relay;
pub mod session;
pub mod tunnel;
pub mod whitelist;

#[cfg(test)]
mod test_support;

// Re-export commonly used types and functions
pub use config::{Config, DEFAULT_CONFIG_FILE, load_config, parse_config};
pub use descriptor::{DescriptorError, TunnelDescriptor};
pub use manager::{StatusReport, TunnelManager};
pub use relay::{BUFFER_SIZE, CloseReason, Pair, RelayStats, Side};
pub use session::{ConnectError, Session, SessionContext, SessionState};
pub use tunnel::{Tunnel, TunnelSettings, TunnelState};
pub use whitelist::Whitelist;
