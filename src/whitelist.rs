use anyhow::{Context, Result, bail};
use std::{collections::HashSet, fmt, net::IpAddr};
use tokio::net::lookup_host;

/// Configuration entry meaning "accept any client".
pub const WILDCARD: &str = "*";

/// Client source addresses allowed to use a tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Whitelist {
    #[default]
    AllowAll,
    Only(HashSet<IpAddr>),
}

impl Whitelist {
    /// Builds a whitelist from concrete addresses. No addresses means no
    /// restriction.
    pub fn from_addrs(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        let addrs: HashSet<IpAddr> = addrs.into_iter().map(|ip| ip.to_canonical()).collect();
        if addrs.is_empty() {
            Self::AllowAll
        } else {
            Self::Only(addrs)
        }
    }

    /// Resolves configured entries into addresses, once, at startup.
    ///
    /// A `*` anywhere in the list wins before any lookup is attempted. Every
    /// other entry is either an IP literal or a host name; a host name that
    /// does not resolve fails the whole whitelist.
    pub async fn resolve<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        if entries.iter().any(|entry| entry.as_ref().trim() == WILDCARD) {
            return Ok(Self::AllowAll);
        }

        let mut addrs = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                bail!("Wrong white list address: empty entry");
            }

            if let Ok(ip) = entry.parse::<IpAddr>() {
                addrs.push(ip);
                continue;
            }

            let resolved: Vec<IpAddr> = lookup_host((entry, 0))
                .await
                .with_context(|| format!("Wrong white list address: {entry}"))?
                .map(|addr| addr.ip())
                .collect();
            if resolved.is_empty() {
                bail!("Wrong white list address: {entry} resolved to no addresses");
            }
            addrs.extend(resolved);
        }

        Ok(Self::from_addrs(addrs))
    }

    /// Exact address match; IPv4-mapped IPv6 sources compare as IPv4.
    #[must_use]
    pub fn admit(&self, source: IpAddr) -> bool {
        match self {
            Self::AllowAll => true,
            Self::Only(allowed) => allowed.contains(&source.to_canonical()),
        }
    }

    #[must_use]
    pub const fn is_unrestricted(&self) -> bool {
        matches!(self, Self::AllowAll)
    }

    /// Entries for display, sorted. `["*"]` when unrestricted.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        match self {
            Self::AllowAll => vec![WILDCARD.to_string()],
            Self::Only(allowed) => {
                let mut sorted: Vec<&IpAddr> = allowed.iter().collect();
                sorted.sort();
                sorted.into_iter().map(ToString::to_string).collect()
            }
        }
    }
}

impl fmt::Display for Whitelist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entries().join(", "))
    }
}
