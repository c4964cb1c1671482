use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};

/// A peer persisted in the local config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownPeer {
    #[serde(rename = "peerID")]
    pub peer_id: String,
    /// Name advertised by the peer itself
    #[serde(default)]
    pub name: String,
    /// Locally chosen, unique among known peers
    #[serde(default)]
    pub alias: String,
    #[serde(rename = "ipAddr", default)]
    pub ip_addr: String,
    #[serde(default)]
    pub domain_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub declined: bool,
    /// We let this peer use our node as a SOCKS5 exit
    #[serde(default)]
    pub we_allow_using_as_exit_node: bool,
    /// This peer lets us use it as a SOCKS5 exit
    #[serde(default)]
    pub allowed_using_as_exit_node: bool,
}

impl KnownPeer {
    pub fn new(peer_id: PeerId, alias: &str, ip: Ipv4Addr) -> Self {
        Self {
            peer_id: peer_id.to_base58(),
            name: String::new(),
            alias: alias.to_string(),
            ip_addr: ip.to_string(),
            domain_name: domain_name_from_alias(alias),
            created_at: Utc::now(),
            last_seen: None,
            confirmed: false,
            declined: false,
            we_allow_using_as_exit_node: false,
            allowed_using_as_exit_node: false,
        }
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.ip_addr.parse().ok()
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id.parse().ok()
    }

    /// Alias if set, otherwise the peer's own name
    pub fn display_name(&self) -> &str {
        if self.alias.is_empty() {
            &self.name
        } else {
            &self.alias
        }
    }
}

/// A peer whose auth requests are rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedPeer {
    #[serde(rename = "peerID")]
    pub peer_id: String,
    #[serde(default)]
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// Lower-case the alias and replace everything outside `[a-z0-9-]` with `-`
pub fn domain_name_from_alias(alias: &str) -> String {
    let mut name: String = alias
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    while name.starts_with('-') {
        name.remove(0);
    }
    while name.ends_with('-') {
        name.pop();
    }
    name
}
