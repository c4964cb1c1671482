//! Node configuration
//!
//! A single JSON document guarded by one reader-writer lock. Every mutation
//! runs against a copy, is validated against the config invariants, saved to
//! disk and only then swapped in; `KnownPeerChanged` is published after the
//! lock is released.

mod alloc;
mod known_peer;

pub use known_peer::{domain_name_from_alias, BlockedPeer, KnownPeer};

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cidr::Ipv4Cidr;
use libp2p::PeerId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::event_bus::{Event, EventBus};
use crate::packet::MAX_CONTENT_SIZE;

/// Config file name inside the data directory
pub const CONFIG_FILE_NAME: &str = "config_awl.json";

/// Default VPN subnet; the local node takes the first host address
pub const DEFAULT_VPN_CIDR: &str = "10.66.0.0/24";
pub const DEFAULT_INTERFACE_NAME: &str = "awl0";
pub const DEFAULT_MTU: u16 = 3500;
pub const DEFAULT_SOCKS5_LISTEN_ADDRESS: &str = "127.0.0.66:8080";
pub const DEFAULT_HTTP_LISTEN_ADDRESS: &str = "127.0.0.66:8639";
pub const DEFAULT_RECONNECTION_INTERVAL_SEC: u64 = 10;

/// Public libp2p bootstrap nodes (relay v2 + identify)
pub const DEFAULT_BOOTSTRAP_PEERS: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("peer {0} is unknown")]
    PeerUnknown(String),

    #[error("alias {alias} is already used by peer {peer_id}")]
    AliasNotUnique { alias: String, peer_id: String },

    #[error("ip {ip} is already used by peer {peer}")]
    IpNotUnique { ip: Ipv4Addr, peer: String },

    #[error("ip {0} is the address of this node")]
    IpIsLocal(Ipv4Addr),

    #[error("ip {ip} is outside of vpn subnet {net}")]
    IpOutOfSubnet { ip: Ipv4Addr, net: Ipv4Cidr },

    #[error("invalid ipv4 address {0:?}")]
    InvalidIp(String),

    #[error("vpn subnet {0} has no free addresses")]
    SubnetExhausted(Ipv4Cidr),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct P2pNodeConfig {
    #[serde(rename = "peerID")]
    pub peer_id: String,
    pub name: String,
    /// Protobuf-encoded keypair, base64
    pub identity: String,
    /// User-added bootstrap multiaddresses
    pub bootstrap_peers: Vec<String>,
    pub use_default_bootstrap_peers: bool,
    pub listen_addresses: Vec<String>,
    pub reconnection_interval_sec: u64,
    pub auto_accept_auth_requests: bool,
    pub parallel_sending_streams_count: usize,
}

impl Default for P2pNodeConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            name: default_node_name(),
            identity: String::new(),
            bootstrap_peers: Vec::new(),
            use_default_bootstrap_peers: true,
            listen_addresses: vec![
                "/ip4/0.0.0.0/tcp/0".to_string(),
                "/ip4/0.0.0.0/udp/0/quic-v1".to_string(),
            ],
            reconnection_interval_sec: DEFAULT_RECONNECTION_INTERVAL_SEC,
            auto_accept_auth_requests: false,
            parallel_sending_streams_count: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VpnConfig {
    pub interface_name: String,
    #[serde(rename = "ipNet")]
    pub ip_net: Ipv4Cidr,
    pub mtu: u16,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            interface_name: DEFAULT_INTERFACE_NAME.to_string(),
            ip_net: default_vpn_cidr(),
            mtu: DEFAULT_MTU,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Socks5Config {
    pub listen_address: String,
    pub listener_enabled: bool,
    pub proxying_enabled: bool,
    #[serde(rename = "usingPeerID")]
    pub using_peer_id: String,
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_SOCKS5_LISTEN_ADDRESS.to_string(),
            listener_enabled: true,
            proxying_enabled: true,
            using_peer_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub p2p_node: P2pNodeConfig,
    pub vpn: VpnConfig,
    #[serde(rename = "socks5")]
    pub socks5: Socks5Config,
    pub known_peers: BTreeMap<String, KnownPeer>,
    pub blocked_peers: BTreeMap<String, BlockedPeer>,
    pub http_listen_address: String,
    pub logger_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            p2p_node: P2pNodeConfig::default(),
            vpn: VpnConfig::default(),
            socks5: Socks5Config::default(),
            known_peers: BTreeMap::new(),
            blocked_peers: BTreeMap::new(),
            http_listen_address: DEFAULT_HTTP_LISTEN_ADDRESS.to_string(),
            logger_level: "info".to_string(),
        }
    }
}

fn default_vpn_cidr() -> Ipv4Cidr {
    Ipv4Cidr::new(Ipv4Addr::new(10, 66, 0, 0), 24).unwrap_or_else(|_| unreachable!())
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "awl".to_string())
}

impl Config {
    /// The node's own VPN address: network address + 1
    pub fn local_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.vpn.ip_net.first_address()).wrapping_add(1))
    }

    pub fn get_peer(&self, peer_id: &str) -> Option<&KnownPeer> {
        self.known_peers.get(peer_id)
    }

    pub fn is_blocked(&self, peer_id: &str) -> bool {
        self.blocked_peers.contains_key(peer_id)
    }

    pub fn reconnection_interval(&self) -> Duration {
        Duration::from_secs(self.p2p_node.reconnection_interval_sec.max(1))
    }

    /// User bootstrap peers plus the compiled-in defaults, deduplicated
    pub fn bootstrap_peers(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let defaults = if self.p2p_node.use_default_bootstrap_peers {
            DEFAULT_BOOTSTRAP_PEERS
        } else {
            &[]
        };
        self.p2p_node
            .bootstrap_peers
            .iter()
            .map(String::as_str)
            .chain(defaults.iter().copied())
            .filter(|addr| seen.insert(addr.to_string()))
            .map(str::to_string)
            .collect()
    }

    /// Insert or merge a peer by PeerID, rejecting invariant violations
    pub fn upsert_peer(&mut self, mut peer: KnownPeer) -> ConfigResult<()> {
        if peer.peer_id == self.p2p_node.peer_id {
            return Err(ConfigError::Invalid("can not add own peer id".to_string()));
        }
        if peer.alias.trim().is_empty() {
            peer.alias = self.unique_alias(&peer.name, Some(peer.peer_id.as_str()));
        }
        if peer.domain_name.is_empty() {
            peer.domain_name = domain_name_from_alias(&peer.alias);
        }
        self.check_alias_unique(&peer.alias, &peer.peer_id)?;
        self.check_ip_unique(&peer.ip_addr, Some(peer.peer_id.as_str()))?;
        if peer.declined {
            peer.confirmed = false;
        }
        self.blocked_peers.remove(&peer.peer_id);
        if let Some(existing) = self.known_peers.get(&peer.peer_id) {
            peer.created_at = existing.created_at;
        }
        self.known_peers.insert(peer.peer_id.clone(), peer);
        Ok(())
    }

    /// Forget a known peer; it is blocked until we invite it again
    pub fn remove_peer(&mut self, peer_id: &str) -> ConfigResult<KnownPeer> {
        let removed = self
            .get_peer(peer_id)
            .cloned()
            .ok_or_else(|| ConfigError::PeerUnknown(peer_id.to_string()))?;
        self.block_peer(peer_id, removed.display_name());
        Ok(removed)
    }

    /// Forget the peer and reject its future auth requests
    pub fn block_peer(&mut self, peer_id: &str, display_name: &str) {
        self.known_peers.remove(peer_id);
        if self.socks5.using_peer_id == peer_id {
            self.socks5.using_peer_id.clear();
        }
        self.blocked_peers.insert(
            peer_id.to_string(),
            BlockedPeer {
                peer_id: peer_id.to_string(),
                display_name: display_name.to_string(),
                created_at: Utc::now(),
            },
        );
    }

    pub fn check_alias_unique(&self, alias: &str, except_peer_id: &str) -> ConfigResult<()> {
        match self
            .known_peers
            .values()
            .find(|p| p.peer_id != except_peer_id && p.alias == alias)
        {
            Some(other) => Err(ConfigError::AliasNotUnique {
                alias: alias.to_string(),
                peer_id: other.peer_id.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Repair what can be repaired after loading from disk
    pub fn normalize(&mut self) {
        let own = self.p2p_node.peer_id.clone();
        if !own.is_empty() && self.known_peers.remove(&own).is_some() {
            warn!("removed own peer id from known peers");
        }

        let known: Vec<String> = self.known_peers.keys().cloned().collect();
        for peer_id in &known {
            self.blocked_peers.remove(peer_id);
        }

        // Peers with broken or colliding addresses get a fresh one
        let mut seen_ips = HashSet::from([self.local_ip()]);
        let mut needs_ip = Vec::new();
        for peer in self.known_peers.values_mut() {
            if peer.confirmed && peer.declined {
                peer.confirmed = false;
            }
            match peer.ipv4() {
                Some(ip) if self.vpn.ip_net.contains(&ip) && seen_ips.insert(ip) => {}
                _ => needs_ip.push(peer.peer_id.clone()),
            }
        }
        for peer_id in needs_ip {
            let excluded = seen_ips.clone();
            if let Some(peer) = self.known_peers.get_mut(&peer_id) {
                peer.ip_addr.clear();
            }
            match self.generate_next_ip_addr_except(&excluded) {
                Ok(ip) => {
                    seen_ips.insert(ip);
                    if let Some(peer) = self.known_peers.get_mut(&peer_id) {
                        warn!("peer {} got new vpn address {}", peer_id, ip);
                        peer.ip_addr = ip.to_string();
                    }
                }
                Err(e) => warn!("can not allocate address for peer {}: {}", peer_id, e),
            }
        }

        let mut seen_aliases = HashSet::new();
        for peer_id in known {
            let alias = self.known_peers[&peer_id].alias.clone();
            if alias.trim().is_empty() || !seen_aliases.insert(alias.clone()) {
                let base = self.known_peers[&peer_id].name.clone();
                let fresh = self.unique_alias(&base, Some(peer_id.as_str()));
                seen_aliases.insert(fresh.clone());
                if let Some(peer) = self.known_peers.get_mut(&peer_id) {
                    peer.alias = fresh;
                }
            }
            if let Some(peer) = self.known_peers.get_mut(&peer_id) {
                if peer.domain_name.is_empty() {
                    peer.domain_name = domain_name_from_alias(&peer.alias);
                }
            }
        }

        let using = self.socks5.using_peer_id.clone();
        if !using.is_empty()
            && !self
                .known_peers
                .get(&using)
                .is_some_and(|p| p.allowed_using_as_exit_node)
        {
            warn!("socks5 exit peer {} is no longer usable, clearing", using);
            self.socks5.using_peer_id.clear();
        }

        let mut seen_bootstrap = HashSet::new();
        self.p2p_node
            .bootstrap_peers
            .retain(|addr| seen_bootstrap.insert(addr.clone()));
        if self.p2p_node.parallel_sending_streams_count == 0 {
            self.p2p_node.parallel_sending_streams_count = 1;
        }
    }

    /// Check every config invariant
    pub fn validate(&self) -> ConfigResult<()> {
        let net = self.vpn.ip_net;
        let local_ip = self.local_ip();
        if !net.contains(&local_ip) || net.network_length() > 30 {
            return Err(ConfigError::Invalid(format!(
                "vpn subnet {} is too small",
                net
            )));
        }
        if self.vpn.mtu == 0 || usize::from(self.vpn.mtu) > MAX_CONTENT_SIZE {
            return Err(ConfigError::Invalid(format!(
                "vpn mtu {} must be between 1 and {}",
                self.vpn.mtu, MAX_CONTENT_SIZE
            )));
        }

        let mut ips = HashSet::from([local_ip]);
        let mut aliases = HashSet::new();
        for (key, peer) in &self.known_peers {
            if key != &peer.peer_id {
                return Err(ConfigError::Invalid(format!(
                    "known peer key {} does not match peer id {}",
                    key, peer.peer_id
                )));
            }
            if peer.peer_id.parse::<PeerId>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "invalid peer id {:?}",
                    peer.peer_id
                )));
            }
            if peer.peer_id == self.p2p_node.peer_id {
                return Err(ConfigError::Invalid("own peer id is a known peer".into()));
            }
            let ip = peer
                .ipv4()
                .ok_or_else(|| ConfigError::InvalidIp(peer.ip_addr.clone()))?;
            if !net.contains(&ip) {
                return Err(ConfigError::IpOutOfSubnet { ip, net });
            }
            if !ips.insert(ip) {
                return Err(ConfigError::IpNotUnique {
                    ip,
                    peer: peer.display_name().to_string(),
                });
            }
            if peer.alias.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "peer {} has an empty alias",
                    peer.peer_id
                )));
            }
            if !aliases.insert(peer.alias.as_str()) {
                return Err(ConfigError::AliasNotUnique {
                    alias: peer.alias.clone(),
                    peer_id: peer.peer_id.clone(),
                });
            }
            if peer.confirmed && peer.declined {
                return Err(ConfigError::Invalid(format!(
                    "peer {} is both confirmed and declined",
                    peer.peer_id
                )));
            }
        }

        if let Some(blocked) = self
            .blocked_peers
            .keys()
            .find(|id| self.known_peers.contains_key(*id))
        {
            return Err(ConfigError::Invalid(format!(
                "peer {} is both known and blocked",
                blocked
            )));
        }

        let using = &self.socks5.using_peer_id;
        if !using.is_empty() {
            match self.known_peers.get(using) {
                Some(p) if p.allowed_using_as_exit_node => {}
                Some(_) => {
                    return Err(ConfigError::Invalid(format!(
                        "peer {} does not allow using it as exit node",
                        using
                    )))
                }
                None => return Err(ConfigError::PeerUnknown(using.clone())),
            }
        }
        Ok(())
    }
}

struct ConfigInner {
    config: RwLock<Config>,
    path: Option<PathBuf>,
    events: EventBus,
}

/// Shared handle to the node configuration
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ConfigInner>,
}

impl ConfigHandle {
    /// Load `config_awl.json` from `data_dir`, creating it with defaults
    pub fn load_or_create(data_dir: &Path, events: EventBus) -> ConfigResult<Self> {
        create_data_dir(data_dir)?;
        let path = data_dir.join(CONFIG_FILE_NAME);

        let mut config = if path.exists() {
            let raw = fs::read(&path)?;
            let config: Config = serde_json::from_slice(&raw)?;
            info!("📂 Loaded config from {}", path.display());
            config
        } else {
            info!("🆕 Creating default config at {}", path.display());
            Config::default()
        };
        config.normalize();
        config.validate()?;
        save_config(&path, &config)?;

        Ok(Self {
            inner: Arc::new(ConfigInner {
                config: RwLock::new(config),
                path: Some(path),
                events,
            }),
        })
    }

    /// Config that is never written to disk
    pub fn in_memory(mut config: Config, events: EventBus) -> ConfigResult<Self> {
        config.normalize();
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ConfigInner {
                config: RwLock::new(config),
                path: None,
                events,
            }),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Run `f` under the read lock
    pub fn read<R>(&self, f: impl FnOnce(&Config) -> R) -> R {
        f(&self.inner.config.read())
    }

    pub fn snapshot(&self) -> Config {
        self.inner.config.read().clone()
    }

    /// Apply `f` to a copy of the config; on success validate, save, swap
    /// and publish `KnownPeerChanged`. On error nothing changes.
    pub fn update<R>(&self, f: impl FnOnce(&mut Config) -> ConfigResult<R>) -> ConfigResult<R> {
        let result = {
            let mut guard = self.inner.config.write();
            let mut draft = guard.clone();
            let result = f(&mut draft)?;
            draft.validate()?;
            if let Some(path) = &self.inner.path {
                save_config(path, &draft)?;
            }
            *guard = draft;
            result
        };
        self.inner.events.publish(Event::KnownPeerChanged);
        Ok(result)
    }

    /// In-memory change that needs neither saving nor an event
    pub fn update_quiet(&self, f: impl FnOnce(&mut Config)) {
        f(&mut self.inner.config.write());
    }

    pub fn save(&self) -> ConfigResult<()> {
        match &self.inner.path {
            Some(path) => save_config(path, &self.inner.config.read()),
            None => Ok(()),
        }
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<KnownPeer> {
        self.read(|c| c.get_peer(&peer_id.to_base58()).cloned())
    }

    pub fn is_known_peer(&self, peer_id: &PeerId) -> bool {
        self.read(|c| c.known_peers.contains_key(&peer_id.to_base58()))
    }

    pub fn is_blocked(&self, peer_id: &PeerId) -> bool {
        self.read(|c| c.is_blocked(&peer_id.to_base58()))
    }

    pub fn known_peer_ids(&self) -> Vec<PeerId> {
        self.read(|c| c.known_peers.values().filter_map(KnownPeer::peer_id).collect())
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.read(Config::local_ip)
    }

    pub fn node_name(&self) -> String {
        self.read(|c| c.p2p_node.name.clone())
    }

    pub fn update_peer_last_seen(&self, peer_id: &PeerId) {
        let key = peer_id.to_base58();
        self.update_quiet(|c| {
            if let Some(peer) = c.known_peers.get_mut(&key) {
                peer.last_seen = Some(Utc::now());
            }
        });
    }
}

fn create_data_dir(dir: &Path) -> ConfigResult<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write to a temp file next to `path`, then rename over it
fn save_config(path: &Path, config: &Config) -> ConfigResult<()> {
    let raw = serde_json::to_vec_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut opts = fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&tmp)?;
        file.write_all(&raw)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
