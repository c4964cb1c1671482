//! Admin operations behind the HTTP surface
//!
//! Request validation happens here before anything touches the core: the
//! PeerID must decode, IPs must be IPv4 inside the VPN subnet, aliases must
//! trim to something non-empty and the node's own PeerID is refused.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::{Application, VERSION};
use crate::config::{domain_name_from_alias, ConfigError, KnownPeer};
use crate::error::{AwlError, AwlResult};
use crate::p2p::{BandwidthStats, ConnectionInfo, Reachability};
use crate::service::{AvailableProxy, BootstrapPeerInfo};
use crate::utils::format_bytes;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerStatus {
    #[serde(rename = "PeerID")]
    pub peer_id: String,
    pub name: String,
    pub display_name: String,
    pub alias: String,
    pub version: String,
    #[serde(rename = "IPAddr")]
    pub ip_addr: String,
    pub domain_name: String,
    pub connected: bool,
    pub confirmed: bool,
    pub declined: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub connections: Vec<ConnectionInfo>,
    pub network_stats: BandwidthStats,
    pub network_stats_in_iec_units: IecStats,
    pub we_allow_using_as_exit_node: bool,
    pub allowed_using_as_exit_node: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IecStats {
    pub total_in: String,
    pub total_out: String,
    pub rate_in: String,
    pub rate_out: String,
}

impl From<BandwidthStats> for IecStats {
    fn from(stats: BandwidthStats) -> Self {
        Self {
            total_in: format_bytes(stats.total_in),
            total_out: format_bytes(stats.total_out),
            rate_in: format!("{}/s", format_bytes(stats.rate_in as u64)),
            rate_out: format!("{}/s", format_bytes(stats.rate_out as u64)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSettingsUpdate {
    #[serde(rename = "peerID")]
    pub peer_id: String,
    pub alias: String,
    #[serde(default)]
    pub domain_name: String,
    #[serde(rename = "ipAddr", default)]
    pub ip_addr: String,
    #[serde(default)]
    pub allow_using_as_exit_node: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthRequest {
    #[serde(rename = "PeerID")]
    pub peer_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Socks5Info {
    pub listen_address: String,
    pub listener_enabled: bool,
    pub proxying_enabled: bool,
    #[serde(rename = "UsingPeerID")]
    pub using_peer_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerInfo {
    #[serde(rename = "PeerID")]
    pub peer_id: String,
    pub name: String,
    pub uptime_secs: i64,
    pub server_version: String,
    pub network_stats: BandwidthStats,
    pub network_stats_in_iec_units: IecStats,
    pub total_bootstrap_peers: usize,
    pub connected_bootstrap_peers: usize,
    pub reachability: Reachability,
    #[serde(rename = "VPNIP")]
    pub vpn_ip: Ipv4Addr,
    pub vpn_interface: String,
    pub socks5: Socks5Info,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionsInfo {
    pub connected_peers_count: usize,
    pub open_connections_count: usize,
    pub open_streams_count: usize,
    pub last_trim: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DhtInfo {
    pub routing_table_size: usize,
    pub reachability: Reachability,
    pub listen_addrs: Vec<String>,
    pub observed_addrs: Vec<String>,
    pub bootstrap_peers: BTreeMap<String, BootstrapPeerInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct P2pInfo {
    pub connections: ConnectionsInfo,
    pub dht: DhtInfo,
    pub total_bandwidth: BandwidthStats,
    pub bandwidth_by_protocol: BTreeMap<String, BandwidthStats>,
    pub vpn_peers: usize,
    pub vpn_unrouted_packets: u64,
    pub vpn_dropped_packets: u64,
    pub idle_packets: usize,
    pub uptime_secs: i64,
}

fn parse_peer_id(raw: &str) -> AwlResult<PeerId> {
    raw.trim()
        .parse()
        .map_err(|_| AwlError::InvalidPeerId(raw.to_string()))
}

impl Application {
    fn parse_foreign_peer_id(&self, raw: &str) -> AwlResult<PeerId> {
        let peer = parse_peer_id(raw)?;
        if peer == self.peer_id() {
            return Err(AwlError::OwnPeerId);
        }
        Ok(peer)
    }

    fn peer_status(&self, known: &KnownPeer) -> PeerStatus {
        let peer = known.peer_id();
        let connected = peer.is_some_and(|p| self.peers.is_connected(&p));
        let stats = peer
            .map(|p| self.host.bandwidth().for_peer(&p))
            .unwrap_or_default();
        let version = peer
            .and_then(|p| self.host.peer_user_agent(&p))
            .and_then(|ua| awl_proto::parse_user_agent(&ua))
            .map(|ua| ua.version)
            .unwrap_or_default();
        PeerStatus {
            peer_id: known.peer_id.clone(),
            name: known.name.clone(),
            display_name: known.display_name().to_string(),
            alias: known.alias.clone(),
            version,
            ip_addr: known.ip_addr.clone(),
            domain_name: known.domain_name.clone(),
            connected,
            confirmed: known.confirmed,
            declined: known.declined,
            last_seen: known.last_seen,
            connections: peer.map(|p| self.host.connections_to(&p)).unwrap_or_default(),
            network_stats: stats,
            network_stats_in_iec_units: stats.into(),
            we_allow_using_as_exit_node: known.we_allow_using_as_exit_node,
            allowed_using_as_exit_node: known.allowed_using_as_exit_node,
        }
    }

    /// Known peers sorted by display name
    pub fn known_peers(&self) -> Vec<PeerStatus> {
        let peers: Vec<KnownPeer> = self.config.read(|c| c.known_peers.values().cloned().collect());
        let mut statuses: Vec<PeerStatus> = peers.iter().map(|p| self.peer_status(p)).collect();
        statuses.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        statuses
    }

    pub fn known_peer_settings(&self, peer_id: &str) -> AwlResult<KnownPeer> {
        let peer = parse_peer_id(peer_id)?;
        self.config
            .get_peer(&peer)
            .ok_or_else(|| ConfigError::PeerUnknown(peer.to_base58()).into())
    }

    /// Change alias, domain, IP or exit permission of a known peer
    pub fn update_peer_settings(&self, req: PeerSettingsUpdate) -> AwlResult<KnownPeer> {
        let peer = self.parse_foreign_peer_id(&req.peer_id)?;
        let key = peer.to_base58();
        let alias = req.alias.trim().to_string();
        if alias.is_empty() {
            return Err(AwlError::EmptyAlias);
        }
        let ip_addr = req.ip_addr.trim().to_string();
        if !ip_addr.is_empty() && ip_addr.parse::<Ipv4Addr>().is_err() {
            return Err(AwlError::InvalidIp(ip_addr));
        }
        let domain_name = match req.domain_name.trim() {
            "" => domain_name_from_alias(&alias),
            name => name.to_string(),
        };

        let updated = self.config.update(|c| {
            let mut updated = c
                .get_peer(&key)
                .cloned()
                .ok_or_else(|| ConfigError::PeerUnknown(key.clone()))?;
            c.check_alias_unique(&alias, &key)?;
            if !ip_addr.is_empty() {
                updated.ip_addr = c.check_ip_unique(&ip_addr, Some(key.as_str()))?.to_string();
            }
            updated.alias = alias.clone();
            updated.domain_name = domain_name.clone();
            updated.we_allow_using_as_exit_node = req.allow_using_as_exit_node;
            c.known_peers.insert(key.clone(), updated.clone());
            Ok(updated)
        })?;
        info!("✏️ updated settings of {}", key);

        // apply the new address now rather than on the next event
        self.tunnel.refresh_peers_list();
        let auth = self.auth.clone();
        let known = updated.clone();
        tokio::spawn(async move {
            if let Err(e) = auth.exchange_new_status_info(peer, &known).await {
                debug!("status exchange with {} after settings update: {}", peer, e);
            }
        });
        Ok(updated)
    }

    pub fn remove_peer(&self, peer_id: &str) -> AwlResult<()> {
        let peer = self.parse_foreign_peer_id(peer_id)?;
        self.config.update(|c| c.remove_peer(&peer.to_base58()).map(|_| ()))?;
        info!("🗑️ removed peer {}", peer);
        Ok(())
    }

    pub fn send_friend_request(&self, peer_id: &str, alias: &str) -> AwlResult<()> {
        let peer = self.parse_foreign_peer_id(peer_id)?;
        self.auth.send_friend_request(peer, alias)
    }

    pub async fn reply_friend_request(&self, peer_id: &str, alias: &str, decline: bool) -> AwlResult<()> {
        let peer = self.parse_foreign_peer_id(peer_id)?;
        if !decline && alias.trim().is_empty() {
            return Err(AwlError::EmptyAlias);
        }
        self.auth.reply_friend_request(peer, alias, decline).await
    }

    pub fn auth_requests(&self) -> Vec<AuthRequest> {
        self.auth
            .auth_requests()
            .into_iter()
            .map(|(peer, req)| AuthRequest {
                peer_id: peer.to_base58(),
                name: req.name,
            })
            .collect()
    }

    pub fn peer_info(&self) -> PeerInfo {
        let stats = self.host.bandwidth().totals();
        let bootstraps = self.host.bootstrap_peers();
        let connected_bootstraps = bootstraps
            .iter()
            .filter(|(p, _)| self.host.is_connected(p))
            .count();
        self.config.read(|c| PeerInfo {
            peer_id: self.peer_id().to_base58(),
            name: c.p2p_node.name.clone(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            server_version: VERSION.to_string(),
            network_stats: stats,
            network_stats_in_iec_units: stats.into(),
            total_bootstrap_peers: bootstraps.len(),
            connected_bootstrap_peers: connected_bootstraps,
            reachability: self.host.reachability(),
            vpn_ip: c.local_ip(),
            vpn_interface: c.vpn.interface_name.clone(),
            socks5: Socks5Info {
                listen_address: self
                    .socks5
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| c.socks5.listen_address.clone()),
                listener_enabled: c.socks5.listener_enabled,
                proxying_enabled: c.socks5.proxying_enabled,
                using_peer_id: c.socks5.using_peer_id.clone(),
            },
        })
    }

    /// Rename this node and push the new name to every peer
    pub fn update_my_settings(&self, name: &str) -> AwlResult<()> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".into()).into());
        }
        self.config.update(|c| {
            c.p2p_node.name = name.clone();
            Ok(())
        })?;
        info!("✏️ node renamed to {}", name);

        let peers: Vec<KnownPeer> = self
            .config
            .read(|c| c.known_peers.values().filter(|p| !p.declined).cloned().collect());
        for known in peers {
            let Some(peer) = known.peer_id() else { continue };
            let auth = self.auth.clone();
            tokio::spawn(async move {
                if let Err(e) = auth.exchange_new_status_info(peer, &known).await {
                    debug!("status exchange with {} after rename: {}", peer, e);
                }
            });
        }
        Ok(())
    }

    pub fn list_available_proxies(&self) -> Vec<AvailableProxy> {
        self.socks5.list_available_proxies()
    }

    pub fn set_proxy(&self, peer_id: &str) -> AwlResult<()> {
        if !peer_id.trim().is_empty() {
            self.parse_foreign_peer_id(peer_id)?;
        }
        self.socks5.set_proxy(peer_id)
    }

    /// Debug snapshot of the overlay host
    pub async fn p2p_info(&self) -> AwlResult<P2pInfo> {
        let routing_table_size = self.host.routing_table().await?.len();
        let bootstrap_peers = self
            .peers
            .bootstraps_info()
            .into_iter()
            .map(|(peer, info)| (peer.to_base58(), info))
            .collect();
        Ok(P2pInfo {
            connections: ConnectionsInfo {
                connected_peers_count: self.host.connected_peers().len(),
                open_connections_count: self.host.connection_count(),
                open_streams_count: self.host.open_stream_count(),
                last_trim: self.host.last_trim(),
            },
            dht: DhtInfo {
                routing_table_size,
                reachability: self.host.reachability(),
                listen_addrs: self.host.listen_addrs().iter().map(|a| a.to_string()).collect(),
                observed_addrs: self.host.observed_addrs().iter().map(|a| a.to_string()).collect(),
                bootstrap_peers,
            },
            total_bandwidth: self.host.bandwidth().totals(),
            bandwidth_by_protocol: self.host.bandwidth().by_protocol().into_iter().collect(),
            vpn_peers: self.tunnel.peer_count(),
            vpn_unrouted_packets: self.tunnel.unrouted_packets(),
            vpn_dropped_packets: self.tunnel.dropped_packets(),
            idle_packets: self.pool.idle(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        })
    }

    /// Last (or first, with `from_head`) `logs` lines of the log buffer
    pub fn logs(&self, logs: usize, from_head: bool) -> String {
        self.logs
            .as_ref()
            .map(|buf| buf.snapshot(logs, from_head))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iec_stats_from_bandwidth() {
        let stats = BandwidthStats {
            total_in: 1024,
            total_out: 4 << 30,
            rate_in: 1148.0,
            rate_out: 0.0,
        };
        let iec = IecStats::from(stats);
        assert_eq!(iec.total_in, "1 KiB");
        assert_eq!(iec.total_out, "4 GiB");
        assert_eq!(iec.rate_in, "1.12 KiB/s");
        assert_eq!(iec.rate_out, "0 B/s");
    }

    #[test]
    fn settings_update_accepts_admin_json() {
        let req: PeerSettingsUpdate = serde_json::from_str(
            r#"{"peerID":"x","alias":"nas","ipAddr":"10.66.0.9","allowUsingAsExitNode":true}"#,
        )
        .unwrap();
        assert_eq!(req.alias, "nas");
        assert_eq!(req.ip_addr, "10.66.0.9");
        assert!(req.allow_using_as_exit_node);
        assert!(req.domain_name.is_empty());
    }

    #[test]
    fn peer_id_must_decode() {
        assert!(matches!(parse_peer_id("not-a-peer"), Err(AwlError::InvalidPeerId(_))));
        let peer = PeerId::random();
        assert_eq!(parse_peer_id(&format!(" {} ", peer)).unwrap(), peer);
    }
}
