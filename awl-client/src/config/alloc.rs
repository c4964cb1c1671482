//! VPN address allocation and name mapping

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;

use super::{Config, ConfigError, ConfigResult};
use crate::config::known_peer::domain_name_from_alias;

impl Config {
    fn used_ips(&self) -> HashSet<Ipv4Addr> {
        self.known_peers
            .values()
            .filter_map(|p| p.ipv4())
            .chain(std::iter::once(self.local_ip()))
            .collect()
    }

    /// Next address after the highest one in use, wrapping to the lowest
    /// free host address of the subnet
    pub fn generate_next_ip_addr(&self) -> ConfigResult<Ipv4Addr> {
        self.generate_next_ip_addr_except(&HashSet::new())
    }

    pub fn generate_next_ip_addr_except(
        &self,
        exclusions: &HashSet<Ipv4Addr>,
    ) -> ConfigResult<Ipv4Addr> {
        let net = self.vpn.ip_net;
        let first_host = u32::from(net.first_address()).saturating_add(1);
        let last_host = u32::from(net.last_address()).saturating_sub(1);
        if first_host > last_host {
            return Err(ConfigError::SubnetExhausted(net));
        }

        let used = self.used_ips();
        let highest = used
            .iter()
            .map(|ip| u32::from(*ip))
            .filter(|ip| (first_host..=last_host).contains(ip))
            .max()
            .unwrap_or(first_host);
        let is_free = |candidate: &u32| {
            let ip = Ipv4Addr::from(*candidate);
            !used.contains(&ip) && !exclusions.contains(&ip)
        };

        (highest.saturating_add(1)..=last_host)
            .chain(first_host..=highest)
            .find(is_free)
            .map(Ipv4Addr::from)
            .ok_or(ConfigError::SubnetExhausted(net))
    }

    /// Parse `ip` and make sure no other peer (nor this node) owns it
    pub fn check_ip_unique(&self, ip: &str, except_peer_id: Option<&str>) -> ConfigResult<Ipv4Addr> {
        let addr: Ipv4Addr = ip
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidIp(ip.to_string()))?;
        let net = self.vpn.ip_net;
        if !net.contains(&addr) || addr == net.first_address() || addr == net.last_address() {
            return Err(ConfigError::IpOutOfSubnet { ip: addr, net });
        }
        if addr == self.local_ip() {
            return Err(ConfigError::IpIsLocal(addr));
        }
        let owner = self.known_peers.values().find(|p| {
            Some(p.peer_id.as_str()) != except_peer_id && p.ipv4() == Some(addr)
        });
        match owner {
            Some(peer) => Err(ConfigError::IpNotUnique {
                ip: addr,
                peer: peer.display_name().to_string(),
            }),
            None => Ok(addr),
        }
    }

    /// Every PeerID and domain name of a known peer mapped to its VPN address
    pub fn dns_names_mapping(&self) -> BTreeMap<String, Ipv4Addr> {
        let mut mapping = BTreeMap::new();
        for peer in self.known_peers.values() {
            let Some(ip) = peer.ipv4() else { continue };
            mapping.insert(peer.peer_id.clone(), ip);
            let domain = if peer.domain_name.is_empty() {
                domain_name_from_alias(&peer.alias)
            } else {
                peer.domain_name.clone()
            };
            if !domain.is_empty() {
                mapping.insert(domain, ip);
            }
        }
        mapping
    }

    /// `base` if no other peer uses it, otherwise `base_2`, `base_3`, ...
    pub fn unique_alias(&self, base: &str, except_peer_id: Option<&str>) -> String {
        let base = match base.trim() {
            "" => "peer",
            trimmed => trimmed,
        };
        let taken: HashSet<&str> = self
            .known_peers
            .values()
            .filter(|p| Some(p.peer_id.as_str()) != except_peer_id)
            .map(|p| p.alias.as_str())
            .collect();
        if !taken.contains(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{}_{}", base, n))
            .find(|candidate| !taken.contains(candidate.as_str()))
            .unwrap_or_else(|| base.to_string())
    }
}
