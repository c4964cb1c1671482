//! Overlay host: identity, transports, DHT, connection management and
//! protocol-named streams

mod bandwidth;
mod conn_manager;
mod host;

pub use bandwidth::{BandwidthCounter, BandwidthStats, MeteredStream};
pub use conn_manager::{ConnManager, GRACE_PERIOD, HIGH_WATERMARK, LOW_WATERMARK};
pub use host::{Host, HostConfig};

use chrono::{DateTime, Utc};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::Serialize;

/// Overlay stream as handed to protocol handlers
pub type AwlStream = MeteredStream<libp2p::Stream>;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("peer {peer} is unreachable: {reason}")]
    Unreachable { peer: PeerId, reason: String },

    #[error("stream i/o: {0}")]
    StreamIo(#[from] std::io::Error),

    #[error("protocol {0} already has a stream handler")]
    HandlerExists(String),

    #[error("invalid identity: {0}")]
    Identity(String),

    #[error("failed to build host: {0}")]
    Build(String),

    #[error("host is shut down")]
    Shutdown,
}

impl HostError {
    pub(crate) fn unreachable(peer: PeerId, reason: impl ToString) -> Self {
        HostError::Unreachable {
            peer,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reachability {
    #[default]
    Unknown,
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionInfo {
    pub multiaddr: String,
    pub via_relay: bool,
    pub relay_peer_id: Option<String>,
    pub address: String,
    pub protocol_name: String,
    pub direction: Direction,
    pub opened_at: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(addr: &Multiaddr, direction: Direction) -> Self {
        let mut relay_peer_id = None;
        let mut last_peer = None;
        let mut via_relay = false;
        let mut address = String::new();
        let mut protocol_name = String::new();

        for proto in addr.iter() {
            match proto {
                Protocol::P2p(peer) => last_peer = Some(peer),
                Protocol::P2pCircuit => {
                    via_relay = true;
                    relay_peer_id = last_peer.map(|p| p.to_base58());
                }
                Protocol::Ip4(ip) if address.is_empty() => address = ip.to_string(),
                Protocol::Ip6(ip) if address.is_empty() => address = ip.to_string(),
                Protocol::Dns(host) | Protocol::Dns4(host) | Protocol::Dns6(host)
                    if address.is_empty() =>
                {
                    address = host.to_string()
                }
                Protocol::Tcp(_) if protocol_name.is_empty() => protocol_name = "tcp".into(),
                Protocol::QuicV1 if !via_relay => protocol_name = "quic-v1".into(),
                _ => {}
            }
        }

        Self {
            multiaddr: addr.to_string(),
            via_relay,
            relay_peer_id,
            address,
            protocol_name,
            direction,
            opened_at: Utc::now(),
        }
    }
}

/// PeerID carried in the trailing `/p2p/` component
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().fold(None, |found, proto| match proto {
        Protocol::P2p(peer) => Some(peer),
        _ => found,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_connection_info() {
        let addr: Multiaddr = "/ip4/192.0.2.7/udp/4001/quic-v1".parse().unwrap();
        let info = ConnectionInfo::new(&addr, Direction::Outbound);
        assert!(!info.via_relay);
        assert_eq!(info.address, "192.0.2.7");
        assert_eq!(info.protocol_name, "quic-v1");
    }

    #[test]
    fn relayed_connection_info() {
        let relay = PeerId::random();
        let target = PeerId::random();
        let addr: Multiaddr = format!("/ip4/198.51.100.1/tcp/4001/p2p/{relay}/p2p-circuit/p2p/{target}")
            .parse()
            .unwrap();
        let info = ConnectionInfo::new(&addr, Direction::Inbound);
        assert!(info.via_relay);
        assert_eq!(info.relay_peer_id, Some(relay.to_base58()));
        assert_eq!(info.protocol_name, "tcp");
        assert_eq!(peer_id_of(&addr), Some(target));
    }
}
