//! Anywherelan overlay protocol
//!
//! Protocol identifiers, the messages exchanged over the `/auth` and
//! `/status` protocols, the JSON-sequence stream codec and the user agent
//! format shared by every awl node.

pub mod codec;
pub mod message;
pub mod user_agent;

use libp2p::StreamProtocol;

pub use codec::{read_message, write_message, MAX_MESSAGE_SIZE};
pub use message::{AuthPeer, AuthPeerResponse, KnownPeerInfo, PeerStatusInfo};
pub use user_agent::{format_user_agent, parse_user_agent, UserAgent};

/// Protocol version embedded in every protocol ID
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Friend request protocol
pub const AUTH_PROTOCOL: StreamProtocol = StreamProtocol::new("/awl/0.1.0/auth/");
/// Periodic status exchange protocol
pub const STATUS_PROTOCOL: StreamProtocol = StreamProtocol::new("/awl/0.1.0/status/");
/// One IP packet per stream
pub const TUNNEL_PROTOCOL: StreamProtocol = StreamProtocol::new("/awl/0.1.0/tunnel/");
/// RFC 1928 SOCKS5 spliced over the overlay
pub const SOCKS5_PROTOCOL: StreamProtocol = StreamProtocol::new("/awl/0.1.0/socks5/");

/// Kademlia protocol prefix
pub const DHT_PROTOCOL_PREFIX: &str = "/awl";
/// Kademlia protocol name
pub const DHT_PROTOCOL: StreamProtocol = StreamProtocol::new("/awl/kad/1.0.0");

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("stream i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("stream closed before a complete message")]
    UnexpectedEof,
}

pub type ProtoResult<T> = Result<T, ProtoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_ids_share_version_prefix() {
        let prefix = format!("{}/{}/", DHT_PROTOCOL_PREFIX, PROTOCOL_VERSION);
        for proto in [AUTH_PROTOCOL, STATUS_PROTOCOL, TUNNEL_PROTOCOL, SOCKS5_PROTOCOL] {
            assert!(proto.as_ref().starts_with(&prefix), "{}", proto);
        }
    }
}
