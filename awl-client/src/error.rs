//! Error types shared by the services and the admin operations

use std::net::Ipv4Addr;

use libp2p::PeerId;

use crate::config::ConfigError;
use crate::p2p::HostError;
use crate::socks5::Socks5Error;

/// Umbrella error surfaced by admin operations
#[derive(Debug, thiserror::Error)]
pub enum AwlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Proto(#[from] awl_proto::ProtoError),

    #[error(transparent)]
    Socks5(#[from] Socks5Error),

    #[error("invalid peer id {0:?}")]
    InvalidPeerId(String),

    #[error("invalid ip address {0:?}: expected IPv4")]
    InvalidIp(String),

    #[error("alias must not be empty")]
    EmptyAlias,

    #[error("peer {0} is already known")]
    PeerAlreadyKnown(PeerId),

    #[error("no auth request from peer {0}")]
    NoAuthRequest(PeerId),

    #[error("peer {0} is blocked")]
    PeerBlocked(PeerId),

    #[error("operation refused for own peer id")]
    OwnPeerId,

    #[error("ip {0} is not available")]
    IpUnavailable(Ipv4Addr),
}

pub type AwlResult<T> = Result<T, AwlError>;

impl AwlError {
    /// HTTP status code the admin surface maps this error to
    pub fn status_code(&self) -> u16 {
        match self {
            AwlError::Config(ConfigError::PeerUnknown(_)) => 404,
            AwlError::Config(_)
            | AwlError::InvalidPeerId(_)
            | AwlError::InvalidIp(_)
            | AwlError::EmptyAlias
            | AwlError::PeerAlreadyKnown(_)
            | AwlError::NoAuthRequest(_)
            | AwlError::PeerBlocked(_)
            | AwlError::OwnPeerId
            | AwlError::IpUnavailable(_) => 400,
            AwlError::Host(_) | AwlError::Proto(_) | AwlError::Socks5(_) => 500,
        }
    }
}
