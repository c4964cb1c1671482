//! Services layered on the overlay host

pub mod auth_status;
pub mod p2p;
pub mod socks5;
pub mod tunnel;

pub use auth_status::AuthStatus;
pub use p2p::{BootstrapPeerInfo, PeerService};
pub use socks5::{AvailableProxy, Socks5Service};
pub use tunnel::Tunnel;
