#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]
pub mod api;
pub mod app;
pub mod config;
pub mod dns;
pub mod error;
pub mod event_bus;
pub mod log_buffer;
pub mod p2p;
pub mod packet;
pub mod service;
pub mod socks5;
pub mod tun;
pub mod utils;

pub use app::{AppOptions, Application, BoxError};
pub use config::{Config, ConfigError, ConfigHandle, KnownPeer};
pub use error::{AwlError, AwlResult};
pub use event_bus::{Event, EventBus};
pub use utils::format_bytes;
