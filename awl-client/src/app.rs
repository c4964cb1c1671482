//! Node wiring: config, host and services under one cancellation token

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, ConfigHandle};
use crate::dns::DnsMapping;
use crate::event_bus::EventBus;
use crate::log_buffer::LogBuffer;
use crate::p2p::{Host, HostConfig, HostError};
use crate::packet::PacketPool;
use crate::service::{AuthStatus, PeerService, Socks5Service, Tunnel};
use crate::socks5::RuleSet;
use crate::tun::TunDevice;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Version advertised in the user agent
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
const SHUTDOWN_TASK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AppOptions {
    pub data_dir: PathBuf,
    /// Device to use; `None` creates the OS interface from the vpn config
    pub tun: Option<TunDevice>,
    /// Targets peers may reach through our SOCKS5 exit
    pub socks5_rules: RuleSet,
    pub log_buffer: Option<LogBuffer>,
}

impl AppOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            tun: None,
            socks5_rules: RuleSet::DenyLocalhost,
            log_buffer: None,
        }
    }
}

pub struct Application {
    pub(crate) config: ConfigHandle,
    pub(crate) host: Host,
    pub(crate) peers: PeerService,
    pub(crate) auth: AuthStatus,
    pub(crate) tunnel: Tunnel,
    pub(crate) socks5: Socks5Service,
    pub(crate) dns: DnsMapping,
    pub(crate) pool: PacketPool,
    pub(crate) logs: Option<LogBuffer>,
    pub(crate) started_at: DateTime<Utc>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Application {
    /// Start a node with default options on `tun`
    pub async fn init(
        data_dir: &Path,
        tun: TunDevice,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>, BoxError> {
        let mut opts = AppOptions::new(data_dir);
        opts.tun = Some(tun);
        Self::init_with(opts, cancel).await
    }

    pub async fn init_with(opts: AppOptions, cancel: &CancellationToken) -> Result<Arc<Self>, BoxError> {
        let cancel = cancel.child_token();
        let events = EventBus::new();
        let config = ConfigHandle::load_or_create(&opts.data_dir, events)?;
        let keypair = load_or_create_identity(&config)?;

        let tun = match opts.tun {
            Some(tun) => tun,
            None => {
                let (name, ip, prefix, mtu) = config.read(|c| {
                    (
                        c.vpn.interface_name.clone(),
                        c.local_ip(),
                        c.vpn.ip_net.network_length(),
                        c.vpn.mtu,
                    )
                });
                TunDevice::create(&name, ip, prefix, mtu)?
            }
        };

        let (listen_addresses, bootstrap_peers) = config.read(|c| {
            (
                parse_multiaddrs(&c.p2p_node.listen_addresses),
                parse_multiaddrs(&c.bootstrap_peers()),
            )
        });
        let host = Host::start(
            HostConfig {
                keypair,
                listen_addresses,
                bootstrap_peers,
                user_agent: awl_proto::format_user_agent(VERSION),
            },
            &cancel,
        )?;

        let pool = PacketPool::new();
        let peers = PeerService::new(host.clone(), config.clone());
        let auth = AuthStatus::new(peers.clone(), config.clone(), &cancel);
        let tunnel = Tunnel::new(peers.clone(), config.clone(), Arc::new(tun), pool.clone(), &cancel);
        let socks5 = Socks5Service::new(peers.clone(), config.clone(), opts.socks5_rules, &cancel);
        if let Err(e) = register_handlers(&auth, &tunnel, &socks5) {
            host.close().await;
            return Err(e.into());
        }

        let mut tasks = peers.start(&cancel);
        tasks.extend(auth.start());
        tasks.extend(tunnel.start());
        let dns = DnsMapping::new();
        tasks.push(dns.follow_config(&config, &cancel));
        match socks5.start().await {
            Ok(Some(listener)) => tasks.push(listener),
            Ok(None) => {}
            Err(e) => warn!("⚠️ socks5 listener failed to start: {}", e),
        }

        info!(
            "🚀 awl {} started as {} ({})",
            VERSION,
            config.node_name(),
            host.peer_id()
        );
        Ok(Arc::new(Self {
            config,
            host,
            peers,
            auth,
            tunnel,
            socks5,
            dns,
            pool,
            logs: opts.log_buffer,
            started_at: Utc::now(),
            cancel,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn peer_id(&self) -> PeerId {
        self.host.peer_id()
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn peers(&self) -> &PeerService {
        &self.peers
    }

    pub fn auth(&self) -> &AuthStatus {
        &self.auth
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    pub fn socks5(&self) -> &Socks5Service {
        &self.socks5
    }

    pub fn dns(&self) -> &DnsMapping {
        &self.dns
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    /// Resolves when the node is shutting down
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Stop every service, close the host and save the config
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_TASK_TIMEOUT, task).await.is_err() {
                abort.abort();
            }
        }
        self.host.close().await;
        if let Err(e) = self.config.save() {
            warn!("⚠️ saving config on shutdown: {}", e);
        }
        info!("👋 awl stopped");
    }
}

fn register_handlers(auth: &AuthStatus, tunnel: &Tunnel, socks5: &Socks5Service) -> Result<(), HostError> {
    auth.register_handlers()?;
    tunnel.register_handler()?;
    socks5.register_handler()
}

fn parse_multiaddrs(raw: &[String]) -> Vec<Multiaddr> {
    raw.iter()
        .filter_map(|addr| match addr.parse::<Multiaddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("⚠️ skipping invalid multiaddr {:?}: {}", addr, e);
                None
            }
        })
        .collect()
}

/// Decode the stored identity, generating and saving one on first start
fn load_or_create_identity(config: &ConfigHandle) -> Result<Keypair, BoxError> {
    let stored = config.read(|c: &Config| c.p2p_node.identity.clone());
    let keypair = if stored.is_empty() {
        info!("🔑 generating new node identity");
        Keypair::generate_ed25519()
    } else {
        let raw = STANDARD.decode(stored.trim())?;
        Keypair::from_protobuf_encoding(&raw).map_err(|e| HostError::Identity(e.to_string()))?
    };

    let identity = STANDARD.encode(
        keypair
            .to_protobuf_encoding()
            .map_err(|e| HostError::Identity(e.to_string()))?,
    );
    let peer_id = keypair.public().to_peer_id().to_base58();
    let changed = config.read(|c| c.p2p_node.identity != identity || c.p2p_node.peer_id != peer_id);
    if changed {
        config.update_quiet(|c| {
            c.p2p_node.identity = identity;
            c.p2p_node.peer_id = peer_id;
        });
        config.save()?;
    }
    Ok(keypair)
}
