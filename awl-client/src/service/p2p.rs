//! Peer service: connectivity to known and bootstrap peers on top of the host

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use libp2p::{Multiaddr, PeerId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConfigHandle;
use crate::event_bus::Event;
use crate::p2p::{ConnectionEvent, ConnectionInfo, Host, HostError};

/// Protection tag for known and bootstrap peers
pub const PROTECTION_TAG: &str = "known";
const BOOTSTRAP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BootstrapPeerInfo {
    pub error: Option<String>,
    pub connections: Vec<ConnectionInfo>,
}

type PeerCallback = Arc<dyn Fn(PeerId) + Send + Sync>;

struct Inner {
    host: Host,
    config: ConfigHandle,
    bootstraps_info: RwLock<HashMap<PeerId, BootstrapPeerInfo>>,
    on_connect: RwLock<Vec<PeerCallback>>,
    on_disconnect: RwLock<Vec<PeerCallback>>,
    protected_known: Mutex<HashSet<PeerId>>,
}

#[derive(Clone)]
pub struct PeerService {
    inner: Arc<Inner>,
}

impl PeerService {
    pub fn new(host: Host, config: ConfigHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                host,
                config,
                bootstraps_info: RwLock::new(HashMap::new()),
                on_connect: RwLock::new(Vec::new()),
                on_disconnect: RwLock::new(Vec::new()),
                protected_known: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    /// Protect peers, then run the connection event pump, the known-peer
    /// watcher and the maintenance loop
    pub fn start(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        for (peer, _) in self.inner.host.bootstrap_peers() {
            self.inner.host.protect(*peer, PROTECTION_TAG);
        }
        self.reprotect_known_peers();

        let events = self.inner.host.subscribe_connections();
        let pump = tokio::spawn(self.clone().pump_connection_events(events, cancel.clone()));

        let this = self.clone();
        let watcher = self
            .inner
            .config
            .events()
            .subscribe_with_callback(cancel.clone(), move |ev| {
                if ev == Event::KnownPeerChanged {
                    this.reprotect_known_peers();
                }
            });

        let interval = self.inner.config.read(|c| c.reconnection_interval());
        let maintain = tokio::spawn(
            self.clone()
                .maintain_background_connections(interval, cancel.clone()),
        );
        vec![pump, watcher, maintain]
    }

    pub fn on_connected(&self, callback: impl Fn(PeerId) + Send + Sync + 'static) {
        self.inner.on_connect.write().push(Arc::new(callback));
    }

    pub fn on_disconnected(&self, callback: impl Fn(PeerId) + Send + Sync + 'static) {
        self.inner.on_disconnect.write().push(Arc::new(callback));
    }

    fn reprotect_known_peers(&self) {
        let known: HashSet<PeerId> = self.inner.config.known_peer_ids().into_iter().collect();
        let mut protected = self.inner.protected_known.lock();
        for peer in known.difference(&protected) {
            self.inner.host.protect(*peer, PROTECTION_TAG);
        }
        let bootstraps: HashSet<PeerId> =
            self.inner.host.bootstrap_peers().iter().map(|(p, _)| *p).collect();
        for peer in protected.difference(&known) {
            if !bootstraps.contains(peer) {
                self.inner.host.unprotect(peer, PROTECTION_TAG);
            }
        }
        *protected = known;
    }

    async fn pump_connection_events(
        self,
        mut events: broadcast::Receiver<ConnectionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = events.recv() => ev,
            };
            match event {
                Ok(ConnectionEvent::Connected(peer)) => {
                    self.inner.config.update_peer_last_seen(&peer);
                    let callbacks = self.inner.on_connect.read().clone();
                    callbacks.iter().for_each(|cb| cb(peer));
                }
                Ok(ConnectionEvent::Disconnected(peer)) => {
                    let callbacks = self.inner.on_disconnect.read().clone();
                    callbacks.iter().for_each(|cb| cb(peer));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("connection event pump lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Connect to `peer` through a DHT lookup unless already connected
    pub async fn connect_peer(&self, peer: PeerId) -> Result<(), HostError> {
        let host = &self.inner.host;
        if host.is_connected(&peer) {
            return Ok(());
        }
        let addrs = match host.find_peer(peer).await {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("find peer {}: {}", peer, e);
                Vec::new()
            }
        };
        host.connect(peer, addrs).await
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.host.is_connected(peer)
    }

    pub fn streams_to_peer(&self, peer: &PeerId) -> usize {
        self.inner.host.bandwidth().streams_to_peer(peer)
    }

    pub fn bootstraps_info(&self) -> HashMap<PeerId, BootstrapPeerInfo> {
        self.inner.bootstraps_info.read().clone()
    }

    pub async fn maintain_background_connections(
        self,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.maintain_once().await,
            }
        }
        info!("peer maintenance loop stopped");
    }

    async fn maintain_once(&self) {
        let known = self.inner.config.known_peer_ids();
        join_all(known.into_iter().map(|peer| async move {
            if let Err(e) = self.connect_peer(peer).await {
                debug!("reconnect to known peer {}: {}", peer, e);
            }
        }))
        .await;

        let bootstraps: Vec<(PeerId, Multiaddr)> = self.inner.host.bootstrap_peers().to_vec();
        let results = join_all(bootstraps.into_iter().map(|(peer, addr)| async move {
            let res = tokio::time::timeout(
                BOOTSTRAP_CONNECT_TIMEOUT,
                self.inner.host.connect(peer, vec![addr]),
            )
            .await;
            let error = match res {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("connect timed out".to_string()),
            };
            (peer, error)
        }))
        .await;

        {
            let mut info = self.inner.bootstraps_info.write();
            for (peer, error) in results {
                info.insert(
                    peer,
                    BootstrapPeerInfo {
                        error,
                        connections: self.inner.host.connections_to(&peer),
                    },
                );
            }
        }

        if let Err(e) = self.inner.host.trim_open_connections().await {
            debug!("trim connections: {}", e);
        }
    }
}
