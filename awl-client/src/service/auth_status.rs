//! Friend requests (`/auth`) and the periodic status exchange (`/status`)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use awl_proto::{
    read_message, write_message, AuthPeer, AuthPeerResponse, KnownPeerInfo, PeerStatusInfo,
    AUTH_PROTOCOL, STATUS_PROTOCOL,
};
use chrono::Utc;
use futures::future::join_all;
use futures::AsyncWriteExt;
use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{domain_name_from_alias, ConfigError, ConfigHandle, KnownPeer};
use crate::error::{AwlError, AwlResult};
use crate::event_bus::Event;
use crate::p2p::{AwlStream, HostError};
use crate::service::p2p::PeerService;

/// Retry period for outgoing requests and the status refresh
pub const BACKGROUND_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Default)]
struct Auths {
    /// Requests we received and have not answered
    ingoing: HashMap<PeerId, AuthPeer>,
    /// Requests we sent that are not confirmed yet
    outgoing: HashMap<PeerId, AuthPeer>,
}

struct Inner {
    peers: PeerService,
    config: ConfigHandle,
    auths: Mutex<Auths>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct AuthStatus {
    inner: Arc<Inner>,
}

impl AuthStatus {
    /// Outgoing requests are rebuilt from every unconfirmed known peer
    pub fn new(peers: PeerService, config: ConfigHandle, cancel: &CancellationToken) -> Self {
        let name = config.node_name();
        let outgoing = config.read(|c| {
            c.known_peers
                .values()
                .filter(|p| !p.confirmed && !p.declined)
                .filter_map(KnownPeer::peer_id)
                .map(|id| (id, AuthPeer { name: name.clone() }))
                .collect()
        });
        Self {
            inner: Arc::new(Inner {
                peers,
                config,
                auths: Mutex::new(Auths {
                    ingoing: HashMap::new(),
                    outgoing,
                }),
                cancel: cancel.child_token(),
            }),
        }
    }

    /// Install the `/auth` and `/status` handlers
    pub fn register_handlers(&self) -> Result<(), HostError> {
        let host = self.inner.peers.host();
        let this = self.clone();
        host.set_stream_handler(AUTH_PROTOCOL, move |peer, stream| {
            this.clone().handle_auth_stream(peer, stream)
        })?;
        let this = self.clone();
        host.set_stream_handler(STATUS_PROTOCOL, move |peer, stream| {
            this.clone().handle_status_stream(peer, stream)
        })?;
        Ok(())
    }

    /// Background retry loops plus the connection-up hook
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let this = self.clone();
        self.inner.peers.on_connected(move |peer| {
            let this = this.clone();
            tokio::spawn(async move { this.on_peer_connected(peer).await });
        });

        let retry_auths = {
            let this = self.clone();
            self.every(BACKGROUND_RETRY_INTERVAL, move || {
                let this = this.clone();
                async move { this.retry_outgoing_auths().await }
            })
        };
        let refresh_statuses = {
            let this = self.clone();
            self.every(BACKGROUND_RETRY_INTERVAL, move || {
                let this = this.clone();
                async move { this.refresh_statuses().await }
            })
        };
        vec![retry_auths, refresh_statuses]
    }

    fn every<F, Fut>(&self, period: Duration, f: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => f().await,
                }
            }
        })
    }

    async fn on_peer_connected(&self, peer: PeerId) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let outgoing = self.inner.auths.lock().outgoing.get(&peer).cloned();
        if let Some(req) = outgoing {
            if let Err(e) = self.send_auth_request(peer, req).await {
                debug!("auth request to {} on connect: {}", peer, e);
            }
            return;
        }
        if let Some(known) = self.inner.config.get_peer(&peer) {
            if !known.declined {
                if let Err(e) = self.exchange_new_status_info(peer, &known).await {
                    debug!("status exchange with {} on connect: {}", peer, e);
                }
            }
        }
    }

    async fn retry_outgoing_auths(&self) {
        let outgoing: Vec<(PeerId, AuthPeer)> = self
            .inner
            .auths
            .lock()
            .outgoing
            .iter()
            .map(|(p, r)| (*p, r.clone()))
            .collect();
        join_all(outgoing.into_iter().map(|(peer, req)| async move {
            if let Err(e) = self.send_auth_request(peer, req).await {
                debug!("retry auth request to {}: {}", peer, e);
            }
        }))
        .await;
    }

    async fn refresh_statuses(&self) {
        let peers = self.inner.config.read(|c| {
            c.known_peers
                .values()
                .filter(|p| !p.declined)
                .cloned()
                .collect::<Vec<_>>()
        });
        join_all(peers.into_iter().filter_map(|known| {
            let peer = known.peer_id()?;
            Some(async move {
                if let Err(e) = self.exchange_new_status_info(peer, &known).await {
                    debug!("status refresh with {}: {}", peer, e);
                }
            })
        }))
        .await;
    }

    async fn handle_auth_stream(self, peer: PeerId, mut stream: AwlStream) {
        let req: AuthPeer = match read_message(&mut stream).await {
            Ok(req) => req,
            Err(e) => {
                warn!("read auth request from {}: {}", peer, e);
                return;
            }
        };

        let key = peer.to_base58();
        let (blocked, known, auto_accept) = self.inner.config.read(|c| {
            (
                c.is_blocked(&key),
                c.known_peers.contains_key(&key),
                c.p2p_node.auto_accept_auth_requests,
            )
        });

        let mut accepted = None;
        let mut recorded = false;
        let confirmed = if blocked {
            warn!("🚫 auth request from blocked peer {}", peer);
            false
        } else if known {
            true
        } else if auto_accept {
            match self.accept_peer(peer, &req.name, None) {
                Ok(known_peer) => {
                    info!("🤝 auto accepted friend request from {}", peer);
                    accepted = Some(known_peer);
                    true
                }
                Err(e) => {
                    warn!("auto accept {} failed: {}", peer, e);
                    false
                }
            }
        } else {
            info!("📨 friend request from {} ({})", peer, req.name);
            self.inner.auths.lock().ingoing.insert(peer, req.clone());
            recorded = true;
            false
        };

        if let Err(e) = write_message(&mut stream, &AuthPeerResponse { confirmed }).await {
            warn!("reply auth request to {}: {}", peer, e);
        }
        let _ = stream.close().await;

        if recorded {
            self.inner.config.events().publish(Event::ReceivedAuthRequest {
                peer_id: peer,
                name: req.name,
            });
        }

        let follow_up = accepted.or_else(|| {
            known
                .then(|| self.inner.config.get_peer(&peer))
                .flatten()
                .filter(|p| !p.confirmed && !p.declined)
        });
        if let Some(known_peer) = follow_up {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.exchange_new_status_info(peer, &known_peer).await {
                    warn!("status exchange with {}: {}", peer, e);
                }
            });
        }
    }

    async fn handle_status_stream(self, peer: PeerId, mut stream: AwlStream) {
        if self.inner.config.is_blocked(&peer) {
            warn!("🚫 status from blocked peer {}", peer);
            return;
        }
        let Some(known) = self.inner.config.get_peer(&peer) else {
            info!("status from unknown peer {}", peer);
            return;
        };

        let remote: PeerStatusInfo = match read_message(&mut stream).await {
            Ok(status) => status,
            Err(e) => {
                warn!("read status from {}: {}", peer, e);
                return;
            }
        };
        self.inner.auths.lock().outgoing.remove(&peer);

        let ours = self.status_info_for(&known);
        if let Err(e) = write_message(&mut stream, &ours).await {
            warn!("send status to {}: {}", peer, e);
        }
        let _ = stream.close().await;

        if let Err(e) = self.apply_status(peer, remote) {
            warn!("apply status from {}: {}", peer, e);
        }
    }

    fn status_info_for(&self, known: &KnownPeer) -> PeerStatusInfo {
        PeerStatusInfo {
            name: self.inner.config.node_name(),
            known_peer_info: KnownPeerInfo {
                alias: known.alias.clone(),
                ip_addr: known.ip_addr.clone(),
                domain_name: known.domain_name.clone(),
                allowed_using_as_exit_node: known.we_allow_using_as_exit_node,
                declined: false,
            },
        }
    }

    /// Merge the remote status into our record of the peer
    fn apply_status(&self, peer: PeerId, remote: PeerStatusInfo) -> AwlResult<()> {
        let key = peer.to_base58();
        let Some(current) = self.inner.config.get_peer(&peer) else {
            return Err(ConfigError::PeerUnknown(key).into());
        };

        let info = remote.known_peer_info;
        let changed = current.name != remote.name
            || current.allowed_using_as_exit_node != info.allowed_using_as_exit_node
            || current.declined != info.declined
            || current.confirmed == info.declined;

        if !changed {
            self.inner.config.update_peer_last_seen(&peer);
            return Ok(());
        }

        self.inner.config.update(|c| {
            let p = c
                .known_peers
                .get_mut(&key)
                .ok_or_else(|| ConfigError::PeerUnknown(key.clone()))?;
            p.name = remote.name;
            p.allowed_using_as_exit_node = info.allowed_using_as_exit_node;
            p.declined = info.declined;
            p.confirmed = !info.declined;
            p.last_seen = Some(Utc::now());
            let usable = p.allowed_using_as_exit_node;
            if !usable && c.socks5.using_peer_id == key {
                c.socks5.using_peer_id.clear();
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Send a friend request; returns whether the peer confirmed it
    pub async fn send_auth_request(&self, peer: PeerId, req: AuthPeer) -> AwlResult<bool> {
        self.inner.auths.lock().outgoing.insert(peer, req.clone());
        self.inner.peers.connect_peer(peer).await?;

        let mut stream = self.inner.peers.host().new_stream(peer, AUTH_PROTOCOL).await?;
        write_message(&mut stream, &req).await?;
        let resp: AuthPeerResponse = read_message(&mut stream).await?;
        let _ = stream.close().await;

        if resp.confirmed {
            self.inner.auths.lock().outgoing.remove(&peer);
            if let Some(known) = self.inner.config.get_peer(&peer) {
                self.exchange_new_status_info(peer, &known).await?;
            }
        }
        Ok(resp.confirmed)
    }

    /// Exchange status messages with `peer` and merge the reply
    pub async fn exchange_new_status_info(&self, peer: PeerId, known: &KnownPeer) -> AwlResult<()> {
        if self.inner.config.is_blocked(&peer) {
            return Err(AwlError::PeerBlocked(peer));
        }
        self.inner.auths.lock().ingoing.remove(&peer);
        let remote = self.status_round_trip(peer, self.status_info_for(known)).await?;
        self.apply_status(peer, remote)
    }

    async fn status_round_trip(&self, peer: PeerId, ours: PeerStatusInfo) -> AwlResult<PeerStatusInfo> {
        self.inner.peers.connect_peer(peer).await?;
        let mut stream = self.inner.peers.host().new_stream(peer, STATUS_PROTOCOL).await?;
        write_message(&mut stream, &ours).await?;
        let remote: PeerStatusInfo = read_message(&mut stream).await?;
        let _ = stream.close().await;
        Ok(remote)
    }

    /// Upsert `peer` as a confirmed known peer, allocating an IP if needed
    fn accept_peer(&self, peer: PeerId, name: &str, alias: Option<&str>) -> AwlResult<KnownPeer> {
        let key = peer.to_base58();
        let requested_alias = alias.map(str::trim).filter(|a| !a.is_empty());
        let accepted = self.inner.config.update(|c| {
            let existing = c.known_peers.get(&key).cloned();
            let ip = match existing.as_ref().and_then(KnownPeer::ipv4) {
                Some(ip) => ip,
                None => c.generate_next_ip_addr()?,
            };
            let alias = match (requested_alias, &existing) {
                (Some(a), _) => a.to_string(),
                (None, Some(p)) if !p.alias.is_empty() => p.alias.clone(),
                (None, _) => c.unique_alias(name, Some(key.as_str())),
            };
            let mut known = existing.unwrap_or_else(|| KnownPeer::new(peer, &alias, ip));
            known.domain_name = domain_name_from_alias(&alias);
            known.alias = alias;
            known.name = name.to_string();
            known.confirmed = true;
            known.declined = false;
            c.upsert_peer(known.clone())?;
            Ok(known)
        })?;
        Ok(accepted)
    }

    /// Record and send a friend request to `peer`
    pub fn send_friend_request(&self, peer: PeerId, alias: &str) -> AwlResult<()> {
        let key = peer.to_base58();
        let own = self.inner.peers.host().peer_id();
        if peer == own {
            return Err(AwlError::OwnPeerId);
        }
        if self.inner.config.get_peer(&peer).is_some_and(|p| p.confirmed) {
            return Err(AwlError::PeerAlreadyKnown(peer));
        }
        let alias = alias.trim().to_string();

        self.inner.config.update(|c| {
            c.blocked_peers.remove(&key);
            let existing = c.known_peers.get(&key).cloned();
            let ip = match existing.as_ref().and_then(KnownPeer::ipv4) {
                Some(ip) => ip,
                None => c.generate_next_ip_addr()?,
            };
            let alias = if alias.is_empty() {
                c.unique_alias(&alias, Some(key.as_str()))
            } else {
                alias.clone()
            };
            let mut known = existing.unwrap_or_else(|| KnownPeer::new(peer, &alias, ip));
            known.domain_name = domain_name_from_alias(&alias);
            known.alias = alias;
            known.confirmed = false;
            known.declined = false;
            c.upsert_peer(known)
        })?;

        let req = AuthPeer {
            name: self.inner.config.node_name(),
        };
        self.inner.auths.lock().outgoing.insert(peer, req.clone());
        info!("📤 friend request to {}", peer);

        let this = self.clone();
        tokio::spawn(async move {
            match this.send_auth_request(peer, req).await {
                Ok(confirmed) => debug!("auth request to {}: confirmed={}", peer, confirmed),
                Err(e) => debug!("auth request to {}: {}", peer, e),
            }
        });
        Ok(())
    }

    /// Accept or decline a pending request from `peer`
    pub async fn reply_friend_request(&self, peer: PeerId, alias: &str, decline: bool) -> AwlResult<()> {
        let req = self
            .inner
            .auths
            .lock()
            .ingoing
            .get(&peer)
            .cloned()
            .ok_or(AwlError::NoAuthRequest(peer))?;

        if decline {
            self.inner.auths.lock().ingoing.remove(&peer);
            let declined = PeerStatusInfo {
                name: self.inner.config.node_name(),
                known_peer_info: KnownPeerInfo {
                    declined: true,
                    ..KnownPeerInfo::default()
                },
            };
            if let Err(e) = self.status_round_trip(peer, declined).await {
                warn!("send decline to {}: {}", peer, e);
            }
            let key = peer.to_base58();
            self.inner.config.update(|c| {
                c.block_peer(&key, &req.name);
                Ok(())
            })?;
            info!("🙅 declined friend request from {}", peer);
            return Ok(());
        }

        let known = self.accept_peer(peer, &req.name, Some(alias))?;
        self.inner.auths.lock().ingoing.remove(&peer);
        info!("🤝 accepted friend request from {}", peer);
        if let Err(e) = self.exchange_new_status_info(peer, &known).await {
            warn!("status exchange with {}: {}", peer, e);
        }
        Ok(())
    }

    /// Pending friend requests, sorted by PeerID
    pub fn auth_requests(&self) -> Vec<(PeerId, AuthPeer)> {
        let mut requests: Vec<(PeerId, AuthPeer)> = self
            .inner
            .auths
            .lock()
            .ingoing
            .iter()
            .map(|(p, r)| (*p, r.clone()))
            .collect();
        requests.sort_by_key(|(p, _)| p.to_base58());
        requests
    }

    pub fn has_outgoing_auth(&self, peer: &PeerId) -> bool {
        self.inner.auths.lock().outgoing.contains_key(peer)
    }

    pub fn ingoing_count(&self) -> usize {
        self.inner.auths.lock().ingoing.len()
    }
}
