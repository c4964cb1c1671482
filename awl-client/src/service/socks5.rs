//! SOCKS5 exit-node proxying over the overlay
//!
//! Server role: serve SOCKS5 on inbound `/socks5` streams from peers we
//! allow as clients. Client role: a local TCP listener whose connections
//! are spliced onto a `/socks5` stream to the selected exit peer.

use std::net::SocketAddr;
use std::sync::Arc;

use awl_proto::SOCKS5_PROTOCOL;
use libp2p::PeerId;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ConfigHandle};
use crate::error::{AwlError, AwlResult};
use crate::p2p::{AwlStream, HostError};
use crate::service::p2p::PeerService;
use crate::socks5::{self, ReplyCode, RuleSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableProxy {
    #[serde(rename = "peerID")]
    pub peer_id: String,
    pub peer_name: String,
}

struct Inner {
    peers: PeerService,
    config: ConfigHandle,
    rules: RuleSet,
    cancel: CancellationToken,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

#[derive(Clone)]
pub struct Socks5Service {
    inner: Arc<Inner>,
}

impl Socks5Service {
    /// `rules` applies to targets requested by peers we serve
    pub fn new(peers: PeerService, config: ConfigHandle, rules: RuleSet, cancel: &CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                peers,
                config,
                rules,
                cancel: cancel.clone(),
                local_addr: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn register_handler(&self) -> Result<(), HostError> {
        let this = self.clone();
        self.inner
            .peers
            .host()
            .set_stream_handler(SOCKS5_PROTOCOL, move |peer, stream| {
                this.clone().handle_proxy_stream(peer, stream)
            })
    }

    /// Bind the local listener when enabled; returns the accept loop
    pub async fn start(&self) -> std::io::Result<Option<JoinHandle<()>>> {
        let (enabled, addr) = self
            .inner
            .config
            .read(|c| (c.socks5.listener_enabled, c.socks5.listen_address.clone()));
        if !enabled {
            info!("socks5 listener disabled");
            return Ok(None);
        }
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(local);
        info!("🧦 socks5 listening on {}", local);
        Ok(Some(tokio::spawn(self.clone().accept_loop(listener))))
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                res = listener.accept() => res,
            };
            match accepted {
                Ok((conn, remote)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.proxy_local_connection(conn).await {
                            debug!("socks5 client {}: {}", remote, e);
                        }
                    });
                }
                Err(e) => warn!("socks5 accept: {}", e),
            }
        }
        debug!("socks5 listener stopped");
    }

    /// Exit peer currently usable by the local listener
    fn usable_exit_peer(&self) -> Option<PeerId> {
        self.inner.config.read(|c| {
            let using = &c.socks5.using_peer_id;
            if using.is_empty() {
                return None;
            }
            c.get_peer(using)
                .filter(|p| p.allowed_using_as_exit_node)
                .and_then(|p| p.peer_id())
        })
    }

    async fn proxy_local_connection(&self, mut conn: TcpStream) -> AwlResult<()> {
        let Some(peer) = self.usable_exit_peer() else {
            socks5::refuse(&mut conn, ReplyCode::ServerFailure).await?;
            return Err(socks5::Socks5Error::ProxyDenied(ReplyCode::ServerFailure).into());
        };

        let opened = async {
            self.inner.peers.connect_peer(peer).await?;
            self.inner.peers.host().new_stream(peer, SOCKS5_PROTOCOL).await
        }
        .await;
        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                let _ = socks5::refuse(&mut conn, ReplyCode::ServerFailure).await;
                return Err(e.into());
            }
        };

        let mut remote = stream.compat();
        let (sent, received) = tokio::io::copy_bidirectional(&mut conn, &mut remote)
            .await
            .map_err(HostError::from)?;
        debug!("socks5 via {}: {} bytes out, {} bytes in", peer, sent, received);
        Ok(())
    }

    async fn handle_proxy_stream(self, peer: PeerId, stream: AwlStream) {
        let Some(known) = self.inner.config.get_peer(&peer) else {
            info!("socks5 stream from unknown peer {}", peer);
            return;
        };
        let mut stream = stream.compat();

        let proxying = self.inner.config.read(|c| c.socks5.proxying_enabled);
        if !proxying {
            if let Err(e) = socks5::refuse(&mut stream, ReplyCode::ServerFailure).await {
                debug!("socks5 refuse {}: {}", peer, e);
            }
            return;
        }

        let rules = if known.we_allow_using_as_exit_node {
            self.inner.rules
        } else {
            RuleSet::DenyAll
        };
        if let Err(e) = socks5::serve(stream, rules).await {
            debug!("socks5 session for {}: {}", peer, e);
        }
    }

    /// Connected peers that allow us to use them as exit, sorted by name
    pub fn list_available_proxies(&self) -> Vec<AvailableProxy> {
        let candidates = self.inner.config.read(|c| {
            c.known_peers
                .values()
                .filter(|p| p.allowed_using_as_exit_node)
                .filter_map(|p| Some((p.peer_id()?, p.display_name().to_string())))
                .collect::<Vec<_>>()
        });
        let mut proxies: Vec<AvailableProxy> = candidates
            .into_iter()
            .filter(|(id, _)| self.inner.peers.is_connected(id))
            .map(|(id, name)| AvailableProxy {
                peer_id: id.to_base58(),
                peer_name: name,
            })
            .collect();
        proxies.sort_by(|a, b| a.peer_name.cmp(&b.peer_name).then(a.peer_id.cmp(&b.peer_id)));
        proxies
    }

    /// Select the exit peer for the local listener; empty clears it
    pub fn set_proxy(&self, peer_id: &str) -> AwlResult<()> {
        let peer_id = peer_id.trim().to_string();
        if !peer_id.is_empty() {
            peer_id
                .parse::<PeerId>()
                .map_err(|_| AwlError::InvalidPeerId(peer_id.clone()))?;
        }
        self.inner.config.update(|c| {
            if !peer_id.is_empty() {
                match c.get_peer(&peer_id) {
                    None => return Err(ConfigError::PeerUnknown(peer_id.clone())),
                    Some(p) if !p.allowed_using_as_exit_node => {
                        return Err(ConfigError::Invalid(format!(
                            "peer {} does not allow using it as exit node",
                            peer_id
                        )))
                    }
                    Some(_) => {}
                }
            }
            c.socks5.using_peer_id = peer_id.clone();
            Ok(())
        })?;
        Ok(())
    }
}
