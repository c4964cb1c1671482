//! libp2p swarm actor and its handle
//!
//! The swarm lives in one task. [`Host`] sends it commands over an mpsc
//! channel and reads a snapshot the task keeps current; inbound and outbound
//! streams go through `libp2p_stream` and never touch the swarm task.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use awl_proto::DHT_PROTOCOL;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, DialError, NetworkBehaviour, SwarmEvent};
use libp2p::{
    autonat, dcutr, identify, kad, noise, ping, relay, tcp, yamux, Multiaddr, PeerId,
    StreamProtocol, Swarm, SwarmBuilder,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    peer_id_of, AwlStream, BandwidthCounter, ConnManager, ConnectionEvent, ConnectionInfo,
    Direction, HostError, MeteredStream, Reachability,
};

/// Kademlia bootstrap refresh period
const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const NEW_STREAM_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
const COMMAND_QUEUE_CAPACITY: usize = 64;
const CONNECTION_EVENTS_CAPACITY: usize = 256;

pub struct HostConfig {
    pub keypair: Keypair,
    pub listen_addresses: Vec<Multiaddr>,
    /// Multiaddresses ending in `/p2p/<peer id>`
    pub bootstrap_peers: Vec<Multiaddr>,
    pub user_agent: String,
}

#[derive(NetworkBehaviour)]
struct AwlBehaviour {
    relay_client: relay::client::Behaviour,
    dcutr: dcutr::Behaviour,
    identify: identify::Behaviour,
    kademlia: kad::Behaviour<kad::store::MemoryStore>,
    ping: ping::Behaviour,
    autonat: autonat::Behaviour,
    stream: libp2p_stream::Behaviour,
}

#[derive(Default)]
struct HostState {
    connections: HashMap<PeerId, HashMap<ConnectionId, ConnectionInfo>>,
    user_agents: HashMap<PeerId, String>,
    listen_addrs: Vec<Multiaddr>,
    observed_addrs: HashSet<Multiaddr>,
    reachability: Reachability,
}

type Reply<T> = oneshot::Sender<Result<T, HostError>>;

enum Command {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: Reply<()>,
    },
    FindPeer {
        peer: PeerId,
        reply: Reply<Vec<Multiaddr>>,
    },
    RoutingTable {
        reply: oneshot::Sender<Vec<(PeerId, Vec<Multiaddr>)>>,
    },
    Trim {
        reply: oneshot::Sender<usize>,
    },
}

struct HostInner {
    peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    control: Mutex<libp2p_stream::Control>,
    state: Arc<RwLock<HostState>>,
    conn_manager: Arc<Mutex<ConnManager>>,
    bandwidth: Arc<BandwidthCounter>,
    events: broadcast::Sender<ConnectionEvent>,
    bootstrap_peers: Vec<(PeerId, Multiaddr)>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the running overlay host
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Build the swarm, bind listeners, seed the DHT and start the event loop
    pub fn start(config: HostConfig, cancel: &CancellationToken) -> Result<Self, HostError> {
        let HostConfig {
            keypair,
            listen_addresses,
            bootstrap_peers,
            user_agent,
        } = config;

        let stream_behaviour = libp2p_stream::Behaviour::new();
        let control = stream_behaviour.new_control();

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(build_err)?
            .with_quic()
            .with_dns()
            .map_err(build_err)?
            .with_relay_client(noise::Config::new, yamux::Config::default)
            .map_err(build_err)?
            .with_behaviour(|keypair, relay_client| {
                let peer_id = keypair.public().to_peer_id();
                let identify_config = identify::Config::new("/awl/0.1.0".to_string(), keypair.public())
                    .with_agent_version(user_agent.clone());
                let kad_config = kad::Config::new(DHT_PROTOCOL);
                let mut kademlia = kad::Behaviour::with_config(
                    peer_id,
                    kad::store::MemoryStore::new(peer_id),
                    kad_config,
                );
                kademlia.set_mode(Some(kad::Mode::Server));

                AwlBehaviour {
                    relay_client,
                    dcutr: dcutr::Behaviour::new(peer_id),
                    identify: identify::Behaviour::new(identify_config),
                    kademlia,
                    ping: ping::Behaviour::default(),
                    autonat: autonat::Behaviour::new(peer_id, autonat::Config::default()),
                    stream: stream_behaviour,
                }
            })
            .map_err(build_err)?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        let peer_id = *swarm.local_peer_id();
        info!("📍 Local Peer ID: {}", peer_id);

        for addr in &listen_addresses {
            if let Err(e) = swarm.listen_on(addr.clone()) {
                warn!("⚠️ Failed to listen on {}: {}", addr, e);
            }
        }

        let bootstrap_peers: Vec<(PeerId, Multiaddr)> = bootstrap_peers
            .into_iter()
            .filter_map(|addr| match peer_id_of(&addr) {
                Some(p) if p != peer_id => Some((p, addr)),
                Some(_) => None,
                None => {
                    warn!("⚠️ Bootstrap address {} has no /p2p/ component", addr);
                    None
                }
            })
            .collect();
        for (peer, addr) in &bootstrap_peers {
            let behaviour = swarm.behaviour_mut();
            behaviour.kademlia.add_address(peer, addr.clone());
            behaviour.autonat.add_server(*peer, Some(addr.clone()));
            if let Err(e) = swarm.dial(addr.clone()) {
                debug!("bootstrap dial {} failed: {}", addr, e);
            }
        }

        let cancel = cancel.child_token();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (events_tx, _) = broadcast::channel(CONNECTION_EVENTS_CAPACITY);
        let state = Arc::new(RwLock::new(HostState::default()));
        let conn_manager = Arc::new(Mutex::new(ConnManager::default()));
        let bandwidth = Arc::new(BandwidthCounter::new());

        let driver = HostDriver {
            swarm,
            commands: commands_rx,
            state: state.clone(),
            conn_manager: conn_manager.clone(),
            events: events_tx.clone(),
            bootstrap_peers: bootstrap_peers.clone(),
            peer_addrs: HashMap::new(),
            pending_dials: HashMap::new(),
            pending_lookups: HashMap::new(),
            relay_listening: false,
        };
        let driver_task = tokio::spawn(driver.run(cancel.clone()));
        let sampler_task = tokio::spawn(sample_bandwidth(bandwidth.clone(), cancel.clone()));

        Ok(Self {
            inner: Arc::new(HostInner {
                peer_id,
                commands: commands_tx,
                control: Mutex::new(control),
                state,
                conn_manager,
                bandwidth,
                events: events_tx,
                bootstrap_peers,
                cancel,
                tasks: Mutex::new(vec![driver_task, sampler_task]),
            }),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// Register `handler` for every inbound stream of `protocol`
    pub fn set_stream_handler<F, Fut>(
        &self,
        protocol: StreamProtocol,
        handler: F,
    ) -> Result<(), HostError>
    where
        F: Fn(PeerId, AwlStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut incoming = self
            .inner
            .control
            .lock()
            .accept(protocol.clone())
            .map_err(|_| HostError::HandlerExists(protocol.to_string()))?;
        let cancel = self.inner.cancel.clone();
        let bandwidth = self.inner.bandwidth.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = incoming.next() => {
                        let Some((peer, stream)) = next else { break };
                        trace!("inbound {} stream from {}", protocol, peer);
                        let stream = MeteredStream::new(stream, peer, protocol.clone(), bandwidth.clone());
                        tokio::spawn(handler(peer, stream));
                    }
                }
            }
            debug!("stream handler for {} stopped", protocol);
        });
        self.inner.tasks.lock().push(task);
        Ok(())
    }

    /// Open an outbound stream, dialling the peer if needed
    pub async fn new_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<AwlStream, HostError> {
        if self.inner.cancel.is_cancelled() {
            return Err(HostError::Shutdown);
        }
        let mut control = self.inner.control.lock().clone();
        let stream = tokio::time::timeout(
            NEW_STREAM_TIMEOUT,
            control.open_stream(peer, protocol.clone()),
        )
        .await
        .map_err(|_| HostError::unreachable(peer, "timed out opening stream"))?
        .map_err(|e| HostError::unreachable(peer, e))?;
        Ok(MeteredStream::new(
            stream,
            peer,
            protocol,
            self.inner.bandwidth.clone(),
        ))
    }

    /// Dial `peer`, resolving once a connection is up
    pub async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), HostError> {
        if self.is_connected(&peer) {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        self.send(Command::Dial { peer, addrs, reply }).await?;
        tokio::time::timeout(CONNECT_TIMEOUT, rx)
            .await
            .map_err(|_| HostError::unreachable(peer, "dial timed out"))?
            .map_err(|_| HostError::Shutdown)?
    }

    /// Look `peer` up in the DHT and return its known addresses
    pub async fn find_peer(&self, peer: PeerId) -> Result<Vec<Multiaddr>, HostError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::FindPeer { peer, reply }).await?;
        tokio::time::timeout(CONNECT_TIMEOUT, rx)
            .await
            .map_err(|_| HostError::unreachable(peer, "dht lookup timed out"))?
            .map_err(|_| HostError::Shutdown)?
    }

    /// Prune unprotected connections down to the low watermark
    pub async fn trim_open_connections(&self) -> Result<usize, HostError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Trim { reply }).await?;
        rx.await.map_err(|_| HostError::Shutdown)
    }

    pub async fn routing_table(&self) -> Result<Vec<(PeerId, Vec<Multiaddr>)>, HostError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RoutingTable { reply }).await?;
        rx.await.map_err(|_| HostError::Shutdown)
    }

    async fn send(&self, cmd: Command) -> Result<(), HostError> {
        self.inner
            .commands
            .send(cmd)
            .await
            .map_err(|_| HostError::Shutdown)
    }

    pub fn protect(&self, peer: PeerId, tag: &str) {
        self.inner.conn_manager.lock().protect(peer, tag);
    }

    pub fn unprotect(&self, peer: &PeerId, tag: &str) -> bool {
        self.inner.conn_manager.lock().unprotect(peer, tag)
    }

    pub fn is_protected(&self, peer: &PeerId) -> bool {
        self.inner.conn_manager.lock().is_protected(peer)
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner
            .state
            .read()
            .connections
            .get(peer)
            .is_some_and(|c| !c.is_empty())
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .state
            .read()
            .connections
            .iter()
            .filter(|(_, c)| !c.is_empty())
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn peer_user_agent(&self, peer: &PeerId) -> Option<String> {
        self.inner.state.read().user_agents.get(peer).cloned()
    }

    pub fn connections_to(&self, peer: &PeerId) -> Vec<ConnectionInfo> {
        let mut conns: Vec<ConnectionInfo> = self
            .inner
            .state
            .read()
            .connections
            .get(peer)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        conns.sort_by_key(|c| c.opened_at);
        conns
    }

    pub fn connection_count(&self) -> usize {
        self.inner.conn_manager.lock().connection_count()
    }

    pub fn open_stream_count(&self) -> usize {
        self.inner.bandwidth.open_streams()
    }

    pub fn bandwidth(&self) -> &BandwidthCounter {
        &self.inner.bandwidth
    }

    pub fn reachability(&self) -> Reachability {
        self.inner.state.read().reachability
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.state.read().listen_addrs.clone()
    }

    pub fn observed_addrs(&self) -> Vec<Multiaddr> {
        self.inner.state.read().observed_addrs.iter().cloned().collect()
    }

    pub fn bootstrap_peers(&self) -> &[(PeerId, Multiaddr)] {
        &self.inner.bootstrap_peers
    }

    pub fn last_trim(&self) -> Option<DateTime<Utc>> {
        self.inner.conn_manager.lock().last_trim()
    }

    pub fn subscribe_connections(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Stop the event loop and every stream handler
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("🛑 Host {} closed", self.inner.peer_id);
    }
}

fn build_err(e: impl std::fmt::Display) -> HostError {
    HostError::Build(e.to_string())
}

async fn sample_bandwidth(counter: Arc<BandwidthCounter>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                counter.sample(now - last);
                last = now;
            }
        }
    }
}

struct HostDriver {
    swarm: Swarm<AwlBehaviour>,
    commands: mpsc::Receiver<Command>,
    state: Arc<RwLock<HostState>>,
    conn_manager: Arc<Mutex<ConnManager>>,
    events: broadcast::Sender<ConnectionEvent>,
    bootstrap_peers: Vec<(PeerId, Multiaddr)>,
    /// Listen addresses learnt through identify
    peer_addrs: HashMap<PeerId, HashSet<Multiaddr>>,
    pending_dials: HashMap<PeerId, Vec<Reply<()>>>,
    pending_lookups: HashMap<kad::QueryId, (PeerId, Vec<Reply<Vec<Multiaddr>>>)>,
    relay_listening: bool,
}

impl HostDriver {
    async fn run(mut self, cancel: CancellationToken) {
        info!("🔄 Starting host event loop...");
        let mut bootstrap_tick = tokio::time::interval(BOOTSTRAP_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                _ = bootstrap_tick.tick() => self.bootstrap(),
            }
        }

        for (peer, replies) in self.pending_dials.drain() {
            for reply in replies {
                let _ = reply.send(Err(HostError::unreachable(peer, "host is shut down")));
            }
        }
        let peers: Vec<PeerId> = self.swarm.connected_peers().copied().collect();
        for peer in peers {
            let _ = self.swarm.disconnect_peer_id(peer);
        }
        debug!("host event loop stopped");
    }

    fn bootstrap(&mut self) {
        if self.bootstrap_peers.is_empty() && self.state.read().connections.is_empty() {
            return;
        }
        if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
            warn!("⚠️ Failed to bootstrap Kademlia: {}", e);
        } else {
            debug!("🚀 Kademlia bootstrap started");
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Dial { peer, addrs, reply } => {
                if self.swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let opts = DialOpts::peer_id(peer)
                    .addresses(addrs)
                    .extend_addresses_through_behaviour()
                    .condition(PeerCondition::DisconnectedAndNotDialing)
                    .build();
                match self.swarm.dial(opts) {
                    Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                        self.pending_dials.entry(peer).or_default().push(reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(HostError::unreachable(peer, e)));
                    }
                }
            }
            Command::FindPeer { peer, reply } => {
                if let Some((_, replies)) = self
                    .pending_lookups
                    .values_mut()
                    .find(|(target, _)| *target == peer)
                {
                    replies.push(reply);
                    return;
                }
                let query = self.swarm.behaviour_mut().kademlia.get_closest_peers(peer);
                self.pending_lookups.insert(query, (peer, vec![reply]));
            }
            Command::RoutingTable { reply } => {
                let _ = reply.send(self.routing_entries());
            }
            Command::Trim { reply } => {
                let _ = reply.send(self.trim());
            }
        }
    }

    fn routing_entries(&mut self) -> Vec<(PeerId, Vec<Multiaddr>)> {
        let mut entries = Vec::new();
        for bucket in self.swarm.behaviour_mut().kademlia.kbuckets() {
            for entry in bucket.iter() {
                entries.push((
                    *entry.node.key.preimage(),
                    entry.node.value.iter().cloned().collect(),
                ));
            }
        }
        entries
    }

    fn known_addresses(&mut self, peer: &PeerId) -> Vec<Multiaddr> {
        let mut addrs: Vec<Multiaddr> = self
            .routing_entries()
            .into_iter()
            .filter(|(p, _)| p == peer)
            .flat_map(|(_, a)| a)
            .collect();
        if let Some(seen) = self.peer_addrs.get(peer) {
            addrs.extend(seen.iter().cloned());
        }
        addrs.sort();
        addrs.dedup();
        addrs
    }

    fn trim(&mut self) -> usize {
        let peers = self.conn_manager.lock().select_trim(Instant::now());
        for peer in &peers {
            debug!("✂️ trimming connections to {}", peer);
            let _ = self.swarm.disconnect_peer_id(*peer);
        }
        self.conn_manager.lock().mark_trimmed();
        peers.len()
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<AwlBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("✅ Listening on: {}", address);
                self.state.write().listen_addrs.push(address);
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.state.write().listen_addrs.retain(|a| a != &address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                let direction = if endpoint.is_dialer() {
                    Direction::Outbound
                } else {
                    Direction::Inbound
                };
                let info = ConnectionInfo::new(endpoint.get_remote_address(), direction);
                debug!("🤝 Connected to peer: {} [{}]", peer_id, info.multiaddr);
                self.state
                    .write()
                    .connections
                    .entry(peer_id)
                    .or_default()
                    .insert(connection_id, info);
                let over_limit = {
                    let mut cm = self.conn_manager.lock();
                    cm.connection_opened(connection_id, peer_id, Instant::now());
                    cm.over_high_watermark()
                };

                for reply in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = reply.send(Ok(()));
                }
                if num_established.get() == 1 {
                    let _ = self.events.send(ConnectionEvent::Connected(peer_id));
                }
                if over_limit {
                    self.trim();
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                num_established,
                cause,
                ..
            } => {
                debug!("🔌 Disconnected from peer: {} ({:?})", peer_id, cause);
                {
                    let mut state = self.state.write();
                    if let Some(conns) = state.connections.get_mut(&peer_id) {
                        conns.remove(&connection_id);
                        if conns.is_empty() {
                            state.connections.remove(&peer_id);
                        }
                    }
                }
                self.conn_manager.lock().connection_closed(&connection_id);
                if num_established == 0 {
                    let _ = self.events.send(ConnectionEvent::Disconnected(peer_id));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                debug!("dial {} failed: {}", peer_id, error);
                if !self.swarm.is_connected(&peer_id) {
                    let reason = error.to_string();
                    for reply in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                        let _ = reply.send(Err(HostError::unreachable(peer_id, &reason)));
                    }
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: AwlBehaviourEvent) {
        match event {
            AwlBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                let serves_dht = info.protocols.iter().any(|p| *p == DHT_PROTOCOL);
                for addr in &info.listen_addrs {
                    if serves_dht {
                        self.swarm
                            .behaviour_mut()
                            .kademlia
                            .add_address(&peer_id, addr.clone());
                    }
                }
                self.peer_addrs
                    .entry(peer_id)
                    .or_default()
                    .extend(info.listen_addrs.iter().cloned());
                let mut state = self.state.write();
                state.user_agents.insert(peer_id, info.agent_version);
                state.observed_addrs.insert(info.observed_addr);
            }
            AwlBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            }) => match result {
                kad::QueryResult::GetClosestPeers(res) if step.last => {
                    self.finish_lookup(id, res);
                }
                kad::QueryResult::Bootstrap(Err(e)) => {
                    warn!("⚠️ Kademlia bootstrap failed: {:?}", e);
                }
                _ => {}
            },
            AwlBehaviourEvent::Kademlia(kad::Event::RoutingUpdated {
                peer, is_new_peer, ..
            }) => {
                if is_new_peer {
                    trace!("🕸️ routing table added {}", peer);
                }
            }
            AwlBehaviourEvent::Autonat(autonat::Event::StatusChanged { old, new }) => {
                info!("AutoNAT status changed: {:?} -> {:?}", old, new);
                let reachability = match new {
                    autonat::NatStatus::Public(_) => Reachability::Public,
                    autonat::NatStatus::Private => Reachability::Private,
                    autonat::NatStatus::Unknown => Reachability::Unknown,
                };
                self.state.write().reachability = reachability;
                if reachability == Reachability::Private {
                    self.listen_via_relays();
                }
            }
            AwlBehaviourEvent::Dcutr(event) => {
                info!("🎯 DCUtR event: {:?}", event);
            }
            AwlBehaviourEvent::RelayClient(event) => {
                debug!("📡 Relay event: {:?}", event);
            }
            AwlBehaviourEvent::Ping(event) => {
                trace!("🏓 Ping event: {:?}", event);
            }
            _ => {}
        }
    }

    fn finish_lookup(
        &mut self,
        id: kad::QueryId,
        result: Result<kad::GetClosestPeersOk, kad::GetClosestPeersError>,
    ) {
        let Some((target, replies)) = self.pending_lookups.remove(&id) else {
            return;
        };
        let mut addrs: Vec<Multiaddr> = match result {
            Ok(ok) => ok
                .peers
                .into_iter()
                .filter(|p| p.peer_id == target)
                .flat_map(|p| p.addrs)
                .collect(),
            Err(e) => {
                debug!("dht lookup for {} ended with {:?}", target, e);
                Vec::new()
            }
        };
        addrs.extend(self.known_addresses(&target));
        addrs.sort();
        addrs.dedup();

        for reply in replies {
            let res = if addrs.is_empty() {
                Err(HostError::unreachable(target, "not found in dht"))
            } else {
                Ok(addrs.clone())
            };
            let _ = reply.send(res);
        }
    }

    fn listen_via_relays(&mut self) {
        if self.relay_listening {
            return;
        }
        self.relay_listening = true;
        for (peer, addr) in &self.bootstrap_peers {
            let circuit = addr.clone().with(Protocol::P2pCircuit);
            match self.swarm.listen_on(circuit.clone()) {
                Ok(_) => info!("📡 Listening via relay {}", peer),
                Err(e) => warn!("⚠️ Failed to listen on {}: {}", circuit, e),
            }
        }
    }
}
