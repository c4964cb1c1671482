//! VPN data plane: TUN packets to `/tunnel` streams and back
//!
//! Each known peer gets a [`VpnPeer`] with an inbound and an outbound queue.
//! The TUN reader feeds a small bounded channel; the dispatcher routes each
//! packet by destination IPv4 onto the peer's outbound queue and drops it
//! when that queue is full. One IP packet travels per overlay stream.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use awl_proto::TUNNEL_PROTOCOL;
use futures::AsyncWriteExt;
use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConfigHandle, KnownPeer};
use crate::event_bus::Event;
use crate::p2p::{AwlStream, HostError};
use crate::packet::{Packet, PacketPool};
use crate::service::p2p::PeerService;
use crate::tun::TunDevice;

/// Capacity of each peer's inbound and outbound queue
pub const PEER_CHANNEL_CAPACITY: usize = 200;
/// Capacity of the TUN reader to dispatcher channel
pub const TUN_OUTBOUND_CAPACITY: usize = 50;
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(1);

pub struct VpnPeer {
    peer_id: PeerId,
    local_ip: AtomicU32,
    inbound: mpsc::Sender<Box<Packet>>,
    outbound: mpsc::Sender<Box<Packet>>,
    cancel: CancellationToken,
    dropped: AtomicU64,
    last_drop_warn: Mutex<Option<Instant>>,
}

#[derive(Debug, Clone, Copy)]
enum QueueDirection {
    Inbound,
    Outbound,
}

impl QueueDirection {
    fn as_str(self) -> &'static str {
        match self {
            QueueDirection::Inbound => "inbound",
            QueueDirection::Outbound => "outbound",
        }
    }
}

struct PeerQueues {
    inbound: mpsc::Receiver<Box<Packet>>,
    outbound: mpsc::Receiver<Box<Packet>>,
}

impl VpnPeer {
    fn new(peer_id: PeerId, ip: Ipv4Addr, cancel: CancellationToken) -> (Arc<Self>, PeerQueues) {
        let (inbound_tx, inbound) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        let (outbound_tx, outbound) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        let peer = Arc::new(Self {
            peer_id,
            local_ip: AtomicU32::new(ip.into()),
            inbound: inbound_tx,
            outbound: outbound_tx,
            cancel,
            dropped: AtomicU64::new(0),
            last_drop_warn: Mutex::new(None),
        });
        (peer, PeerQueues { inbound, outbound })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.local_ip.load(Ordering::Relaxed))
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue `packet` without waiting; a full or closed queue hands it
    /// back to `pool`, and only a full one counts as a drop
    fn offer(&self, direction: QueueDirection, packet: Box<Packet>, pool: &PacketPool) -> bool {
        let queue = match direction {
            QueueDirection::Inbound => &self.inbound,
            QueueDirection::Outbound => &self.outbound,
        };
        match queue.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(p)) => {
                self.record_drop(direction.as_str());
                pool.put_temp_packet(p);
                false
            }
            Err(TrySendError::Closed(p)) => {
                pool.put_temp_packet(p);
                false
            }
        }
    }

    /// Count a back-pressure drop, warning at most once per second
    fn record_drop(&self, direction: &str) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        let mut last = self.last_drop_warn.lock();
        let now = Instant::now();
        if last.map_or(true, |t| now.duration_since(t) >= DROP_WARN_INTERVAL) {
            *last = Some(now);
            warn!(
                "⚠️ {} queue for {} is full, dropping packets ({} dropped so far)",
                direction, self.peer_id, total
            );
        }
    }
}

/// Peers indexed by PeerID and by VPN address
#[derive(Default)]
struct PeerTable {
    by_id: HashMap<PeerId, Arc<VpnPeer>>,
    by_ip: HashMap<Ipv4Addr, Arc<VpnPeer>>,
}

impl PeerTable {
    /// Bring the table in line with `wanted`; returns the new peers with
    /// their queues and the removed peers
    fn sync(
        &mut self,
        wanted: &[(PeerId, Ipv4Addr)],
        parent: &CancellationToken,
    ) -> (Vec<(Arc<VpnPeer>, PeerQueues)>, Vec<Arc<VpnPeer>>) {
        let wanted_ids: HashMap<PeerId, Ipv4Addr> = wanted.iter().copied().collect();

        let stale: Vec<PeerId> = self
            .by_id
            .keys()
            .filter(|id| !wanted_ids.contains_key(id))
            .copied()
            .collect();
        let removed: Vec<Arc<VpnPeer>> = stale
            .iter()
            .filter_map(|id| self.by_id.remove(id))
            .collect();

        let mut added = Vec::new();
        for (peer_id, ip) in wanted {
            match self.by_id.get(peer_id) {
                Some(existing) => existing.local_ip.store((*ip).into(), Ordering::Relaxed),
                None => {
                    let (peer, queues) = VpnPeer::new(*peer_id, *ip, parent.child_token());
                    self.by_id.insert(*peer_id, peer.clone());
                    added.push((peer, queues));
                }
            }
        }

        self.by_ip = self
            .by_id
            .values()
            .map(|peer| (peer.local_ip(), peer.clone()))
            .collect();
        (added, removed)
    }

    fn by_ip(&self, ip: &Ipv4Addr) -> Option<Arc<VpnPeer>> {
        self.by_ip.get(ip).cloned()
    }

    fn by_id(&self, peer: &PeerId) -> Option<Arc<VpnPeer>> {
        self.by_id.get(peer).cloned()
    }
}

/// Rewrite a received IPv4 packet so the local stack sees it as coming from
/// `src` and addressed to `dst`; IPv6 and unparseable packets are refused
fn prepare_inbound(packet: &mut Packet, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
    if !packet.parse() || packet.is_ipv6() {
        return false;
    }
    packet.translate_ipv4_addrs(src, dst)
}

struct Inner {
    peers_svc: PeerService,
    config: ConfigHandle,
    tun: Arc<TunDevice>,
    pool: PacketPool,
    table: RwLock<PeerTable>,
    node_ip: AtomicU32,
    parallel_streams: usize,
    cancel: CancellationToken,
    unrouted: AtomicU64,
}

#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

impl Tunnel {
    pub fn new(
        peers_svc: PeerService,
        config: ConfigHandle,
        tun: Arc<TunDevice>,
        pool: PacketPool,
        cancel: &CancellationToken,
    ) -> Self {
        let (node_ip, parallel_streams) = config.read(|c| {
            (
                c.local_ip(),
                c.p2p_node.parallel_sending_streams_count.max(1),
            )
        });
        Self {
            inner: Arc::new(Inner {
                peers_svc,
                config,
                tun,
                pool,
                table: RwLock::new(PeerTable::default()),
                node_ip: AtomicU32::new(node_ip.into()),
                parallel_streams,
                cancel: cancel.clone(),
                unrouted: AtomicU64::new(0),
            }),
        }
    }

    pub fn register_handler(&self) -> Result<(), HostError> {
        let this = self.clone();
        self.inner
            .peers_svc
            .host()
            .set_stream_handler(TUNNEL_PROTOCOL, move |peer, stream| {
                this.clone().handle_tunnel_stream(peer, stream)
            })
    }

    /// Register known peers and start the TUN reader, the dispatcher and
    /// the known-peer watcher
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.refresh_peers_list();

        let (tx, rx) = mpsc::channel(TUN_OUTBOUND_CAPACITY);
        let reader = tokio::spawn(self.clone().read_tun_packets(tx));
        let dispatcher = tokio::spawn(self.clone().dispatch_outbound(rx));

        let this = self.clone();
        let watcher = self
            .inner
            .config
            .events()
            .subscribe_with_callback(self.inner.cancel.clone(), move |ev| {
                if ev == Event::KnownPeerChanged {
                    this.refresh_peers_list();
                }
            });
        vec![reader, dispatcher, watcher]
    }

    /// Sync the peer table with the known peers
    pub fn refresh_peers_list(&self) {
        let (node_ip, wanted) = self.inner.config.read(|c| {
            let wanted: Vec<(PeerId, Ipv4Addr)> = c
                .known_peers
                .values()
                .filter_map(|p: &KnownPeer| Some((p.peer_id()?, p.ipv4()?)))
                .collect();
            (c.local_ip(), wanted)
        });
        self.inner.node_ip.store(node_ip.into(), Ordering::Relaxed);

        let (added, removed) = self.inner.table.write().sync(&wanted, &self.inner.cancel);

        for peer in removed {
            info!("🔌 vpn peer {} removed", peer.peer_id);
            peer.cancel.cancel();
        }
        for (peer, queues) in added {
            info!("🔗 vpn peer {} at {}", peer.peer_id, peer.local_ip());
            self.spawn_peer_workers(peer, queues);
        }
    }

    fn spawn_peer_workers(&self, peer: Arc<VpnPeer>, queues: PeerQueues) {
        tokio::spawn(self.clone().inbound_worker(peer.clone(), queues.inbound));
        let outbound = Arc::new(tokio::sync::Mutex::new(queues.outbound));
        for _ in 0..self.inner.parallel_streams {
            tokio::spawn(self.clone().outbound_worker(peer.clone(), outbound.clone()));
        }
    }

    pub fn peer_count(&self) -> usize {
        self.inner.table.read().by_id.len()
    }

    pub fn peer_ip(&self, peer: &PeerId) -> Option<Ipv4Addr> {
        self.inner.table.read().by_id(peer).map(|p| p.local_ip())
    }

    /// Packets dropped on full peer queues
    pub fn dropped_packets(&self) -> u64 {
        self.inner
            .table
            .read()
            .by_id
            .values()
            .map(|p| p.dropped())
            .sum()
    }

    /// Packets from the TUN with no matching peer
    pub fn unrouted_packets(&self) -> u64 {
        self.inner.unrouted.load(Ordering::Relaxed)
    }

    async fn read_tun_packets(self, tx: mpsc::Sender<Box<Packet>>) {
        let inner = &self.inner;
        loop {
            let mut packet = inner.pool.get_temp_packet();
            let res = tokio::select! {
                _ = inner.cancel.cancelled() => {
                    inner.pool.put_temp_packet(packet);
                    break;
                }
                res = inner.tun.recv(packet.content_mut()) => res,
            };
            match res {
                Ok(0) => inner.pool.put_temp_packet(packet),
                Ok(n) => {
                    packet.set_len(n);
                    if let Err(e) = tx.send(packet).await {
                        inner.pool.put_temp_packet(e.0);
                        break;
                    }
                }
                Err(e) => {
                    inner.pool.put_temp_packet(packet);
                    error!("❌ reading from TUN {} failed: {}", inner.tun.name(), e);
                    inner.cancel.cancel();
                    break;
                }
            }
        }
        debug!("TUN reader stopped");
    }

    async fn dispatch_outbound(self, mut rx: mpsc::Receiver<Box<Packet>>) {
        let inner = &self.inner;
        loop {
            let mut packet = tokio::select! {
                _ = inner.cancel.cancelled() => break,
                p = rx.recv() => match p {
                    Some(p) => p,
                    None => break,
                },
            };
            let peer = if packet.parse() {
                packet
                    .dst_ipv4()
                    .and_then(|dst| inner.table.read().by_ip(&dst))
            } else {
                None
            };
            let Some(peer) = peer else {
                inner.unrouted.fetch_add(1, Ordering::Relaxed);
                inner.pool.put_temp_packet(packet);
                continue;
            };
            peer.offer(QueueDirection::Outbound, packet, &inner.pool);
        }
        rx.close();
        while let Ok(p) = rx.try_recv() {
            inner.pool.put_temp_packet(p);
        }
        debug!("outbound dispatcher stopped");
    }

    async fn outbound_worker(
        self,
        peer: Arc<VpnPeer>,
        queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Box<Packet>>>>,
    ) {
        loop {
            let next = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    _ = peer.cancel.cancelled() => None,
                    p = rx.recv() => p,
                }
            };
            let Some(packet) = next else { break };
            if let Err(e) = self.send_packet(peer.peer_id, &packet).await {
                debug!("send packet to {}: {}", peer.peer_id, e);
            }
            self.inner.pool.put_temp_packet(packet);
        }

        if let Ok(mut rx) = queue.try_lock() {
            rx.close();
            while let Ok(p) = rx.try_recv() {
                self.inner.pool.put_temp_packet(p);
            }
        }
    }

    /// Open a `/tunnel` stream to `peer` carrying exactly one packet
    async fn send_packet(&self, peer: PeerId, packet: &Packet) -> Result<(), HostError> {
        let Some(bytes) = packet.packet() else {
            return Ok(());
        };
        self.inner.peers_svc.connect_peer(peer).await?;
        let mut stream = self
            .inner
            .peers_svc
            .host()
            .new_stream(peer, TUNNEL_PROTOCOL)
            .await?;
        stream.write_all(bytes).await?;
        stream.close().await?;
        trace!("sent {} bytes to {}", bytes.len(), peer);
        Ok(())
    }

    async fn handle_tunnel_stream(self, peer_id: PeerId, mut stream: AwlStream) {
        let peer = self.inner.table.read().by_id(&peer_id);
        let Some(peer) = peer else {
            info!("tunnel stream from unknown peer {}", peer_id);
            return;
        };

        let mut packet = self.inner.pool.get_temp_packet();
        if let Err(e) = packet.read_from(&mut stream).await {
            debug!("read tunnel packet from {}: {}", peer_id, e);
            self.inner.pool.put_temp_packet(packet);
            return;
        }
        let _ = stream.close().await;

        peer.offer(QueueDirection::Inbound, packet, &self.inner.pool);
    }

    async fn inbound_worker(self, peer: Arc<VpnPeer>, mut rx: mpsc::Receiver<Box<Packet>>) {
        let inner = &self.inner;
        loop {
            let mut packet = tokio::select! {
                _ = peer.cancel.cancelled() => break,
                p = rx.recv() => match p {
                    Some(p) => p,
                    None => break,
                },
            };
            let node_ip = Ipv4Addr::from(inner.node_ip.load(Ordering::Relaxed));
            if prepare_inbound(&mut packet, peer.local_ip(), node_ip) {
                if let Some(bytes) = packet.packet() {
                    if let Err(e) = inner.tun.send(bytes).await {
                        warn!("write to TUN {}: {}", inner.tun.name(), e);
                    }
                }
            }
            inner.pool.put_temp_packet(packet);
        }

        rx.close();
        while let Ok(p) = rx.try_recv() {
            inner.pool.put_temp_packet(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet_packet::ipv4::{checksum, Ipv4Packet};
    use pnet_packet::Packet as _;

    fn udp_packet(src: [u8; 4], dst: [u8; 4], len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        buf[8] = 64;
        buf[9] = 17;
        buf[12..16].copy_from_slice(&src);
        buf[16..20].copy_from_slice(&dst);
        buf[20..22].copy_from_slice(&4000u16.to_be_bytes());
        buf[22..24].copy_from_slice(&5000u16.to_be_bytes());
        buf[24..26].copy_from_slice(&((len - 20) as u16).to_be_bytes());
        buf
    }

    #[test]
    fn table_sync_adds_moves_and_removes() {
        let cancel = CancellationToken::new();
        let mut table = PeerTable::default();
        let a = PeerId::random();
        let b = PeerId::random();
        let ip = |n| Ipv4Addr::new(10, 66, 0, n);

        let (added, removed) = table.sync(&[(a, ip(2)), (b, ip(3))], &cancel);
        assert_eq!((added.len(), removed.len()), (2, 0));
        assert_eq!(table.by_ip(&ip(3)).unwrap().peer_id(), b);

        let (added, removed) = table.sync(&[(a, ip(100)), (b, ip(3))], &cancel);
        assert!(added.is_empty() && removed.is_empty());
        assert!(table.by_ip(&ip(2)).is_none());
        assert_eq!(table.by_ip(&ip(100)).unwrap().peer_id(), a);

        let (_, removed) = table.sync(&[(b, ip(3))], &cancel);
        assert_eq!(removed.len(), 1);
        assert!(table.by_id(&a).is_none());
        assert!(table.by_ip(&ip(100)).is_none());
    }

    #[test]
    fn swapped_addresses_stay_consistent() {
        let cancel = CancellationToken::new();
        let mut table = PeerTable::default();
        let a = PeerId::random();
        let b = PeerId::random();
        let ip = |n| Ipv4Addr::new(10, 66, 0, n);
        table.sync(&[(a, ip(2)), (b, ip(3))], &cancel);
        table.sync(&[(a, ip(3)), (b, ip(2))], &cancel);
        assert_eq!(table.by_ip(&ip(2)).unwrap().peer_id(), b);
        assert_eq!(table.by_ip(&ip(3)).unwrap().peer_id(), a);
    }

    #[test]
    fn removed_peer_is_cancelled_by_parent() {
        let cancel = CancellationToken::new();
        let mut table = PeerTable::default();
        let (added, _) = table.sync(&[(PeerId::random(), Ipv4Addr::new(10, 66, 0, 2))], &cancel);
        cancel.cancel();
        assert!(added[0].0.cancel.is_cancelled());
    }

    #[test]
    fn inbound_rewrite_fixes_addresses_and_checksum() {
        let mut packet = Packet::new();
        packet
            .set_packet(&udp_packet([192, 168, 1, 5], [10, 66, 0, 100], 1500))
            .unwrap();
        let src = Ipv4Addr::new(10, 66, 0, 2);
        let dst = Ipv4Addr::new(10, 66, 0, 1);
        assert!(prepare_inbound(&mut packet, src, dst));

        let bytes = packet.packet().unwrap();
        assert_eq!(bytes.len(), 1500);
        let ip = Ipv4Packet::new(bytes).unwrap();
        assert_eq!(ip.get_source(), src);
        assert_eq!(ip.get_destination(), dst);
        assert_eq!(ip.get_checksum(), checksum(&ip));
        assert!(!ip.payload().is_empty());
    }

    #[test]
    fn inbound_rejects_garbage_and_ipv6() {
        let mut packet = Packet::new();
        packet.set_packet(&[0u8; 10]).unwrap();
        assert!(!prepare_inbound(&mut packet, Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST));

        let mut v6 = vec![0u8; 60];
        v6[0] = 0x60;
        packet.set_packet(&v6).unwrap();
        assert!(!prepare_inbound(&mut packet, Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn full_queue_drops_and_recycles() {
        let pool = PacketPool::new();
        let (peer, mut queues) = VpnPeer::new(
            PeerId::random(),
            Ipv4Addr::new(10, 66, 0, 2),
            CancellationToken::new(),
        );
        for _ in 0..PEER_CHANNEL_CAPACITY {
            assert!(peer.offer(QueueDirection::Outbound, pool.get_temp_packet(), &pool));
        }
        assert!(!peer.offer(QueueDirection::Outbound, pool.get_temp_packet(), &pool));
        assert_eq!(peer.dropped(), 1);
        assert_eq!(pool.idle(), 1);

        // the inbound queue is independent
        assert!(peer.offer(QueueDirection::Inbound, pool.get_temp_packet(), &pool));

        // a freed slot accepts again
        assert!(queues.outbound.try_recv().is_ok());
        assert!(peer.offer(QueueDirection::Outbound, pool.get_temp_packet(), &pool));
        assert_eq!(peer.dropped(), 1);
    }

    #[test]
    fn closed_queue_recycles_without_counting() {
        let pool = PacketPool::new();
        let (peer, queues) = VpnPeer::new(
            PeerId::random(),
            Ipv4Addr::new(10, 66, 0, 2),
            CancellationToken::new(),
        );
        drop(queues);
        assert!(!peer.offer(QueueDirection::Outbound, pool.get_temp_packet(), &pool));
        assert_eq!(peer.dropped(), 0);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn drops_are_counted() {
        let (peer, _queues) = VpnPeer::new(
            PeerId::random(),
            Ipv4Addr::new(10, 66, 0, 2),
            CancellationToken::new(),
        );
        peer.record_drop("outbound");
        peer.record_drop("outbound");
        assert_eq!(peer.dropped(), 2);
    }
}
