//! Shared fixtures: an in-process bootstrap host plus awl nodes on loopback

#![allow(dead_code)]

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::{Arc, Once};
use std::time::Duration;

use awl_client::config::{Config, CONFIG_FILE_NAME};
use awl_client::p2p::{Host, HostConfig};
use awl_client::socks5::RuleSet;
use awl_client::tun::{LoopbackHandle, TunDevice};
use awl_client::{AppOptions, Application};
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "awl_client=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub struct Bootstrap {
    pub host: Host,
    pub addr: Multiaddr,
}

impl Bootstrap {
    pub async fn start(cancel: &CancellationToken) -> Self {
        let host = Host::start(
            HostConfig {
                keypair: Keypair::generate_ed25519(),
                listen_addresses: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
                bootstrap_peers: Vec::new(),
                user_agent: awl_proto::format_user_agent("test-bootstrap"),
            },
            cancel,
        )
        .unwrap();

        let listen = wait_for_value(Duration::from_secs(5), || {
            host.listen_addrs().into_iter().next()
        })
        .await
        .expect("bootstrap never started listening");
        let addr = listen.with(Protocol::P2p(host.peer_id()));
        Self { host, addr }
    }

    /// Wait until the bootstrap routing table knows every peer
    pub async fn wait_knows(&self, peers: &[PeerId]) {
        let host = self.host.clone();
        let peers = peers.to_vec();
        let known = wait_until_async(Duration::from_secs(10), || {
            let host = host.clone();
            let peers = peers.clone();
            async move {
                let table = host.routing_table().await.unwrap_or_default();
                peers.iter().all(|p| table.iter().any(|(id, _)| id == p))
            }
        })
        .await;
        assert!(known, "bootstrap routing table is missing peers");
    }
}

pub struct TestNode {
    pub app: Arc<Application>,
    pub tun: LoopbackHandle,
    _dir: TempDir,
}

impl TestNode {
    pub async fn start(name: &str, bootstrap: &Bootstrap, cancel: &CancellationToken) -> Self {
        Self::start_with(name, bootstrap, cancel, |_| {}).await
    }

    /// Start with the test defaults adjusted by `configure`
    pub async fn start_with(
        name: &str,
        bootstrap: &Bootstrap,
        cancel: &CancellationToken,
        configure: impl FnOnce(&mut Config),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.p2p_node.name = name.to_string();
        config.p2p_node.use_default_bootstrap_peers = false;
        config.p2p_node.bootstrap_peers = vec![bootstrap.addr.to_string()];
        config.p2p_node.listen_addresses = vec!["/ip4/127.0.0.1/tcp/0".to_string()];
        config.p2p_node.reconnection_interval_sec = 1;
        config.socks5.listen_address = "127.0.0.1:0".to_string();
        configure(&mut config);
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            serde_json::to_vec_pretty(&config).unwrap(),
        )
        .unwrap();

        let (tun, handle) = TunDevice::loopback(&format!("awl-{}", name), 3500);
        let mut opts = AppOptions::new(dir.path());
        opts.tun = Some(tun);
        opts.socks5_rules = RuleSet::PermitAll;
        let app = Application::init_with(opts, cancel).await.unwrap();
        Self {
            app,
            tun: handle,
            _dir: dir,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.app.peer_id()
    }
}

/// Poll `cond` every 50 ms until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub async fn wait_until_async<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub async fn wait_for_value<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(v) = f() {
            return Some(v);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Start a bootstrap host and `names.len()` nodes that all know it
pub async fn network(names: &[&str], cancel: &CancellationToken) -> (Bootstrap, Vec<TestNode>) {
    network_with(names, cancel, |_, _| {}).await
}

/// Like [`network`], with `configure(name, config)` applied to each node
pub async fn network_with(
    names: &[&str],
    cancel: &CancellationToken,
    configure: impl Fn(&str, &mut Config),
) -> (Bootstrap, Vec<TestNode>) {
    init_tracing();
    let bootstrap = Bootstrap::start(cancel).await;
    let mut nodes = Vec::new();
    for name in names {
        nodes.push(TestNode::start_with(name, &bootstrap, cancel, |c| configure(name, c)).await);
    }
    let ids: Vec<PeerId> = nodes.iter().map(TestNode::peer_id).collect();
    bootstrap.wait_knows(&ids).await;
    (bootstrap, nodes)
}

/// P1 invites P2, P2 accepts; both end up confirmed
pub async fn make_friends(p1: &TestNode, p2: &TestNode, alias_of_p2: &str, alias_of_p1: &str) {
    p1.app
        .send_friend_request(&p2.peer_id().to_base58(), alias_of_p2)
        .unwrap();
    let received = wait_until(Duration::from_secs(15), || {
        p2.app.auth_requests().len() == 1
    })
    .await;
    assert!(received, "friend request never arrived");
    assert_eq!(p2.app.auth_requests()[0].peer_id, p1.peer_id().to_base58());

    p2.app
        .reply_friend_request(&p1.peer_id().to_base58(), alias_of_p1, false)
        .await
        .unwrap();

    let confirmed = wait_until(Duration::from_secs(5), || {
        let a = p1.app.config().get_peer(&p2.peer_id());
        let b = p2.app.config().get_peer(&p1.peer_id());
        matches!((a, b), (Some(a), Some(b)) if a.confirmed && !a.declined && b.confirmed && !b.declined)
    })
    .await;
    assert!(confirmed, "peers did not confirm each other");
}

/// Receive until `count` packets arrived or `timeout` passed
pub async fn collect_written(node: &mut TestNode, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
    let mut received = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    while received.len() < count {
        match tokio::time::timeout_at(deadline, node.tun.written.recv()).await {
            Ok(Some(packet)) => received.push(packet),
            _ => break,
        }
    }
    received
}

/// An IPv4/UDP packet of exactly `len` bytes
pub fn udp_packet(src: Ipv4Addr, dst: Ipv4Addr, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    buf[0] = 0x45;
    buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    buf[8] = 64;
    buf[9] = 17;
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());
    buf[20..22].copy_from_slice(&40000u16.to_be_bytes());
    buf[22..24].copy_from_slice(&53u16.to_be_bytes());
    buf[24..26].copy_from_slice(&((len - 20) as u16).to_be_bytes());
    for (i, b) in buf[28..].iter_mut().enumerate() {
        *b = i as u8;
    }
    buf
}

pub async fn shutdown(nodes: Vec<TestNode>, bootstrap: Bootstrap, cancel: CancellationToken) {
    for node in &nodes {
        node.app.close().await;
    }
    bootstrap.host.close().await;
    cancel.cancel();
}
