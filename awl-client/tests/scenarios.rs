//! End-to-end scenarios over real libp2p hosts on 127.0.0.1

mod common;

use std::net::Ipv4Addr;
use std::time::Duration;

use awl_client::api::PeerSettingsUpdate;
use awl_client::config::KnownPeer;
use awl_proto::{AuthPeer, SOCKS5_PROTOCOL};
use common::*;
use futures::{AsyncReadExt, AsyncWriteExt};
use libp2p::PeerId;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn make_friends_then_tunnel_packets() {
    let cancel = CancellationToken::new();
    let (bootstrap, mut nodes) = network(&["p1", "p2"], &cancel).await;
    let p2 = nodes.pop().unwrap();
    let p1 = nodes.pop().unwrap();

    make_friends(&p1, &p2, "peer_2", "peer_1").await;
    assert_eq!(p1.app.auth().ingoing_count(), 0);
    assert_eq!(p2.app.auth().ingoing_count(), 0);
    assert!(!p1.app.auth().has_outgoing_auth(&p2.peer_id()));

    // an auth request to an already known peer is confirmed at once
    let confirmed = p1
        .app
        .auth()
        .send_auth_request(p2.peer_id(), AuthPeer { name: "p1".into() })
        .await
        .unwrap();
    assert!(confirmed);
    assert!(!p1.app.auth().has_outgoing_auth(&p2.peer_id()));

    // ip uniqueness is enforced through the admin operation
    let p2_key = p2.peer_id().to_base58();
    let old_ip = p1.app.known_peer_settings(&p2_key).unwrap().ip_addr;
    let p3 = KnownPeer::new(PeerId::random(), "p3", Ipv4Addr::new(10, 66, 0, 3));
    p1.app.config().update(|c| c.upsert_peer(p3)).unwrap();
    let err = p1
        .app
        .update_peer_settings(PeerSettingsUpdate {
            peer_id: p2_key.clone(),
            alias: "peer_2".into(),
            ip_addr: "10.66.0.3".into(),
            ..Default::default()
        })
        .unwrap_err();
    assert!(
        err.to_string().contains("ip 10.66.0.3 is already used by peer"),
        "{}",
        err
    );
    assert_eq!(p1.app.known_peer_settings(&p2_key).unwrap().ip_addr, old_ip);

    p1.app
        .update_peer_settings(PeerSettingsUpdate {
            peer_id: p2_key.clone(),
            alias: "peer_2".into(),
            ip_addr: "10.66.0.100".into(),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(
        p1.app.known_peer_settings(&p2_key).unwrap().ip_addr,
        "10.66.0.100"
    );
    assert_eq!(
        p1.app.tunnel().peer_ip(&p2.peer_id()),
        Some(Ipv4Addr::new(10, 66, 0, 100))
    );

    let p1_local = p1.app.config().local_ip();
    for _ in 0..10 {
        p1.tun
            .inject
            .send(udp_packet(p1_local, Ipv4Addr::new(10, 66, 0, 100), 1500))
            .await
            .unwrap();
    }

    let mut p2 = p2;
    let p1_as_seen_by_p2: Ipv4Addr = p2
        .app
        .known_peer_settings(&p1.peer_id().to_base58())
        .unwrap()
        .ip_addr
        .parse()
        .unwrap();
    let p2_local = p2.app.config().local_ip();
    let received = collect_written(&mut p2, 10, Duration::from_secs(5)).await;
    assert_eq!(received.len(), 10);
    for packet in &received {
        assert_eq!(packet.len(), 1500);
        assert_eq!(&packet[12..16], &p1_as_seen_by_p2.octets());
        assert_eq!(&packet[16..20], &p2_local.octets());
    }

    shutdown(vec![p1, p2], bootstrap, cancel).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn declined_request_blocks_sender() {
    let cancel = CancellationToken::new();
    let (bootstrap, mut nodes) = network(&["p1", "p2"], &cancel).await;
    let p2 = nodes.pop().unwrap();
    let p1 = nodes.pop().unwrap();
    let p1_key = p1.peer_id().to_base58();

    p1.app
        .send_friend_request(&p2.peer_id().to_base58(), "peer_2")
        .unwrap();
    assert!(wait_until(Duration::from_secs(15), || p2.app.auth_requests().len() == 1).await);

    p2.app.reply_friend_request(&p1_key, "", true).await.unwrap();

    let declined = wait_until(Duration::from_secs(5), || {
        p1.app
            .config()
            .get_peer(&p2.peer_id())
            .is_some_and(|p| p.declined && !p.confirmed)
    })
    .await;
    assert!(declined, "decline did not reach the requester");
    assert!(p2.app.config().is_blocked(&p1.peer_id()));
    assert!(p2.app.config().get_peer(&p1.peer_id()).is_none());
    assert!(p2.app.auth_requests().is_empty());

    // further requests from the blocked peer are refused and not recorded
    let confirmed = p1
        .app
        .auth()
        .send_auth_request(p2.peer_id(), AuthPeer { name: "p1".into() })
        .await
        .unwrap();
    assert!(!confirmed);
    assert!(p2.app.auth_requests().is_empty());

    shutdown(vec![p1, p2], bootstrap, cancel).await;
}

async fn serve_http_once(listener: TcpListener, body: &'static str) {
    let (mut sock, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 1024];
    let _ = sock.read(&mut buf).await.unwrap();
    let response = format!(
        "HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    sock.write_all(response.as_bytes()).await.unwrap();
    sock.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exit_node_permission_and_socks5_policy() {
    let cancel = CancellationToken::new();
    let (bootstrap, mut nodes) = network(&["p1", "p2"], &cancel).await;
    let p2 = nodes.pop().unwrap();
    let p1 = nodes.pop().unwrap();
    make_friends(&p1, &p2, "peer_2", "peer_1").await;

    // P2 lets P1 use it as exit node
    p2.app
        .update_peer_settings(PeerSettingsUpdate {
            peer_id: p1.peer_id().to_base58(),
            alias: "peer_1".into(),
            allow_using_as_exit_node: true,
            ..Default::default()
        })
        .unwrap();
    let allowed = wait_until(Duration::from_secs(15), || {
        p1.app
            .config()
            .get_peer(&p2.peer_id())
            .is_some_and(|p| p.allowed_using_as_exit_node)
    })
    .await;
    assert!(allowed, "exit permission did not propagate");

    let proxies = p1.app.list_available_proxies();
    assert_eq!(proxies.len(), 1);
    assert_eq!(proxies[0].peer_id, p2.peer_id().to_base58());

    p1.app.set_proxy(&p2.peer_id().to_base58()).unwrap();
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    tokio::spawn(serve_http_once(target, "hello from p2"));

    let proxy_addr = p1.app.socks5().local_addr().unwrap();
    let mut conn = tokio_socks::tcp::Socks5Stream::connect(proxy_addr, target_addr)
        .await
        .unwrap();
    conn.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut body = String::new();
    conn.read_to_string(&mut body).await.unwrap();
    assert!(body.ends_with("hello from p2"), "{}", body);

    // P1 does not allow P2, so P2 gets "not allowed by ruleset"
    let mut stream = p2
        .app
        .host()
        .new_stream(p1.peer_id(), SOCKS5_PROTOCOL)
        .await
        .unwrap();
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [5, 0]);
    let mut req = vec![5, 1, 0, 1, 127, 0, 0, 1];
    req.extend_from_slice(&target_addr.port().to_be_bytes());
    stream.write_all(&req).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x02);
    drop(stream);

    shutdown(vec![p1, p2], bootstrap, cancel).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn config_survives_restart() {
    let cancel = CancellationToken::new();
    let (bootstrap, mut nodes) = network(&["solo"], &cancel).await;
    let node = nodes.pop().unwrap();
    let peer_id = node.peer_id();
    node.app.update_my_settings("renamed").unwrap();

    let info = node.app.peer_info();
    assert_eq!(info.name, "renamed");
    assert_eq!(info.vpn_ip, Ipv4Addr::new(10, 66, 0, 1));
    assert_eq!(info.total_bootstrap_peers, 1);

    let p2p = node.app.p2p_info().await.unwrap();
    assert!(!p2p.dht.listen_addrs.is_empty());

    node.app.close().await;
    let raw = std::fs::read_to_string(
        node.app
            .config()
            .path()
            .unwrap(),
    )
    .unwrap();
    assert!(raw.contains("\"renamed\""));
    assert!(raw.contains(&peer_id.to_base58()));

    bootstrap.host.close().await;
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removed_peer_cannot_request_again() {
    let cancel = CancellationToken::new();
    let (bootstrap, mut nodes) = network(&["p1", "p2"], &cancel).await;
    let p2 = nodes.pop().unwrap();
    let p1 = nodes.pop().unwrap();
    make_friends(&p1, &p2, "peer_2", "peer_1").await;

    p2.app.remove_peer(&p1.peer_id().to_base58()).unwrap();
    assert!(p2.app.config().get_peer(&p1.peer_id()).is_none());
    assert!(p2.app.config().is_blocked(&p1.peer_id()));

    let confirmed = p1
        .app
        .auth()
        .send_auth_request(p2.peer_id(), AuthPeer { name: "p1".into() })
        .await
        .unwrap();
    assert!(!confirmed);
    assert!(p2.app.auth_requests().is_empty());
    assert_eq!(p2.app.auth().ingoing_count(), 0);

    shutdown(vec![p1, p2], bootstrap, cancel).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn auto_accept_confirms_request() {
    let cancel = CancellationToken::new();
    let (bootstrap, mut nodes) = network_with(&["p1", "p2"], &cancel, |name, c| {
        if name == "p2" {
            c.p2p_node.auto_accept_auth_requests = true;
        }
    })
    .await;
    let p2 = nodes.pop().unwrap();
    let p1 = nodes.pop().unwrap();

    p1.app
        .send_friend_request(&p2.peer_id().to_base58(), "peer_2")
        .unwrap();
    let confirmed = wait_until(Duration::from_secs(15), || {
        let a = p1.app.config().get_peer(&p2.peer_id());
        let b = p2.app.config().get_peer(&p1.peer_id());
        matches!((a, b), (Some(a), Some(b)) if a.confirmed && b.confirmed)
    })
    .await;
    assert!(confirmed, "auto accept did not confirm both sides");

    let accepted = p2.app.known_peer_settings(&p1.peer_id().to_base58()).unwrap();
    assert_eq!(accepted.ip_addr, "10.66.0.2");
    assert_eq!(accepted.name, "p1");
    assert_eq!(accepted.alias, "p1");
    assert!(p2.app.auth_requests().is_empty());
    assert!(
        wait_until(Duration::from_secs(5), || !p1
            .app
            .auth()
            .has_outgoing_auth(&p2.peer_id()))
        .await
    );

    shutdown(vec![p1, p2], bootstrap, cancel).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disabled_proxying_answers_server_failure() {
    let cancel = CancellationToken::new();
    let (bootstrap, mut nodes) = network_with(&["p1", "p2"], &cancel, |name, c| {
        if name == "p1" {
            c.socks5.proxying_enabled = false;
        }
    })
    .await;
    let p2 = nodes.pop().unwrap();
    let p1 = nodes.pop().unwrap();
    make_friends(&p1, &p2, "peer_2", "peer_1").await;

    // permission alone is not enough while proxying is off
    p1.app
        .update_peer_settings(PeerSettingsUpdate {
            peer_id: p2.peer_id().to_base58(),
            alias: "peer_2".into(),
            allow_using_as_exit_node: true,
            ..Default::default()
        })
        .unwrap();

    let mut stream = p2
        .app
        .host()
        .new_stream(p1.peer_id(), SOCKS5_PROTOCOL)
        .await
        .unwrap();
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [5, 0]);
    stream
        .write_all(&[5, 1, 0, 1, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x01);
    drop(stream);

    shutdown(vec![p1, p2], bootstrap, cancel).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_senders_deliver_every_packet() {
    let cancel = CancellationToken::new();
    let (bootstrap, mut nodes) = network_with(&["p1", "p2"], &cancel, |name, c| {
        if name == "p1" {
            c.p2p_node.parallel_sending_streams_count = 4;
        }
    })
    .await;
    let mut p2 = nodes.pop().unwrap();
    let p1 = nodes.pop().unwrap();
    make_friends(&p1, &p2, "peer_2", "peer_1").await;

    let p2_ip: Ipv4Addr = p1
        .app
        .known_peer_settings(&p2.peer_id().to_base58())
        .unwrap()
        .ip_addr
        .parse()
        .unwrap();
    let p1_local = p1.app.config().local_ip();
    const COUNT: usize = 40;
    for i in 0..COUNT {
        let mut packet = udp_packet(p1_local, p2_ip, 600);
        packet[28] = i as u8;
        p1.tun.inject.send(packet).await.unwrap();
    }

    let received = collect_written(&mut p2, COUNT, Duration::from_secs(10)).await;
    assert_eq!(received.len(), COUNT);
    let mut markers: Vec<u8> = received.iter().map(|p| p[28]).collect();
    markers.sort_unstable();
    assert_eq!(markers, (0..COUNT as u8).collect::<Vec<_>>());
    assert_eq!(p1.app.tunnel().dropped_packets(), 0);

    shutdown(vec![p1, p2], bootstrap, cancel).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unconfirmed_peer_is_invited_again_after_restart() {
    let cancel = CancellationToken::new();
    let (bootstrap, mut nodes) = network(&["p2"], &cancel).await;
    let p2 = nodes.pop().unwrap();
    let p2_id = p2.peer_id();

    // p1 comes up with a pending invitation already on disk
    let p1 = TestNode::start_with("p1", &bootstrap, &cancel, |c| {
        c.upsert_peer(KnownPeer::new(p2_id, "peer_2", Ipv4Addr::new(10, 66, 0, 2)))
            .unwrap();
    })
    .await;
    assert!(p1.app.auth().has_outgoing_auth(&p2_id));

    let arrived = wait_until(Duration::from_secs(15), || p2.app.auth_requests().len() == 1).await;
    assert!(arrived, "pending request was not resent");
    let requests = p2.app.auth_requests();
    assert_eq!(requests[0].peer_id, p1.peer_id().to_base58());
    assert_eq!(requests[0].name, "p1");

    shutdown(vec![p1, p2], bootstrap, cancel).await;
}
