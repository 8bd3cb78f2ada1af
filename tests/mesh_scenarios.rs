//! Integration tests: several mesh nodes sharing one loopback ether.
//!
//! Each node runs its own task exactly as it would on hardware; only the
//! radio is simulated. Assertions wait on the observable state streams
//! with a timeout rather than sleeping.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use anogram_mesh::bluetooth::ConnectionState;
use anogram_mesh::state::StateFlow;
use anogram_mesh::{Ether, MeshConfig, MeshEvent, MeshMessage, MeshService, PeerAddress};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

fn spawn_node(ether: &Ether, address: &str, configure: impl FnOnce(&mut MeshConfig)) -> MeshService {
    let mut config = MeshConfig {
        device_id: address.to_lowercase(),
        device_name: format!("AnoGram {address}"),
        ..MeshConfig::default()
    };
    configure(&mut config);

    let (radio, events) = ether.attach(address);
    MeshService::spawn(config, Arc::new(radio), events)
}

async fn wait_until<T>(flow: &StateFlow<T>, what: &str, condition: impl FnMut(&T) -> bool) {
    let mut receiver = flow.subscribe();
    let reached = tokio::time::timeout(WAIT, async {
        receiver.wait_for(condition).await.map(|_| ())
    })
    .await;
    assert!(matches!(reached, Ok(Ok(()))), "timed out waiting for {what}");
}

async fn next_message(events: &mut broadcast::Receiver<MeshEvent>) -> MeshMessage {
    loop {
        match tokio::time::timeout(WAIT, events.recv()).await {
            Ok(Ok(MeshEvent::MessageReceived(message))) => return message,
            Ok(Ok(_)) => continue,
            other => panic!("no message received: {:?}", other),
        }
    }
}

async fn assert_no_message(events: &mut broadcast::Receiver<MeshEvent>) {
    loop {
        match tokio::time::timeout(QUIET, events.recv()).await {
            Err(_) => return,
            Ok(Ok(MeshEvent::MessageReceived(message))) => {
                panic!("unexpected message: {:?}", message)
            }
            Ok(_) => continue,
        }
    }
}

/// Have `a` dial `b` and wait until both sides hold a live link
async fn link(a: &MeshService, a_addr: &str, b: &MeshService, b_addr: &str) {
    let (a_peer, b_peer) = (PeerAddress::from(a_addr), PeerAddress::from(b_addr));
    a.connect_peer(b_addr);
    wait_until(&a.state().connected, "outbound link", |set| set.contains(&b_peer)).await;
    wait_until(&b.state().connected, "dial-back link", |set| set.contains(&a_peer)).await;
}

#[tokio::test]
async fn discovery_yields_one_record_per_peer() {
    let ether = Ether::new();
    let _a = spawn_node(&ether, "A", |_| {});
    let b = spawn_node(&ether, "B", |_| {});

    wait_until(&b.state().peers, "A discovered", |peers| {
        peers.iter().any(|p| p.address.as_str() == "A")
    })
    .await;

    ether.set_signal_strength(&"A".into(), -30);
    wait_until(&b.state().peers, "rssi update", |peers| {
        peers.iter().any(|p| p.address.as_str() == "A" && p.rssi == -30)
    })
    .await;

    let peers = b.get_peer_list();
    assert_eq!(peers.iter().filter(|p| p.address.as_str() == "A").count(), 1);
    assert_eq!(peers[0].name, "AnoGram A");
    assert!(!peers[0].is_connected);
}

#[tokio::test]
async fn directory_is_sorted_by_signal_strength() {
    let ether = Ether::new();
    let _far = spawn_node(&ether, "FAR", |_| {});
    let _near = spawn_node(&ether, "NEAR", |_| {});
    ether.set_signal_strength(&"FAR".into(), -90);
    ether.set_signal_strength(&"NEAR".into(), -40);
    let observer = spawn_node(&ether, "OBS", |_| {});

    wait_until(&observer.state().peers, "both peers", |peers| peers.len() == 2).await;
    let order: Vec<String> = observer
        .get_peer_list()
        .into_iter()
        .map(|p| p.address.to_string())
        .collect();
    assert_eq!(order, vec!["NEAR", "FAR"]);
}

#[tokio::test]
async fn pending_message_flushes_when_a_link_comes_up() {
    let ether = Ether::new();
    let a = spawn_node(&ether, "A", |_| {});

    let message = a.send_message("hello").await.unwrap();
    assert_eq!(a.get_pending_messages().await.unwrap(), vec![message.clone()]);

    let b = spawn_node(&ether, "B", |_| {});
    let mut b_events = b.subscribe_events();
    link(&a, "A", &b, "B").await;

    let received = next_message(&mut b_events).await;
    assert_eq!(received.id, message.id);
    assert_eq!(received.content, "hello");
    assert_eq!(received.sender_id, "a");
    assert_eq!(received.hop_count, 0);
    assert!(a.get_pending_messages().await.unwrap().is_empty());
}

#[tokio::test]
async fn subscription_triggers_dial_back() {
    let ether = Ether::new();
    let a = spawn_node(&ether, "A", |_| {});
    let b = spawn_node(&ether, "B", |_| {});
    let mut b_events = b.subscribe_events();

    link(&a, "A", &b, "B").await;

    assert_eq!(b.connection_state("A").await.unwrap(), ConnectionState::Connected);
    assert!(ether.is_linked(&"B".into(), &"A".into()));
    loop {
        match tokio::time::timeout(WAIT, b_events.recv()).await {
            Ok(Ok(MeshEvent::PeerConnected(address))) => {
                assert_eq!(address.as_str(), "A");
                break;
            }
            Ok(Ok(_)) => continue,
            other => panic!("no connect event: {:?}", other),
        }
    }
}

#[tokio::test]
async fn two_node_flood_is_bounded_by_hop_limit() {
    let ether = Ether::new();
    let a = spawn_node(&ether, "A", |_| {});
    let b = spawn_node(&ether, "B", |_| {});
    let mut b_events = b.subscribe_events();
    link(&a, "A", &b, "B").await;

    let sent = a.send_message("ping").await.unwrap();

    // Copies bounce A -> B -> A ...; B delivers the even hops, A drops its echoes.
    let mut hops = Vec::new();
    for _ in 0..4 {
        let message = next_message(&mut b_events).await;
        assert_eq!(message.id, sent.id);
        hops.push(message.hop_count);
    }
    assert_eq!(hops, vec![0, 2, 4, 6]);
    assert_no_message(&mut b_events).await;

    let status = a.get_status().await.unwrap();
    assert_eq!(status["relay_statistics"]["echoes"], 4);
    assert_eq!(status["relay_statistics"]["delivered"], 0);
}

#[tokio::test]
async fn chain_relay_reaches_nodes_out_of_range() {
    let ether = Ether::new();
    let dedup = |c: &mut MeshConfig| c.suppress_duplicates = true;
    let a = spawn_node(&ether, "A", dedup);
    let b = spawn_node(&ether, "B", dedup);
    let c = spawn_node(&ether, "C", dedup);
    let mut c_events = c.subscribe_events();

    link(&a, "A", &b, "B").await;
    link(&b, "B", &c, "C").await;
    assert!(!ether.is_linked(&"A".into(), &"C".into()));

    let sent = a.send_message("over the hill").await.unwrap();

    let received = next_message(&mut c_events).await;
    assert_eq!(received.id, sent.id);
    assert_eq!(received.hop_count, 1);
    assert!(received.is_relayed);
    assert_eq!(c.state().last_message.get(), Some(received));
    assert_no_message(&mut c_events).await;
}

#[tokio::test]
async fn hop_limited_message_is_delivered_but_not_relayed() {
    let ether = Ether::new();
    let b = spawn_node(&ether, "B", |_| {});
    let c = spawn_node(&ether, "C", |_| {});
    let mut b_events = b.subscribe_events();
    let mut c_events = c.subscribe_events();
    link(&b, "B", &c, "C").await;

    ether.inject_frame(&"B".into(), &"X".into(), b"m1|A|Alice|hi|1000|7");
    ether.inject_frame(&"B".into(), &"X".into(), b"m2|A|Alice|hi|1000|6");

    let delivered = next_message(&mut b_events).await;
    assert_eq!((delivered.id.as_str(), delivered.hop_count), ("m1", 7));

    // Writes to one peer keep their order, so m2 arriving first means m1 never left B.
    let relayed = next_message(&mut c_events).await;
    assert_eq!((relayed.id.as_str(), relayed.hop_count), ("m2", 7));
}

#[tokio::test]
async fn malformed_and_echoed_frames_are_not_delivered() {
    let ether = Ether::new();
    let b = spawn_node(&ether, "B", |_| {});
    let mut b_events = b.subscribe_events();
    b.get_status().await.unwrap();

    ether.inject_frame(&"B".into(), &"X".into(), b"only|two|fields");
    ether.inject_frame(&"B".into(), &"X".into(), b"e1|b|Me|echo|1000|3");
    ether.inject_frame(&"B".into(), &"X".into(), b"ok|A|Alice|fine|1000|0");

    let message = next_message(&mut b_events).await;
    assert_eq!(message.id, "ok");

    let status = b.get_status().await.unwrap();
    assert_eq!(status["relay_statistics"]["malformed"], 1);
    assert_eq!(status["relay_statistics"]["echoes"], 1);
    assert_eq!(status["relay_statistics"]["delivered"], 1);
}

#[tokio::test]
async fn local_disconnect_tears_down_both_sides() {
    let ether = Ether::new();
    let a = spawn_node(&ether, "A", |_| {});
    let b = spawn_node(&ether, "B", |_| {});
    link(&a, "A", &b, "B").await;

    a.disconnect_peer("B");

    wait_until(&a.state().connected, "A idle", |set| set.is_empty()).await;
    wait_until(&b.state().connected, "B idle", |set| set.is_empty()).await;
    assert_eq!(a.connection_state("B").await.unwrap(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn remote_teardown_is_noticed() {
    let ether = Ether::new();
    let a = spawn_node(&ether, "A", |_| {});
    let b = spawn_node(&ether, "B", |_| {});
    link(&a, "A", &b, "B").await;

    ether.sever(&"A".into(), &"B".into());

    wait_until(&a.state().connected, "A idle", |set| set.is_empty()).await;
    wait_until(&b.state().connected, "B idle", |set| set.is_empty()).await;
    let message = a.send_message("anyone?").await.unwrap();
    assert_eq!(a.get_pending_messages().await.unwrap(), vec![message]);
}

#[tokio::test]
async fn bluetooth_off_closes_links_and_blocks_radio_work() {
    let ether = Ether::new();
    let a = spawn_node(&ether, "A", |_| {});
    let b = spawn_node(&ether, "B", |_| {});
    link(&a, "A", &b, "B").await;

    ether.set_enabled(&"A".into(), false);

    wait_until(&a.state().bluetooth_enabled, "adapter off", |on| !*on).await;
    assert!(!a.state().scanning.get());
    assert!(a.state().connected.get().is_empty());
    wait_until(&b.state().connected, "B idle", |set| set.is_empty()).await;

    a.start_scan();
    a.connect_peer("B");
    let status = a.get_status().await.unwrap();
    assert_eq!(status["is_scanning"], false);
    assert_eq!(a.connection_state("B").await.unwrap(), ConnectionState::Disconnected);

    ether.set_enabled(&"A".into(), true);
    wait_until(&a.state().bluetooth_enabled, "adapter on", |on| *on).await;
    wait_until(&a.state().scanning, "scan resumed", |scanning| *scanning).await;
    assert_eq!(ether.advertised_name(&"A".into()).as_deref(), Some("AnoGram A"));
}

#[tokio::test]
async fn auto_connect_dials_discovered_peers() {
    let ether = Ether::new();
    let a = spawn_node(&ether, "A", |_| {});
    let _b = spawn_node(&ether, "B", |c| c.auto_connect = true);

    wait_until(&a.state().connected, "auto link", |set| {
        set.contains(&PeerAddress::from("B"))
    })
    .await;
}

#[tokio::test]
async fn set_device_info_updates_identity_and_advertisement() {
    let ether = Ether::new();
    let a = spawn_node(&ether, "A", |_| {});
    a.get_status().await.unwrap();

    a.set_device_info("feedbeef", "AnoGram Alice");

    let message = a.send_message("renamed").await.unwrap();
    assert_eq!(message.sender_id, "feedbeef");
    assert_eq!(message.sender_name, "AnoGram Alice");
    assert_eq!(ether.advertised_name(&"A".into()).as_deref(), Some("AnoGram Alice"));
}

#[tokio::test]
async fn stop_scan_is_idempotent() {
    let ether = Ether::new();
    let a = spawn_node(&ether, "A", |_| {});
    wait_until(&a.state().scanning, "scanning", |scanning| *scanning).await;

    a.stop_scan();
    a.stop_scan();
    wait_until(&a.state().scanning, "stopped", |scanning| !*scanning).await;
    assert!(!ether.is_scanning(&"A".into()));

    a.start_scan();
    wait_until(&a.state().scanning, "restarted", |scanning| *scanning).await;
}

#[tokio::test]
async fn peer_linked_before_discovery_is_listed_as_connected() {
    let ether = Ether::new();
    let a = spawn_node(&ether, "A", |c| c.auto_scan = false);
    let b = spawn_node(&ether, "B", |_| {});
    link(&a, "A", &b, "B").await;
    assert!(a.get_peer_list().is_empty());

    a.start_scan();
    wait_until(&a.state().peers, "B listed", |peers| {
        peers.iter().any(|p| p.address.as_str() == "B")
    })
    .await;

    let peers = a.get_peer_list();
    assert!(peers[0].is_connected);
    assert!(a.state().connected.get().contains(&PeerAddress::from("B")));
}
