//! Proxy relay integration tests
//!
//! A router node, a proxied node running receiver and sender, and plain
//! peers outside, all on one in-memory network.
//!
//! Run with: cargo test --test integration_proxy

mod common;

use common::{eventually, outcome, TestNet, TestNode};
use courier_core::config::ProxyConfig;
use courier_core::delivery::{Callbacks, DeliveryError, DeliveryOutcome, OutboxOptions};
use courier_core::identity::Contact;
use courier_core::packet::{encode, Command};
use courier_core::proxy::{
    ProxyReceiver, ProxyRouter, ProxySender, ReceiverState, RouteTable, RouterState,
    RoutedPayload, SenderState, ServiceRequest, REASON_ACCEPTED, REASON_BAD_REQUEST,
    REASON_ROUTED_FAILED, REASON_ROUTE_NOT_EXIST, REASON_TOO_MANY_ROUTES,
};
use courier_core::store::settings::{KEY_CURRENT_ROUTER, KEY_MY_ORIGINAL_IDENTITY};
use courier_core::transport::Protocol;
use std::time::Duration;

fn proxy_config(router: &TestNode) -> ProxyConfig {
    ProxyConfig {
        preferred_routers: vec![router.idurl.as_str().to_string()],
        ..Default::default()
    }
}

async fn start_router(node: &TestNode, config: ProxyConfig) -> ProxyRouter {
    let router = ProxyRouter::new(&node.gateway, config, node.settings.clone());
    router.start();
    eventually("router listening", || router.state() == RouterState::Listen).await;
    router
}

struct Proxied {
    receiver: ProxyReceiver,
    sender: ProxySender,
}

fn proxy_roles(net: &TestNet, node: &TestNode, config: ProxyConfig) -> Proxied {
    let receiver = ProxyReceiver::new(
        &node.gateway,
        config.clone(),
        node.settings.clone(),
        net.directory.clone(),
    );
    let sender = ProxySender::new(&node.gateway, config, &receiver);
    Proxied { receiver, sender }
}

async fn go_online(proxied: &Proxied) {
    proxied.sender.start();
    proxied.receiver.start();
    eventually("receiver listening", || proxied.receiver.is_listening()).await;
    eventually("sender redirecting", || {
        proxied.sender.state() == SenderState::Redirecting
    })
    .await;
}

/// Send a service packet by hand and wait for the router's answer.
async fn service_packet(client: &TestNode, router: &TestNode, command: Command) -> DeliveryOutcome {
    let identity = (command == Command::RequestService).then(|| (*client.local.get()).clone());
    let payload = ServiceRequest::proxy(identity).to_json().unwrap();
    let packet = client
        .gateway
        .build(command)
        .remote(router.idurl.clone())
        .payload(payload)
        .sign(client.gateway.keyring());
    outcome(client.gateway.outbox(
        packet,
        OutboxOptions::default(),
        Callbacks::new().expect_acks(command),
    ))
    .await
}

fn reply_of(result: &DeliveryOutcome) -> (Command, String) {
    let reply = result.response().expect("router answered");
    (reply.command(), reply.payload_text().into_owned())
}

#[tokio::test]
async fn test_receiver_negotiates_route_and_republishes_contacts() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let router = start_router(&hub, ProxyConfig::default()).await;

    let proxied = proxy_roles(&net, &alice, proxy_config(&hub));
    go_online(&proxied).await;

    assert_eq!(proxied.receiver.router_id(), Some(hub.idurl.clone()));
    assert_eq!(router.clients(), vec![alice.idurl.clone()]);
    let route = router.route(&alice.idurl).unwrap();
    assert_eq!(route.delivery_contact(), Some(&Contact::new(Protocol::Tcp, "alice")));

    // Everyone now reaches alice at the router's address.
    assert_eq!(alice.local.get().contacts(), [Contact::new(Protocol::Tcp, "hub")]);
    let published = net.published(&alice.idurl).await.unwrap();
    assert_eq!(published.contacts(), [Contact::new(Protocol::Tcp, "hub")]);
    assert!(alice.settings.get_string(KEY_MY_ORIGINAL_IDENTITY).unwrap().is_some());
    assert!(alice
        .settings
        .get_string(KEY_CURRENT_ROUTER)
        .unwrap()
        .unwrap()
        .starts_with(hub.idurl.as_str()));
    println!("✓ Route established through {}", hub.name);
}

#[tokio::test]
async fn test_outgoing_packet_relayed_and_answered() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let bob = net.node("bob").await;
    bob.ack_data();
    let _router = start_router(&hub, ProxyConfig::default()).await;
    let proxied = proxy_roles(&net, &alice, proxy_config(&hub));
    go_online(&proxied).await;

    let packet = alice.data_for(&bob, b"via the hub");
    let signature = packet.signature().to_vec();
    let delivery = alice.gateway.outbox(
        packet,
        OutboxOptions::default(),
        Callbacks::new().expect_acks(Command::Data),
    );
    let result = outcome(delivery).await;

    let ack = result.response().expect("ack relayed back");
    assert_eq!(ack.command(), Command::Ack);
    assert_eq!(ack.creator_id(), &bob.idurl);

    assert_eq!(bob.received_count(), 1);
    let received = bob.received.lock()[0].clone();
    assert_eq!(received.creator_id(), &alice.idurl);
    assert_eq!(received.signature(), signature.as_slice());
    assert_eq!(received.payload(), b"via the hub");
    println!("✓ Data relayed with the original signature, ack relayed back");
}

#[tokio::test]
async fn test_outside_peer_reaches_proxied_node() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let carol = net.node("carol").await;
    alice.ack_data();
    let _router = start_router(&hub, ProxyConfig::default()).await;
    let proxied = proxy_roles(&net, &alice, proxy_config(&hub));
    go_online(&proxied).await;

    let result = outcome(carol.gateway.outbox(
        carol.data_for(&alice, b"hello through the hub"),
        OutboxOptions::default(),
        Callbacks::new().expect_acks(Command::Data),
    ))
    .await;
    assert_eq!(result.response().map(|p| p.creator_id().clone()), Some(alice.idurl.clone()));
    assert_eq!(alice.received_count(), 1);
    assert_eq!(alice.received.lock()[0].creator_id(), &carol.idurl);
    // carol only ever knew the hub's address for alice
    let seen_by_carol = carol.gateway.identities().get(&alice.idurl).unwrap();
    assert_eq!(seen_by_carol.contacts(), [Contact::new(Protocol::Tcp, "hub")]);
    println!("✓ Outside peer reached the proxied node");
}

#[tokio::test]
async fn test_undeliverable_outgoing_relay_reported_to_client() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    // Never published, so the hub cannot find where to send.
    let carol = net.stranger("carol").await;
    let _router = start_router(&hub, ProxyConfig::default()).await;
    let proxied = proxy_roles(&net, &alice, proxy_config(&hub));
    go_online(&proxied).await;

    let result = outcome(alice.gateway.outbox(
        alice.data_for(&carol, b"nobody home"),
        OutboxOptions::default(),
        Callbacks::new().expect_acks(Command::Data),
    ))
    .await;

    assert_eq!(reply_of(&result), (Command::Fail, REASON_ROUTED_FAILED.to_string()));
    assert_eq!(result.response().unwrap().creator_id(), &hub.idurl);
    assert!(!result.is_success());
    assert_eq!(carol.received_count(), 0);
    println!("✓ Client told its relayed packet went nowhere");
}

#[tokio::test]
async fn test_undeliverable_incoming_relay_reported_to_sender() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let carol = net.node("carol").await;
    alice.ack_data();
    let _router = start_router(&hub, ProxyConfig::default()).await;
    let proxied = proxy_roles(&net, &alice, proxy_config(&hub));
    go_online(&proxied).await;

    // alice drops off behind the hub
    net.network.set_reachable(Protocol::Tcp, "alice", false);
    let result = outcome(carol.gateway.outbox(
        carol.data_for(&alice, b"are you there"),
        OutboxOptions::default(),
        Callbacks::new().expect_acks(Command::Data),
    ))
    .await;

    assert_eq!(reply_of(&result), (Command::Fail, REASON_ROUTED_FAILED.to_string()));
    let fail = result.response().unwrap();
    assert_eq!(fail.creator_id(), &hub.idurl);
    assert_eq!(fail.owner_id(), &alice.idurl);
    assert!(!result.is_success());
    assert_eq!(alice.received_count(), 0);
    println!("✓ Outside sender told the proxied node was unreachable");
}

#[tokio::test]
async fn test_relay_of_foreign_packet_is_refused() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let bob = net.node("bob").await;
    let carol = net.node("carol").await;
    carol.swallow_data();
    let _router = start_router(&hub, ProxyConfig::default()).await;
    service_packet(&alice, &hub, Command::RequestService).await;

    // alice holds a route but wraps a packet bob created
    let routed = RoutedPayload {
        sender: alice.idurl.clone(),
        receiver: carol.idurl.clone(),
        wide: false,
        inner: encode(&bob.data_for(&carol, b"not mine")).unwrap(),
    };
    let hub_key = hub.local.get().public_key_bytes().unwrap();
    let relay = alice
        .gateway
        .build(Command::Relay)
        .remote(hub.idurl.clone())
        .payload(routed.seal(alice.gateway.keyring(), &hub_key).unwrap())
        .sign(alice.gateway.keyring());

    let failed = std::sync::Arc::new(parking_lot::Mutex::new(None));
    let sink = failed.clone();
    alice.gateway.append_inbound_handler(move |packet, _| {
        if packet.command() != Command::Fail {
            return false;
        }
        *sink.lock() = Some(packet.payload_text().into_owned());
        true
    });
    let sent = outcome(alice.gateway.outbox(relay, OutboxOptions::default(), Callbacks::new())).await;
    assert_eq!(sent, DeliveryOutcome::Sent);

    eventually("fail from the router", || failed.lock().is_some()).await;
    assert_eq!(failed.lock().as_deref(), Some(REASON_BAD_REQUEST));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(carol.received_count(), 0);
    println!("✓ Relay wrapping another node's packet refused");
}

#[tokio::test]
async fn test_route_traffic_counted_and_saved() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let bob = net.node("bob").await;
    bob.ack_data();
    let router = start_router(&hub, ProxyConfig::default()).await;
    let proxied = proxy_roles(&net, &alice, proxy_config(&hub));
    go_online(&proxied).await;

    let result = outcome(alice.gateway.outbox(
        alice.data_for(&bob, b"count me"),
        OutboxOptions::default(),
        Callbacks::new().expect_acks(Command::Data),
    ))
    .await;
    assert!(result.is_success());

    // Out: the Data. In: bob's Ack.
    let traffic = router.route(&alice.idurl).unwrap().traffic;
    assert!(traffic.packets_out >= 1 && traffic.bytes_out > 0);
    assert!(traffic.packets_in >= 1 && traffic.bytes_in > 0);

    router.stop();
    eventually("router stopped", || router.state() == RouterState::Stopped).await;
    let mut saved = RouteTable::new(ProxyConfig::default().max_routes, Some(hub.settings.clone()));
    saved.load().unwrap();
    assert_eq!(saved.get(&alice.idurl).unwrap().traffic, traffic);
    println!("✓ Relay traffic counted per route and saved");
}

#[tokio::test]
async fn test_full_router_refuses_new_clients() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let carol = net.node("carol").await;
    let config = ProxyConfig {
        max_routes: 1,
        ..Default::default()
    };
    let router = start_router(&hub, config).await;

    let first = service_packet(&alice, &hub, Command::RequestService).await;
    assert_eq!(reply_of(&first), (Command::Ack, REASON_ACCEPTED.to_string()));

    let second = service_packet(&carol, &hub, Command::RequestService).await;
    assert_eq!(reply_of(&second), (Command::Fail, REASON_TOO_MANY_ROUTES.to_string()));
    assert_eq!(router.clients(), vec![alice.idurl.clone()]);

    // a known client renewing its route is not a new route
    let renewed = service_packet(&alice, &hub, Command::RequestService).await;
    assert_eq!(reply_of(&renewed).0, Command::Ack);
    assert_eq!(router.route_count(), 1);
    println!("✓ Router capacity enforced");
}

#[tokio::test]
async fn test_cancel_without_route_is_refused() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let router = start_router(&hub, ProxyConfig::default()).await;

    let refused = service_packet(&alice, &hub, Command::CancelService).await;
    assert_eq!(reply_of(&refused), (Command::Fail, REASON_ROUTE_NOT_EXIST.to_string()));

    service_packet(&alice, &hub, Command::RequestService).await;
    assert_eq!(router.route_count(), 1);
    assert!(hub.gateway.identities().is_overridden(&alice.idurl));

    let closed = service_packet(&alice, &hub, Command::CancelService).await;
    assert_eq!(reply_of(&closed).0, Command::Ack);
    assert_eq!(router.route_count(), 0);
    assert!(!hub.gateway.identities().is_overridden(&alice.idurl));
    println!("✓ CancelService needs an existing route");
}

#[tokio::test]
async fn test_relay_without_route_is_refused() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let bob = net.node("bob").await;
    bob.swallow_data();
    let _router = start_router(&hub, ProxyConfig::default()).await;

    let routed = RoutedPayload {
        sender: alice.idurl.clone(),
        receiver: bob.idurl.clone(),
        wide: false,
        inner: encode(&alice.data_for(&bob, b"sneaky")).unwrap(),
    };
    let hub_key = hub.local.get().public_key_bytes().unwrap();
    let relay = alice
        .gateway
        .build(Command::Relay)
        .remote(hub.idurl.clone())
        .payload(routed.seal(alice.gateway.keyring(), &hub_key).unwrap())
        .sign(alice.gateway.keyring());

    let failed = std::sync::Arc::new(parking_lot::Mutex::new(None));
    let sink = failed.clone();
    alice.gateway.append_inbound_handler(move |packet, _| {
        if packet.command() != Command::Fail {
            return false;
        }
        *sink.lock() = Some(packet.payload_text().into_owned());
        true
    });
    let result = outcome(alice.gateway.outbox(
        relay,
        OutboxOptions::default(),
        Callbacks::new(),
    ))
    .await;
    assert_eq!(result, DeliveryOutcome::Sent);

    eventually("fail from the router", || failed.lock().is_some()).await;
    assert_eq!(failed.lock().as_deref(), Some(REASON_ROUTE_NOT_EXIST));
    assert_eq!(bob.received_count(), 0);
    println!("✓ Relay from an unknown client refused");
}

#[tokio::test]
async fn test_repeated_relay_forwarded_once() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let bob = net.node("bob").await;
    bob.swallow_data();
    let _router = start_router(&hub, ProxyConfig::default()).await;
    service_packet(&alice, &hub, Command::RequestService).await;

    let hub_key = hub.local.get().public_key_bytes().unwrap();
    let inner = alice.data_for(&bob, b"only once");
    let wrap = |packet: &courier_core::packet::Packet| {
        let routed = RoutedPayload {
            sender: alice.idurl.clone(),
            receiver: bob.idurl.clone(),
            wide: false,
            inner: encode(packet).unwrap(),
        };
        alice
            .gateway
            .build(Command::Relay)
            .remote(hub.idurl.clone())
            .payload(routed.seal(alice.gateway.keyring(), &hub_key).unwrap())
            .sign(alice.gateway.keyring())
    };

    // Same inner packet in two different relays.
    for _ in 0..2 {
        let relay = wrap(&inner);
        let sent = outcome(alice.gateway.outbox(relay, OutboxOptions::default(), Callbacks::new())).await;
        assert_eq!(sent, DeliveryOutcome::Sent);
    }
    let marker = outcome(alice.gateway.outbox(
        wrap(&alice.data_for(&bob, b"marker")),
        OutboxOptions::default(),
        Callbacks::new(),
    ))
    .await;
    assert_eq!(marker, DeliveryOutcome::Sent);

    eventually("marker arrived", || {
        bob.received.lock().iter().any(|p| p.payload() == b"marker")
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let copies = bob
        .received
        .lock()
        .iter()
        .filter(|p| p.payload() == b"only once")
        .count();
    assert_eq!(copies, 1);
    println!("✓ Duplicate relay dropped by the router");
}

#[tokio::test]
async fn test_sender_queue_drops_oldest_then_flushes() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let bob = net.node("bob").await;
    bob.ack_data();
    let _router = start_router(&hub, ProxyConfig::default()).await;
    let config = ProxyConfig {
        pending_limit: 2,
        ..proxy_config(&hub)
    };
    let proxied = proxy_roles(&net, &alice, config);

    proxied.sender.start();
    eventually("sender waiting for a route", || {
        proxied.sender.state() == SenderState::Router
    })
    .await;

    let send = |payload: &[u8]| {
        alice.gateway.outbox(
            alice.data_for(&bob, payload),
            OutboxOptions::default(),
            Callbacks::new().expect_acks(Command::Data),
        )
    };
    let first = send(b"one");
    let second = send(b"two");
    let third = send(b"three");
    assert!(first.machine_id().is_none());
    assert_eq!(proxied.sender.pending_count(), 2);
    assert_eq!(outcome(first).await, DeliveryOutcome::Failed(DeliveryError::Dropped));
    assert_eq!(bob.received_count(), 0);

    proxied.receiver.start();
    let (second, third) = tokio::join!(outcome(second), outcome(third));
    assert!(second.response().is_some());
    assert!(third.response().is_some());
    assert_eq!(proxied.sender.pending_count(), 0);
    assert_eq!(proxied.sender.state(), SenderState::Redirecting);

    let mut payloads: Vec<Vec<u8>> = bob
        .received
        .lock()
        .iter()
        .map(|p| p.payload().to_vec())
        .collect();
    payloads.sort();
    assert_eq!(payloads, vec![b"three".to_vec(), b"two".to_vec()]);
    println!("✓ Queue overflow dropped the oldest request, the rest went out");
}

#[tokio::test]
async fn test_stop_restores_identity_and_closes_route() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let router = start_router(&hub, ProxyConfig::default()).await;
    let proxied = proxy_roles(&net, &alice, proxy_config(&hub));
    go_online(&proxied).await;
    assert_eq!(router.route_count(), 1);

    proxied.receiver.stop();
    eventually("receiver offline", || {
        proxied.receiver.state() == ReceiverState::Offline
    })
    .await;
    eventually("route closed", || router.route_count() == 0).await;
    eventually("sender queueing again", || {
        proxied.sender.state() == SenderState::Router
    })
    .await;

    assert_eq!(alice.local.get().contacts(), [Contact::new(Protocol::Tcp, "alice")]);
    let published = net.published(&alice.idurl).await.unwrap();
    assert_eq!(published.contacts(), [Contact::new(Protocol::Tcp, "alice")]);
    assert!(alice.settings.get_string(KEY_MY_ORIGINAL_IDENTITY).unwrap().is_none());
    // the router is remembered for the next start
    assert!(alice.settings.get_string(KEY_CURRENT_ROUTER).unwrap().is_some());
    assert!(proxied.receiver.router_id().is_none());

    proxied.sender.stop();
    proxied.receiver.shutdown();
    eventually("receiver closed", || {
        proxied.receiver.state() == ReceiverState::Closed
    })
    .await;
    println!("✓ Stopping the receiver undid the route");
}
