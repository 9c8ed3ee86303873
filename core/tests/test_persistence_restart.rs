//! State that must survive a restart: the router's routes and the proxied
//! node's original identity.
//!
//! Run with: cargo test --test test_persistence_restart

mod common;

use common::{eventually, idurl, TestNet};
use courier_core::config::ProxyConfig;
use courier_core::identity::{Contact, Identity, IdentityKeys};
use courier_core::proxy::{ProxyReceiver, ProxyRouter, ReceiverState, Route, RouteTable, RouterState};
use courier_core::store::settings::{KEY_CURRENT_ROUTER, KEY_MY_ORIGINAL_IDENTITY};
use courier_core::store::{SettingsStore, SledStorage};
use courier_core::transport::Protocol;
use std::path::Path;
use std::sync::Arc;

fn sled_settings(path: &Path) -> SettingsStore {
    SettingsStore::new(Arc::new(SledStorage::open(path).unwrap()))
}

#[test]
fn test_routes_persist_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings");
    let keys = IdentityKeys::generate();
    let client = Identity::create(
        &keys,
        idurl("alice"),
        vec![idurl("alice")],
        vec![Contact::new(Protocol::Tcp, "alice:7771")],
        1,
    );

    // First instance: accept a client
    {
        let mut table = RouteTable::new(5, Some(sled_settings(&path)));
        table
            .upsert(Route::new(client.clone(), Some(Contact::new(Protocol::Tcp, "10.0.0.7:7771"))))
            .unwrap();
        assert_eq!(table.len(), 1);
    }
    // table dropped here, sled flushes

    // Second instance: the route is back
    {
        let mut table = RouteTable::new(5, Some(sled_settings(&path)));
        assert!(table.is_empty());
        assert_eq!(table.load().unwrap(), 1);
        let route = table.get(&idurl("alice")).unwrap();
        assert_eq!(route.identity, client);
        assert_eq!(route.delivery_contact().unwrap().host, "10.0.0.7:7771");

        assert!(table.remove(&idurl("alice")).unwrap().is_some());
    }

    // Third instance: the removal stuck
    {
        let mut table = RouteTable::new(5, Some(sled_settings(&path)));
        assert_eq!(table.load().unwrap(), 0);
    }
    println!("✓ Routes survived two restarts");
}

#[tokio::test]
async fn test_router_restart_reloads_routes_and_pins_identities() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let dir = tempfile::tempdir().unwrap();
    let settings = sled_settings(&dir.path().join("settings"));

    let router = ProxyRouter::new(&hub.gateway, ProxyConfig::default(), settings.clone());
    router.start();
    eventually("router listening", || router.state() == RouterState::Listen).await;

    let receiver = ProxyReceiver::new(
        &alice.gateway,
        ProxyConfig {
            preferred_routers: vec![hub.idurl.as_str().to_string()],
            ..Default::default()
        },
        alice.settings.clone(),
        net.directory.clone(),
    );
    receiver.start();
    eventually("alice routed", || receiver.is_listening()).await;
    assert_eq!(router.route_count(), 1);

    router.shutdown();
    eventually("router closed", || router.state() == RouterState::Closed).await;
    drop(router);
    hub.gateway.identities().stop_override(&alice.idurl);

    let restarted = ProxyRouter::new(&hub.gateway, ProxyConfig::default(), settings);
    restarted.start();
    eventually("router listening again", || {
        restarted.state() == RouterState::Listen
    })
    .await;
    assert_eq!(restarted.clients(), vec![alice.idurl.clone()]);
    assert!(hub.gateway.identities().is_overridden(&alice.idurl));
    let pinned = hub.gateway.identities().get(&alice.idurl).unwrap();
    assert_eq!(pinned.contacts(), [Contact::new(Protocol::Tcp, "alice")]);
    println!("✓ Restarted router knows its clients again");
}

#[tokio::test]
async fn test_receiver_undoes_leftover_identity_rewrite() {
    let net = TestNet::new();
    let hub = net.node("hub").await;
    let alice = net.node("alice").await;
    let router = ProxyRouter::new(&hub.gateway, ProxyConfig::default(), hub.settings.clone());
    router.start();
    eventually("router listening", || router.state() == RouterState::Listen).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings");

    // What a session that crashed while routed leaves behind.
    {
        let settings = sled_settings(&path);
        let original = alice.local.get().to_json().unwrap();
        settings
            .set_string(KEY_MY_ORIGINAL_IDENTITY, &String::from_utf8(original).unwrap())
            .unwrap();
        settings
            .set_string(KEY_CURRENT_ROUTER, &format!("{} tcp hub", hub.idurl))
            .unwrap();
    }
    alice
        .local
        .set_contacts(vec![Contact::new(Protocol::Tcp, "hub")]);
    assert_eq!(alice.local.get().revision(), 2);

    let settings = sled_settings(&path);
    let receiver = ProxyReceiver::new(
        &alice.gateway,
        ProxyConfig::default(),
        settings.clone(),
        net.directory.clone(),
    );
    eventually("receiver initialised", || {
        receiver.state() == ReceiverState::Offline
    })
    .await;
    assert_eq!(alice.local.get().contacts(), [Contact::new(Protocol::Tcp, "alice")]);
    assert!(settings.get_string(KEY_MY_ORIGINAL_IDENTITY).unwrap().is_none());
    let published = net.published(&alice.idurl).await.unwrap();
    assert_eq!(published.contacts(), [Contact::new(Protocol::Tcp, "alice")]);

    // No preferred routers and an empty directory: only the saved router
    // can be found.
    receiver.start();
    eventually("routed through the saved router", || receiver.is_listening()).await;
    assert_eq!(receiver.router_id(), Some(hub.idurl.clone()));
    assert_eq!(router.clients(), vec![alice.idurl.clone()]);
    println!("✓ Leftover rewrite undone, saved router reused");
}
