// Shared harness: several nodes on one in-process network
#![allow(dead_code)]

use courier_core::automat::Runtime;
use courier_core::config::GatewayConfig;
use courier_core::delivery::{Delivery, DeliveryOutcome};
use courier_core::dht::StaticDirectory;
use courier_core::gateway::Gateway;
use courier_core::identity::{
    Contact, DirectoryFetcher, IdUrl, Identity, IdentityCache, IdentityKeys, LocalIdentity,
};
use courier_core::packet::{Command, Packet};
use courier_core::store::SettingsStore;
use courier_core::transport::{MemoryDriver, MemoryNetwork, Protocol};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("courier_core=debug")
        .with_test_writer()
        .try_init();
}

pub fn idurl(name: &str) -> IdUrl {
    IdUrl::new(format!("http://id.local/{}.xml", name))
}

pub struct TestNet {
    pub runtime: Runtime,
    pub network: MemoryNetwork,
    pub directory: Arc<StaticDirectory>,
    event_loop: JoinHandle<()>,
}

impl TestNet {
    /// Must be called inside a tokio runtime; the event loop is spawned on it.
    pub fn new() -> Self {
        init_tracing();
        let runtime = Runtime::new();
        let event_loop = runtime.start();
        Self {
            runtime,
            network: MemoryNetwork::new(),
            directory: Arc::new(StaticDirectory::new()),
            event_loop,
        }
    }

    pub async fn node(&self, name: &str) -> TestNode {
        self.build(name, &[Protocol::Tcp], GatewayConfig::default(), true)
            .await
    }

    pub async fn node_with(&self, name: &str, config: GatewayConfig) -> TestNode {
        self.build(name, &[Protocol::Tcp], config, true).await
    }

    pub async fn node_on(&self, name: &str, protocols: &[Protocol]) -> TestNode {
        self.build(name, protocols, GatewayConfig::default(), true)
            .await
    }

    /// A node nobody can look up in the directory.
    pub async fn stranger(&self, name: &str) -> TestNode {
        self.build(name, &[Protocol::Tcp], GatewayConfig::default(), false)
            .await
    }

    async fn build(
        &self,
        name: &str,
        protocols: &[Protocol],
        config: GatewayConfig,
        publish: bool,
    ) -> TestNode {
        let keys = IdentityKeys::generate();
        let contacts: Vec<Contact> = protocols
            .iter()
            .map(|proto| Contact::new(*proto, host(name, *proto)))
            .collect();
        let local = LocalIdentity::new(keys, idurl(name), contacts);
        if publish {
            self.directory.publish(&local.get()).unwrap();
            let directory = self.directory.clone();
            local.on_change(move |identity| directory.publish(identity).unwrap());
        }

        let fetcher = Arc::new(DirectoryFetcher::new(self.directory.clone()));
        let identities = IdentityCache::new(&self.runtime, fetcher);
        let gateway = Gateway::new(&self.runtime, config, local.clone(), identities);
        for proto in protocols {
            gateway.attach(Arc::new(MemoryDriver::new(
                &self.network,
                *proto,
                host(name, *proto),
            )));
        }
        gateway.start_transports();
        let listening = || protocols.iter().all(|proto| gateway.is_listening(*proto));
        eventually(&format!("{} transports listening", name), listening).await;

        TestNode {
            name: name.to_string(),
            idurl: idurl(name),
            local,
            gateway,
            settings: SettingsStore::in_memory(),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn published(&self, idurl: &IdUrl) -> Option<Identity> {
        use courier_core::dht::PeerDirectory;
        let raw = self.directory.lookup(idurl).await?;
        Identity::from_json(&raw).ok()
    }
}

impl Drop for TestNet {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

pub fn host(name: &str, proto: Protocol) -> String {
    match proto {
        Protocol::Tcp => name.to_string(),
        other => format!("{}-{}", name, other),
    }
}

pub struct TestNode {
    pub name: String,
    pub idurl: IdUrl,
    pub local: LocalIdentity,
    pub gateway: Gateway,
    pub settings: SettingsStore,
    /// Data packets taken by [`TestNode::ack_data`].
    pub received: Arc<Mutex<Vec<Arc<Packet>>>>,
}

impl TestNode {
    pub fn data_for(&self, to: &TestNode, payload: &[u8]) -> Packet {
        self.gateway
            .build(Command::Data)
            .remote(to.idurl.clone())
            .payload(payload.to_vec())
            .sign(self.gateway.keyring())
    }

    /// Take every Data packet addressed here, record it and acknowledge it.
    pub fn ack_data(&self) {
        let gateway = self.gateway.clone();
        let received = self.received.clone();
        self.gateway.append_inbound_handler(move |packet, info| {
            if packet.command() != Command::Data || packet.remote_id() != gateway.me() {
                return false;
            }
            received.lock().push(packet.clone());
            gateway.send_ack(packet, b"ok".to_vec(), Some(info));
            true
        });
    }

    /// Take every Data packet addressed here without answering.
    pub fn swallow_data(&self) {
        let gateway = self.gateway.clone();
        let received = self.received.clone();
        self.gateway.append_inbound_handler(move |packet, _| {
            if packet.command() != Command::Data || packet.remote_id() != gateway.me() {
                return false;
            }
            received.lock().push(packet.clone());
            true
        });
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }
}

/// Poll `check` until it holds; panics after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub async fn outcome_within(delivery: Delivery, limit: Duration) -> DeliveryOutcome {
    tokio::time::timeout(limit, delivery.outcome())
        .await
        .expect("delivery did not finish in time")
}

pub async fn outcome(delivery: Delivery) -> DeliveryOutcome {
    outcome_within(delivery, Duration::from_secs(5)).await
}
