//! Node assembly
//!
//! Wires storage, identity, gateway, transports and the proxy roles
//! together from a [`CourierConfig`]. Everything is owned by the [`Node`];
//! two nodes in one process share nothing unless told to.

use crate::automat::Runtime;
use crate::config::CourierConfig;
use crate::dht::{PeerDirectory, StaticDirectory};
use crate::gateway::{Gateway, HandlerId};
use crate::identity::{
    HttpFetcher, IdUrl, Identity, IdentityCache, IdentityFetcher, IdentityKeys, LocalIdentity,
};
use crate::proxy::{ProxyReceiver, ProxyRouter, ProxySender};
use crate::store::{MemoryStorage, SettingsStore, SledStorage, StorageBackend, StorageError};
use crate::transport::{
    AdapterState, MemoryDriver, MemoryNetwork, Protocol, TcpDriver, TcpDriverConfig,
    TransportDriver,
};
use crate::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SETTINGS_DB: &str = "settings";

pub struct NodeBuilder {
    idurl: IdUrl,
    config: CourierConfig,
    keys: Option<IdentityKeys>,
    runtime: Option<Runtime>,
    directory: Option<Arc<dyn PeerDirectory>>,
    fetcher: Option<Arc<dyn IdentityFetcher>>,
    storage: Option<Arc<dyn StorageBackend>>,
    drivers: Vec<Arc<dyn TransportDriver>>,
    memory: Option<(MemoryNetwork, Protocol)>,
}

impl NodeBuilder {
    pub fn new(idurl: IdUrl, config: CourierConfig) -> Self {
        Self {
            idurl,
            config,
            keys: None,
            runtime: None,
            directory: None,
            fetcher: None,
            storage: None,
            drivers: Vec::new(),
            memory: None,
        }
    }

    /// Keys of this node; fresh ones are generated otherwise.
    pub fn keys(mut self, keys: IdentityKeys) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn runtime(mut self, runtime: &Runtime) -> Self {
        self.runtime = Some(runtime.clone());
        self
    }

    pub fn directory(mut self, directory: Arc<dyn PeerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Where identity documents come from. Plain HTTP by default.
    pub fn fetcher(mut self, fetcher: Arc<dyn IdentityFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn storage(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(backend);
        self
    }

    pub fn driver(mut self, driver: Arc<dyn TransportDriver>) -> Self {
        self.drivers.push(driver);
        self
    }

    /// Join an in-process network as `proto`, under the configured memory
    /// host (or the idurl when none is set).
    pub fn memory(mut self, network: &MemoryNetwork, proto: Protocol) -> Self {
        self.memory = Some((network.clone(), proto));
        self
    }

    fn open_storage(&self) -> Result<Arc<dyn StorageBackend>> {
        if let Some(backend) = &self.storage {
            return Ok(backend.clone());
        }
        if self.config.storage.in_memory {
            return Ok(Arc::new(MemoryStorage::new()));
        }
        let dir = self.config.storage.resolve_data_dir()?;
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::Open {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        let sled = SledStorage::open(dir.join(SETTINGS_DB))?;
        info!("Settings stored in {}", dir.display());
        Ok(Arc::new(sled))
    }

    pub fn build(self) -> Result<Node> {
        self.config.validate()?;
        let storage = self.open_storage()?;
        let NodeBuilder {
            idurl,
            config,
            keys,
            runtime,
            directory,
            fetcher,
            drivers,
            memory,
            ..
        } = self;

        let runtime = runtime.unwrap_or_default();
        let settings = SettingsStore::new(storage);
        let directory: Arc<dyn PeerDirectory> =
            directory.unwrap_or_else(|| Arc::new(StaticDirectory::new()));
        let fetcher: Arc<dyn IdentityFetcher> =
            fetcher.unwrap_or_else(|| Arc::new(HttpFetcher::default()));

        let local = LocalIdentity::new(
            keys.unwrap_or_else(IdentityKeys::generate),
            idurl.clone(),
            Vec::new(),
        );
        let announcer = directory.clone();
        local.on_change(move |identity: &Arc<Identity>| {
            if let Err(e) = announcer.announce(identity) {
                warn!("Failed to publish identity revision {}: {}", identity.revision(), e);
            }
        });
        let identities = IdentityCache::new(&runtime, fetcher);
        let gateway = Gateway::new(&runtime, config.gateway.clone(), local, identities);

        let transports = &config.transports;
        if let Some(bind) = &transports.tcp_bind {
            gateway.attach(Arc::new(TcpDriver::new(TcpDriverConfig {
                bind: bind.clone(),
                advertise: transports.tcp_advertise.clone(),
                connect_timeout: Duration::from_secs(transports.tcp_connect_timeout_secs),
                ..Default::default()
            })));
        }
        if let Some((network, proto)) = memory {
            let host = transports
                .memory_host
                .clone()
                .unwrap_or_else(|| idurl.to_string());
            gateway.attach(Arc::new(MemoryDriver::new(&network, proto, host)));
        }
        for driver in drivers {
            gateway.attach(driver);
        }

        let proxy = &config.proxy;
        let router = proxy
            .router_enabled
            .then(|| ProxyRouter::new(&gateway, proxy.clone(), settings.clone()));
        let receiver = proxy.receiver_enabled.then(|| {
            ProxyReceiver::new(&gateway, proxy.clone(), settings.clone(), directory.clone())
        });
        let sender = receiver
            .as_ref()
            .map(|receiver| ProxySender::new(&gateway, proxy.clone(), receiver));

        let started = Arc::new(AtomicBool::new(false));
        let observer = {
            let gateway_ref = gateway.clone();
            let receiver = receiver.clone();
            let started = started.clone();
            gateway.add_transport_observer(move |_, old, new| {
                let listening = new == AdapterState::Listening;
                if !listening && old != AdapterState::Listening {
                    return;
                }
                let routed = receiver.as_ref().map_or(false, |r| r.is_listening());
                if !routed {
                    gateway_ref.local().set_contacts(gateway_ref.local_contacts());
                }
                if listening && started.load(Ordering::SeqCst) {
                    if let Some(receiver) = &receiver {
                        receiver.start();
                    }
                }
            })
        };

        info!("Node {} assembled with {} transport(s)", idurl, gateway.transports().len());
        Ok(Node {
            runtime,
            config,
            settings,
            directory,
            gateway,
            router,
            receiver,
            sender,
            started,
            observer,
            event_loop: Mutex::new(None),
        })
    }
}

/// One running courier node.
pub struct Node {
    runtime: Runtime,
    config: CourierConfig,
    settings: SettingsStore,
    directory: Arc<dyn PeerDirectory>,
    gateway: Gateway,
    router: Option<ProxyRouter>,
    receiver: Option<ProxyReceiver>,
    sender: Option<ProxySender>,
    started: Arc<AtomicBool>,
    observer: HandlerId,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn builder(idurl: IdUrl, config: CourierConfig) -> NodeBuilder {
        NodeBuilder::new(idurl, config)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.directory
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn idurl(&self) -> &IdUrl {
        self.gateway.me()
    }

    pub fn router(&self) -> Option<&ProxyRouter> {
        self.router.as_ref()
    }

    pub fn receiver(&self) -> Option<&ProxyReceiver> {
        self.receiver.as_ref()
    }

    pub fn sender(&self) -> Option<&ProxySender> {
        self.sender.as_ref()
    }

    /// Spawn the event loop on the current tokio runtime and start every
    /// component. The receiver starts once a transport listens.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.event_loop.lock() = Some(self.runtime.start());
        self.gateway.start_transports();
        if let Some(router) = &self.router {
            router.start();
        }
        if let Some(sender) = &self.sender {
            sender.start();
        }
        if let Some(receiver) = &self.receiver {
            if self.gateway.transports().iter().any(|a| a.is_listening()) {
                receiver.start();
            }
        }
        info!("Node {} started", self.idurl());
    }

    /// Shut the proxy roles down, then the gateway. Everything runs on the
    /// loop in that order.
    pub fn shutdown(&self) {
        self.gateway.remove_transport_observer(self.observer);
        if let Some(sender) = &self.sender {
            sender.shutdown();
        }
        if let Some(receiver) = &self.receiver {
            receiver.shutdown();
        }
        if let Some(router) = &self.router {
            router.shutdown();
        }
        let gateway = self.gateway.clone();
        self.runtime.post(move || gateway.shutdown());
        info!("Node {} shutting down", self.idurl());
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("idurl", self.idurl())
            .field("router", &self.router)
            .field("receiver", &self.receiver)
            .field("sender", &self.sender)
            .finish()
    }
}
