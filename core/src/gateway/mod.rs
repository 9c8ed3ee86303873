//! Gateway
//!
//! Single entry point for sending ([`Gateway::outbox`]) and for received
//! transfers ([`Gateway::inbox`]). Owns the installed transport adapters,
//! the inbound handler chain, the outbox filter chain and the correlation
//! index that routes responses back to their outbound machines.

pub mod stats;

pub use stats::{Counters, TrafficStats};

use crate::automat::{Automat, Runtime, StateFilter};
use crate::config::GatewayConfig;
use crate::crypto::KeyRing;
use crate::delivery::packet_in::{PacketIn, PacketInEvent};
use crate::delivery::packet_out::{PacketOut, PacketOutEvent};
use crate::delivery::{
    Callbacks, Delivery, DeliveryError, Joiners, OutboxOptions, OutboxRequest, RouteOverride,
    WorkItemReport,
};
use crate::identity::{Contact, IdUrl, Identity, IdentityCache, LocalIdentity};
use crate::packet::{Command, Packet, PacketBuilder};
use crate::transport::{
    AdapterState, InboundSink, Protocol, ReceivedTransfer, TransferId, TransferIds,
    TransferReport, TransferStatus, TransportAdapter, TransportDriver, TransportError,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Where an inbound packet came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundInfo {
    pub transfer_id: TransferId,
    pub proto: Protocol,
    /// Address the sender reported as its own.
    pub host: String,
}

impl InboundInfo {
    /// Route answering straight to the sender's address. Packets that came
    /// through a proxy router are answered the normal way.
    pub fn reply_route(&self) -> Option<RouteOverride> {
        match self.proto {
            Protocol::Proxy => None,
            proto => Some(RouteOverride::address(proto, self.host.clone())),
        }
    }
}

/// Handle for removing a registered handler, filter or observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Returns true to claim the packet and stop the chain.
pub type InboundHandler = Arc<dyn Fn(&Arc<Packet>, &InboundInfo) -> bool + Send + Sync>;
pub type OutboxFilter = Arc<dyn Fn(OutboxRequest) -> FilterVerdict + Send + Sync>;
pub type FinishObserver = Arc<dyn Fn(&WorkItemReport) + Send + Sync>;
pub type TransportObserver = Arc<dyn Fn(Protocol, AdapterState, AdapterState) + Send + Sync>;
type Waiter = Box<dyn FnOnce(&Arc<Packet>) + Send>;

pub enum FilterVerdict {
    /// Hand the request on to the next filter.
    Pass(OutboxRequest),
    /// The filter owns the request now and completes its callbacks.
    Taken,
}

struct OutboundEntry {
    automat: Automat<PacketOut>,
    command: Command,
    packet_id: String,
    remote_id: IdUrl,
    route_remote: Option<IdUrl>,
    interest: HashSet<Command>,
    joiners: Joiners,
}

impl OutboundEntry {
    /// Peers whose answer is accepted for this packet.
    fn expected_recipients(&self) -> Vec<&IdUrl> {
        let mut expected = vec![&self.remote_id];
        if let Some(route_remote) = &self.route_remote {
            if route_remote != &self.remote_id && self.command != Command::Retrieve {
                expected.push(route_remote);
            }
        }
        expected
    }
}

struct Registry<T> {
    entries: RwLock<Vec<(HandlerId, T)>>,
}

impl<T: Clone> Registry<T> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    fn insert(&self, id: HandlerId, position: Option<usize>, item: T) {
        let mut entries = self.entries.write();
        let index = position.unwrap_or(entries.len()).min(entries.len());
        entries.insert(index, (id, item));
    }

    fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<T> {
        self.entries.read().iter().map(|(_, item)| item.clone()).collect()
    }
}

struct GatewayInner {
    runtime: Runtime,
    config: GatewayConfig,
    local: LocalIdentity,
    me: IdUrl,
    identities: IdentityCache,
    ids: TransferIds,
    transports: RwLock<BTreeMap<Protocol, TransportAdapter>>,
    inbound_handlers: Registry<InboundHandler>,
    outbox_filters: Registry<OutboxFilter>,
    finish_observers: Registry<FinishObserver>,
    transport_observers: Registry<TransportObserver>,
    waiters: Mutex<HashMap<(IdUrl, String), Vec<Waiter>>>,
    outbound: Mutex<HashMap<u64, OutboundEntry>>,
    inbound: Mutex<HashMap<TransferId, Automat<PacketIn>>>,
    stats: Mutex<TrafficStats>,
    unhandled: Mutex<VecDeque<Arc<Packet>>>,
    next_handler: AtomicU64,
    shutting_down: AtomicBool,
}

/// Shared handle; clones refer to the same gateway.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(
        runtime: &Runtime,
        config: GatewayConfig,
        local: LocalIdentity,
        identities: IdentityCache,
    ) -> Self {
        let me = local.idurl();
        if let Err(e) = identities.remember(local.get().as_ref().clone()) {
            warn!("Own identity {} does not validate: {}", me, e);
        }
        info!("Gateway for {} created", me);
        Self {
            inner: Arc::new(GatewayInner {
                runtime: runtime.clone(),
                config,
                local,
                me,
                identities,
                ids: TransferIds::new(),
                transports: RwLock::new(BTreeMap::new()),
                inbound_handlers: Registry::new(),
                outbox_filters: Registry::new(),
                finish_observers: Registry::new(),
                transport_observers: Registry::new(),
                waiters: Mutex::new(HashMap::new()),
                outbound: Mutex::new(HashMap::new()),
                inbound: Mutex::new(HashMap::new()),
                stats: Mutex::new(TrafficStats::default()),
                unhandled: Mutex::new(VecDeque::new()),
                next_handler: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    fn from_weak(weak: &Weak<GatewayInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn me(&self) -> &IdUrl {
        &self.inner.me
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.inner.local
    }

    pub fn keyring(&self) -> &KeyRing {
        self.inner.local.keyring()
    }

    pub fn identities(&self) -> &IdentityCache {
        &self.inner.identities
    }

    /// Start a packet created and owned by this node.
    pub fn build(&self, command: Command) -> PacketBuilder {
        Packet::build(command, self.inner.me.clone())
    }

    pub fn next_transfer_id(&self) -> TransferId {
        self.inner.ids.next()
    }

    fn next_handler_id(&self) -> HandlerId {
        HandlerId(self.inner.next_handler.fetch_add(1, Ordering::SeqCst))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    // ========================================================================
    // TRANSPORT REGISTRY
    // ========================================================================

    /// Install a driver behind a new adapter. Replaces (and shuts down) an
    /// adapter already installed for the same protocol.
    pub fn attach(&self, driver: Arc<dyn TransportDriver>) -> TransportAdapter {
        let proto = driver.protocol();
        let runtime = self.inner.runtime.clone();
        let ids = self.inner.ids.clone();

        let begin_weak = Arc::downgrade(&self.inner);
        let begin_runtime = runtime.clone();
        let begin_ids = ids.clone();
        let finish_weak = Arc::downgrade(&self.inner);
        let finish_runtime = runtime.clone();
        let sink = InboundSink::new(
            move |host, expected_size| {
                let transfer_id = begin_ids.next();
                let weak = begin_weak.clone();
                let host = host.to_string();
                begin_runtime.post(move || {
                    if let Some(gateway) = Gateway::from_weak(&weak) {
                        gateway.receiving_started(transfer_id, proto, host, expected_size);
                    }
                });
                transfer_id
            },
            move |transfer| {
                let weak = finish_weak.clone();
                finish_runtime.post(move || {
                    if let Some(gateway) = Gateway::from_weak(&weak) {
                        gateway.inbox(transfer);
                    }
                });
            },
        );

        let adapter = TransportAdapter::new(&runtime, driver, ids, sink);
        let weak = Arc::downgrade(&self.inner);
        adapter.add_observer(StateFilter::any(), move |old, new| {
            if let Some(gateway) = Gateway::from_weak(&weak) {
                for observer in gateway.inner.transport_observers.snapshot() {
                    observer(proto, old, new);
                }
            }
        });
        if let Some(previous) = self.inner.transports.write().insert(proto, adapter.clone()) {
            info!("Replacing installed {} transport", proto);
            previous.shutdown();
        }
        info!("{} transport attached", proto);
        adapter
    }

    pub fn detach(&self, proto: Protocol) -> bool {
        match self.inner.transports.write().remove(&proto) {
            Some(adapter) => {
                adapter.shutdown();
                info!("{} transport detached", proto);
                true
            }
            None => false,
        }
    }

    pub fn transport(&self, proto: Protocol) -> Option<TransportAdapter> {
        self.inner.transports.read().get(&proto).cloned()
    }

    pub fn transports(&self) -> Vec<TransportAdapter> {
        self.inner.transports.read().values().cloned().collect()
    }

    pub fn is_installed(&self, proto: Protocol) -> bool {
        self.inner.transports.read().contains_key(&proto)
    }

    pub fn is_listening(&self, proto: Protocol) -> bool {
        self.transport(proto).map_or(false, |a| a.is_listening())
    }

    /// Listening and not disabled for sending.
    pub fn can_send(&self, proto: Protocol) -> bool {
        self.is_listening(proto) && !self.inner.config.send_disabled.contains(&proto)
    }

    pub fn start_transports(&self) {
        for adapter in self.transports() {
            adapter.start();
        }
    }

    pub fn stop_transports(&self) {
        for adapter in self.transports() {
            adapter.stop();
        }
    }

    /// Contacts of every listening adapter, in protocol order.
    pub fn local_contacts(&self) -> Vec<Contact> {
        self.transports()
            .iter()
            .filter(|a| a.is_listening())
            .flat_map(|a| a.contacts())
            .collect()
    }

    pub fn add_transport_observer(
        &self,
        observer: impl Fn(Protocol, AdapterState, AdapterState) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.next_handler_id();
        self.inner
            .transport_observers
            .insert(id, None, Arc::new(observer));
        id
    }

    pub fn remove_transport_observer(&self, id: HandlerId) -> bool {
        self.inner.transport_observers.remove(id)
    }

    /// Hand bytes to the adapter of `proto`.
    pub(crate) fn send_work(
        &self,
        proto: Protocol,
        data: Arc<Vec<u8>>,
        host: &str,
        description: &str,
        on_done: impl FnOnce(TransferReport) + Send + 'static,
    ) -> Result<TransferId, TransportError> {
        let adapter = self
            .transport(proto)
            .ok_or(TransportError::NotInstalled(proto))?;
        adapter.send(data, host, description, on_done)
    }

    pub(crate) fn cancel_transfer(&self, proto: Protocol, transfer_id: TransferId) -> bool {
        self.transport(proto)
            .map_or(false, |adapter| adapter.cancel(transfer_id))
    }

    // ========================================================================
    // CALLBACK REGISTRIES
    // ========================================================================

    pub fn append_inbound_handler(
        &self,
        handler: impl Fn(&Arc<Packet>, &InboundInfo) -> bool + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.next_handler_id();
        self.inner.inbound_handlers.insert(id, None, Arc::new(handler));
        id
    }

    pub fn insert_inbound_handler(
        &self,
        position: usize,
        handler: impl Fn(&Arc<Packet>, &InboundInfo) -> bool + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.next_handler_id();
        self.inner
            .inbound_handlers
            .insert(id, Some(position), Arc::new(handler));
        id
    }

    pub fn remove_inbound_handler(&self, id: HandlerId) -> bool {
        self.inner.inbound_handlers.remove(id)
    }

    pub fn insert_outbox_filter(
        &self,
        position: usize,
        filter: impl Fn(OutboxRequest) -> FilterVerdict + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.next_handler_id();
        self.inner
            .outbox_filters
            .insert(id, Some(position), Arc::new(filter));
        id
    }

    pub fn remove_outbox_filter(&self, id: HandlerId) -> bool {
        self.inner.outbox_filters.remove(id)
    }

    pub fn add_finish_observer(
        &self,
        observer: impl Fn(&WorkItemReport) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.next_handler_id();
        self.inner
            .finish_observers
            .insert(id, None, Arc::new(observer));
        id
    }

    pub fn remove_finish_observer(&self, id: HandlerId) -> bool {
        self.inner.finish_observers.remove(id)
    }

    /// Call `waiter` once with the next valid packet `creator` sends under
    /// `packet_id`. The waiter claims that packet.
    pub fn await_packet(
        &self,
        creator: IdUrl,
        packet_id: impl Into<String>,
        waiter: impl FnOnce(&Arc<Packet>) + Send + 'static,
    ) {
        self.inner
            .waiters
            .lock()
            .entry((creator, packet_id.into()))
            .or_default()
            .push(Box::new(waiter));
    }

    // ========================================================================
    // OUTBOUND
    // ========================================================================

    /// Send `packet`. The returned [`Delivery`] resolves once the request
    /// reached a terminal state.
    pub fn outbox(
        &self,
        packet: impl Into<Arc<Packet>>,
        options: OutboxOptions,
        callbacks: Callbacks,
    ) -> Delivery {
        let mut callbacks = callbacks;
        let rx = callbacks.channel();
        let request = OutboxRequest::new(packet.into(), options, callbacks);
        let machine = self.submit(request);
        Delivery::new(machine, rx)
    }

    /// Run the outbox filters, then start delivery unless a filter took it.
    pub fn submit(&self, request: OutboxRequest) -> Option<u64> {
        if self.is_shutting_down() {
            request.fail(DeliveryError::Shutdown);
            return None;
        }
        let mut request = request;
        for filter in self.inner.outbox_filters.snapshot() {
            match filter(request) {
                FilterVerdict::Pass(passed) => request = passed,
                FilterVerdict::Taken => return None,
            }
        }
        Some(self.send_request(request))
    }

    /// Start delivery without consulting the filters. A request matching a
    /// live machine joins it instead.
    pub fn send_request(&self, mut request: OutboxRequest) -> u64 {
        let packet = request.packet.clone();
        let joined = {
            let mut outbound = self.inner.outbound.lock();
            outbound
                .iter_mut()
                .find(|(_, entry)| {
                    entry.command == packet.command()
                        && entry.packet_id == packet.packet_id()
                        && &entry.remote_id == packet.remote_id()
                })
                .map(|(id, entry)| {
                    entry.interest.extend(request.callbacks.interest());
                    let callbacks = std::mem::take(&mut request.callbacks);
                    (*id, entry.joiners.join(callbacks))
                })
        };
        match joined {
            Some((id, Ok(()))) => {
                debug!("{} already in flight as {}, joining", packet, id);
                return id;
            }
            Some((id, Err((mut callbacks, outcome)))) => {
                debug!("{} finished as {} while joining", packet, id);
                callbacks.complete(&outcome);
                return id;
            }
            None => {}
        }

        let entry_template = (
            packet.command(),
            packet.packet_id().to_string(),
            packet.remote_id().clone(),
            request
                .options
                .route
                .as_ref()
                .and_then(|r| r.remote_id.clone()),
            request.callbacks.interest(),
        );
        let joiners = Joiners::new();
        let automat = PacketOut::spawn(self, request, joiners.clone());
        let id = automat.id();
        let (command, packet_id, remote_id, route_remote, interest) = entry_template;
        self.inner.outbound.lock().insert(
            id,
            OutboundEntry {
                automat: automat.clone(),
                command,
                packet_id,
                remote_id,
                route_remote,
                interest: interest.into_iter().collect(),
                joiners,
            },
        );
        automat.post(PacketOutEvent::Run);
        id
    }

    /// Ack or Fail `original`, answering through the address it came from
    /// when that is known.
    pub fn reply(
        &self,
        command: Command,
        original: &Packet,
        payload: impl Into<Vec<u8>>,
        info: Option<&InboundInfo>,
    ) -> Delivery {
        let packet = self
            .build(command)
            .packet_id(original.packet_id())
            .remote(original.creator_id().clone())
            .payload(payload)
            .sign(self.keyring());
        let options = OutboxOptions {
            route: info.and_then(|i| i.reply_route()),
            ..Default::default()
        };
        self.outbox(packet, options, Callbacks::new())
    }

    pub fn send_ack(
        &self,
        original: &Packet,
        payload: impl Into<Vec<u8>>,
        info: Option<&InboundInfo>,
    ) -> Delivery {
        self.reply(Command::Ack, original, payload, info)
    }

    pub fn send_fail(
        &self,
        original: &Packet,
        reason: impl Into<Vec<u8>>,
        info: Option<&InboundInfo>,
    ) -> Delivery {
        self.reply(Command::Fail, original, reason, info)
    }

    pub(crate) fn report_work_item(&self, report: WorkItemReport) {
        {
            let mut stats = self.inner.stats.lock();
            let ok = report.status == TransferStatus::Finished;
            stats.outbound(&report.remote_id, report.proto, report.bytes, ok);
            if ok {
                stats.mark_working(&report.remote_id, report.proto);
            }
        }
        for observer in self.inner.finish_observers.snapshot() {
            observer(&report);
        }
    }

    pub(crate) fn outbound_finished(&self, machine: u64) {
        self.inner.outbound.lock().remove(&machine);
    }

    /// Outbound machines still running.
    pub fn outbound_count(&self) -> usize {
        self.inner.outbound.lock().len()
    }

    /// WorkItems tracked by live outbound machines. Must not be called from
    /// inside an outbound machine's own transition.
    pub fn tracked_work_items(&self) -> usize {
        let machines: Vec<Automat<PacketOut>> = self
            .inner
            .outbound
            .lock()
            .values()
            .map(|entry| entry.automat.clone())
            .collect();
        machines
            .iter()
            .map(|automat| automat.with(|machine| machine.tracked_items()))
            .sum()
    }

    /// Cancel one outbound machine.
    pub fn cancel_outbound(&self, machine: u64) -> bool {
        let automat = self
            .inner
            .outbound
            .lock()
            .get(&machine)
            .map(|entry| entry.automat.clone());
        match automat {
            Some(automat) => {
                automat.post(PacketOutEvent::Cancel);
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    fn receiving_started(
        &self,
        transfer_id: TransferId,
        proto: Protocol,
        host: String,
        expected_size: Option<u64>,
    ) -> Automat<PacketIn> {
        let info = InboundInfo {
            transfer_id,
            proto,
            host,
        };
        let automat = PacketIn::spawn(self, info, expected_size);
        self.inner
            .inbound
            .lock()
            .insert(transfer_id, automat.clone());
        automat.post(PacketInEvent::Start);
        automat
    }

    /// An adapter finished receiving a transfer.
    pub fn inbox(&self, transfer: ReceivedTransfer) {
        let existing = self
            .inner
            .inbound
            .lock()
            .get(&transfer.transfer_id)
            .cloned();
        let automat = match existing {
            Some(automat) => automat,
            None => self.receiving_started(
                transfer.transfer_id,
                transfer.proto,
                transfer.host.clone(),
                transfer.expected_size,
            ),
        };
        automat.post(PacketInEvent::Finished(transfer));
    }

    /// Feed bytes that arrived some other way (e.g. unwrapped from a relay)
    /// through inbound delivery.
    pub fn inject(&self, proto: Protocol, host: impl Into<String>, data: Vec<u8>) -> TransferId {
        let transfer_id = self.next_transfer_id();
        let size = data.len() as u64;
        self.inbox(ReceivedTransfer {
            transfer_id,
            proto,
            host: host.into(),
            status: TransferStatus::Finished,
            expected_size: Some(size),
            data,
            error: None,
        });
        transfer_id
    }

    pub(crate) fn inbound_finished(
        &self,
        info: &InboundInfo,
        peer: Option<&IdUrl>,
        ok: bool,
    ) {
        self.inner.inbound.lock().remove(&info.transfer_id);
        if !ok {
            self.inner.stats.lock().inbound(peer, info.proto, 0, false);
        }
    }

    pub fn inbound_count(&self) -> usize {
        self.inner.inbound.lock().len()
    }

    /// Deliver a verified packet: correlate it with outbound machines, run
    /// the waiters and the handler chain. Returns whether anyone took it.
    pub(crate) fn dispatch_inbound(&self, packet: Arc<Packet>, info: &InboundInfo) -> bool {
        {
            let mut stats = self.inner.stats.lock();
            stats.inbound(
                Some(packet.creator_id()),
                info.proto,
                packet.payload().len() as u64,
                true,
            );
            stats.mark_working(packet.creator_id(), info.proto);
        }

        let correlated = packet.command() != Command::Relay && self.correlate(&packet);
        let awaited = self.run_waiters(&packet);
        let claimed = self
            .inner
            .inbound_handlers
            .snapshot()
            .into_iter()
            .any(|handler| handler(&packet, info));
        let mut handled = correlated || awaited || claimed;

        if !handled && packet.command() == Command::Identity && packet.remote_id() == self.me() {
            handled = self.accept_identity(&packet, info);
        }
        if !handled {
            debug!("Unhandled {} from {} via {}", packet, packet.creator_id(), info.proto);
            let mut unhandled = self.inner.unhandled.lock();
            unhandled.push_back(packet);
            while unhandled.len() > self.inner.config.unhandled_history {
                unhandled.pop_front();
            }
        }
        handled
    }

    fn correlate(&self, packet: &Arc<Packet>) -> bool {
        let me = self.me();
        let matches: Vec<Automat<PacketOut>> = self
            .inner
            .outbound
            .lock()
            .values()
            .filter(|entry| {
                entry.packet_id == packet.packet_id()
                    && packet.command().is_ack_of(entry.command)
                    && entry.interest.contains(&packet.command())
            })
            .filter(|entry| {
                let expected = entry.expected_recipients();
                let to_me = packet.remote_id() == me
                    && (expected.contains(&packet.owner_id())
                        || expected.contains(&packet.creator_id()));
                let my_data_back = packet.owner_id() == me
                    && packet.command() == Command::Data
                    && expected.contains(&packet.remote_id());
                to_me || my_data_back
            })
            .map(|entry| entry.automat.clone())
            .collect();
        for automat in &matches {
            trace!("{} correlated with {:?}", packet, automat);
            automat.post(PacketOutEvent::InboxPacket(packet.clone()));
        }
        !matches.is_empty()
    }

    fn run_waiters(&self, packet: &Arc<Packet>) -> bool {
        let key = (packet.creator_id().clone(), packet.packet_id().to_string());
        let waiters = self.inner.waiters.lock().remove(&key);
        match waiters {
            Some(waiters) => {
                for waiter in waiters {
                    waiter(packet);
                }
                true
            }
            None => false,
        }
    }

    /// Default handling of an `Identity` packet nobody claimed: cache the
    /// document and acknowledge it.
    fn accept_identity(&self, packet: &Arc<Packet>, info: &InboundInfo) -> bool {
        let identity = match Identity::from_json(packet.payload()) {
            Ok(identity) if identity.idurl() == packet.creator_id() => identity,
            Ok(identity) => {
                warn!(
                    "{} from {} carries identity of {}",
                    packet,
                    packet.creator_id(),
                    identity.idurl()
                );
                return false;
            }
            Err(e) => {
                warn!("{} from {} carries a bad identity: {}", packet, packet.creator_id(), e);
                return false;
            }
        };
        match self.inner.identities.remember(identity) {
            Ok(_) => {
                self.send_ack(packet, Vec::new(), Some(info));
                true
            }
            Err(e) => {
                warn!("Identity from {} rejected: {}", packet.creator_id(), e);
                false
            }
        }
    }

    /// Packets nobody handled, oldest first.
    pub fn unhandled(&self) -> Vec<Arc<Packet>> {
        self.inner.unhandled.lock().iter().cloned().collect()
    }

    // ========================================================================
    // COUNTERS
    // ========================================================================

    pub fn stats(&self) -> TrafficStats {
        self.inner.stats.lock().clone()
    }

    /// Protocols that recently worked with `peer`, most recent first.
    pub fn working_protocols(&self, peer: &IdUrl) -> Vec<Protocol> {
        self.inner.stats.lock().working(peer)
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    /// Cancel every machine and shut every adapter down.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let outbound: Vec<Automat<PacketOut>> = self
            .inner
            .outbound
            .lock()
            .values()
            .map(|entry| entry.automat.clone())
            .collect();
        let inbound: Vec<Automat<PacketIn>> =
            self.inner.inbound.lock().values().cloned().collect();
        info!(
            "Gateway shutting down: {} outbound, {} inbound in flight",
            outbound.len(),
            inbound.len()
        );
        for automat in outbound {
            automat.post(PacketOutEvent::Cancel);
        }
        for automat in inbound {
            automat.post(PacketInEvent::Cancel);
        }
        for adapter in self.transports() {
            adapter.shutdown();
        }
        self.inner.waiters.lock().clear();
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("me", &self.inner.me)
            .field("transports", &self.inner.transports.read().keys().collect::<Vec<_>>())
            .field("outbound", &self.outbound_count())
            .field("inbound", &self.inbound_count())
            .finish()
    }
}

