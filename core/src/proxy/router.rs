// Proxy router: stands in for clients that cannot be reached directly
//
//   AT_STARTUP -> STOPPED -> TRANSPORTS? -> LISTEN -> STOPPED | CLOSED

use super::envelope::RoutedPayload;
use super::routes::{Route, RouteTable};
use super::{
    ProxyError, ServiceRequest, REASON_ACCEPTED, REASON_BAD_REQUEST, REASON_ROUTED_FAILED,
    REASON_ROUTE_NOT_EXIST, REASON_TOO_MANY_ROUTES,
};
use crate::automat::{Automat, Context, Machine};
use crate::config::ProxyConfig;
use crate::delivery::{Callbacks, DeliveryOutcome, OutboxOptions, RouteOverride};
use crate::gateway::{Gateway, HandlerId, InboundInfo};
use crate::identity::{Contact, IdUrl};
use crate::packet::{decode, encode, Command, Packet};
use crate::store::{RecentIds, SettingsStore};
use crate::transport::{AdapterState, Protocol};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterState {
    AtStartup,
    Stopped,
    /// Waiting for a transport to listen.
    Transports,
    Listen,
    Closed,
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouterState::AtStartup => "AT_STARTUP",
            RouterState::Stopped => "STOPPED",
            RouterState::Transports => "TRANSPORTS?",
            RouterState::Listen => "LISTEN",
            RouterState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum RouterEvent {
    Init,
    Start,
    Stop,
    TransportsReady,
    Shutdown,
}

struct RouterShared {
    gateway: Gateway,
    config: ProxyConfig,
    routes: Mutex<RouteTable>,
    recent: Mutex<RecentIds>,
    transport_observer: Mutex<Option<HandlerId>>,
}

fn dedup_key(direction: &str, packet: &Packet) -> String {
    format!(
        "{}:{}:{}:{}",
        direction,
        packet.command(),
        packet.packet_id(),
        packet.creator_id()
    )
}

fn seen_at(info: &InboundInfo) -> Option<Contact> {
    (info.proto != Protocol::Proxy).then(|| Contact::new(info.proto, info.host.clone()))
}

/// Tell whoever sent `packet` from outside that `client` could not be
/// reached. Owned by the client so the sender can match it.
fn fail_incoming(gateway: &Gateway, packet: &Packet, client: &IdUrl, info: &InboundInfo) {
    let fail = gateway
        .build(Command::Fail)
        .owner(client.clone())
        .packet_id(packet.packet_id())
        .remote(packet.creator_id().clone())
        .payload(REASON_ROUTED_FAILED)
        .sign(gateway.keyring());
    let options = OutboxOptions {
        route: info.reply_route(),
        ..Default::default()
    };
    gateway.outbox(fail, options, Callbacks::new());
}

impl RouterShared {
    /// Inbound handler while listening. Returns true for every packet the
    /// router takes care of.
    fn on_inbound(&self, packet: &Arc<Packet>, info: &InboundInfo) -> bool {
        let me = self.gateway.me();
        match packet.command() {
            Command::RequestService if packet.remote_id() == me => {
                self.request_service(packet, info)
            }
            Command::CancelService if packet.remote_id() == me => {
                self.cancel_service(packet, info)
            }
            Command::Relay if packet.remote_id() == me => {
                self.relay_outgoing(packet, info);
                true
            }
            _ if packet.remote_id() != me
                && packet.creator_id() != packet.remote_id()
                && self.routes.lock().contains(packet.remote_id()) =>
            {
                self.relay_incoming(packet, info);
                true
            }
            _ => false,
        }
    }

    fn request_service(&self, packet: &Arc<Packet>, info: &InboundInfo) -> bool {
        let request = match ServiceRequest::from_json(packet.payload()) {
            Ok(request) => request,
            Err(e) => {
                warn!("{} from {}: {}", packet, packet.creator_id(), e);
                self.gateway.send_fail(packet, REASON_BAD_REQUEST, Some(info));
                return true;
            }
        };
        if !request.is_proxy() {
            return false;
        }
        let identity = match request.payload.identity {
            Some(identity)
                if identity.idurl() == packet.creator_id() && identity.validate().is_ok() =>
            {
                identity
            }
            _ => {
                warn!("{} from {} carries no usable identity", packet, packet.creator_id());
                self.gateway.send_fail(packet, REASON_BAD_REQUEST, Some(info));
                return true;
            }
        };

        let client = identity.idurl().clone();
        let (result, active) = {
            let mut routes = self.routes.lock();
            let result = routes.upsert(Route::new(identity.clone(), seen_at(info)));
            (result, routes.len())
        };
        match result {
            Err(ProxyError::TooManyRoutes) => {
                info!(
                    "Refused route for {}: {} route(s) already",
                    client, self.config.max_routes
                );
                self.gateway
                    .send_fail(packet, REASON_TOO_MANY_ROUTES, Some(info));
                return true;
            }
            Err(e) => error!("Route for {} kept in memory only: {}", client, e),
            Ok(()) => {}
        }
        if let Err(e) = self.gateway.identities().override_identity(identity) {
            warn!("Could not pin identity of {}: {}", client, e);
        }
        info!("Route accepted for {} ({} active)", client, active);
        self.gateway.send_ack(packet, REASON_ACCEPTED, Some(info));
        true
    }

    fn cancel_service(&self, packet: &Arc<Packet>, info: &InboundInfo) -> bool {
        match ServiceRequest::from_json(packet.payload()) {
            Ok(request) if request.is_proxy() => {}
            Ok(_) => return false,
            Err(e) => {
                warn!("{} from {}: {}", packet, packet.creator_id(), e);
                self.gateway.send_fail(packet, REASON_BAD_REQUEST, Some(info));
                return true;
            }
        }
        let client = packet.creator_id();
        let removed = self.routes.lock().remove(client);
        match removed {
            Ok(Some(_)) => {
                self.gateway.identities().stop_override(client);
                info!("Route closed for {}", client);
                self.gateway.send_ack(packet, REASON_ACCEPTED, Some(info));
            }
            Ok(None) => {
                debug!("CancelService from {} without a route", client);
                self.gateway
                    .send_fail(packet, REASON_ROUTE_NOT_EXIST, Some(info));
            }
            Err(e) => {
                error!("Route for {} removed in memory only: {}", client, e);
                self.gateway.identities().stop_override(client);
                self.gateway.send_ack(packet, REASON_ACCEPTED, Some(info));
            }
        }
        true
    }

    /// A client hands over a packet for the outside world.
    fn relay_outgoing(&self, relay: &Arc<Packet>, info: &InboundInfo) {
        let client = relay.creator_id();
        let known = self.routes.lock().touch(client, seen_at(info));
        if !known {
            warn!("Relay from {} without a route", client);
            self.gateway
                .send_fail(relay, REASON_ROUTE_NOT_EXIST, Some(info));
            return;
        }

        let routed = match RoutedPayload::open(self.gateway.keyring(), relay.payload()) {
            Ok(routed) => routed,
            Err(e) => {
                warn!("Relay {} from {} unreadable: {}", relay, client, e);
                self.gateway.send_fail(relay, REASON_BAD_REQUEST, Some(info));
                return;
            }
        };
        if &routed.sender != client {
            warn!("Relay from {} claims to come from {}", client, routed.sender);
            self.gateway.send_fail(relay, REASON_BAD_REQUEST, Some(info));
            return;
        }
        let inner = match decode(&routed.inner) {
            Ok(inner) => Arc::new(inner),
            Err(e) => {
                warn!("Relay {} from {} carries a bad packet: {}", relay, client, e);
                self.gateway.send_fail(relay, REASON_BAD_REQUEST, Some(info));
                return;
            }
        };
        if inner.creator_id() != client {
            warn!("Relay from {} wraps a packet of {}", client, inner.creator_id());
            self.gateway.send_fail(relay, REASON_BAD_REQUEST, Some(info));
            return;
        }
        if !self.recent.lock().insert(&dedup_key("out", &inner)) {
            debug!("{} from {} already relayed", inner, client);
            return;
        }

        debug!(
            "Relaying {} from {} to {}{}",
            inner,
            client,
            routed.receiver,
            if routed.wide { " (wide)" } else { "" }
        );
        self.routes
            .lock()
            .count_outgoing(client, routed.inner.len() as u64);

        let options = OutboxOptions {
            wide: routed.wide,
            target: Some(routed.receiver),
            ..Default::default()
        };
        let gateway = self.gateway.clone();
        let origin = inner.clone();
        let info = info.clone();
        let callbacks = Callbacks::new().on_complete(move |outcome| {
            if let DeliveryOutcome::Failed(e) = outcome {
                warn!("Routed {} from {} not delivered: {}", origin, origin.creator_id(), e);
                gateway.send_fail(&origin, REASON_ROUTED_FAILED, Some(&info));
            }
        });
        self.gateway.outbox(inner, options, callbacks);
    }

    /// Someone outside sent a packet to one of our clients.
    fn relay_incoming(&self, packet: &Arc<Packet>, info: &InboundInfo) {
        let client = packet.remote_id().clone();
        let Some(route) = self.routes.lock().get(&client).cloned() else {
            return;
        };
        if !self.recent.lock().insert(&dedup_key("in", packet)) {
            debug!("{} for {} already relayed", packet, client);
            return;
        }
        match self.wrap_and_send(packet, &route, info) {
            Ok(bytes) => self.routes.lock().count_incoming(&client, bytes),
            Err(e) => warn!("Could not relay {} to {}: {}", packet, client, e),
        }
    }

    /// Returns the size of the wrapped packet.
    fn wrap_and_send(
        &self,
        packet: &Arc<Packet>,
        route: &Route,
        info: &InboundInfo,
    ) -> Result<u64, ProxyError> {
        let public_key = route.identity.public_key_bytes()?;
        let routed = RoutedPayload {
            sender: packet.creator_id().clone(),
            receiver: route.idurl.clone(),
            wide: false,
            inner: encode(packet)?,
        };
        let bytes = routed.inner.len() as u64;
        let block = routed.seal(self.gateway.keyring(), &public_key)?;
        let relay = self
            .gateway
            .build(Command::Relay)
            .owner(packet.owner_id().clone())
            .packet_id(packet.packet_id())
            .remote(route.idurl.clone())
            .payload(block)
            .sign(self.gateway.keyring());

        let mut options = OutboxOptions::default();
        match route.delivery_contact() {
            Some(contact) => {
                options.route = Some(RouteOverride {
                    proto: Some(contact.proto),
                    host: Some(contact.host.clone()),
                    remote_id: Some(route.idurl.clone()),
                    description: Some(format!("Relay[{}]", packet)),
                    ..Default::default()
                });
            }
            None => options.target = Some(route.idurl.clone()),
        }
        debug!("Relaying {} from {} to client {}", packet, packet.creator_id(), route.idurl);
        let gateway = self.gateway.clone();
        let origin = packet.clone();
        let client = route.idurl.clone();
        let info = info.clone();
        let callbacks = Callbacks::new().on_complete(move |outcome| {
            if let DeliveryOutcome::Failed(e) = outcome {
                warn!("{} for client {} not delivered: {}", origin, client, e);
                fail_incoming(&gateway, &origin, &client, &info);
            }
        });
        self.gateway.outbox(relay, options, callbacks);
        Ok(bytes)
    }
}

pub struct RouterMachine {
    shared: Arc<RouterShared>,
    handler: Option<HandlerId>,
}

impl RouterMachine {
    fn any_transport_listening(&self) -> bool {
        self.shared
            .gateway
            .transports()
            .iter()
            .any(|adapter| adapter.is_listening())
    }

    fn listen(&mut self) -> RouterState {
        let shared = &self.shared;
        let loaded = {
            let mut routes = shared.routes.lock();
            if let Err(e) = routes.load() {
                warn!("Saved routes unreadable, starting empty: {}", e);
            }
            routes.routes().map(|r| r.identity.clone()).collect::<Vec<_>>()
        };
        for identity in &loaded {
            if let Err(e) = shared.gateway.identities().override_identity(identity.clone()) {
                warn!("Could not pin identity of {}: {}", identity.idurl(), e);
            }
        }
        if self.handler.is_none() {
            let weak: Weak<RouterShared> = Arc::downgrade(&self.shared);
            self.handler = Some(shared.gateway.insert_inbound_handler(0, move |packet, info| {
                weak.upgrade()
                    .map_or(false, |shared| shared.on_inbound(packet, info))
            }));
        }
        info!("Proxy router listening with {} route(s)", loaded.len());
        RouterState::Listen
    }

    fn unlisten(&mut self) {
        if let Some(id) = self.handler.take() {
            self.shared.gateway.remove_inbound_handler(id);
        }
        if let Err(e) = self.shared.routes.lock().save() {
            error!("Failed to save routes: {}", e);
        }
    }
}

impl Machine for RouterMachine {
    type State = RouterState;
    type Event = RouterEvent;

    fn transition(
        &mut self,
        ctx: &mut Context<'_, Self>,
        state: RouterState,
        event: RouterEvent,
    ) -> RouterState {
        use RouterEvent as E;
        use RouterState as S;

        match (state, event) {
            (S::Closed, _) => S::Closed,

            (_, E::Shutdown) => {
                self.unlisten();
                if let Some(id) = self.shared.transport_observer.lock().take() {
                    self.shared.gateway.remove_transport_observer(id);
                }
                ctx.destroy();
                S::Closed
            }

            (S::AtStartup, E::Init) => S::Stopped,

            (S::Stopped, E::Start) => {
                if self.any_transport_listening() {
                    self.listen()
                } else {
                    debug!("Proxy router waiting for a transport");
                    S::Transports
                }
            }
            (S::Transports, E::TransportsReady) => self.listen(),
            (S::Transports, E::Stop) => S::Stopped,

            (S::Listen, E::Stop) => {
                self.unlisten();
                info!("Proxy router stopped");
                S::Stopped
            }

            (state, event) => {
                debug!("proxy_router ignored {:?} in {}", event, state);
                state
            }
        }
    }
}

/// Handle on the router role of this node.
#[derive(Clone)]
pub struct ProxyRouter {
    automat: Automat<RouterMachine>,
    shared: Arc<RouterShared>,
}

impl ProxyRouter {
    pub fn new(gateway: &Gateway, config: ProxyConfig, settings: SettingsStore) -> Self {
        let shared = Arc::new(RouterShared {
            gateway: gateway.clone(),
            routes: Mutex::new(RouteTable::new(config.max_routes, Some(settings))),
            recent: Mutex::new(RecentIds::new(config.dedup_window, config.dedup_max_age())),
            config,
            transport_observer: Mutex::new(None),
        });
        let automat = Automat::new(
            gateway.runtime(),
            "proxy_router",
            RouterState::AtStartup,
            RouterMachine {
                shared: shared.clone(),
                handler: None,
            },
        );
        let handle = automat.clone();
        let observer = gateway.add_transport_observer(move |_, _, new| {
            if new == AdapterState::Listening {
                handle.post(RouterEvent::TransportsReady);
            }
        });
        *shared.transport_observer.lock() = Some(observer);
        automat.post(RouterEvent::Init);
        Self { automat, shared }
    }

    pub fn start(&self) {
        self.automat.post(RouterEvent::Start);
    }

    pub fn stop(&self) {
        self.automat.post(RouterEvent::Stop);
    }

    pub fn shutdown(&self) {
        self.automat.post(RouterEvent::Shutdown);
    }

    pub fn state(&self) -> RouterState {
        self.automat.state()
    }

    pub fn automat(&self) -> &Automat<RouterMachine> {
        &self.automat
    }

    pub fn route_count(&self) -> usize {
        self.shared.routes.lock().len()
    }

    pub fn clients(&self) -> Vec<IdUrl> {
        self.shared.routes.lock().ids()
    }

    pub fn route(&self, client: &IdUrl) -> Option<Route> {
        self.shared.routes.lock().get(client).cloned()
    }
}

impl fmt::Debug for ProxyRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRouter")
            .field("state", &self.state())
            .field("routes", &self.route_count())
            .finish()
    }
}
