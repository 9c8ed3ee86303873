// Proxy receiver: keeps this node reachable through a router
//
//   AT_STARTUP -> OFFLINE -> FIND_NODE? -> ACK? -> SERVICE? -> LISTEN
//                    ^            ^__________|________|__________|
//                    |_______________ stop __________________________
//
// While listening, the published identity carries the router's contacts and
// the original document is kept in settings so a crash can be undone.

use super::envelope::RoutedPayload;
use super::ServiceRequest;
use crate::automat::{Automat, Context, Machine, ObserverId, StateFilter, TimerSpec};
use crate::config::ProxyConfig;
use crate::delivery::{Callbacks, DeliveryOutcome, OutboxOptions, RouteOverride, TimeoutPolicy};
use crate::dht::PeerDirectory;
use crate::gateway::{Gateway, HandlerId, InboundInfo};
use crate::identity::{Contact, IdUrl, Identity, IdentityError};
use crate::packet::{Command, Packet};
use crate::store::settings::{KEY_CURRENT_ROUTER, KEY_MY_ORIGINAL_IDENTITY};
use crate::store::SettingsStore;
use crate::transport::Protocol;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const FIND_INTERVAL: Duration = Duration::from_secs(30);
const ACK_TIMEOUT: Duration = Duration::from_secs(15);
const PING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverState {
    AtStartup,
    Offline,
    FindNode,
    Ack,
    Service,
    Listen,
    Closed,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReceiverState::AtStartup => "AT_STARTUP",
            ReceiverState::Offline => "OFFLINE",
            ReceiverState::FindNode => "FIND_NODE?",
            ReceiverState::Ack => "ACK?",
            ReceiverState::Service => "SERVICE?",
            ReceiverState::Listen => "LISTEN",
            ReceiverState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum ReceiverEvent {
    Init,
    Start,
    Stop,
    Shutdown,
    RouterFound(Option<IdUrl>),
    RouterResolved(Result<Arc<Identity>, IdentityError>),
    IdentityAcked(DeliveryOutcome),
    ServiceReplied(DeliveryOutcome),
    PingReplied(DeliveryOutcome),
    FindTimer,
    AckTimer,
    PingTimer,
}

/// The router currently used, and the address it is reached at.
#[derive(Debug, Clone)]
pub struct RouterInfo {
    pub identity: Arc<Identity>,
    pub contact: Contact,
}

impl RouterInfo {
    pub fn idurl(&self) -> &IdUrl {
        self.identity.idurl()
    }

    fn to_setting(&self) -> String {
        format!("{} {} {}", self.idurl(), self.contact.proto, self.contact.host)
    }
}

fn parse_router_setting(value: &str) -> Option<(IdUrl, Option<Contact>)> {
    let mut parts = value.splitn(3, ' ');
    let idurl = parts.next().filter(|s| !s.is_empty())?;
    let contact = match (parts.next(), parts.next()) {
        (Some(proto), Some(host)) if !host.is_empty() => proto
            .parse::<Protocol>()
            .ok()
            .map(|proto| Contact::new(proto, host)),
        _ => None,
    };
    Some((IdUrl::new(idurl), contact))
}

enum Answer {
    Accepted,
    Refused(String),
    Silent,
}

fn answer(outcome: &DeliveryOutcome) -> Answer {
    match outcome.response() {
        Some(packet) if packet.command() == Command::Ack => Answer::Accepted,
        Some(packet) if packet.command() == Command::Fail => {
            Answer::Refused(packet.payload_text().into_owned())
        }
        _ => Answer::Silent,
    }
}

#[derive(Default)]
struct ReceiverShared {
    router: RwLock<Option<RouterInfo>>,
}

pub struct ReceiverMachine {
    gateway: Gateway,
    config: ProxyConfig,
    settings: SettingsStore,
    directory: Arc<dyn PeerDirectory>,
    shared: Arc<ReceiverShared>,
    /// Candidates already tried in this search round.
    tried: Vec<IdUrl>,
    /// Router remembered from an earlier session.
    hint: Option<(IdUrl, Option<Contact>)>,
    original: Option<Arc<Identity>>,
    handler: Option<HandlerId>,
    service_attempts: u32,
}

impl ReceiverMachine {
    fn router(&self) -> Option<RouterInfo> {
        self.shared.router.read().clone()
    }

    fn original_identity(&self) -> Arc<Identity> {
        self.original
            .clone()
            .unwrap_or_else(|| self.gateway.local().get())
    }

    /// Undo an identity rewrite left behind by a session that did not stop cleanly.
    fn restore_identity(&mut self) {
        let saved = match self.settings.get_string(KEY_MY_ORIGINAL_IDENTITY) {
            Ok(Some(saved)) => saved,
            Ok(None) => return,
            Err(e) => {
                warn!("Saved original identity unreadable: {}", e);
                return;
            }
        };
        match Identity::from_json(saved.as_bytes()) {
            Ok(original) if original.idurl() == self.gateway.me() => {
                info!("Restoring original contacts of {}", original.idurl());
                self.gateway.local().set_contacts(original.contacts().to_vec());
            }
            Ok(other) => warn!("Saved original identity belongs to {}", other.idurl()),
            Err(e) => warn!("Saved original identity invalid: {}", e),
        }
        self.forget_setting(KEY_MY_ORIGINAL_IDENTITY);
    }

    fn load_hint(&mut self) {
        self.hint = match self.settings.get_string(KEY_CURRENT_ROUTER) {
            Ok(value) => value.as_deref().and_then(parse_router_setting),
            Err(e) => {
                warn!("Saved router unreadable: {}", e);
                None
            }
        };
        if let Some((idurl, _)) = &self.hint {
            debug!("Last used router: {}", idurl);
        }
    }

    fn forget_setting(&self, key: &str) {
        if let Err(e) = self.settings.remove(key) {
            warn!("Failed to clear {}: {}", key, e);
        }
    }

    fn pick_contact(&self, identity: &Identity) -> Option<Contact> {
        if let Some((idurl, Some(contact))) = &self.hint {
            if idurl == identity.idurl() && self.gateway.can_send(contact.proto) {
                return Some(contact.clone());
            }
        }
        identity
            .contacts()
            .iter()
            .find(|c| c.proto != Protocol::Proxy && self.gateway.can_send(c.proto))
            .cloned()
    }

    fn find_router(&mut self, ctx: &mut Context<'_, Self>) -> ReceiverState {
        *self.shared.router.write() = None;
        let me = self.gateway.me().clone();
        let preferred = self
            .config
            .preferred_routers
            .iter()
            .map(|s| IdUrl::new(s.as_str()))
            .find(|r| r != &me && !self.tried.contains(r));
        if let Some(candidate) = preferred {
            ctx.post(ReceiverEvent::RouterFound(Some(candidate)));
            return ReceiverState::FindNode;
        }

        let directory = self.directory.clone();
        let mut exclude = self.tried.clone();
        exclude.push(me);
        let handle = ctx.handle();
        ctx.runtime().spawn_io(
            async move { directory.find_random_peer(&exclude).await },
            move |found| handle.post(ReceiverEvent::RouterFound(found)),
        );
        ReceiverState::FindNode
    }

    fn router_failed(&mut self, ctx: &mut Context<'_, Self>, reason: &str) -> ReceiverState {
        if let Some(router) = self.router() {
            warn!("Router {} unusable: {}", router.idurl(), reason);
            if self.hint.as_ref().map_or(false, |(idurl, _)| idurl == router.idurl()) {
                self.hint = None;
                self.forget_setting(KEY_CURRENT_ROUTER);
            }
        }
        self.service_attempts = 0;
        self.find_router(ctx)
    }

    /// Send `command` straight to the router's address.
    fn send_to_router(
        &self,
        command: Command,
        payload: Vec<u8>,
        timeout: Duration,
        callbacks: Callbacks,
    ) -> bool {
        let Some(router) = self.router() else {
            return false;
        };
        let packet = self
            .gateway
            .build(command)
            .remote(router.idurl().clone())
            .payload(payload)
            .sign(self.gateway.keyring());
        let options = OutboxOptions::default()
            .with_timeout(timeout, TimeoutPolicy::Fail)
            .with_route(RouteOverride {
                proto: Some(router.contact.proto),
                host: Some(router.contact.host.clone()),
                remote_id: Some(router.idurl().clone()),
                ..Default::default()
            });
        self.gateway.outbox(packet, options, callbacks);
        true
    }

    fn notify(
        ctx: &Context<'_, Self>,
        command: Command,
        event: fn(DeliveryOutcome) -> ReceiverEvent,
    ) -> Callbacks {
        let handle = ctx.handle();
        Callbacks::new()
            .expect_acks(command)
            .on_complete(move |outcome| handle.post(event(outcome.clone())))
    }

    fn identity_payload(&self) -> Vec<u8> {
        match self.original_identity().to_json() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Own identity does not serialize: {}", e);
                Vec::new()
            }
        }
    }

    fn send_identity(&mut self, ctx: &mut Context<'_, Self>) -> ReceiverState {
        let callbacks = Self::notify(ctx, Command::Identity, ReceiverEvent::IdentityAcked);
        let payload = self.identity_payload();
        if !self.send_to_router(Command::Identity, payload, ACK_TIMEOUT, callbacks) {
            return self.find_router(ctx);
        }
        ReceiverState::Ack
    }

    fn request_service(&mut self, ctx: &mut Context<'_, Self>) -> ReceiverState {
        self.service_attempts += 1;
        let request = ServiceRequest::proxy(Some((*self.original_identity()).clone()));
        let payload = match request.to_json() {
            Ok(payload) => payload,
            Err(e) => return self.router_failed(ctx, &e.to_string()),
        };
        let callbacks = Self::notify(ctx, Command::RequestService, ReceiverEvent::ServiceReplied);
        let timeout = self.gateway.config().response_timeout();
        if !self.send_to_router(Command::RequestService, payload, timeout, callbacks) {
            return self.find_router(ctx);
        }
        ReceiverState::Service
    }

    fn cancel_service(&self) {
        let payload = match ServiceRequest::proxy(None).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("CancelService not sent: {}", e);
                return;
            }
        };
        let timeout = self.gateway.config().response_timeout();
        self.send_to_router(Command::CancelService, payload, timeout, Callbacks::new());
    }

    fn enter_listen(&mut self, ctx: &mut Context<'_, Self>) -> ReceiverState {
        let Some(router) = self.router() else {
            return self.find_router(ctx);
        };
        self.service_attempts = 0;
        if let Err(e) = self.settings.set_string(KEY_CURRENT_ROUTER, &router.to_setting()) {
            warn!("Failed to remember router: {}", e);
        }
        self.hint = Some((router.idurl().clone(), Some(router.contact.clone())));

        let original = self.original_identity();
        match original.to_json().map(String::from_utf8) {
            Ok(Ok(json)) => {
                if let Err(e) = self.settings.set_string(KEY_MY_ORIGINAL_IDENTITY, &json) {
                    warn!("Failed to save original identity: {}", e);
                }
            }
            _ => warn!("Original identity not saved"),
        }
        self.original = Some(original);

        if self.handler.is_none() {
            let gateway = self.gateway.clone();
            let shared = self.shared.clone();
            self.handler = Some(self.gateway.insert_inbound_handler(0, move |packet, info| {
                unwrap_relay(&gateway, &shared, packet, info)
            }));
        }
        self.gateway
            .local()
            .set_contacts(router.identity.contacts().to_vec());
        info!("Reachable through router {} at {}", router.idurl(), router.contact);
        ReceiverState::Listen
    }

    fn leave_listen(&mut self) {
        if let Some(id) = self.handler.take() {
            self.gateway.remove_inbound_handler(id);
        }
        if let Some(original) = self.original.take() {
            self.gateway.local().set_contacts(original.contacts().to_vec());
        }
        self.forget_setting(KEY_MY_ORIGINAL_IDENTITY);
    }
}

/// Inbound handler while listening: open relays from the router and feed
/// the inner packet back through inbound delivery.
fn unwrap_relay(
    gateway: &Gateway,
    shared: &ReceiverShared,
    packet: &Arc<Packet>,
    _info: &InboundInfo,
) -> bool {
    if packet.command() != Command::Relay || packet.remote_id() != gateway.me() {
        return false;
    }
    let Some(router) = shared.router.read().clone() else {
        return false;
    };
    if packet.creator_id() != router.idurl() {
        return false;
    }
    match RoutedPayload::open(gateway.keyring(), packet.payload()) {
        Ok(routed) if &routed.receiver == gateway.me() => {
            trace!("Relay {} from {} unwrapped", packet, routed.sender);
            gateway.inject(Protocol::Proxy, router.contact.host.clone(), routed.inner);
        }
        Ok(routed) => warn!("Relay for {} arrived here", routed.receiver),
        Err(e) => warn!("Relay {} from router unreadable: {}", packet, e),
    }
    true
}

impl Machine for ReceiverMachine {
    type State = ReceiverState;
    type Event = ReceiverEvent;

    fn timers(&self) -> Vec<TimerSpec<Self>> {
        vec![
            TimerSpec::new("find", FIND_INTERVAL, &[ReceiverState::FindNode], || {
                ReceiverEvent::FindTimer
            }),
            TimerSpec::new("ack", ACK_TIMEOUT, &[ReceiverState::Ack], || {
                ReceiverEvent::AckTimer
            }),
            TimerSpec::new("ping", PING_INTERVAL, &[ReceiverState::Listen], || {
                ReceiverEvent::PingTimer
            }),
        ]
    }

    fn transition(
        &mut self,
        ctx: &mut Context<'_, Self>,
        state: ReceiverState,
        event: ReceiverEvent,
    ) -> ReceiverState {
        use ReceiverEvent as E;
        use ReceiverState as S;

        match (state, event) {
            (S::Closed, _) => S::Closed,

            (_, E::Shutdown) => {
                if state == S::Listen {
                    self.cancel_service();
                    self.leave_listen();
                }
                *self.shared.router.write() = None;
                ctx.destroy();
                S::Closed
            }

            (S::AtStartup, E::Init) => {
                self.restore_identity();
                self.load_hint();
                S::Offline
            }

            (S::Offline, E::Start) => {
                self.tried.clear();
                self.service_attempts = 0;
                match self.hint.clone() {
                    Some((idurl, _)) => {
                        ctx.post(E::RouterFound(Some(idurl)));
                        S::FindNode
                    }
                    None => self.find_router(ctx),
                }
            }

            (S::Listen, E::Stop) => {
                self.cancel_service();
                self.leave_listen();
                *self.shared.router.write() = None;
                info!("Proxy receiver stopped");
                S::Offline
            }
            (S::FindNode | S::Ack | S::Service, E::Stop) => {
                *self.shared.router.write() = None;
                S::Offline
            }

            (S::FindNode, E::RouterFound(Some(idurl))) => {
                debug!("Trying {} as proxy router", idurl);
                self.tried.push(idurl.clone());
                let handle = ctx.handle();
                self.gateway.identities().resolve(&idurl, move |result| {
                    handle.post(E::RouterResolved(result))
                });
                S::FindNode
            }
            (S::FindNode, E::RouterFound(None)) => {
                info!("No proxy router available, retrying in {:?}", FIND_INTERVAL);
                self.tried.clear();
                S::FindNode
            }
            (S::FindNode, E::RouterResolved(Ok(identity))) => match self.pick_contact(&identity) {
                Some(contact) => {
                    *self.shared.router.write() = Some(RouterInfo { identity, contact });
                    self.send_identity(ctx)
                }
                None => {
                    debug!("No usable contact for router {}", identity.idurl());
                    self.find_router(ctx)
                }
            },
            (S::FindNode, E::RouterResolved(Err(e))) => {
                debug!("Router candidate unresolved: {}", e);
                self.find_router(ctx)
            }
            (S::FindNode, E::FindTimer) => {
                self.tried.clear();
                self.find_router(ctx)
            }

            (S::Ack, E::IdentityAcked(outcome)) => match answer(&outcome) {
                Answer::Accepted => self.request_service(ctx),
                Answer::Refused(reason) => self.router_failed(ctx, &reason),
                Answer::Silent => self.router_failed(ctx, "identity not acknowledged"),
            },
            (S::Ack, E::AckTimer) => self.router_failed(ctx, "no ack in time"),

            (S::Service, E::ServiceReplied(outcome)) => match answer(&outcome) {
                Answer::Accepted => self.enter_listen(ctx),
                Answer::Refused(reason) => {
                    info!("Router refused service: {}", reason);
                    self.router_failed(ctx, &reason)
                }
                Answer::Silent if self.service_attempts < self.config.service_retries => {
                    debug!("Service request unanswered, attempt {}", self.service_attempts);
                    self.request_service(ctx)
                }
                Answer::Silent => self.router_failed(ctx, "service request unanswered"),
            },

            (S::Listen, E::PingTimer) => {
                let callbacks = Self::notify(ctx, Command::Identity, E::PingReplied);
                let payload = self.identity_payload();
                self.send_to_router(Command::Identity, payload, ACK_TIMEOUT, callbacks);
                S::Listen
            }
            (S::Listen, E::PingReplied(outcome)) => match answer(&outcome) {
                Answer::Accepted => S::Listen,
                Answer::Refused(reason) => {
                    self.leave_listen();
                    self.router_failed(ctx, &reason)
                }
                Answer::Silent => {
                    self.leave_listen();
                    self.router_failed(ctx, "ping unanswered")
                }
            },

            (state, event) => {
                trace!("proxy_receiver ignored {:?} in {}", event, state);
                state
            }
        }
    }
}

/// Handle on the receiver role of this node.
#[derive(Clone)]
pub struct ProxyReceiver {
    automat: Automat<ReceiverMachine>,
    shared: Arc<ReceiverShared>,
}

impl ProxyReceiver {
    pub fn new(
        gateway: &Gateway,
        config: ProxyConfig,
        settings: SettingsStore,
        directory: Arc<dyn PeerDirectory>,
    ) -> Self {
        let shared = Arc::new(ReceiverShared::default());
        let automat = Automat::new(
            gateway.runtime(),
            "proxy_receiver",
            ReceiverState::AtStartup,
            ReceiverMachine {
                gateway: gateway.clone(),
                config,
                settings,
                directory,
                shared: shared.clone(),
                tried: Vec::new(),
                hint: None,
                original: None,
                handler: None,
                service_attempts: 0,
            },
        );
        automat.post(ReceiverEvent::Init);
        Self { automat, shared }
    }

    pub fn start(&self) {
        self.automat.post(ReceiverEvent::Start);
    }

    pub fn stop(&self) {
        self.automat.post(ReceiverEvent::Stop);
    }

    pub fn shutdown(&self) {
        self.automat.post(ReceiverEvent::Shutdown);
    }

    pub fn state(&self) -> ReceiverState {
        self.automat.state()
    }

    pub fn is_listening(&self) -> bool {
        self.state() == ReceiverState::Listen
    }

    /// Router in use or being negotiated with.
    pub fn router(&self) -> Option<RouterInfo> {
        self.shared.router.read().clone()
    }

    pub fn router_id(&self) -> Option<IdUrl> {
        self.shared.router.read().as_ref().map(|r| r.idurl().clone())
    }

    pub fn add_observer(
        &self,
        filter: StateFilter<ReceiverState>,
        callback: impl Fn(ReceiverState, ReceiverState) + Send + Sync + 'static,
    ) -> ObserverId {
        self.automat.add_observer(filter, callback)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.automat.remove_observer(id)
    }
}

impl fmt::Debug for ProxyReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyReceiver")
            .field("state", &self.state())
            .field("router", &self.router_id())
            .finish()
    }
}
