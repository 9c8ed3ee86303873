// Proxy sender: outgoing traffic of a proxied node goes through its router
//
//   AT_STARTUP -> STOPPED -> ROUTER? <-> REDIRECTING -> STOPPED | CLOSED

use super::envelope::RoutedPayload;
use super::receiver::{ProxyReceiver, ReceiverState};
use crate::automat::{Automat, Context, Machine, ObserverId, StateFilter};
use crate::config::ProxyConfig;
use crate::delivery::{DeliveryError, OutboxRequest, RouteOverride};
use crate::gateway::{FilterVerdict, Gateway, HandlerId};
use crate::packet::{encode, Command};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderState {
    AtStartup,
    Stopped,
    /// Started, waiting for the receiver to establish a route.
    Router,
    Redirecting,
    Closed,
}

impl fmt::Display for SenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SenderState::AtStartup => "AT_STARTUP",
            SenderState::Stopped => "STOPPED",
            SenderState::Router => "ROUTER?",
            SenderState::Redirecting => "REDIRECTING",
            SenderState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum SenderEvent {
    Init,
    Start,
    Stop,
    RouteUp,
    RouteDown,
    Shutdown,
}

struct SenderShared {
    gateway: Gateway,
    config: ProxyConfig,
    receiver: ProxyReceiver,
    pending: Mutex<VecDeque<OutboxRequest>>,
    observers: Mutex<Vec<ObserverId>>,
}

impl SenderShared {
    fn filter(&self, state: SenderState, request: OutboxRequest) -> FilterVerdict {
        if request.options.route.is_some() {
            return FilterVerdict::Pass(request);
        }
        let destination = request.destination();
        if destination == self.gateway.me()
            || self.receiver.router_id().as_ref() == Some(destination)
        {
            return FilterVerdict::Pass(request);
        }
        match state {
            SenderState::Redirecting => {
                if let Some(unrouted) = self.redirect(request) {
                    self.enqueue(unrouted);
                }
                FilterVerdict::Taken
            }
            SenderState::Router => {
                self.enqueue(request);
                FilterVerdict::Taken
            }
            _ => FilterVerdict::Pass(request),
        }
    }

    /// Wrap the request's packet into a `Relay` for the router and start
    /// delivering it. Gives the request back when there is no router.
    fn redirect(&self, mut request: OutboxRequest) -> Option<OutboxRequest> {
        let Some(router) = self.receiver.router() else {
            return Some(request);
        };
        let public_key = match router.identity.public_key_bytes() {
            Ok(key) => key,
            Err(e) => {
                request.fail(DeliveryError::Identity(e));
                return None;
            }
        };
        let outpacket = request.packet.clone();
        let inner = match encode(&outpacket) {
            Ok(inner) => inner,
            Err(e) => {
                request.fail(DeliveryError::Serialize(e));
                return None;
            }
        };
        let routed = RoutedPayload {
            sender: self.gateway.me().clone(),
            receiver: request.destination().clone(),
            wide: request.options.wide,
            inner,
        };
        let block = match routed.seal(self.gateway.keyring(), &public_key) {
            Ok(block) => block,
            Err(e) => {
                warn!("Could not wrap {} for {}: {}", outpacket, router.idurl(), e);
                request.fail(DeliveryError::AllAttemptsFailed(e.to_string()));
                return None;
            }
        };
        let relay = self
            .gateway
            .build(Command::Relay)
            .owner(outpacket.owner_id().clone())
            .packet_id(outpacket.packet_id())
            .remote(router.idurl().clone())
            .payload(block)
            .sign(self.gateway.keyring());

        let base = request
            .options
            .response_timeout
            .unwrap_or_else(|| self.gateway.config().response_timeout());
        request.options.response_timeout = Some(base + self.config.relay_extra_timeout());
        request.options.wide = false;
        request.options.route = Some(RouteOverride {
            packet: Some(Arc::new(relay)),
            proto: Some(router.contact.proto),
            host: Some(router.contact.host.clone()),
            remote_id: Some(router.idurl().clone()),
            description: Some(format!("Relay[{}]", outpacket)),
        });
        debug!("{} for {} redirected via {}", outpacket, routed.receiver, router.idurl());
        self.gateway.send_request(request);
        None
    }

    fn enqueue(&self, request: OutboxRequest) {
        let dropped: Vec<OutboxRequest> = {
            let mut pending = self.pending.lock();
            pending.push_back(request);
            let excess = pending.len().saturating_sub(self.config.pending_limit);
            pending.drain(..excess).collect()
        };
        for request in dropped {
            warn!("Proxy queue full, dropped {}", request.packet);
            request.fail(DeliveryError::Dropped);
        }
    }

    fn take_pending(&self) -> Vec<OutboxRequest> {
        self.pending.lock().drain(..).collect()
    }
}

pub struct SenderMachine {
    shared: Arc<SenderShared>,
    filter: Option<HandlerId>,
}

impl SenderMachine {
    fn install_filter(&mut self, ctx: &Context<'_, Self>) {
        if self.filter.is_some() {
            return;
        }
        let handle = ctx.handle();
        let shared = self.shared.clone();
        self.filter = Some(
            self.shared
                .gateway
                .insert_outbox_filter(0, move |request| shared.filter(handle.state(), request)),
        );
    }

    fn remove_filter(&mut self) {
        if let Some(id) = self.filter.take() {
            self.shared.gateway.remove_outbox_filter(id);
        }
    }

    fn flush(&self) {
        let pending = self.shared.take_pending();
        if pending.is_empty() {
            return;
        }
        info!("Sending {} queued packet(s) through the router", pending.len());
        for request in pending {
            if let Some(unrouted) = self.shared.redirect(request) {
                self.shared.enqueue(unrouted);
            }
        }
    }
}

impl Machine for SenderMachine {
    type State = SenderState;
    type Event = SenderEvent;

    fn transition(
        &mut self,
        ctx: &mut Context<'_, Self>,
        state: SenderState,
        event: SenderEvent,
    ) -> SenderState {
        use SenderEvent as E;
        use SenderState as S;

        match (state, event) {
            (S::Closed, _) => S::Closed,

            (_, E::Shutdown) => {
                self.remove_filter();
                for id in self.shared.observers.lock().drain(..) {
                    self.shared.receiver.remove_observer(id);
                }
                for request in self.shared.take_pending() {
                    request.fail(DeliveryError::Shutdown);
                }
                ctx.destroy();
                S::Closed
            }

            (S::AtStartup, E::Init) => S::Stopped,

            (S::Stopped, E::Start) => {
                self.install_filter(ctx);
                if self.shared.receiver.is_listening() {
                    S::Redirecting
                } else {
                    S::Router
                }
            }

            (S::Router, E::RouteUp) => {
                self.flush();
                S::Redirecting
            }
            (S::Redirecting, E::RouteDown) => {
                debug!("Route lost, queueing outgoing packets");
                S::Router
            }

            (S::Router | S::Redirecting, E::Stop) => {
                self.remove_filter();
                let pending = self.shared.take_pending();
                if !pending.is_empty() {
                    info!("Proxy sender stopped, sending {} queued packet(s) directly", pending.len());
                }
                for request in pending {
                    self.shared.gateway.send_request(request);
                }
                S::Stopped
            }

            (state, event) => {
                debug!("proxy_sender ignored {:?} in {}", event, state);
                state
            }
        }
    }
}

/// Handle on the sender role of this node.
#[derive(Clone)]
pub struct ProxySender {
    automat: Automat<SenderMachine>,
    shared: Arc<SenderShared>,
}

impl ProxySender {
    pub fn new(gateway: &Gateway, config: ProxyConfig, receiver: &ProxyReceiver) -> Self {
        let shared = Arc::new(SenderShared {
            gateway: gateway.clone(),
            config,
            receiver: receiver.clone(),
            pending: Mutex::new(VecDeque::new()),
            observers: Mutex::new(Vec::new()),
        });
        let automat = Automat::new(
            gateway.runtime(),
            "proxy_sender",
            SenderState::AtStartup,
            SenderMachine {
                shared: shared.clone(),
                filter: None,
            },
        );

        let up = automat.clone();
        let down = automat.clone();
        let observers = vec![
            receiver.add_observer(StateFilter::entering(ReceiverState::Listen), move |_, _| {
                up.post(SenderEvent::RouteUp)
            }),
            receiver.add_observer(StateFilter::leaving(ReceiverState::Listen), move |_, _| {
                down.post(SenderEvent::RouteDown)
            }),
        ];
        *shared.observers.lock() = observers;
        automat.post(SenderEvent::Init);
        Self { automat, shared }
    }

    pub fn start(&self) {
        self.automat.post(SenderEvent::Start);
    }

    pub fn stop(&self) {
        self.automat.post(SenderEvent::Stop);
    }

    pub fn shutdown(&self) {
        self.automat.post(SenderEvent::Shutdown);
    }

    pub fn state(&self) -> SenderState {
        self.automat.state()
    }

    /// Requests waiting for a route.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

impl fmt::Debug for ProxySender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySender")
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}
