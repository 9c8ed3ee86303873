//! Packet delivery
//!
//! Every packet sent gets its own [`PacketOut`](packet_out::PacketOut)
//! machine and every transfer received its own
//! [`PacketIn`](packet_in::PacketIn). This module holds what callers see of
//! them: send options, callbacks and the outcome channel.

pub mod packet_in;
pub mod packet_out;
pub mod selection;

use crate::identity::{IdUrl, IdentityError};
use crate::packet::{Command, Packet, PacketError};
use crate::transport::{Protocol, TransferId, TransferStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Payloads below this are expected to finish within the response timeout.
pub const SMALL_PACKET: u64 = 10 * 1024;
/// Payloads above this get a timeout scaled by the sending speed limit.
pub const LARGE_PACKET: u64 = 1024 * 1024;
const MEDIUM_SEND_TIMEOUT: Duration = Duration::from_secs(300);
const LARGE_SEND_BASE: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Identity resolution failed: {0}")]
    Identity(#[from] IdentityError),

    #[error("Nothing to send: no usable contact")]
    NothingToSend,

    #[error("All attempts failed: {0}")]
    AllAttemptsFailed(String),

    #[error("Serialization failed: {0}")]
    Serialize(#[from] PacketError),

    #[error("Sending timed out")]
    SendTimeout,

    #[error("No response in time")]
    ResponseTimeout,

    #[error("Dropped from a full queue")]
    Dropped,

    #[error("Delivery abandoned")]
    Abandoned,

    #[error("Gateway shutting down")]
    Shutdown,
}

/// How one send request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// A correlated response arrived.
    Responded(Arc<Packet>),
    /// Delivered; no response was asked for.
    Sent,
    /// Delivered, but the response did not arrive in time.
    TimedOut,
    Failed(DeliveryError),
    Cancelled,
}

impl DeliveryOutcome {
    /// A `Fail` answer counts as a failure even though it is a response.
    pub fn is_success(&self) -> bool {
        match self {
            DeliveryOutcome::Responded(packet) => packet.command() != Command::Fail,
            DeliveryOutcome::Sent | DeliveryOutcome::TimedOut => true,
            DeliveryOutcome::Failed(_) | DeliveryOutcome::Cancelled => false,
        }
    }

    pub fn response(&self) -> Option<&Arc<Packet>> {
        match self {
            DeliveryOutcome::Responded(packet) => Some(packet),
            _ => None,
        }
    }
}

/// What to do when a wanted response never arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// The packet left; report [`DeliveryOutcome::TimedOut`].
    #[default]
    BestEffort,
    /// Report [`DeliveryError::ResponseTimeout`].
    Fail,
}

/// Put a different packet on the wire, or send to an explicit address.
#[derive(Debug, Clone, Default)]
pub struct RouteOverride {
    /// Bytes actually transferred; the original packet still drives correlation.
    pub packet: Option<Arc<Packet>>,
    pub proto: Option<Protocol>,
    pub host: Option<String>,
    /// Peer that receives the wire packet.
    pub remote_id: Option<IdUrl>,
    pub description: Option<String>,
}

impl RouteOverride {
    /// Reply straight to the address a packet came from.
    pub fn address(proto: Protocol, host: impl Into<String>) -> Self {
        Self {
            proto: Some(proto),
            host: Some(host.into()),
            ..Default::default()
        }
    }

    pub(crate) fn direct_address(&self) -> Option<(Protocol, &str)> {
        match (self.proto, self.host.as_deref()) {
            (Some(proto), Some(host)) => Some((proto, host)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutboxOptions {
    /// Use every usable contact at once.
    pub wide: bool,
    /// Defaults to the gateway's configured response timeout.
    pub response_timeout: Option<Duration>,
    pub timeout_policy: TimeoutPolicy,
    /// Deliver to this peer instead of the packet's `RemoteID`.
    pub target: Option<IdUrl>,
    pub route: Option<RouteOverride>,
}

impl OutboxOptions {
    pub fn wide() -> Self {
        Self {
            wide: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration, policy: TimeoutPolicy) -> Self {
        self.response_timeout = Some(timeout);
        self.timeout_policy = policy;
        self
    }

    pub fn with_route(mut self, route: RouteOverride) -> Self {
        self.route = Some(route);
        self
    }
}

pub type ResponseHandler = Arc<dyn Fn(&Arc<Packet>) + Send + Sync>;
pub type CompletionHandler = Box<dyn FnOnce(&DeliveryOutcome) + Send>;

/// Parties interested in one send request.
#[derive(Default)]
pub struct Callbacks {
    responses: HashMap<Command, Vec<ResponseHandler>>,
    completions: Vec<CompletionHandler>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `command` as a response and call `handler` with it.
    pub fn on(
        mut self,
        command: Command,
        handler: impl Fn(&Arc<Packet>) + Send + Sync + 'static,
    ) -> Self {
        self.responses
            .entry(command)
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Wait for `command` as a response without a handler.
    pub fn expect(mut self, command: Command) -> Self {
        self.responses.entry(command).or_default();
        self
    }

    /// Wait for any acknowledgement `outgoing` accepts.
    pub fn expect_acks(mut self, outgoing: Command) -> Self {
        for command in outgoing.acks() {
            self.responses.entry(*command).or_default();
        }
        self
    }

    pub fn on_complete(mut self, handler: impl FnOnce(&DeliveryOutcome) + Send + 'static) -> Self {
        self.completions.push(Box::new(handler));
        self
    }

    pub fn merge(&mut self, other: Callbacks) {
        for (command, handlers) in other.responses {
            self.responses.entry(command).or_default().extend(handlers);
        }
        self.completions.extend(other.completions);
    }

    pub fn wants_response(&self) -> bool {
        !self.responses.is_empty()
    }

    pub fn wants(&self, command: Command) -> bool {
        self.responses.contains_key(&command)
    }

    pub fn interest(&self) -> Vec<Command> {
        let mut commands: Vec<Command> = self.responses.keys().copied().collect();
        commands.sort();
        commands
    }

    pub(crate) fn respond(&self, packet: &Arc<Packet>) {
        if let Some(handlers) = self.responses.get(&packet.command()) {
            for handler in handlers {
                handler(packet);
            }
        }
    }

    /// Run every completion handler once.
    pub(crate) fn complete(&mut self, outcome: &DeliveryOutcome) {
        for handler in self.completions.drain(..) {
            handler(outcome);
        }
    }

    /// Register a completion that feeds a [`Delivery`].
    pub(crate) fn channel(&mut self) -> oneshot::Receiver<DeliveryOutcome> {
        let (tx, rx) = oneshot::channel();
        self.completions.push(Box::new(move |outcome| {
            let _ = tx.send(outcome.clone());
        }));
        rx
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("responses", &self.interest())
            .field("completions", &self.completions.len())
            .finish()
    }
}

enum JoinState {
    Open(Vec<Callbacks>),
    Closed(DeliveryOutcome),
}

/// Callbacks of duplicate requests waiting to be taken over by a live
/// outbound machine. Shared between the gateway's index and the machine.
#[derive(Clone)]
pub(crate) struct Joiners {
    state: Arc<Mutex<JoinState>>,
}

impl Joiners {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(JoinState::Open(Vec::new()))),
        }
    }

    /// Queue `callbacks` for the machine. Once it finished they come back
    /// with the outcome it ended with.
    pub(crate) fn join(&self, callbacks: Callbacks) -> Result<(), (Callbacks, DeliveryOutcome)> {
        match &mut *self.state.lock() {
            JoinState::Open(waiting) => {
                waiting.push(callbacks);
                Ok(())
            }
            JoinState::Closed(outcome) => Err((callbacks, outcome.clone())),
        }
    }

    pub(crate) fn take(&self) -> Vec<Callbacks> {
        match &mut *self.state.lock() {
            JoinState::Open(waiting) => std::mem::take(waiting),
            JoinState::Closed(_) => Vec::new(),
        }
    }

    /// Record the final outcome; later joins get it straight away.
    pub(crate) fn close(&self, outcome: &DeliveryOutcome) -> Vec<Callbacks> {
        let previous = std::mem::replace(
            &mut *self.state.lock(),
            JoinState::Closed(outcome.clone()),
        );
        match previous {
            JoinState::Open(waiting) => waiting,
            JoinState::Closed(_) => Vec::new(),
        }
    }
}

/// A send request as it travels through the outbox filters.
#[derive(Debug)]
pub struct OutboxRequest {
    pub packet: Arc<Packet>,
    pub options: OutboxOptions,
    pub callbacks: Callbacks,
}

impl OutboxRequest {
    pub fn new(packet: Arc<Packet>, options: OutboxOptions, callbacks: Callbacks) -> Self {
        Self {
            packet,
            options,
            callbacks,
        }
    }

    /// Peer whose identity supplies the contacts.
    pub fn destination(&self) -> &IdUrl {
        self.options
            .route
            .as_ref()
            .and_then(|r| r.remote_id.as_ref())
            .or(self.options.target.as_ref())
            .unwrap_or(self.packet.remote_id())
    }

    pub fn fail(mut self, error: DeliveryError) {
        self.callbacks.complete(&DeliveryOutcome::Failed(error));
    }
}

/// Handle on a send request; resolves once the request is terminal.
#[derive(Debug)]
pub struct Delivery {
    machine: Option<u64>,
    rx: oneshot::Receiver<DeliveryOutcome>,
}

impl Delivery {
    pub(crate) fn new(machine: Option<u64>, rx: oneshot::Receiver<DeliveryOutcome>) -> Self {
        Self { machine, rx }
    }

    /// Id of the outbound machine, unless a filter took the request over.
    pub fn machine_id(&self) -> Option<u64> {
        self.machine
    }

    pub async fn outcome(self) -> DeliveryOutcome {
        self.rx
            .await
            .unwrap_or(DeliveryOutcome::Failed(DeliveryError::Abandoned))
    }

    /// The outcome if it is already known.
    pub fn try_outcome(&mut self) -> Option<DeliveryOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(DeliveryOutcome::Failed(DeliveryError::Abandoned))
            }
        }
    }
}

/// One transfer of a packet's bytes to one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub transfer_id: TransferId,
    pub proto: Protocol,
    pub host: String,
    pub size: u64,
}

/// Terminal report of one work item, fed to the finish observers.
#[derive(Debug, Clone)]
pub struct WorkItemReport {
    pub packet: Arc<Packet>,
    pub remote_id: IdUrl,
    pub proto: Protocol,
    pub host: String,
    pub transfer_id: TransferId,
    pub status: TransferStatus,
    pub bytes: u64,
    pub error: Option<String>,
}

/// Time allowed for the transfers of a packet of `size` bytes.
pub fn send_timeout(size: u64, response_timeout: Duration, speed_limit: u64) -> Duration {
    if size < SMALL_PACKET {
        response_timeout
    } else if size > LARGE_PACKET {
        LARGE_SEND_BASE + Duration::from_secs(size / speed_limit.max(1))
    } else {
        MEDIUM_SEND_TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdUrl;

    #[test]
    fn test_send_timeout_scales_with_size() {
        let response = Duration::from_secs(30);
        assert_eq!(send_timeout(100, response, 1000), response);
        assert_eq!(send_timeout(500 * 1024, response, 1000), Duration::from_secs(300));
        assert_eq!(
            send_timeout(2 * 1024 * 1024, response, 1024 * 1024),
            Duration::from_secs(7)
        );
        assert_eq!(send_timeout(2 * 1024 * 1024, response, 0), Duration::from_secs(5 + 2 * 1024 * 1024));
    }

    #[test]
    fn test_callbacks_merge_and_complete_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = log.clone();
        let mut callbacks = Callbacks::new()
            .expect_acks(Command::Data)
            .on_complete(move |o| first.lock().push(format!("a:{:?}", o)));
        let second = log.clone();
        callbacks.merge(Callbacks::new().on_complete(move |o| second.lock().push(format!("b:{:?}", o))));

        assert_eq!(callbacks.interest(), vec![Command::Ack, Command::Fail]);
        let mut rx = callbacks.channel();
        callbacks.complete(&DeliveryOutcome::Sent);
        callbacks.complete(&DeliveryOutcome::Cancelled);

        assert_eq!(*log.lock(), vec!["a:Sent".to_string(), "b:Sent".to_string()]);
        assert_eq!(rx.try_recv().unwrap(), DeliveryOutcome::Sent);
    }

    #[test]
    fn test_dropped_delivery_reports_abandoned() {
        let mut callbacks = Callbacks::new();
        let mut delivery = Delivery::new(None, callbacks.channel());
        assert_eq!(delivery.try_outcome(), None);
        drop(callbacks);
        assert_eq!(
            delivery.try_outcome(),
            Some(DeliveryOutcome::Failed(DeliveryError::Abandoned))
        );
    }

    #[test]
    fn test_late_joiner_gets_recorded_outcome() {
        let joiners = Joiners::new();
        let mut early = Callbacks::new();
        let mut early_rx = early.channel();
        joiners.join(early).unwrap();

        let mut waiting = joiners.close(&DeliveryOutcome::Sent);
        assert_eq!(waiting.len(), 1);
        waiting[0].complete(&DeliveryOutcome::Sent);
        assert_eq!(early_rx.try_recv().unwrap(), DeliveryOutcome::Sent);

        let mut late = Callbacks::new();
        let mut late_rx = late.channel();
        let (mut returned, outcome) = joiners.join(late).err().unwrap();
        returned.complete(&outcome);
        assert_eq!(late_rx.try_recv().unwrap(), DeliveryOutcome::Sent);
        assert!(joiners.take().is_empty());
    }

    #[test]
    fn test_fail_response_is_not_success() {
        let keys = crate::identity::IdentityKeys::generate();
        let ring = crate::crypto::KeyRing::new(keys);
        let me = IdUrl::new("http://id.local/hub.xml");
        let reply = |command| {
            Arc::new(
                Packet::build(command, me.clone())
                    .remote(IdUrl::new("http://id.local/alice.xml"))
                    .payload(b"routed packet delivery failed".to_vec())
                    .sign(&ring),
            )
        };
        assert!(DeliveryOutcome::Responded(reply(Command::Ack)).is_success());
        assert!(!DeliveryOutcome::Responded(reply(Command::Fail)).is_success());
        assert!(DeliveryOutcome::TimedOut.is_success());
        assert!(!DeliveryOutcome::Cancelled.is_success());
    }
}
