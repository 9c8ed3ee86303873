// Transport adapter: per-protocol lifecycle state machine

use super::abstraction::{
    InboundSink, Protocol, TransferId, TransferIds, TransferReport, TransportError,
};
use super::driver::TransportDriver;
use crate::automat::{Automat, Context, Machine, ObserverId, Runtime, StateFilter};
use crate::identity::Contact;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterState {
    AtStartup,
    Init,
    Starting,
    Listening,
    Stopping,
    Offline,
    Closed,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterState::AtStartup => "AT_STARTUP",
            AdapterState::Init => "INIT",
            AdapterState::Starting => "STARTING",
            AdapterState::Listening => "LISTENING",
            AdapterState::Stopping => "STOPPING",
            AdapterState::Offline => "OFFLINE",
            AdapterState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum AdapterEvent {
    Init,
    Start,
    Stop,
    Started(Result<Vec<String>, TransportError>),
    Stopped(Result<(), TransportError>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Start,
    Stop,
}

struct AdapterShared {
    proto: Protocol,
    driver: Arc<dyn TransportDriver>,
    runtime: Runtime,
    ids: TransferIds,
    sink: InboundSink,
    contacts: RwLock<Vec<String>>,
    outstanding: Mutex<HashSet<TransferId>>,
}

pub struct AdapterMachine {
    shared: Arc<AdapterShared>,
    pending: Option<Pending>,
}

impl AdapterMachine {
    fn begin_start(&self, ctx: &Context<'_, Self>) {
        let driver = self.shared.driver.clone();
        let sink = self.shared.sink.clone();
        let me = ctx.handle();
        ctx.runtime().spawn_io(async move { driver.start(sink).await }, move |result| {
            me.post(AdapterEvent::Started(result))
        });
    }

    fn begin_stop(&self, ctx: &Context<'_, Self>) {
        let driver = self.shared.driver.clone();
        let me = ctx.handle();
        ctx.runtime().spawn_io(async move { driver.stop().await }, move |result| {
            me.post(AdapterEvent::Stopped(result))
        });
    }

    fn cancel_outstanding(&self) -> usize {
        let ids: Vec<TransferId> = self.shared.outstanding.lock().iter().copied().collect();
        for id in &ids {
            self.shared.driver.cancel(*id);
        }
        ids.len()
    }
}

impl Machine for AdapterMachine {
    type State = AdapterState;
    type Event = AdapterEvent;

    fn transition(
        &mut self,
        ctx: &mut Context<'_, Self>,
        state: AdapterState,
        event: AdapterEvent,
    ) -> AdapterState {
        use AdapterEvent as E;
        use AdapterState as S;

        match (state, event) {
            (S::Closed, _) => S::Closed,

            (_, E::Shutdown) => {
                let cancelled = self.cancel_outstanding();
                if cancelled > 0 {
                    info!("{} transport: cancelled {} transfer(s) on shutdown", self.shared.proto, cancelled);
                }
                if matches!(state, S::Starting | S::Listening) {
                    let driver = self.shared.driver.clone();
                    ctx.runtime().spawn_io(async move { driver.stop().await }, |_| {});
                }
                self.shared.contacts.write().clear();
                ctx.destroy();
                S::Closed
            }

            (S::AtStartup, E::Init) => S::Init,
            (S::AtStartup, E::Start) => {
                self.begin_start(ctx);
                S::Starting
            }

            (S::Init | S::Offline, E::Start) => {
                self.begin_start(ctx);
                S::Starting
            }
            (S::Init, E::Stop) => S::Offline,

            (S::Starting, E::Start) => {
                self.pending = None;
                S::Starting
            }
            (S::Starting, E::Stop) => {
                self.pending = Some(Pending::Stop);
                S::Starting
            }
            (S::Starting, E::Started(Ok(hosts))) => {
                info!("{} transport listening on {:?}", self.shared.proto, hosts);
                *self.shared.contacts.write() = hosts;
                if self.pending.take() == Some(Pending::Stop) {
                    ctx.post(E::Stop);
                }
                S::Listening
            }
            (S::Starting, E::Started(Err(e))) => {
                warn!("{} transport failed to start: {}", self.shared.proto, e);
                self.pending = None;
                S::Offline
            }

            (S::Listening, E::Start) => {
                debug!("{} transport restarting", self.shared.proto);
                self.pending = Some(Pending::Start);
                self.begin_stop(ctx);
                S::Stopping
            }
            (S::Listening, E::Stop) => {
                self.begin_stop(ctx);
                S::Stopping
            }

            (S::Stopping, E::Start) => {
                self.pending = Some(Pending::Start);
                S::Stopping
            }
            (S::Stopping, E::Stop) => {
                self.pending = None;
                S::Stopping
            }
            (S::Stopping, E::Stopped(result)) => {
                if let Err(e) = result {
                    warn!("{} transport stop reported: {}", self.shared.proto, e);
                }
                self.shared.contacts.write().clear();
                if self.pending.take() == Some(Pending::Start) {
                    ctx.post(E::Start);
                }
                S::Offline
            }

            (state, event) => {
                debug!("{} transport ignored {:?} in {}", self.shared.proto, event, state);
                state
            }
        }
    }
}

/// One installed protocol: its driver plus the lifecycle machine.
#[derive(Clone)]
pub struct TransportAdapter {
    automat: Automat<AdapterMachine>,
    shared: Arc<AdapterShared>,
}

impl TransportAdapter {
    pub fn new(
        runtime: &Runtime,
        driver: Arc<dyn TransportDriver>,
        ids: TransferIds,
        sink: InboundSink,
    ) -> Self {
        let proto = driver.protocol();
        let shared = Arc::new(AdapterShared {
            proto,
            driver,
            runtime: runtime.clone(),
            ids,
            sink,
            contacts: RwLock::new(Vec::new()),
            outstanding: Mutex::new(HashSet::new()),
        });
        let automat = Automat::new(
            runtime,
            format!("{}_transport", proto),
            AdapterState::AtStartup,
            AdapterMachine {
                shared: shared.clone(),
                pending: None,
            },
        );
        automat.post(AdapterEvent::Init);
        Self { automat, shared }
    }

    pub fn proto(&self) -> Protocol {
        self.shared.proto
    }

    pub fn state(&self) -> AdapterState {
        self.automat.state()
    }

    pub fn is_listening(&self) -> bool {
        self.state() == AdapterState::Listening
    }

    pub fn start(&self) {
        self.automat.post(AdapterEvent::Start);
    }

    pub fn stop(&self) {
        self.automat.post(AdapterEvent::Stop);
    }

    pub fn shutdown(&self) {
        self.automat.post(AdapterEvent::Shutdown);
    }

    /// Local addresses, known once listening.
    pub fn contacts(&self) -> Vec<Contact> {
        self.shared
            .contacts
            .read()
            .iter()
            .map(|host| Contact::new(self.shared.proto, host.clone()))
            .collect()
    }

    pub fn connect(&self, host: &str) {
        let driver = self.shared.driver.clone();
        let target = host.to_string();
        let proto = self.shared.proto;
        self.shared.runtime.spawn_io(
            async move {
                let result = driver.connect(&target).await;
                (target, result)
            },
            move |(target, result)| match result {
                Ok(()) => debug!("{} connected to {}", proto, target),
                Err(e) => warn!("{} connect to {} failed: {}", proto, target, e),
            },
        );
    }

    pub fn disconnect(&self) {
        let driver = self.shared.driver.clone();
        let proto = self.shared.proto;
        self.shared.runtime.spawn_io(async move { driver.disconnect().await }, move |result| {
            if let Err(e) = result {
                warn!("{} disconnect failed: {}", proto, e);
            }
        });
    }

    /// Start moving `data` to `host`. `on_done` runs on the loop once the
    /// transfer reached a terminal status.
    pub fn send(
        &self,
        data: Arc<Vec<u8>>,
        host: &str,
        description: &str,
        on_done: impl FnOnce(TransferReport) + Send + 'static,
    ) -> Result<TransferId, TransportError> {
        if !self.is_listening() {
            return Err(TransportError::NotListening(self.shared.proto));
        }
        let transfer_id = self.shared.ids.next();
        self.shared.outstanding.lock().insert(transfer_id);

        let driver = self.shared.driver.clone();
        let shared = self.shared.clone();
        let target = host.to_string();
        let description = description.to_string();
        debug!(
            "{} transfer {} of {} bytes to {} started ({})",
            self.shared.proto,
            transfer_id,
            data.len(),
            host,
            description
        );
        self.shared.runtime.spawn_io(
            async move {
                let result = driver.send(transfer_id, &target, data, &description).await;
                (target, result)
            },
            move |(target, result)| {
                shared.outstanding.lock().remove(&transfer_id);
                on_done(TransferReport::from_result(transfer_id, shared.proto, target, result));
            },
        );
        Ok(transfer_id)
    }

    /// Ask the driver to abort a transfer. Confirmation arrives later
    /// through the transfer's own completion.
    pub fn cancel(&self, transfer_id: TransferId) -> bool {
        self.shared.driver.cancel(transfer_id)
    }

    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.lock().len()
    }

    pub fn add_observer(
        &self,
        filter: StateFilter<AdapterState>,
        callback: impl Fn(AdapterState, AdapterState) + Send + Sync + 'static,
    ) -> ObserverId {
        self.automat.add_observer(filter, callback)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.automat.remove_observer(id)
    }
}

impl fmt::Debug for TransportAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportAdapter({}, {})", self.shared.proto, self.state())
    }
}
