// Outbound delivery: one machine per packet sent
//
//   AT_STARTUP -> CACHING? -> ITEMS? -> IN_QUEUE -> SENDING -> RESPONSE?
//              -> SENT | FAILED | CANCEL

use super::selection::Selection;
use super::{
    send_timeout, Callbacks, DeliveryError, DeliveryOutcome, Joiners, OutboxOptions,
    OutboxRequest, TimeoutPolicy, WorkItem, WorkItemReport,
};
use crate::automat::{Automat, Context, Machine, TimerSpec};
use crate::gateway::Gateway;
use crate::identity::{Contact, IdUrl, Identity, IdentityError};
use crate::packet::{encode, Packet, PacketError};
use crate::transport::{Protocol, TransferId, TransferReport, TransferStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketOutState {
    AtStartup,
    Caching,
    Items,
    InQueue,
    Sending,
    Response,
    Sent,
    Failed,
    Cancel,
}

impl PacketOutState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancel)
    }
}

#[derive(Debug)]
pub enum PacketOutEvent {
    Run,
    IdentityResolved(Result<Arc<Identity>, IdentityError>),
    ItemsSent,
    NothingToSend,
    ItemStarted(TransferId),
    ItemFinished(TransferReport),
    InboxPacket(Arc<Packet>),
    SendTimeout,
    ResponseTimeout,
    Cancel,
}

pub struct PacketOut {
    gateway: Gateway,
    outpacket: Arc<Packet>,
    data: Result<Arc<Vec<u8>>, PacketError>,
    description: String,
    options: OutboxOptions,
    callbacks: Callbacks,
    joiners: Joiners,
    destination: IdUrl,
    identity: Option<Arc<Identity>>,
    items: HashMap<TransferId, WorkItem>,
    excluded: HashSet<Protocol>,
    attempts: u32,
    delivered: bool,
    last_error: Option<String>,
    response: Option<Arc<Packet>>,
    cancel_pending: bool,
    response_timeout: Duration,
    send_timeout: Duration,
}

impl PacketOut {
    /// Build the machine for `request`; the gateway posts `Run`.
    pub(crate) fn spawn(
        gateway: &Gateway,
        request: OutboxRequest,
        joiners: Joiners,
    ) -> Automat<PacketOut> {
        let destination = request.destination().clone();
        let OutboxRequest {
            packet,
            options,
            callbacks,
        } = request;

        let wire = options
            .route
            .as_ref()
            .and_then(|route| route.packet.clone())
            .unwrap_or_else(|| packet.clone());
        let data = encode(&wire).map(Arc::new);
        let size = data.as_ref().map_or(0, |d| d.len() as u64);
        let description = options
            .route
            .as_ref()
            .and_then(|route| route.description.clone())
            .unwrap_or_else(|| format!("{}[{}]", wire.command(), wire.packet_id()));
        let response_timeout = options
            .response_timeout
            .unwrap_or_else(|| gateway.config().response_timeout());

        let machine = PacketOut {
            gateway: gateway.clone(),
            outpacket: packet,
            data,
            description,
            options,
            callbacks,
            joiners,
            destination,
            identity: None,
            items: HashMap::new(),
            excluded: HashSet::new(),
            attempts: 0,
            delivered: false,
            last_error: None,
            response: None,
            cancel_pending: false,
            response_timeout,
            send_timeout: send_timeout(size, response_timeout, gateway.config().sending_speed_limit),
        };
        Automat::new(gateway.runtime(), "packet_out", PacketOutState::AtStartup, machine)
    }

    pub fn packet(&self) -> &Arc<Packet> {
        &self.outpacket
    }

    pub fn tracked_items(&self) -> usize {
        self.items.len()
    }

    fn direct_contact(&self) -> Option<Contact> {
        self.options
            .route
            .as_ref()
            .and_then(|route| route.direct_address())
            .map(|(proto, host)| Contact::new(proto, host))
    }

    fn start(&mut self, ctx: &mut Context<'_, Self>) -> PacketOutState {
        if let Err(e) = &self.data {
            let error = DeliveryError::Serialize(e.clone());
            return self.finish(ctx, PacketOutState::Failed, DeliveryOutcome::Failed(error));
        }
        if self.direct_contact().is_some() {
            return self.push_items(ctx);
        }
        if let Some(identity) = self.gateway.identities().get(&self.destination) {
            self.identity = Some(identity);
            return self.push_items(ctx);
        }
        debug!("{}: resolving identity of {}", self.outpacket, self.destination);
        let me = ctx.handle();
        self.gateway
            .identities()
            .resolve(&self.destination, move |result| {
                me.post(PacketOutEvent::IdentityResolved(result))
            });
        PacketOutState::Caching
    }

    fn select_targets(&self) -> Vec<Contact> {
        if let Some(contact) = self.direct_contact() {
            if self.excluded.contains(&contact.proto) {
                return Vec::new();
            }
            return vec![contact];
        }
        let Some(identity) = &self.identity else {
            return Vec::new();
        };
        let only = self.options.route.as_ref().and_then(|route| route.proto);
        let contacts: Vec<Contact> = identity
            .contacts()
            .iter()
            .filter(|c| only.map_or(true, |proto| c.proto == proto))
            .cloned()
            .collect();
        let working = self.gateway.working_protocols(&self.destination);
        let gateway = &self.gateway;
        let can_send = |proto: Protocol| gateway.can_send(proto);
        let is_listening = |proto: Protocol| gateway.is_listening(proto);
        Selection {
            contacts: &contacts,
            working: &working,
            priority: &gateway.config().priority,
            excluded: &self.excluded,
            can_send: &can_send,
            is_listening: &is_listening,
        }
        .pick(self.options.wide)
    }

    /// Create WorkItems for the selected contacts. Always lands in `Items`;
    /// the outcome arrives as `ItemsSent` or `NothingToSend`.
    fn push_items(&mut self, ctx: &mut Context<'_, Self>) -> PacketOutState {
        self.attempts += 1;
        let data = match &self.data {
            Ok(data) => data.clone(),
            Err(_) => {
                ctx.post(PacketOutEvent::NothingToSend);
                return PacketOutState::Items;
            }
        };

        let mut started = Vec::new();
        for contact in self.select_targets() {
            let me = ctx.handle();
            let result = self.gateway.send_work(
                contact.proto,
                data.clone(),
                &contact.host,
                &self.description,
                move |report| me.post(PacketOutEvent::ItemFinished(report)),
            );
            match result {
                Ok(transfer_id) => {
                    self.items.insert(
                        transfer_id,
                        WorkItem {
                            transfer_id,
                            proto: contact.proto,
                            host: contact.host.clone(),
                            size: data.len() as u64,
                        },
                    );
                    started.push(transfer_id);
                }
                Err(e) => {
                    debug!("{}: {} unusable: {}", self.outpacket, contact, e);
                    self.excluded.insert(contact.proto);
                    self.last_error = Some(e.to_string());
                }
            }
        }

        if started.is_empty() {
            ctx.post(PacketOutEvent::NothingToSend);
        } else {
            trace!("{}: {} item(s) to {}", self.outpacket, started.len(), self.destination);
            ctx.post(PacketOutEvent::ItemsSent);
            for transfer_id in started {
                ctx.post(PacketOutEvent::ItemStarted(transfer_id));
            }
        }
        PacketOutState::Items
    }

    fn record_finished(&mut self, report: TransferReport) {
        let Some(item) = self.items.remove(&report.transfer_id) else {
            trace!("{}: report for unknown transfer {}", self.outpacket, report.transfer_id);
            return;
        };
        let error = report.error.as_ref().map(|e| e.to_string());
        if report.status == TransferStatus::Finished {
            self.delivered = true;
        } else {
            debug!(
                "{}: {} to {} {}",
                self.outpacket, item.proto, item.host, report.status
            );
            self.excluded.insert(item.proto);
            self.last_error = Some(error.clone().unwrap_or_else(|| report.status.to_string()));
        }
        self.gateway.report_work_item(WorkItemReport {
            packet: self.outpacket.clone(),
            remote_id: self.destination.clone(),
            proto: item.proto,
            host: item.host,
            transfer_id: item.transfer_id,
            status: report.status,
            bytes: report.bytes,
            error,
        });
    }

    /// Every item is terminal; decide what comes next.
    fn items_done(&mut self, ctx: &mut Context<'_, Self>) -> PacketOutState {
        if self.delivered || self.response.is_some() {
            if let Some(response) = self.response.take() {
                return self.finish(
                    ctx,
                    PacketOutState::Sent,
                    DeliveryOutcome::Responded(response),
                );
            }
            if self.callbacks.wants_response() {
                return PacketOutState::Response;
            }
            return self.finish(ctx, PacketOutState::Sent, DeliveryOutcome::Sent);
        }
        if !self.options.wide {
            debug!("{}: every item failed, trying other protocols", self.outpacket);
            return self.push_items(ctx);
        }
        let error = DeliveryError::AllAttemptsFailed(self.last_error.clone().unwrap_or_default());
        self.finish(ctx, PacketOutState::Failed, DeliveryOutcome::Failed(error))
    }

    fn cancel_items(&mut self) -> usize {
        let items: Vec<WorkItem> = self.items.drain().map(|(_, item)| item).collect();
        for item in &items {
            self.gateway.cancel_transfer(item.proto, item.transfer_id);
            self.gateway.report_work_item(WorkItemReport {
                packet: self.outpacket.clone(),
                remote_id: self.destination.clone(),
                proto: item.proto,
                host: item.host.clone(),
                transfer_id: item.transfer_id,
                status: TransferStatus::Cancelled,
                bytes: 0,
                error: None,
            });
        }
        items.len()
    }

    fn cancel(&mut self, ctx: &mut Context<'_, Self>) -> PacketOutState {
        let cancelled = self.cancel_items();
        debug!("{}: cancelled with {} item(s) in flight", self.outpacket, cancelled);
        self.finish(ctx, PacketOutState::Cancel, DeliveryOutcome::Cancelled)
    }

    fn finish(
        &mut self,
        ctx: &mut Context<'_, Self>,
        state: PacketOutState,
        outcome: DeliveryOutcome,
    ) -> PacketOutState {
        match &outcome {
            DeliveryOutcome::Failed(e) => {
                warn!("{} to {} failed: {}", self.outpacket, self.destination, e)
            }
            DeliveryOutcome::TimedOut => {
                info!("{} to {}: no response in time", self.outpacket, self.destination)
            }
            other => debug!("{} to {}: {:?}", self.outpacket, self.destination, other),
        }
        for joined in self.joiners.close(&outcome) {
            self.callbacks.merge(joined);
        }
        self.callbacks.complete(&outcome);
        self.gateway.outbound_finished(ctx.id());
        ctx.destroy();
        state
    }
}

impl Machine for PacketOut {
    type State = PacketOutState;
    type Event = PacketOutEvent;

    fn timers(&self) -> Vec<TimerSpec<Self>> {
        use PacketOutState as S;
        vec![
            TimerSpec::new("send", self.send_timeout, &[S::InQueue, S::Sending], || {
                PacketOutEvent::SendTimeout
            }),
            TimerSpec::new("response", self.response_timeout, &[S::Response], || {
                PacketOutEvent::ResponseTimeout
            }),
        ]
    }

    fn transition(
        &mut self,
        ctx: &mut Context<'_, Self>,
        state: PacketOutState,
        event: PacketOutEvent,
    ) -> PacketOutState {
        use PacketOutEvent as E;
        use PacketOutState as S;

        for joined in self.joiners.take() {
            self.callbacks.merge(joined);
        }

        match (state, event) {
            (S::Sent | S::Failed | S::Cancel, _) => state,

            (S::AtStartup, E::Run) => self.start(ctx),

            (S::Caching, E::IdentityResolved(Ok(identity))) => {
                self.identity = Some(identity);
                self.push_items(ctx)
            }
            (S::Caching, E::IdentityResolved(Err(e))) => {
                self.finish(ctx, S::Failed, DeliveryOutcome::Failed(DeliveryError::Identity(e)))
            }

            (S::Items, E::Cancel) => {
                self.cancel_pending = true;
                S::Items
            }
            (S::Items, E::ItemsSent) => {
                if self.cancel_pending {
                    self.cancel(ctx)
                } else if self.items.is_empty() {
                    // every transfer already reported back
                    self.items_done(ctx)
                } else {
                    S::InQueue
                }
            }
            (S::Items, E::NothingToSend) => {
                if self.cancel_pending {
                    return self.cancel(ctx);
                }
                let error = match &self.data {
                    Err(e) => DeliveryError::Serialize(e.clone()),
                    Ok(_) if self.attempts > 1 => DeliveryError::AllAttemptsFailed(
                        self.last_error.clone().unwrap_or_default(),
                    ),
                    Ok(_) => DeliveryError::NothingToSend,
                };
                self.finish(ctx, S::Failed, DeliveryOutcome::Failed(error))
            }
            (S::Items, E::ItemFinished(report)) => {
                self.record_finished(report);
                S::Items
            }

            (S::InQueue | S::Sending, E::ItemStarted(_)) => S::Sending,
            (S::InQueue | S::Sending, E::ItemFinished(report)) => {
                self.record_finished(report);
                if self.items.is_empty() {
                    self.items_done(ctx)
                } else {
                    state
                }
            }
            (S::InQueue | S::Sending, E::SendTimeout) => {
                let cancelled = self.cancel_items();
                debug!("{}: send timeout, {} item(s) cancelled", self.outpacket, cancelled);
                self.finish(ctx, S::Failed, DeliveryOutcome::Failed(DeliveryError::SendTimeout))
            }

            (S::Response, E::InboxPacket(packet)) if self.callbacks.wants(packet.command()) => {
                self.callbacks.respond(&packet);
                self.finish(ctx, S::Sent, DeliveryOutcome::Responded(packet))
            }
            (_, E::InboxPacket(packet)) if self.callbacks.wants(packet.command()) => {
                // early response: keep the first one until the items are done
                if self.response.is_none() {
                    self.callbacks.respond(&packet);
                    self.response = Some(packet);
                }
                state
            }
            (S::Response, E::ResponseTimeout) => match self.options.timeout_policy {
                TimeoutPolicy::BestEffort => self.finish(ctx, S::Sent, DeliveryOutcome::TimedOut),
                TimeoutPolicy::Fail => self.finish(
                    ctx,
                    S::Failed,
                    DeliveryOutcome::Failed(DeliveryError::ResponseTimeout),
                ),
            },

            (_, E::Cancel) => self.cancel(ctx),

            (state, event) => {
                trace!("{}: ignored {:?} in {:?}", self.outpacket, event, state);
                state
            }
        }
    }
}
