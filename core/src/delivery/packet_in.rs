// Inbound delivery: one machine per received transfer
//
//   AT_STARTUP -> RECEIVING -> CACHING? -> INBOX? -> DONE | FAILED

use crate::automat::{Automat, Context, Machine, TimerSpec};
use crate::gateway::{Gateway, InboundInfo};
use crate::identity::{Identity, IdentityError};
use crate::packet::{decode, Command, Packet};
use crate::transport::{ReceivedTransfer, TransferStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketInState {
    AtStartup,
    Receiving,
    Caching,
    Inbox,
    Done,
    Failed,
}

#[derive(Debug)]
pub enum PacketInEvent {
    Start,
    Finished(ReceivedTransfer),
    IdentityResolved(Result<Arc<Identity>, IdentityError>),
    Verify,
    Timeout,
    Cancel,
}

pub struct PacketIn {
    gateway: Gateway,
    info: InboundInfo,
    expected_size: Option<u64>,
    packet: Option<Arc<Packet>>,
    creator: Option<Arc<Identity>>,
    receive_timeout: Duration,
}

impl PacketIn {
    pub(crate) fn spawn(
        gateway: &Gateway,
        info: InboundInfo,
        expected_size: Option<u64>,
    ) -> Automat<PacketIn> {
        let machine = PacketIn {
            gateway: gateway.clone(),
            info,
            expected_size,
            packet: None,
            creator: None,
            receive_timeout: gateway.config().receive_timeout(),
        };
        Automat::new(gateway.runtime(), "packet_in", PacketInState::AtStartup, machine)
    }

    pub fn info(&self) -> &InboundInfo {
        &self.info
    }

    fn received(&mut self, ctx: &mut Context<'_, Self>, transfer: ReceivedTransfer) -> PacketInState {
        if transfer.status != TransferStatus::Finished {
            let reason = transfer.error.unwrap_or_else(|| transfer.status.to_string());
            return self.fail(ctx, &format!("transfer {}", reason));
        }
        if let Some(expected) = self.expected_size.or(transfer.expected_size) {
            if transfer.data.len() as u64 != expected {
                let reason = format!("got {} bytes, expected {}", transfer.data.len(), expected);
                return self.fail(ctx, &reason);
            }
        }
        // the raw bytes are dropped right after decoding
        let packet = match decode(&transfer.data) {
            Ok(packet) => Arc::new(packet),
            Err(e) => return self.fail(ctx, &e.to_string()),
        };
        trace!("{:?} arrived via {} from {}", packet, self.info.proto, self.info.host);
        self.packet = Some(packet.clone());

        let cache = self.gateway.identities();
        if let Some(identity) = cache.get(packet.creator_id()) {
            self.creator = Some(identity);
            ctx.post(PacketInEvent::Verify);
            return PacketInState::Inbox;
        }
        if let Some(identity) = self.identity_from_payload(&packet) {
            self.creator = Some(identity);
            ctx.post(PacketInEvent::Verify);
            return PacketInState::Inbox;
        }
        let me = ctx.handle();
        cache.resolve(packet.creator_id(), move |result| {
            me.post(PacketInEvent::IdentityResolved(result))
        });
        PacketInState::Caching
    }

    /// An `Identity` packet from an unknown node carries what is needed to
    /// check its own signature.
    fn identity_from_payload(&self, packet: &Packet) -> Option<Arc<Identity>> {
        if packet.command() != Command::Identity || packet.owner_id() != packet.creator_id() {
            return None;
        }
        let identity = Identity::from_json(packet.payload()).ok()?;
        if identity.idurl() != packet.creator_id() {
            return None;
        }
        match self.gateway.identities().remember(identity) {
            Ok(identity) => Some(identity),
            Err(e) => {
                debug!("Identity carried by {} rejected: {}", packet, e);
                None
            }
        }
    }

    fn verify(&mut self, ctx: &mut Context<'_, Self>) -> PacketInState {
        let (Some(packet), Some(creator)) = (self.packet.clone(), self.creator.clone()) else {
            return self.fail(ctx, "nothing to verify");
        };
        if let Err(e) = packet.verify_with(&creator) {
            return self.fail(ctx, &e.to_string());
        }
        let handled = self.gateway.dispatch_inbound(packet.clone(), &self.info);
        trace!("{} dispatched, handled: {}", packet, handled);
        self.gateway
            .inbound_finished(&self.info, Some(packet.creator_id()), true);
        self.packet = None;
        ctx.destroy();
        PacketInState::Done
    }

    fn fail(&mut self, ctx: &mut Context<'_, Self>, reason: &str) -> PacketInState {
        let peer = self.packet.as_ref().map(|p| p.creator_id().clone());
        match &peer {
            Some(peer) => warn!(
                "Dropped inbound {} from {} via {}: {}",
                self.info.transfer_id, peer, self.info.proto, reason
            ),
            None => warn!(
                "Dropped inbound {} via {} from {}: {}",
                self.info.transfer_id, self.info.proto, self.info.host, reason
            ),
        }
        self.gateway.inbound_finished(&self.info, peer.as_ref(), false);
        self.packet = None;
        ctx.destroy();
        PacketInState::Failed
    }
}

impl Machine for PacketIn {
    type State = PacketInState;
    type Event = PacketInEvent;

    fn timers(&self) -> Vec<TimerSpec<Self>> {
        vec![TimerSpec::new(
            "receive",
            self.receive_timeout,
            &[PacketInState::Receiving],
            || PacketInEvent::Timeout,
        )]
    }

    fn transition(
        &mut self,
        ctx: &mut Context<'_, Self>,
        state: PacketInState,
        event: PacketInEvent,
    ) -> PacketInState {
        use PacketInEvent as E;
        use PacketInState as S;

        match (state, event) {
            (S::Done | S::Failed, _) => state,

            (S::AtStartup, E::Start) => S::Receiving,
            (S::AtStartup | S::Receiving, E::Finished(transfer)) => self.received(ctx, transfer),
            (S::Receiving, E::Timeout) => {
                self.gateway
                    .cancel_transfer(self.info.proto, self.info.transfer_id);
                self.fail(ctx, "receive timeout")
            }

            (S::Caching, E::IdentityResolved(Ok(identity))) => {
                self.creator = Some(identity);
                ctx.post(E::Verify);
                S::Inbox
            }
            (S::Caching, E::IdentityResolved(Err(e))) => self.fail(ctx, &e.to_string()),

            (S::Inbox, E::Verify) => self.verify(ctx),

            (_, E::Cancel) => {
                if state == S::Receiving {
                    self.gateway
                        .cancel_transfer(self.info.proto, self.info.transfer_id);
                }
                self.fail(ctx, "cancelled")
            }

            (state, event) => {
                trace!("packet_in {}: ignored {:?} in {:?}", self.info.transfer_id, event, state);
                state
            }
        }
    }
}
