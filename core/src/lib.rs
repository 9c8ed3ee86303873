// Courier Core: packet delivery and proxy relay
//
// Every outgoing packet, every incoming transfer and every proxy role is a
// small state machine on one event loop. Nothing here is global: a node is
// its Runtime, its Gateway and the machines attached to them.

pub mod automat;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod dht;
pub mod gateway;
pub mod identity;
pub mod logging;
pub mod node;
pub mod packet;
pub mod proxy;
pub mod store;
pub mod transport;

use thiserror::Error;

pub use automat::{Automat, Machine, Runtime};
pub use config::{CourierConfig, GatewayConfig, ProxyConfig};
pub use delivery::{
    Callbacks, Delivery, DeliveryError, DeliveryOutcome, OutboxOptions, RouteOverride,
    TimeoutPolicy,
};
pub use gateway::{Gateway, InboundInfo};
pub use identity::{Contact, IdUrl, Identity, IdentityCache, IdentityKeys, LocalIdentity};
pub use node::{Node, NodeBuilder};
pub use packet::{Command, Packet};
pub use proxy::{ProxyReceiver, ProxyRouter, ProxySender};
pub use transport::Protocol;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum CourierError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Identity(#[from] identity::IdentityError),

    #[error(transparent)]
    Packet(#[from] packet::PacketError),

    #[error(transparent)]
    Delivery(#[from] delivery::DeliveryError),

    #[error(transparent)]
    Transport(#[from] transport::TransportError),

    #[error(transparent)]
    Proxy(#[from] proxy::ProxyError),

    #[error(transparent)]
    Settings(#[from] store::SettingsError),

    #[error(transparent)]
    Storage(#[from] store::StorageError),
}

pub type Result<T> = std::result::Result<T, CourierError>;
