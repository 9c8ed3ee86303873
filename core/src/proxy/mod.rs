//! Proxy relay
//!
//! A node that cannot be reached directly (the receiver) asks a reachable
//! peer (the router) to stand in for it. Outside peers send to the router's
//! addresses, the router wraps what it gets into encrypted `Relay` packets
//! for the receiver, and the receiver's own outgoing traffic goes the other
//! way through the same router (the sender).

pub mod envelope;
pub mod receiver;
pub mod router;
pub mod routes;
pub mod sender;

pub use envelope::RoutedPayload;
pub use receiver::{ProxyReceiver, ReceiverState};
pub use router::{ProxyRouter, RouterState};
pub use routes::{Route, RouteTable, RouteTraffic};
pub use sender::{ProxySender, SenderState};

use crate::crypto::CryptoError;
use crate::identity::{IdUrl, Identity, IdentityError};
use crate::packet::PacketError;
use crate::store::SettingsError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the service a receiver requests from its router.
pub const SERVICE_NAME: &str = "service_proxy_server";

/// Reasons carried in `Fail` answers to service requests and relays.
pub const REASON_TOO_MANY_ROUTES: &str = "too many routes";
pub const REASON_ROUTE_NOT_EXIST: &str = "route not exist";
pub const REASON_BAD_REQUEST: &str = "bad request";
pub const REASON_ACCEPTED: &str = "accepted";
pub const REASON_ROUTED_FAILED: &str = "routed packet delivery failed";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Malformed routed payload: {0}")]
    MalformedPayload(String),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Route table is full")]
    TooManyRoutes,

    #[error("No route for {0}")]
    RouteNotExist(IdUrl),

    #[error("Bad service request: {0}")]
    BadRequest(String),
}

/// Payload of `RequestService` and `CancelService`:
/// `{"name": "service_proxy_server", "payload": {"identity": {...}}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub name: String,
    #[serde(default)]
    pub payload: ServicePayload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

impl ServiceRequest {
    pub fn proxy(identity: Option<Identity>) -> Self {
        Self {
            name: SERVICE_NAME.to_string(),
            payload: ServicePayload { identity },
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProxyError> {
        serde_json::to_vec(self).map_err(|e| ProxyError::BadRequest(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProxyError> {
        serde_json::from_slice(bytes).map_err(|e| ProxyError::BadRequest(e.to_string()))
    }

    pub fn is_proxy(&self) -> bool {
        self.name == SERVICE_NAME
    }
}
