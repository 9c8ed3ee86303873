//! Transport abstraction layer
//!
//! Core types shared by every protocol: protocol names, transfer ids,
//! transfer reports and the errors drivers return.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Protocols a node can carry packets over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Http,
    /// Reached through a proxy router
    Proxy,
}

impl Protocol {
    /// Fixed preference order used by transport selection.
    pub const PRIORITY: [Protocol; 4] = [Protocol::Tcp, Protocol::Udp, Protocol::Http, Protocol::Proxy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Http => "http",
            Protocol::Proxy => "proxy",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "http" => Ok(Protocol::Http),
            "proxy" => Ok(Protocol::Proxy),
            other => Err(TransportError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Identifier of one transfer, unique across all adapters of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared transfer id generator
#[derive(Debug, Clone, Default)]
pub struct TransferIds(Arc<AtomicU64>);

impl TransferIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> TransferId {
        TransferId(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Terminal status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Finished,
    Failed,
    Cancelled,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Finished => write!(f, "finished"),
            TransferStatus::Failed => write!(f, "failed"),
            TransferStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of an outbound transfer as reported by an adapter
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub transfer_id: TransferId,
    pub proto: Protocol,
    pub host: String,
    pub status: TransferStatus,
    pub bytes: u64,
    pub error: Option<TransportError>,
}

impl TransferReport {
    pub fn from_result(
        transfer_id: TransferId,
        proto: Protocol,
        host: String,
        result: Result<u64, TransportError>,
    ) -> Self {
        let (status, bytes, error) = match result {
            Ok(bytes) => (TransferStatus::Finished, bytes, None),
            Err(TransportError::Cancelled(_)) => (TransferStatus::Cancelled, 0, None),
            Err(e) => (TransferStatus::Failed, 0, Some(e)),
        };
        Self {
            transfer_id,
            proto,
            host,
            status,
            bytes,
            error,
        }
    }
}

/// A finished inbound transfer handed to the gateway
#[derive(Debug, Clone)]
pub struct ReceivedTransfer {
    pub transfer_id: TransferId,
    pub proto: Protocol,
    /// Address the remote side reported as its own
    pub host: String,
    pub status: TransferStatus,
    /// Size the sender declared up front, if any
    pub expected_size: Option<u64>,
    pub data: Vec<u8>,
    pub error: Option<String>,
}

type BeginFn = dyn Fn(&str, Option<u64>) -> TransferId + Send + Sync;
type FinishFn = dyn Fn(ReceivedTransfer) + Send + Sync;

/// Where a driver reports inbound transfers. Safe to call from any task.
#[derive(Clone)]
pub struct InboundSink {
    begin: Arc<BeginFn>,
    finish: Arc<FinishFn>,
}

impl InboundSink {
    pub fn new(
        begin: impl Fn(&str, Option<u64>) -> TransferId + Send + Sync + 'static,
        finish: impl Fn(ReceivedTransfer) + Send + Sync + 'static,
    ) -> Self {
        Self {
            begin: Arc::new(begin),
            finish: Arc::new(finish),
        }
    }

    /// A transfer from `host` started; returns its id.
    pub fn begin(&self, host: &str, expected_size: Option<u64>) -> TransferId {
        (self.begin)(host, expected_size)
    }

    pub fn finish(&self, transfer: ReceivedTransfer) {
        (self.finish)(transfer)
    }
}

impl fmt::Debug for InboundSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InboundSink")
    }
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport {0} is not listening")]
    NotListening(Protocol),

    #[error("Transport {0} is not installed")]
    NotInstalled(Protocol),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Transfer {0} cancelled")]
    Cancelled(TransferId),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u64),

    #[error("Transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}
