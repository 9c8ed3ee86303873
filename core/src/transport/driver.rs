// Driver trait: the protocol I/O behind a transport adapter

use super::abstraction::{InboundSink, Protocol, TransferId, TransportError};
use async_trait::async_trait;
use std::sync::Arc;

/// Protocol-specific I/O. The lifecycle around it lives in
/// [`TransportAdapter`](super::TransportAdapter); drivers never see packets,
/// only bytes.
#[async_trait]
pub trait TransportDriver: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Start accepting inbound transfers. Returns the hosts this node can be
    /// reached at over this protocol.
    async fn start(&self, sink: InboundSink) -> Result<Vec<String>, TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;

    /// Open a connection ahead of the first transfer.
    async fn connect(&self, host: &str) -> Result<(), TransportError>;

    /// Move `data` to `host`. Resolves with the number of bytes delivered.
    async fn send(
        &self,
        transfer_id: TransferId,
        host: &str,
        data: Arc<Vec<u8>>,
        description: &str,
    ) -> Result<u64, TransportError>;

    /// Abort a transfer in either direction. Returns false when unknown.
    fn cancel(&self, transfer_id: TransferId) -> bool;

    /// Drop every open connection.
    async fn disconnect(&self) -> Result<(), TransportError>;
}
