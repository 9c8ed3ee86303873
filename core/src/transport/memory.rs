// In-process transport driver
//
// Every MemoryDriver attached to the same MemoryNetwork can reach the others
// by (protocol, host). Used by tests and single-process deployments.

use super::abstraction::{
    InboundSink, Protocol, ReceivedTransfer, TransferId, TransferStatus, TransportError,
};
use super::driver::TransportDriver;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Default)]
struct NetworkInner {
    endpoints: RwLock<HashMap<(Protocol, String), InboundSink>>,
    unreachable: RwLock<HashSet<(Protocol, String)>>,
    latency: RwLock<Option<Duration>>,
    delivered: Mutex<u64>,
}

/// Shared medium connecting memory drivers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every transfer from now on.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.write() = Some(latency);
    }

    pub fn clear_latency(&self) {
        *self.inner.latency.write() = None;
    }

    /// Make `host` refuse connections over `proto` (or accept them again).
    pub fn set_reachable(&self, proto: Protocol, host: &str, reachable: bool) {
        let key = (proto, host.to_string());
        if reachable {
            self.inner.unreachable.write().remove(&key);
        } else {
            self.inner.unreachable.write().insert(key);
        }
    }

    /// Transfers delivered so far.
    pub fn delivered(&self) -> u64 {
        *self.inner.delivered.lock()
    }

    fn listen(&self, proto: Protocol, host: &str, sink: InboundSink) {
        self.inner
            .endpoints
            .write()
            .insert((proto, host.to_string()), sink);
    }

    fn unlisten(&self, proto: Protocol, host: &str) {
        self.inner
            .endpoints
            .write()
            .remove(&(proto, host.to_string()));
    }

    fn endpoint(&self, proto: Protocol, host: &str) -> Option<InboundSink> {
        let key = (proto, host.to_string());
        if self.inner.unreachable.read().contains(&key) {
            return None;
        }
        self.inner.endpoints.read().get(&key).cloned()
    }

    fn latency(&self) -> Option<Duration> {
        *self.inner.latency.read()
    }
}

pub struct MemoryDriver {
    network: MemoryNetwork,
    proto: Protocol,
    host: String,
    cancels: Mutex<HashMap<TransferId, oneshot::Sender<()>>>,
}

impl MemoryDriver {
    pub fn new(network: &MemoryNetwork, proto: Protocol, host: impl Into<String>) -> Self {
        Self {
            network: network.clone(),
            proto,
            host: host.into(),
            cancels: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TransportDriver for MemoryDriver {
    fn protocol(&self) -> Protocol {
        self.proto
    }

    async fn start(&self, sink: InboundSink) -> Result<Vec<String>, TransportError> {
        self.network.listen(self.proto, &self.host, sink);
        Ok(vec![self.host.clone()])
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.network.unlisten(self.proto, &self.host);
        Ok(())
    }

    async fn connect(&self, host: &str) -> Result<(), TransportError> {
        self.network
            .endpoint(self.proto, host)
            .map(|_| ())
            .ok_or_else(|| TransportError::ConnectionRefused(host.to_string()))
    }

    async fn send(
        &self,
        transfer_id: TransferId,
        host: &str,
        data: Arc<Vec<u8>>,
        description: &str,
    ) -> Result<u64, TransportError> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancels.lock().insert(transfer_id, cancel_tx);

        let outcome = async {
            match self.network.latency() {
                Some(latency) => {
                    tokio::select! {
                        _ = tokio::time::sleep(latency) => {}
                        _ = cancel_rx => return Err(TransportError::Cancelled(transfer_id)),
                    }
                }
                None => tokio::task::yield_now().await,
            }
            // Resolved after the delay so a peer going away mid-transfer fails it.
            let sink = self
                .network
                .endpoint(self.proto, host)
                .ok_or_else(|| TransportError::ConnectionRefused(host.to_string()))?;
            let size = data.len() as u64;
            let remote_id = sink.begin(&self.host, Some(size));
            sink.finish(ReceivedTransfer {
                transfer_id: remote_id,
                proto: self.proto,
                host: self.host.clone(),
                status: TransferStatus::Finished,
                expected_size: Some(size),
                data: data.as_ref().clone(),
                error: None,
            });
            *self.network.inner.delivered.lock() += 1;
            trace!("{} {} -> {}: {} ({} bytes)", self.proto, self.host, host, description, size);
            Ok(size)
        }
        .await;

        self.cancels.lock().remove(&transfer_id);
        outcome
    }

    fn cancel(&self, transfer_id: TransferId) -> bool {
        match self.cancels.lock().remove(&transfer_id) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::abstraction::TransferIds;

    fn collecting_sink() -> (InboundSink, Arc<Mutex<Vec<ReceivedTransfer>>>) {
        let ids = TransferIds::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let store = received.clone();
        let sink = InboundSink::new(move |_, _| ids.next(), move |t| store.lock().push(t));
        (sink, received)
    }

    #[tokio::test]
    async fn test_delivers_to_listening_host() {
        let network = MemoryNetwork::new();
        let alice = MemoryDriver::new(&network, Protocol::Tcp, "alice:1");
        let bob = MemoryDriver::new(&network, Protocol::Tcp, "bob:1");
        let (sink, received) = collecting_sink();
        bob.start(sink).await.unwrap();

        let sent = alice
            .send(TransferId(1), "bob:1", Arc::new(b"hello".to_vec()), "Data")
            .await
            .unwrap();
        assert_eq!(sent, 5);
        let received = received.lock();
        assert_eq!(received[0].data, b"hello");
        assert_eq!(received[0].host, "alice:1");
        assert_eq!(network.delivered(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_and_wrong_protocol() {
        let network = MemoryNetwork::new();
        let alice = MemoryDriver::new(&network, Protocol::Udp, "alice:1");
        let bob = MemoryDriver::new(&network, Protocol::Tcp, "bob:1");
        let (sink, _) = collecting_sink();
        bob.start(sink).await.unwrap();

        let err = alice
            .send(TransferId(1), "bob:1", Arc::new(vec![1]), "Data")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::ConnectionRefused("bob:1".into()));

        network.set_reachable(Protocol::Tcp, "bob:1", false);
        assert!(bob.connect("bob:1").await.is_err());
    }
}
