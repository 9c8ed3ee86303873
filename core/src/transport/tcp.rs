// TCP stream driver
//
// One connection per transfer. Each transfer is one frame:
//   [u32 BE header length][bincode FrameHeader][payload]
// The header carries the sender's advertised listening address so the
// receiver can tell which contact the packet came from.

use super::abstraction::{
    InboundSink, Protocol, ReceivedTransfer, TransferId, TransferStatus, TransportError,
};
use super::driver::TransportDriver;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Frame headers are tiny; anything bigger is garbage.
const MAX_HEADER_SIZE: u32 = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameHeader {
    origin: String,
    description: String,
    size: u64,
}

type CancelMap = Arc<Mutex<HashMap<TransferId, oneshot::Sender<()>>>>;

#[derive(Debug, Clone)]
pub struct TcpDriverConfig {
    /// Address to bind, e.g. `0.0.0.0:7771`
    pub bind: String,
    /// Address published in the identity; defaults to the bound address
    pub advertise: Option<String>,
    pub connect_timeout: Duration,
    pub max_frame_size: u64,
}

impl Default for TcpDriverConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7771".to_string(),
            advertise: None,
            connect_timeout: Duration::from_secs(10),
            max_frame_size: crate::packet::MAX_PACKET_SIZE as u64,
        }
    }
}

pub struct TcpDriver {
    config: TcpDriverConfig,
    origin: RwLock<String>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    cancels: CancelMap,
}

impl TcpDriver {
    pub fn new(config: TcpDriverConfig) -> Self {
        Self {
            config,
            origin: RwLock::new(String::new()),
            accept_task: Mutex::new(None),
            connections: Arc::new(Mutex::new(Vec::new())),
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn write_frame(
        &self,
        host: &str,
        data: &[u8],
        description: &str,
    ) -> Result<u64, TransportError> {
        let header = FrameHeader {
            origin: self.origin.read().clone(),
            description: description.to_string(),
            size: data.len() as u64,
        };
        let header_bytes =
            bincode::serialize(&header).map_err(|e| TransportError::Io(e.to_string()))?;

        let mut stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(host))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect {}", host)))?
            .map_err(|e| TransportError::ConnectionRefused(format!("{}: {}", host, e)))?;
        stream.write_u32(header_bytes.len() as u32).await?;
        stream.write_all(&header_bytes).await?;
        stream.write_all(data).await?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(data.len() as u64)
    }
}

async fn read_header<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<FrameHeader>, TransportError> {
    let header_len = match stream.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if header_len > MAX_HEADER_SIZE {
        return Err(TransportError::FrameTooLarge(header_len as u64));
    }
    let mut raw = vec![0u8; header_len as usize];
    stream.read_exact(&mut raw).await?;
    bincode::deserialize(&raw)
        .map(Some)
        .map_err(|e| TransportError::Io(format!("bad frame header: {}", e)))
}

async fn serve_connection(
    mut stream: TcpStream,
    sink: InboundSink,
    cancels: CancelMap,
    max_frame_size: u64,
) {
    loop {
        let header = match read_header(&mut stream).await {
            Ok(Some(header)) => header,
            Ok(None) => return,
            Err(e) => {
                warn!("Dropping TCP connection: {}", e);
                return;
            }
        };
        let transfer_id = sink.begin(&header.origin, Some(header.size));
        let finished = |status, data, error| {
            sink.finish(ReceivedTransfer {
                transfer_id,
                proto: Protocol::Tcp,
                host: header.origin.clone(),
                status,
                expected_size: Some(header.size),
                data,
                error,
            })
        };
        if header.size > max_frame_size {
            finished(
                TransferStatus::Failed,
                Vec::new(),
                Some(TransportError::FrameTooLarge(header.size).to_string()),
            );
            return;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        cancels.lock().insert(transfer_id, cancel_tx);
        let mut data = vec![0u8; header.size as usize];
        let outcome = tokio::select! {
            r = stream.read_exact(&mut data) => r.map(|_| ()).map_err(TransportError::from),
            _ = cancel_rx => Err(TransportError::Cancelled(transfer_id)),
        };
        cancels.lock().remove(&transfer_id);

        match outcome {
            Ok(()) => {
                debug!("TCP received {} ({} bytes) from {}", header.description, header.size, header.origin);
                finished(TransferStatus::Finished, data, None);
            }
            Err(TransportError::Cancelled(_)) => {
                finished(TransferStatus::Cancelled, Vec::new(), None);
                return;
            }
            Err(e) => {
                finished(TransferStatus::Failed, Vec::new(), Some(e.to_string()));
                return;
            }
        }
    }
}

#[async_trait]
impl TransportDriver for TcpDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn start(&self, sink: InboundSink) -> Result<Vec<String>, TransportError> {
        let listener = TcpListener::bind(&self.config.bind)
            .await
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", self.config.bind, e)))?;
        let local = listener.local_addr()?.to_string();
        let origin = self.config.advertise.clone().unwrap_or(local);
        *self.origin.write() = origin.clone();
        info!("TCP listening on {} (advertised {})", self.config.bind, origin);

        let connections = self.connections.clone();
        let cancels = self.cancels.clone();
        let max_frame_size = self.config.max_frame_size;
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("TCP connection from {}", peer);
                        let handle = tokio::spawn(serve_connection(
                            stream,
                            sink.clone(),
                            cancels.clone(),
                            max_frame_size,
                        ));
                        let mut open = connections.lock();
                        open.retain(|h| !h.is_finished());
                        open.push(handle);
                    }
                    Err(e) => {
                        warn!("TCP accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        if let Some(previous) = self.accept_task.lock().replace(accept) {
            previous.abort();
        }
        Ok(vec![origin])
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if let Some(accept) = self.accept_task.lock().take() {
            accept.abort();
        }
        self.disconnect().await
    }

    async fn connect(&self, host: &str) -> Result<(), TransportError> {
        tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(host))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect {}", host)))?
            .map(|_| ())
            .map_err(|e| TransportError::ConnectionRefused(format!("{}: {}", host, e)))
    }

    async fn send(
        &self,
        transfer_id: TransferId,
        host: &str,
        data: Arc<Vec<u8>>,
        description: &str,
    ) -> Result<u64, TransportError> {
        if data.len() as u64 > self.config.max_frame_size {
            return Err(TransportError::FrameTooLarge(data.len() as u64));
        }
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancels.lock().insert(transfer_id, cancel_tx);
        let outcome = tokio::select! {
            r = self.write_frame(host, &data, description) => r,
            _ = cancel_rx => Err(TransportError::Cancelled(transfer_id)),
        };
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
        for handle in self.connections.lock().drain(..) {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_header_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let header = FrameHeader {
            origin: "127.0.0.1:7771".into(),
            description: "Data[1]".into(),
            size: 3,
        };
        let bytes = bincode::serialize(&header).unwrap();
        client.write_u32(bytes.len() as u32).await.unwrap();
        client.write_all(&bytes).await.unwrap();
        drop(client);

        let decoded = read_header(&mut server).await.unwrap().unwrap();
        assert_eq!(decoded.origin, "127.0.0.1:7771");
        assert_eq!(decoded.size, 3);
        assert!(read_header(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_header_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(MAX_HEADER_SIZE + 1).await.unwrap();
        assert!(matches!(
            read_header(&mut server).await,
            Err(TransportError::FrameTooLarge(_))
        ));
    }
}
