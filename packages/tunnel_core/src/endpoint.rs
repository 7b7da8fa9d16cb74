use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::transport::TransportConfig;

/// Byte channels between supervisors and routers hold at most one byte,
/// keeping delivery byte-granular.
pub const BYTE_CHANNEL_CAPACITY: usize = 1;

/// Unique identifier for an endpoint
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EndpointId(pub u32);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One direction of byte flow. The sending half can be cloned freely; the
/// receiving half is claimed exactly once.
#[derive(Debug)]
struct ByteChannel {
    tx: mpsc::Sender<u8>,
    rx: Mutex<Option<mpsc::Receiver<u8>>>,
}

impl ByteChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(BYTE_CHANNEL_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn take(&self) -> Option<mpsc::Receiver<u8>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// A serial-like endpoint and the channels its supervisor and peers share.
///
/// Endpoints are created once and handed around as `Arc<Endpoint>`; they are
/// deliberately not `Clone`, since a copy would carry a second, disconnected
/// channel set.
#[derive(Debug)]
pub struct Endpoint {
    id: EndpointId,
    description: String,
    transport: TransportConfig,
    /// Bytes to write to the transport
    inbound: ByteChannel,
    /// Bytes read from the transport
    outbound: ByteChannel,
    shutdown: CancellationToken,
}

impl Endpoint {
    pub fn new(
        id: EndpointId,
        description: impl Into<String>,
        transport: TransportConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            description: description.into(),
            transport,
            inbound: ByteChannel::new(),
            outbound: ByteChannel::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Sender for bytes that should be written to this endpoint's transport
    pub fn inbound(&self) -> mpsc::Sender<u8> {
        self.inbound.tx.clone()
    }

    pub(crate) fn outbound_sender(&self) -> mpsc::Sender<u8> {
        self.outbound.tx.clone()
    }

    pub(crate) fn take_inbound(&self) -> Result<mpsc::Receiver<u8>, TunnelError> {
        self.inbound.take().ok_or(TunnelError::EndpointInUse(self.id))
    }

    /// Claim the stream of bytes read from this endpoint's transport.
    ///
    /// Only one consumer may ever hold it.
    pub fn take_outbound(&self) -> Result<mpsc::Receiver<u8>, TunnelError> {
        self.outbound.take().ok_or(TunnelError::EndpointInUse(self.id))
    }

    /// Ask the supervisor to stop. Never blocks, and is a no-op once the
    /// supervisor is gone.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
