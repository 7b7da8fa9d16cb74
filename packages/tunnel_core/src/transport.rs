//! The byte-stream seam between endpoints and whatever carries their bytes.
//!
//! The core never looks inside [`TransportConfig`]; it hands it to a
//! [`TransportOpener`] and gets back something it can read and write one byte
//! at a time.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TunnelError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

/// Line settings and device locator for one endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub device: String,
    pub speed: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            speed: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        let stop = match self.stop_bits {
            StopBits::One => "1",
            StopBits::OnePointFive => "1.5",
            StopBits::Two => "2",
        };
        write!(
            f,
            "{} {} {}{}{}",
            self.device, self.speed, self.data_bits, parity, stop
        )
    }
}

/// An open byte stream
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens transports on behalf of endpoint supervisors
pub trait TransportOpener: Send + Sync {
    fn open<'a>(
        &'a self,
        config: &'a TransportConfig,
    ) -> BoxFuture<'a, Result<BoxedTransport, TunnelError>>;
}

pub mod memory {
    //! In-memory transports backed by [`tokio::io::duplex`].

    use super::{BoxedTransport, TransportConfig, TransportOpener};
    use crate::error::TunnelError;
    use futures::future::BoxFuture;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    const DUPLEX_BUFFER: usize = 1024;

    /// Hands out one side of a duplex pipe per device name and keeps the
    /// other side for whoever calls [`MemoryOpener::open`].
    #[derive(Debug, Default)]
    pub struct MemoryOpener {
        pending: Mutex<HashMap<String, DuplexStream>>,
    }

    impl MemoryOpener {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register `device` and return the far side of its pipe.
        ///
        /// Bytes written to the returned stream are what the endpoint reads
        /// from its transport, and vice versa.
        pub fn attach(&self, device: &str) -> DuplexStream {
            let (near, far) = tokio::io::duplex(DUPLEX_BUFFER);
            self.pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(device.to_string(), near);
            far
        }
    }

    impl TransportOpener for MemoryOpener {
        fn open<'a>(
            &'a self,
            config: &'a TransportConfig,
        ) -> BoxFuture<'a, Result<BoxedTransport, TunnelError>> {
            Box::pin(async move {
                let stream = self
                    .pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&config.device)
                    .ok_or_else(|| TunnelError::TransportOpen {
                        device: config.device.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "no in-memory transport registered",
                        ),
                    })?;
                Ok(Box::new(stream) as BoxedTransport)
            })
        }
    }
}
