//! Tunnel Core - byte-level multiplexing of one DCE among several DTEs
//!
//! Each endpoint gets a supervisor that bridges its transport to a pair of
//! byte channels. A tunnel routes DTE output to the DCE (or, after an escape
//! sequence, to the singleton monitor session) and broadcasts DCE output to
//! every DTE.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunnel_core::transport::memory::MemoryOpener;
//! use tunnel_core::{
//!     Endpoint, EndpointId, EscapeSequence, MonitorHandle, TransportConfig, Tunnel, TunnelId,
//!     TunnelOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let opener = Arc::new(MemoryOpener::new());
//!     let _dte_side = opener.attach("dte");
//!     let _dce_side = opener.attach("dce");
//!
//!     let port = |id, device: &str| {
//!         Endpoint::new(
//!             EndpointId(id),
//!             device,
//!             TransportConfig { device: device.to_string(), ..Default::default() },
//!         )
//!     };
//!     let tunnel = Tunnel::new(
//!         TunnelId(1),
//!         "lab router",
//!         vec![port(1, "dte")],
//!         port(2, "dce"),
//!         EscapeSequence::new(0x1B, 0x54),
//!     );
//!
//!     let (monitor, _session) = MonitorHandle::spawn();
//!     let handle = tunnel.start(opener, monitor, TunnelOptions::default()).unwrap();
//!     let report = handle.quit().await.unwrap();
//!     assert!(report.is_clean());
//! }
//! ```

mod error;
pub mod endpoint;
pub mod escape;
pub mod monitor;
mod router;
mod shutdown;
pub mod supervisor;
pub mod transport;
pub mod tunnel;

pub use endpoint::{Endpoint, EndpointId};
pub use error::TunnelError;
pub use escape::{EscapeAction, EscapeDetector, EscapeSequence, EscapeState};
pub use monitor::{AttachOutcome, Attachment, MonitorHandle, MonitorLease, SessionEvent, SessionIo};
pub use shutdown::ShutdownReport;
pub use supervisor::{SupervisorExit, SupervisorHandle};
pub use transport::{BoxedTransport, Parity, StopBits, TransportConfig, TransportOpener};
pub use tunnel::{Tunnel, TunnelHandle, TunnelId, TunnelOptions};
