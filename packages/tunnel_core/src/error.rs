use crate::endpoint::EndpointId;

/// Errors that can occur while wiring or running tunnels
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The transport behind an endpoint could not be opened
    #[error("failed to open transport '{device}': {source}")]
    TransportOpen {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// A receiving half of an endpoint channel was already claimed
    #[error("endpoint {0} channels are already claimed")]
    EndpointInUse(EndpointId),

    /// The monitor hub task is no longer running
    #[error("monitor hub is gone")]
    MonitorGone,

    /// A tunnel or supervisor task panicked or was aborted
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Transport I/O failure
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}
