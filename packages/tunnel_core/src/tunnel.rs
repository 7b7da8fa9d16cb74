use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::endpoint::{Endpoint, EndpointId};
use crate::error::TunnelError;
use crate::escape::EscapeSequence;
use crate::monitor::MonitorHandle;
use crate::router;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::supervisor::SupervisorHandle;
use crate::transport::TransportOpener;

/// Unique identifier for a tunnel
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TunnelId(pub u32);

impl std::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct TunnelOptions {
    /// Upper bound on each wait during shutdown
    pub shutdown_timeout: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

/// One DCE shared by one or more DTEs.
///
/// References are assumed valid; whoever builds tunnels from configuration
/// checks them first.
#[derive(Debug)]
pub struct Tunnel {
    id: TunnelId,
    description: String,
    dtes: Vec<Arc<Endpoint>>,
    dce: Arc<Endpoint>,
    escape: EscapeSequence,
}

impl Tunnel {
    pub fn new(
        id: TunnelId,
        description: impl Into<String>,
        dtes: Vec<Arc<Endpoint>>,
        dce: Arc<Endpoint>,
        escape: EscapeSequence,
    ) -> Self {
        Self {
            id,
            description: description.into(),
            dtes,
            dce,
            escape,
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn dtes(&self) -> &[Arc<Endpoint>] {
        &self.dtes
    }

    pub fn dce(&self) -> &Arc<Endpoint> {
        &self.dce
    }

    pub fn escape(&self) -> EscapeSequence {
        self.escape
    }

    /// Bring up every endpoint supervisor and the routing loops, then wait in
    /// the background for the quit request.
    pub fn start(
        self,
        opener: Arc<dyn TransportOpener>,
        monitor: MonitorHandle,
        options: TunnelOptions,
    ) -> Result<TunnelHandle, TunnelError> {
        info!(tunnel = %self.id, "Start tunnel {} ({})", self.id, self.description);

        let stop = CancellationToken::new();
        let loops = router::spawn(&self, &monitor, &stop)?;

        let supervisors = self
            .dtes
            .iter()
            .chain(std::iter::once(&self.dce))
            .map(|endpoint| {
                info!(
                    tunnel = %self.id,
                    "Start {} ({}) as {}",
                    endpoint.transport().device,
                    endpoint.description(),
                    if Arc::ptr_eq(endpoint, &self.dce) { "DCE" } else { "DTE" }
                );
                SupervisorHandle::spawn(Arc::clone(endpoint), Arc::clone(&opener))
            })
            .collect();

        let quit = CancellationToken::new();
        let coordinator = ShutdownCoordinator {
            tunnel: self.id,
            stop,
            loops,
            supervisors,
            grace: options.shutdown_timeout,
        };
        let quit_request = quit.clone();
        let task = tokio::spawn(async move {
            quit_request.cancelled().await;
            coordinator.run().await
        });

        Ok(TunnelHandle {
            id: self.id,
            description: self.description,
            dtes: self.dtes.iter().map(|dte| dte.id()).collect(),
            dce: self.dce.id(),
            quit,
            task,
            monitor,
        })
    }
}

/// Handle to a running tunnel
#[derive(Debug)]
pub struct TunnelHandle {
    id: TunnelId,
    description: String,
    dtes: Vec<EndpointId>,
    dce: EndpointId,
    quit: CancellationToken,
    task: JoinHandle<ShutdownReport>,
    monitor: MonitorHandle,
}

impl TunnelHandle {
    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn dte_ids(&self) -> &[EndpointId] {
        &self.dtes
    }

    pub fn dce_id(&self) -> EndpointId {
        self.dce
    }

    /// Fire the quit request without waiting for the teardown
    pub fn request_quit(&self) {
        self.quit.cancel();
    }

    /// Fire the quit request and wait for the tunnel to stop
    pub async fn quit(self) -> Result<ShutdownReport, TunnelError> {
        self.quit.cancel();
        Ok(self.task.await?)
    }

    /// Which of this tunnel's DTEs are diverted to the monitor
    pub async fn diversions(&self) -> Result<HashMap<EndpointId, bool>, TunnelError> {
        self.monitor.diversions(self.id, &self.dtes).await
    }
}
