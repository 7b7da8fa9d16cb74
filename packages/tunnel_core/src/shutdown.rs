//! Deterministic teardown of one tunnel: routing loops first, then the
//! supervisors of the endpoints the tunnel owns.

use futures::future::join_all;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::endpoint::EndpointId;
use crate::router::RouterTask;
use crate::supervisor::{SupervisorExit, SupervisorHandle};
use crate::tunnel::TunnelId;

/// What happened while a tunnel was torn down
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub tunnel: Option<TunnelId>,
    /// Routing loops confirmed stopped
    pub loops_stopped: usize,
    /// Routing loops that missed the deadline
    pub loops_unresponsive: Vec<String>,
    pub endpoints_stopped: Vec<EndpointId>,
    /// Supervisors that had ended with an error, usually a transport that
    /// never opened
    pub endpoints_failed: Vec<EndpointId>,
    /// Supervisors that did not return within the grace period
    pub endpoints_unresponsive: Vec<EndpointId>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.loops_unresponsive.is_empty()
            && self.endpoints_failed.is_empty()
            && self.endpoints_unresponsive.is_empty()
    }
}

pub(crate) struct ShutdownCoordinator {
    pub tunnel: TunnelId,
    pub stop: CancellationToken,
    pub loops: Vec<RouterTask>,
    pub supervisors: Vec<SupervisorHandle>,
    pub grace: Duration,
}

impl ShutdownCoordinator {
    pub async fn run(self) -> ShutdownReport {
        let tunnel = self.tunnel;
        info!(tunnel = %tunnel, "Stopping tunnel");
        let mut report = ShutdownReport {
            tunnel: Some(tunnel),
            ..Default::default()
        };

        self.stop.cancel();
        for RouterTask { name, task } in self.loops {
            match tokio::time::timeout(self.grace, task).await {
                Ok(Ok(())) => report.loops_stopped += 1,
                Ok(Err(e)) => {
                    warn!(tunnel = %tunnel, "{} routine failed: {}", name, e);
                    report.loops_stopped += 1;
                }
                Err(_) => {
                    warn!(tunnel = %tunnel, "{} routine did not stop within {:?}", name, self.grace);
                    report.loops_unresponsive.push(name);
                }
            }
        }

        let grace = self.grace;
        let results = join_all(self.supervisors.into_iter().map(|supervisor| async move {
            let id = supervisor.endpoint_id();
            (id, supervisor.shutdown(grace).await)
        }))
        .await;
        for (id, exit) in results {
            match exit {
                SupervisorExit::Stopped => report.endpoints_stopped.push(id),
                SupervisorExit::Failed(_) => report.endpoints_failed.push(id),
                SupervisorExit::Unresponsive => report.endpoints_unresponsive.push(id),
            }
        }

        info!(tunnel = %tunnel, "Tunnel routine is stopped");
        report
    }
}
