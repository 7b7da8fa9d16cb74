//! Brings the whole switch up from a parsed config and tears it down again.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tunnel_core::{MonitorHandle, ShutdownReport, TransportOpener, TunnelHandle};

use crate::config::{ConfigError, FileConfig};
use crate::console::{CommandRegistry, Console, TunnelSummary};

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tunnel(#[from] tunnel_core::TunnelError),
}

/// Every running tunnel plus the shared monitor session
pub struct System {
    tunnels: Vec<TunnelHandle>,
    monitor: MonitorHandle,
    registry: Arc<CommandRegistry>,
    console: JoinHandle<()>,
    console_stop: CancellationToken,
}

impl System {
    pub async fn start(
        config: &FileConfig,
        opener: Arc<dyn TransportOpener>,
    ) -> Result<Self, SystemError> {
        let tunnels = config.build()?;
        let options = config.tunnel_options();

        let summaries = tunnels
            .iter()
            .map(|t| TunnelSummary {
                id: t.id(),
                description: t.description().to_string(),
                dtes: t.dtes().iter().map(|e| e.id()).collect(),
                dce: t.dce().id(),
            })
            .collect();

        let (monitor, session) = MonitorHandle::spawn();
        let registry = Arc::new(CommandRegistry::with_builtins());
        let console_stop = CancellationToken::new();
        let console = Console::spawn(
            session,
            monitor.clone(),
            Arc::clone(&registry),
            summaries,
            console_stop.clone(),
        );

        info!("Bring up serials.");
        let mut handles = Vec::with_capacity(tunnels.len());
        for tunnel in tunnels {
            match tunnel.start(Arc::clone(&opener), monitor.clone(), options.clone()) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Whatever already started must not outlive the failure
                    let system = Self {
                        tunnels: handles,
                        monitor,
                        registry,
                        console,
                        console_stop,
                    };
                    system.shutdown().await;
                    return Err(e.into());
                }
            }
        }
        info!("{} tunnels running", handles.len());

        Ok(Self {
            tunnels: handles,
            monitor,
            registry,
            console,
            console_stop,
        })
    }

    pub fn tunnels(&self) -> &[TunnelHandle] {
        &self.tunnels
    }

    pub fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }

    /// Lets callers add monitor commands while the system runs
    pub fn commands(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Quit every tunnel concurrently, then stop the monitor session.
    pub async fn shutdown(self) -> Vec<ShutdownReport> {
        info!("Shutting down {} tunnels", self.tunnels.len());
        let quits = self.tunnels.into_iter().map(|t| {
            let id = t.id();
            async move {
                match t.quit().await {
                    Ok(report) => Some(report),
                    Err(e) => {
                        warn!(tunnel = %id, "Tunnel teardown failed: {}", e);
                        None
                    }
                }
            }
        });
        let reports: Vec<ShutdownReport> = futures::future::join_all(quits)
            .await
            .into_iter()
            .flatten()
            .collect();

        self.console_stop.cancel();
        if let Err(e) = self.console.await {
            warn!("Monitor session ended abnormally: {}", e);
        }
        reports
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
