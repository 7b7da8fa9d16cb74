//! Tunnel routing: one forwarding loop per DTE and one broadcast loop for
//! the DCE. Each loop owns its own state and exits when the tunnel's stop
//! token fires.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::endpoint::{Endpoint, EndpointId};
use crate::error::TunnelError;
use crate::escape::{EscapeAction, EscapeDetector};
use crate::monitor::{AttachOutcome, Attachment, MonitorHandle, MonitorLease};
use crate::tunnel::{Tunnel, TunnelId};

/// A spawned routing loop, named for logs
pub(crate) struct RouterTask {
    pub name: String,
    pub task: JoinHandle<()>,
}

/// Claim the tunnel's outbound streams and spawn its routing loops.
///
/// All receivers are claimed before anything is spawned, so a failure
/// leaves nothing running.
pub(crate) fn spawn(
    tunnel: &Tunnel,
    monitor: &MonitorHandle,
    stop: &CancellationToken,
) -> Result<Vec<RouterTask>, TunnelError> {
    let dce_outbound = tunnel.dce().take_outbound()?;
    let mut links = Vec::with_capacity(tunnel.dtes().len());
    for dte in tunnel.dtes() {
        links.push(DteLink {
            tunnel: tunnel.id(),
            dte: Arc::clone(dte),
            outbound: dte.take_outbound()?,
            dce_inbound: tunnel.dce().inbound(),
            dce_down: false,
            detector: EscapeDetector::new(tunnel.escape()),
            monitor: monitor.clone(),
            lease: None,
            attach_abandoned: false,
            stop: stop.clone(),
        });
    }

    let mut tasks = Vec::with_capacity(links.len() + 1);
    for link in links {
        tasks.push(RouterTask {
            name: format!("DTE {}", link.dte.id()),
            task: tokio::spawn(link.run()),
        });
    }

    let broadcast = DceLink {
        tunnel: tunnel.id(),
        dce: tunnel.dce().id(),
        outbound: dce_outbound,
        dtes: tunnel
            .dtes()
            .iter()
            .map(|dte| DteSink {
                id: dte.id(),
                inbound: dte.inbound(),
                alive: true,
            })
            .collect(),
        stop: stop.clone(),
    };
    tasks.push(RouterTask {
        name: format!("DCE {}", tunnel.dce().id()),
        task: tokio::spawn(broadcast.run()),
    });

    Ok(tasks)
}

/// Forwarding state for one DTE
struct DteLink {
    tunnel: TunnelId,
    dte: Arc<Endpoint>,
    outbound: mpsc::Receiver<u8>,
    dce_inbound: mpsc::Sender<u8>,
    dce_down: bool,
    detector: EscapeDetector,
    monitor: MonitorHandle,
    lease: Option<MonitorLease>,
    /// An attach request was cut short by the stop token and may still have
    /// been granted.
    attach_abandoned: bool,
    stop: CancellationToken,
}

impl DteLink {
    async fn run(mut self) {
        let id = self.dte.id();
        debug!(tunnel = %self.tunnel, dte = %id, "DTE routine started");

        loop {
            let byte = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                byte = self.outbound.recv() => match byte {
                    Some(byte) => byte,
                    None => break,
                },
            };
            if !self.route(byte).await {
                break;
            }
        }

        // A DTE that goes away must not keep the monitor locked.
        let holding = self.lease.take().is_some_and(|lease| !lease.is_released());
        if holding || self.attach_abandoned {
            let _ = self.monitor.detach(self.attachment()).await;
        }
        info!(tunnel = %self.tunnel, dte = %id, "Stopping DTE routine");
    }

    fn attachment(&self) -> Attachment {
        Attachment {
            tunnel: self.tunnel,
            dte: self.dte.id(),
        }
    }

    /// Whether this DTE currently talks to the monitor. Drops the lease once
    /// the hub has detached us.
    fn diverted(&mut self) -> bool {
        if self.lease.as_ref().is_some_and(MonitorLease::is_released) {
            self.lease = None;
            info!(tunnel = %self.tunnel, dte = %self.dte.id(), "DTE routed back to DCE");
        }
        self.lease.is_some()
    }

    /// Returns `false` when the tunnel is stopping.
    async fn route(&mut self, byte: u8) -> bool {
        let diverted = self.diverted();
        match self.detector.feed(byte, diverted) {
            EscapeAction::Swallow => {
                trace!(dte = %self.dte.id(), "Escape pending");
                true
            }
            EscapeAction::Forward(byte) => self.forward(byte).await,
            EscapeAction::ForwardPair(first, byte) => {
                self.forward(first).await && self.forward(byte).await
            }
            EscapeAction::Attach => {
                self.attach().await;
                true
            }
        }
    }

    async fn forward(&mut self, byte: u8) -> bool {
        if let Some(lease) = &self.lease {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return false,
                sent = lease.send(byte) => {
                    if sent.is_err() {
                        warn!(dte = %self.dte.id(), "Monitor session is gone, dropping byte");
                    }
                }
            }
            return true;
        }

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            sent = self.dce_inbound.send(byte) => {
                if sent.is_err() && !self.dce_down {
                    warn!(
                        tunnel = %self.tunnel,
                        dte = %self.dte.id(),
                        "DCE is not accepting bytes, dropping DTE input"
                    );
                    self.dce_down = true;
                }
                true
            }
        }
    }

    async fn attach(&mut self) {
        let attachment = self.attachment();
        let outcome = tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                self.attach_abandoned = true;
                return;
            }
            outcome = self.monitor.attach(attachment, self.dte.inbound()) => outcome,
        };
        match outcome {
            Ok(AttachOutcome::Attached(lease)) => {
                self.lease = Some(lease);
            }
            Ok(AttachOutcome::Busy { holder }) => {
                let notice = format!("\r\n*** monitor is in use by {holder} ***\r\n");
                self.notify(notice.as_bytes()).await;
            }
            Err(e) => {
                warn!(dte = %self.dte.id(), "Monitor attach failed: {}", e);
            }
        }
    }

    /// Write a message to this DTE's own terminal
    async fn notify(&self, text: &[u8]) {
        let inbound = self.dte.inbound();
        for &byte in text {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                sent = inbound.send(byte) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

struct DteSink {
    id: EndpointId,
    inbound: mpsc::Sender<u8>,
    alive: bool,
}

/// Broadcast state for the DCE
struct DceLink {
    tunnel: TunnelId,
    dce: EndpointId,
    outbound: mpsc::Receiver<u8>,
    dtes: Vec<DteSink>,
    stop: CancellationToken,
}

impl DceLink {
    async fn run(mut self) {
        debug!(tunnel = %self.tunnel, dce = %self.dce, "DCE routine started");

        'outer: loop {
            let byte = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                byte = self.outbound.recv() => match byte {
                    Some(byte) => byte,
                    None => break,
                },
            };

            // Every DTE sees DCE output, whether or not it is diverted.
            for sink in self.dtes.iter_mut().filter(|sink| sink.alive) {
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => break 'outer,
                    sent = sink.inbound.send(byte) => {
                        if sent.is_err() {
                            warn!(
                                tunnel = %self.tunnel,
                                dte = %sink.id,
                                "DTE is not accepting bytes, skipping it from now on"
                            );
                            sink.alive = false;
                        }
                    }
                }
            }
        }

        info!(tunnel = %self.tunnel, dce = %self.dce, "Stopping DCE routine");
    }
}
