//! Endpoint I/O supervisor: bridges one open transport to its endpoint's
//! byte channels and owns the transport for its whole lifetime.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::endpoint::{Endpoint, EndpointId};
use crate::error::TunnelError;
use crate::transport::{BoxedTransport, TransportOpener};

/// Handle to a running supervisor task
#[derive(Debug)]
pub struct SupervisorHandle {
    endpoint: Arc<Endpoint>,
    task: JoinHandle<Result<(), TunnelError>>,
}

impl SupervisorHandle {
    /// Start supervising `endpoint`, opening its transport through `opener`
    pub fn spawn(endpoint: Arc<Endpoint>, opener: Arc<dyn TransportOpener>) -> Self {
        let task = tokio::spawn(run(Arc::clone(&endpoint), opener));
        Self { endpoint, task }
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request shutdown and wait up to `grace` for the supervisor to return.
    ///
    /// An unresponsive supervisor is left to finish on its own.
    pub async fn shutdown(self, grace: Duration) -> SupervisorExit {
        let id = self.endpoint.id();
        let already_exited = self.task.is_finished();
        self.endpoint.request_shutdown();
        match tokio::time::timeout(grace, self.task).await {
            Ok(Ok(Ok(()))) => SupervisorExit::Stopped,
            Ok(Ok(Err(e))) => {
                if already_exited {
                    warn!(endpoint = %id, "Supervisor had already exited: {}", e);
                } else {
                    warn!(endpoint = %id, "Supervisor failed while stopping: {}", e);
                }
                SupervisorExit::Failed(e)
            }
            Ok(Err(e)) => {
                warn!(endpoint = %id, "Supervisor task failed: {}", e);
                SupervisorExit::Failed(e.into())
            }
            Err(_) => {
                warn!(
                    endpoint = %id,
                    "Supervisor did not stop within {:?}, leaving it behind",
                    grace
                );
                SupervisorExit::Unresponsive
            }
        }
    }
}

/// How a supervisor ended once asked to stop
#[derive(Debug)]
pub enum SupervisorExit {
    Stopped,
    /// The supervisor returned an error, typically because its transport
    /// never opened
    Failed(TunnelError),
    /// Still running after the grace period
    Unresponsive,
}

/// Run the supervisor for `endpoint` until its shutdown is requested.
///
/// An open failure is logged and returned; the endpoint stays inert.
pub async fn run(
    endpoint: Arc<Endpoint>,
    opener: Arc<dyn TransportOpener>,
) -> Result<(), TunnelError> {
    let id = endpoint.id();
    let inbound = endpoint.take_inbound()?;

    info!(
        endpoint = %id,
        "Starting supervisor for \"{}\" on {}",
        endpoint.description(),
        endpoint.transport()
    );
    let transport = opener.open(endpoint.transport()).await.map_err(|e| {
        error!(endpoint = %id, "Error opening transport: {}", e);
        e
    })?;

    let (reader, writer) = tokio::io::split(transport);
    let (receiver_stop_tx, receiver_stop_rx) = oneshot::channel();
    let (sender_stop_tx, sender_stop_rx) = oneshot::channel();

    let receiver = tokio::spawn(receive_loop(
        id,
        reader,
        endpoint.outbound_sender(),
        receiver_stop_rx,
    ));
    let sender = tokio::spawn(send_loop(id, writer, inbound, sender_stop_rx));

    endpoint.shutdown_token().cancelled().await;
    info!(endpoint = %id, "Shutdown requested");

    // A loop that already died on a transport error has dropped its stop
    // receiver, so these sends never wait.
    let _ = receiver_stop_tx.send(());
    let _ = sender_stop_tx.send(());

    match (receiver.await, sender.await) {
        (Ok(reader), Ok(writer)) => {
            let mut transport = reader.unsplit(writer);
            if let Err(e) = transport.shutdown().await {
                debug!(endpoint = %id, "Error closing transport: {}", e);
            }
        }
        (reader, writer) => {
            warn!(
                endpoint = %id,
                "Transport loop failed (receive ok: {}, send ok: {}), dropping transport",
                reader.is_ok(),
                writer.is_ok()
            );
        }
    }

    info!(endpoint = %id, "Supervisor stopped");
    Ok(())
}

async fn receive_loop(
    id: EndpointId,
    mut reader: ReadHalf<BoxedTransport>,
    outbound: mpsc::Sender<u8>,
    mut stop: oneshot::Receiver<()>,
) -> ReadHalf<BoxedTransport> {
    debug!(endpoint = %id, "Receive loop is alive");
    loop {
        let byte = tokio::select! {
            biased;
            _ = &mut stop => break,
            read = reader.read_u8() => match read {
                Ok(byte) => byte,
                Err(e) => {
                    error!(endpoint = %id, "Error reading from transport: {}", e);
                    return reader;
                }
            },
        };
        trace!(endpoint = %id, byte, "Read byte");

        tokio::select! {
            biased;
            _ = &mut stop => break,
            sent = outbound.send(byte) => {
                if sent.is_err() {
                    debug!(endpoint = %id, "Nobody is consuming endpoint output");
                }
            }
        }
    }
    info!(endpoint = %id, "Stopping receive loop");
    reader
}

async fn send_loop(
    id: EndpointId,
    mut writer: WriteHalf<BoxedTransport>,
    mut inbound: mpsc::Receiver<u8>,
    mut stop: oneshot::Receiver<()>,
) -> WriteHalf<BoxedTransport> {
    debug!(endpoint = %id, "Send loop is alive");
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            byte = inbound.recv() => {
                let Some(byte) = byte else { break };
                trace!(endpoint = %id, byte, "Writing byte");
                // A peer that stopped reading must not hold up shutdown.
                tokio::select! {
                    biased;
                    _ = &mut stop => break,
                    written = write_byte(&mut writer, byte) => {
                        if let Err(e) = written {
                            error!(endpoint = %id, "Error writing to transport: {}", e);
                            return writer;
                        }
                    }
                }
            }
        }
    }
    info!(endpoint = %id, "Stopping send loop");
    writer
}

async fn write_byte(writer: &mut WriteHalf<BoxedTransport>, byte: u8) -> std::io::Result<()> {
    writer.write_u8(byte).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportConfig;
    use crate::transport::memory::MemoryOpener;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const GRACE: Duration = Duration::from_secs(2);

    fn endpoint(device: &str) -> Arc<Endpoint> {
        Endpoint::new(
            EndpointId(1),
            "test port",
            TransportConfig {
                device: device.to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn bridges_transport_to_channels() {
        let opener = Arc::new(MemoryOpener::new());
        let mut far = opener.attach("ttyA");
        let ep = endpoint("ttyA");
        let mut outbound = ep.take_outbound().unwrap();
        let handle = SupervisorHandle::spawn(Arc::clone(&ep), opener);

        far.write_all(b"hi").await.unwrap();
        assert_eq!(outbound.recv().await, Some(b'h'));
        assert_eq!(outbound.recv().await, Some(b'i'));

        ep.inbound().send(b'!').await.unwrap();
        assert_eq!(far.read_u8().await.unwrap(), b'!');

        assert!(matches!(handle.shutdown(GRACE).await, SupervisorExit::Stopped));
    }

    #[tokio::test]
    async fn shutdown_closes_the_transport() {
        let opener = Arc::new(MemoryOpener::new());
        let mut far = opener.attach("ttyA");
        let ep = endpoint("ttyA");
        let handle = SupervisorHandle::spawn(Arc::clone(&ep), opener);

        // Make sure the transport is open before asking it to stop.
        ep.inbound().send(b'x').await.unwrap();
        assert_eq!(far.read_u8().await.unwrap(), b'x');

        assert!(matches!(handle.shutdown(GRACE).await, SupervisorExit::Stopped));
        let mut rest = Vec::new();
        far.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn open_failure_leaves_endpoint_inert() {
        let opener = Arc::new(MemoryOpener::new());
        let ep = endpoint("missing");
        let result = run(Arc::clone(&ep), opener).await;
        assert!(matches!(result, Err(TunnelError::TransportOpen { .. })));

        // Inbound receiver went away with the supervisor.
        assert!(ep.inbound().send(1).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_after_read_failure_does_not_block() {
        let opener = Arc::new(MemoryOpener::new());
        let far = opener.attach("ttyA");
        let ep = endpoint("ttyA");
        let _outbound = ep.take_outbound().unwrap();
        let handle = SupervisorHandle::spawn(Arc::clone(&ep), opener);

        // Dropping the far side makes the receive loop hit EOF and die.
        ep.inbound().send(b'x').await.unwrap();
        drop(far);
        tokio::task::yield_now().await;

        assert!(matches!(handle.shutdown(GRACE).await, SupervisorExit::Stopped));
    }

    #[tokio::test]
    async fn shutdown_with_a_peer_that_never_reads() {
        let opener = Arc::new(MemoryOpener::new());
        let _far = opener.attach("ttyA");
        let ep = endpoint("ttyA");
        let handle = SupervisorHandle::spawn(Arc::clone(&ep), opener);

        // Fill the transport's buffer so the send loop ends up blocked.
        let inbound = ep.inbound();
        let filler = tokio::spawn(async move {
            for _ in 0..4096 {
                if inbound.send(b'z').await.is_err() {
                    break;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(handle.shutdown(GRACE).await, SupervisorExit::Stopped));
        filler.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_reports_a_supervisor_that_already_failed() {
        let opener = Arc::new(MemoryOpener::new());
        let ep = endpoint("missing");
        let handle = SupervisorHandle::spawn(Arc::clone(&ep), opener);

        tokio::time::timeout(GRACE, async {
            while !handle.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        match handle.shutdown(GRACE).await {
            SupervisorExit::Failed(TunnelError::TransportOpen { device, .. }) => {
                assert_eq!(device, "missing");
            }
            other => panic!("unexpected exit: {other:?}"),
        }
    }
}
