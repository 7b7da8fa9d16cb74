//! The monitor hub: sole owner of the singleton monitor session's wiring.
//!
//! Every attach and detach goes through one task, so the "monitor in use"
//! state can never be raced by DTE loops in the same or different tunnels.
//! The session itself (command parsing and so on) lives elsewhere and only
//! sees a [`SessionIo`]: a feed of input bytes, a sink for output bytes and
//! attach/detach notifications.
//!
//! The hub never waits on a DTE. Output for the holder is queued to a
//! forwarding task owned by that attachment; a terminal that stops reading
//! loses output once its queue is full instead of stalling the hub.

use std::collections::HashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::endpoint::EndpointId;
use crate::error::TunnelError;
use crate::tunnel::TunnelId;

const SESSION_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 32;
const HOLDER_QUEUE_CAPACITY: usize = 1024;

/// Which DTE of which tunnel holds the monitor
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Attachment {
    pub tunnel: TunnelId,
    pub dte: EndpointId,
}

impl std::fmt::Display for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DTE {} on tunnel {}", self.dte, self.tunnel)
    }
}

/// Notifications delivered to the monitor session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Attached(Attachment),
    Detached(Attachment),
}

/// The session's side of the monitor wiring
#[derive(Debug)]
pub struct SessionIo {
    /// Raw bytes typed by the attached DTE
    pub input: mpsc::Receiver<u8>,
    /// Raw bytes for the attached DTE
    pub output: mpsc::Sender<u8>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Granted to a DTE loop while it holds the monitor
#[derive(Debug)]
pub struct MonitorLease {
    attachment: Attachment,
    input: mpsc::Sender<u8>,
    released: CancellationToken,
}

impl MonitorLease {
    pub fn attachment(&self) -> Attachment {
        self.attachment
    }

    /// Whether the hub has detached this DTE since the lease was granted
    pub fn is_released(&self) -> bool {
        self.released.is_cancelled()
    }

    /// Feed one byte to the monitor session
    pub async fn send(&self, byte: u8) -> Result<(), TunnelError> {
        self.input
            .send(byte)
            .await
            .map_err(|_| TunnelError::MonitorGone)
    }
}

#[derive(Debug)]
pub enum AttachOutcome {
    Attached(MonitorLease),
    /// Someone else holds the monitor; nothing changed
    Busy { holder: Attachment },
}

#[derive(Debug)]
enum MonitorCommand {
    Attach {
        attachment: Attachment,
        reply_to: mpsc::Sender<u8>,
        respond_to: oneshot::Sender<AttachOutcome>,
    },
    Detach {
        attachment: Attachment,
        respond_to: oneshot::Sender<bool>,
    },
    DetachCurrent {
        respond_to: oneshot::Sender<Option<Attachment>>,
    },
    Holder {
        respond_to: oneshot::Sender<Option<Attachment>>,
    },
}

/// Handle to communicate with the monitor hub
#[derive(Clone, Debug)]
pub struct MonitorHandle {
    sender: mpsc::Sender<MonitorCommand>,
}

impl MonitorHandle {
    /// Start the hub. The returned [`SessionIo`] belongs to whatever runs the
    /// interactive session.
    pub fn spawn() -> (Self, SessionIo) {
        let (sender, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);

        let hub = MonitorHub {
            receiver,
            holder: None,
            session_input: input_tx,
            session_output: output_rx,
            events: events_tx,
        };
        tokio::spawn(hub.run());

        (
            Self { sender },
            SessionIo {
                input: input_rx,
                output: output_tx,
                events: events_rx,
            },
        )
    }

    /// Try to divert `attachment` to the monitor. Monitor output will be sent
    /// to `reply_to` until the DTE is detached.
    pub async fn attach(
        &self,
        attachment: Attachment,
        reply_to: mpsc::Sender<u8>,
    ) -> Result<AttachOutcome, TunnelError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::Attach {
                attachment,
                reply_to,
                respond_to: tx,
            })
            .await
            .map_err(|_| TunnelError::MonitorGone)?;
        rx.await.map_err(|_| TunnelError::MonitorGone)
    }

    /// Detach `attachment` if it holds the monitor. Returns whether anything
    /// was released; detaching a DTE that is not attached is a no-op.
    pub async fn detach(&self, attachment: Attachment) -> Result<bool, TunnelError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::Detach {
                attachment,
                respond_to: tx,
            })
            .await
            .map_err(|_| TunnelError::MonitorGone)?;
        rx.await.map_err(|_| TunnelError::MonitorGone)
    }

    /// Detach whoever holds the monitor
    pub async fn detach_current(&self) -> Result<Option<Attachment>, TunnelError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::DetachCurrent { respond_to: tx })
            .await
            .map_err(|_| TunnelError::MonitorGone)?;
        rx.await.map_err(|_| TunnelError::MonitorGone)
    }

    pub async fn holder(&self) -> Result<Option<Attachment>, TunnelError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::Holder { respond_to: tx })
            .await
            .map_err(|_| TunnelError::MonitorGone)?;
        rx.await.map_err(|_| TunnelError::MonitorGone)
    }

    /// Per-DTE diversion map for one tunnel
    pub async fn diversions(
        &self,
        tunnel: TunnelId,
        dtes: &[EndpointId],
    ) -> Result<HashMap<EndpointId, bool>, TunnelError> {
        let holder = self.holder().await?;
        Ok(dtes
            .iter()
            .map(|&dte| (dte, holder == Some(Attachment { tunnel, dte })))
            .collect())
    }
}

struct Holder {
    attachment: Attachment,
    /// Queue drained into the DTE by the holder's forwarding task
    queue: mpsc::Sender<u8>,
    overflowed: bool,
    released: CancellationToken,
}

/// Copy queued monitor output into the DTE's inbound channel. Ends once the
/// queue is dropped and drained, or when the DTE stops accepting bytes.
fn spawn_forwarder(attachment: Attachment, sink: mpsc::Sender<u8>) -> mpsc::Sender<u8> {
    let (queue, mut pending) = mpsc::channel(HOLDER_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(byte) = pending.recv().await {
            if sink.send(byte).await.is_err() {
                debug!("{} stopped accepting monitor output", attachment);
                break;
            }
        }
    });
    queue
}

struct MonitorHub {
    receiver: mpsc::Receiver<MonitorCommand>,
    holder: Option<Holder>,
    session_input: mpsc::Sender<u8>,
    session_output: mpsc::Receiver<u8>,
    events: mpsc::Sender<SessionEvent>,
}

impl MonitorHub {
    async fn run(mut self) {
        debug!("Monitor hub started");
        let mut session_open = true;

        loop {
            // Output already produced goes to the current holder before any
            // rewiring takes effect.
            tokio::select! {
                biased;
                byte = self.session_output.recv(), if session_open => match byte {
                    Some(byte) => self.deliver(byte).await,
                    None => {
                        debug!("Monitor session closed its output");
                        session_open = false;
                    }
                },
                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle(cmd).await;
                }
            }
        }

        if let Some(holder) = self.holder.take() {
            holder.released.cancel();
        }
        debug!("Monitor hub stopped");
    }

    async fn handle(&mut self, cmd: MonitorCommand) {
        match cmd {
            MonitorCommand::Attach {
                attachment,
                reply_to,
                respond_to,
            } => {
                let outcome = self.attach(attachment, reply_to).await;
                let _ = respond_to.send(outcome);
            }
            MonitorCommand::Detach {
                attachment,
                respond_to,
            } => {
                let released = match &self.holder {
                    Some(holder) if holder.attachment == attachment => {
                        self.release().await;
                        true
                    }
                    _ => {
                        debug!("Detach of {} ignored, it is not attached", attachment);
                        false
                    }
                };
                let _ = respond_to.send(released);
            }
            MonitorCommand::DetachCurrent { respond_to } => {
                let released = self.release().await;
                let _ = respond_to.send(released);
            }
            MonitorCommand::Holder { respond_to } => {
                let _ = respond_to.send(self.holder.as_ref().map(|h| h.attachment));
            }
        }
    }

    async fn attach(&mut self, attachment: Attachment, reply_to: mpsc::Sender<u8>) -> AttachOutcome {
        if let Some(holder) = &self.holder {
            warn!(
                "{} requested the monitor but it is already used by {}",
                attachment, holder.attachment
            );
            return AttachOutcome::Busy {
                holder: holder.attachment,
            };
        }

        let released = CancellationToken::new();
        self.holder = Some(Holder {
            attachment,
            queue: spawn_forwarder(attachment, reply_to),
            overflowed: false,
            released: released.clone(),
        });
        info!("{} connected to monitor", attachment);
        let _ = self.events.send(SessionEvent::Attached(attachment)).await;

        AttachOutcome::Attached(MonitorLease {
            attachment,
            input: self.session_input.clone(),
            released,
        })
    }

    async fn release(&mut self) -> Option<Attachment> {
        let holder = self.holder.take()?;
        holder.released.cancel();
        info!("{} disconnected from monitor", holder.attachment);
        let _ = self
            .events
            .send(SessionEvent::Detached(holder.attachment))
            .await;
        Some(holder.attachment)
    }

    async fn deliver(&mut self, byte: u8) {
        let Some(holder) = &mut self.holder else {
            trace!(byte, "Dropping monitor output, nobody is attached");
            return;
        };
        match holder.queue.try_send(byte) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !holder.overflowed {
                    warn!(
                        "{} is not reading monitor output, dropping it",
                        holder.attachment
                    );
                    holder.overflowed = true;
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!(
                    "{} went away while attached, releasing the monitor",
                    holder.attachment
                );
                self.release().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(tunnel: u32, dte: u32) -> Attachment {
        Attachment {
            tunnel: TunnelId(tunnel),
            dte: EndpointId(dte),
        }
    }

    #[tokio::test]
    async fn attach_is_exclusive() {
        let (monitor, _io) = MonitorHandle::spawn();
        let (a_tx, _a_rx) = mpsc::channel(8);
        let (b_tx, _b_rx) = mpsc::channel(8);

        let first = monitor.attach(at(1, 1), a_tx).await.unwrap();
        assert!(matches!(first, AttachOutcome::Attached(_)));

        let second = monitor.attach(at(2, 5), b_tx).await.unwrap();
        match second {
            AttachOutcome::Busy { holder } => assert_eq!(holder, at(1, 1)),
            AttachOutcome::Attached(_) => panic!("monitor attached twice"),
        }
        assert_eq!(monitor.holder().await.unwrap(), Some(at(1, 1)));
    }

    #[tokio::test]
    async fn session_output_reaches_the_holder() {
        let (monitor, mut io) = MonitorHandle::spawn();
        let (tx, mut rx) = mpsc::channel(8);
        let AttachOutcome::Attached(lease) = monitor.attach(at(1, 2), tx).await.unwrap() else {
            panic!("expected attach");
        };
        assert_eq!(io.events.recv().await, Some(SessionEvent::Attached(at(1, 2))));

        lease.send(b'h').await.unwrap();
        assert_eq!(io.input.recv().await, Some(b'h'));

        io.output.send(b'>').await.unwrap();
        assert_eq!(rx.recv().await, Some(b'>'));
    }

    #[tokio::test]
    async fn detach_releases_lease_and_flag() {
        let (monitor, mut io) = MonitorHandle::spawn();
        let (tx, _rx) = mpsc::channel(8);
        let AttachOutcome::Attached(lease) = monitor.attach(at(1, 2), tx).await.unwrap() else {
            panic!("expected attach");
        };

        assert!(monitor.detach(at(1, 2)).await.unwrap());
        assert!(lease.is_released());
        assert_eq!(monitor.holder().await.unwrap(), None);

        let _ = io.events.recv().await;
        assert_eq!(io.events.recv().await, Some(SessionEvent::Detached(at(1, 2))));
    }

    #[tokio::test]
    async fn detach_of_unattached_dte_is_a_noop() {
        let (monitor, _io) = MonitorHandle::spawn();
        assert!(!monitor.detach(at(1, 9)).await.unwrap());
        assert_eq!(monitor.detach_current().await.unwrap(), None);

        let (tx, _rx) = mpsc::channel(8);
        let _lease = monitor.attach(at(1, 1), tx).await.unwrap();
        assert!(!monitor.detach(at(1, 9)).await.unwrap());
        assert_eq!(monitor.holder().await.unwrap(), Some(at(1, 1)));
    }

    #[tokio::test]
    async fn diversions_are_scoped_per_tunnel() {
        let (monitor, _io) = MonitorHandle::spawn();
        let (tx, _rx) = mpsc::channel(8);
        let _lease = monitor.attach(at(1, 1), tx).await.unwrap();

        let dtes = [EndpointId(1), EndpointId(2)];
        let map = monitor.diversions(TunnelId(1), &dtes).await.unwrap();
        assert!(map[&EndpointId(1)]);
        assert!(!map[&EndpointId(2)]);

        let other = monitor.diversions(TunnelId(2), &dtes).await.unwrap();
        assert!(other.values().all(|diverted| !diverted));
    }

    #[tokio::test]
    async fn output_without_holder_is_dropped() {
        let (monitor, io) = MonitorHandle::spawn();
        io.output.send(b'x').await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let _lease = monitor.attach(at(1, 1), tx).await.unwrap();
        io.output.send(b'y').await.unwrap();
        assert_eq!(rx.recv().await, Some(b'y'));
    }

    #[tokio::test]
    async fn stalled_holder_does_not_block_the_hub() {
        let (monitor, io) = MonitorHandle::spawn();
        // Nobody ever reads this side.
        let (tx, _stalled) = mpsc::channel(1);
        let _lease = monitor.attach(at(1, 1), tx).await.unwrap();

        let flood = async {
            for _ in 0..4 * HOLDER_QUEUE_CAPACITY {
                io.output.send(b'.').await.unwrap();
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), flood)
            .await
            .expect("session output stalled");

        let (b_tx, _b_rx) = mpsc::channel(8);
        let second = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            monitor.attach(at(2, 7), b_tx),
        )
        .await
        .expect("hub stopped answering")
        .unwrap();
        assert!(matches!(second, AttachOutcome::Busy { holder } if holder == at(1, 1)));
        assert_eq!(monitor.holder().await.unwrap(), Some(at(1, 1)));
    }

    #[tokio::test]
    async fn output_queued_before_detach_is_still_delivered() {
        let (monitor, io) = MonitorHandle::spawn();
        let (tx, mut rx) = mpsc::channel(1);
        let _lease = monitor.attach(at(1, 1), tx).await.unwrap();

        for &b in b"bye" {
            io.output.send(b).await.unwrap();
        }
        assert!(monitor.detach(at(1, 1)).await.unwrap());

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, b"bye");
    }

    #[tokio::test]
    async fn closed_holder_is_released_on_output() {
        let (monitor, io) = MonitorHandle::spawn();
        let (tx, rx) = mpsc::channel(1);
        let AttachOutcome::Attached(lease) = monitor.attach(at(1, 1), tx).await.unwrap() else {
            panic!("expected attach");
        };
        drop(rx);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !lease.is_released() {
                io.output.send(b'x').await.unwrap();
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("monitor never released");
        assert_eq!(monitor.holder().await.unwrap(), None);
    }
}
