//! The interactive monitor session.
//!
//! Consumes the raw bytes typed by whichever DTE holds the monitor, runs a
//! line editor over them and dispatches complete lines to registered
//! commands. Output goes back through the monitor hub to the same DTE.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tunnel_core::{Attachment, EndpointId, MonitorHandle, SessionEvent, SessionIo, TunnelId};

const CR: u8 = 0x0D;
const LF: u8 = 0x0A;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7F;
const BELL: u8 = 0x07;
/// Longest command line accepted; further input rings the bell
const MAX_LINE_LEN: usize = 256;
const PROMPT: &str = "> ";

/// What the console knows about a configured tunnel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelSummary {
    pub id: TunnelId,
    pub description: String,
    pub dtes: Vec<EndpointId>,
    pub dce: EndpointId,
}

/// Everything a command can look at
#[derive(Clone, Debug)]
pub struct CommandContext {
    /// The DTE the command was typed on
    pub attachment: Attachment,
    pub tunnels: Arc<Vec<TunnelSummary>>,
}

impl CommandContext {
    pub fn current_tunnel(&self) -> Option<&TunnelSummary> {
        self.tunnels
            .iter()
            .find(|t| t.id == self.attachment.tunnel)
    }
}

/// Result of running a command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// Release the monitor after the text is written
    pub detach: bool,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            detach: false,
        }
    }
}

pub type CommandHandler = Arc<dyn Fn(&[&str], &CommandContext) -> Reply + Send + Sync>;

/// A registered command
#[derive(Clone)]
pub struct Command {
    pub name: String,
    pub help_text: String,
    handler: CommandHandler,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("help_text", &self.help_text)
            .finish_non_exhaustive()
    }
}

/// Named commands available in the monitor
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: Mutex<BTreeMap<String, Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the stock commands
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("exit", "Disconnect from the monitor", |_, _| Reply {
            text: "Disconnected!\n".to_string(),
            detach: true,
        });
        registry.register("show", "Show information (use 'show ?')", show_handler);
        registry.register("test", "A test command", |args, _| {
            Reply::text(format!(
                "Test command executed with args: [{}]\n",
                args.join(" ")
            ))
        });
        registry.register("who", "Show which terminal holds the monitor", |_, ctx| {
            Reply::text(format!("Monitor attached to {}\n", ctx.attachment))
        });
        registry
    }

    pub fn register<F>(&self, name: &str, help_text: &str, handler: F)
    where
        F: Fn(&[&str], &CommandContext) -> Reply + Send + Sync + 'static,
    {
        info!("New command registered in the monitor ({})", name);
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.to_string(),
                Command {
                    name: name.to_string(),
                    help_text: help_text.to_string(),
                    handler: Arc::new(handler),
                },
            );
    }

    /// Registered commands and their help text, one per line
    pub fn list_commands(&self) -> String {
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        let mut result = String::from("Available commands:\n");
        result.push_str(&format!("{:<15} {}\n", "help", "List available commands"));
        for cmd in commands.values() {
            result.push_str(&format!("{:<15} {}\n", cmd.name, cmd.help_text));
        }
        result
    }

    fn handler(&self, name: &str) -> Option<CommandHandler> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|cmd| Arc::clone(&cmd.handler))
    }

    /// Parse and run one input line
    pub fn execute(&self, line: &str, ctx: &CommandContext) -> Option<Reply> {
        let args: Vec<&str> = line.split_whitespace().collect();
        let (&command, rest) = args.split_first()?;
        if command == "help" {
            debug!("Help command issued in the monitor");
            return Some(Reply::text(self.list_commands()));
        }
        match self.handler(command) {
            Some(handler) => Some(handler(rest, ctx)),
            None => Some(Reply::text(format!("Unknown command: {command}\n"))),
        }
    }
}

fn show_handler(args: &[&str], ctx: &CommandContext) -> Reply {
    const OPTIONS: [(&str, &str); 2] = [
        ("current_tunnel_id", "Show current tunnel ID"),
        ("tunnels", "List configured tunnels"),
    ];

    match args.first().copied() {
        None | Some("?") => {
            let mut help = String::from("Available options for 'show':\n");
            for (name, text) in OPTIONS {
                help.push_str(&format!("{name:<25} {text}\n"));
            }
            Reply::text(help)
        }
        Some("current_tunnel_id") => {
            let description = ctx
                .current_tunnel()
                .map(|t| t.description.as_str())
                .unwrap_or_default();
            Reply::text(format!(
                "Current tunnel ID: {} ({})\n",
                ctx.attachment.tunnel, description
            ))
        }
        Some("tunnels") => {
            let mut text = String::new();
            for t in ctx.tunnels.iter() {
                let dtes: Vec<String> = t.dtes.iter().map(ToString::to_string).collect();
                text.push_str(&format!(
                    "tunnel {:<4} DCE {:<4} DTE [{}]  {}\n",
                    t.id,
                    t.dce,
                    dtes.join(", "),
                    t.description
                ));
            }
            Reply::text(text)
        }
        Some(other) => {
            debug!("Unknown \"show\" subcommand requested ({})", other);
            Reply::text("Unknown option. Use 'show ?' for help.\n")
        }
    }
}

/// Terminal output wants CRLF line endings
fn to_crlf(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 8);
    let mut prev = 0u8;
    for &b in text.as_bytes() {
        if b == LF && prev != CR {
            out.push(CR);
        }
        out.push(b);
        prev = b;
    }
    out
}

/// The running monitor session
pub struct Console {
    io: SessionIo,
    monitor: MonitorHandle,
    registry: Arc<CommandRegistry>,
    tunnels: Arc<Vec<TunnelSummary>>,
    attachment: Option<Attachment>,
    buffer: Vec<u8>,
    stop: CancellationToken,
}

impl Console {
    pub fn spawn(
        io: SessionIo,
        monitor: MonitorHandle,
        registry: Arc<CommandRegistry>,
        tunnels: Vec<TunnelSummary>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let console = Self {
            io,
            monitor,
            registry,
            tunnels: Arc::new(tunnels),
            attachment: None,
            buffer: Vec::new(),
            stop,
        };
        tokio::spawn(console.run())
    }

    async fn run(mut self) {
        info!("Monitor is alive");
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                event = self.io.events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                byte = self.io.input.recv() => match byte {
                    Some(byte) => self.on_byte(byte).await,
                    None => break,
                },
            }
        }
        info!("Monitor stopped");
    }

    async fn on_event(&mut self, event: SessionEvent) {
        self.buffer.clear();
        match event {
            SessionEvent::Attached(attachment) => {
                self.attachment = Some(attachment);
                self.write(&format!(
                    "\nConnected to monitor ({attachment}). Type 'help' for commands.\n{PROMPT}"
                ))
                .await;
            }
            SessionEvent::Detached(_) => {
                self.attachment = None;
            }
        }
    }

    async fn on_byte(&mut self, byte: u8) {
        match byte {
            CR => {
                self.write("\n").await;
                let line = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
                self.execute(&line).await;
            }
            LF => {}
            BACKSPACE | DELETE => {
                if self.buffer.pop().is_some() {
                    self.write_raw(b"\x08 \x08").await;
                }
            }
            _ if self.buffer.len() >= MAX_LINE_LEN => {
                trace!("Monitor line is full, dropping {}", byte);
                self.write_raw(&[BELL]).await;
            }
            _ => {
                self.buffer.push(byte);
                trace!(
                    "Monitor is receiving things: last char={} current buffer \"{}\"",
                    byte,
                    String::from_utf8_lossy(&self.buffer)
                );
                self.write_raw(&[byte]).await;
            }
        }
    }

    async fn execute(&mut self, line: &str) {
        let Some(attachment) = self.attachment else {
            debug!("Ignoring monitor input with nobody attached");
            return;
        };
        let ctx = CommandContext {
            attachment,
            tunnels: Arc::clone(&self.tunnels),
        };

        if !line.trim().is_empty() {
            info!("Monitor received the command \"{}\"", line.trim());
        }
        let reply = self.registry.execute(line, &ctx).unwrap_or_default();
        self.write(&reply.text).await;

        if reply.detach {
            if let Err(e) = self.monitor.detach(attachment).await {
                warn!("Failed to detach {}: {}", attachment, e);
            }
            self.attachment = None;
        } else {
            self.write(PROMPT).await;
        }
    }

    async fn write(&self, text: &str) {
        self.write_raw(&to_crlf(text)).await;
    }

    async fn write_raw(&self, bytes: &[u8]) {
        for &b in bytes {
            if self.io.output.send(b).await.is_err() {
                return;
            }
        }
    }
}
