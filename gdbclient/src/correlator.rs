/// Response correlation for an ID-less protocol
///
/// RSP replies carry no token, so every inbound packet is matched against the
/// outstanding commands by the shape of its payload. Stop replies bypass the
/// table entirely, monitor output is accumulated until its terminating `OK`,
/// and anything left unmatched goes to the oldest pending command.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::oneshot;

use crate::communication::TransportError;
use crate::packet::Packet;
use crate::parser::decode_hex_text;

pub type Completion = oneshot::Sender<std::result::Result<Packet, TransportError>>;
pub type CompletionReceiver = oneshot::Receiver<std::result::Result<Packet, TransportError>>;

const ERROR_PREFIXES: [&str; 2] = ["E", "e"];
const QUERY_LETTERS: [char; 9] = ['q', 'Q', 'v', 'H', 'p', 'P', 'G', 'M', 'X'];

/// Command families with distinct reply shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Continue,
    Step,
    Monitor,
    ReadMemory,
    ReadRegisters,
    QueryHaltReason,
    InsertBreakpoint,
    RemoveBreakpoint,
    /// `q`/`Q` queries, `v` packets and the other register and thread
    /// commands whose reply is free-form
    Query,
    Other,
}

impl CommandKind {
    pub fn classify(command: &str) -> Self {
        match command {
            "c" | "vCont;c" => return CommandKind::Continue,
            "s" | "vCont;s" => return CommandKind::Step,
            "g" => return CommandKind::ReadRegisters,
            "?" => return CommandKind::QueryHaltReason,
            _ => {}
        }

        if command.starts_with("qRcmd,") {
            CommandKind::Monitor
        } else if is_resume_with_address(command, 'c') {
            CommandKind::Continue
        } else if is_resume_with_address(command, 's') {
            CommandKind::Step
        } else if command.starts_with('m') {
            CommandKind::ReadMemory
        } else if command.starts_with('Z') {
            CommandKind::InsertBreakpoint
        } else if command.starts_with('z') {
            CommandKind::RemoveBreakpoint
        } else if command.starts_with(QUERY_LETTERS) {
            CommandKind::Query
        } else {
            CommandKind::Other
        }
    }

    /// Continue and step are resolved by the acknowledgement alone
    pub fn is_resume(self) -> bool {
        matches!(self, CommandKind::Continue | CommandKind::Step)
    }

    /// Reply prefixes accepted for this kind; an empty prefix accepts anything
    pub fn expected_prefixes(self) -> &'static [&'static str] {
        match self {
            CommandKind::Monitor => &["O", "OK"],
            CommandKind::ReadMemory | CommandKind::ReadRegisters | CommandKind::Query => &[""],
            CommandKind::Continue | CommandKind::Step => &["S", "T", "W", "X", ""],
            CommandKind::QueryHaltReason => &["S", "T", "W", "X"],
            CommandKind::InsertBreakpoint | CommandKind::RemoveBreakpoint => &["OK", "E"],
            CommandKind::Other => &[],
        }
    }

    pub fn matches(self, payload: &str) -> bool {
        if ERROR_PREFIXES.iter().any(|prefix| payload.starts_with(prefix)) {
            return true;
        }
        self.expected_prefixes()
            .iter()
            .any(|prefix| prefix.is_empty() || payload.starts_with(prefix))
    }
}

fn is_resume_with_address(command: &str, letter: char) -> bool {
    match command.strip_prefix(letter) {
        Some(address) => !address.is_empty() && address.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// A submitted command awaiting its reply
#[derive(Debug)]
pub struct PendingCommand {
    pub id: u64,
    pub command_text: String,
    pub kind: CommandKind,
    pub created_at: Instant,
    completion: Completion,
}

impl PendingCommand {
    fn resolve(self, result: std::result::Result<Packet, TransportError>) {
        // the waiter may already have given up
        let _ = self.completion.send(result);
    }
}

/// What `on_packet` did with a packet
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Unsolicited stop notification, never matched against the table
    Stop(Packet),
    /// A pending continue/step was completed with a synthetic `OK`
    Resumed { id: u64 },
    Delivered { id: u64 },
    /// Monitor output appended to the command's buffer
    Accumulated { id: u64 },
    /// Nothing matched; handed to the oldest pending command
    Fallback { id: u64 },
    Dropped,
}

#[derive(Default)]
struct State {
    pending: BTreeMap<u64, PendingCommand>,
    monitor_output: HashMap<u64, String>,
}

impl State {
    fn find(&self, predicate: impl Fn(&PendingCommand) -> bool) -> Option<u64> {
        self.pending.values().find(|p| predicate(p)).map(|p| p.id)
    }

    fn take(&mut self, id: u64) -> Option<PendingCommand> {
        self.monitor_output.remove(&id);
        self.pending.remove(&id)
    }
}

/// Pending-command table plus the response matching rules
pub struct CommandCorrelator {
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Default for CommandCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandCorrelator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a command before it is written, returning its id and the
    /// receiver that will carry its reply
    pub fn submit(&self, command_text: &str) -> (u64, CompletionReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (completion, receiver) = oneshot::channel();
        let kind = CommandKind::classify(command_text);

        let pending = PendingCommand {
            id,
            command_text: command_text.to_string(),
            kind,
            created_at: Instant::now(),
            completion,
        };

        let mut state = self.state.lock().unwrap();
        if kind == CommandKind::Monitor {
            state.monitor_output.insert(id, String::new());
        }
        state.pending.insert(id, pending);
        drop(state);

        log::trace!("PENDING[{}]: {} ({:?})", id, command_text, kind);
        (id, receiver)
    }

    /// Handle a bare `+`. Returns true if it completed a resume command.
    pub fn on_ack(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(id) = state.find(|p| p.kind.is_resume()) else {
            return false;
        };
        let Some(pending) = state.take(id) else {
            return false;
        };
        drop(state);

        log::debug!("RECV[{}]: ACK resolves '{}'", id, pending.command_text);
        pending.resolve(Packet::new("OK").map_err(TransportError::from));
        true
    }

    /// Route a decoded packet to its waiter
    pub fn on_packet(&self, packet: Packet) -> Dispatch {
        if packet.is_stop_reply() {
            return Dispatch::Stop(packet);
        }

        let mut state = self.state.lock().unwrap();
        if state.pending.is_empty() {
            log::debug!("RECV: no pending command for '{}', dropping", packet.payload());
            return Dispatch::Dropped;
        }

        let payload = packet.payload().to_string();
        let monitor = state.find(|p| p.kind == CommandKind::Monitor);

        if payload == "OK" {
            if let Some(id) = state.find(|p| p.kind.is_resume()) {
                if let Some(pending) = state.take(id) {
                    drop(state);
                    pending.resolve(Ok(packet));
                    return Dispatch::Resumed { id };
                }
            }

            if let Some(id) = monitor {
                let output = state.monitor_output.remove(&id).unwrap_or_default();
                if let Some(pending) = state.take(id) {
                    drop(state);
                    let result = if output.is_empty() {
                        Ok(packet)
                    } else {
                        Packet::new(output).map_err(TransportError::from)
                    };
                    pending.resolve(result);
                    return Dispatch::Delivered { id };
                }
            }
        } else if let (Some(id), Some(hex)) = (monitor, payload.strip_prefix('O')) {
            match decode_hex_text(hex) {
                Ok(text) => {
                    state.monitor_output.entry(id).or_default().push_str(&text);
                }
                Err(e) => log::warn!("RECV[{}]: undecodable monitor output '{}': {}", id, hex, e),
            }
            return Dispatch::Accumulated { id };
        }

        if let Some(id) = state.find(|p| p.kind.matches(&payload)) {
            if let Some(pending) = state.take(id) {
                drop(state);
                log::trace!("RECV[{}]: {}", id, payload);
                pending.resolve(Ok(packet));
                return Dispatch::Delivered { id };
            }
        }

        // BTreeMap order makes the first entry the oldest
        let Some(id) = state.pending.keys().next().copied() else {
            return Dispatch::Dropped;
        };
        let Some(pending) = state.take(id) else {
            return Dispatch::Dropped;
        };
        drop(state);

        log::warn!(
            "RECV[{}]: '{}' matched no pending command, delivering to oldest '{}'",
            id,
            payload,
            pending.command_text
        );
        pending.resolve(Ok(packet));
        Dispatch::Fallback { id }
    }

    /// Remove a command whose wait timed out, failing it with `error`
    pub fn expire(&self, id: u64, error: TransportError) -> bool {
        let pending = self.state.lock().unwrap().take(id);
        match pending {
            Some(pending) => {
                pending.resolve(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop a command without resolving it; its waiter is gone
    pub fn forget(&self, id: u64) {
        self.state.lock().unwrap().take(id);
    }

    /// Resolve every outstanding command with an error built by `make_error`
    pub fn cancel_all(&self, make_error: impl Fn() -> TransportError) -> usize {
        let drained: Vec<PendingCommand> = {
            let mut state = self.state.lock().unwrap();
            state.monitor_output.clear();
            std::mem::take(&mut state.pending).into_values().collect()
        };

        let count = drained.len();
        for pending in drained {
            log::debug!("CANCEL[{}]: {}", pending.id, pending.command_text);
            pending.resolve(Err(make_error()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Command texts still awaiting a reply, oldest first
    pub fn pending_commands(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pending
            .values()
            .map(|p| p.command_text.clone())
            .collect()
    }
}
