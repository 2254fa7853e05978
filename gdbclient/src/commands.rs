/// Machine command mapping
///
/// This module turns abstract debugger operations into RSP command strings
/// and parses the replies into typed results. The wire dialect differs per
/// stub, so the operations are routed through [`MachineCommands`], which
/// wraps one variant per supported machine.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use serde::{Deserialize, Serialize};

use crate::communication::{TransportError, TransportSession};
use crate::parser::{decode_hex, decode_hex_text, encode_hex};
use crate::qemu::QemuCommands;
use crate::types::{BreakpointSpec, RegisterContext};
use crate::vmware::VmwareCommands;

pub type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Remote stub returned error: {0}")]
    Remote(String),
    #[error("Failed to parse reply: {0}")]
    Parse(String),
    #[error("Machine is running, cannot execute")]
    MachineRunning,
    #[error("Operation not supported by this machine: {0}")]
    Unsupported(&'static str),
}

/// Which stub dialect a session speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineKind {
    Qemu,
    Vmware,
}

impl MachineKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "qemu" => Some(MachineKind::Qemu),
            "vmware" => Some(MachineKind::Vmware),
            _ => None,
        }
    }
}

impl std::fmt::Display for MachineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineKind::Qemu => write!(f, "qemu"),
            MachineKind::Vmware => write!(f, "vmware"),
        }
    }
}

/// Read access to target memory
pub trait MemoryAccess: Send + Sync {
    fn read_memory(&self, address: u64, size: usize) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Plumbing shared by every machine variant
pub struct CommandCore {
    transport: TransportSession,
    packet_size: AtomicUsize,
    halted: AtomicBool,
}

impl CommandCore {
    pub fn new(transport: TransportSession, packet_size: usize) -> Self {
        Self {
            transport,
            packet_size: AtomicUsize::new(packet_size.max(2)),
            halted: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &TransportSession {
        &self.transport
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::SeqCst);
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size.load(Ordering::SeqCst)
    }

    pub fn set_packet_size(&self, size: usize) {
        self.packet_size.store(size.max(2), Ordering::SeqCst);
    }

    pub(crate) fn require_halted(&self) -> Result<()> {
        if self.is_halted() {
            Ok(())
        } else {
            Err(CommandError::MachineRunning)
        }
    }

    /// Send any command and return the reply payload untouched
    pub async fn execute_raw(&self, command: &str) -> Result<String> {
        let reply = self.transport.send_command(command).await?;
        Ok(reply.payload().to_string())
    }

    /// Run a `qRcmd` monitor command and return its decoded output
    pub async fn execute_monitor(&self, command: &str) -> Result<String> {
        let request = format!("qRcmd,{}", encode_hex(command.as_bytes()));
        let reply = self.transport.send_command(&request).await?;
        let payload = reply.payload();

        if reply.is_error() {
            return Err(CommandError::Remote(payload.to_string()));
        }
        if reply.is_ok() {
            return Ok(String::new());
        }
        // stubs that answer with a single unframed output chunk
        if let Some(hex) = payload.strip_prefix('O') {
            if let Ok(text) = decode_hex_text(hex) {
                return Ok(text);
            }
        }
        Ok(payload.to_string())
    }

    /// Read `size` bytes, splitting the request so each reply fits one packet.
    /// Any chunk failing fails the whole read, and so does the target
    /// resuming between chunks.
    pub async fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        self.require_halted()?;

        let chunk = (self.packet_size() / 2).max(1);
        let mut data = Vec::with_capacity(size);

        while data.len() < size {
            self.require_halted()?;
            let offset = data.len();
            let want = chunk.min(size - offset);
            let at = address.wrapping_add(offset as u64);

            let reply = self
                .transport
                .send_command(&format!("m{:x},{:x}", at, want))
                .await?;
            if reply.is_error() {
                log::debug!("Memory read at {:#x} failed: {}", at, reply.payload());
                return Err(CommandError::Remote(reply.payload().to_string()));
            }

            let bytes = decode_hex(reply.payload()).map_err(CommandError::Parse)?;
            if bytes.is_empty() {
                return Err(CommandError::Remote(format!("empty memory reply at {:#x}", at)));
            }
            data.extend_from_slice(&bytes[..bytes.len().min(want)]);
        }

        Ok(data)
    }

    /// Read the general purpose register file with `g`
    pub async fn read_registers(&self) -> Result<RegisterContext> {
        self.require_halted()?;

        let reply = self.transport.send_command("g").await?;
        if reply.is_error() {
            return Err(CommandError::Remote(reply.payload().to_string()));
        }
        let blob = decode_hex(reply.payload()).map_err(CommandError::Parse)?;
        RegisterContext::from_gdb_blob(&blob).map_err(CommandError::Parse)
    }

    /// Insert (`Z`) or remove (`z`) a breakpoint of the given RSP type
    pub async fn set_breakpoint(&self, insert: bool, code: u8, spec: &BreakpointSpec) -> Result<()> {
        self.require_halted()?;

        let command = format!(
            "{}{},{:x},{:x}",
            if insert { 'Z' } else { 'z' },
            code,
            spec.address,
            spec.size
        );
        let reply = self.transport.send_command(&command).await?;
        if reply.is_ok() {
            Ok(())
        } else if reply.payload().is_empty() {
            Err(CommandError::Unsupported("breakpoint type"))
        } else {
            Err(CommandError::Remote(reply.payload().to_string()))
        }
    }

    /// Issue a resume command. The machine counts as running from the moment
    /// the command is sent; the stop notification flips it back.
    pub async fn resume(&self, command: &str) -> Result<()> {
        self.require_halted()?;
        self.set_halted(false);

        match self.transport.send_command(command).await {
            Ok(reply) if reply.is_error() => {
                self.set_halted(true);
                Err(CommandError::Remote(reply.payload().to_string()))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_halted(true);
                Err(e.into())
            }
        }
    }
}

impl MemoryAccess for CommandCore {
    fn read_memory(&self, address: u64, size: usize) -> impl Future<Output = Result<Vec<u8>>> + Send {
        CommandCore::read_memory(self, address, size)
    }
}

/// The active machine's command mapper
pub enum MachineCommands {
    Qemu(QemuCommands),
    Vmware(VmwareCommands),
}

impl MachineCommands {
    pub fn new(kind: MachineKind, transport: TransportSession, packet_size: usize) -> Self {
        let core = CommandCore::new(transport, packet_size);
        match kind {
            MachineKind::Qemu => MachineCommands::Qemu(QemuCommands::new(core)),
            MachineKind::Vmware => MachineCommands::Vmware(VmwareCommands::new(core)),
        }
    }

    pub fn kind(&self) -> MachineKind {
        match self {
            MachineCommands::Qemu(_) => MachineKind::Qemu,
            MachineCommands::Vmware(_) => MachineKind::Vmware,
        }
    }

    pub fn core(&self) -> &CommandCore {
        match self {
            MachineCommands::Qemu(m) => m.core(),
            MachineCommands::Vmware(m) => m.core(),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.core().is_halted()
    }

    pub fn set_halted(&self, halted: bool) {
        self.core().set_halted(halted)
    }

    pub async fn step(&self) -> Result<()> {
        match self {
            MachineCommands::Qemu(m) => m.step().await,
            MachineCommands::Vmware(m) => m.step().await,
        }
    }

    pub async fn continue_execution(&self) -> Result<()> {
        match self {
            MachineCommands::Qemu(m) => m.continue_execution().await,
            MachineCommands::Vmware(m) => m.continue_execution().await,
        }
    }

    /// Ask the stub to stop a running target
    pub async fn interrupt(&self) -> Result<()> {
        self.core().transport().send_interrupt().await?;
        Ok(())
    }

    pub async fn read_context(&self) -> Result<RegisterContext> {
        match self {
            MachineCommands::Qemu(m) => m.read_context().await,
            MachineCommands::Vmware(m) => m.read_context().await,
        }
    }

    pub async fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        self.core().read_memory(address, size).await
    }

    pub async fn add_breakpoint(&self, spec: &BreakpointSpec) -> Result<()> {
        let code = self.breakpoint_code(spec);
        self.core().set_breakpoint(true, code, spec).await
    }

    pub async fn remove_breakpoint(&self, spec: &BreakpointSpec) -> Result<()> {
        let code = self.breakpoint_code(spec);
        self.core().set_breakpoint(false, code, spec).await
    }

    fn breakpoint_code(&self, spec: &BreakpointSpec) -> u8 {
        match self {
            MachineCommands::Qemu(_) => QemuCommands::breakpoint_code(spec.kind),
            MachineCommands::Vmware(_) => VmwareCommands::breakpoint_code(spec.kind),
        }
    }

    pub async fn execute_raw(&self, command: &str) -> Result<String> {
        self.core().execute_raw(command).await
    }

    pub async fn execute_monitor(&self, command: &str) -> Result<String> {
        self.core().execute_monitor(command).await
    }

    pub fn kernel_base(&self) -> Option<u64> {
        match self {
            MachineCommands::Qemu(_) => None,
            MachineCommands::Vmware(m) => m.kernel_base(),
        }
    }

    /// Locate the kernel image in target memory
    pub async fn discover_kernel_base(&self, max_pages: u64) -> Result<Option<u64>> {
        match self {
            MachineCommands::Qemu(_) => Err(CommandError::Unsupported("kernel base discovery")),
            MachineCommands::Vmware(m) => m.discover_kernel_base(max_pages).await,
        }
    }

    /// Claim the discovery slot; false if discovery is unsupported, already
    /// running or already done
    pub fn begin_discovery(&self) -> bool {
        match self {
            MachineCommands::Qemu(_) => false,
            MachineCommands::Vmware(m) => m.begin_discovery(),
        }
    }

    pub fn end_discovery(&self) {
        if let MachineCommands::Vmware(m) = self {
            m.end_discovery();
        }
    }
}

impl MemoryAccess for MachineCommands {
    fn read_memory(&self, address: u64, size: usize) -> impl Future<Output = Result<Vec<u8>>> + Send {
        self.core().read_memory(address, size)
    }
}
