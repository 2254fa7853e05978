/// GDB Remote Serial Protocol client for kernel debugging
///
/// This crate speaks RSP to a VM's debug stub (VMware or QEMU) and provides a
/// high-level, state-guarded API for debugging operations: stepping, breaking,
/// reading registers and memory, breakpoints, disassembly and kernel symbols.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub mod commands;
pub mod communication;
pub mod config;
pub mod correlator;
pub mod disasm;
pub mod events;
pub mod memory;
pub mod packet;
pub mod parser;
pub mod pe;
pub mod qemu;
pub mod reassembler;
pub mod symbols;
pub mod types;
pub mod vmware;

pub use commands::{CommandError, MachineCommands, MachineKind, MemoryAccess};
pub use communication::{TransportError, TransportEvent, TransportOptions, TransportSession};
pub use config::{ConfigError, SessionConfig};
pub use disasm::{Disassembler, Instruction, X86_64Disassembler};
pub use events::{DebuggerState, StopEvent};
pub use packet::{Packet, PacketError};
pub use symbols::{LookupStrategy, SymbolMatch, SymbolResolver, SymbolSource};
pub use types::*;

use memory::RemoteStream;
use pe::PeError;
use symbols::{JsonSymbolStore, ModuleSymbols, NoSymbols, KERNEL_MODULE};

/// Features this client asks for during negotiation
pub const SUPPORTED_QUERY: &str = "qSupported:multiprocess+;swbreak+;hwbreak+;vContSupported+";

#[derive(Error, Debug)]
pub enum DebugError {
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: DebuggerState,
    },
    #[error("Not connected")]
    NotConnected,
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, DebugError>;

type Opened = communication::Result<(TransportSession, mpsc::UnboundedReceiver<TransportEvent>)>;

struct Connection {
    transport: TransportSession,
    machine: Arc<MachineCommands>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: SessionConfig,
    machine_kind: Mutex<MachineKind>,
    connection: RwLock<Option<Arc<Connection>>>,
    features: Mutex<Option<RemoteFeatures>>,
    events: events::SessionEvents,
    symbols: SymbolResolver,
    symbol_source: Arc<dyn SymbolSource>,
    symbol_loading: AtomicBool,
    disassembler: Box<dyn Disassembler>,
}

/// One debugging session against one stub. Cheap to clone; clones share
/// the connection and state.
#[derive(Clone)]
pub struct DebugSession {
    inner: Arc<Inner>,
}

impl DebugSession {
    /// Create a session using the x86-64 disassembler and, if `symbol_path`
    /// is configured, a JSON symbol store
    pub fn new(config: SessionConfig) -> Self {
        let symbol_source: Arc<dyn SymbolSource> = match &config.symbol_path {
            Some(path) => Arc::new(JsonSymbolStore::new(path)),
            None => Arc::new(NoSymbols),
        };
        Self::with_components(config, Box::new(X86_64Disassembler::new()), symbol_source)
    }

    pub fn with_components(
        config: SessionConfig,
        disassembler: Box<dyn Disassembler>,
        symbol_source: Arc<dyn SymbolSource>,
    ) -> Self {
        let machine_kind = config.machine;
        DebugSession {
            inner: Arc::new(Inner {
                config,
                machine_kind: Mutex::new(machine_kind),
                connection: RwLock::new(None),
                features: Mutex::new(None),
                events: events::SessionEvents::new(),
                symbols: SymbolResolver::new(),
                symbol_source,
                symbol_loading: AtomicBool::new(false),
                disassembler,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> DebuggerState {
        self.inner.events.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DebuggerState> {
        self.inner.events.subscribe()
    }

    /// Wait until the session reaches `target`; false on timeout
    pub async fn wait_for_state(&self, target: DebuggerState, timeout: Duration) -> bool {
        self.inner.events.wait_for(target, timeout).await
    }

    pub fn on_stop<F>(&self, callback: F)
    where
        F: Fn(&StopEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_stop(callback);
    }

    pub fn on_resumed<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.events.on_resumed(callback);
    }

    pub fn on_state_changed<F>(&self, callback: F)
    where
        F: Fn(DebuggerState) + Send + Sync + 'static,
    {
        self.inner.events.on_state_changed(callback);
    }

    pub fn active_machine(&self) -> MachineKind {
        *self.inner.machine_kind.lock().unwrap()
    }

    /// Choose the stub dialect used by the next connect
    pub fn set_active_machine(&self, kind: MachineKind) -> Result<()> {
        self.require_state("switch machine", DebuggerState::Disconnected)?;
        *self.inner.machine_kind.lock().unwrap() = kind;
        log::info!("Active machine set to {}", kind);
        Ok(())
    }

    /// What the stub reported in its `qSupported` reply
    pub fn features(&self) -> Option<RemoteFeatures> {
        self.inner.features.lock().unwrap().clone()
    }

    pub fn kernel_base(&self) -> Option<u64> {
        self.connection().ok()?.machine.kernel_base()
    }

    /// Commands still waiting for a reply, oldest first
    pub fn pending_commands(&self) -> Vec<String> {
        match self.connection() {
            Ok(connection) => connection.transport.pending_commands(),
            Err(_) => Vec::new(),
        }
    }

    pub fn symbols(&self) -> &SymbolResolver {
        &self.inner.symbols
    }

    pub fn lookup_symbol(&self, address: u64) -> Option<SymbolMatch> {
        self.inner.symbols.lookup(address, LookupStrategy::Default)
    }

    /// Connect to the configured host and port
    pub async fn connect(&self) -> Result<()> {
        let host = self.inner.config.host.clone();
        self.connect_to(&host, self.inner.config.port).await
    }

    pub async fn connect_to(&self, host: &str, port: u16) -> Result<()> {
        let options = self.inner.config.transport_options();
        self.establish(TransportSession::connect(host, port, options))
            .await
    }

    /// Run the session over an already open stream
    pub async fn attach<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let options = self.inner.config.transport_options();
        self.establish(TransportSession::attach(stream, options)).await
    }

    /// The session stays Busy until the stub answers the initial status
    /// query, which moves it to Halted.
    async fn establish(&self, open: impl Future<Output = Opened>) -> Result<()> {
        let state = self.state();
        if !self
            .inner
            .events
            .compare_and_set(DebuggerState::Disconnected, DebuggerState::Busy)
        {
            return Err(DebugError::InvalidState {
                operation: "connect",
                state,
            });
        }

        match self.inner.open_connection(open).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("Connect failed: {}", e);
                self.inner.events.set_state(DebuggerState::Disconnected);
                Err(e)
            }
        }
    }

    /// Close the connection and cancel everything in flight. Does nothing
    /// when already disconnected.
    pub async fn disconnect(&self) {
        let connection = self.inner.connection.write().unwrap().take();
        if let Some(connection) = connection {
            if let Some(task) = connection.event_task.lock().unwrap().take() {
                task.abort();
            }
            connection.transport.dispose().await;
            log::info!("Disconnected");
        }
        self.inner.reset();
    }

    pub async fn step(&self) -> Result<()> {
        self.resume("step", true).await
    }

    pub async fn continue_execution(&self) -> Result<()> {
        self.resume("continue", false).await
    }

    /// Moves Halted -> Busy; the acknowledgement moves Busy -> Running and
    /// the stop reply Running -> Halted
    async fn resume(&self, operation: &'static str, step: bool) -> Result<()> {
        let connection = self.connection()?;
        self.transition(operation, DebuggerState::Halted, DebuggerState::Busy)?;

        let result = if step {
            connection.machine.step().await
        } else {
            connection.machine.continue_execution().await
        };

        if let Err(e) = result {
            log::warn!("{} failed: {}", operation, e);
            self.inner
                .events
                .compare_and_set(DebuggerState::Busy, DebuggerState::Halted);
            return Err(e.into());
        }
        Ok(())
    }

    /// Interrupt a running target
    pub async fn break_execution(&self) -> Result<()> {
        let connection = self.connection()?;
        self.transition("break", DebuggerState::Running, DebuggerState::Busy)?;

        if let Err(e) = connection.machine.interrupt().await {
            log::warn!("break failed: {}", e);
            self.inner
                .events
                .compare_and_set(DebuggerState::Busy, DebuggerState::Running);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn read_context(&self) -> Result<RegisterContext> {
        let machine = self.halted_machine("read context")?;
        Ok(machine.read_context().await?)
    }

    pub async fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let machine = self.halted_machine("read memory")?;
        Ok(machine.read_memory(address, size).await?)
    }

    pub async fn add_breakpoint(&self, spec: &BreakpointSpec) -> Result<()> {
        let machine = self.halted_machine("add breakpoint")?;
        machine.add_breakpoint(spec).await?;
        log::info!("Breakpoint set: {}", spec);
        Ok(())
    }

    pub async fn remove_breakpoint(&self, spec: &BreakpointSpec) -> Result<()> {
        let machine = self.halted_machine("remove breakpoint")?;
        machine.remove_breakpoint(spec).await?;
        log::info!("Breakpoint removed: {}", spec);
        Ok(())
    }

    /// Disassemble `size` bytes at `address`. Unreadable memory gives an
    /// empty listing.
    pub async fn disassemble(&self, address: u64, size: usize) -> Result<Vec<Instruction>> {
        let machine = self.halted_machine("disassemble")?;
        match machine.read_memory(address, size).await {
            Ok(bytes) => Ok(self.disassemble_bytes(&bytes, address)),
            Err(e) => {
                log::debug!("Disassembly read at {:#x} failed: {}", address, e);
                Ok(Vec::new())
            }
        }
    }

    /// Disassemble caller-provided bytes, annotating symbols where known
    pub fn disassemble_bytes(&self, bytes: &[u8], base: u64) -> Vec<Instruction> {
        let table = self.inner.symbols.snapshot();
        let mut listing = self.inner.disassembler.disassemble(bytes, base);
        if !table.is_empty() {
            for instruction in &mut listing {
                instruction.symbol = table
                    .lookup(instruction.ip, LookupStrategy::Default)
                    .map(|m| m.to_string());
            }
        }
        listing
    }

    /// Send a raw RSP command and return the reply payload
    pub async fn execute_raw(&self, command: &str) -> Result<String> {
        let machine = self.halted_machine("execute")?;
        Ok(machine.execute_raw(command).await?)
    }

    /// Run a stub monitor command (`qRcmd`) and return its output
    pub async fn execute_monitor(&self, command: &str) -> Result<String> {
        let machine = self.halted_machine("execute monitor command")?;
        Ok(machine.execute_monitor(command).await?)
    }

    /// Load kernel symbols now. Returns false if the kernel base is not
    /// known yet or nothing could be loaded.
    pub async fn load_symbols(&self) -> Result<bool> {
        let machine = self.halted_machine("load symbols")?;
        let Some(base) = machine.kernel_base() else {
            return Ok(false);
        };
        Ok(self.inner.load_kernel_symbols(&machine, base).await)
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.inner
            .connection
            .read()
            .unwrap()
            .clone()
            .ok_or(DebugError::NotConnected)
    }

    fn require_state(&self, operation: &'static str, required: DebuggerState) -> Result<()> {
        let state = self.state();
        if state == required {
            Ok(())
        } else {
            Err(DebugError::InvalidState { operation, state })
        }
    }

    fn halted_machine(&self, operation: &'static str) -> Result<Arc<MachineCommands>> {
        self.require_state(operation, DebuggerState::Halted)?;
        Ok(Arc::clone(&self.connection()?.machine))
    }

    fn transition(
        &self,
        operation: &'static str,
        from: DebuggerState,
        to: DebuggerState,
    ) -> Result<()> {
        let state = self.state();
        if self.inner.events.compare_and_set(from, to) {
            Ok(())
        } else {
            Err(DebugError::InvalidState { operation, state })
        }
    }
}

impl Inner {
    async fn open_connection(self: &Arc<Self>, open: impl Future<Output = Opened>) -> Result<()> {
        let (transport, events) = open.await?;

        let mut packet_size = self.config.packet_size;
        if self.config.negotiate_features {
            match self.negotiate(&transport).await {
                Ok(features) => {
                    if let Some(size) = features.packet_size {
                        packet_size = size;
                    }
                    *self.features.lock().unwrap() = Some(features);
                }
                Err(TransportError::CommandTimeout { .. }) => {
                    log::warn!("Stub did not answer qSupported, using defaults");
                }
                Err(e) => {
                    transport.dispose().await;
                    return Err(e.into());
                }
            }
        }

        let kind = *self.machine_kind.lock().unwrap();
        let machine = Arc::new(MachineCommands::new(kind, transport.clone(), packet_size));
        log::info!("Session ready: {} stub, packet size {}", kind, packet_size);

        let connection = Arc::new(Connection {
            transport,
            machine: Arc::clone(&machine),
            event_task: Mutex::new(None),
        });
        *self.connection.write().unwrap() = Some(Arc::clone(&connection));

        let task = tokio::spawn(event_loop(Arc::downgrade(self), machine, events));
        *connection.event_task.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn negotiate(&self, transport: &TransportSession) -> communication::Result<RemoteFeatures> {
        let reply = transport.send_command(SUPPORTED_QUERY).await?;
        if reply.is_error() || reply.payload().is_empty() {
            log::info!("Stub does not support qSupported ({})", reply.payload());
            return Ok(RemoteFeatures::default());
        }

        let features = parser::parse_supported(reply.payload());
        log::info!("Remote features: {:?}", features);
        if features.no_ack_mode {
            log::debug!("Stub offers no-ack mode, keeping acknowledgements on");
        }
        Ok(features)
    }

    fn is_current(&self, machine: &Arc<MachineCommands>) -> bool {
        self.connection
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(&c.machine, machine))
    }

    fn reset(&self) {
        *self.features.lock().unwrap() = None;
        self.symbols.clear();
        self.events.set_state(DebuggerState::Disconnected);
    }

    fn handle_stop(self: &Arc<Self>, machine: &Arc<MachineCommands>, packet: Packet) {
        let reply = match parser::parse_stop_reply(packet.payload()) {
            Ok(reply) => Some(reply),
            Err(e) => {
                log::warn!("Unparsable stop reply '{}': {}", packet.payload(), e);
                None
            }
        };

        machine.set_halted(true);
        self.events.set_state(DebuggerState::Halted);
        if let Some(reply) = &reply {
            log::info!("Target halted: {:?} thread {:?}", reply.kind, reply.thread);
        }
        self.events.notify_stop(&StopEvent { packet, reply });

        self.after_halt(machine);
    }

    fn handle_resumed(&self) {
        self.events
            .compare_and_set(DebuggerState::Busy, DebuggerState::Running);
        self.events.notify_resumed();
    }

    async fn handle_connection_lost(&self, machine: &Arc<MachineCommands>) {
        let connection = {
            let mut current = self.connection.write().unwrap();
            match current.as_ref() {
                Some(c) if Arc::ptr_eq(&c.machine, machine) => current.take(),
                _ => None,
            }
        };

        if let Some(connection) = connection {
            log::warn!("Connection to the stub was lost");
            connection.transport.dispose().await;
            self.reset();
        }
    }

    /// Kick off kernel discovery, then symbol loading, as background tasks.
    /// They queue on the transport like any other caller.
    fn after_halt(self: &Arc<Self>, machine: &Arc<MachineCommands>) {
        if let Some(base) = machine.kernel_base() {
            self.spawn_symbol_load(machine, base);
            return;
        }
        if self.config.kernel_scan_pages == 0 || !machine.begin_discovery() {
            return;
        }

        let inner = Arc::clone(self);
        let machine = Arc::clone(machine);
        tokio::spawn(async move {
            let result = machine
                .discover_kernel_base(inner.config.kernel_scan_pages)
                .await;
            machine.end_discovery();

            match result {
                Ok(Some(base)) if inner.is_current(&machine) => {
                    inner.spawn_symbol_load(&machine, base)
                }
                Ok(_) => {}
                Err(e) => log::warn!("Kernel base discovery failed: {}", e),
            }
        });
    }

    fn spawn_symbol_load(self: &Arc<Self>, machine: &Arc<MachineCommands>, base: u64) {
        if self.symbols.has_module(KERNEL_MODULE) {
            return;
        }

        let inner = Arc::clone(self);
        let machine = Arc::clone(machine);
        tokio::spawn(async move {
            inner.load_kernel_symbols(&machine, base).await;
        });
    }

    async fn load_kernel_symbols(&self, machine: &Arc<MachineCommands>, base: u64) -> bool {
        if self.symbol_loading.swap(true, Ordering::SeqCst) {
            log::debug!("Symbol load already in progress");
            return false;
        }
        let loaded = self.resolve_kernel_symbols(machine, base).await;
        self.symbol_loading.store(false, Ordering::SeqCst);

        match loaded {
            Some(symbols) if self.is_current(machine) => {
                log::info!("Installed {} kernel symbols at {:#x}", symbols.len(), base);
                self.symbols
                    .install_module(ModuleSymbols::new(KERNEL_MODULE, symbols));
                true
            }
            _ => false,
        }
    }

    async fn resolve_kernel_symbols(
        &self,
        machine: &Arc<MachineCommands>,
        base: u64,
    ) -> Option<Vec<symbols::Symbol>> {
        let mut stream = RemoteStream::new(machine.as_ref(), base);
        let descriptor = match pe::read_debug_descriptor(&mut stream).await {
            Ok(descriptor) => descriptor,
            Err(PeError::Read(e)) => {
                log::warn!("Kernel image at {:#x} is unreadable: {}", base, e);
                return None;
            }
            Err(e) => {
                log::warn!("Kernel image at {:#x} is not a valid PE: {}", base, e);
                None
            }
        };

        if let Some(descriptor) = descriptor {
            log::info!("Loading symbols for {}", descriptor);
            let source = Arc::clone(&self.symbol_source);
            let key = descriptor.clone();
            let loaded = tokio::task::spawn_blocking(move || source.load_symbols(&key, base))
                .await
                .unwrap_or_else(|e| {
                    log::error!("Symbol loader panicked: {}", e);
                    None
                });

            match loaded {
                Some(symbols) if !symbols.is_empty() => return Some(symbols),
                _ => log::info!("No symbols found for {}, using built-in table", descriptor),
            }
        }

        Some(symbols::kernel_fallback_symbols(base))
    }
}

async fn event_loop(
    inner: Weak<Inner>,
    machine: Arc<MachineCommands>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            TransportEvent::Stop(packet) => inner.handle_stop(&machine, packet),
            TransportEvent::Resumed => inner.handle_resumed(),
            TransportEvent::ConnectionLost => {
                inner.handle_connection_lost(&machine).await;
                break;
            }
        }
    }
    log::debug!("Session event loop finished");
}
