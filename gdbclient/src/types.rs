/// Debugger data types
///
/// Typed views over the values carried by RSP replies: register snapshots,
/// breakpoints, stop replies and negotiated stub features.

use serde::{Deserialize, Serialize};

/// Base/limit pair of a descriptor table register (IDTR, GDTR)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// Registers only reachable through monitor commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRegisters {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub idtr: DescriptorTable,
    pub gdtr: DescriptorTable,
}

/// Snapshot of the x86-64 register file, replaced wholesale on every read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub control: Option<ControlRegisters>,
}

impl RegisterContext {
    /// Bytes covered by the `g` layout: 17 quadwords then 7 dwords
    pub const GDB_BLOB_LEN: usize = 17 * 8 + 7 * 4;
    pub const RIP_OFFSET: usize = 16 * 8;

    /// Decode the target-ordered (little-endian) `g` blob. Trailing registers
    /// beyond the fixed layout are ignored.
    pub fn from_gdb_blob(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < Self::GDB_BLOB_LEN {
            return Err(format!(
                "Register blob too short: {} bytes, need {}",
                bytes.len(),
                Self::GDB_BLOB_LEN
            ));
        }

        let q = |index: usize| {
            let start = index * 8;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[start..start + 8]);
            u64::from_le_bytes(raw)
        };
        let d = |index: usize| {
            let start = 17 * 8 + index * 4;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[start..start + 4]);
            u32::from_le_bytes(raw)
        };

        Ok(RegisterContext {
            rax: q(0),
            rbx: q(1),
            rcx: q(2),
            rdx: q(3),
            rsi: q(4),
            rdi: q(5),
            rbp: q(6),
            rsp: q(7),
            r8: q(8),
            r9: q(9),
            r10: q(10),
            r11: q(11),
            r12: q(12),
            r13: q(13),
            r14: q(14),
            r15: q(15),
            rip: q(16),
            rflags: d(0),
            cs: d(1),
            ss: d(2),
            ds: d(3),
            es: d(4),
            fs: d(5),
            gs: d(6),
            control: None,
        })
    }

    pub fn with_control(mut self, control: ControlRegisters) -> Self {
        self.control = Some(control);
        self
    }

    /// The sixteen general purpose registers in encoding order
    pub fn general_purpose(&self) -> [(&'static str, u64); 16] {
        [
            ("rax", self.rax),
            ("rbx", self.rbx),
            ("rcx", self.rcx),
            ("rdx", self.rdx),
            ("rsi", self.rsi),
            ("rdi", self.rdi),
            ("rbp", self.rbp),
            ("rsp", self.rsp),
            ("r8", self.r8),
            ("r9", self.r9),
            ("r10", self.r10),
            ("r11", self.r11),
            ("r12", self.r12),
            ("r13", self.r13),
            ("r14", self.r14),
            ("r15", self.r15),
        ]
    }
}

impl std::fmt::Display for RegisterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (name, value)) in self.general_purpose().iter().enumerate() {
            write!(f, "{:>3}={:016x}", name, value)?;
            if i % 4 == 3 {
                writeln!(f)?;
            } else {
                write!(f, "  ")?;
            }
        }
        writeln!(f, "rip={:016x}  rflags={:08x}", self.rip, self.rflags)?;
        write!(
            f,
            " cs={:04x} ss={:04x} ds={:04x} es={:04x} fs={:04x} gs={:04x}",
            self.cs, self.ss, self.ds, self.es, self.fs, self.gs
        )?;
        if let Some(c) = &self.control {
            writeln!(f)?;
            writeln!(
                f,
                "cr0={:016x}  cr2={:016x}  cr3={:016x}  cr4={:016x}  cr8={:x}",
                c.cr0, c.cr2, c.cr3, c.cr4, c.cr8
            )?;
            write!(
                f,
                "idtr={:016x}/{:04x}  gdtr={:016x}/{:04x}",
                c.idtr.base, c.idtr.limit, c.gdtr.base, c.gdtr.limit
            )?;
        }
        Ok(())
    }
}

/// What a breakpoint triggers on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakpointKind {
    Execute,
    Write,
    Access,
}

impl BreakpointKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "x" | "exec" | "execute" => Some(BreakpointKind::Execute),
            "w" | "write" => Some(BreakpointKind::Write),
            "a" | "rw" | "access" => Some(BreakpointKind::Access),
            _ => None,
        }
    }
}

impl std::fmt::Display for BreakpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakpointKind::Execute => "execute",
            BreakpointKind::Write => "write",
            BreakpointKind::Access => "access",
        };
        write!(f, "{}", s)
    }
}

/// A breakpoint as the remote stub sees it; nothing is stored client side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BreakpointSpec {
    pub kind: BreakpointKind,
    pub address: u64,
    pub size: u64,
}

impl BreakpointSpec {
    pub fn execute(address: u64) -> Self {
        BreakpointSpec {
            kind: BreakpointKind::Execute,
            address,
            size: 1,
        }
    }
}

impl std::fmt::Display for BreakpointSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:#x} ({} bytes)", self.kind, self.address, self.size)
    }
}

/// Why a stop reply was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopKind {
    /// `S`/`T`: the target received a signal
    Signal(u8),
    /// `W`: the process exited with a status
    Exited(u8),
    /// `X`: the process was terminated by a signal
    Terminated(u8),
}

/// Stop reason keys of a `T` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    SoftwareBreakpoint,
    HardwareBreakpoint,
    Watchpoint(u64),
    ReadWatchpoint(u64),
    AccessWatchpoint(u64),
    LibraryChanged,
    Fork,
    Vfork,
    Exec,
    ThreadCreated,
}

impl StopReason {
    /// Parse a `T` reply key and its value
    pub fn from_pair(key: &str, value: &str) -> Option<Self> {
        let address = || u64::from_str_radix(value, 16).unwrap_or(0);
        match key {
            "swbreak" => Some(StopReason::SoftwareBreakpoint),
            "hwbreak" => Some(StopReason::HardwareBreakpoint),
            "watch" => Some(StopReason::Watchpoint(address())),
            "rwatch" => Some(StopReason::ReadWatchpoint(address())),
            "awatch" => Some(StopReason::AccessWatchpoint(address())),
            "library" => Some(StopReason::LibraryChanged),
            "fork" => Some(StopReason::Fork),
            "vfork" => Some(StopReason::Vfork),
            "exec" => Some(StopReason::Exec),
            "create" => Some(StopReason::ThreadCreated),
            _ => None,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::SoftwareBreakpoint => write!(f, "software-breakpoint"),
            StopReason::HardwareBreakpoint => write!(f, "hardware-breakpoint"),
            StopReason::Watchpoint(addr) => write!(f, "watchpoint-trigger@{:x}", addr),
            StopReason::ReadWatchpoint(addr) => write!(f, "read-watchpoint-trigger@{:x}", addr),
            StopReason::AccessWatchpoint(addr) => write!(f, "access-watchpoint-trigger@{:x}", addr),
            StopReason::LibraryChanged => write!(f, "library"),
            StopReason::Fork => write!(f, "fork"),
            StopReason::Vfork => write!(f, "vfork"),
            StopReason::Exec => write!(f, "exec"),
            StopReason::ThreadCreated => write!(f, "create"),
        }
    }
}

/// Parsed stop notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReply {
    pub kind: StopKind,
    pub thread: Option<String>,
    pub core: Option<u32>,
    pub reason: Option<StopReason>,
    /// `nn:value` register entries, value still in target-ordered hex
    pub registers: Vec<(u32, String)>,
}

impl StopReply {
    pub fn signal(&self) -> Option<u8> {
        match self.kind {
            StopKind::Signal(signal) => Some(signal),
            _ => None,
        }
    }
}

/// Capabilities advertised in the `qSupported` reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFeatures {
    pub packet_size: Option<usize>,
    pub vcont: bool,
    pub no_ack_mode: bool,
    pub multiprocess: bool,
    pub xml_target: bool,
    pub swbreak: bool,
    pub hwbreak: bool,
}
