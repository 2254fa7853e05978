/// VMware debug stub dialect
///
/// VMware's stub resumes with plain `s`/`c` and prints control and
/// descriptor-table registers through `qRcmd` monitor commands. It is also
/// the variant that can locate the Windows kernel image in guest memory.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::commands::{CommandCore, CommandError, Result};
use crate::memory::RemoteStream;
use crate::parser::{parse_scalar_register, parse_table_register};
use crate::pe;
use crate::types::{BreakpointKind, ControlRegisters, DescriptorTable, RegisterContext};

/// Lowest canonical kernel-half address
pub const KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;
/// The scan stops once it reaches this address
pub const KERNEL_SCAN_FLOOR: u64 = 0xFFFF_F800_0000_0000;
const PAGE_SIZE: u64 = 0x1000;
const KERNEL_PDB_NAMES: [&str; 4] = ["ntoskrnl.pdb", "ntkrnlpa.pdb", "ntkrnlmp.pdb", "ntkrpamp.pdb"];

pub struct VmwareCommands {
    core: CommandCore,
    // zero while unknown
    kernel_base: AtomicU64,
    discovering: AtomicBool,
}

impl VmwareCommands {
    pub fn new(core: CommandCore) -> Self {
        Self {
            core,
            kernel_base: AtomicU64::new(0),
            discovering: AtomicBool::new(false),
        }
    }

    pub fn core(&self) -> &CommandCore {
        &self.core
    }

    /// `Z` type for a breakpoint kind: 0 execute, 2 write, 4 access.
    /// The stub backs all three with hardware debug registers.
    pub fn breakpoint_code(kind: BreakpointKind) -> u8 {
        match kind {
            BreakpointKind::Execute => 0,
            BreakpointKind::Write => 2,
            BreakpointKind::Access => 4,
        }
    }

    pub async fn step(&self) -> Result<()> {
        self.core.resume("s").await
    }

    pub async fn continue_execution(&self) -> Result<()> {
        self.core.resume("c").await
    }

    /// General purpose registers plus the monitor-only control registers.
    /// A failed sub-query leaves its field at zero; the target resuming
    /// part way through fails the whole read.
    pub async fn read_context(&self) -> Result<RegisterContext> {
        let context = self.core.read_registers().await?;
        let control = self.read_control_registers().await?;
        Ok(context.with_control(control))
    }

    async fn read_control_registers(&self) -> Result<ControlRegisters> {
        Ok(ControlRegisters {
            cr0: self.scalar_or_zero("cr0").await?,
            cr2: self.scalar_or_zero("cr2").await?,
            cr3: self.scalar_or_zero("cr3").await?,
            cr4: self.scalar_or_zero("cr4").await?,
            cr8: self.scalar_or_zero("cr8").await?,
            idtr: self.table_or_zero("idtr").await?,
            gdtr: self.table_or_zero("gdtr").await?,
        })
    }

    async fn scalar_or_zero(&self, name: &str) -> Result<u64> {
        self.core.require_halted()?;
        let result = match self.core.execute_monitor(&format!("r {}", name)).await {
            Ok(text) => parse_scalar_register(&text, name).map_err(CommandError::Parse),
            Err(e) => Err(e),
        };
        Ok(result.unwrap_or_else(|e| {
            log::debug!("Reading {} failed: {}", name, e);
            0
        }))
    }

    async fn table_or_zero(&self, name: &str) -> Result<DescriptorTable> {
        self.core.require_halted()?;
        let result = match self.core.execute_monitor(&format!("r {}", name)).await {
            Ok(text) => parse_table_register(&text, name).map_err(CommandError::Parse),
            Err(e) => Err(e),
        };
        Ok(result.unwrap_or_else(|e| {
            log::debug!("Reading {} failed: {}", name, e);
            DescriptorTable::default()
        }))
    }

    pub fn kernel_base(&self) -> Option<u64> {
        match self.kernel_base.load(Ordering::SeqCst) {
            0 => None,
            base => Some(base),
        }
    }

    pub fn begin_discovery(&self) -> bool {
        if self.kernel_base().is_some() {
            return false;
        }
        self.discovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_discovery(&self) {
        self.discovering.store(false, Ordering::SeqCst);
    }

    /// Find the kernel image by walking down from the first interrupt
    /// handler until a page carries a PE header naming a kernel PDB.
    /// Returns `None` when the target is not currently in kernel mode or
    /// no image was found within `max_pages`.
    pub async fn discover_kernel_base(&self, max_pages: u64) -> Result<Option<u64>> {
        if let Some(base) = self.kernel_base() {
            return Ok(Some(base));
        }

        let context = self.read_context().await?;
        if context.rip < KERNEL_SPACE_START {
            log::debug!("rip {:#x} is in user space, deferring kernel discovery", context.rip);
            return Ok(None);
        }

        let idt_base = context.control.map(|c| c.idtr.base).unwrap_or(0);
        if idt_base == 0 {
            log::debug!("IDT base unavailable, cannot locate kernel");
            return Ok(None);
        }

        let gate = self.core.read_memory(idt_base, 16).await?;
        let handler = idt_gate_handler(&gate)
            .ok_or_else(|| CommandError::Parse("short IDT gate".to_string()))?;
        log::debug!("IDT[0] handler at {:#x}", handler);

        let mut scanned = 0u64;
        for candidate in scan_candidates(handler, max_pages) {
            scanned += 1;
            let mut stream = RemoteStream::new(&self.core, candidate);
            match pe::read_debug_descriptor(&mut stream).await {
                Ok(Some(descriptor)) if is_kernel_pdb(&descriptor.pdb_name) => {
                    log::info!(
                        "Kernel image {} found at {:#x} after {} pages",
                        descriptor.pdb_name,
                        candidate,
                        scanned
                    );
                    self.kernel_base.store(candidate, Ordering::SeqCst);
                    return Ok(Some(candidate));
                }
                Ok(_) => {}
                Err(e) => log::trace!("No image at {:#x}: {}", candidate, e),
            }
        }

        log::warn!("Kernel image not found within {} pages of {:#x}", scanned, handler);
        Ok(None)
    }
}

/// Pages scanned for the kernel image, walking down from the 64 KiB
/// boundary below `handler` and stopping above [`KERNEL_SCAN_FLOOR`]
pub fn scan_candidates(handler: u64, max_pages: u64) -> impl Iterator<Item = u64> {
    let start = handler & !0xFFFF;
    (0..max_pages)
        .map_while(move |page| start.checked_sub(page.checked_mul(PAGE_SIZE)?))
        .take_while(|candidate| *candidate > KERNEL_SCAN_FLOOR)
}

/// Reassemble the handler offset of a 64-bit interrupt gate descriptor
pub fn idt_gate_handler(gate: &[u8]) -> Option<u64> {
    if gate.len() < 12 {
        return None;
    }
    let low = u16::from_le_bytes([gate[0], gate[1]]) as u64;
    let mid = u16::from_le_bytes([gate[6], gate[7]]) as u64;
    let high = u32::from_le_bytes([gate[8], gate[9], gate[10], gate[11]]) as u64;
    Some(low | (mid << 16) | (high << 32))
}

/// True if a CodeView PDB name belongs to one of the kernel builds
pub fn is_kernel_pdb(pdb_name: &str) -> bool {
    let file = pdb_name.rsplit(['\\', '/']).next().unwrap_or(pdb_name);
    KERNEL_PDB_NAMES
        .iter()
        .any(|known| known.eq_ignore_ascii_case(file))
}
