/// QEMU gdbstub dialect
///
/// QEMU resumes through `vCont` and exposes only the general purpose
/// register file over `g`.

use crate::commands::{CommandCore, Result};
use crate::types::{BreakpointKind, RegisterContext};

pub struct QemuCommands {
    core: CommandCore,
}

impl QemuCommands {
    pub fn new(core: CommandCore) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &CommandCore {
        &self.core
    }

    /// `Z` type for a breakpoint kind. Execute uses the software breakpoint
    /// (type 0); data breakpoints map to the write (2) and access (4)
    /// watchpoints, which QEMU implements in its TCG and KVM backends.
    pub fn breakpoint_code(kind: BreakpointKind) -> u8 {
        match kind {
            BreakpointKind::Execute => 0,
            BreakpointKind::Write => 2,
            BreakpointKind::Access => 4,
        }
    }

    pub async fn step(&self) -> Result<()> {
        self.core.resume("vCont;s").await
    }

    pub async fn continue_execution(&self) -> Result<()> {
        self.core.resume("vCont;c").await
    }

    pub async fn read_context(&self) -> Result<RegisterContext> {
        self.core.read_registers().await
    }
}
