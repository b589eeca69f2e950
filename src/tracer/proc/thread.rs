use crate::tracer::address::RelocatedAddress;
use crate::tracer::register::{Register, RegisterMap};
use nix::unistd::Pid;

/// Register snapshot of a single stopped thread.
/// `pc`/`sp`/`fp` are the canonical slots consumed by the unwinder, kept in
/// sync with the architecture specific register file.
#[derive(Debug, Clone)]
pub struct ThreadState {
    pub lwp: Pid,
    pub regs: RegisterMap,
    pub pc: RelocatedAddress,
    pub sp: RelocatedAddress,
    pub fp: RelocatedAddress,
}

impl ThreadState {
    pub fn new(lwp: Pid, regs: RegisterMap) -> Self {
        Self {
            lwp,
            pc: RelocatedAddress::from(regs.value(Register::Rip)),
            sp: RelocatedAddress::from(regs.value(Register::Rsp)),
            fp: RelocatedAddress::from(regs.value(Register::Rbp)),
            regs,
        }
    }

    /// Propagate the canonical slots back into the register file so
    /// downstream register views stay consistent.
    pub fn sync_regs(&mut self) {
        self.regs.update(Register::Rip, self.pc.as_u64());
        self.regs.update(Register::Rsp, self.sp.as_u64());
        self.regs.update(Register::Rbp, self.fp.as_u64());
    }
}
