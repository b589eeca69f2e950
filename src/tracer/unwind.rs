use crate::muted_error;
use crate::tracer::address::RelocatedAddress;
use crate::tracer::dwarf::unwind::unwind_once;
use crate::tracer::error::Error;
use crate::tracer::proc::thread::ThreadState;
use crate::tracer::proc::Proc;
use crate::tracer::register::{DwarfRegisterMap, DWARF_FP, DWARF_RA};
use std::mem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Stepped,
    EndOfStack,
}

enum DwarfStep {
    Stepped,
    End,
    NoInfo,
}

/// Per-thread cursor over stack frames.
///
/// The cursor starts at the innermost frame (the thread snapshot) and each
/// [`UnwindCursor::step`] moves one frame towards the outermost caller,
/// first through debug unwind tables and, failing that, through the ABI
/// frame-pointer chain.
pub struct UnwindCursor<'a> {
    proc: &'a Proc,
    state: ThreadState,
    dwarf_regs: DwarfRegisterMap,
    frame_no: u32,
}

impl<'a> UnwindCursor<'a> {
    pub fn new(proc: &'a Proc, thread: &ThreadState) -> Self {
        Self {
            proc,
            state: thread.clone(),
            dwarf_regs: DwarfRegisterMap::from(thread.regs),
            frame_no: 0,
        }
    }

    /// Register view of the current frame.
    pub fn state(&self) -> &ThreadState {
        &self.state
    }

    pub fn dwarf_regs(&self) -> &DwarfRegisterMap {
        &self.dwarf_regs
    }

    pub fn frame_no(&self) -> u32 {
        self.frame_no
    }

    pub fn pc(&self) -> RelocatedAddress {
        self.state.pc
    }

    /// Advance to the caller frame.
    pub fn step(&mut self) -> Result<StepResult, Error> {
        if self.state.pc.is_null() {
            return Ok(StepResult::EndOfStack);
        }

        match self.dwarf_step() {
            DwarfStep::Stepped => Ok(StepResult::Stepped),
            DwarfStep::End => Ok(StepResult::EndOfStack),
            DwarfStep::NoInfo => self.fp_step(),
        }
    }

    /// Debug-table unwind: evaluate the CFI row of the current pc and adopt
    /// the caller's registers.
    fn dwarf_step(&mut self) -> DwarfStep {
        let Some(mapping) = self.proc.mapping_for_addr(self.state.pc) else {
            return DwarfStep::NoInfo;
        };
        let Some(di) = mapping.object.debug_info() else {
            return DwarfStep::NoInfo;
        };

        let frame = match muted_error!(unwind_once(
            self.proc,
            &mapping.object,
            &di,
            &self.dwarf_regs,
            self.state.pc
        )) {
            Some(Some(frame)) => frame,
            _ => return DwarfStep::NoInfo,
        };

        let Some(ret_addr) = frame.ret_addr else {
            return DwarfStep::End;
        };
        // a return address equal to the current pc means the walk stalled
        if ret_addr.is_null() || ret_addr == self.state.pc {
            return DwarfStep::End;
        }

        self.dwarf_regs = frame.registers;
        self.state.pc = ret_addr;
        self.state.sp = frame.cfa;
        if let Ok(fp) = self.dwarf_regs.value(DWARF_FP) {
            self.state.fp = RelocatedAddress::from(fp);
        }
        self.dwarf_regs.flush_into(&mut self.state.regs);
        self.state.sync_regs();
        self.frame_no += 1;
        DwarfStep::Stepped
    }

    /// ABI frame-pointer chain fallback: the two words at FP are the saved
    /// frame pointer and the return address.
    fn fp_step(&mut self) -> Result<StepResult, Error> {
        if self.state.fp.is_null() {
            return Ok(StepResult::EndOfStack);
        }

        let mut frame = [0u8; 2 * mem::size_of::<u64>()];
        if self.proc.read_mem(self.state.fp, &mut frame) != frame.len() {
            return Ok(StepResult::EndOfStack);
        }
        let saved_fp = u64::from_ne_bytes(frame[..8].try_into().expect("slice len is 8"));
        let ret_pc = u64::from_ne_bytes(frame[8..].try_into().expect("slice len is 8"));

        // caller frames live at higher addresses; a null, repeated or
        // descending frame pointer ends the walk
        if saved_fp == 0 || saved_fp <= self.state.fp.as_u64() {
            return Ok(StepResult::EndOfStack);
        }

        self.state.fp = RelocatedAddress::from(saved_fp);
        let mut pc = ret_pc;
        // step back inside the call instruction, except for kernel-inserted
        // signal trampoline frames
        if pc > 0 && !self.proc.is_signal_frame(RelocatedAddress::from(pc)) {
            pc -= 1;
        }
        self.state.pc = RelocatedAddress::from(pc);

        self.state.sync_regs();
        self.dwarf_regs.update(DWARF_FP, saved_fp);
        self.dwarf_regs.update(DWARF_RA, pc);
        self.frame_no += 1;
        Ok(StepResult::Stepped)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tracer::register::{Register, RegisterMap};
    use crate::tracer::testing::scripted_proc;
    use nix::unistd::Pid;

    fn thread(pc: u64, fp: u64) -> ThreadState {
        let mut regs = RegisterMap::default();
        regs.update(Register::Rip, pc);
        regs.update(Register::Rbp, fp);
        ThreadState::new(Pid::from_raw(1), regs)
    }

    fn frame_words(saved_fp: u64, ret_pc: u64) -> Vec<u8> {
        let mut bytes = saved_fp.to_ne_bytes().to_vec();
        bytes.extend_from_slice(&ret_pc.to_ne_bytes());
        bytes
    }

    #[test]
    fn test_fp_fallback_decrements_pc() {
        let mut memory = frame_words(0x7fff40, 0x400cfe);
        // the next frame links to itself, ending the walk
        memory.resize(0x40, 0);
        memory.extend_from_slice(&frame_words(0x7fff40, 0x400dfe));
        let proc = scripted_proc(&[], &[(0x7fff00, memory)]);

        let mut cursor = UnwindCursor::new(&proc, &thread(0x400bfe, 0x7fff00));
        assert_eq!(cursor.step().unwrap(), StepResult::Stepped);
        assert_eq!(cursor.pc(), RelocatedAddress::from(0x400cfdu64));
        assert_eq!(cursor.state().fp, RelocatedAddress::from(0x7fff40u64));
        assert_eq!(cursor.frame_no(), 1);

        assert_eq!(cursor.step().unwrap(), StepResult::EndOfStack);
    }

    #[test]
    fn test_fp_fallback_stops_on_null_frame_pointer() {
        let memory = frame_words(0, 0x400cfe);
        let proc = scripted_proc(&[], &[(0x7fff00, memory)]);

        let mut cursor = UnwindCursor::new(&proc, &thread(0x400bfe, 0x7fff00));
        assert_eq!(cursor.step().unwrap(), StepResult::EndOfStack);
    }

    #[test]
    fn test_unreadable_frame_ends_walk() {
        let proc = scripted_proc(&[], &[]);
        let mut cursor = UnwindCursor::new(&proc, &thread(0x400bfe, 0x7fff00));
        assert_eq!(cursor.step().unwrap(), StepResult::EndOfStack);
    }

    #[test]
    fn test_zero_pc_ends_walk() {
        let proc = scripted_proc(&[], &[]);
        let mut cursor = UnwindCursor::new(&proc, &thread(0, 0x7fff00));
        assert_eq!(cursor.step().unwrap(), StepResult::EndOfStack);
    }

    #[test]
    fn test_walk_terminates_on_cyclic_chains() {
        // two frame records pointing at each other
        let mut memory = vec![];
        memory.extend_from_slice(&frame_words(0x7fff10, 0x400100));
        memory.extend_from_slice(&frame_words(0x7fff00, 0x400200));
        let proc = scripted_proc(&[], &[(0x7fff00, memory)]);

        let mut cursor = UnwindCursor::new(&proc, &thread(0x400bfe, 0x7fff00));
        let mut steps = 0;
        while cursor.step().unwrap() == StepResult::Stepped {
            steps += 1;
            assert!(steps < 1000, "unwind must terminate");
        }
        assert_eq!(steps, 1);
    }
}
