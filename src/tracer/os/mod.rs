pub mod linux;

use crate::tracer::address::RelocatedAddress;
use crate::tracer::error::Error;
use crate::tracer::proc::thread::ThreadState;
use std::path::PathBuf;

/// Shared library suffix appended to analysis module base names.
#[cfg(target_os = "macos")]
pub const MODULE_SUFFIX: &str = ".dylib";
#[cfg(not(target_os = "macos"))]
pub const MODULE_SUFFIX: &str = ".so";

/// Program counter value the kernel leaves in a signal trampoline frame.
pub const SIGNAL_FRAME_SENTINEL: u64 = u64::MAX;

/// One row of the target memory map as reported by the OS.
#[derive(Debug, Clone)]
pub struct MapRegion {
    pub name: Option<PathBuf>,
    pub base: RelocatedAddress,
    pub len: u64,
    pub file_offset: u64,
}

/// Platform seam for target process control.
///
/// An adaptor is constructed attached: its constructor stops the target,
/// after which threads, registers, mappings and memory are readable until
/// [`OsAdaptor::detach`] resumes the target. One implementation per
/// supported OS, selected at build time.
pub trait OsAdaptor {
    /// Enumerate stopped threads with populated register sets.
    /// A single-threaded target yields one entry whose lwp equals the pid.
    fn threads(&mut self) -> Result<Vec<ThreadState>, Error>;

    /// Enumerate target memory mappings.
    fn memory_regions(&mut self) -> Result<Vec<MapRegion>, Error>;

    /// Best-effort target memory read: returns the number of bytes read,
    /// which may be less than requested, or zero. Never blocks indefinitely.
    fn read_mem(&self, addr: RelocatedAddress, buf: &mut [u8]) -> usize;

    /// Resume all threads and release OS state. Idempotent.
    fn detach(&mut self) -> Result<(), Error>;

    /// True when the pc is the sentinel of a kernel-inserted signal
    /// trampoline frame.
    fn is_signal_frame(&self, pc: RelocatedAddress) -> bool {
        pc.as_u64() == SIGNAL_FRAME_SENTINEL
    }
}
