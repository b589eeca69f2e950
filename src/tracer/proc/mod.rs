pub mod mappings;
pub mod registry;
pub mod thread;

use crate::tracer::address::RelocatedAddress;
use crate::tracer::error::Error;
use crate::tracer::os::linux::LinuxAdaptor;
use crate::tracer::os::{MapRegion, OsAdaptor};
use crate::tracer::obj::MappedObject;
use crate::tracer::proc::mappings::{MappingEntry, MappingIndex};
use crate::tracer::proc::registry::ObjectRegistry;
use crate::tracer::proc::thread::ThreadState;
use crate::weak_error;
use log::debug;
use nix::unistd::Pid;
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

/// Basic resource usage of the target, exposed to analysis modules.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcStat {
    pub pid: i32,
    pub virtual_size: u64,
    pub rss: u64,
}

/// Handle to a stopped target process.
///
/// Owns the platform adaptor, the object registry, the mapping index and the
/// thread snapshot taken at attach time. Dropping the handle releases the OS
/// state, which resumes a remotely attached target.
pub struct Proc {
    pid: Pid,
    os: RefCell<Box<dyn OsAdaptor>>,
    objects: RefCell<ObjectRegistry>,
    mappings: RefCell<MappingIndex>,
    threads: Vec<ThreadState>,
}

impl Proc {
    /// Attach to a process and snapshot its threads and memory map.
    /// A pid of 0 selects self-inspection.
    pub fn attach(pid: Pid) -> Result<Self, Error> {
        let adaptor = LinuxAdaptor::attach(pid)?;
        Self::with_adaptor(pid, Box::new(adaptor))
    }

    /// Build a handle over an already attached adaptor.
    pub fn with_adaptor(pid: Pid, mut os: Box<dyn OsAdaptor>) -> Result<Self, Error> {
        let threads = os.threads()?;
        let regions = os.memory_regions()?;

        let proc = Self {
            pid,
            os: RefCell::new(os),
            objects: RefCell::new(ObjectRegistry::default()),
            mappings: RefCell::new(MappingIndex::default()),
            threads,
        };

        for MapRegion {
            name,
            base,
            len,
            file_offset,
        } in regions
        {
            let Some(name) = name else { continue };
            proc.add_mapping(&name.to_string_lossy(), base, len, file_offset);
        }

        Ok(proc)
    }

    /// Target pid; 0 when inspecting ourselves.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn threads(&self) -> &[ThreadState] {
        &self.threads
    }

    /// Register one memory mapping, creating its object on first sight.
    pub fn add_mapping(&self, name: &str, base: RelocatedAddress, len: u64, file_offset: u64) {
        debug!(target: "tracer",
            "MAP: {base} - {:#018x} [off={file_offset:#x}] {name}",
            base.as_u64() + len);

        let object = self.objects.borrow_mut().get_or_create(name, base);
        self.mappings.borrow_mut().insert(MappingEntry {
            base,
            len,
            file_offset,
            object,
        });
    }

    /// The mapping whose range contains `addr`, if any.
    pub fn mapping_for_addr(&self, addr: RelocatedAddress) -> Option<MappingEntry> {
        self.mappings.borrow_mut().find(addr).cloned()
    }

    /// Lookup a mapped object by name; `None` returns the main executable.
    pub fn find_object(&self, name: Option<&str>) -> Option<Rc<MappedObject>> {
        self.objects.borrow().find(name)
    }

    pub fn with_objects<R>(&self, f: impl FnOnce(&ObjectRegistry) -> R) -> R {
        f(&self.objects.borrow())
    }

    pub(super) fn intern_object_alias(&self, alias: &str, object: Rc<MappedObject>) {
        self.objects.borrow_mut().intern_alias(alias, object);
    }

    /// Best-effort read of target memory; returns the number of bytes read.
    pub fn read_mem(&self, addr: RelocatedAddress, buf: &mut [u8]) -> usize {
        self.os.borrow().read_mem(addr, buf)
    }

    /// Read exactly `buf.len()` bytes or fail with the faulting address.
    pub fn read_exact(&self, addr: RelocatedAddress, buf: &mut [u8]) -> Result<(), Error> {
        if self.read_mem(addr, buf) != buf.len() {
            return Err(Error::BadAddr(addr));
        }
        Ok(())
    }

    /// Read one pointer-sized word.
    pub fn read_ptr(&self, addr: RelocatedAddress) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read_exact(addr, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    /// Read a NUL terminated string from the target.
    ///
    /// A short read before any NUL terminates the scan; whatever bytes
    /// accumulated up to that point are returned.
    pub fn read_string(&self, addr: RelocatedAddress) -> String {
        const CHUNK: usize = 256;

        let mut accumulated = vec![];
        let mut pos = addr;
        loop {
            let mut buf = [0u8; CHUNK];
            let read = self.read_mem(pos, &mut buf);
            if let Some(nul) = buf[..read].iter().position(|&b| b == 0) {
                accumulated.extend_from_slice(&buf[..nul]);
                break;
            }
            accumulated.extend_from_slice(&buf[..read]);
            if read < CHUNK {
                break;
            }
            pos = pos.offset(CHUNK as i64);
        }

        String::from_utf8_lossy(&accumulated).into_owned()
    }

    pub fn is_signal_frame(&self, pc: RelocatedAddress) -> bool {
        self.os.borrow().is_signal_frame(pc)
    }

    /// Resource usage of the target for the analysis API.
    pub fn status(&self) -> ProcStat {
        let pid = sysinfo::Pid::from_u32(self.pid.as_raw() as u32);
        let mut system = sysinfo::System::new();
        system.refresh_process(pid);
        let (virtual_size, rss) = system
            .process(pid)
            .map(|p| (p.virtual_memory(), p.memory()))
            .unwrap_or_default();

        ProcStat {
            pid: self.pid.as_raw(),
            virtual_size,
            rss,
        }
    }

    /// Write the coalesced memory map report.
    pub fn show_memory_map(&self, out: &mut dyn Write) -> io::Result<()> {
        self.mappings.borrow_mut().dump(out)
    }

    /// Resume the target. Also performed when the handle is dropped.
    pub fn detach(&self) {
        weak_error!(self.os.borrow_mut().detach());
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        self.detach();
    }
}
