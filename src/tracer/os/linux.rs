use crate::tracer::address::RelocatedAddress;
use crate::tracer::error::Error;
use crate::tracer::os::{MapRegion, OsAdaptor};
use crate::tracer::proc::thread::ThreadState;
use crate::tracer::register::RegisterMap;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use ouroboros::self_referencing;
use std::collections::HashSet;
use std::ffi::c_long;
use std::io::IoSliceMut;
use std::mem;
use std::path::PathBuf;

#[self_referencing]
struct ThreadDbSession {
    lib: thread_db::Lib,
    #[borrows(lib)]
    #[covariant]
    process: thread_db::Process<'this>,
}

/// Linux implementation of the platform seam: ptrace process control,
/// `/proc/<pid>/task` thread enumeration, `/proc/<pid>/maps` mappings and
/// `process_vm_readv` memory access.
pub struct LinuxAdaptor {
    pid: Pid,
    /// Attached to a foreign process (pid 0 selects self-inspection, which
    /// neither stops nor resumes anything).
    remote: bool,
    attached: bool,
    seized_tids: Vec<Pid>,
    thread_db: Option<ThreadDbSession>,
}

impl LinuxAdaptor {
    /// Stop the target and take control of all its threads.
    pub fn attach(pid: Pid) -> Result<Self, Error> {
        if pid.as_raw() == 0 {
            return Ok(Self {
                pid: Pid::this(),
                remote: false,
                attached: false,
                seized_tids: vec![],
                thread_db: None,
            });
        }

        sys::ptrace::attach(pid).map_err(|e| match e {
            Errno::ESRCH => Error::NoProc(pid),
            Errno::EPERM | Errno::EACCES => Error::Perm(pid),
            e => Error::Attach(e),
        })?;
        wait_stop(pid)?;

        let mut adaptor = Self {
            pid,
            remote: true,
            attached: true,
            seized_tids: vec![pid],
            thread_db: None,
        };
        adaptor.seize_remaining_tasks()?;

        // thread library introspection bootstrap; a target without a thread
        // library is tolerated, a broken libthread_db is not
        let lib = thread_db::Lib::try_load()
            .map_err(|e| Error::ThreadDebuggerInit(e.to_string()))?;
        match (ThreadDbSessionTryBuilder {
            lib,
            process_builder: |lib| lib.attach(pid),
        })
        .try_build()
        {
            Ok(session) => adaptor.thread_db = Some(session),
            Err(e) => debug!(target: "tracer", "no thread library in target: {e}"),
        }

        Ok(adaptor)
    }

    /// Attach every task of the target that appeared since the last scan.
    /// Tasks cannot spawn while all known ones are stopped, so the scan
    /// converges.
    fn seize_remaining_tasks(&mut self) -> Result<(), Error> {
        loop {
            let known: HashSet<Pid> = self.seized_tids.iter().copied().collect();
            let mut new_tids = vec![];
            for tid in task_tids(self.pid)? {
                if !known.contains(&tid) {
                    new_tids.push(tid);
                }
            }
            if new_tids.is_empty() {
                return Ok(());
            }

            for tid in new_tids {
                match sys::ptrace::attach(tid) {
                    Ok(()) => {
                        wait_stop(tid)?;
                        self.seized_tids.push(tid);
                    }
                    // task exited between scan and attach
                    Err(Errno::ESRCH) => continue,
                    Err(e) => return Err(Error::Attach(e)),
                }
            }
        }
    }
}

impl OsAdaptor for LinuxAdaptor {
    fn threads(&mut self) -> Result<Vec<ThreadState>, Error> {
        if !self.remote {
            // own registers are meaningless to a post-mortem walk
            return Ok(vec![]);
        }

        let mut threads = Vec::with_capacity(self.seized_tids.len());
        for &tid in &self.seized_tids {
            match RegisterMap::current(tid) {
                Ok(regs) => threads.push(ThreadState::new(tid, regs)),
                Err(Errno::ESRCH) => warn!(target: "tracer", "thread {tid} gone, skipped"),
                Err(e) => return Err(Error::Ptrace(e)),
            }
        }
        Ok(threads)
    }

    fn memory_regions(&mut self) -> Result<Vec<MapRegion>, Error> {
        let maps = proc_maps::get_process_maps(self.pid.as_raw())?;
        Ok(maps
            .into_iter()
            .filter(|map| {
                map.filename()
                    .map(|name| name.is_absolute())
                    .unwrap_or(false)
            })
            .map(|map| MapRegion {
                name: map.filename().map(PathBuf::from),
                base: RelocatedAddress::from(map.start()),
                len: map.size() as u64,
                file_offset: map.offset as u64,
            })
            .collect())
    }

    fn read_mem(&self, addr: RelocatedAddress, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }

        let remote = RemoteIoVec {
            base: addr.as_usize(),
            len: buf.len(),
        };
        match process_vm_readv(self.pid, &mut [IoSliceMut::new(buf)], &[remote]) {
            Ok(read) => read,
            // fall back to word-wise peeks, partial ranges are still useful
            Err(_) => {
                let mut read = 0;
                while read < buf.len() {
                    let word_addr = (addr.as_usize() + read) as sys::ptrace::AddressType;
                    let Ok(word) = sys::ptrace::read(self.pid, word_addr) else {
                        break;
                    };
                    let bytes = (word as c_long).to_ne_bytes();
                    let n = usize::min(buf.len() - read, mem::size_of::<c_long>());
                    buf[read..read + n].copy_from_slice(&bytes[..n]);
                    read += n;
                }
                read
            }
        }
    }

    fn detach(&mut self) -> Result<(), Error> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;
        self.thread_db = None;

        for &tid in self.seized_tids.iter().rev() {
            match sys::ptrace::detach(tid, None) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(Error::Ptrace(e)),
            }
        }
        Ok(())
    }
}

impl Drop for LinuxAdaptor {
    fn drop(&mut self) {
        if self.remote {
            if let Err(e) = self.detach() {
                warn!(target: "tracer", "detach on drop: {e:#}");
            }
        }
    }
}

fn wait_stop(tid: Pid) -> Result<(), Error> {
    loop {
        // __WALL also reaps stop notifications of non-leader tasks
        match waitpid(tid, Some(WaitPidFlag::__WALL)) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::Waitpid(e)),
        }
    }
}

fn task_tids(pid: Pid) -> Result<Vec<Pid>, Error> {
    let mut tids = vec![];
    for entry in std::fs::read_dir(format!("/proc/{pid}/task"))? {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            tids.push(Pid::from_raw(tid));
        }
    }
    tids.sort_unstable();
    Ok(tids)
}
