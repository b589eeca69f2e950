//! Scripted platform adaptor for unit tests: fixed thread snapshots, fixed
//! mappings and an address-keyed fake memory image.

use crate::tracer::address::RelocatedAddress;
use crate::tracer::error::Error;
use crate::tracer::os::{MapRegion, OsAdaptor};
use crate::tracer::proc::thread::ThreadState;
use crate::tracer::proc::Proc;
use nix::unistd::Pid;
use std::path::PathBuf;

pub(crate) struct ScriptedOs {
    pub threads: Vec<ThreadState>,
    pub regions: Vec<MapRegion>,
    pub memory: Vec<(u64, Vec<u8>)>,
}

impl OsAdaptor for ScriptedOs {
    fn threads(&mut self) -> Result<Vec<ThreadState>, Error> {
        Ok(self.threads.clone())
    }

    fn memory_regions(&mut self) -> Result<Vec<MapRegion>, Error> {
        Ok(self.regions.clone())
    }

    fn read_mem(&self, addr: RelocatedAddress, buf: &mut [u8]) -> usize {
        let addr = addr.as_u64();
        for (start, bytes) in &self.memory {
            let end = start + bytes.len() as u64;
            if addr >= *start && addr < end {
                let offset = (addr - start) as usize;
                let n = usize::min(buf.len(), bytes.len() - offset);
                buf[..n].copy_from_slice(&bytes[offset..offset + n]);
                return n;
            }
        }
        0
    }

    fn detach(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

pub(crate) fn scripted_proc(regions: &[(&str, u64, u64)], memory: &[(u64, Vec<u8>)]) -> Proc {
    let os = ScriptedOs {
        threads: vec![],
        regions: regions
            .iter()
            .map(|&(name, base, len)| MapRegion {
                name: Some(PathBuf::from(name)),
                base: RelocatedAddress::from(base),
                len,
                file_offset: 0,
            })
            .collect(),
        memory: memory.to_vec(),
    };
    Proc::with_adaptor(Pid::from_raw(1), Box::new(os)).expect("scripted adaptor is infallible")
}
