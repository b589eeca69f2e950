//! Delegation to libunwind for targets whose own unwind tables and frame
//! pointers are both unusable. Only instruction addresses come out of this
//! path; frame register context stays with the native cursor.

use crate::tracer::address::RelocatedAddress;
use crate::tracer::error::Error;
use nix::unistd::Pid;
use unwind::{Accessors, AddressSpace, Byteorder, Cursor, PTraceState, RegNum};

/// Collect the instruction addresses of every frame of a stopped thread.
pub fn backtrace(pid: Pid) -> Result<Vec<RelocatedAddress>, Error> {
    let state = PTraceState::new(pid.as_raw() as u32)?;
    let address_space = AddressSpace::new(Accessors::ptrace(), Byteorder::DEFAULT)?;
    let mut cursor = Cursor::remote(&address_space, &state)?;

    let mut ips = vec![];
    loop {
        let ip = cursor.register(RegNum::IP)?;
        ips.push(RelocatedAddress::from(ip));

        if !cursor.step()? {
            break;
        }
    }
    Ok(ips)
}
