//! The stable analysis surface: the C ABI tables handed to loaded modules
//! and the safe operations backing them. Extern shims reach the current
//! trace session through a rebindable thread-local slot, keeping exactly one
//! top-level binding per tracer invocation.

use crate::tracer::address::RelocatedAddress;
use crate::tracer::error::Error;
use crate::tracer::proc::thread::ThreadState;
use crate::tracer::proc::Proc;
use crate::tracer::symbolic::Symbolicator;
use crate::tracer::unwind::UnwindCursor;
use crate::tracer::variable;
use nix::libc;
use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::rc::Rc;

pub const GIMLI_ANA_API_VERSION: c_int = 2;
pub const GIMLI_ANA_SUPPRESS: c_int = 0;
pub const GIMLI_ANA_CONTINUE: c_int = 1;

/// Wire-level error classes reported to analysis modules.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GimliErr {
    Ok = 0,
    BadAddr,
    NoProc,
    Oom,
    Perm,
    CheckErrno,
    Timeout,
    ThreadDebuggerInitFailed,
}

/// Classify an internal error for the wire. Nothing in the single-shot
/// blocking model produces `Timeout`; the code exists for modules compiled
/// against the full enum.
pub fn err_code(e: &Error) -> GimliErr {
    match e {
        Error::BadAddr(_) => GimliErr::BadAddr,
        Error::NoProc(_) => GimliErr::NoProc,
        Error::Perm(_) => GimliErr::Perm,
        Error::ThreadDebuggerInit(_) => GimliErr::ThreadDebuggerInitFailed,
        _ => GimliErr::CheckErrno,
    }
}

#[repr(C)]
pub struct GimliSymbolRaw {
    /// demangled symbol name
    pub name: *mut c_char,
    /// raw, un-mangled symbol name
    pub rawname: *mut c_char,
    /// resolved address in the target process
    pub addr: *mut c_void,
    pub size: u32,
}

#[repr(C)]
pub struct GimliProcStat {
    pub pid: c_int,
    pub pr_size: usize,
    pub pr_rssize: usize,
}

#[repr(C)]
pub struct GimliAnaApi {
    pub api_version: c_int,
    pub sym_lookup:
        unsafe extern "C" fn(obj: *const c_char, name: *const c_char) -> *mut GimliSymbolRaw,
    pub sym_name:
        unsafe extern "C" fn(addr: *mut c_void, buf: *mut c_char, buflen: c_int) -> *const c_char,
    pub read_mem: unsafe extern "C" fn(src: *mut c_void, dest: *mut c_void, len: c_int) -> c_int,
    pub read_string: unsafe extern "C" fn(src: *mut c_void) -> *mut c_char,
    pub get_source_info: unsafe extern "C" fn(
        addr: *mut c_void,
        buf: *mut c_char,
        buflen: c_int,
        lineno: *mut c_int,
    ) -> c_int,
    pub get_parameter: unsafe extern "C" fn(
        context: *mut c_void,
        varname: *const c_char,
        datatype: *mut *const c_char,
        addr: *mut *mut c_void,
        size: *mut u64,
    ) -> c_int,
    pub get_string_symbol:
        unsafe extern "C" fn(obj: *const c_char, name: *const c_char) -> *mut c_char,
    pub copy_from_symbol: unsafe extern "C" fn(
        obj: *const c_char,
        name: *const c_char,
        deref: c_int,
        buf: *mut c_void,
        size: u32,
    ) -> c_int,
    pub get_proc_status: unsafe extern "C" fn() -> *const GimliProcStat,
}

#[repr(C)]
pub struct GimliAnaModule {
    pub api_version: c_int,
    pub perform_trace:
        Option<unsafe extern "C" fn(api: *const GimliAnaApi, object: *const c_char)>,
    pub on_begin_thread_trace: Option<
        unsafe extern "C" fn(
            api: *const GimliAnaApi,
            object: *const c_char,
            tid: c_int,
            nframes: c_int,
            pcaddrs: *mut *mut c_void,
            contexts: *mut *mut c_void,
        ) -> c_int,
    >,
    pub before_print_frame: Option<
        unsafe extern "C" fn(
            api: *const GimliAnaApi,
            object: *const c_char,
            tid: c_int,
            frameno: c_int,
            pcaddr: *mut c_void,
            context: *mut c_void,
        ) -> c_int,
    >,
    pub before_print_frame_var: Option<
        unsafe extern "C" fn(
            api: *const GimliAnaApi,
            object: *const c_char,
            tid: c_int,
            frameno: c_int,
            pcaddr: *mut c_void,
            context: *mut c_void,
            datatype: *const c_char,
            varname: *const c_char,
            varaddr: *mut c_void,
            varsize: u64,
        ) -> c_int,
    >,
    pub after_print_frame_var: Option<
        unsafe extern "C" fn(
            api: *const GimliAnaApi,
            object: *const c_char,
            tid: c_int,
            frameno: c_int,
            pcaddr: *mut c_void,
            context: *mut c_void,
            datatype: *const c_char,
            varname: *const c_char,
            varaddr: *mut c_void,
            varsize: u64,
        ),
    >,
    pub after_print_frame: Option<
        unsafe extern "C" fn(
            api: *const GimliAnaApi,
            object: *const c_char,
            tid: c_int,
            frameno: c_int,
            pcaddr: *mut c_void,
            context: *mut c_void,
        ),
    >,
    pub on_end_thread_trace: Option<
        unsafe extern "C" fn(
            api: *const GimliAnaApi,
            object: *const c_char,
            tid: c_int,
            nframes: c_int,
            pcaddrs: *mut *mut c_void,
            contexts: *mut *mut c_void,
        ),
    >,
}

pub type GimliModuleInitFn =
    unsafe extern "C" fn(api: *const GimliAnaApi) -> *mut GimliAnaModule;
pub type GimliRawInitFn = unsafe extern "C" fn(requested_version: c_int) -> c_int;

/// State a module callback can interrogate about one frame.
pub struct FrameContext {
    pub state: ThreadState,
    pub frame_no: u32,
}

/// Everything the extern shims need while a trace is being emitted.
pub struct TraceSession {
    pub proc: Rc<Proc>,
}

thread_local! {
    static SESSION: RefCell<Option<Rc<TraceSession>>> = const { RefCell::new(None) };
    static PROC_STAT: RefCell<GimliProcStat> = const {
        RefCell::new(GimliProcStat { pid: 0, pr_size: 0, pr_rssize: 0 })
    };
}

pub fn bind_session(session: Rc<TraceSession>) {
    SESSION.with(|slot| *slot.borrow_mut() = Some(session));
}

pub fn unbind_session() {
    SESSION.with(|slot| *slot.borrow_mut() = None);
}

fn with_session<R>(f: impl FnOnce(&TraceSession) -> R) -> Option<R> {
    SESSION.with(|slot| slot.borrow().as_ref().map(|session| f(session)))
}

/// The function table handed to every loaded module.
pub static ANA_API: GimliAnaApi = GimliAnaApi {
    api_version: GIMLI_ANA_API_VERSION,
    sym_lookup: shim_sym_lookup,
    sym_name: shim_sym_name,
    read_mem: shim_read_mem,
    read_string: shim_read_string,
    get_source_info: shim_get_source_info,
    get_parameter: shim_get_parameter,
    get_string_symbol: shim_get_string_symbol,
    copy_from_symbol: shim_copy_from_symbol,
    get_proc_status: shim_get_proc_status,
};

// ---------------------------------- safe operations ----------------------------------

/// Lookup a symbol, treat its value as a `char *` in the target and return
/// the string it points to.
pub fn get_string_symbol(proc: &Proc, object: Option<&str>, name: &str) -> Option<String> {
    let sym = Symbolicator::new(proc).sym_lookup(object, name)?;
    let ptr = proc.read_ptr(sym.relocated_addr()).ok()?;
    if ptr == 0 {
        return None;
    }
    Some(proc.read_string(RelocatedAddress::from(ptr)))
}

/// Lookup a symbol and copy its target into `buf`, following `deref` levels
/// of pointer indirection first. Fails when any read is short.
pub fn copy_from_symbol(
    proc: &Proc,
    object: Option<&str>,
    name: &str,
    deref: u32,
    buf: &mut [u8],
) -> bool {
    let Some(sym) = Symbolicator::new(proc).sym_lookup(object, name) else {
        return false;
    };

    let mut addr = sym.relocated_addr();
    for _ in 0..deref {
        match proc.read_ptr(addr) {
            Ok(next) => addr = RelocatedAddress::from(next),
            Err(_) => return false,
        }
    }
    proc.read_exact(addr, buf).is_ok()
}

// ---------------------------------- extern shims ----------------------------------

/// Copy a string into memory the module may `free(3)`.
fn malloc_cstring(s: &str) -> *mut c_char {
    let bytes = s.as_bytes();
    unsafe {
        let ptr = libc::malloc(bytes.len() + 1) as *mut u8;
        if ptr.is_null() {
            return std::ptr::null_mut();
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        *ptr.add(bytes.len()) = 0;
        ptr as *mut c_char
    }
}

unsafe fn opt_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

unsafe extern "C" fn shim_sym_lookup(
    obj: *const c_char,
    name: *const c_char,
) -> *mut GimliSymbolRaw {
    let object = opt_str(obj);
    let Some(name) = opt_str(name) else {
        return std::ptr::null_mut();
    };

    with_session(|session| {
        let hit = Symbolicator::new(&session.proc).sym_lookup(object.as_deref(), &name)?;
        // module-owned view of the symbol; the tracer is short lived, the
        // allocation is not reclaimed
        let raw = Box::new(GimliSymbolRaw {
            name: malloc_cstring(hit.symbol.name()),
            rawname: malloc_cstring(&hit.symbol.raw_name),
            addr: hit.relocated_addr().as_u64() as *mut c_void,
            size: hit.symbol.size as u32,
        });
        Some(Box::into_raw(raw))
    })
    .flatten()
    .unwrap_or(std::ptr::null_mut())
}

unsafe extern "C" fn shim_sym_name(
    addr: *mut c_void,
    buf: *mut c_char,
    buflen: c_int,
) -> *const c_char {
    if buf.is_null() || buflen <= 0 {
        return buf;
    }

    let label = with_session(|session| {
        Symbolicator::new(&session.proc).pc_sym_name(RelocatedAddress::from(addr as u64))
    })
    .unwrap_or_default();

    let bytes = label.as_bytes();
    let n = usize::min(bytes.len(), buflen as usize - 1);
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf as *mut u8, n);
    *buf.add(n) = 0;
    buf
}

unsafe extern "C" fn shim_read_mem(src: *mut c_void, dest: *mut c_void, len: c_int) -> c_int {
    if dest.is_null() || len <= 0 {
        return 0;
    }
    let buf = std::slice::from_raw_parts_mut(dest as *mut u8, len as usize);
    with_session(|session| session.proc.read_mem(RelocatedAddress::from(src as u64), buf))
        .unwrap_or(0) as c_int
}

unsafe extern "C" fn shim_read_string(src: *mut c_void) -> *mut c_char {
    with_session(|session| {
        let s = session.proc.read_string(RelocatedAddress::from(src as u64));
        malloc_cstring(&s)
    })
    .unwrap_or(std::ptr::null_mut())
}

unsafe extern "C" fn shim_get_source_info(
    addr: *mut c_void,
    buf: *mut c_char,
    buflen: c_int,
    lineno: *mut c_int,
) -> c_int {
    if buf.is_null() || buflen <= 0 || lineno.is_null() {
        return 0;
    }

    let place = with_session(|session| {
        let addr = RelocatedAddress::from(addr as u64);
        let mapping = session.proc.mapping_for_addr(addr)?;
        let di = mapping.object.debug_info()?;
        di.find_place_from_pc(mapping.object.to_global(addr))
    })
    .flatten();

    match place {
        Some(place) => {
            let file = place.file.to_string_lossy();
            let bytes = file.as_bytes();
            let n = usize::min(bytes.len(), buflen as usize - 1);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf as *mut u8, n);
            *buf.add(n) = 0;
            *lineno = place.line as c_int;
            1
        }
        None => 0,
    }
}

unsafe extern "C" fn shim_get_parameter(
    context: *mut c_void,
    varname: *const c_char,
    datatype: *mut *const c_char,
    addr: *mut *mut c_void,
    size: *mut u64,
) -> c_int {
    if context.is_null() || datatype.is_null() || addr.is_null() || size.is_null() {
        return 0;
    }
    let Some(name) = opt_str(varname) else {
        return 0;
    };
    let frame = &*(context as *const FrameContext);

    let resolved = with_session(|session| {
        let cursor = UnwindCursor::new(&session.proc, &frame.state);
        let (object, type_id, var_addr) =
            variable::resolve_parameter(&session.proc, &cursor, &name)?;
        let (declname, type_size) =
            object.with_types(|types| (types.declname(type_id), types.size(type_id)));
        Some((declname, var_addr, type_size))
    })
    .flatten();

    match resolved {
        Some((declname, var_addr, type_size)) => {
            *datatype = malloc_cstring(&declname);
            *addr = var_addr.as_u64() as *mut c_void;
            *size = type_size;
            1
        }
        None => 0,
    }
}

unsafe extern "C" fn shim_get_string_symbol(
    obj: *const c_char,
    name: *const c_char,
) -> *mut c_char {
    let object = opt_str(obj);
    let Some(name) = opt_str(name) else {
        return std::ptr::null_mut();
    };

    with_session(|session| {
        get_string_symbol(&session.proc, object.as_deref(), &name)
            .map(|s| malloc_cstring(&s))
    })
    .flatten()
    .unwrap_or(std::ptr::null_mut())
}

unsafe extern "C" fn shim_copy_from_symbol(
    obj: *const c_char,
    name: *const c_char,
    deref: c_int,
    buf: *mut c_void,
    size: u32,
) -> c_int {
    if buf.is_null() || size == 0 {
        return 0;
    }
    let object = opt_str(obj);
    let Some(name) = opt_str(name) else {
        return 0;
    };
    let out = std::slice::from_raw_parts_mut(buf as *mut u8, size as usize);

    let ok = with_session(|session| {
        copy_from_symbol(
            &session.proc,
            object.as_deref(),
            &name,
            deref.max(0) as u32,
            out,
        )
    })
    .unwrap_or(false);
    ok as c_int
}

unsafe extern "C" fn shim_get_proc_status() -> *const GimliProcStat {
    let stat = with_session(|session| session.proc.status()).unwrap_or_default();
    PROC_STAT.with(|slot| {
        *slot.borrow_mut() = GimliProcStat {
            pid: stat.pid,
            pr_size: stat.virtual_size as usize,
            pr_rssize: stat.rss as usize,
        };
        slot.as_ptr() as *const GimliProcStat
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tracer::address::GlobalAddress;
    use crate::tracer::testing::scripted_proc;

    fn proc_with_symbol(addr: u64) -> Proc {
        let proc = scripted_proc(
            &[("./wedgie", 0x400000, 0x10000)],
            &[
                // symbol cell holds a pointer to 0x2000
                (addr, 0x2000u64.to_ne_bytes().to_vec()),
                (0x2000, b"forty-two\0".to_vec()),
                (0x3000, 0x2000u64.to_ne_bytes().to_vec()),
            ],
        );
        let object = proc.find_object(Some("./wedgie")).unwrap();
        object.push_symbol("answer", GlobalAddress::from(addr), 8);
        object.push_symbol("answer_ptr", GlobalAddress::from(0x3000u64), 8);
        proc
    }

    #[test]
    fn test_get_string_symbol_dereferences_once() {
        let proc = proc_with_symbol(0x1000);
        assert_eq!(
            get_string_symbol(&proc, None, "answer").as_deref(),
            Some("forty-two")
        );
        assert_eq!(get_string_symbol(&proc, None, "missing"), None);
    }

    #[test]
    fn test_copy_from_symbol_plain() {
        let proc = proc_with_symbol(0x1000);
        let mut buf = [0u8; 8];
        assert!(copy_from_symbol(&proc, None, "answer", 0, &mut buf));
        assert_eq!(u64::from_ne_bytes(buf), 0x2000);
    }

    #[test]
    fn test_copy_from_symbol_deref_chain() {
        let proc = proc_with_symbol(0x1000);
        // answer_ptr -> 0x2000 -> "forty-two"
        let mut buf = [0u8; 5];
        assert!(copy_from_symbol(&proc, None, "answer_ptr", 1, &mut buf));
        assert_eq!(&buf, b"forty");
    }

    #[test]
    fn test_copy_from_symbol_short_read_fails() {
        let proc = proc_with_symbol(0x1000);
        let mut buf = [0u8; 64];
        // the string block ends before 64 bytes
        assert!(!copy_from_symbol(&proc, None, "answer_ptr", 1, &mut buf));
    }
}
