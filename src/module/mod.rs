//! Analysis module host: discovery of per-executable tracer modules, shared
//! library loading, version negotiation and hook registration.

pub mod api;
pub mod hooks;

use crate::module::api::{
    GimliAnaModule, GimliModuleInitFn, GimliRawInitFn, ANA_API, GIMLI_ANA_API_VERSION,
    GIMLI_ANA_SUPPRESS,
};
use crate::module::hooks::{
    FrameEvent, HookOutcome, HookRegistry, TraceEvent, HOOK_AFTER_FRAME, HOOK_AFTER_VAR,
    HOOK_BEFORE_FRAME, HOOK_BEGIN_THREAD, HOOK_END_THREAD, HOOK_TRACER, HOOK_VAR_PRINTER,
};
use crate::tracer::error::Error;
use crate::tracer::obj::MappedObject;
use crate::tracer::os::MODULE_SUFFIX;
use crate::tracer::proc::Proc;
use crate::tracer::symbolic::Symbolicator;
use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::ffi::{c_int, CString};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Section listing tracer module base-names, NUL separated.
pub const TRACE_SECTION_NAME: &str = "gimli_trace";
/// Target symbol naming a tracer module explicitly.
pub const MODULE_NAME_SYMBOL: &str = "gimli_tracer_module_name";

/// A successfully negotiated analysis module.
pub struct LoadedModule {
    pub path: PathBuf,
    pub exename: String,
    pub api_version: c_int,
}

/// Loads and keeps alive the analysis modules of every mapped object, and
/// owns the hook registry their callbacks are dispatched through.
#[derive(Default)]
pub struct ModuleHost {
    /// resolved paths already attempted, each library is opened at most once
    loaded: HashSet<PathBuf>,
    libs: Vec<libloading::Library>,
    pub modules: Vec<LoadedModule>,
    pub hooks: HookRegistry,
}

impl ModuleHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt module discovery for every mapped object.
    pub fn discover(&mut self, proc: &Proc) {
        for object in proc.with_objects(|registry| registry.distinct()) {
            self.discover_for_object(proc, &object);
        }
    }

    fn discover_for_object(&mut self, proc: &Proc, object: &Rc<MappedObject>) {
        // 1. names listed in the objects trace section
        if let Some(section) = object.section(TRACE_SECTION_NAME) {
            for name in parse_trace_section(&section.data) {
                debug!(target: "tracer",
                    "[ {} requests tracing via {name} ]", object.name());
                self.load_named(object.name(), &name, true);
            }
        }

        // 2. a module name published as a target symbol
        if object.has_symbols() {
            if let Some(sym) =
                Symbolicator::new(proc).sym_lookup(Some(object.name()), MODULE_NAME_SYMBOL)
            {
                let name = proc.read_string(sym.relocated_addr());
                if !name.is_empty() {
                    debug!(target: "tracer",
                        "[ {} requests tracing via {name} ]", object.name());
                    self.load_named(object.name(), &name, true);
                }
            }
        }

        // 3. conventional fallback
        let base = Path::new(object.name())
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !base.is_empty() {
            self.load_named(object.name(), &format!("gimli_{base}"), false);
        }
    }

    /// Resolve a module base-name against the object's directory and load it
    /// if the file exists. Explicitly requested modules produce a diagnostic
    /// when missing.
    fn load_named(&mut self, exename: &str, name: &str, explicit_ask: bool) {
        let path = module_candidate_path(exename, name);
        debug!(target: "tracer",
            "[ {exename}: resolved module tracer name to {} ]", path.display());

        if !path.exists() {
            if explicit_ask {
                warn!(target: "tracer",
                    "NOTE: module {exename} declared that its tracing should be performed \
                     by {}, but that module was not found", path.display());
            }
            return;
        }
        self.load_module(exename, &path);
    }

    /// Open a module with eager global binding and negotiate its API
    /// version. Load failures and unsupported versions are diagnosed, never
    /// fatal.
    pub fn load_module(&mut self, exename: &str, path: &Path) {
        let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if !self.loaded.insert(resolved) {
            return;
        }

        let lib = match unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL) } {
            Ok(lib) => libloading::Library::from(lib),
            Err(e) => {
                let e = Error::ModuleLoad(path.to_path_buf(), e);
                warn!(target: "tracer", "{e:#}");
                return;
            }
        };
        info!(target: "tracer", "loaded tracer module {} for {exename}", path.display());

        unsafe {
            if let Ok(modinit) = lib.get::<GimliRawInitFn>(b"gimli_module_init\0") {
                modinit(GIMLI_ANA_API_VERSION);
            }

            if let Ok(init) = lib.get::<GimliModuleInitFn>(b"gimli_ana_init\0") {
                let module = init(&ANA_API);
                if !module.is_null() {
                    let version = (*module).api_version;
                    if version > GIMLI_ANA_API_VERSION {
                        warn!(target: "tracer",
                            "module {} reports api version {version}, only <= {} is \
                             supported, module ignored",
                            path.display(), GIMLI_ANA_API_VERSION);
                    } else {
                        self.register_module(exename, path, module, version.max(1));
                    }
                }
            }
        }

        self.libs.push(lib);
    }

    fn register_module(
        &mut self,
        exename: &str,
        path: &Path,
        module: *mut GimliAnaModule,
        api_version: c_int,
    ) {
        let vtable = unsafe { &*module };
        let exe = CString::new(exename).unwrap_or_default();

        if let Some(perform_trace) = vtable.perform_trace {
            let exe = exe.clone();
            self.hooks.register(
                HOOK_TRACER,
                Box::new(move |_| {
                    unsafe { perform_trace(&ANA_API, exe.as_ptr()) };
                    HookOutcome::Continue
                }),
            );
        }

        // version 1 tables end after perform_trace; version 2 adds the
        // per-thread, per-frame and per-variable callbacks
        if api_version >= 2 {
            if let Some(callback) = vtable.before_print_frame_var {
                let exe = exe.clone();
                self.hooks.register(
                    HOOK_VAR_PRINTER,
                    Box::new(move |event| {
                        let TraceEvent::BeforeVar {
                            frame,
                            datatype,
                            varname,
                            varaddr,
                            varsize,
                        } = event
                        else {
                            return HookOutcome::Continue;
                        };
                        let datatype = CString::new(*datatype).unwrap_or_default();
                        let varname = CString::new(*varname).unwrap_or_default();
                        let status = unsafe {
                            callback(
                                &ANA_API,
                                exe.as_ptr(),
                                frame.tid,
                                frame.frameno,
                                frame.pc.as_u64() as *mut _,
                                frame.context,
                                datatype.as_ptr(),
                                varname.as_ptr(),
                                *varaddr as *mut _,
                                *varsize,
                            )
                        };
                        suppress_to_outcome(status)
                    }),
                );
            }

            if let Some(callback) = vtable.on_begin_thread_trace {
                let exe = exe.clone();
                self.hooks.register(
                    HOOK_BEGIN_THREAD,
                    Box::new(move |event| {
                        let TraceEvent::BeginThread { tid, pcs, contexts } = event else {
                            return HookOutcome::Continue;
                        };
                        let status = unsafe {
                            callback(
                                &ANA_API,
                                exe.as_ptr(),
                                *tid,
                                pcs.len() as c_int,
                                pcs.as_ptr() as *mut _,
                                contexts.as_ptr() as *mut _,
                            )
                        };
                        suppress_to_outcome(status)
                    }),
                );
            }

            if let Some(callback) = vtable.before_print_frame {
                let exe = exe.clone();
                self.hooks.register(
                    HOOK_BEFORE_FRAME,
                    Box::new(move |event| {
                        let TraceEvent::BeforeFrame(frame) = event else {
                            return HookOutcome::Continue;
                        };
                        let status = unsafe { call_frame_cb(callback, &exe, frame) };
                        suppress_to_outcome(status)
                    }),
                );
            }

            if let Some(callback) = vtable.after_print_frame_var {
                let exe = exe.clone();
                self.hooks.register(
                    HOOK_AFTER_VAR,
                    Box::new(move |event| {
                        let TraceEvent::AfterVar {
                            frame,
                            datatype,
                            varname,
                            varaddr,
                            varsize,
                        } = event
                        else {
                            return HookOutcome::Continue;
                        };
                        let datatype = CString::new(*datatype).unwrap_or_default();
                        let varname = CString::new(*varname).unwrap_or_default();
                        unsafe {
                            callback(
                                &ANA_API,
                                exe.as_ptr(),
                                frame.tid,
                                frame.frameno,
                                frame.pc.as_u64() as *mut _,
                                frame.context,
                                datatype.as_ptr(),
                                varname.as_ptr(),
                                *varaddr as *mut _,
                                *varsize,
                            )
                        };
                        HookOutcome::Continue
                    }),
                );
            }

            if let Some(callback) = vtable.after_print_frame {
                let exe = exe.clone();
                self.hooks.register(
                    HOOK_AFTER_FRAME,
                    Box::new(move |event| {
                        let TraceEvent::AfterFrame(frame) = event else {
                            return HookOutcome::Continue;
                        };
                        unsafe {
                            callback(
                                &ANA_API,
                                exe.as_ptr(),
                                frame.tid,
                                frame.frameno,
                                frame.pc.as_u64() as *mut _,
                                frame.context,
                            )
                        };
                        HookOutcome::Continue
                    }),
                );
            }

            if let Some(callback) = vtable.on_end_thread_trace {
                let exe = exe.clone();
                self.hooks.register(
                    HOOK_END_THREAD,
                    Box::new(move |event| {
                        let TraceEvent::EndThread { tid, pcs, contexts } = event else {
                            return HookOutcome::Continue;
                        };
                        unsafe {
                            callback(
                                &ANA_API,
                                exe.as_ptr(),
                                *tid,
                                pcs.len() as c_int,
                                pcs.as_ptr() as *mut _,
                                contexts.as_ptr() as *mut _,
                            )
                        };
                        HookOutcome::Continue
                    }),
                );
            }
        }

        self.modules.push(LoadedModule {
            path: path.to_path_buf(),
            exename: exename.to_string(),
            api_version,
        });
    }
}

unsafe fn call_frame_cb(
    callback: unsafe extern "C" fn(
        *const api::GimliAnaApi,
        *const std::ffi::c_char,
        c_int,
        c_int,
        *mut std::ffi::c_void,
        *mut std::ffi::c_void,
    ) -> c_int,
    exe: &CString,
    frame: &FrameEvent,
) -> c_int {
    callback(
        &ANA_API,
        exe.as_ptr(),
        frame.tid,
        frame.frameno,
        frame.pc.as_u64() as *mut _,
        frame.context,
    )
}

fn suppress_to_outcome(status: c_int) -> HookOutcome {
    if status == GIMLI_ANA_SUPPRESS {
        HookOutcome::Stop
    } else {
        HookOutcome::Continue
    }
}

/// Resolve a module base-name to the shared library path next to the
/// executable: everything from the first `.` is dropped, the platform
/// suffix is appended and the result joined to the executable's directory.
pub fn module_candidate_path(exename: &str, name: &str) -> PathBuf {
    let stem = name.split('.').next().unwrap_or(name);
    let dir = Path::new(exename).parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!("{stem}{MODULE_SUFFIX}"))
}

/// Split the trace section into module base-names: NUL separated strings
/// with arbitrary zero padding in between; duplicates keep first position.
pub fn parse_trace_section(data: &[u8]) -> Vec<String> {
    let mut names = vec![];
    let mut seen = HashSet::new();
    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }
        let name = String::from_utf8_lossy(chunk).into_owned();
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }
    names
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_trace_section_parsing_tolerates_padding() {
        let data = b"mod_a\0\0\0mod_b\0\0";
        assert_eq!(parse_trace_section(data), vec!["mod_a", "mod_b"]);
    }

    #[test]
    fn test_trace_section_dedups_names() {
        let data = b"mod_a\0mod_b\0mod_a\0";
        assert_eq!(parse_trace_section(data), vec!["mod_a", "mod_b"]);
    }

    #[test]
    fn test_candidate_path_joins_executable_dir() {
        assert_eq!(
            module_candidate_path("/opt/app/bin/worker", "mod_a"),
            PathBuf::from(format!("/opt/app/bin/mod_a{MODULE_SUFFIX}"))
        );
        assert_eq!(
            module_candidate_path("/opt/app/bin/worker", "gimli_worker"),
            PathBuf::from(format!("/opt/app/bin/gimli_worker{MODULE_SUFFIX}"))
        );
    }

    #[test]
    fn test_candidate_path_truncates_at_first_dot() {
        assert_eq!(
            module_candidate_path("/opt/app/bin/worker", "mod_a.so"),
            PathBuf::from(format!("/opt/app/bin/mod_a{MODULE_SUFFIX}"))
        );
    }

    #[test]
    fn test_load_attempted_once_per_resolved_path() {
        let mut host = ModuleHost::new();
        host.load_module("worker", Path::new("/nonexistent/mod_a.so"));
        host.load_module("worker", Path::new("/nonexistent/mod_a.so"));
        assert_eq!(host.loaded.len(), 1);
        assert!(host.modules.is_empty());
    }
}
