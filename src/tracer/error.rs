use crate::tracer::address::RelocatedAddress;
use nix::unistd::Pid;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),

    // --------------------------------- attach errors ---------------------------------------------
    #[error("process pid {0} not found")]
    NoProc(Pid),
    #[error("attach to process {0} denied")]
    Perm(Pid),
    #[error("attach a stopped process: {0}")]
    Attach(nix::Error),
    #[error("thread debugger initialization failed: {0}")]
    ThreadDebuggerInit(String),

    // --------------------------------- remote memory errors --------------------------------------
    #[error("unreadable target memory at {0}")]
    BadAddr(RelocatedAddress),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),

    // --------------------------------- parsing errors --------------------------------------------
    #[error("dwarf file parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),

    // --------------------------------- lookup errors ---------------------------------------------
    #[error("unknown register {0:?}")]
    RegisterNotFound(gimli::Register),
    #[error("type not found")]
    TypeNotFound,

    // --------------------------------- dwarf errors ----------------------------------------------
    #[error("dwarf expression evaluation: eval option `{0}` required")]
    EvalOptionRequired(&'static str),
    #[error("dwarf expression evaluation: unsupported evaluation require ({0})")]
    EvalUnsupportedRequire(String),

    // --------------------------------- module errors ---------------------------------------------
    #[error("unable to load module {0}: {1}")]
    ModuleLoad(PathBuf, libloading::Error),

    // --------------------------------- unwind errors ---------------------------------------------
    #[cfg(feature = "libunwind")]
    #[error("libunwind error: {0}")]
    LibUnwind(#[from] unwind::Error),
}

impl Error {
    /// Return a hint to the caller - continue tracing after error or abort the invocation.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::BadAddr(_) => false,
            Error::Waitpid(_) => false,
            Error::Ptrace(_) => false,
            Error::RegisterNotFound(_) => false,
            Error::TypeNotFound => false,
            Error::EvalOptionRequired(_) => false,
            Error::EvalUnsupportedRequire(_) => false,
            Error::ModuleLoad(_, _) => false,
            #[cfg(feature = "libunwind")]
            Error::LibUnwind(_) => false,

            // currently fatal errors
            Error::NoProc(_) => true,
            Error::Perm(_) => true,
            Error::Attach(_) => true,
            Error::ThreadDebuggerInit(_) => true,
            Error::DwarfParsing(_) => true,
            Error::ObjParsing(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "tracer", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "tracer", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
