//! Target-process introspection engine and the trace pipeline built on it:
//! attach, walk every thread stack, symbolicate and pretty-print each frame,
//! dispatch analysis-module hooks, detach.

pub mod address;
pub mod dwarf;
pub mod error;
pub mod obj;
pub mod os;
pub mod proc;
pub mod register;
pub mod symbolic;
pub mod types;
pub mod unwind;
pub mod variable;

#[cfg(feature = "libunwind")]
pub mod uw;

#[cfg(test)]
pub(crate) mod testing;

use crate::module::api::{self, FrameContext, TraceSession};
use crate::module::hooks::{
    FrameEvent, HookOutcome, TraceEvent, HOOK_AFTER_FRAME, HOOK_AFTER_VAR, HOOK_BEFORE_FRAME,
    HOOK_BEGIN_THREAD, HOOK_END_THREAD, HOOK_TRACER, HOOK_VAR_PRINTER,
};
use crate::module::ModuleHost;
use crate::tracer::error::Error;
use crate::tracer::proc::thread::ThreadState;
use crate::tracer::proc::Proc;
use crate::tracer::symbolic::Symbolicator;
use crate::tracer::unwind::{StepResult, UnwindCursor};
use crate::weak_error;
use log::info;
use nix::unistd::Pid;
use std::ffi::c_void;
use std::io::Write;
use std::rc::Rc;

/// Backstop against runaway walks over corrupted stacks.
const MAX_FRAMES: usize = 256;

struct FrameRecord {
    state: ThreadState,
    frame_no: u32,
    context: Box<FrameContext>,
}

/// One tracer invocation over one stopped target.
pub struct Tracer {
    proc: Rc<Proc>,
    host: ModuleHost,
}

impl Tracer {
    /// Attach to the target and discover its analysis modules.
    pub fn attach(pid: Pid) -> Result<Self, Error> {
        let proc = Rc::new(Proc::attach(pid)?);
        info!(target: "tracer", "attached to pid {pid}, {} threads", proc.threads().len());

        let mut host = ModuleHost::new();
        host.discover(&proc);

        Ok(Self { proc, host })
    }

    pub fn proc(&self) -> &Rc<Proc> {
        &self.proc
    }

    /// Emit the whole human-readable trace. The target stays stopped for
    /// the duration; it resumes when the tracer is dropped.
    pub fn trace(&self, out: &mut dyn Write) -> Result<(), Error> {
        api::bind_session(Rc::new(TraceSession {
            proc: self.proc.clone(),
        }));
        let result = self.trace_report(out);
        api::unbind_session();
        result
    }

    fn trace_report(&self, out: &mut dyn Write) -> Result<(), Error> {
        writeln!(
            out,
            "POST MORTEM TRACE of pid {} ({} threads)\n",
            self.proc.pid(),
            self.proc.threads().len()
        )?;

        let threads: Vec<ThreadState> = self.proc.threads().to_vec();
        for (idx, thread) in threads.iter().enumerate() {
            if let Err(e) = self.trace_thread(out, idx, thread) {
                if e.is_fatal() {
                    return Err(e);
                }
                log::warn!(target: "tracer", "thread {idx} not fully traced: {e:#}");
            }
        }

        // modules with their own report emit it after the stacks
        self.host.hooks.visit(HOOK_TRACER, &TraceEvent::Tracer);

        self.proc.show_memory_map(out)?;
        Ok(())
    }

    fn trace_thread(&self, out: &mut dyn Write, idx: usize, thread: &ThreadState) -> Result<(), Error> {
        let records = self.walk_stack(thread);

        let tid = thread.lwp.as_raw();
        let pcs: Vec<*mut c_void> = records
            .iter()
            .map(|record| record.state.pc.as_u64() as *mut c_void)
            .collect();
        let contexts: Vec<*mut c_void> = records
            .iter()
            .map(|record| &*record.context as *const FrameContext as *mut c_void)
            .collect();

        writeln!(out, "Thread {idx} (LWP {tid})")?;

        let begin = self.host.hooks.visit(
            HOOK_BEGIN_THREAD,
            &TraceEvent::BeginThread {
                tid,
                pcs: &pcs,
                contexts: &contexts,
            },
        );
        if matches!(begin, HookOutcome::Stop) {
            writeln!(out, "  <suppressed by analysis module>\n")?;
            return Ok(());
        }

        for record in &records {
            self.trace_frame(out, tid, record)?;
        }

        self.host.hooks.visit(
            HOOK_END_THREAD,
            &TraceEvent::EndThread {
                tid,
                pcs: &pcs,
                contexts: &contexts,
            },
        );

        writeln!(out)?;
        Ok(())
    }

    /// Walk the thread stack outermost-last, snapshotting the register view
    /// of every frame.
    fn walk_stack(&self, thread: &ThreadState) -> Vec<FrameRecord> {
        let mut records = vec![];
        let mut cursor = UnwindCursor::new(&self.proc, thread);

        loop {
            records.push(FrameRecord {
                state: cursor.state().clone(),
                frame_no: cursor.frame_no(),
                context: Box::new(FrameContext {
                    state: cursor.state().clone(),
                    frame_no: cursor.frame_no(),
                }),
            });
            if records.len() >= MAX_FRAMES {
                break;
            }

            match weak_error!(cursor.step()) {
                Some(StepResult::Stepped) => continue,
                Some(StepResult::EndOfStack) | None => break,
            }
        }

        // a walk that went nowhere gets a second opinion from libunwind,
        // yielding at least the instruction addresses of the outer frames
        #[cfg(feature = "libunwind")]
        if records.len() == 1 {
            if let Some(ips) = weak_error!(uw::backtrace(thread.lwp)) {
                for ip in ips.into_iter().skip(records.len()) {
                    let mut state = thread.clone();
                    state.pc = ip;
                    state.sync_regs();
                    let frame_no = records.len() as u32;
                    records.push(FrameRecord {
                        state: state.clone(),
                        frame_no,
                        context: Box::new(FrameContext { state, frame_no }),
                    });
                }
            }
        }

        records
    }

    fn trace_frame(&self, out: &mut dyn Write, tid: i32, record: &FrameRecord) -> Result<(), Error> {
        let pc = record.state.pc;
        let frame_event = FrameEvent {
            tid,
            frameno: record.frame_no as i32,
            pc,
            context: &*record.context as *const FrameContext as *mut c_void,
        };

        if matches!(
            self.host
                .hooks
                .visit(HOOK_BEFORE_FRAME, &TraceEvent::BeforeFrame(frame_event)),
            HookOutcome::Stop
        ) {
            return Ok(());
        }

        let label = Symbolicator::new(&self.proc).pc_sym_name(pc);
        let place = self.proc.mapping_for_addr(pc).and_then(|mapping| {
            let di = mapping.object.debug_info()?;
            di.find_place_from_pc(mapping.object.to_global(pc))
        });

        match (label.is_empty(), place) {
            (false, Some(place)) => writeln!(
                out,
                "#{:<2} {pc} {label} ({}:{})",
                record.frame_no,
                place.file.display(),
                place.line
            )?,
            (false, None) => writeln!(out, "#{:<2} {pc} {label}", record.frame_no)?,
            (true, _) => writeln!(out, "#{:<2} {pc}", record.frame_no)?,
        }

        self.trace_frame_params(out, record, &frame_event)?;

        self.host
            .hooks
            .visit(HOOK_AFTER_FRAME, &TraceEvent::AfterFrame(frame_event));
        Ok(())
    }

    /// Emit the formal parameters of the frame in declaration order.
    fn trace_frame_params(
        &self,
        out: &mut dyn Write,
        record: &FrameRecord,
        frame_event: &FrameEvent,
    ) -> Result<(), Error> {
        let cursor = UnwindCursor::new(&self.proc, &record.state);
        let params = variable::frame_parameters(&self.proc, &cursor);
        let object = self.proc.mapping_for_addr(record.state.pc).map(|m| m.object);

        for param in params {
            let varaddr = param.addr.map(|a| a.as_u64()).unwrap_or(0);
            let before = self.host.hooks.visit(
                HOOK_VAR_PRINTER,
                &TraceEvent::BeforeVar {
                    frame: *frame_event,
                    datatype: &param.declname,
                    varname: &param.name,
                    varaddr,
                    varsize: param.size,
                },
            );
            if matches!(before, HookOutcome::Stop) {
                continue;
            }

            let value = match (param.type_id, param.addr, &object) {
                (Some(type_id), Some(addr), Some(object)) => {
                    variable::render_value(&self.proc, object, type_id, addr)
                }
                _ => "<optimized out>".to_string(),
            };
            writeln!(out, "      {} {} = {value}", param.declname, param.name)?;

            self.host.hooks.visit(
                HOOK_AFTER_VAR,
                &TraceEvent::AfterVar {
                    frame: *frame_event,
                    datatype: &param.declname,
                    varname: &param.name,
                    varaddr,
                    varsize: param.size,
                },
            );
        }
        Ok(())
    }
}
