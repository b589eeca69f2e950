use crate::tracer::address::RelocatedAddress;
use indexmap::IndexMap;
use log::warn;
use std::ffi::c_void;

pub const HOOK_TRACER: &str = "tracer";
pub const HOOK_VAR_PRINTER: &str = "var_printer";
pub const HOOK_BEGIN_THREAD: &str = "begin_thread";
pub const HOOK_END_THREAD: &str = "end_thread";
pub const HOOK_BEFORE_FRAME: &str = "before_frame";
pub const HOOK_AFTER_FRAME: &str = "after_frame";
pub const HOOK_AFTER_VAR: &str = "after_var";

/// Callback verdict. `Stop` halts iteration for the event (a module
/// suppressing the current item), `Error` halts it and surfaces the error
/// without aborting the trace.
pub enum HookOutcome {
    Continue,
    Stop,
    Error(anyhow::Error),
}

/// Frame coordinates handed to module callbacks.
#[derive(Clone, Copy)]
pub struct FrameEvent {
    pub tid: i32,
    pub frameno: i32,
    pub pc: RelocatedAddress,
    pub context: *mut c_void,
}

/// Payload dispatched to hook callbacks during trace emission.
pub enum TraceEvent<'a> {
    Tracer,
    BeginThread {
        tid: i32,
        pcs: &'a [*mut c_void],
        contexts: &'a [*mut c_void],
    },
    EndThread {
        tid: i32,
        pcs: &'a [*mut c_void],
        contexts: &'a [*mut c_void],
    },
    BeforeFrame(FrameEvent),
    AfterFrame(FrameEvent),
    BeforeVar {
        frame: FrameEvent,
        datatype: &'a str,
        varname: &'a str,
        varaddr: u64,
        varsize: u64,
    },
    AfterVar {
        frame: FrameEvent,
        datatype: &'a str,
        varname: &'a str,
        varaddr: u64,
        varsize: u64,
    },
}

pub type HookFn = Box<dyn Fn(&TraceEvent) -> HookOutcome>;

/// Named extension points with insertion-ordered callback lists.
#[derive(Default)]
pub struct HookRegistry {
    hooks: IndexMap<String, Vec<HookFn>>,
}

impl HookRegistry {
    pub fn register(&mut self, name: &str, callback: HookFn) {
        self.hooks.entry(name.to_string()).or_default().push(callback);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Invoke every callback registered for `name` in registration order.
    /// A `Stop` or `Error` outcome prevents later callbacks from running.
    pub fn visit(&self, name: &str, event: &TraceEvent) -> HookOutcome {
        let Some(callbacks) = self.hooks.get(name) else {
            return HookOutcome::Continue;
        };

        for callback in callbacks {
            match callback(event) {
                HookOutcome::Continue => continue,
                HookOutcome::Stop => return HookOutcome::Stop,
                HookOutcome::Error(e) => {
                    warn!(target: "tracer", "hook {name}: {e:#}");
                    return HookOutcome::Error(e);
                }
            }
        }
        HookOutcome::Continue
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let seen = Rc::new(RefCell::new(vec![]));
        let mut hooks = HookRegistry::default();
        for i in 0..3 {
            let seen = seen.clone();
            hooks.register(
                HOOK_TRACER,
                Box::new(move |_| {
                    seen.borrow_mut().push(i);
                    HookOutcome::Continue
                }),
            );
        }

        assert!(matches!(
            hooks.visit(HOOK_TRACER, &TraceEvent::Tracer),
            HookOutcome::Continue
        ));
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_stop_short_circuits_later_callbacks() {
        let seen = Rc::new(RefCell::new(vec![]));
        let mut hooks = HookRegistry::default();

        let s = seen.clone();
        hooks.register(
            HOOK_TRACER,
            Box::new(move |_| {
                s.borrow_mut().push("first");
                HookOutcome::Stop
            }),
        );
        let s = seen.clone();
        hooks.register(
            HOOK_TRACER,
            Box::new(move |_| {
                s.borrow_mut().push("second");
                HookOutcome::Continue
            }),
        );

        assert!(matches!(
            hooks.visit(HOOK_TRACER, &TraceEvent::Tracer),
            HookOutcome::Stop
        ));
        assert_eq!(*seen.borrow(), vec!["first"]);
    }

    #[test]
    fn test_unknown_hook_is_a_noop() {
        let hooks = HookRegistry::default();
        assert!(matches!(
            hooks.visit("nothing", &TraceEvent::Tracer),
            HookOutcome::Continue
        ));
    }
}
