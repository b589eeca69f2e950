//! crashtracer is a post-mortem diagnostic engine: it attaches to a stopped
//! worker process, walks every thread stack through debug unwind tables,
//! resolves symbols, source positions and frame parameters, and dispatches
//! per-executable analysis modules while the trace is emitted.

pub mod module;
pub mod tracer;
