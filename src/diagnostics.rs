//! Per-context diagnostics: last error message and verbose trace switch.
//!
//! Owned by [`ComputeContext`](crate::ComputeContext), so two contexts never
//! see each other's failures. The last error is overwritten by every failing
//! call and is never cleared by a successful one.

use crate::error::ComputeError;

/// Log target for verbose per-operation traces
pub const TRACE_TARGET: &str = "hlx_compute::trace";

#[derive(Debug, Default)]
pub struct Diagnostics {
    last_error: Option<String>,
    debug: bool,
}

impl Diagnostics {
    pub fn new(debug: bool) -> Self {
        Self {
            last_error: None,
            debug,
        }
    }

    /// Most recent failure message, if any call has failed so far
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    pub fn set_debug(&mut self, enable: bool) {
        self.debug = enable;
        self.trace(format_args!(
            "Debug mode {}",
            if enable { "enabled" } else { "disabled" }
        ));
    }

    /// Store the error's message and log it, then hand the error back.
    pub fn record(&mut self, err: ComputeError) -> ComputeError {
        let message = err.to_string();
        log::error!("{}", message);
        self.last_error = Some(message);
        err
    }

    /// Emit a verbose trace line when debug mode is on.
    pub fn trace(&self, args: std::fmt::Arguments<'_>) {
        if self.debug {
            log::info!(target: TRACE_TARGET, "{}", args);
        }
    }
}
