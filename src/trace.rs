//! Panic capture helpers shared by the chanrpc executor, the worker pool
//! and the module supervisor.

use std::any::Any;
use std::backtrace::Backtrace;

use tracing::error;

/// Extract a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Log a contained panic with a stack snapshot bounded to `stack_buf_len`
/// bytes. A zero length disables the snapshot.
pub(crate) fn log_panic(what: &str, msg: &str, stack_buf_len: usize) {
    if stack_buf_len > 0 {
        let mut trace = Backtrace::force_capture().to_string();
        trace.truncate(stack_buf_len);
        error!("{what} panicked: {msg}\n{trace}");
    } else {
        error!("{what} panicked: {msg}");
    }
}
