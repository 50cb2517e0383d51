//! Formatting of panic payloads caught from message handlers.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Displays a caught panic payload.
///
/// `String` and `&'static str` payloads print as-is; anything else falls back to
/// `Debug` formatting of the `Any` box.
#[derive(Debug)]
pub struct PanicMessage(Box<dyn Any + Send>);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

pub fn format_panic(panic: Box<dyn Any + Send>) -> PanicMessage {
    PanicMessage(panic)
}

/// Run a synchronous observer hook, returning its panic instead of unwinding
/// into the caller's task.
pub fn catch_hook(hook: impl FnOnce()) -> Result<(), PanicMessage> {
    catch_unwind(AssertUnwindSafe(hook)).map_err(format_panic)
}
