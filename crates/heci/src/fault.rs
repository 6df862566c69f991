//! Process-wide fault channel.
//!
//! Control callbacks, flush signals and event notifications are user code.
//! Each invocation runs under [`guard`]; a panic is caught, logged and handed
//! to the hook installed with [`set_fault_hook`] so that the dispatcher and
//! queues keep a consistent state.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::RwLock;

/// A panic caught while running a user callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Which callback panicked.
    pub context: &'static str,
    /// The panic payload rendered as text.
    pub message: String,
}

type FaultHook = Box<dyn Fn(&Fault) + Send + Sync>;

static FAULT_HOOK: RwLock<Option<FaultHook>> = RwLock::new(None);

/// Installs the process-wide fault hook, replacing any previous one.
pub fn set_fault_hook<F>(hook: F)
where
    F: Fn(&Fault) + Send + Sync + 'static,
{
    let mut slot = FAULT_HOOK.write().unwrap_or_else(|e| e.into_inner());
    *slot = Some(Box::new(hook));
}

/// Removes the process-wide fault hook.
pub fn clear_fault_hook() {
    let mut slot = FAULT_HOOK.write().unwrap_or_else(|e| e.into_inner());
    *slot = None;
}

/// Reports a fault to the log and the installed hook.
pub fn report(fault: &Fault) {
    tracing::error!(context = fault.context, "Callback panicked: {}", fault.message);
    let slot = FAULT_HOOK.read().unwrap_or_else(|e| e.into_inner());
    if let Some(hook) = slot.as_ref() {
        hook(fault);
    }
}

/// Runs `f`, isolating a panic into the fault channel.
///
/// Returns `None` if `f` panicked.
pub fn guard<R>(context: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            report(&Fault {
                context,
                message: panic_message(payload.as_ref()),
            });
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
