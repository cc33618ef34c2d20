//! Caller context propagation (C15).
//!
//! The logical originator of a SQL query (`caller_id`) has to survive crossing
//! into worker pools used by cache writes, the prewarm sidecar, and
//! synchronous UDF callbacks. Rust has no ambient async-task-local that
//! follows a spawned thread the way a Python `ContextVar` does, so the
//! discipline here is explicit: [`capture`] snapshots the current frame at
//! submission time, and [`run_with_captured`] re-installs it inside the
//! worker before running the job (§4.15, §5).
//!
//! A process-wide fallback registry is also kept so a worker that lost its
//! context entirely (no capture, no re-install) can still look a caller up by
//! id as a last resort.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct CallerFrame {
    pub caller_id: String,
    pub metadata: Option<Value>,
}

thread_local! {
    static STACK: RefCell<Vec<CallerFrame>> = const { RefCell::new(Vec::new()) };
}

static FALLBACK: Lazy<Mutex<HashMap<String, CallerFrame>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// The innermost `caller_id` on this thread's stack, if any.
pub fn get_caller_id() -> Option<String> {
    STACK.with(|s| s.borrow().last().map(|f| f.caller_id.clone()))
}

/// The innermost full frame on this thread's stack, if any.
pub fn current_frame() -> Option<CallerFrame> {
    STACK.with(|s| s.borrow().last().cloned())
}

/// Pushes `(caller_id, metadata)` for the duration of `f`, then pops it. Also
/// records the frame in the process-wide fallback registry so a worker with
/// no captured context can still resolve this caller by id.
pub fn with_caller<R>(caller_id: impl Into<String>, metadata: Option<Value>, f: impl FnOnce() -> R) -> R {
    let frame = CallerFrame { caller_id: caller_id.into(), metadata };
    push(frame);
    let result = f();
    pop();
    result
}

fn push(frame: CallerFrame) {
    if let Ok(mut reg) = FALLBACK.lock() {
        reg.insert(frame.caller_id.clone(), frame.clone());
    }
    STACK.with(|s| s.borrow_mut().push(frame));
}

fn pop() {
    STACK.with(|s| {
        s.borrow_mut().pop();
    });
}

/// Snapshots the current frame for a worker-pool submission. `None` means
/// this thread had no caller context to carry across.
pub fn capture() -> Option<CallerFrame> {
    current_frame()
}

/// Re-installs a captured frame inside a worker, runs `f`, then restores.
/// With `captured = None`, `f` just runs without a caller context (the worker
/// can still fall back to [`fallback_lookup`] if it knows the id by other
/// means).
pub fn run_with_captured<R>(captured: Option<CallerFrame>, f: impl FnOnce() -> R) -> R {
    match captured {
        Some(frame) => with_caller(frame.caller_id, frame.metadata, f),
        None => f(),
    }
}

/// Last-resort lookup for a worker that has a `caller_id` but no captured
/// frame (e.g. it arrived via a channel that didn't carry metadata).
pub fn fallback_lookup(caller_id: &str) -> Option<CallerFrame> {
    FALLBACK.lock().ok().and_then(|reg| reg.get(caller_id).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_context_outside_with_caller() {
        assert_eq!(get_caller_id(), None);
    }

    #[test]
    fn with_caller_scopes_the_id() {
        with_caller("caller-1", None, || {
            assert_eq!(get_caller_id(), Some("caller-1".to_string()));
        });
        assert_eq!(get_caller_id(), None);
    }

    #[test]
    fn nested_callers_restore_outer_on_pop() {
        with_caller("outer", None, || {
            with_caller("inner", None, || {
                assert_eq!(get_caller_id(), Some("inner".to_string()));
            });
            assert_eq!(get_caller_id(), Some("outer".to_string()));
        });
    }

    #[test]
    fn capture_and_run_with_captured_crosses_a_thread() {
        let captured = with_caller("thread-crossing", None, capture);
        assert!(captured.is_some());

        let handle = std::thread::spawn(move || run_with_captured(captured, get_caller_id));
        assert_eq!(handle.join().unwrap(), Some("thread-crossing".to_string()));
    }

    #[test]
    fn fallback_registry_resolves_by_id() {
        with_caller("fallback-caller", None, || {});
        assert_eq!(fallback_lookup("fallback-caller").map(|f| f.caller_id), Some("fallback-caller".to_string()));
    }
}
