//! Hook adapter: turns VM call events into first-trace requests.
//!
//! The adapter recovers the callable behind a code object by probing the
//! event's globals under the declared name, then the call locals, then a
//! linear identity scan of globals. Unresolvable or already-cached
//! callables are ignored. Nothing in this path may take down the host
//! program: failures are logged and swallowed.

use std::sync::{Arc, Weak};

use tracing::trace;

use crate::host::function::Function;
use crate::host::namespace::Namespace;
use crate::host::value::Value;
use crate::host::vm::{CallEvent, CallHook};

use super::SpecializerShared;

/// The [`CallHook`] installed by `register()`
pub(crate) struct SpecializerHook {
    shared: Weak<SpecializerShared>,
}

impl SpecializerHook {
    pub(crate) fn new(shared: Weak<SpecializerShared>) -> Self {
        SpecializerHook { shared }
    }
}

impl CallHook for SpecializerHook {
    fn on_call(&self, event: &CallEvent<'_>) {
        // A torn-down specializer leaves a dead hook behind until the host
        // clears it; events in that window are ignored.
        let Some(shared) = self.shared.upgrade() else { return };
        shared.observe_call(event);
    }
}

/// Recover the called function and the namespace slot it is reachable
/// through.
///
/// Resolution order: globals under the code's declared name, call locals
/// under the declared name, then an identity scan of globals (which also
/// recovers functions bound under a different name). A function resolved
/// only from locals has no namespace slot to install a wrapper into, so it
/// resolves to `None` unless the scan finds one.
pub(crate) fn resolve_callable(
    event: &CallEvent<'_>,
) -> Option<(Arc<Function>, Namespace, String)> {
    let name = event.chunk.name();

    if let Some(Value::Function(func)) = event.globals.get(name) {
        if Arc::ptr_eq(func.chunk(), event.chunk) {
            return Some((func, event.globals.clone(), name.to_string()));
        }
    }

    let from_locals = event.locals.iter().any(|(n, v)| {
        n == name
            && matches!(v, Value::Function(f) if Arc::ptr_eq(f.chunk(), event.chunk))
    });
    if from_locals {
        trace!(name, "callable resolved from locals; probing globals for a slot");
    }

    for slot in event.globals.names() {
        if let Some(Value::Function(func)) = event.globals.get(&slot) {
            if Arc::ptr_eq(func.chunk(), event.chunk) {
                return Some((func, event.globals.clone(), slot));
            }
        }
    }

    trace!(name, "callable not resolved; ignoring call event");
    None
}
