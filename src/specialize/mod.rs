//! Trace installation, guarded dispatch, and the public runtime handle.
//!
//! ```text
//!  first call            subsequent calls
//!  ──────────            ────────────────
//!  hook ─> trace ─>      wrapper ─> guards ──pass──> executor
//!  compile guards ─>              └──fail──> invalidate ─> retrace
//!  install wrapper                           └─> re-enter once or delegate
//! ```
//!
//! All process-wide state (the trace cache, the hook installation flag,
//! statistics) hangs off a single [`Specializer`] handle. `register()`
//! installs the call hook; `unregister()` uninstalls it, restores every
//! wrapped function, and empties the cache. Both are idempotent.

pub mod cache;
mod hook;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::host::error::HostResult;
use crate::host::function::Function;
use crate::host::namespace::Namespace;
use crate::host::value::{NativeFn, Value};
use crate::host::vm::{CallEvent, Host, Vm};
use crate::trace::exec::{Bindings, ExecError, Executor};
use crate::trace::guards::compile_guards;
use crate::trace::interp::trace_function;

use cache::{FnKey, TraceCache, TraceEntry, TraceMode};

/// How the call hook is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookBinding {
    /// A compiled-in dispatch fast path wired directly into the host VM.
    /// Reserved for embedders; this crate does not provide one.
    NativeFastPath,
    /// The portable profiling hook fired by the reference VM
    Profiler,
}

/// Counters describing specializer activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecializerStats {
    /// Successful traces installed (including retraces)
    pub traces: u64,
    /// Invalidations that led to a retrace attempt
    pub retraces: u64,
    /// Guard evaluations that failed and triggered invalidation
    pub guard_failures: u64,
    /// Calls answered by the executor fast path
    pub fast_path_calls: u64,
    /// Calls delegated to the original function
    pub fallback_calls: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    traces: AtomicU64,
    retraces: AtomicU64,
    guard_failures: AtomicU64,
    fast_path_calls: AtomicU64,
    fallback_calls: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> SpecializerStats {
        SpecializerStats {
            traces: self.traces.load(Ordering::Relaxed),
            retraces: self.retraces.load(Ordering::Relaxed),
            guard_failures: self.guard_failures.load(Ordering::Relaxed),
            fast_path_calls: self.fast_path_calls.load(Ordering::Relaxed),
            fallback_calls: self.fallback_calls.load(Ordering::Relaxed),
        }
    }
}

/// The tracing JIT specializer runtime handle
pub struct Specializer {
    shared: Arc<SpecializerShared>,
}

pub(crate) struct SpecializerShared {
    host: Host,
    cache: TraceCache,
    installed: AtomicBool,
    stats: StatCounters,
}

impl Specializer {
    /// Create a specializer for a host; no hook is installed yet
    pub fn new(host: &Host) -> Self {
        Specializer {
            shared: Arc::new(SpecializerShared {
                host: host.clone(),
                cache: TraceCache::new(),
                installed: AtomicBool::new(false),
                stats: StatCounters::default(),
            }),
        }
    }

    /// Install the call hook. Idempotent; returns the binding in use.
    pub fn register(&self) -> HookBinding {
        if !self.shared.installed.swap(true, Ordering::SeqCst) {
            let hook = hook::SpecializerHook::new(Arc::downgrade(&self.shared));
            self.shared.host.install_hook(Arc::new(hook));
            debug!("specializer registered");
        }
        HookBinding::Profiler
    }

    /// Uninstall the hook, restore every wrapped function, drop all traces.
    /// Idempotent.
    pub fn unregister(&self) {
        if self.shared.installed.swap(false, Ordering::SeqCst) {
            self.shared.host.clear_hook();
            debug!("specializer unregistered");
        }
        for entry in self.shared.cache.drain() {
            entry.restore_original();
        }
    }

    /// Number of functions with a cached trace (including permanent misses)
    pub fn trace_count(&self) -> usize {
        self.shared.cache.len()
    }

    /// Whether a function currently has a cache entry
    pub fn is_traced(&self, func: &Arc<Function>) -> bool {
        self.shared.cache.contains(FnKey::of(func))
    }

    /// Snapshot of activity counters
    pub fn stats(&self) -> SpecializerStats {
        self.shared.stats.snapshot()
    }
}

impl Drop for Specializer {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl SpecializerShared {
    /// Handle one call event: resolve, skip cached, first-trace otherwise
    pub(crate) fn observe_call(self: &Arc<Self>, event: &CallEvent<'_>) {
        let Some((func, owner, slot)) = hook::resolve_callable(event) else {
            return;
        };
        let key = FnKey::of(&func);
        if self.cache.contains(key) {
            return;
        }
        if self.install_trace(&func, &owner, &slot).is_none() {
            warn!(function = func.name(), "first trace failed; leaving original");
        }
    }

    /// Trace a function, compile its guards, install the wrapper.
    ///
    /// The namespace write is the commit point: after it, call sites
    /// resolving the slot reach the wrapper.
    fn install_trace(
        self: &Arc<Self>,
        func: &Arc<Function>,
        owner: &Namespace,
        slot: &str,
    ) -> Option<Arc<TraceEntry>> {
        let trace = match trace_function(func) {
            Ok(t) => t,
            Err(e) => {
                warn!(function = func.name(), error = %e, "trace failed");
                return None;
            }
        };
        let mode = if trace.is_degenerate() {
            TraceMode::Fallback
        } else {
            TraceMode::Active
        };
        let guards = compile_guards(&trace.guards);
        let key = FnKey::of(func);
        let wrapper = self.make_wrapper(func, key);
        let entry = Arc::new(TraceEntry::new(
            Arc::clone(func),
            slot.to_string(),
            owner.clone(),
            Arc::new(trace.graph),
            guards,
            wrapper.clone(),
            mode,
        ));
        owner.set(slot, wrapper);
        self.cache.insert(key, Arc::clone(&entry));
        self.stats.traces.fetch_add(1, Ordering::Relaxed);
        debug!(
            function = func.name(),
            nodes = entry.graph().len(),
            guards = entry.guards().len(),
            mode = ?mode,
            "trace installed"
        );
        Some(entry)
    }

    /// Build the wrapper callable installed in place of the original.
    ///
    /// The wrapper holds only a weak reference to the runtime and re-enters
    /// through the current cache, so a stale wrapper kept alive by a call
    /// site never dispatches through a stale entry.
    fn make_wrapper(self: &Arc<Self>, func: &Arc<Function>, key: FnKey) -> Value {
        let weak = Arc::downgrade(self);
        let original = Arc::clone(func);
        let host = self.host.clone();
        Value::Native(NativeFn::new(func.name(), false, move |args, kwargs| {
            match weak.upgrade() {
                Some(shared) => shared.dispatch(key, &original, args, kwargs),
                None => Vm::new(&host).call_function(&original, args, kwargs),
            }
        }))
    }

    /// The wrapper protocol: bind, check guards, execute or retrace
    fn dispatch(
        self: &Arc<Self>,
        key: FnKey,
        original: &Arc<Function>,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> HostResult<Value> {
        let Some(entry) = self.cache.get(key) else {
            // Invalidation popped the entry under us; the retracer will
            // reinstall. This call just uses the original.
            return self.delegate(original, args, kwargs);
        };

        if entry.mode() == TraceMode::Fallback {
            return self.delegate(original, args, kwargs);
        }

        let bindings: Bindings = match original.bind(args, kwargs) {
            Ok(pairs) => pairs.into_iter().collect(),
            // Unbindable arguments: the trace cannot be used; let the
            // original raise whatever it raises.
            Err(_) => return self.delegate(original, args, kwargs),
        };

        if let Some(failed) = entry.first_failed_guard(&bindings) {
            debug!(function = original.name(), guard = %failed, "guard failed");
            self.stats.guard_failures.fetch_add(1, Ordering::Relaxed);
            return self.retrace_and_reenter(key, original, &bindings, args, kwargs);
        }

        match Executor::new(&self.host).run(entry.graph(), &bindings) {
            Ok(value) => {
                self.stats.fast_path_calls.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(ExecError::Host(user_error)) => Err(user_error),
            Err(internal) => {
                debug!(
                    function = original.name(),
                    error = %internal,
                    "executor internal error; treating as guard failure"
                );
                self.stats.guard_failures.fetch_add(1, Ordering::Relaxed);
                self.retrace_and_reenter(key, original, &bindings, args, kwargs)
            }
        }
    }

    /// Invalidate, retrace, then re-enter the new trace exactly once.
    /// A second failure delegates rather than looping.
    fn retrace_and_reenter(
        self: &Arc<Self>,
        key: FnKey,
        original: &Arc<Function>,
        bindings: &Bindings,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> HostResult<Value> {
        let Some(entry) = self.invalidate_and_retrace(key) else {
            return self.delegate(original, args, kwargs);
        };
        if entry.mode() == TraceMode::Fallback
            || entry.first_failed_guard(bindings).is_some()
        {
            return self.delegate(original, args, kwargs);
        }
        match Executor::new(&self.host).run(entry.graph(), bindings) {
            Ok(value) => {
                self.stats.fast_path_calls.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(ExecError::Host(user_error)) => Err(user_error),
            Err(internal) => {
                debug!(error = %internal, "replay failed after retrace; delegating");
                self.delegate(original, args, kwargs)
            }
        }
    }

    /// Atomic pop + restore + retrace + reinstall.
    ///
    /// Exactly one concurrent caller wins the pop and performs the retrace;
    /// late losers observe the fresh entry through the cache.
    fn invalidate_and_retrace(self: &Arc<Self>, key: FnKey) -> Option<Arc<TraceEntry>> {
        match self.cache.remove(key) {
            Some(stale) => {
                stale.restore_original();
                self.stats.retraces.fetch_add(1, Ordering::Relaxed);
                self.install_trace(stale.original(), stale.owner(), stale.slot())
            }
            None => self.cache.get(key),
        }
    }

    fn delegate(
        &self,
        original: &Arc<Function>,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> HostResult<Value> {
        self.stats.fallback_calls.fetch_add(1, Ordering::Relaxed);
        Vm::new(&self.host).call_function(original, args, kwargs)
    }
}
