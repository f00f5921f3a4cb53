//! Trace cache: per-function records of installed specializations.
//!
//! The cache maps function identity to a [`TraceEntry`]. Entries are
//! immutable once inserted; invalidation is an atomic pop followed by a
//! reinsert of a fresh entry, so concurrent wrappers racing on a failed
//! guard elect exactly one retracer and the losers observe the new entry.

use std::sync::Arc;

use dashmap::DashMap;

use crate::host::function::Function;
use crate::host::namespace::Namespace;
use crate::host::value::Value;
use crate::trace::exec::Bindings;
use crate::trace::graph::Graph;
use crate::trace::guards::{CompiledGuard, GuardRecord};

/// Identity of a traced function (stable while the entry holds the `Arc`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FnKey(usize);

impl FnKey {
    pub fn of(func: &Arc<Function>) -> Self {
        FnKey(Arc::as_ptr(func) as usize)
    }
}

/// How a cached trace dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    /// Guards are checkable; the fast path is live
    Active,
    /// A sentinel guard was emitted at trace time. The wrapper always
    /// delegates and the entry is never retraced: a permanent miss.
    Fallback,
}

/// Everything the wrapper needs to dispatch one traced function
#[derive(Debug)]
pub struct TraceEntry {
    original: Arc<Function>,
    /// Name of the binding the wrapper was installed under
    slot: String,
    owner: Namespace,
    graph: Arc<Graph>,
    guards: Vec<CompiledGuard>,
    wrapper: Value,
    mode: TraceMode,
}

impl TraceEntry {
    pub fn new(
        original: Arc<Function>,
        slot: String,
        owner: Namespace,
        graph: Arc<Graph>,
        guards: Vec<CompiledGuard>,
        wrapper: Value,
        mode: TraceMode,
    ) -> Self {
        TraceEntry {
            original,
            slot,
            owner,
            graph,
            guards,
            wrapper,
            mode,
        }
    }

    #[inline]
    pub fn original(&self) -> &Arc<Function> {
        &self.original
    }

    #[inline]
    pub fn slot(&self) -> &str {
        &self.slot
    }

    #[inline]
    pub fn owner(&self) -> &Namespace {
        &self.owner
    }

    #[inline]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    #[inline]
    pub fn guards(&self) -> &[CompiledGuard] {
        &self.guards
    }

    #[inline]
    pub fn wrapper(&self) -> &Value {
        &self.wrapper
    }

    #[inline]
    pub fn mode(&self) -> TraceMode {
        self.mode
    }

    /// Evaluate guards in insertion order; the first failure short-circuits
    pub fn first_failed_guard(&self, bindings: &Bindings) -> Option<&GuardRecord> {
        self.guards
            .iter()
            .find(|g| !g.check(bindings))
            .map(|g| g.record())
    }

    /// Write the original function back into its owner namespace
    pub fn restore_original(&self) {
        self.owner
            .set(&*self.slot, Value::Function(self.original.clone()));
    }
}

/// Process-wide function -> trace map
#[derive(Debug, Default)]
pub struct TraceCache {
    entries: DashMap<FnKey, Arc<TraceEntry>>,
}

impl TraceCache {
    pub fn new() -> Self {
        TraceCache {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: FnKey) -> Option<Arc<TraceEntry>> {
        self.entries.get(&key).map(|e| Arc::clone(&e))
    }

    pub fn insert(&self, key: FnKey, entry: Arc<TraceEntry>) {
        self.entries.insert(key, entry);
    }

    /// Atomically pop an entry; exactly one caller wins a concurrent race
    pub fn remove(&self, key: FnKey) -> Option<Arc<TraceEntry>> {
        self.entries.remove(&key).map(|(_, e)| e)
    }

    pub fn contains(&self, key: FnKey) -> bool {
        self.entries.contains_key(&key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pop every entry, returning them for teardown
    pub fn drain(&self) -> Vec<Arc<TraceEntry>> {
        let keys: Vec<FnKey> = self.entries.iter().map(|e| *e.key()).collect();
        keys.into_iter()
            .filter_map(|k| self.remove(k))
            .collect()
    }
}
