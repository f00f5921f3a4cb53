//! Namespaces with per-slot generation counters.
//!
//! A namespace is the host's name -> value binding table. Every write to a
//! slot bumps that slot's generation counter; a guard that snapshotted
//! `(name, generation)` at trace time can later decide "is this still the
//! same binding" with one integer compare instead of a value comparison.
//! This is the host-side identity representation used throughout the
//! specializer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::value::Value;

/// A binding slot: the current value plus its write generation
#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    generation: u64,
}

/// A shared, mutable name -> value table
///
/// Cloning a `Namespace` clones the handle, not the table. An optional
/// builtins namespace backs global resolution: [`Namespace::resolve`] probes
/// the local table first and falls through to builtins.
#[derive(Clone)]
pub struct Namespace {
    inner: Arc<NamespaceInner>,
}

struct NamespaceInner {
    builtins: Option<Namespace>,
    slots: RwLock<HashMap<String, Slot>>,
}

/// A successful global resolution: the value, the namespace that supplied
/// it, and the slot generation at resolution time
#[derive(Debug, Clone)]
pub struct Resolved {
    pub value: Value,
    pub namespace: Namespace,
    pub generation: u64,
}

impl Namespace {
    /// Create an empty namespace with no builtins fallback
    pub fn new() -> Self {
        Namespace {
            inner: Arc::new(NamespaceInner {
                builtins: None,
                slots: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create an empty namespace that falls back to `builtins` on resolve
    pub fn with_builtins(builtins: &Namespace) -> Self {
        Namespace {
            inner: Arc::new(NamespaceInner {
                builtins: Some(builtins.clone()),
                slots: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Read a binding from this namespace only (no builtins fallback)
    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.slots.read().get(name).map(|s| s.value.clone())
    }

    /// Current generation of a slot, if the name is bound here
    pub fn generation_of(&self, name: &str) -> Option<u64> {
        self.inner.slots.read().get(name).map(|s| s.generation)
    }

    /// Bind a name, bumping the slot generation on rebind
    pub fn set(&self, name: impl Into<String>, value: Value) {
        let name = name.into();
        let mut slots = self.inner.slots.write();
        match slots.get_mut(&name) {
            Some(slot) => {
                slot.value = value;
                slot.generation += 1;
            }
            None => {
                slots.insert(
                    name,
                    Slot {
                        value,
                        generation: 0,
                    },
                );
            }
        }
    }

    /// Resolve a name here, then in builtins
    pub fn resolve(&self, name: &str) -> Option<Resolved> {
        if let Some(slot) = self.inner.slots.read().get(name) {
            return Some(Resolved {
                value: slot.value.clone(),
                namespace: self.clone(),
                generation: slot.generation,
            });
        }
        self.inner.builtins.as_ref().and_then(|b| b.resolve(name))
    }

    /// All names bound directly in this namespace
    pub fn names(&self) -> Vec<String> {
        self.inner.slots.read().keys().cloned().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.slots.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.slots.read().is_empty()
    }

    /// Handle identity
    #[inline]
    pub fn same(&self, other: &Namespace) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("len", &self.len())
            .field("has_builtins", &self.inner.builtins.is_some())
            .finish()
    }
}
