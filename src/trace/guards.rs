//! Guard records and their compilation into runtime checks.
//!
//! A guard is a predicate whose truth justifies continued use of a trace.
//! Records are emitted by the symbolic interpreter in program order and
//! compiled once per trace into pure closures over the binding map. A check
//! may return false on any uncertainty; returning true when the guarded
//! fact no longer holds is a correctness bug.
//!
//! Identity is checked through generation counters (see
//! [`crate::host::Namespace`]): a snapshot records `(slot, generation)` and
//! the check is a single integer compare against the live slot.

use std::sync::Arc;

use crate::host::namespace::Namespace;
use crate::host::value::{Cell, Module, Value};

use super::exec::Bindings;
use super::graph::NodeId;

/// How an `attr_eq` guard can reach its base value at check time
#[derive(Debug, Clone)]
pub enum AttrWitness {
    /// Base flows in through the named placeholder
    Param(String),
    /// Base was a module snapshotted at trace time
    Module(Arc<Module>),
    /// No way to re-derive the base; the check is unprovable
    Opaque,
}

/// How an `is_bool` guard can prove its condition boolean
#[derive(Debug, Clone)]
pub enum BoolWitness {
    /// Condition flows in through the named placeholder; check its type
    Param(String),
    /// Condition is produced by a native whose results are always boolean
    NativePredicate,
    /// No proof available; the check is unprovable
    Opaque,
}

/// A recorded guard
#[derive(Debug, Clone)]
pub enum GuardRecord {
    /// Global binding `name` must still be the snapshotted value
    GlobalEq {
        name: String,
        namespace: Namespace,
        generation: u64,
        snapshot: Value,
    },
    /// Closed-over cell must still hold the snapshotted value
    DerefEq {
        name: String,
        cell: Cell,
        generation: u64,
        snapshot: Value,
    },
    /// Attribute of the value flowing through `base` must still equal the snapshot
    AttrEq {
        base: NodeId,
        attr: String,
        witness: AttrWitness,
        generation: u64,
        snapshot: Value,
    },
    /// The value feeding a conditional branch must be boolean
    IsBool { cond: NodeId, witness: BoolWitness },
    /// Sentinel: a join could not be expressed as a binary phi
    PhiUnmerged {
        local: String,
        candidates: Vec<NodeId>,
    },
    /// Sentinel: tracing hit an opcode outside the supported family
    UnhandledOpcode { opname: &'static str, offset: usize },
}

impl GuardRecord {
    /// Sentinels always fail and mark the trace as degenerate
    #[inline]
    pub fn is_sentinel(&self) -> bool {
        matches!(
            self,
            GuardRecord::PhiUnmerged { .. } | GuardRecord::UnhandledOpcode { .. }
        )
    }
}

impl std::fmt::Display for GuardRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GlobalEq {
                name, generation, ..
            } => write!(f, "global_eq({}, gen {})", name, generation),
            Self::DerefEq {
                name, generation, ..
            } => write!(f, "deref_eq({}, gen {})", name, generation),
            Self::AttrEq {
                base,
                attr,
                generation,
                ..
            } => write!(f, "attr_eq({}, {}, gen {})", base, attr, generation),
            Self::IsBool { cond, .. } => write!(f, "is_bool({})", cond),
            Self::PhiUnmerged { local, .. } => write!(f, "phi_unmerged({})", local),
            Self::UnhandledOpcode { opname, offset } => {
                write!(f, "unhandled_opcode({}, {})", opname, offset)
            }
        }
    }
}

/// A guard record compiled into a runtime check
pub struct CompiledGuard {
    record: GuardRecord,
    check: Box<dyn Fn(&Bindings) -> bool + Send + Sync>,
}

impl CompiledGuard {
    #[inline]
    pub fn record(&self) -> &GuardRecord {
        &self.record
    }

    /// Evaluate the check against a binding map
    #[inline]
    pub fn check(&self, bindings: &Bindings) -> bool {
        (self.check)(bindings)
    }
}

impl std::fmt::Debug for CompiledGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompiledGuard({})", self.record)
    }
}

/// Compile every record into a check, preserving insertion order
pub fn compile_guards(records: &[GuardRecord]) -> Vec<CompiledGuard> {
    records.iter().map(compile_guard).collect()
}

fn compile_guard(record: &GuardRecord) -> CompiledGuard {
    let check: Box<dyn Fn(&Bindings) -> bool + Send + Sync> = match record {
        GuardRecord::GlobalEq {
            name,
            namespace,
            generation,
            ..
        } => {
            let name = name.clone();
            let ns = namespace.clone();
            let generation = *generation;
            Box::new(move |_| ns.generation_of(&name) == Some(generation))
        }
        GuardRecord::DerefEq {
            cell, generation, ..
        } => {
            let cell = cell.clone();
            let generation = *generation;
            Box::new(move |_| cell.generation() == generation)
        }
        GuardRecord::AttrEq {
            attr,
            witness,
            generation,
            snapshot,
            ..
        } => {
            let attr = attr.clone();
            let generation = *generation;
            match witness {
                AttrWitness::Module(module) => {
                    let module = Arc::clone(module);
                    Box::new(move |_| module.attr_generation(&attr) == Some(generation))
                }
                AttrWitness::Param(param) => {
                    let param = param.clone();
                    let snapshot = snapshot.clone();
                    Box::new(move |bindings| match bindings.get(&param) {
                        Some(Value::Module(m)) => match m.get_attr(&attr) {
                            Some(current) => current == snapshot,
                            None => false,
                        },
                        _ => false,
                    })
                }
                AttrWitness::Opaque => Box::new(|_| false),
            }
        }
        GuardRecord::IsBool { witness, .. } => match witness {
            BoolWitness::Param(param) => {
                let param = param.clone();
                Box::new(move |bindings| {
                    matches!(bindings.get(&param), Some(Value::Bool(_)))
                })
            }
            BoolWitness::NativePredicate => Box::new(|_| true),
            BoolWitness::Opaque => Box::new(|_| false),
        },
        GuardRecord::PhiUnmerged { .. } | GuardRecord::UnhandledOpcode { .. } => {
            Box::new(|_| false)
        }
    };
    CompiledGuard {
        record: record.clone(),
        check,
    }
}
