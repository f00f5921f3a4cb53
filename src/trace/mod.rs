//! Trace construction and replay.
//!
//! ```text
//!            ┌──────────────┐   graph + guards   ┌───────────────┐
//!  CFG ────> │ interp       │ ─────────────────> │ guards        │
//!            │ (symbolic)   │                    │ (compilation) │
//!            └──────────────┘                    └───────┬───────┘
//!                   │                                    │ checks
//!                   ▼                                    ▼
//!            ┌──────────────┐      bindings      ┌───────────────┐
//!            │ graph (IR)   │ <───────────────── │ wrapper (C6)  │
//!            └──────┬───────┘                    └───────────────┘
//!                   │ exec
//!                   ▼
//!               result value
//! ```

pub mod exec;
pub mod graph;
pub mod guards;
pub mod interp;

pub use exec::{Bindings, ExecError, Executor};
pub use graph::{BinaryOp, Callee, Graph, GraphError, Node, NodeId, NodeOp, Operand, Target};
pub use guards::{compile_guards, AttrWitness, BoolWitness, CompiledGuard, GuardRecord};
pub use interp::{trace_function, Trace, TraceError};
