//! tracejit - a tracing just-in-time specializer for a small dynamic host
//! runtime.
//!
//! The specializer observes a function the first time it is called, decodes
//! its stack bytecode, rebuilds a control-flow graph, symbolically executes
//! it into a dataflow IR with guards, and installs a wrapper in the
//! function's namespace. Later calls check the guards and replay the IR
//! directly; a failed guard invalidates the trace, retraces, and re-enters,
//! never changing what the caller observes.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                     Host runtime (host)                           │
//! │   Value · Namespace(generations) · Function · reference VM        │
//! └───────────────────────────────┬───────────────────────────────────┘
//!                                 │ call events
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                 Hook adapter (specialize::hook)                   │
//! │          resolve callable → first-trace pipeline                  │
//! └───────────────────────────────┬───────────────────────────────────┘
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │   Decoder → CFG (bytecode)  →  Symbolic interpreter (trace)       │
//! │        leaders, blocks, RPO       abstract stack, φ-merge,        │
//! │                                   guard emission                  │
//! └───────────────────────────────┬───────────────────────────────────┘
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │        Trace cache & wrapper dispatch (specialize)                │
//! │   guards pass → IR executor   ·   guard fails → retrace           │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use tracejit::bytecode::{ChunkBuilder, Opcode};
//! use tracejit::host::{Function, Host, Param, Value};
//! use tracejit::specialize::Specializer;
//!
//! // f(x) = x * 2 + 1
//! let host = Host::new();
//! let globals = host.namespace();
//! let mut b = ChunkBuilder::new("f");
//! b.emit_load_local("x");
//! b.emit_load_const(Value::Long(2));
//! b.emit(Opcode::Mul);
//! b.emit_load_const(Value::Long(1));
//! b.emit(Opcode::Add);
//! b.emit_return();
//! let f = Function::new("f", vec![Param::required("x")], b.build_arc(), globals.clone());
//! globals.set("f", Value::Function(f));
//!
//! let spec = Specializer::new(&host);
//! spec.register();
//!
//! // First call traces and installs the wrapper; later calls replay the IR.
//! assert_eq!(host.call_global(&globals, "f", &[Value::Long(20)]).unwrap(), Value::Long(41));
//! assert_eq!(host.call_global(&globals, "f", &[Value::Long(3)]).unwrap(), Value::Long(7));
//! assert_eq!(spec.stats().fast_path_calls, 1);
//!
//! spec.unregister();
//! ```

pub mod bytecode;
pub mod host;
pub mod specialize;
pub mod trace;

pub use host::{Cell, Function, Host, HostError, Module, Namespace, Param, Value, Vm};
pub use specialize::{HookBinding, Specializer, SpecializerStats};
pub use trace::{trace_function, Executor, Graph, GuardRecord, Trace};

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode::{ChunkBuilder, Opcode};

    #[test]
    fn test_trace_and_execute_smoke() {
        let host = Host::new();
        let globals = host.namespace();
        let mut b = ChunkBuilder::new("inc");
        b.emit_load_local("x");
        b.emit_load_const(Value::Long(1));
        b.emit(Opcode::Add);
        b.emit_return();
        let f = Function::new(
            "inc",
            vec![Param::required("x")],
            b.build_arc(),
            globals.clone(),
        );

        let trace = trace_function(&f).unwrap();
        trace.graph.validate().unwrap();

        let bindings = [("x".to_string(), Value::Long(41))].into_iter().collect();
        let result = Executor::new(&host).run(&trace.graph, &bindings).unwrap();
        assert_eq!(result, Value::Long(42));
    }
}
