//! Trace a function with a conditional, showing the phi-select merge and
//! the boolean guard on the branch condition.
//!
//! ```text
//! cargo run --example control_flow_model
//! ```

use tracejit::bytecode::{ChunkBuilder, Opcode};
use tracejit::host::{Function, Host, Param, Value};
use tracejit::specialize::Specializer;
use tracejit::trace::trace_function;

/// control_flow_forward(x, y):
///   z = x + y
///   if gt(z, 10) { z = z * 2 } else { z = z + 5 }
///   return z
fn install_control_flow_forward(
    host: &Host,
) -> (tracejit::host::Namespace, std::sync::Arc<Function>) {
    let ns = host.namespace();
    let mut b = ChunkBuilder::new("control_flow_forward");
    b.emit_load_local("x");
    b.emit_load_local("y");
    b.emit(Opcode::Add);
    b.emit_store_local("z");
    b.emit_load_global("gt");
    b.emit_load_local("z");
    b.emit_load_const(Value::Long(10));
    b.emit_call(2);
    let to_else = b.reserve_jump(Opcode::JumpIfFalse);
    b.emit_load_local("z");
    b.emit_load_const(Value::Long(2));
    b.emit(Opcode::Mul);
    b.emit_store_local("z");
    let to_end = b.reserve_jump(Opcode::Jump);
    b.patch_jump(to_else);
    b.emit_load_local("z");
    b.emit_load_const(Value::Long(5));
    b.emit(Opcode::Add);
    b.emit_store_local("z");
    b.patch_jump(to_end);
    b.emit_load_local("z");
    b.emit_return();
    let f = Function::new(
        "control_flow_forward",
        vec![Param::required("x"), Param::required("y")],
        b.build_arc(),
        ns.clone(),
    );
    ns.set("control_flow_forward", Value::Function(f.clone()));
    (ns, f)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let host = Host::new();
    let (ns, f) = install_control_flow_forward(&host);

    let trace = trace_function(&f).expect("tracing failed");
    println!("=== Traced graph (control_flow_forward) ===");
    println!("{}", trace.graph);
    println!("\n=== Guards ===");
    for guard in &trace.guards {
        println!("  {}", guard);
    }

    let spec = Specializer::new(&host);
    spec.register();

    for (x, y) in [(3.0, 9.0), (1.0, 2.0), (8.0, 8.0)] {
        let result = host
            .call_global(
                &ns,
                "control_flow_forward",
                &[Value::Float(x), Value::Float(y)],
            )
            .expect("call failed");
        println!("control_flow_forward({}, {}) = {}", x, y, result);
    }

    println!("\nstats: {:?}", spec.stats());
    spec.unregister();
}
