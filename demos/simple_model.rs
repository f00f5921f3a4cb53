//! Trace a straight-line model function, print its graph, then let the
//! specializer take over dispatch.
//!
//! ```text
//! cargo run --example simple_model
//! ```

use tracejit::bytecode::{ChunkBuilder, Opcode};
use tracejit::host::{Function, Host, Param, Value};
use tracejit::specialize::Specializer;
use tracejit::trace::trace_function;

/// simple_forward(x, scale, bias) = (x * scale + bias) + 1.0
fn install_simple_forward(host: &Host) -> (tracejit::host::Namespace, std::sync::Arc<Function>) {
    let ns = host.namespace();
    let mut b = ChunkBuilder::new("simple_forward");
    b.emit_load_local("x");
    b.emit_load_local("scale");
    b.emit(Opcode::Mul);
    b.emit_load_local("bias");
    b.emit(Opcode::Add);
    b.emit_load_const(Value::Float(1.0));
    b.emit(Opcode::Add);
    b.emit_return();
    let f = Function::new(
        "simple_forward",
        vec![
            Param::required("x"),
            Param::required("scale"),
            Param::required("bias"),
        ],
        b.build_arc(),
        ns.clone(),
    );
    ns.set("simple_forward", Value::Function(f.clone()));
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
    let (ns, f) = install_simple_forward(&host);

    println!("=== Bytecode ===");
    print!("{}", f.chunk().disassemble());

    let trace = trace_function(&f).expect("tracing failed");
    println!("\n=== Traced graph ===");
    println!("{}", trace.graph);
    println!("guards: {}", trace.guards.len());

    let spec = Specializer::new(&host);
    let binding = spec.register();
    println!("\nregistered via {:?}", binding);

    let args = [Value::Float(3.0), Value::Float(2.0), Value::Float(0.5)];
    let first = host.call_global(&ns, "simple_forward", &args).expect("call failed");
    println!("first call (traces + patches): {}", first);

    let second = host.call_global(&ns, "simple_forward", &args).expect("call failed");
    println!("second call (replays IR):      {}", second);

    println!("\nstats: {:?}", spec.stats());
    spec.unregister();
}
