//! Shared fixtures for integration tests: small model functions assembled
//! with the chunk builder and bound into a fresh module namespace.
#![allow(dead_code)]

use std::sync::Arc;

use tracejit::bytecode::{ChunkBuilder, Opcode};
use tracejit::host::{Cell, Function, Host, HostResult, Module, Namespace, Param, Value};

/// Call a module-level binding by name, the way user code would
pub fn call(host: &Host, ns: &Namespace, name: &str, args: &[Value]) -> HostResult<Value> {
    host.call_global(ns, name, args)
}

/// simple_forward(x, scale, bias) = (x * scale + bias) + 1.0
pub fn install_simple_forward(ns: &Namespace) -> Arc<Function> {
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
    f
}

/// control_flow_forward(x, y):
///   z = x + y
///   if gt(z, 10) { z = z * 2 } else { z = z + 5 }
///   return z
pub fn install_control_flow_forward(ns: &Namespace) -> Arc<Function> {
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
    f
}

/// combine(x, y) = adder(x, y), where `adder` is a module-level binding
pub fn install_combine(ns: &Namespace) -> Arc<Function> {
    let mut b = ChunkBuilder::new("combine");
    b.emit_load_global("adder");
    b.emit_load_local("x");
    b.emit_load_local("y");
    b.emit_call(2);
    b.emit_return();
    let f = Function::new(
        "combine",
        vec![Param::required("x"), Param::required("y")],
        b.build_arc(),
        ns.clone(),
    );
    ns.set("combine", Value::Function(f.clone()));
    f
}

/// area(x) = math.pi * x, where `math` is a module global
pub fn install_area(ns: &Namespace) -> (Arc<Function>, Arc<Module>) {
    let math = Module::new("math");
    math.set_attr("pi", Value::Float(std::f64::consts::PI));
    ns.set("math", Value::Module(math.clone()));

    let mut b = ChunkBuilder::new("area");
    b.emit_load_global("math");
    b.emit_load_attr("pi");
    b.emit_load_local("x");
    b.emit(Opcode::Mul);
    b.emit_return();
    let f = Function::new(
        "area",
        vec![Param::required("x")],
        b.build_arc(),
        ns.clone(),
    );
    ns.set("area", Value::Function(f.clone()));
    (f, math)
}

/// add_k(x) = x + k, with k closed over in a cell
pub fn install_add_k(ns: &Namespace, k: Cell) -> Arc<Function> {
    let mut b = ChunkBuilder::new("add_k");
    b.emit_load_local("x");
    b.emit_load_deref("k");
    b.emit(Opcode::Add);
    b.emit_return();
    let f = Function::with_cells(
        "add_k",
        vec![Param::required("x")],
        b.build_arc(),
        ns.clone(),
        vec![("k".to_string(), k)],
    );
    ns.set("add_k", Value::Function(f.clone()));
    f
}

/// doubler(x) = x + x, written with `dup` - an opcode outside the traceable
/// family, so tracing always degenerates
pub fn install_doubler(ns: &Namespace) -> Arc<Function> {
    let mut b = ChunkBuilder::new("doubler");
    b.emit_load_local("x");
    b.emit(Opcode::Dup);
    b.emit(Opcode::Add);
    b.emit_return();
    let f = Function::new(
        "doubler",
        vec![Param::required("x")],
        b.build_arc(),
        ns.clone(),
    );
    ns.set("doubler", Value::Function(f.clone()));
    f
}

/// sum_all(items) = total of a list, via get_iter/for_iter - a loop, so the
/// trace degenerates but the VM executes it
pub fn install_sum_all(ns: &Namespace) -> Arc<Function> {
    let mut b = ChunkBuilder::new("sum_all");
    b.emit_load_const(Value::Long(0));
    b.emit_store_local("total");
    b.emit_load_local("items");
    b.emit(Opcode::GetIter);
    let loop_top = b.mark();
    let done = b.reserve_jump(Opcode::ForIter);
    b.emit_store_local("item");
    b.emit_load_local("total");
    b.emit_load_local("item");
    b.emit(Opcode::Add);
    b.emit_store_local("total");
    b.emit_jump_to(Opcode::Jump, loop_top);
    b.patch_jump(done);
    b.emit_load_local("total");
    b.emit_return();
    let f = Function::new(
        "sum_all",
        vec![Param::required("items")],
        b.build_arc(),
        ns.clone(),
    );
    ns.set("sum_all", Value::Function(f.clone()));
    f
}
