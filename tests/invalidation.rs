//! Guard failure, invalidation, and retrace scenarios: rebinding globals,
//! replacing module attributes, and mutating closure cells between calls.

mod common;

use common::*;
use tracejit::host::{natives, Cell, Host, Value};
use tracejit::specialize::Specializer;

#[test]
fn global_rebind_triggers_retrace_with_new_semantics() {
    let host = Host::new();
    let ns = host.namespace();
    // `adder` starts as addition.
    ns.set("adder", host.builtins().get("add").unwrap());
    install_combine(&ns);

    let spec = Specializer::new(&host);
    spec.register();

    assert_eq!(
        call(&host, &ns, "combine", &[Value::Long(10), Value::Long(4)]).unwrap(),
        Value::Long(14)
    );
    assert_eq!(
        call(&host, &ns, "combine", &[Value::Long(10), Value::Long(4)]).unwrap(),
        Value::Long(14)
    );
    assert_eq!(spec.stats().fast_path_calls, 1);

    // Rebind the helper to subtraction; the snapshot is stale now.
    ns.set("adder", host.builtins().get("sub").unwrap());

    // The failing call already returns the rebound semantics.
    assert_eq!(
        call(&host, &ns, "combine", &[Value::Long(10), Value::Long(4)]).unwrap(),
        Value::Long(6)
    );
    let stats = spec.stats();
    assert_eq!(stats.guard_failures, 1);
    assert_eq!(stats.retraces, 1);
    assert_eq!(stats.traces, 2);

    // And the fresh trace replays on the fast path again.
    assert_eq!(
        call(&host, &ns, "combine", &[Value::Long(1), Value::Long(1)]).unwrap(),
        Value::Long(0)
    );
    assert_eq!(spec.stats().guard_failures, 1);
}

#[test]
fn attribute_replacement_triggers_retrace() {
    let host = Host::new();
    let ns = host.namespace();
    let (_f, math) = install_area(&ns);

    let spec = Specializer::new(&host);
    spec.register();

    let pi = std::f64::consts::PI;
    assert_eq!(
        call(&host, &ns, "area", &[Value::Float(2.0)]).unwrap(),
        Value::Float(pi * 2.0)
    );
    assert_eq!(
        call(&host, &ns, "area", &[Value::Float(2.0)]).unwrap(),
        Value::Float(pi * 2.0)
    );
    assert_eq!(spec.stats().fast_path_calls, 1);

    // Replace math.pi; the attr_eq guard goes stale.
    math.set_attr("pi", Value::Float(3.0));
    assert_eq!(
        call(&host, &ns, "area", &[Value::Float(2.0)]).unwrap(),
        Value::Float(6.0)
    );
    let stats = spec.stats();
    assert!(stats.guard_failures >= 1);
    assert_eq!(stats.retraces, 1);
}

#[test]
fn closure_cell_snapshot_guards_and_retraces() {
    let host = Host::new();
    let ns = host.namespace();
    let k = Cell::new(Value::Long(10));
    install_add_k(&ns, k.clone());

    let spec = Specializer::new(&host);
    spec.register();

    assert_eq!(call(&host, &ns, "add_k", &[Value::Long(5)]).unwrap(), Value::Long(15));
    assert_eq!(call(&host, &ns, "add_k", &[Value::Long(5)]).unwrap(), Value::Long(15));
    assert_eq!(spec.stats().fast_path_calls, 1);

    // Mutate the cell; the deref_eq guard fails and the retrace resnapshots.
    k.set(Value::Long(100));
    assert_eq!(call(&host, &ns, "add_k", &[Value::Long(5)]).unwrap(), Value::Long(105));
    assert_eq!(spec.stats().retraces, 1);
    assert_eq!(call(&host, &ns, "add_k", &[Value::Long(5)]).unwrap(), Value::Long(105));
    assert_eq!(spec.stats().fast_path_calls, 3);
}

#[test]
fn namespace_slot_is_coherent_across_invalidation() {
    let host = Host::new();
    let ns = host.namespace();
    ns.set("adder", host.builtins().get("add").unwrap());
    let original = install_combine(&ns);

    let spec = Specializer::new(&host);
    spec.register();

    call(&host, &ns, "combine", &[Value::Long(1), Value::Long(2)]).unwrap();
    let first_wrapper = ns.get("combine").unwrap();
    assert!(matches!(first_wrapper, Value::Native(_)));

    ns.set("adder", host.builtins().get("mul").unwrap());
    call(&host, &ns, "combine", &[Value::Long(3), Value::Long(4)]).unwrap();

    // After invalidation the slot holds a fresh wrapper, not the stale one
    // and not a dangling value.
    let second_wrapper = ns.get("combine").unwrap();
    assert!(matches!(second_wrapper, Value::Native(_)));
    assert_ne!(first_wrapper, second_wrapper);

    // A stale wrapper value still dispatches correctly through the current
    // cache if a call site held on to it.
    let mut vm = tracejit::host::Vm::new(&host);
    assert_eq!(
        vm.call(&first_wrapper, &[Value::Long(5), Value::Long(6)], &[]).unwrap(),
        Value::Long(30)
    );

    spec.unregister();
    match ns.get("combine") {
        Some(Value::Function(f)) => assert!(std::sync::Arc::ptr_eq(&f, &original)),
        other => panic!("expected original, got {:?}", other),
    }
}

#[test]
fn unresolvable_callables_are_ignored() {
    let host = Host::new();
    let ns = host.namespace();
    // A function reachable only through a local value: traced never.
    let f = install_simple_forward(&ns);
    // Remove its namespace binding before the first call.
    ns.set("simple_forward", Value::Nil);

    let spec = Specializer::new(&host);
    spec.register();

    let mut vm = tracejit::host::Vm::new(&host);
    let result = vm
        .call(
            &Value::Function(f.clone()),
            &[Value::Long(2), Value::Long(3), Value::Long(4)],
            &[],
        )
        .unwrap();
    assert_eq!(result, Value::Long(11));
    assert!(!spec.is_traced(&f));
    assert_eq!(spec.trace_count(), 0);
}

#[test]
fn natives_module_helpers_are_available() {
    // The builtins the fixtures rely on exist and behave.
    let ns = natives::builtins();
    assert!(matches!(ns.get("add"), Some(Value::Native(_))));
    assert!(matches!(ns.get("gt"), Some(Value::Native(_))));
}
