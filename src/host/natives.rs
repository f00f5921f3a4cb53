//! Built-in native functions.
//!
//! Natives are registered by name into a builtins namespace that backs
//! global resolution. Comparison natives are flagged `boolean_result`,
//! which lets guard compilation prove a branch condition boolean without a
//! runtime check.

use std::sync::Arc;

use super::error::{HostError, HostResult};
use super::namespace::Namespace;
use super::value::{self, NativeFn, Value};

/// Build a fresh builtins namespace with every standard native installed
pub fn builtins() -> Namespace {
    let ns = Namespace::new();
    install(&ns, "add", 2, false, |args| {
        value::arith_add(&args[0], &args[1])
    });
    install(&ns, "sub", 2, false, |args| {
        value::arith_sub(&args[0], &args[1])
    });
    install(&ns, "mul", 2, false, |args| {
        value::arith_mul(&args[0], &args[1])
    });
    install(&ns, "div", 2, false, |args| {
        value::arith_div(&args[0], &args[1])
    });
    install(&ns, "neg", 1, false, |args| match args[0].as_float() {
        Some(_) => value::arith_sub(&Value::Long(0), &args[0]),
        None => Err(type_err("number", &args[0])),
    });
    install(&ns, "abs", 1, false, |args| match &args[0] {
        Value::Long(n) => Ok(Value::Long(n.wrapping_abs())),
        Value::Float(x) => Ok(Value::Float(x.abs())),
        other => Err(type_err("number", other)),
    });
    install(&ns, "lt", 2, true, |args| cmp(args, |o| o.is_lt()));
    install(&ns, "le", 2, true, |args| cmp(args, |o| o.is_le()));
    install(&ns, "gt", 2, true, |args| cmp(args, |o| o.is_gt()));
    install(&ns, "ge", 2, true, |args| cmp(args, |o| o.is_ge()));
    install(&ns, "eq", 2, true, |args| {
        Ok(Value::Bool(args[0] == args[1]))
    });
    install(&ns, "ne", 2, true, |args| {
        Ok(Value::Bool(args[0] != args[1]))
    });
    install(&ns, "len", 1, false, |args| match &args[0] {
        Value::Str(s) => Ok(Value::Long(s.chars().count() as i64)),
        Value::List(items) => Ok(Value::Long(items.len() as i64)),
        Value::Map(pairs) => Ok(Value::Long(pairs.len() as i64)),
        other => Err(type_err("sequence", other)),
    });
    ns
}

/// Register a fixed-arity native into a namespace
pub fn install(
    ns: &Namespace,
    name: &str,
    arity: usize,
    boolean_result: bool,
    f: impl Fn(&[Value]) -> HostResult<Value> + Send + Sync + 'static,
) {
    let native = fixed_arity(name, arity, boolean_result, f);
    ns.set(name, Value::Native(native));
}

/// Wrap a positional-only implementation with arity and keyword checks
pub fn fixed_arity(
    name: &str,
    arity: usize,
    boolean_result: bool,
    f: impl Fn(&[Value]) -> HostResult<Value> + Send + Sync + 'static,
) -> Arc<NativeFn> {
    let owned = name.to_string();
    NativeFn::new(name, boolean_result, move |args, kwargs| {
        if let Some((kw, _)) = kwargs.first() {
            return Err(HostError::UnexpectedKeyword {
                callee: owned.clone(),
                name: kw.clone(),
            });
        }
        if args.len() != arity {
            return Err(HostError::ArityMismatch {
                callee: owned.clone(),
                expected: arity,
                got: args.len(),
            });
        }
        f(args)
    })
}

fn cmp(args: &[Value], pick: impl Fn(std::cmp::Ordering) -> bool) -> HostResult<Value> {
    value::compare_values(&args[0], &args[1]).map(|o| Value::Bool(pick(o)))
}

fn type_err(expected: &'static str, got: &Value) -> HostError {
    HostError::TypeError {
        expected,
        got: got.type_name(),
    }
}
