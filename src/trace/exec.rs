//! IR executor.
//!
//! Replays a traced graph against a binding map. Evaluation walks the node
//! sequence in graph order; targets with side effects therefore run in the
//! order the original bytecode would have run them. Errors raised by user
//! callables propagate unchanged; everything else is an executor-internal
//! error that the wrapper treats as a guard failure.

use std::collections::HashMap;

use tracing::trace;

use crate::host::error::HostError;
use crate::host::value::Value;
use crate::host::vm::{Host, Vm};

use super::graph::{Callee, Graph, Node, NodeId, NodeOp, Operand, Target};

/// Parameter name -> value map supplied by the wrapper
pub type Bindings = HashMap<String, Value>;

/// Errors from graph replay
#[derive(Debug, Clone, PartialEq)]
pub enum ExecError {
    /// A placeholder has no binding
    MissingBinding(String),
    /// A node op the executor does not evaluate
    UnsupportedOp(NodeOp),
    /// An operand referenced a node that produced no value
    Unevaluated(NodeId),
    /// The graph has no output node
    NoOutput,
    /// A user callable raised; surfaced unchanged to the caller
    Host(HostError),
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingBinding(name) => write!(f, "missing binding for placeholder '{}'", name),
            Self::UnsupportedOp(op) => write!(f, "unsupported node op {:?}", op),
            Self::Unevaluated(id) => write!(f, "operand references unevaluated node {}", id),
            Self::NoOutput => write!(f, "graph has no output node"),
            Self::Host(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ExecError {}

impl From<HostError> for ExecError {
    fn from(e: HostError) -> Self {
        ExecError::Host(e)
    }
}

impl ExecError {
    /// Whether the wrapper must surface this error to the caller unchanged
    /// (true) or treat it as a guard failure and retrace (false)
    pub fn is_user_error(&self) -> bool {
        matches!(self, ExecError::Host(_))
    }
}

/// Evaluates graphs against bindings
pub struct Executor<'h> {
    host: &'h Host,
}

impl<'h> Executor<'h> {
    pub fn new(host: &'h Host) -> Self {
        Executor { host }
    }

    /// Run a graph to its output value
    pub fn run(&self, graph: &Graph, bindings: &Bindings) -> Result<Value, ExecError> {
        let mut values: Vec<Option<Value>> = vec![None; graph.len()];

        for (id, node) in graph.nodes() {
            match node.op {
                NodeOp::Placeholder => {
                    let name = node.name.as_deref().unwrap_or("");
                    let v = bindings
                        .get(name)
                        .cloned()
                        .ok_or_else(|| ExecError::MissingBinding(name.to_string()))?;
                    values[id.index()] = Some(v);
                }
                NodeOp::Const => match &node.target {
                    Target::Const(v) => values[id.index()] = Some(v.clone()),
                    _ => return Err(ExecError::UnsupportedOp(node.op)),
                },
                NodeOp::GetLocal => match &node.target {
                    // Debug path: the symbolic name stands in for the value.
                    Target::Name(n) => values[id.index()] = Some(Value::str(n.clone())),
                    _ => return Err(ExecError::UnsupportedOp(node.op)),
                },
                NodeOp::GetAttr => {
                    let base = self.resolve(&node.args[0], &values)?;
                    let attr = match &node.target {
                        Target::Attr(a) => a,
                        _ => return Err(ExecError::UnsupportedOp(node.op)),
                    };
                    let v = match &base {
                        Value::Module(m) => m.get_attr(attr).ok_or_else(|| {
                            ExecError::Host(HostError::AttributeNotFound {
                                base: m.name().to_string(),
                                attr: attr.clone(),
                            })
                        })?,
                        other => {
                            return Err(ExecError::Host(HostError::AttributeNotFound {
                                base: other.type_name().to_string(),
                                attr: attr.clone(),
                            }))
                        }
                    };
                    values[id.index()] = Some(v);
                }
                NodeOp::GetIndex => {
                    let base = self.resolve(&node.args[0], &values)?;
                    let index = match node.target {
                        Target::Index(i) => i,
                        _ => return Err(ExecError::UnsupportedOp(node.op)),
                    };
                    values[id.index()] = Some(base.index(index)?);
                }
                NodeOp::CallFunction => {
                    let v = self.call(node, &values)?;
                    values[id.index()] = Some(v);
                }
                // Recorded for debugging; produce no value.
                NodeOp::StoreFast | NodeOp::Guard => {}
                NodeOp::Output => {
                    let result = self.resolve(&node.args[0], &values)?;
                    trace!(nodes = graph.len(), "executor: output reached");
                    return Ok(result);
                }
                NodeOp::Deref => return Err(ExecError::UnsupportedOp(node.op)),
            }
        }

        Err(ExecError::NoOutput)
    }

    fn call(&self, node: &Node, values: &[Option<Value>]) -> Result<Value, ExecError> {
        let callee = match &node.target {
            Target::Callee(c) => c,
            _ => return Err(ExecError::UnsupportedOp(node.op)),
        };
        let args: Vec<Value> = node
            .args
            .iter()
            .map(|a| self.resolve(a, values))
            .collect::<Result<_, _>>()?;
        let kwargs: Vec<(String, Value)> = node
            .kwargs
            .iter()
            .map(|(k, a)| Ok((k.clone(), self.resolve(a, values)?)))
            .collect::<Result<_, ExecError>>()?;

        match callee {
            Callee::Value(v) => Ok(Vm::new(self.host).call(v, &args, &kwargs)?),
            Callee::Binary(op) => {
                let [l, r] = two(&args)?;
                Ok(op.apply(l, r)?)
            }
            Callee::PhiSelect => {
                if args.len() != 3 {
                    return Err(ExecError::Host(HostError::ArityMismatch {
                        callee: "phi_select".to_string(),
                        expected: 3,
                        got: args.len(),
                    }));
                }
                let cond = args[0].as_bool().ok_or(ExecError::Host(HostError::TypeError {
                    expected: "bool",
                    got: args[0].type_name(),
                }))?;
                Ok(if cond { args[1].clone() } else { args[2].clone() })
            }
            Callee::MakeList => Ok(Value::list(args)),
            Callee::SeqToList => match args.as_slice() {
                [Value::List(items)] => Ok(Value::list(items.as_ref().clone())),
                [other] => Err(ExecError::Host(HostError::TypeError {
                    expected: "list",
                    got: other.type_name(),
                })),
                _ => Err(ExecError::Host(HostError::ArityMismatch {
                    callee: "seq_to_list".to_string(),
                    expected: 1,
                    got: args.len(),
                })),
            },
            Callee::MakeMap => match args.as_slice() {
                [Value::List(pairs)] => {
                    let mut out = Vec::with_capacity(pairs.len());
                    for pair in pairs.iter() {
                        match pair {
                            Value::List(kv) if kv.len() == 2 => {
                                out.push((kv[0].clone(), kv[1].clone()));
                            }
                            other => {
                                return Err(ExecError::Host(HostError::TypeError {
                                    expected: "key/value pair",
                                    got: other.type_name(),
                                }))
                            }
                        }
                    }
                    Ok(Value::map(out))
                }
                _ => Err(ExecError::Host(HostError::TypeError {
                    expected: "pair list",
                    got: "arguments",
                })),
            },
            Callee::Apply => {
                let (callable, rest) = args.split_first().ok_or(ExecError::Host(
                    HostError::ArityMismatch {
                        callee: "apply".to_string(),
                        expected: 1,
                        got: 0,
                    },
                ))?;
                Ok(Vm::new(self.host).call(callable, rest, &kwargs)?)
            }
            Callee::ApplyEx => {
                if args.len() != 3 {
                    return Err(ExecError::Host(HostError::ArityMismatch {
                        callee: "apply_ex".to_string(),
                        expected: 3,
                        got: args.len(),
                    }));
                }
                let callable = &args[0];
                let spread = match &args[1] {
                    Value::List(items) => items.as_ref().clone(),
                    other => {
                        return Err(ExecError::Host(HostError::TypeError {
                            expected: "list",
                            got: other.type_name(),
                        }))
                    }
                };
                let kw = match &args[2] {
                    Value::Nil => Vec::new(),
                    Value::Map(pairs) => pairs
                        .iter()
                        .map(|(k, v)| match k {
                            Value::Str(s) => Ok((s.clone(), v.clone())),
                            other => Err(ExecError::Host(HostError::TypeError {
                                expected: "str",
                                got: other.type_name(),
                            })),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    other => {
                        return Err(ExecError::Host(HostError::TypeError {
                            expected: "map",
                            got: other.type_name(),
                        }))
                    }
                };
                Ok(Vm::new(self.host).call(callable, &spread, &kw)?)
            }
        }
    }

    fn resolve(&self, operand: &Operand, values: &[Option<Value>]) -> Result<Value, ExecError> {
        match operand {
            Operand::Node(id) => values
                .get(id.index())
                .and_then(|v| v.clone())
                .ok_or(ExecError::Unevaluated(*id)),
            Operand::Const(v) => Ok(v.clone()),
            Operand::List(items) => {
                let resolved: Vec<Value> = items
                    .iter()
                    .map(|item| self.resolve(item, values))
                    .collect::<Result<_, _>>()?;
                Ok(Value::list(resolved))
            }
        }
    }
}

fn two(args: &[Value]) -> Result<[&Value; 2], ExecError> {
    match args {
        [l, r] => Ok([l, r]),
        _ => Err(ExecError::Host(HostError::ArityMismatch {
            callee: "binop".to_string(),
            expected: 2,
            got: args.len(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::graph::BinaryOp;

    fn bind(pairs: &[(&str, Value)]) -> Bindings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_straight_line_arithmetic() {
        let host = Host::new();
        let mut g = Graph::new();
        let x = g.placeholder("x");
        let two = g.constant(Value::Float(2.0), None);
        let prod = g.call(
            Callee::Binary(BinaryOp::Mul),
            vec![Operand::Node(x), Operand::Node(two)],
            None,
        );
        g.output(prod);

        let result = Executor::new(&host)
            .run(&g, &bind(&[("x", Value::Float(3.0))]))
            .unwrap();
        assert_eq!(result, Value::Float(6.0));
    }

    #[test]
    fn test_missing_binding() {
        let host = Host::new();
        let mut g = Graph::new();
        let x = g.placeholder("x");
        g.output(x);
        assert_eq!(
            Executor::new(&host).run(&g, &Bindings::new()),
            Err(ExecError::MissingBinding("x".to_string()))
        );
    }

    #[test]
    fn test_phi_select() {
        let host = Host::new();
        let mut g = Graph::new();
        let cond = g.placeholder("cond");
        let picked = g.call(
            Callee::PhiSelect,
            vec![
                Operand::Node(cond),
                Operand::Const(Value::Long(1)),
                Operand::Const(Value::Long(2)),
            ],
            None,
        );
        g.output(picked);

        let exec = Executor::new(&host);
        assert_eq!(
            exec.run(&g, &bind(&[("cond", Value::Bool(true))])).unwrap(),
            Value::Long(1)
        );
        assert_eq!(
            exec.run(&g, &bind(&[("cond", Value::Bool(false))])).unwrap(),
            Value::Long(2)
        );
    }

    #[test]
    fn test_make_map_from_pair_list() {
        let host = Host::new();
        let mut g = Graph::new();
        let k = g.constant(Value::str("k"), None);
        let v = g.constant(Value::Long(1), None);
        let map = g.call(
            Callee::MakeMap,
            vec![Operand::List(vec![Operand::List(vec![
                Operand::Node(k),
                Operand::Node(v),
            ])])],
            None,
        );
        g.output(map);

        let result = Executor::new(&host).run(&g, &Bindings::new()).unwrap();
        assert_eq!(result, Value::map(vec![(Value::str("k"), Value::Long(1))]));
    }

    #[test]
    fn test_get_index_negative() {
        let host = Host::new();
        let mut g = Graph::new();
        let seq = g.placeholder("seq");
        let last = g.create_node(
            NodeOp::GetIndex,
            Target::Index(-1),
            vec![Operand::Node(seq)],
            Vec::new(),
            None,
        );
        g.output(last);

        let list = Value::list(vec![Value::Long(1), Value::Long(2), Value::Long(3)]);
        let result = Executor::new(&host).run(&g, &bind(&[("seq", list)])).unwrap();
        assert_eq!(result, Value::Long(3));
    }

    #[test]
    fn test_user_error_propagates() {
        let host = Host::new();
        let mut g = Graph::new();
        let x = g.placeholder("x");
        let zero = g.constant(Value::Long(0), None);
        let div = g.call(
            Callee::Binary(BinaryOp::Div),
            vec![Operand::Node(x), Operand::Node(zero)],
            None,
        );
        g.output(div);

        let err = Executor::new(&host)
            .run(&g, &bind(&[("x", Value::Long(1))]))
            .unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(err, ExecError::Host(HostError::DivisionByZero));
    }

    #[test]
    fn test_deref_is_unsupported() {
        let host = Host::new();
        let mut g = Graph::new();
        let d = g.create_node(
            NodeOp::Deref,
            Target::Name("k".to_string()),
            Vec::new(),
            Vec::new(),
            None,
        );
        g.output(d);
        let err = Executor::new(&host).run(&g, &Bindings::new()).unwrap_err();
        assert_eq!(err, ExecError::UnsupportedOp(NodeOp::Deref));
        assert!(!err.is_user_error());
    }
}
