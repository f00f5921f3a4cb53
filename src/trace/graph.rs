//! Dataflow IR: nodes and the value graph.
//!
//! A trace is a flat, append-only sequence of [`Node`]s in topological
//! order: every operand reference points at an earlier node, and the
//! executor evaluates the sequence front to back. Nodes are never mutated
//! after creation; [`NodeId`]s are plain indices into the owning graph.

use crate::host::error::HostResult;
use crate::host::value::{self, Value};

/// Index of a node within its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Node opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOp {
    /// Formal parameter, bound at invocation
    Placeholder,
    /// Literal value snapshot
    Const,
    /// Symbolic read of a local with no known defining node (debug path)
    GetLocal,
    /// Record of a local write; no executor semantics
    StoreFast,
    /// Attribute read from a base value
    GetAttr,
    /// Sequence element read
    GetIndex,
    /// Call of a [`Callee`]
    CallFunction,
    /// Closed-over binding read with no constant snapshot
    Deref,
    /// Unique terminator; its first argument is the return value
    Output,
    /// Reserved for inline guard nodes
    Guard,
}

/// The four traced arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    /// Evaluate with host arithmetic semantics
    pub fn apply(self, l: &Value, r: &Value) -> HostResult<Value> {
        match self {
            BinaryOp::Add => value::arith_add(l, r),
            BinaryOp::Sub => value::arith_sub(l, r),
            BinaryOp::Mul => value::arith_mul(l, r),
            BinaryOp::Div => value::arith_div(l, r),
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
        }
    }
}

/// Callable payload of a `call_function` node.
///
/// A call target is either a *known* callable captured at trace time or one
/// of the tracer's own intrinsics. Opaque callables (not resolvable at
/// trace time) go through `Apply`/`ApplyEx`, which take the callable as the
/// first runtime argument.
#[derive(Debug, Clone)]
pub enum Callee {
    /// A concrete callable value snapshotted at trace time
    Value(Value),
    /// One of the four arithmetic operators
    Binary(BinaryOp),
    /// `phi_select(cond, v_true, v_false)`
    PhiSelect,
    /// Variadic list constructor from element values
    MakeList,
    /// Copy an existing sequence into a fresh list
    SeqToList,
    /// Map constructor over a sequence of `[key, value]` pairs
    MakeMap,
    /// Generic call: `(callable, args...)`
    Apply,
    /// Generic extended call: `(callable, args_list, kwargs_map_or_nil)`
    ApplyEx,
}

impl std::fmt::Display for Callee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Callee::Value(v) => write!(f, "{}", v),
            Callee::Binary(op) => write!(f, "{}", op.mnemonic()),
            Callee::PhiSelect => write!(f, "phi_select"),
            Callee::MakeList => write!(f, "make_list"),
            Callee::SeqToList => write!(f, "seq_to_list"),
            Callee::MakeMap => write!(f, "make_map"),
            Callee::Apply => write!(f, "apply"),
            Callee::ApplyEx => write!(f, "apply_ex"),
        }
    }
}

/// Opcode-specific payload of a node
#[derive(Debug, Clone)]
pub enum Target {
    /// No payload (`output`)
    None,
    /// A variable name (`placeholder`, `get_local`, `store_fast`, `deref`)
    Name(String),
    /// A snapshotted literal (`const`)
    Const(Value),
    /// An attribute name (`get_attr`)
    Attr(String),
    /// A sequence index, negative permitted (`get_index`)
    Index(i64),
    /// A callable (`call_function`)
    Callee(Callee),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::None => write!(f, "-"),
            Target::Name(n) => write!(f, "{}", n),
            Target::Const(v) => write!(f, "{}", v),
            Target::Attr(a) => write!(f, ".{}", a),
            Target::Index(i) => write!(f, "[{}]", i),
            Target::Callee(c) => write!(f, "{}", c),
        }
    }
}

/// An argument position: a node reference, a literal, or a nested container
#[derive(Debug, Clone)]
pub enum Operand {
    Node(NodeId),
    Const(Value),
    List(Vec<Operand>),
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Node(id) => write!(f, "{}", id),
            Operand::Const(v) => write!(f, "{}", v),
            Operand::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A single IR value
#[derive(Debug, Clone)]
pub struct Node {
    pub op: NodeOp,
    pub target: Target,
    pub args: Vec<Operand>,
    pub kwargs: Vec<(String, Operand)>,
    /// Debug/bind label; placeholders carry their parameter name here
    pub name: Option<String>,
}

/// Errors from graph validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// An operand references a node at or after its user
    ForwardReference { node: usize, referenced: usize },
    /// Not exactly one output node
    OutputCount(usize),
    /// A placeholder without a name, or with a duplicate name
    BadPlaceholder(usize),
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ForwardReference { node, referenced } => {
                write!(f, "node {} references later node {}", node, referenced)
            }
            Self::OutputCount(n) => write!(f, "expected exactly one output node, found {}", n),
            Self::BadPlaceholder(n) => write!(f, "placeholder {} unnamed or duplicated", n),
        }
    }
}

impl std::error::Error for GraphError {}

/// Append-only value graph in topological order
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Graph { nodes: Vec::new() }
    }

    /// Append a node and return its id
    pub fn create_node(
        &mut self,
        op: NodeOp,
        target: Target,
        args: Vec<Operand>,
        kwargs: Vec<(String, Operand)>,
        name: Option<String>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            op,
            target,
            args,
            kwargs,
            name,
        });
        id
    }

    /// Shorthand for a placeholder node
    pub fn placeholder(&mut self, name: &str) -> NodeId {
        self.create_node(
            NodeOp::Placeholder,
            Target::Name(name.to_string()),
            Vec::new(),
            Vec::new(),
            Some(name.to_string()),
        )
    }

    /// Shorthand for a constant snapshot
    pub fn constant(&mut self, value: Value, name: Option<String>) -> NodeId {
        self.create_node(NodeOp::Const, Target::Const(value), Vec::new(), Vec::new(), name)
    }

    /// Shorthand for a call node
    pub fn call(&mut self, callee: Callee, args: Vec<Operand>, name: Option<String>) -> NodeId {
        self.create_node(
            NodeOp::CallFunction,
            Target::Callee(callee),
            args,
            Vec::new(),
            name,
        )
    }

    /// Shorthand for the output terminator
    pub fn output(&mut self, value: NodeId) -> NodeId {
        self.create_node(
            NodeOp::Output,
            Target::None,
            vec![Operand::Node(value)],
            Vec::new(),
            Some("return".to_string()),
        )
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Nodes in insertion (topological) order
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The placeholder subsequence, in argument order
    pub fn placeholders(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.op == NodeOp::Placeholder)
            .map(|(id, _)| id)
            .collect()
    }

    /// Id of the output node, if one has been created
    pub fn output_node(&self) -> Option<NodeId> {
        self.nodes()
            .find(|(_, n)| n.op == NodeOp::Output)
            .map(|(id, _)| id)
    }

    /// Count nodes with a given op
    pub fn count_op(&self, op: NodeOp) -> usize {
        self.nodes.iter().filter(|n| n.op == op).count()
    }

    /// Check well-formedness: operand references strictly precede their
    /// users, exactly one output exists, placeholder names are unique and
    /// non-empty
    pub fn validate(&self) -> Result<(), GraphError> {
        fn check(op: &Operand, user: usize) -> Result<(), GraphError> {
            match op {
                Operand::Node(id) => {
                    if id.index() >= user {
                        Err(GraphError::ForwardReference {
                            node: user,
                            referenced: id.index(),
                        })
                    } else {
                        Ok(())
                    }
                }
                Operand::Const(_) => Ok(()),
                Operand::List(items) => items.iter().try_for_each(|item| check(item, user)),
            }
        }

        let mut seen_names = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for arg in &node.args {
                check(arg, i)?;
            }
            for (_, arg) in &node.kwargs {
                check(arg, i)?;
            }
            if node.op == NodeOp::Placeholder {
                match node.name.as_deref() {
                    Some(name) if !name.is_empty() && !seen_names.contains(&name) => {
                        seen_names.push(name);
                    }
                    _ => return Err(GraphError::BadPlaceholder(i)),
                }
            }
        }

        let outputs = self.count_op(NodeOp::Output);
        if outputs != 1 {
            return Err(GraphError::OutputCount(outputs));
        }
        Ok(())
    }
}

impl std::fmt::Display for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph {{")?;
        for (id, node) in self.nodes() {
            write!(f, "  {} = {:?} {}", id, node.op, node.target)?;
            if !node.args.is_empty() {
                write!(f, " (")?;
                for (i, arg) in node.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")?;
            }
            for (key, arg) in &node.kwargs {
                write!(f, " {}={}", key, arg)?;
            }
            if let Some(name) = &node.name {
                write!(f, "  ; {}", name)?;
            }
            writeln!(f)?;
        }
        write!(f, "}}")
    }
}
