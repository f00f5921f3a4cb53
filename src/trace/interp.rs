//! Symbolic interpreter: bytecode to dataflow IR.
//!
//! The tracer walks the CFG in reverse-postorder, simulating each block
//! over an abstract stack of node ids and a per-block `local name -> node`
//! map. At join blocks, locals that disagree across predecessors are merged
//! with a binary phi-select keyed by the dominating branch condition; joins
//! that cannot be expressed that way degrade to a `phi_unmerged` sentinel,
//! which keeps the trace installable but permanently failing.
//!
//! Tracing never errors on unsupported input: an opcode outside the
//! supported family records an `unhandled_opcode` sentinel and stops, and
//! the caller installs the resulting degenerate trace as a permanent miss.

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::bytecode::cfg::{BasicBlock, CfgError, ControlFlowGraph};
use crate::bytecode::decode::{decode_cached, DecodeError, Instr};
use crate::bytecode::opcodes::Opcode;
use crate::host::function::Function;
use crate::host::value::{Cell, Value};

use super::graph::{BinaryOp, Callee, Graph, NodeId, NodeOp, Operand, Target};
use super::guards::{AttrWitness, BoolWitness, GuardRecord};

/// A completed trace: the IR plus the guards that justify it
#[derive(Debug)]
pub struct Trace {
    pub graph: Graph,
    pub guards: Vec<GuardRecord>,
}

impl Trace {
    /// A degenerate trace contains a sentinel guard and can never replay
    pub fn is_degenerate(&self) -> bool {
        self.guards.iter().any(|g| g.is_sentinel())
    }
}

/// Errors that prevent tracing from starting at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    Decode(DecodeError),
    Cfg(CfgError),
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode failed: {}", e),
            Self::Cfg(e) => write!(f, "cfg construction failed: {}", e),
        }
    }
}

impl std::error::Error for TraceError {}

impl From<DecodeError> for TraceError {
    fn from(e: DecodeError) -> Self {
        TraceError::Decode(e)
    }
}

impl From<CfgError> for TraceError {
    fn from(e: CfgError) -> Self {
        TraceError::Cfg(e)
    }
}

/// Local-variable abstract state of a block boundary
type LocalMap = HashMap<String, NodeId>;

/// Trace a function into IR and guards
pub fn trace_function(func: &Arc<Function>) -> Result<Trace, TraceError> {
    let instrs = decode_cached(func.chunk())?;
    let cfg = ControlFlowGraph::build(&instrs)?;
    TraceBuilder::new(func).run(&cfg)
}

struct TraceBuilder<'f> {
    func: &'f Arc<Function>,
    graph: Graph,
    guards: Vec<GuardRecord>,
    /// Closure cells snapshotted at trace entry: name -> (cell, contents, generation)
    closed: HashMap<String, (Cell, Option<Value>, u64)>,
    /// Condition node consumed by each block's conditional terminator
    branch_conds: HashMap<usize, NodeId>,
    /// Set once the output node exists; a second return degenerates the trace
    has_output: bool,
    aborted: bool,
}

impl<'f> TraceBuilder<'f> {
    fn new(func: &'f Arc<Function>) -> Self {
        let closed = func
            .cells()
            .iter()
            .map(|(name, cell)| {
                (
                    name.clone(),
                    (cell.clone(), cell.get(), cell.generation()),
                )
            })
            .collect();
        TraceBuilder {
            func,
            graph: Graph::new(),
            guards: Vec::new(),
            closed,
            branch_conds: HashMap::new(),
            has_output: false,
            aborted: false,
        }
    }

    fn run(mut self, cfg: &ControlFlowGraph) -> Result<Trace, TraceError> {
        // Entry state: one placeholder per formal parameter, declaration order.
        let mut entry_state = LocalMap::new();
        for param in self.func.params() {
            let ph = self.graph.placeholder(&param.name);
            entry_state.insert(param.name.clone(), ph);
        }

        let rpo = cfg.reverse_postorder();
        if let Some((from, to)) = rpo.back_edge {
            // Loops are outside the supported shapes.
            debug!(function = self.func.name(), from, to, "back-edge rejected");
            if let Some(term) = cfg.block(from).and_then(BasicBlock::terminator) {
                self.guards.push(GuardRecord::UnhandledOpcode {
                    opname: term.op.mnemonic(),
                    offset: term.offset,
                });
            }
            return Ok(self.finish());
        }

        let mut out_states: HashMap<usize, LocalMap> = HashMap::new();
        for &off in &rpo.order {
            let Some(block) = cfg.block(off) else { continue };
            let in_state = if off == cfg.entry() {
                entry_state.clone()
            } else {
                self.merge_predecessors(cfg, block, &out_states)
            };
            let out_state = self.simulate_block(block, in_state);
            out_states.insert(off, out_state);
            if self.aborted {
                break;
            }
        }

        trace!(
            function = self.func.name(),
            nodes = self.graph.len(),
            guards = self.guards.len(),
            "trace complete"
        );
        Ok(self.finish())
    }

    fn finish(self) -> Trace {
        Trace {
            graph: self.graph,
            guards: self.guards,
        }
    }

    /// Merge already-visited predecessor out-states into a block in-state
    fn merge_predecessors(
        &mut self,
        cfg: &ControlFlowGraph,
        block: &BasicBlock,
        out_states: &HashMap<usize, LocalMap>,
    ) -> LocalMap {
        let visited: Vec<(usize, &LocalMap)> = block
            .preds
            .iter()
            .filter_map(|p| out_states.get(p).map(|s| (*p, s)))
            .collect();
        if visited.is_empty() {
            return LocalMap::new();
        }

        let names: Vec<&String> = visited
            .iter()
            .flat_map(|(_, s)| s.keys())
            .unique()
            .sorted()
            .collect();

        let mut state = LocalMap::new();
        for name in names {
            let supplied: Vec<(usize, NodeId)> = visited
                .iter()
                .filter_map(|(p, s)| s.get(name.as_str()).map(|id| (*p, *id)))
                .collect();
            let mut distinct: Vec<NodeId> = Vec::new();
            for (_, id) in &supplied {
                if !distinct.contains(id) {
                    distinct.push(*id);
                }
            }

            if distinct.len() == 1 {
                state.insert(name.clone(), distinct[0]);
                continue;
            }

            if distinct.len() == 2 && supplied.len() == 2 {
                if let Some(phi) =
                    self.try_phi(cfg, block, &supplied, &state)
                {
                    state.insert(name.clone(), phi);
                    continue;
                }
            }

            // Rule 3: keep the first value and emit a failing sentinel.
            debug!(local = name.as_str(), candidates = distinct.len(), "phi unmerged");
            state.insert(name.clone(), supplied[0].1);
            self.guards.push(GuardRecord::PhiUnmerged {
                local: name.clone(),
                candidates: distinct,
            });
        }
        state
    }

    /// Build a binary phi-select for a two-way disagreement, if a condition
    /// is discoverable
    fn try_phi(
        &mut self,
        cfg: &ControlFlowGraph,
        join: &BasicBlock,
        supplied: &[(usize, NodeId)],
        nascent: &LocalMap,
    ) -> Option<NodeId> {
        let preds = [supplied[0].0, supplied[1].0];

        if let Some((cond, sides)) = self.find_branch_cond(cfg, join.start, preds) {
            let true_val = supplied
                .iter()
                .find(|(p, _)| sides.get(p) == Some(&true))
                .map(|(_, id)| *id);
            let false_val = supplied
                .iter()
                .find(|(p, _)| sides.get(p) == Some(&false))
                .map(|(_, id)| *id);
            if let (Some(t), Some(f)) = (true_val, false_val) {
                return Some(self.graph.call(
                    Callee::PhiSelect,
                    vec![Operand::Node(cond), Operand::Node(t), Operand::Node(f)],
                    None,
                ));
            }
        }

        // Conventional-name heuristic: a local called `cond` in the state
        // merged so far. Argument order follows predecessor order.
        if let Some(&cond) = nascent.get("cond") {
            return Some(self.graph.call(
                Callee::PhiSelect,
                vec![
                    Operand::Node(cond),
                    Operand::Node(supplied[0].1),
                    Operand::Node(supplied[1].1),
                ],
                None,
            ));
        }

        None
    }

    /// Locate the conditional branch dominating a binary join and map each
    /// predecessor to the branch outcome that reaches it.
    ///
    /// Handles the two reducible shapes the tracer supports: a triangle
    /// (one predecessor is itself the branching block) and a diamond (both
    /// predecessors are direct successors of a common branching block).
    fn find_branch_cond(
        &self,
        cfg: &ControlFlowGraph,
        join: usize,
        preds: [usize; 2],
    ) -> Option<(NodeId, HashMap<usize, bool>)> {
        // Triangle: branch block c is a predecessor of the join, the other
        // predecessor sits on one arm.
        for (c, p) in [(preds[0], preds[1]), (preds[1], preds[0])] {
            let Some(&cond) = self.branch_conds.get(&c) else { continue };
            let Some((true_succ, false_succ)) = branch_targets(cfg, c) else {
                continue;
            };
            let arm_reaches = |s: usize| s == p || s == join;
            if !(arm_reaches(true_succ) && arm_reaches(false_succ)) {
                continue;
            }
            let mut sides = HashMap::new();
            sides.insert(p, p == true_succ);
            sides.insert(c, join == true_succ);
            return Some((cond, sides));
        }

        // Diamond: both predecessors are direct successors of the branch.
        let p0 = cfg.block(preds[0])?;
        let p1 = cfg.block(preds[1])?;
        for c in p0.preds.iter().filter(|c| p1.preds.contains(c)) {
            let Some(&cond) = self.branch_conds.get(c) else { continue };
            let Some((true_succ, false_succ)) = branch_targets(cfg, *c) else {
                continue;
            };
            if !(true_succ == preds[0] && false_succ == preds[1]
                || true_succ == preds[1] && false_succ == preds[0])
            {
                continue;
            }
            let mut sides = HashMap::new();
            sides.insert(preds[0], preds[0] == true_succ);
            sides.insert(preds[1], preds[1] == true_succ);
            return Some((cond, sides));
        }

        None
    }

    /// Symbolically execute one block; returns its out-state
    fn simulate_block(&mut self, block: &BasicBlock, in_state: LocalMap) -> LocalMap {
        let chunk = self.func.chunk().clone();
        let mut stack: SmallVec<[NodeId; 8]> = SmallVec::new();
        let mut locals = in_state;

        for instr in &block.instrs {
            let op = instr.op;
            match op {
                Opcode::LoadLocal => {
                    let Some(name) = self.name_arg(instr) else { break };
                    let node = match locals.get(&name) {
                        Some(&id) => id,
                        None => self.graph.create_node(
                            NodeOp::GetLocal,
                            Target::Name(name.clone()),
                            Vec::new(),
                            Vec::new(),
                            Some(name),
                        ),
                    };
                    stack.push(node);
                }
                Opcode::StoreLocal => {
                    let Some(name) = self.name_arg(instr) else { break };
                    let Some(val) = self.pop(&mut stack, instr) else { break };
                    locals.insert(name.clone(), val);
                    self.graph.create_node(
                        NodeOp::StoreFast,
                        Target::Name(name.clone()),
                        vec![Operand::Node(val)],
                        Vec::new(),
                        Some(name),
                    );
                }
                Opcode::LoadConst => {
                    let Some(value) = chunk.get_constant(instr.arg).cloned() else {
                        self.abort(instr);
                        break;
                    };
                    let node = self.graph.constant(value, None);
                    stack.push(node);
                }
                Opcode::LoadGlobal => {
                    let Some(name) = self.name_arg(instr) else { break };
                    match self.func.globals().resolve(&name) {
                        Some(resolved) => {
                            let node = self
                                .graph
                                .constant(resolved.value.clone(), Some(name.clone()));
                            self.guards.push(GuardRecord::GlobalEq {
                                name,
                                namespace: resolved.namespace,
                                generation: resolved.generation,
                                snapshot: resolved.value,
                            });
                            stack.push(node);
                        }
                        None => {
                            // Unresolvable at trace time: keep the name symbolically.
                            let node = self
                                .graph
                                .constant(Value::str(name.clone()), Some(name));
                            stack.push(node);
                        }
                    }
                }
                Opcode::LoadDeref => {
                    let Some(name) = self.name_arg(instr) else { break };
                    match self.closed.get(&name) {
                        Some((cell, Some(value), generation)) => {
                            let node = self.graph.constant(
                                value.clone(),
                                Some(format!("deref_{}", name)),
                            );
                            self.guards.push(GuardRecord::DerefEq {
                                name,
                                cell: cell.clone(),
                                generation: *generation,
                                snapshot: value.clone(),
                            });
                            stack.push(node);
                        }
                        _ => {
                            let node = self.graph.create_node(
                                NodeOp::Deref,
                                Target::Name(name.clone()),
                                Vec::new(),
                                Vec::new(),
                                Some(name),
                            );
                            stack.push(node);
                        }
                    }
                }
                Opcode::LoadAttr => {
                    let Some(attr) = self.name_arg(instr) else { break };
                    let Some(base) = self.pop(&mut stack, instr) else { break };
                    let snapshot = match &self.graph.node(base).target {
                        Target::Const(Value::Module(m)) => m
                            .get_attr(&attr)
                            .and_then(|v| {
                                m.attr_generation(&attr).map(|gen| (m.clone(), v, gen))
                            }),
                        _ => None,
                    };
                    let node = match snapshot {
                        Some((module, value, generation)) => {
                            let label = format!("{}.{}", module.name(), attr);
                            let node =
                                self.graph.constant(value.clone(), Some(label));
                            self.guards.push(GuardRecord::AttrEq {
                                base,
                                attr,
                                witness: AttrWitness::Module(module),
                                generation,
                                snapshot: value,
                            });
                            node
                        }
                        None => self.graph.create_node(
                            NodeOp::GetAttr,
                            Target::Attr(attr.clone()),
                            vec![Operand::Node(base)],
                            Vec::new(),
                            Some(attr),
                        ),
                    };
                    stack.push(node);
                }
                Opcode::BuildList => {
                    let Some(elems) = self.pop_n(&mut stack, instr.arg as usize, instr)
                    else {
                        break;
                    };
                    let args = elems.into_iter().map(Operand::Node).collect();
                    let node = self.graph.call(Callee::MakeList, args, None);
                    stack.push(node);
                }
                Opcode::BuildMap => {
                    let count = instr.arg as usize;
                    let Some(flat) = self.pop_n(&mut stack, 2 * count, instr) else {
                        break;
                    };
                    let pairs = flat
                        .chunks_exact(2)
                        .map(|kv| {
                            Operand::List(vec![Operand::Node(kv[0]), Operand::Node(kv[1])])
                        })
                        .collect();
                    let node = self.graph.call(
                        Callee::MakeMap,
                        vec![Operand::List(pairs)],
                        None,
                    );
                    stack.push(node);
                }
                Opcode::UnpackEx => {
                    let before = (instr.arg >> 8) as usize;
                    let after = (instr.arg & 0xff) as usize;
                    let Some(seq) = self.pop(&mut stack, instr) else { break };
                    for i in 0..before {
                        let node = self.graph.create_node(
                            NodeOp::GetIndex,
                            Target::Index(i as i64),
                            vec![Operand::Node(seq)],
                            Vec::new(),
                            Some(format!("unpack_{}", i)),
                        );
                        stack.push(node);
                    }
                    let rest = self.graph.call(
                        Callee::SeqToList,
                        vec![Operand::Node(seq)],
                        Some("unpack_star".to_string()),
                    );
                    stack.push(rest);
                    for i in 0..after {
                        let node = self.graph.create_node(
                            NodeOp::GetIndex,
                            Target::Index(-((after - i) as i64)),
                            vec![Operand::Node(seq)],
                            Vec::new(),
                            Some(format!("unpack_{}", before + i)),
                        );
                        stack.push(node);
                    }
                }
                Opcode::Call => {
                    let Some(args) = self.pop_n(&mut stack, instr.arg as usize, instr)
                    else {
                        break;
                    };
                    let Some(callee) = self.pop(&mut stack, instr) else { break };
                    let node = self.emit_call(callee, args, Vec::new());
                    stack.push(node);
                }
                Opcode::CallKw => {
                    let Some(kw_names_node) = self.pop(&mut stack, instr) else { break };
                    let Some(names) = self.keyword_names(kw_names_node) else {
                        self.abort(instr);
                        break;
                    };
                    let argc = instr.arg as usize;
                    if names.len() > argc {
                        self.abort(instr);
                        break;
                    }
                    let Some(mut raw) = self.pop_n(&mut stack, argc, instr) else {
                        break;
                    };
                    let Some(callee) = self.pop(&mut stack, instr) else { break };
                    let kw_vals = raw.split_off(argc - names.len());
                    let kwargs = names
                        .into_iter()
                        .zip(kw_vals.into_iter().map(Operand::Node))
                        .collect();
                    let node = self.emit_call(callee, raw, kwargs);
                    stack.push(node);
                }
                Opcode::CallEx => {
                    let kwargs_node = if instr.arg & 0x01 != 0 {
                        match self.pop(&mut stack, instr) {
                            Some(n) => Some(n),
                            None => break,
                        }
                    } else {
                        None
                    };
                    let Some(args_node) = self.pop(&mut stack, instr) else { break };
                    let Some(callee) = self.pop(&mut stack, instr) else { break };
                    let kw_operand = match kwargs_node {
                        Some(n) => Operand::Node(n),
                        None => Operand::Const(Value::Nil),
                    };
                    let node = self.graph.call(
                        Callee::ApplyEx,
                        vec![
                            Operand::Node(callee),
                            Operand::Node(args_node),
                            kw_operand,
                        ],
                        None,
                    );
                    stack.push(node);
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                    let Some(r) = self.pop(&mut stack, instr) else { break };
                    let Some(l) = self.pop(&mut stack, instr) else { break };
                    let binop = match op {
                        Opcode::Add => BinaryOp::Add,
                        Opcode::Sub => BinaryOp::Sub,
                        Opcode::Mul => BinaryOp::Mul,
                        _ => BinaryOp::Div,
                    };
                    let node = self.graph.call(
                        Callee::Binary(binop),
                        vec![Operand::Node(l), Operand::Node(r)],
                        None,
                    );
                    stack.push(node);
                }
                Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                    let Some(cond) = self.pop(&mut stack, instr) else { break };
                    let witness = self.bool_witness(cond);
                    self.guards.push(GuardRecord::IsBool { cond, witness });
                    self.branch_conds.insert(block.start, cond);
                    // Flow itself is handled at block level.
                }
                Opcode::Jump => {}
                Opcode::Return => {
                    let Some(val) = self.pop(&mut stack, instr) else { break };
                    if self.has_output {
                        // A second reachable return cannot be represented.
                        self.abort(instr);
                        break;
                    }
                    self.graph.output(val);
                    self.has_output = true;
                    break;
                }
                Opcode::Pop => {
                    if self.pop(&mut stack, instr).is_none() {
                        break;
                    }
                }
                _ => {
                    self.abort(instr);
                    break;
                }
            }
        }

        locals
    }

    /// Call through a known callable when the callee node is a constant
    /// wrapping one; otherwise a generic apply
    fn emit_call(
        &mut self,
        callee: NodeId,
        args: Vec<NodeId>,
        kwargs: Vec<(String, Operand)>,
    ) -> NodeId {
        let known = match &self.graph.node(callee).target {
            Target::Const(v) if v.is_callable() => Some(v.clone()),
            _ => None,
        };
        match known {
            Some(value) => {
                let label = match &value {
                    Value::Native(n) => Some(n.name().to_string()),
                    Value::Function(f) => Some(f.name().to_string()),
                    _ => None,
                };
                let args = args.into_iter().map(Operand::Node).collect();
                self.graph.create_node(
                    NodeOp::CallFunction,
                    Target::Callee(Callee::Value(value)),
                    args,
                    kwargs,
                    label,
                )
            }
            None => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(Operand::Node(callee));
                full.extend(args.into_iter().map(Operand::Node));
                self.graph.create_node(
                    NodeOp::CallFunction,
                    Target::Callee(Callee::Apply),
                    full,
                    kwargs,
                    None,
                )
            }
        }
    }

    /// Keyword-name list carried by a constant node
    fn keyword_names(&self, node: NodeId) -> Option<Vec<String>> {
        match &self.graph.node(node).target {
            Target::Const(Value::List(items)) => items
                .iter()
                .map(|v| match v {
                    Value::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// Classify how a branch condition could be proven boolean at runtime
    fn bool_witness(&self, cond: NodeId) -> BoolWitness {
        let node = self.graph.node(cond);
        match node.op {
            NodeOp::Placeholder => match node.name.clone() {
                Some(name) => BoolWitness::Param(name),
                None => BoolWitness::Opaque,
            },
            NodeOp::CallFunction => match &node.target {
                Target::Callee(Callee::Value(Value::Native(native)))
                    if native.boolean_result() =>
                {
                    BoolWitness::NativePredicate
                }
                _ => BoolWitness::Opaque,
            },
            _ => BoolWitness::Opaque,
        }
    }

    fn name_arg(&mut self, instr: &Instr) -> Option<String> {
        match self.func.chunk().get_name(instr.arg) {
            Some(name) => Some(name.to_string()),
            None => {
                self.abort(instr);
                None
            }
        }
    }

    fn pop(&mut self, stack: &mut SmallVec<[NodeId; 8]>, instr: &Instr) -> Option<NodeId> {
        match stack.pop() {
            Some(id) => Some(id),
            None => {
                self.abort(instr);
                None
            }
        }
    }

    fn pop_n(
        &mut self,
        stack: &mut SmallVec<[NodeId; 8]>,
        n: usize,
        instr: &Instr,
    ) -> Option<Vec<NodeId>> {
        if stack.len() < n {
            self.abort(instr);
            return None;
        }
        let split = stack.len() - n;
        Some(stack.drain(split..).collect())
    }

    /// Record an unhandled-opcode sentinel and stop tracing
    fn abort(&mut self, instr: &Instr) {
        debug!(
            function = self.func.name(),
            op = instr.op.mnemonic(),
            offset = instr.offset,
            "trace aborted"
        );
        self.guards.push(GuardRecord::UnhandledOpcode {
            opname: instr.op.mnemonic(),
            offset: instr.offset,
        });
        self.aborted = true;
    }
}

fn branch_targets(cfg: &ControlFlowGraph, block_off: usize) -> Option<(usize, usize)> {
    let block = cfg.block(block_off)?;
    let term = block.terminator()?;
    let target = term.branch_target()?;
    if block.succs.len() != 2 {
        return None;
    }
    let other = block.succs.iter().copied().find(|&s| s != target)?;
    match term.op {
        Opcode::JumpIfTrue => Some((target, other)),
        Opcode::JumpIfFalse => Some((other, target)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::ChunkBuilder;
    use crate::host::function::Param;
    use crate::host::natives;
    use crate::host::namespace::Namespace;

    fn globals() -> Namespace {
        Namespace::with_builtins(&natives::builtins())
    }

    /// (x * scale + bias) + 1.0 via binary opcodes
    fn simple_forward(ns: &Namespace) -> Arc<Function> {
        let mut b = ChunkBuilder::new("simple_forward");
        b.emit_load_local("x");
        b.emit_load_local("scale");
        b.emit(Opcode::Mul);
        b.emit_load_local("bias");
        b.emit(Opcode::Add);
        b.emit_load_const(Value::Float(1.0));
        b.emit(Opcode::Add);
        b.emit_return();
        Function::new(
            "simple_forward",
            vec![
                Param::required("x"),
                Param::required("scale"),
                Param::required("bias"),
            ],
            b.build_arc(),
            ns.clone(),
        )
    }

    /// z = x + y; if gt(z, 10) { z = z * 2 } else { z = z + 5 }; z
    fn control_flow_forward(ns: &Namespace) -> Arc<Function> {
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
        Function::new(
            "control_flow_forward",
            vec![Param::required("x"), Param::required("y")],
            b.build_arc(),
            ns.clone(),
        )
    }

    #[test]
    fn test_straight_line_shape() {
        let func = simple_forward(&globals());
        let trace = trace_function(&func).unwrap();
        assert!(trace.guards.is_empty());
        assert!(!trace.is_degenerate());
        trace.graph.validate().unwrap();
        assert_eq!(trace.graph.count_op(NodeOp::Placeholder), 3);
        assert_eq!(trace.graph.count_op(NodeOp::CallFunction), 3);
        assert_eq!(trace.graph.count_op(NodeOp::Output), 1);
    }

    #[test]
    fn test_conditional_emits_phi_and_is_bool() {
        let func = control_flow_forward(&globals());
        let trace = trace_function(&func).unwrap();
        assert!(!trace.is_degenerate());
        trace.graph.validate().unwrap();

        let is_bools: Vec<&GuardRecord> = trace
            .guards
            .iter()
            .filter(|g| matches!(g, GuardRecord::IsBool { .. }))
            .collect();
        assert_eq!(is_bools.len(), 1);
        // The condition comes from a comparison native.
        assert!(matches!(
            is_bools[0],
            GuardRecord::IsBool {
                witness: BoolWitness::NativePredicate,
                ..
            }
        ));

        let phis = trace
            .graph
            .nodes()
            .filter(|(_, n)| {
                matches!(n.target, Target::Callee(Callee::PhiSelect))
            })
            .count();
        assert_eq!(phis, 1);
        assert!(trace
            .guards
            .iter()
            .any(|g| matches!(g, GuardRecord::GlobalEq { name, .. } if name == "gt")));
    }

    #[test]
    fn test_phi_argument_order_tracks_branch_sense() {
        let func = control_flow_forward(&globals());
        let trace = trace_function(&func).unwrap();
        let (_, phi) = trace
            .graph
            .nodes()
            .find(|(_, n)| matches!(n.target, Target::Callee(Callee::PhiSelect)))
            .unwrap();
        // True side is the then-arm (z * 2), false side the else-arm (z + 5).
        let side = |operand: &Operand| match operand {
            Operand::Node(id) => match &trace.graph.node(*id).target {
                Target::Callee(Callee::Binary(op)) => *op,
                other => panic!("unexpected phi input {:?}", other),
            },
            other => panic!("unexpected operand {:?}", other),
        };
        assert_eq!(side(&phi.args[1]), BinaryOp::Mul);
        assert_eq!(side(&phi.args[2]), BinaryOp::Add);
    }

    #[test]
    fn test_unhandled_opcode_degenerates() {
        let ns = globals();
        let mut b = ChunkBuilder::new("doubler");
        b.emit_load_local("x");
        b.emit(Opcode::Dup);
        b.emit(Opcode::Add);
        b.emit_return();
        let func = Function::new(
            "doubler",
            vec![Param::required("x")],
            b.build_arc(),
            ns,
        );
        let trace = trace_function(&func).unwrap();
        assert!(trace.is_degenerate());
        assert!(trace.guards.iter().any(|g| matches!(
            g,
            GuardRecord::UnhandledOpcode { opname: "dup", .. }
        )));
    }

    #[test]
    fn test_back_edge_degenerates() {
        let ns = globals();
        let mut b = ChunkBuilder::new("spin");
        let top = b.mark();
        b.emit_load_local("x");
        b.emit(Opcode::Pop);
        b.emit_jump_to(Opcode::Jump, top);
        let func = Function::new("spin", vec![Param::required("x")], b.build_arc(), ns);
        let trace = trace_function(&func).unwrap();
        assert!(trace.is_degenerate());
    }

    #[test]
    fn test_closure_snapshot_emits_deref_guard() {
        let ns = globals();
        let cell = Cell::new(Value::Long(10));
        let mut b = ChunkBuilder::new("offset");
        b.emit_load_local("x");
        b.emit_load_deref("k");
        b.emit(Opcode::Add);
        b.emit_return();
        let func = Function::with_cells(
            "offset",
            vec![Param::required("x")],
            b.build_arc(),
            ns,
            vec![("k".to_string(), cell)],
        );
        let trace = trace_function(&func).unwrap();
        assert!(!trace.is_degenerate());
        assert!(trace.guards.iter().any(|g| matches!(
            g,
            GuardRecord::DerefEq { name, snapshot, .. }
                if name == "k" && *snapshot == Value::Long(10)
        )));
        // The snapshot landed in the graph as a constant.
        assert!(trace.graph.nodes().any(|(_, n)| matches!(
            &n.target,
            Target::Const(v) if *v == Value::Long(10)
        )));
    }

    #[test]
    fn test_empty_deref_stays_symbolic() {
        let ns = globals();
        let mut b = ChunkBuilder::new("unbound");
        b.emit_load_deref("k");
        b.emit_return();
        let func = Function::with_cells(
            "unbound",
            Vec::new(),
            b.build_arc(),
            ns,
            vec![("k".to_string(), Cell::empty())],
        );
        let trace = trace_function(&func).unwrap();
        assert_eq!(trace.graph.count_op(NodeOp::Deref), 1);
        assert!(trace.guards.is_empty());
    }

    #[test]
    fn test_zero_param_constant_body() {
        let ns = globals();
        let mut b = ChunkBuilder::new("konst");
        b.emit_load_const(Value::Long(7));
        b.emit_return();
        let func = Function::new("konst", Vec::new(), b.build_arc(), ns);
        let trace = trace_function(&func).unwrap();
        trace.graph.validate().unwrap();
        assert!(trace.graph.placeholders().is_empty());
        assert!(trace.guards.is_empty());
    }

    #[test]
    fn test_unreachable_block_excluded_from_ir() {
        let ns = globals();
        let mut b = ChunkBuilder::new("dead_arm");
        let skip = b.reserve_jump(Opcode::Jump);
        b.emit_load_global("missing_helper");
        b.emit(Opcode::Pop);
        b.patch_jump(skip);
        b.emit_load_const(Value::Long(1));
        b.emit_return();
        let func = Function::new("dead_arm", Vec::new(), b.build_arc(), ns);
        let trace = trace_function(&func).unwrap();
        // The unreachable load never produced a node or a guard.
        assert!(trace.guards.is_empty());
        assert_eq!(trace.graph.count_op(NodeOp::Const), 1);
    }
}
