//! Basic blocks and control-flow graph construction.
//!
//! Leaders are the first instruction, every branch target, and every
//! instruction immediately following a branch or a return. Blocks are the
//! contiguous ranges between leaders; block ranges partition the
//! instruction stream, so [`ControlFlowGraph::flatten`] reproduces decode
//! order exactly.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use super::decode::Instr;

/// A maximal straight-line instruction range
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Bytecode offset of this block's leader
    pub start: usize,
    /// Instructions in the block, in stream order
    pub instrs: Vec<Instr>,
    /// Successor block start offsets
    pub succs: Vec<usize>,
    /// Predecessor block start offsets
    pub preds: Vec<usize>,
}

impl BasicBlock {
    /// The block's final instruction
    #[inline]
    pub fn terminator(&self) -> Option<&Instr> {
        self.instrs.last()
    }
}

/// Errors from graph construction or validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfgError {
    /// No instructions to partition
    EmptyCode,
    /// A successor or predecessor edge names an unknown block
    UnknownBlock { from: usize, to: usize },
    /// Successor and predecessor lists disagree
    EdgeMismatch { from: usize, to: usize },
}

impl std::fmt::Display for CfgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyCode => write!(f, "cannot build a CFG over empty code"),
            Self::UnknownBlock { from, to } => {
                write!(f, "edge {} -> {} names an unknown block", from, to)
            }
            Self::EdgeMismatch { from, to } => {
                write!(f, "edge {} -> {} missing its inverse", from, to)
            }
        }
    }
}

impl std::error::Error for CfgError {}

/// Result of a reverse-postorder walk
#[derive(Debug, Clone)]
pub struct RpoOrder {
    /// Reachable block start offsets, reverse postorder from the entry
    pub order: Vec<usize>,
    /// First back-edge found, if the graph is cyclic
    pub back_edge: Option<(usize, usize)>,
}

/// Control-flow graph over decoded instructions
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    blocks: BTreeMap<usize, BasicBlock>,
    entry: usize,
}

impl ControlFlowGraph {
    /// Partition an instruction stream into blocks and wire the edges
    pub fn build(instrs: &[Instr]) -> Result<Self, CfgError> {
        if instrs.is_empty() {
            return Err(CfgError::EmptyCode);
        }

        let mut leaders = BTreeSet::new();
        leaders.insert(instrs[0].offset);
        for (idx, instr) in instrs.iter().enumerate() {
            if let Some(target) = instr.branch_target() {
                leaders.insert(target);
            }
            if instr.op.is_branch() || instr.op.is_terminator() {
                if let Some(next) = instrs.get(idx + 1) {
                    leaders.insert(next.offset);
                }
            }
        }

        let mut blocks = BTreeMap::new();
        let mut current: Option<BasicBlock> = None;
        for instr in instrs {
            if leaders.contains(&instr.offset) {
                if let Some(done) = current.take() {
                    blocks.insert(done.start, done);
                }
                current = Some(BasicBlock {
                    start: instr.offset,
                    instrs: Vec::new(),
                    succs: Vec::new(),
                    preds: Vec::new(),
                });
            }
            if let Some(block) = current.as_mut() {
                block.instrs.push(*instr);
            }
        }
        if let Some(done) = current.take() {
            blocks.insert(done.start, done);
        }

        // Successor edges from each terminator.
        let starts: Vec<usize> = blocks.keys().copied().collect();
        for (pos, &start) in starts.iter().enumerate() {
            let fallthrough = starts.get(pos + 1).copied();
            let block = &blocks[&start];
            let last = match block.terminator() {
                Some(last) => *last,
                None => continue,
            };
            let mut succs = Vec::new();
            if last.op.is_terminator() {
                // Returns end the function.
            } else if let Some(target) = last.branch_target() {
                if blocks.contains_key(&target) {
                    succs.push(target);
                }
                if last.op.is_conditional_branch() {
                    if let Some(fall) = fallthrough {
                        if !succs.contains(&fall) {
                            succs.push(fall);
                        }
                    }
                }
            } else if let Some(fall) = fallthrough {
                succs.push(fall);
            }
            if let Some(block) = blocks.get_mut(&start) {
                block.succs = succs;
            }
        }

        // Predecessors are the exact inverse.
        let edges: Vec<(usize, usize)> = blocks
            .iter()
            .flat_map(|(&from, b)| b.succs.iter().map(move |&to| (from, to)))
            .collect();
        for (from, to) in edges {
            if let Some(block) = blocks.get_mut(&to) {
                block.preds.push(from);
            }
        }

        let entry = instrs[0].offset;
        trace!(blocks = blocks.len(), entry, "built cfg");
        Ok(ControlFlowGraph { blocks, entry })
    }

    #[inline]
    pub fn entry(&self) -> usize {
        self.entry
    }

    #[inline]
    pub fn block(&self, start: usize) -> Option<&BasicBlock> {
        self.blocks.get(&start)
    }

    /// Blocks in ascending start-offset order
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Reverse-postorder over blocks reachable from the entry.
    ///
    /// Detects back-edges during the walk; the supported shapes are acyclic,
    /// so callers treat a back-edge as an unsupported structure.
    pub fn reverse_postorder(&self) -> RpoOrder {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: BTreeMap<usize, Color> =
            self.blocks.keys().map(|&k| (k, Color::White)).collect();
        let mut postorder = Vec::new();
        let mut back_edge = None;
        // Explicit stack with a visit/finish phase per block.
        let mut stack = vec![(self.entry, false)];
        while let Some((off, finished)) = stack.pop() {
            if finished {
                color.insert(off, Color::Black);
                postorder.push(off);
                continue;
            }
            match color.get(&off) {
                Some(Color::White) => {}
                _ => continue,
            }
            color.insert(off, Color::Gray);
            stack.push((off, true));
            if let Some(block) = self.blocks.get(&off) {
                for &succ in block.succs.iter().rev() {
                    match color.get(&succ) {
                        Some(Color::Gray) => {
                            if back_edge.is_none() {
                                back_edge = Some((off, succ));
                            }
                        }
                        Some(Color::White) => stack.push((succ, false)),
                        _ => {}
                    }
                }
            }
        }
        postorder.reverse();
        RpoOrder {
            order: postorder,
            back_edge,
        }
    }

    /// Concatenate block instruction ranges in offset order.
    ///
    /// Because blocks partition the stream, this reproduces the decoded
    /// instruction order exactly.
    pub fn flatten(&self) -> Vec<Instr> {
        self.blocks
            .values()
            .flat_map(|b| b.instrs.iter().copied())
            .collect()
    }

    /// Check structural invariants: edges name registered blocks and
    /// successor/predecessor lists are exact inverses
    pub fn validate(&self) -> Result<(), CfgError> {
        for (&from, block) in &self.blocks {
            for &to in &block.succs {
                let target = self
                    .blocks
                    .get(&to)
                    .ok_or(CfgError::UnknownBlock { from, to })?;
                if !target.preds.contains(&from) {
                    return Err(CfgError::EdgeMismatch { from, to });
                }
            }
            for &pred in &block.preds {
                let source = self
                    .blocks
                    .get(&pred)
                    .ok_or(CfgError::UnknownBlock { from: pred, to: from })?;
                if !source.succs.contains(&from) {
                    return Err(CfgError::EdgeMismatch { from: pred, to: from });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::ChunkBuilder;
    use crate::bytecode::decode::decode;
    use crate::bytecode::opcodes::Opcode;
    use crate::host::value::Value;

    /// if x { y = 1 } else { y = 2 }; return y
    fn diamond() -> Vec<Instr> {
        let mut b = ChunkBuilder::new("diamond");
        b.emit_load_local("x");
        let to_else = b.reserve_jump(Opcode::JumpIfFalse);
        b.emit_load_const(Value::Long(1));
        b.emit_store_local("y");
        let to_end = b.reserve_jump(Opcode::Jump);
        b.patch_jump(to_else);
        b.emit_load_const(Value::Long(2));
        b.emit_store_local("y");
        b.patch_jump(to_end);
        b.emit_load_local("y");
        b.emit_return();
        decode(&b.build()).unwrap()
    }

    #[test]
    fn test_diamond_partition() {
        let instrs = diamond();
        let cfg = ControlFlowGraph::build(&instrs).unwrap();
        assert_eq!(cfg.block_count(), 4);
        cfg.validate().unwrap();

        let entry = cfg.block(cfg.entry()).unwrap();
        assert_eq!(entry.succs.len(), 2);

        // Exactly one block (the join) has two predecessors.
        let joins: Vec<&BasicBlock> =
            cfg.blocks().filter(|b| b.preds.len() == 2).collect();
        assert_eq!(joins.len(), 1);
        assert!(joins[0]
            .terminator()
            .is_some_and(|t| t.op == Opcode::Return));
    }

    #[test]
    fn test_flatten_roundtrip() {
        let instrs = diamond();
        let cfg = ControlFlowGraph::build(&instrs).unwrap();
        assert_eq!(cfg.flatten(), instrs);
    }

    #[test]
    fn test_rpo_visits_preds_before_join() {
        let instrs = diamond();
        let cfg = ControlFlowGraph::build(&instrs).unwrap();
        let rpo = cfg.reverse_postorder();
        assert!(rpo.back_edge.is_none());
        assert_eq!(rpo.order.len(), 4);
        assert_eq!(rpo.order[0], cfg.entry());
        // The join comes after both branch arms.
        let join = cfg
            .blocks()
            .find(|b| b.preds.len() == 2)
            .map(|b| b.start)
            .unwrap();
        assert_eq!(*rpo.order.last().unwrap(), join);
    }

    #[test]
    fn test_unreachable_block_excluded_from_rpo() {
        let mut b = ChunkBuilder::new("dead");
        let skip = b.reserve_jump(Opcode::Jump);
        // Unreachable: follows an unconditional jump, nothing targets it.
        b.emit_load_const(Value::Long(0));
        b.emit(Opcode::Pop);
        b.patch_jump(skip);
        b.emit_load_const(Value::Long(1));
        b.emit_return();
        let instrs = decode(&b.build()).unwrap();
        let cfg = ControlFlowGraph::build(&instrs).unwrap();

        assert_eq!(cfg.block_count(), 3);
        let rpo = cfg.reverse_postorder();
        assert_eq!(rpo.order.len(), 2);
        // Flatten still covers the whole stream, including dead code.
        assert_eq!(cfg.flatten(), instrs);
    }

    #[test]
    fn test_loop_reports_back_edge() {
        let mut b = ChunkBuilder::new("looping");
        let top = b.mark();
        b.emit_load_local("x");
        b.emit(Opcode::Pop);
        b.emit_jump_to(Opcode::Jump, top);
        let instrs = decode(&b.build()).unwrap();
        let cfg = ControlFlowGraph::build(&instrs).unwrap();
        let rpo = cfg.reverse_postorder();
        assert!(rpo.back_edge.is_some());
    }

    #[test]
    fn test_empty_code_rejected() {
        assert_eq!(
            ControlFlowGraph::build(&[]).unwrap_err(),
            CfgError::EmptyCode
        );
    }
}
