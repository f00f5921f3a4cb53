//! Bytecode representation, decoding, and control-flow recovery.
//!
//! ```text
//! ChunkBuilder ──> CodeChunk ──> decode() ──> [Instr] ──> ControlFlowGraph
//!                     │                                        │
//!                     ▼                                        ▼
//!              reference VM (host::vm)              symbolic tracer (trace)
//! ```
//!
//! The same chunk feeds both executions: the reference VM consumes bytes
//! directly, while the tracer works over the decoded stream and the CFG.

pub mod cfg;
pub mod chunk;
pub mod decode;
pub mod opcodes;

pub use cfg::{BasicBlock, CfgError, ControlFlowGraph, RpoOrder};
pub use chunk::{ChunkBuilder, ChunkId, CodeChunk};
pub use decode::{decode, decode_cached, DecodeError, Instr};
pub use opcodes::Opcode;
