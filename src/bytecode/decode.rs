//! Linear bytecode decoder.
//!
//! Decoding turns the byte stream of a [`CodeChunk`] into an ordered list
//! of [`Instr`] records, the input for basic-block construction and
//! symbolic interpretation. Decoded streams are immutable, so they are
//! cached process-wide by chunk content, with LRU eviction for bounded
//! memory usage.

use std::num::NonZeroUsize;
use std::sync::{Arc, LazyLock, RwLock};

use lru::LruCache;
use tracing::trace;

use super::chunk::{ChunkId, CodeChunk};
use super::opcodes::Opcode;

/// A decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    /// Byte offset of the opcode within the chunk
    pub offset: usize,
    pub op: Opcode,
    /// Immediate operand, zero-extended; 0 when the opcode takes none
    pub arg: u16,
}

impl Instr {
    /// Absolute branch target, if this instruction is a branch
    #[inline]
    pub fn branch_target(&self) -> Option<usize> {
        if self.op.is_branch() {
            Some(self.arg as usize)
        } else {
            None
        }
    }

    /// Offset of the instruction following this one
    #[inline]
    pub fn next_offset(&self) -> usize {
        self.offset + 1 + self.op.immediate_size()
    }
}

/// Errors produced by the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Byte does not encode any opcode
    InvalidOpcode { byte: u8, offset: usize },
    /// Chunk ends in the middle of an immediate
    TruncatedImmediate { offset: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidOpcode { byte, offset } => {
                write!(f, "invalid opcode 0x{:02x} at offset {}", byte, offset)
            }
            Self::TruncatedImmediate { offset } => {
                write!(f, "truncated immediate at offset {}", offset)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode an entire chunk into instruction order
pub fn decode(chunk: &CodeChunk) -> Result<Vec<Instr>, DecodeError> {
    let mut instrs = Vec::new();
    let mut offset = 0;
    let len = chunk.len();
    while offset < len {
        let byte = chunk
            .read_byte(offset)
            .ok_or(DecodeError::TruncatedImmediate { offset })?;
        let op = Opcode::from_byte(byte).ok_or(DecodeError::InvalidOpcode { byte, offset })?;
        let arg = match op.immediate_size() {
            0 => 0,
            1 => chunk
                .read_byte(offset + 1)
                .ok_or(DecodeError::TruncatedImmediate { offset })? as u16,
            _ => chunk
                .read_u16(offset + 1)
                .ok_or(DecodeError::TruncatedImmediate { offset })?,
        };
        instrs.push(Instr { offset, op, arg });
        offset += 1 + op.immediate_size();
    }
    trace!(chunk = chunk.name(), count = instrs.len(), "decoded chunk");
    Ok(instrs)
}

/// Process-wide cache of decoded instruction streams
static DECODE_CACHE: LazyLock<RwLock<LruCache<u64, Arc<Vec<Instr>>>>> = LazyLock::new(|| {
    let size = decode_cache_size();
    RwLock::new(LruCache::new(size))
});

fn decode_cache_size() -> NonZeroUsize {
    std::env::var("TRACEJIT_DECODE_CACHE_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .and_then(NonZeroUsize::new)
        .unwrap_or(NonZeroUsize::new(1024).expect("1024 is non-zero"))
}

/// Decode through the process-wide cache
///
/// Retracing decodes the same chunk repeatedly; the cache makes that a
/// lookup. Keyed by content hash, so structurally identical chunks share an
/// entry.
pub fn decode_cached(chunk: &CodeChunk) -> Result<Arc<Vec<Instr>>, DecodeError> {
    let key = ChunkId::from_chunk(chunk).as_u64();
    {
        let cache = DECODE_CACHE.read().expect("decode cache lock poisoned");
        if let Some(hit) = cache.peek(&key) {
            return Ok(Arc::clone(hit));
        }
    }
    let decoded = Arc::new(decode(chunk)?);
    let mut cache = DECODE_CACHE.write().expect("decode cache lock poisoned");
    cache.put(key, Arc::clone(&decoded));
    Ok(decoded)
}

/// Drop all cached decode results (mainly for tests)
pub fn clear_decode_cache() {
    if let Ok(mut cache) = DECODE_CACHE.write() {
        cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::ChunkBuilder;
    use crate::host::value::Value;

    fn sample() -> CodeChunk {
        let mut b = ChunkBuilder::new("sample");
        b.emit_load_local("x");
        b.emit_load_const(Value::Long(1));
        b.emit(Opcode::Add);
        b.emit_return();
        b.build()
    }

    #[test]
    fn test_decode_offsets() {
        let instrs = decode(&sample()).unwrap();
        let ops: Vec<Opcode> = instrs.iter().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::LoadLocal,
                Opcode::LoadConst,
                Opcode::Add,
                Opcode::Return
            ]
        );
        assert_eq!(instrs[0].offset, 0);
        assert_eq!(instrs[1].offset, 3);
        assert_eq!(instrs[2].offset, 6);
        assert_eq!(instrs[3].offset, 7);
        assert_eq!(instrs[2].next_offset(), 7);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut b = ChunkBuilder::new("bad");
        b.emit_return();
        let mut chunk = b.build();
        // Splice in an undefined byte.
        chunk = {
            let mut code = chunk.code().to_vec();
            code.insert(0, 0x99);
            let mut b = ChunkBuilder::new("bad");
            for byte in code {
                b.raw_byte(byte);
            }
            b.build()
        };
        assert!(matches!(
            decode(&chunk),
            Err(DecodeError::InvalidOpcode { byte: 0x99, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let mut b = ChunkBuilder::new("short");
        b.raw_byte(Opcode::Jump.to_byte());
        b.raw_byte(0x00);
        let chunk = b.build();
        assert!(matches!(
            decode(&chunk),
            Err(DecodeError::TruncatedImmediate { .. })
        ));
    }

    #[test]
    fn test_cache_shares_identical_chunks() {
        clear_decode_cache();
        let a = decode_cached(&sample()).unwrap();
        let b = decode_cached(&sample()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_branch_target() {
        let mut b = ChunkBuilder::new("j");
        b.emit_jump_to(Opcode::Jump, 5);
        let instrs = decode(&b.build()).unwrap();
        assert_eq!(instrs[0].branch_target(), Some(5));
    }
}
