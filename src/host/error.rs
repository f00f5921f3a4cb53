//! Host runtime error types.
//!
//! A `HostError` is the host-language "exception": it is what the reference
//! interpreter raises, what native functions raise, and what the specializer
//! must surface unchanged when a replayed target fails.

/// Result type for host-level operations
pub type HostResult<T> = Result<T, HostError>;

/// Errors raised by the host runtime
#[derive(Debug, Clone, PartialEq)]
pub enum HostError {
    /// Global name lookup failed
    NameNotFound(String),
    /// Local variable read before assignment
    UnboundLocal(String),
    /// Closure cell read before the cell was filled
    UnboundCell(String),
    /// Attribute lookup failed
    AttributeNotFound { base: String, attr: String },
    /// Value is not callable
    NotCallable(&'static str),
    /// Value cannot be iterated
    NotIterable(&'static str),
    /// Wrong number of positional arguments
    ArityMismatch {
        callee: String,
        expected: usize,
        got: usize,
    },
    /// Required parameter was never bound
    MissingArgument { callee: String, name: String },
    /// Keyword argument does not match any parameter
    UnexpectedKeyword { callee: String, name: String },
    /// Type error in an operation
    TypeError {
        expected: &'static str,
        got: &'static str,
    },
    /// Division by zero
    DivisionByZero,
    /// Sequence index out of range
    IndexOutOfRange { index: i64, len: usize },
    /// Sequence unpack got fewer elements than required
    UnpackTooShort { need: usize, got: usize },
    /// Value stack underflow
    StackUnderflow,
    /// Invalid opcode byte
    InvalidOpcode(u8),
    /// Invalid constant pool index
    InvalidConstant(u16),
    /// Invalid name pool index
    InvalidName(u16),
    /// Instruction pointer ran off the end of the chunk
    IpOutOfBounds,
    /// Call depth limit exceeded
    RecursionLimit,
    /// Runtime error with message
    Runtime(String),
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NameNotFound(name) => write!(f, "name '{}' is not defined", name),
            Self::UnboundLocal(name) => {
                write!(f, "local variable '{}' referenced before assignment", name)
            }
            Self::UnboundCell(name) => write!(f, "closure cell '{}' is empty", name),
            Self::AttributeNotFound { base, attr } => {
                write!(f, "'{}' has no attribute '{}'", base, attr)
            }
            Self::NotCallable(ty) => write!(f, "'{}' value is not callable", ty),
            Self::NotIterable(ty) => write!(f, "'{}' value is not iterable", ty),
            Self::ArityMismatch {
                callee,
                expected,
                got,
            } => write!(
                f,
                "{}() takes {} positional arguments but {} were given",
                callee, expected, got
            ),
            Self::MissingArgument { callee, name } => {
                write!(f, "{}() missing required argument '{}'", callee, name)
            }
            Self::UnexpectedKeyword { callee, name } => {
                write!(f, "{}() got an unexpected keyword argument '{}'", callee, name)
            }
            Self::TypeError { expected, got } => {
                write!(f, "type error: expected {}, got {}", expected, got)
            }
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index {} out of range for length {}", index, len)
            }
            Self::UnpackTooShort { need, got } => {
                write!(f, "not enough values to unpack (need {}, got {})", need, got)
            }
            Self::StackUnderflow => write!(f, "value stack underflow"),
            Self::InvalidOpcode(b) => write!(f, "invalid opcode: 0x{:02x}", b),
            Self::InvalidConstant(i) => write!(f, "invalid constant index: {}", i),
            Self::InvalidName(i) => write!(f, "invalid name index: {}", i),
            Self::IpOutOfBounds => write!(f, "instruction pointer out of bounds"),
            Self::RecursionLimit => write!(f, "maximum call depth exceeded"),
            Self::Runtime(msg) => write!(f, "runtime error: {}", msg),
        }
    }
}

impl std::error::Error for HostError {}
