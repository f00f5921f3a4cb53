//! Reference stack interpreter for host bytecode.
//!
//! The VM is the "original function": it executes a [`CodeChunk`] directly,
//! with no specialization. The specializer delegates to it whenever a trace
//! cannot be used, and the test suite uses it as the oracle for semantic
//! transparency. Before a user-defined function body runs, the VM fires the
//! installed [`CallHook`], which is how the specializer observes calls.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::trace;

use crate::bytecode::chunk::CodeChunk;
use crate::bytecode::opcodes::Opcode;

use super::error::{HostError, HostResult};
use super::function::Function;
use super::namespace::Namespace;
use super::natives;
use super::value::{self, IterState, Value};

/// Maximum call depth before the VM refuses to recurse further
pub const RECURSION_LIMIT: usize = 200;

/// A "call about to happen" notification
///
/// Delivered before the body of a user-defined function executes. The
/// current invocation always proceeds in the original function; whatever the
/// hook installs only affects later namespace lookups.
pub struct CallEvent<'a> {
    /// Code object being entered
    pub chunk: &'a Arc<CodeChunk>,
    /// Globals namespace of the function being entered
    pub globals: &'a Namespace,
    /// Bound locals (parameter name/value pairs, declaration order)
    pub locals: &'a [(String, Value)],
}

/// Receiver for call events
///
/// Implementations must tolerate events for callables they cannot resolve
/// and must never panic into the VM.
pub trait CallHook: Send + Sync {
    fn on_call(&self, event: &CallEvent<'_>);
}

/// The host process: builtins plus the hook installation point
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

struct HostInner {
    builtins: Namespace,
    hook: RwLock<Option<Arc<dyn CallHook>>>,
}

impl Host {
    /// Create a host with the standard natives installed
    pub fn new() -> Self {
        Host {
            inner: Arc::new(HostInner {
                builtins: natives::builtins(),
                hook: RwLock::new(None),
            }),
        }
    }

    #[inline]
    pub fn builtins(&self) -> &Namespace {
        &self.inner.builtins
    }

    /// Create a module-level globals namespace backed by the builtins
    pub fn namespace(&self) -> Namespace {
        Namespace::with_builtins(&self.inner.builtins)
    }

    /// Install the call hook, replacing any previous one
    pub fn install_hook(&self, hook: Arc<dyn CallHook>) {
        *self.inner.hook.write() = Some(hook);
    }

    /// Remove the call hook if one is installed
    pub fn clear_hook(&self) {
        *self.inner.hook.write() = None;
    }

    #[inline]
    pub fn hook(&self) -> Option<Arc<dyn CallHook>> {
        self.inner.hook.read().clone()
    }

    /// Resolve `name` in `ns` and call it. Convenience entry point used by
    /// demos and tests; equivalent to a `LoadGlobal` + `Call` sequence.
    pub fn call_global(&self, ns: &Namespace, name: &str, args: &[Value]) -> HostResult<Value> {
        let resolved = ns
            .resolve(name)
            .ok_or_else(|| HostError::NameNotFound(name.to_string()))?;
        Vm::new(self).call(&resolved.value, args, &[])
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytecode execution engine
pub struct Vm<'h> {
    host: &'h Host,
    depth: usize,
}

impl<'h> Vm<'h> {
    pub fn new(host: &'h Host) -> Self {
        Vm { host, depth: 0 }
    }

    /// Call any callable value
    pub fn call(
        &mut self,
        callee: &Value,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> HostResult<Value> {
        match callee {
            Value::Native(native) => native.call(args, kwargs),
            Value::Function(func) => self.call_function(func, args, kwargs),
            other => Err(HostError::NotCallable(other.type_name())),
        }
    }

    /// Call a user-defined function: bind, notify the hook, run the body
    pub fn call_function(
        &mut self,
        func: &Arc<Function>,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> HostResult<Value> {
        if self.depth >= RECURSION_LIMIT {
            return Err(HostError::RecursionLimit);
        }
        let bound = func.bind(args, kwargs)?;

        if let Some(hook) = self.host.hook() {
            hook.on_call(&CallEvent {
                chunk: func.chunk(),
                globals: func.globals(),
                locals: &bound,
            });
        }

        self.depth += 1;
        let result = self.execute(func, bound.into_iter().collect());
        self.depth -= 1;
        result
    }

    fn execute(
        &mut self,
        func: &Arc<Function>,
        mut locals: HashMap<String, Value>,
    ) -> HostResult<Value> {
        let chunk = func.chunk().clone();
        let code_len = chunk.len();
        let mut stack: SmallVec<[Value; 16]> = SmallVec::new();
        let mut ip = 0usize;

        trace!(function = func.name(), len = code_len, "vm: enter");

        while ip < code_len {
            let byte = chunk.read_byte(ip).ok_or(HostError::IpOutOfBounds)?;
            let op = Opcode::from_byte(byte).ok_or(HostError::InvalidOpcode(byte))?;
            let mut next_ip = ip + 1 + op.immediate_size();
            if next_ip > code_len {
                return Err(HostError::IpOutOfBounds);
            }

            match op {
                Opcode::Nop => {}
                Opcode::Pop => {
                    pop(&mut stack)?;
                }
                Opcode::Dup => {
                    let top = peek(&stack)?.clone();
                    stack.push(top);
                }
                Opcode::Swap => {
                    let a = pop(&mut stack)?;
                    let b = pop(&mut stack)?;
                    stack.push(a);
                    stack.push(b);
                }

                Opcode::LoadConst => {
                    let idx = read_u16(&chunk, ip)?;
                    let v = chunk
                        .get_constant(idx)
                        .ok_or(HostError::InvalidConstant(idx))?;
                    stack.push(v.clone());
                }
                Opcode::LoadLocal => {
                    let name = read_name(&chunk, ip)?;
                    let v = locals
                        .get(name)
                        .cloned()
                        .ok_or_else(|| HostError::UnboundLocal(name.to_string()))?;
                    stack.push(v);
                }
                Opcode::StoreLocal => {
                    let name = read_name(&chunk, ip)?;
                    let v = pop(&mut stack)?;
                    locals.insert(name.to_string(), v);
                }
                Opcode::LoadGlobal => {
                    let name = read_name(&chunk, ip)?;
                    let resolved = func
                        .globals()
                        .resolve(name)
                        .ok_or_else(|| HostError::NameNotFound(name.to_string()))?;
                    stack.push(resolved.value);
                }
                Opcode::LoadDeref => {
                    let name = read_name(&chunk, ip)?;
                    let cell = func
                        .cell(name)
                        .ok_or_else(|| HostError::UnboundCell(name.to_string()))?;
                    let v = cell
                        .get()
                        .ok_or_else(|| HostError::UnboundCell(name.to_string()))?;
                    stack.push(v);
                }
                Opcode::LoadAttr => {
                    let attr = read_name(&chunk, ip)?;
                    let base = pop(&mut stack)?;
                    let v = match &base {
                        Value::Module(m) => {
                            m.get_attr(attr).ok_or_else(|| HostError::AttributeNotFound {
                                base: m.name().to_string(),
                                attr: attr.to_string(),
                            })?
                        }
                        other => {
                            return Err(HostError::AttributeNotFound {
                                base: other.type_name().to_string(),
                                attr: attr.to_string(),
                            })
                        }
                    };
                    stack.push(v);
                }

                Opcode::BuildList => {
                    let n = read_u16(&chunk, ip)? as usize;
                    let items = pop_n(&mut stack, n)?;
                    stack.push(Value::list(items));
                }
                Opcode::BuildMap => {
                    let n = read_u16(&chunk, ip)? as usize;
                    let flat = pop_n(&mut stack, 2 * n)?;
                    let pairs = flat
                        .chunks_exact(2)
                        .map(|kv| (kv[0].clone(), kv[1].clone()))
                        .collect();
                    stack.push(Value::map(pairs));
                }
                Opcode::UnpackEx => {
                    let arg = read_u16(&chunk, ip)?;
                    let before = (arg >> 8) as usize;
                    let after = (arg & 0xff) as usize;
                    let seq = pop(&mut stack)?;
                    let items = match &seq {
                        Value::List(items) => items.as_ref().clone(),
                        other => {
                            return Err(HostError::TypeError {
                                expected: "list",
                                got: other.type_name(),
                            })
                        }
                    };
                    if items.len() < before + after {
                        return Err(HostError::UnpackTooShort {
                            need: before + after,
                            got: items.len(),
                        });
                    }
                    // Pushed in slot order: pre-star, star rest, post-star.
                    for item in items.iter().take(before) {
                        stack.push(item.clone());
                    }
                    let rest: Vec<Value> =
                        items[before..items.len() - after].to_vec();
                    stack.push(Value::list(rest));
                    for item in items.iter().skip(items.len() - after) {
                        stack.push(item.clone());
                    }
                }

                Opcode::Call => {
                    let argc = read_u8(&chunk, ip)? as usize;
                    let args = pop_n(&mut stack, argc)?;
                    let callee = pop(&mut stack)?;
                    let result = self.call(&callee, &args, &[])?;
                    stack.push(result);
                }
                Opcode::CallKw => {
                    let argc = read_u8(&chunk, ip)? as usize;
                    let kw_names = pop(&mut stack)?;
                    let names = keyword_names(&kw_names)?;
                    if names.len() > argc {
                        return Err(HostError::StackUnderflow);
                    }
                    let mut values = pop_n(&mut stack, argc)?;
                    let callee = pop(&mut stack)?;
                    let kw_values = values.split_off(argc - names.len());
                    let kwargs: Vec<(String, Value)> =
                        names.into_iter().zip(kw_values).collect();
                    let result = self.call(&callee, &values, &kwargs)?;
                    stack.push(result);
                }
                Opcode::CallEx => {
                    let flags = read_u8(&chunk, ip)?;
                    let kwargs = if flags & 0x01 != 0 {
                        let map = pop(&mut stack)?;
                        keyword_map(&map)?
                    } else {
                        Vec::new()
                    };
                    let args_seq = pop(&mut stack)?;
                    let args = match &args_seq {
                        Value::List(items) => items.as_ref().clone(),
                        other => {
                            return Err(HostError::TypeError {
                                expected: "list",
                                got: other.type_name(),
                            })
                        }
                    };
                    let callee = pop(&mut stack)?;
                    let result = self.call(&callee, &args, &kwargs)?;
                    stack.push(result);
                }

                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                    let r = pop(&mut stack)?;
                    let l = pop(&mut stack)?;
                    let result = match op {
                        Opcode::Add => value::arith_add(&l, &r)?,
                        Opcode::Sub => value::arith_sub(&l, &r)?,
                        Opcode::Mul => value::arith_mul(&l, &r)?,
                        _ => value::arith_div(&l, &r)?,
                    };
                    stack.push(result);
                }

                Opcode::Jump => {
                    next_ip = read_u16(&chunk, ip)? as usize;
                }
                Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                    let target = read_u16(&chunk, ip)? as usize;
                    let cond = pop(&mut stack)?;
                    let truth = cond.as_bool().ok_or(HostError::TypeError {
                        expected: "bool",
                        got: cond.type_name(),
                    })?;
                    if truth == (op == Opcode::JumpIfTrue) {
                        next_ip = target;
                    }
                }
                Opcode::GetIter => {
                    let seq = pop(&mut stack)?;
                    let items = match &seq {
                        Value::List(items) => items.as_ref().clone(),
                        other => return Err(HostError::NotIterable(other.type_name())),
                    };
                    stack.push(Value::Iter(IterState::new(items)));
                }
                Opcode::ForIter => {
                    let target = read_u16(&chunk, ip)? as usize;
                    let iter = match peek(&stack)? {
                        Value::Iter(state) => state.clone(),
                        other => return Err(HostError::NotIterable(other.type_name())),
                    };
                    match iter.advance() {
                        Some(item) => stack.push(item),
                        None => {
                            pop(&mut stack)?;
                            next_ip = target;
                        }
                    }
                }

                Opcode::Return => {
                    let v = pop(&mut stack)?;
                    trace!(function = func.name(), "vm: return");
                    return Ok(v);
                }
            }

            ip = next_ip;
        }

        Err(HostError::IpOutOfBounds)
    }
}

#[inline]
fn pop(stack: &mut SmallVec<[Value; 16]>) -> HostResult<Value> {
    stack.pop().ok_or(HostError::StackUnderflow)
}

#[inline]
fn peek(stack: &SmallVec<[Value; 16]>) -> HostResult<&Value> {
    stack.last().ok_or(HostError::StackUnderflow)
}

/// Pop `n` values, restoring pushed order
fn pop_n(stack: &mut SmallVec<[Value; 16]>, n: usize) -> HostResult<Vec<Value>> {
    if stack.len() < n {
        return Err(HostError::StackUnderflow);
    }
    let split = stack.len() - n;
    Ok(stack.drain(split..).collect())
}

fn read_u8(chunk: &CodeChunk, ip: usize) -> HostResult<u8> {
    chunk.read_byte(ip + 1).ok_or(HostError::IpOutOfBounds)
}

fn read_u16(chunk: &CodeChunk, ip: usize) -> HostResult<u16> {
    chunk.read_u16(ip + 1).ok_or(HostError::IpOutOfBounds)
}

fn read_name(chunk: &CodeChunk, ip: usize) -> HostResult<&str> {
    let idx = read_u16(chunk, ip)?;
    chunk.get_name(idx).ok_or(HostError::InvalidName(idx))
}

/// A keyword-name constant: a list of strings
fn keyword_names(v: &Value) -> HostResult<Vec<String>> {
    match v {
        Value::List(items) => items
            .iter()
            .map(|item| match item {
                Value::Str(s) => Ok(s.clone()),
                other => Err(HostError::TypeError {
                    expected: "str",
                    got: other.type_name(),
                }),
            })
            .collect(),
        other => Err(HostError::TypeError {
            expected: "list",
            got: other.type_name(),
        }),
    }
}

/// A spread kwargs map: string keys only
fn keyword_map(v: &Value) -> HostResult<Vec<(String, Value)>> {
    match v {
        Value::Map(pairs) => pairs
            .iter()
            .map(|(k, val)| match k {
                Value::Str(s) => Ok((s.clone(), val.clone())),
                other => Err(HostError::TypeError {
                    expected: "str",
                    got: other.type_name(),
                }),
            })
            .collect(),
        Value::Nil => Ok(Vec::new()),
        other => Err(HostError::TypeError {
            expected: "map",
            got: other.type_name(),
        }),
    }
}
