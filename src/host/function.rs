//! User-defined host functions.

use std::sync::Arc;

use crate::bytecode::chunk::CodeChunk;

use super::error::{HostError, HostResult};
use super::namespace::Namespace;
use super::value::{Cell, Value};

/// A formal parameter
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<Value>,
    pub kw_only: bool,
}

impl Param {
    /// A required positional parameter
    pub fn required(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            default: None,
            kw_only: false,
        }
    }

    /// A positional parameter with a default
    pub fn with_default(name: impl Into<String>, default: Value) -> Self {
        Param {
            name: name.into(),
            default: Some(default),
            kw_only: false,
        }
    }

    /// A keyword-only parameter
    pub fn keyword_only(name: impl Into<String>, default: Option<Value>) -> Self {
        Param {
            name: name.into(),
            default,
            kw_only: true,
        }
    }
}

/// A bytecode function: code, signature, owning globals, captured cells
#[derive(Debug)]
pub struct Function {
    name: String,
    params: Vec<Param>,
    chunk: Arc<CodeChunk>,
    globals: Namespace,
    cells: Vec<(String, Cell)>,
}

impl Function {
    pub fn new(
        name: impl Into<String>,
        params: Vec<Param>,
        chunk: Arc<CodeChunk>,
        globals: Namespace,
    ) -> Arc<Self> {
        Arc::new(Function {
            name: name.into(),
            params,
            chunk,
            globals,
            cells: Vec::new(),
        })
    }

    /// As [`Function::new`], with closed-over cells
    pub fn with_cells(
        name: impl Into<String>,
        params: Vec<Param>,
        chunk: Arc<CodeChunk>,
        globals: Namespace,
        cells: Vec<(String, Cell)>,
    ) -> Arc<Self> {
        Arc::new(Function {
            name: name.into(),
            params,
            chunk,
            globals,
            cells,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    #[inline]
    pub fn chunk(&self) -> &Arc<CodeChunk> {
        &self.chunk
    }

    #[inline]
    pub fn globals(&self) -> &Namespace {
        &self.globals
    }

    #[inline]
    pub fn cells(&self) -> &[(String, Cell)] {
        &self.cells
    }

    /// Look up a captured cell by name
    pub fn cell(&self, name: &str) -> Option<&Cell> {
        self.cells
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    /// Bind actual arguments to parameter names.
    ///
    /// Positional arguments fill non-keyword-only parameters in declaration
    /// order; keyword arguments fill by name; remaining parameters take
    /// their defaults. The resulting pairs are in declaration order.
    pub fn bind(
        &self,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> HostResult<Vec<(String, Value)>> {
        let positional: Vec<&Param> = self.params.iter().filter(|p| !p.kw_only).collect();
        if args.len() > positional.len() {
            return Err(HostError::ArityMismatch {
                callee: self.name.clone(),
                expected: positional.len(),
                got: args.len(),
            });
        }

        let mut bound: Vec<(String, Option<Value>)> = self
            .params
            .iter()
            .map(|p| (p.name.clone(), None))
            .collect();
        for (i, arg) in args.iter().enumerate() {
            let name = &positional[i].name;
            if let Some(entry) = bound.iter_mut().find(|(n, _)| n == name) {
                entry.1 = Some(arg.clone());
            }
        }
        for (name, value) in kwargs {
            let entry = bound.iter_mut().find(|(n, _)| n == name).ok_or_else(|| {
                HostError::UnexpectedKeyword {
                    callee: self.name.clone(),
                    name: name.clone(),
                }
            })?;
            entry.1 = Some(value.clone());
        }

        let mut locals = Vec::with_capacity(self.params.len());
        for (param, (name, value)) in self.params.iter().zip(bound) {
            let value = match value.or_else(|| param.default.clone()) {
                Some(v) => v,
                None => {
                    return Err(HostError::MissingArgument {
                        callee: self.name.clone(),
                        name,
                    })
                }
            };
            locals.push((name, value));
        }
        Ok(locals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::ChunkBuilder;

    fn dummy() -> Arc<Function> {
        let mut builder = ChunkBuilder::new("f");
        builder.emit_load_const(Value::Nil);
        builder.emit_return();
        Function::new(
            "f",
            vec![
                Param::required("x"),
                Param::with_default("y", Value::Long(7)),
                Param::keyword_only("mode", Some(Value::str("fast"))),
            ],
            builder.build_arc(),
            Namespace::new(),
        )
    }

    #[test]
    fn test_bind_positional_and_defaults() {
        let f = dummy();
        let locals = f.bind(&[Value::Long(1)], &[]).unwrap();
        assert_eq!(
            locals,
            vec![
                ("x".to_string(), Value::Long(1)),
                ("y".to_string(), Value::Long(7)),
                ("mode".to_string(), Value::str("fast")),
            ]
        );
    }

    #[test]
    fn test_bind_keyword_overrides() {
        let f = dummy();
        let locals = f
            .bind(
                &[Value::Long(1), Value::Long(2)],
                &[("mode".to_string(), Value::str("slow"))],
            )
            .unwrap();
        assert_eq!(locals[2].1, Value::str("slow"));
        assert_eq!(locals[1].1, Value::Long(2));
    }

    #[test]
    fn test_bind_errors() {
        let f = dummy();
        assert!(matches!(
            f.bind(&[], &[]),
            Err(HostError::MissingArgument { .. })
        ));
        assert!(matches!(
            f.bind(&[Value::Nil, Value::Nil, Value::Nil], &[]),
            Err(HostError::ArityMismatch { .. })
        ));
        assert!(matches!(
            f.bind(&[Value::Nil], &[("bogus".to_string(), Value::Nil)]),
            Err(HostError::UnexpectedKeyword { .. })
        ));
    }
}
