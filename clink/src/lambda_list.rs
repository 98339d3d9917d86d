//! Binding raw arguments through a lambda list.
//!
//! The binder fills one frame slot per parameter (required, then optional,
//! then keyword) and rebinds parameters declared special in the call's
//! dynamic scope. The closure then reads the frame positionally.
use std::fmt;

use crate::{Arity, CallError, DynamicScope, Symbol, Value};

pub trait LambdaListBinder: Send + Sync + fmt::Debug {
    fn arity(&self) -> Arity;

    /// Frame slots written by [`LambdaListBinder::bind`].
    fn frame_size(&self) -> usize;

    /// Binds `args` into `frame`. Returns the number of dynamic bindings
    /// pushed onto `scope`, which the scope unwinds when the call exits.
    fn bind(
        &self,
        function: &str,
        args: &[Value],
        frame: &mut [Value],
        scope: &mut DynamicScope<'_>,
    ) -> Result<usize, CallError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameter {
    pub symbol: Symbol,
    pub default: Value,
    pub special: bool,
}

impl Parameter {
    fn new(symbol: Symbol, default: Value) -> Self {
        Self {
            symbol,
            default,
            special: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyParameter {
    pub keyword: Symbol,
    pub parameter: Parameter,
}

/// `(req.. &optional (opt default).. &key ((:kw var) default).. [&allow-other-keys])`
#[derive(Debug, Clone, Default)]
pub struct LambdaList {
    required: Vec<Parameter>,
    optional: Vec<Parameter>,
    keys: Vec<KeyParameter>,
    allow_other_keys: bool,
}

impl LambdaList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, symbol: Symbol) -> Self {
        self.required.push(Parameter::new(symbol, Value::UNBOUND));
        self
    }

    pub fn optional(mut self, symbol: Symbol, default: Value) -> Self {
        self.optional.push(Parameter::new(symbol, default));
        self
    }

    pub fn key(mut self, keyword: Symbol, symbol: Symbol, default: Value) -> Self {
        self.keys.push(KeyParameter {
            keyword,
            parameter: Parameter::new(symbol, default),
        });
        self
    }

    pub fn allow_other_keys(mut self) -> Self {
        self.allow_other_keys = true;
        self
    }

    /// Declares every parameter named `symbol` special.
    pub fn special(mut self, symbol: Symbol) -> Self {
        self.parameters_mut()
            .filter(|p| p.symbol == symbol)
            .for_each(|p| p.special = true);
        self
    }

    fn parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.required
            .iter()
            .chain(&self.optional)
            .chain(self.keys.iter().map(|k| &k.parameter))
    }

    fn parameters_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.required
            .iter_mut()
            .chain(&mut self.optional)
            .chain(self.keys.iter_mut().map(|k| &mut k.parameter))
    }

    fn positional(&self) -> usize {
        self.required.len() + self.optional.len()
    }

    fn bind_keys(&self, function: &str, rest: &[Value], frame: &mut [Value]) -> Result<(), CallError> {
        if rest.len() % 2 != 0 {
            return Err(CallError::OddKeywordArguments {
                function: function.to_string(),
            });
        }
        let base = self.positional();
        for pair in rest.chunks_exact(2) {
            let (key, value) = (pair[0], pair[1]);
            let found = key
                .as_symbol()
                .and_then(|k| self.keys.iter().position(|p| p.keyword == k));
            match found {
                // leftmost occurrence wins
                Some(i) if frame[base + i].is_unbound() => frame[base + i] = value,
                Some(_) => {}
                None if self.allow_other_keys => {}
                None => {
                    return Err(CallError::UnknownKeyword {
                        function: function.to_string(),
                        keyword: key.describe(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl LambdaListBinder for LambdaList {
    fn arity(&self) -> Arity {
        let min = self.required.len();
        if self.keys.is_empty() {
            if self.optional.is_empty() {
                Arity::Exactly(min)
            } else {
                Arity::Range {
                    min,
                    max: Some(self.positional()),
                }
            }
        } else {
            Arity::Range { min, max: None }
        }
    }

    fn frame_size(&self) -> usize {
        self.positional() + self.keys.len()
    }

    fn bind(
        &self,
        function: &str,
        args: &[Value],
        frame: &mut [Value],
        scope: &mut DynamicScope<'_>,
    ) -> Result<usize, CallError> {
        let supplied = args.len();
        let positional = self.positional();
        let accepted = if self.keys.is_empty() {
            self.arity().accepts(supplied)
        } else {
            supplied >= self.required.len()
        };
        if !accepted {
            return Err(CallError::arity(function, self.arity(), supplied));
        }

        let given = supplied.min(positional);
        frame[..given].copy_from_slice(&args[..given]);
        if supplied > positional {
            self.bind_keys(function, &args[positional..], frame)?;
        }

        let mut specials = 0;
        for (slot, param) in frame.iter_mut().zip(self.parameters()) {
            if slot.is_unbound() {
                *slot = param.default;
            }
            if param.special {
                scope.bind(param.symbol, *slot);
                specials += 1;
            }
        }
        Ok(specials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DynamicBindingStack;

    fn sym(i: u32) -> Symbol {
        Symbol::from_index(i)
    }

    const X: u32 = 1;
    const Y: u32 = 2;
    const Z: u32 = 3;
    const KW_Z: u32 = 30;
    const KW_W: u32 = 31;
    const W: u32 = 4;

    fn list() -> LambdaList {
        LambdaList::new()
            .required(sym(X))
            .optional(sym(Y), Value::fixnum(2))
            .key(sym(KW_Z), sym(Z), Value::NIL)
            .key(sym(KW_W), sym(W), Value::fixnum(0))
    }

    fn bind(
        list: &LambdaList,
        args: &[Value],
    ) -> (Result<usize, CallError>, Vec<Value>, usize) {
        let mut stack = DynamicBindingStack::default();
        let mut scope = DynamicScope::enter(&mut stack);
        let mut frame = vec![Value::UNBOUND; list.frame_size()];
        let result = list.bind("f", args, &mut frame, &mut scope);
        let introduced = scope.introduced();
        (result, frame, introduced)
    }

    #[test]
    fn defaults_fill_missing_parameters() {
        let (r, frame, _) = bind(&list(), &[Value::fixnum(1)]);
        assert_eq!(r, Ok(0));
        assert_eq!(
            frame,
            vec![Value::fixnum(1), Value::fixnum(2), Value::NIL, Value::fixnum(0)]
        );
    }

    #[test]
    fn keywords_bind_by_name_leftmost_first() {
        let args = [
            Value::fixnum(1),
            Value::fixnum(5),
            Value::from_symbol(sym(KW_W)),
            Value::fixnum(7),
            Value::from_symbol(sym(KW_W)),
            Value::fixnum(8),
        ];
        let (r, frame, _) = bind(&list(), &args);
        assert_eq!(r, Ok(0));
        assert_eq!(frame[1], Value::fixnum(5));
        assert_eq!(frame[2], Value::NIL);
        assert_eq!(frame[3], Value::fixnum(7));
    }

    #[test]
    fn too_few_arguments_report_range() {
        let (r, _, _) = bind(&list(), &[]);
        let err = r.unwrap_err();
        assert_eq!(
            err.to_string(),
            "f: wrong number of arguments: expected at least 1, got 0"
        );
    }

    #[test]
    fn too_many_without_keys() {
        let list = LambdaList::new()
            .required(sym(X))
            .optional(sym(Y), Value::NIL);
        let (r, _, _) = bind(&list, &[Value::T, Value::T, Value::T]);
        assert_eq!(r, Err(CallError::arity("f", Arity::Range { min: 1, max: Some(2) }, 3)));
    }

    #[test]
    fn odd_and_unknown_keywords() {
        let (r, _, _) = bind(
            &list(),
            &[Value::T, Value::T, Value::from_symbol(sym(KW_Z))],
        );
        assert!(matches!(r, Err(CallError::OddKeywordArguments { .. })));

        let (r, _, _) = bind(
            &list(),
            &[Value::T, Value::T, Value::from_symbol(sym(99)), Value::T],
        );
        assert!(matches!(r, Err(CallError::UnknownKeyword { .. })));

        let relaxed = list().allow_other_keys();
        let (r, _, _) = bind(
            &relaxed,
            &[Value::T, Value::T, Value::from_symbol(sym(99)), Value::T],
        );
        assert_eq!(r, Ok(0));
    }

    #[test]
    fn special_parameters_are_bound_dynamically() {
        let list = list().special(sym(Y)).special(sym(Z));
        let mut stack = DynamicBindingStack::default();
        let mut scope = DynamicScope::enter(&mut stack);
        let mut frame = vec![Value::UNBOUND; list.frame_size()];
        let args = [Value::fixnum(1), Value::fixnum(9)];
        assert_eq!(list.bind("f", &args, &mut frame, &mut scope), Ok(2));
        assert_eq!(scope.introduced(), 2);
        assert_eq!(scope.value(sym(Y)), Some(Value::fixnum(9)));
        assert_eq!(scope.value(sym(Z)), Some(Value::NIL));
        assert_eq!(scope.value(sym(X)), None);
        drop(scope);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn arity_shapes() {
        assert_eq!(LambdaList::new().required(sym(X)).arity(), Arity::Exactly(1));
        assert_eq!(
            LambdaList::new().optional(sym(X), Value::NIL).arity(),
            Arity::Range { min: 0, max: Some(1) }
        );
        assert_eq!(list().arity(), Arity::Range { min: 1, max: None });
    }
}
