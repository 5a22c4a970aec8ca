// ABOUTME: User-defined macros and the compile-time template evaluator

use crate::error::CompileError;
use crate::value::{cons, make_proper, symbol, Value};
use std::collections::HashMap;

/// A user-defined compile-time transformer. The compiler invokes it with the
/// *unexpanded* argument list and recompiles whatever it returns.
///
/// Bodies run in a small template evaluator rather than on the target VM:
/// literals, quoting, quasiquote templates with unquote/splicing, `if`,
/// `cond`, `begin`, and a fixed set of list builtins. That subset is what
/// template-style macros use; anything outside it is reported as an
/// expansion error.
#[derive(Debug)]
pub struct MacroDef {
    name: String,
    params: Vec<String>,
    varargs: bool,
    body: Value,
}

impl MacroDef {
    /// `params`/`varargs` follow lambda formals: when `varargs` is set the
    /// last parameter binds the remaining arguments as a proper list.
    /// `body` is the list of body expressions, evaluated in order.
    pub fn new(name: &str, params: Vec<String>, varargs: bool, body: Value) -> MacroDef {
        MacroDef {
            name: name.to_string(),
            params,
            varargs,
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binds the unevaluated arguments to the formals and evaluates the body,
    /// returning the expansion for the compiler to start over on
    pub fn expand(&self, args: &Value) -> Result<Value, CompileError> {
        let items = args.unpack();
        let mut scope: HashMap<String, Value> = HashMap::new();

        if self.varargs {
            let required = self.params.len() - 1;
            if items.len() < required {
                return Err(CompileError::macro_expansion(
                    &self.name,
                    format!("expected at least {} arguments, got {}", required, items.len()),
                ));
            }
            for (param, arg) in self.params[..required].iter().zip(&items) {
                scope.insert(param.clone(), arg.clone());
            }
            scope.insert(
                self.params[required].clone(),
                make_proper(&items[required..]),
            );
        } else {
            if items.len() != self.params.len() {
                return Err(CompileError::macro_expansion(
                    &self.name,
                    format!(
                        "expected {} arguments, got {}",
                        self.params.len(),
                        items.len()
                    ),
                ));
            }
            for (param, arg) in self.params.iter().zip(&items) {
                scope.insert(param.clone(), arg.clone());
            }
        }

        let mut result = Value::Nil;
        for expr in self.body.unpack() {
            result = self.eval(&expr, &scope)?;
        }
        Ok(result)
    }

    // ========================================================================
    // Template evaluation
    // ========================================================================

    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError::macro_expansion(&self.name, message)
    }

    fn eval(&self, expr: &Value, scope: &HashMap<String, Value>) -> Result<Value, CompileError> {
        match expr {
            Value::Nil
            | Value::None
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::Complex { .. }
            | Value::Str(_)
            | Value::Keyword(_) => Ok(expr.clone()),

            Value::Symbol(s) => match s.as_str() {
                "nil" => Ok(Value::Nil),
                "None" => Ok(Value::None),
                name => scope
                    .get(name)
                    .cloned()
                    .ok_or_else(|| self.err(format!("unbound name {}", name))),
            },

            Value::Pair(p) => {
                let head = p.head();
                let tail = p.tail();

                if let Value::Symbol(s) = &head {
                    match s.as_str() {
                        "quote" => return self.nth_arg(&tail, 0),
                        "quasiquote" => {
                            let template = self.nth_arg(&tail, 0)?;
                            return self.quasi(&template, 1, scope);
                        }
                        "if" => return self.eval_if(&tail, scope),
                        "cond" => return self.eval_cond(&tail, scope),
                        "begin" => {
                            let mut result = Value::Nil;
                            for e in tail.unpack() {
                                result = self.eval(&e, scope)?;
                            }
                            return Ok(result);
                        }
                        _ => {}
                    }
                }

                // otherwise a call to one of the expansion-time builtins
                let name = match &head {
                    Value::Symbol(s) => s.as_str().to_string(),
                    other => {
                        return Err(
                            self.err(format!("{} is not callable at expansion time", other))
                        )
                    }
                };
                let mut args = Vec::new();
                for a in tail.unpack() {
                    args.push(self.eval(&a, scope)?);
                }
                self.apply_builtin(&name, &args)
            }

            other => Err(self.err(format!("{} cannot appear in a macro body", other))),
        }
    }

    fn nth_arg(&self, tail: &Value, n: usize) -> Result<Value, CompileError> {
        tail.unpack()
            .get(n)
            .cloned()
            .ok_or_else(|| self.err("missing argument"))
    }

    fn eval_if(
        &self,
        tail: &Value,
        scope: &HashMap<String, Value>,
    ) -> Result<Value, CompileError> {
        let items = tail.unpack();
        if items.len() < 2 || items.len() > 3 {
            return Err(self.err("if expects a test and one or two branches"));
        }
        let test = self.eval(&items[0], scope)?;
        if truthy(&test) {
            self.eval(&items[1], scope)
        } else if items.len() == 3 {
            self.eval(&items[2], scope)
        } else {
            Ok(Value::Nil)
        }
    }

    fn eval_cond(
        &self,
        tail: &Value,
        scope: &HashMap<String, Value>,
    ) -> Result<Value, CompileError> {
        for clause in tail.unpack() {
            let parts = clause.unpack();
            let (test, body) = match parts.split_first() {
                Some(split) => split,
                None => return Err(self.err("malformed cond clause")),
            };

            let matched = matches!(test, Value::Symbol(s) if *s == symbol("else"))
                || truthy(&self.eval(test, scope)?);
            if matched {
                let mut result = Value::Nil;
                for e in body {
                    result = self.eval(e, scope)?;
                }
                return Ok(result);
            }
        }
        Ok(Value::Nil)
    }

    /// Quasiquote templating. Depth tracks quasiquote nesting: unquotes only
    /// fire at depth one, deeper templates are rebuilt as data.
    fn quasi(
        &self,
        template: &Value,
        depth: usize,
        scope: &HashMap<String, Value>,
    ) -> Result<Value, CompileError> {
        let pair = match template {
            Value::Pair(p) => p,
            other => return Ok(other.clone()),
        };

        if let Value::Symbol(s) = pair.head() {
            if s == symbol("unquote") && depth == 1 {
                return self.eval(&self.nth_arg(&pair.tail(), 0)?, scope);
            }
            if s == symbol("quasiquote") {
                let inner = self.quasi(&self.nth_arg(&pair.tail(), 0)?, depth + 1, scope)?;
                return Ok(make_proper(&[Value::Symbol(symbol("quasiquote")), inner]));
            }
        }

        // rebuild the list, splicing where requested
        let mut parts: Vec<Value> = Vec::new();
        let mut cursor = template.clone();
        let tail_value;
        loop {
            match cursor {
                Value::Nil => {
                    tail_value = Value::Nil;
                    break;
                }
                Value::Pair(link) => {
                    let item = link.head();
                    match splice_target(&item) {
                        Some(target) if depth == 1 => {
                            let spliced = self.eval(&self.nth_arg(&target, 0)?, scope)?;
                            if !spliced.is_proper() {
                                return Err(self.err("unquote-splicing expects a proper list"));
                            }
                            parts.extend(spliced.unpack());
                        }
                        _ => parts.push(self.quasi(&item, depth, scope)?),
                    }
                    cursor = link.tail();
                }
                other => {
                    tail_value = self.quasi(&other, depth, scope)?;
                    break;
                }
            }
        }

        let mut result = tail_value;
        for part in parts.into_iter().rev() {
            result = cons(part, result);
        }
        Ok(result)
    }

    fn apply_builtin(&self, name: &str, args: &[Value]) -> Result<Value, CompileError> {
        match (name, args) {
            ("cons", [head, tail]) => Ok(cons(head.clone(), tail.clone())),
            ("car", [Value::Pair(p)]) => Ok(p.head()),
            ("car", [_]) => Err(self.err("car expects a pair")),
            ("cdr", [Value::Pair(p)]) => Ok(p.tail()),
            ("cdr", [_]) => Err(self.err("cdr expects a pair")),
            ("list", items) => Ok(make_proper(items)),
            ("append", lists) => {
                let mut all = Vec::new();
                for l in lists {
                    if !l.is_proper() {
                        return Err(self.err("append expects proper lists"));
                    }
                    all.extend(l.unpack());
                }
                Ok(make_proper(&all))
            }
            ("not", [v]) => Ok(Value::Bool(!truthy(v))),
            ("nil?", [v]) => Ok(Value::Bool(v.is_nil())),
            ("pair?", [v]) => Ok(Value::Bool(v.is_pair())),
            ("symbol?", [v]) => Ok(Value::Bool(matches!(v, Value::Symbol(_)))),
            (name, _) => Err(self.err(format!("{} is not available at expansion time", name))),
        }
    }
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Bool(false) | Value::Nil | Value::None)
}

/// The argument list of an `(unquote-splicing …)` form, when `value` is one
fn splice_target(value: &Value) -> Option<Value> {
    let pair = value.as_pair()?;
    if pair.head() == Value::Symbol(symbol("unquote-splicing")) {
        Some(pair.tail())
    } else {
        None
    }
}
