// ABOUTME: The recursive expansion loop and built-in special forms

use crate::code::CodeObject;
use crate::codespace::{Compiler, Pseudop, SpaceId};
use crate::env::{Env, Special};
use crate::error::{CompileError, Error};
use crate::macros::MacroDef;
use crate::value::{symbol, Position, Symbol, Value};
use std::rc::Rc;
use tracing::trace;

impl Compiler {
    /// Drives compilation of one expression into the active space. Special
    /// forms and macros are expanded in a loop: a special may emit pseudo-ops
    /// directly (done) or hand back a rewritten expression to start over on;
    /// anything else lowers to a function call.
    pub fn add_expression(&mut self, id: SpaceId, expr: &Value) -> Result<(), Error> {
        self.require_active(id)?;
        self.pseudop_position_of(id, expr);

        let mut expr = expr.clone();
        loop {
            let (head, tail) = match &expr {
                Value::Nil => {
                    self.pseudop_const(id, Value::Nil);
                    return Ok(());
                }
                Value::Symbol(s) => {
                    let name = s.as_str().to_string();
                    self.pseudop_get_var(id, &name);
                    return Ok(());
                }
                Value::Pair(p) => (p.head(), p.tail()),
                other => {
                    self.pseudop_const(id, other.clone());
                    return Ok(());
                }
            };

            if let Value::Symbol(name) = &head {
                if let Some(found) = self.find_special(name)? {
                    let rewritten = match found {
                        Value::Special(special) => {
                            trace!(name = name.as_str(), "invoking special form");
                            special.invoke(self, &tail)?
                        }
                        Value::Macro(mac) => {
                            trace!(name = name.as_str(), "expanding macro");
                            Some(mac.expand(&tail)?)
                        }
                        _ => None,
                    };
                    match rewritten {
                        Some(next) => {
                            expr = next;
                            continue;
                        }
                        None => return Ok(()),
                    }
                }
            }

            // not a special: function position plus arguments, then a call
            let children = expr.unpack();
            for child in &children {
                self.add_expression(id, child)?;
            }
            self.pseudop_position_of(id, &expr);
            self.pseudop_call(id, (children.len() - 1) as u16);
            return Ok(());
        }
    }

    /// Compiles an expression and discards its value
    pub fn add_expression_with_pop(&mut self, id: SpaceId, expr: &Value) -> Result<(), Error> {
        self.add_expression(id, expr)?;
        self.pseudop_pop(id);
        Ok(())
    }

    /// Resolves a head symbol to a special form or macro: module bindings
    /// first, then the builtins table; other values compile as calls
    pub fn find_special(&self, name: &Symbol) -> Result<Option<Value>, CompileError> {
        self.active_id()?;
        Ok(self
            .env
            .resolve(name.as_str())
            .filter(|v| matches!(v, Value::Special(_) | Value::Macro(_))))
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

fn syntax(message: impl Into<String>, pos: Option<Position>) -> Error {
    CompileError::syntax(message, pos).into()
}

/// Splits a form into its head and everything after
fn take_pair(form: &Value, what: &str) -> Result<(Value, Value), Error> {
    match form.as_pair() {
        Some(p) => Ok((p.head(), p.tail())),
        None => Err(syntax(format!("malformed {}", what), None)),
    }
}

fn expect_symbol(value: &Value, what: &str) -> Result<String, Error> {
    match value {
        Value::Symbol(s) => Ok(s.as_str().to_string()),
        other => Err(syntax(format!("{} must be a symbol, not {}", what, other), None)),
    }
}

/// The single argument of a one-argument form
fn single_arg(tail: &Value, what: &str) -> Result<Value, Error> {
    match tail.as_pair() {
        Some(p) if p.tail().is_nil() => Ok(p.head()),
        _ => Err(syntax(format!("{} takes exactly one argument", what), None)),
    }
}

/// Lambda formals: a bare symbol is a single rest-arg, a pair is positional
/// names with an improper tail meaning varargs
fn parse_formals(formals: &Value) -> Result<(Vec<String>, bool), Error> {
    match formals {
        Value::Symbol(s) => Ok((vec![s.as_str().to_string()], true)),
        Value::Nil => Ok((Vec::new(), false)),
        Value::Pair(_) => {
            let varargs = !formals.is_proper();
            let mut names = Vec::new();
            for item in formals.unpack() {
                names.push(expect_symbol(&item, "formal parameter")?);
            }
            Ok((names, varargs))
        }
        other => Err(syntax(
            format!("formals must be symbol or pair, not {}", other),
            None,
        )),
    }
}

fn position_of(c: &Compiler, value: &Value) -> Option<Position> {
    value
        .as_pair()
        .and_then(|p| c.positions.get(&p.id()).copied())
}

/// Compiles a body sequence, popping every value but the last. An empty
/// body still yields a value: None.
fn compile_begin(c: &mut Compiler, id: SpaceId, body: &Value) -> Result<(), Error> {
    if body.is_nil() {
        c.pseudop_const(id, Value::None);
        return Ok(());
    }
    c.pseudop_position_of(id, body);

    let mut first = true;
    for item in body.unpack() {
        if !first {
            c.pseudop_pop(id);
        }
        first = false;
        c.add_expression(id, &item)?;
    }
    Ok(())
}

/// Compiles a child scope for a function-like form and returns its code
fn build_function(
    c: &mut Compiler,
    name: &str,
    formals: &Value,
    body: &Value,
    declared_from: &Value,
) -> Result<Rc<CodeObject>, Error> {
    let (args, varargs) = parse_formals(formals)?;
    let declared_at = position_of(c, declared_from);
    let kid = c.child_space(&args, varargs, Some(name), declared_at)?;
    c.activate(kid, |c| {
        compile_begin(c, kid, body)?;
        c.pseudop_return(kid);
        c.complete(kid)
    })
}

/// Emits runtime construction of a quoted value: nil and symbols go through
/// their constructors, pairs rebuild with make-proper or cons, anything else
/// is a constant
fn quote_value(c: &mut Compiler, id: SpaceId, value: &Value) -> Result<(), Error> {
    match value {
        Value::Nil => c.pseudop_get_var(id, "nil"),
        Value::Symbol(s) => {
            c.pseudop_get_var(id, "symbol");
            c.pseudop_const(id, Value::string(s.as_str()));
            c.pseudop_call(id, 1);
        }
        Value::Pair(_) => {
            if value.is_proper() {
                c.pseudop_get_var(id, "make-proper");
            } else {
                c.pseudop_get_var(id, "cons");
            }
            let items = value.unpack();
            for item in &items {
                quote_value(c, id, item)?;
            }
            c.pseudop_call(id, items.len() as u16);
        }
        other => c.pseudop_const(id, other.clone()),
    }
    Ok(())
}

/// The expression inside an (unquote x) / (unquote-splicing x) form
fn template_arg(form: &Value, what: &str) -> Result<Value, Error> {
    let (_, tail) = take_pair(form, what)?;
    single_arg(&tail, what)
}

fn headed_by(value: &Value, name: &str) -> bool {
    value
        .as_pair()
        .map(|p| p.head() == Value::Symbol(symbol(name)))
        .unwrap_or(false)
}

/// Emits construction of a quasiquoted template. Unquoted expressions are
/// compiled in place; splices flow through to-tuple and the surrounding
/// elements are gathered into tuple groups unpacked into one varargs call
/// of the list constructor.
fn quasi_value(c: &mut Compiler, id: SpaceId, template: &Value) -> Result<(), Error> {
    match template {
        Value::Nil => {
            c.pseudop_get_var(id, "nil");
            return Ok(());
        }
        Value::Symbol(s) => {
            c.pseudop_get_var(id, "symbol");
            c.pseudop_const(id, Value::string(s.as_str()));
            c.pseudop_call(id, 1);
            return Ok(());
        }
        Value::Pair(_) => {}
        other => {
            c.pseudop_const(id, other.clone());
            return Ok(());
        }
    }

    if headed_by(template, "unquote") {
        let inner = template_arg(template, "unquote")?;
        return c.add_expression(id, &inner);
    }
    if headed_by(template, "unquote-splicing") {
        return Err(syntax("unquote-splicing outside of a list template", None));
    }

    if template.is_proper() {
        c.pseudop_get_var(id, "make-proper");
    } else {
        c.pseudop_get_var(id, "cons");
    }

    let mut group = 0u16;
    let mut groups = 0u16;
    for item in template.unpack() {
        match &item {
            Value::Nil => {
                c.pseudop_get_var(id, "nil");
                group += 1;
            }
            Value::Symbol(s) => {
                c.pseudop_get_var(id, "symbol");
                c.pseudop_const(id, Value::string(s.as_str()));
                c.pseudop_call(id, 1);
                group += 1;
            }
            Value::Pair(_) if headed_by(&item, "unquote") => {
                let inner = template_arg(&item, "unquote")?;
                c.add_expression(id, &inner)?;
                group += 1;
            }
            Value::Pair(_) if headed_by(&item, "unquote-splicing") => {
                if group > 0 {
                    c.pseudop(id, Pseudop::BuildTuple(group));
                    group = 0;
                    groups += 1;
                }
                let inner = template_arg(&item, "unquote-splicing")?;
                c.pseudop_get_var(id, "to-tuple");
                c.add_expression(id, &inner)?;
                c.pseudop_call(id, 1);
                groups += 1;
            }
            Value::Pair(_) => {
                quasi_value(c, id, &item)?;
                group += 1;
            }
            other => {
                c.pseudop_const(id, other.clone());
                group += 1;
            }
        }
    }

    if group > 0 {
        c.pseudop(id, Pseudop::BuildTuple(group));
        groups += 1;
    }
    c.pseudop(id, Pseudop::BuildTupleUnpack(groups));
    c.pseudop(id, Pseudop::CallVarargs(0));
    Ok(())
}

// ============================================================================
// Special forms
// ============================================================================

macro_rules! define_special {
    {
        $fn_ident:ident,
        name: $lisp_name:literal,
        $impl:expr
    } => {
        pub fn $fn_ident(compiler: &mut Compiler, tail: &Value) -> Result<Option<Value>, Error> {
            $impl(compiler, tail)
        }

        paste::paste! {
            pub(crate) fn [<register_ $fn_ident>](env: &Env) {
                env.define_builtin(
                    $lisp_name,
                    Value::Special(Special::new($lisp_name, $fn_ident)),
                );
            }
        }
    };
}

define_special! {
    special_quote,
    name: "quote",
    |c: &mut Compiler, tail: &Value| {
        let id = c.active_id()?;
        let body = single_arg(tail, "quote")?;
        quote_value(c, id, &body)?;
        Ok(None)
    }
}

define_special! {
    special_quasiquote,
    name: "quasiquote",
    |c: &mut Compiler, tail: &Value| {
        let id = c.active_id()?;
        let template = single_arg(tail, "quasiquote")?;
        quasi_value(c, id, &template)?;
        Ok(None)
    }
}

define_special! {
    special_begin,
    name: "begin",
    |c: &mut Compiler, tail: &Value| {
        let id = c.active_id()?;
        compile_begin(c, id, tail)?;
        Ok(None)
    }
}

define_special! {
    special_lambda,
    name: "lambda",
    |c: &mut Compiler, tail: &Value| {
        let id = c.active_id()?;
        let (formals, body) = take_pair(tail, "lambda")?;
        let code = build_function(c, "<lambda>", &formals, &body, &body)?;
        c.pseudop_lambda(id, code);
        Ok(None)
    }
}

define_special! {
    special_let,
    name: "let",
    |c: &mut Compiler, tail: &Value| {
        let id = c.active_id()?;
        let (bindings, body) = take_pair(tail, "let")?;

        let mut args = Vec::new();
        let mut vals = Vec::new();
        for binding in bindings.unpack() {
            let parts = binding.unpack();
            match parts.as_slice() {
                [name, value] => {
                    args.push(expect_symbol(name, "let binding name")?);
                    vals.push(value.clone());
                }
                _ => return Err(syntax("let binding must be (name value)", None)),
            }
        }

        let declared_at = position_of(c, &body);
        let kid = c.child_space(&args, false, Some("<let>"), declared_at)?;
        let code = c.activate(kid, |c| {
            compile_begin(c, kid, &body)?;
            c.pseudop_return(kid);
            c.complete(kid)
        })?;

        c.pseudop_lambda(id, code);
        for val in &vals {
            c.add_expression(id, val)?;
        }
        c.pseudop_call(id, vals.len() as u16);
        Ok(None)
    }
}

define_special! {
    special_while,
    name: "while",
    |c: &mut Compiler, tail: &Value| {
        let id = c.active_id()?;
        let (test, body) = take_pair(tail, "while")?;

        let top = c.gen_label(id);
        let done = c.gen_label(id);

        // the sentinel slot doubles as the loop expression's value
        c.pseudop_const(id, Value::None);
        c.pseudop(id, Pseudop::Label(top));

        c.add_expression(id, &test)?;
        c.pseudop(id, Pseudop::PopJumpIfFalse(done));

        c.pseudop_pop(id);
        compile_begin(c, id, &body)?;
        c.pseudop(id, Pseudop::Jump(top));

        c.pseudop(id, Pseudop::Label(done));
        Ok(None)
    }
}

define_special! {
    special_cond,
    name: "cond",
    |c: &mut Compiler, tail: &Value| {
        let id = c.active_id()?;
        let done = c.gen_label(id);
        let mut next: Option<crate::codespace::Label> = None;

        for clause in tail.unpack() {
            if let Some(label) = next.take() {
                c.pseudop(id, Pseudop::Label(label));
            }

            let (test, body) = take_pair(&clause, "cond clause")?;
            if test == Value::Symbol(symbol("else")) {
                compile_begin(c, id, &body)?;
                c.pseudop(id, Pseudop::Jump(done));
            } else {
                let label = c.gen_label(id);
                c.add_expression(id, &test)?;
                c.pseudop(id, Pseudop::PopJumpIfFalse(label));
                compile_begin(c, id, &body)?;
                c.pseudop(id, Pseudop::Jump(done));
                next = Some(label);
            }
        }

        // no clause matched
        if let Some(label) = next {
            c.pseudop(id, Pseudop::Label(label));
        }
        c.pseudop_const(id, Value::None);
        c.pseudop(id, Pseudop::Label(done));
        Ok(None)
    }
}

define_special! {
    special_try,
    name: "try",
    |c: &mut Compiler, tail: &Value| {
        let id = c.active_id()?;
        let (expr, clause_list) = take_pair(tail, "try")?;

        let mut handlers: Vec<(Value, Value)> = Vec::new();
        let mut else_body: Option<Value> = None;
        let mut finally_body: Option<Value> = None;
        for clause in clause_list.unpack() {
            let (ex, actions) = take_pair(&clause, "try clause")?;
            if ex == Value::Symbol(symbol("else")) {
                else_body = Some(actions);
            } else if ex == Value::Symbol(symbol("finally")) {
                finally_body = Some(actions);
            } else {
                handlers.push((ex, actions));
            }
        }

        let finally_label = finally_body.as_ref().map(|_| c.gen_label(id));
        if let Some(l_fin) = finally_label {
            c.pseudop(id, Pseudop::SetupFinally(l_fin));
        }

        let l_end = c.gen_label(id);
        let l_handlers = c.gen_label(id);
        let l_else = else_body.as_ref().map(|_| c.gen_label(id));

        c.pseudop(id, Pseudop::SetupExcept(l_handlers));
        c.add_expression(id, &expr)?;
        c.pseudop(id, Pseudop::PopBlock);
        c.pseudop(id, Pseudop::JumpForward(l_else.unwrap_or(l_end)));

        c.pseudop(id, Pseudop::Label(l_handlers));
        for (ex, actions) in &handlers {
            let l_next = c.gen_label(id);
            emit_handler(c, id, ex, actions, l_next, l_end)?;
            c.pseudop(id, Pseudop::Label(l_next));
        }
        // nothing matched: let the exception continue unwinding
        c.pseudop(id, Pseudop::Raise(0));

        if let (Some(label), Some(body)) = (l_else, &else_body) {
            c.pseudop(id, Pseudop::Label(label));
            // the try value is discarded in favour of the else body's
            c.pseudop_pop(id);
            compile_begin(c, id, body)?;
        }
        c.pseudop(id, Pseudop::Label(l_end));

        if let (Some(l_fin), Some(body)) = (finally_label, &finally_body) {
            c.pseudop(id, Pseudop::PopBlock);
            c.pseudop_const(id, Value::None);
            c.pseudop(id, Pseudop::Label(l_fin));
            c.pseudop_pop(id);
            c.pseudop_pop(id);
            compile_begin(c, id, body)?;
            c.pseudop(id, Pseudop::EndFinally);
        }
        Ok(None)
    }
}

/// One catch clause. Entry state is the unwound exception triple with the
/// type on top. A `(match-expr name)` binding clause funnels the exception
/// value through a one-argument catch lambda.
fn emit_handler(
    c: &mut Compiler,
    id: SpaceId,
    ex: &Value,
    actions: &Value,
    l_next: crate::codespace::Label,
    l_end: crate::codespace::Label,
) -> Result<(), Error> {
    c.pseudop(id, Pseudop::Dup);

    match ex {
        Value::Pair(_) => {
            if !ex.is_proper() {
                return Err(syntax("catch binding must be (match-expr name)", None));
            }
            let parts = ex.unpack();
            let [match_expr, binding] = parts.as_slice() else {
                return Err(syntax("catch binding must be (match-expr name)", None));
            };
            let name = expect_symbol(binding, "catch binding name")?;

            let declared_at = position_of(c, ex);
            let kid = c.child_space(&[name], false, Some("<catch>"), declared_at)?;
            let code = c.activate(kid, |c| {
                compile_begin(c, kid, actions)?;
                c.pseudop_return(kid);
                c.complete(kid)
            })?;

            c.pseudop_position_of(id, ex);
            c.add_expression(id, match_expr)?;
            c.pseudop(id, Pseudop::ExceptionMatch);
            c.pseudop(id, Pseudop::PopJumpIfFalse(l_next));

            // drop the type, call the catch lambda on the live value,
            // then clear the leftover traceback from underneath
            c.pseudop_pop(id);
            c.pseudop_lambda(id, code);
            c.pseudop(id, Pseudop::RotTwo);
            c.pseudop_call(id, 1);
            c.pseudop(id, Pseudop::RotTwo);
            c.pseudop_pop(id);
        }
        _ => {
            c.add_expression(id, ex)?;
            c.pseudop(id, Pseudop::ExceptionMatch);
            c.pseudop(id, Pseudop::PopJumpIfFalse(l_next));

            c.pseudop_pop(id);
            c.pseudop_pop(id);
            c.pseudop_pop(id);
            compile_begin(c, id, actions)?;
        }
    }

    c.pseudop(id, Pseudop::PopExcept);
    c.pseudop(id, Pseudop::JumpForward(l_end));
    Ok(())
}

define_special! {
    special_set_var,
    name: "set-var",
    |c: &mut Compiler, tail: &Value| {
        let id = c.active_id()?;
        let (binding, body) = take_pair(tail, "set-var")?;
        compile_begin(c, id, &body)?;

        let name = expect_symbol(&binding, "set-var target")?;
        c.pseudop_set_var(id, &name);

        // assignment evaluates to None
        c.pseudop_const(id, Value::None);
        Ok(None)
    }
}

define_special! {
    special_define,
    name: "define",
    |c: &mut Compiler, tail: &Value| {
        let id = c.active_id()?;
        let (binding, body) = take_pair(tail, "define")?;
        compile_begin(c, id, &body)?;

        let name = expect_symbol(&binding, "define target")?;
        c.pseudop_define(id, &name);

        c.pseudop_const(id, Value::None);
        Ok(None)
    }
}

define_special! {
    special_defun,
    name: "defun",
    |c: &mut Compiler, tail: &Value| {
        let id = c.active_id()?;
        let (name_value, rest) = take_pair(tail, "defun")?;
        let name = expect_symbol(&name_value, "defun name")?;
        let (formals, body) = take_pair(&rest, "defun")?;

        let code = build_function(c, &name, &formals, &body, &rest)?;
        c.pseudop_lambda(id, code);
        c.pseudop_define(id, &name);

        c.pseudop_const(id, Value::None);
        Ok(None)
    }
}

define_special! {
    special_defmacro,
    name: "defmacro",
    |c: &mut Compiler, tail: &Value| {
        let id = c.active_id()?;
        let (name_value, rest) = take_pair(tail, "defmacro")?;
        let name = expect_symbol(&name_value, "defmacro name")?;
        let (formals, body) = take_pair(&rest, "defmacro")?;

        let code = build_function(c, &name, &formals, &body, &rest)?;
        c.pseudop_get_var(id, "macro");
        c.pseudop_lambda(id, code);
        c.pseudop_call(id, 1);
        c.pseudop_define(id, &name);

        c.pseudop_const(id, Value::None);

        // install the expander immediately so the rest of this unit can use it
        let (params, varargs) = parse_formals(&formals)?;
        c.env.define(
            &name,
            Value::Macro(Rc::new(MacroDef::new(&name, params, varargs, body))),
        );
        Ok(None)
    }
}

/// Installs every built-in special form into an environment's builtins table
pub fn register_specials(env: &Env) {
    register_special_quote(env);
    register_special_quasiquote(env);
    register_special_begin(env);
    register_special_lambda(env);
    register_special_let(env);
    register_special_while(env);
    register_special_cond(env);
    register_special_try(env);
    register_special_set_var(env);
    register_special_define(env);
    register_special_defun(env);
    register_special_defmacro(env);
}
