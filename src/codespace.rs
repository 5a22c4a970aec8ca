// ABOUTME: Lexical code spaces, pseudo operations, and scope analysis

use crate::assembler::TargetVersion;
use crate::ast::{compose_all_from_stream, compose_from_stream, Ast, ComposeAll};
use crate::code::CodeObject;
use crate::env::{Env, COMPILER_KEY};
use crate::error::{CompileError, Error};
use crate::reader::Reader;
use crate::stream::SourceStream;
use crate::value::{Position, PositionMap, Value};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, trace};

/// An opaque generated jump target, unique within one code space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label_{:04}", self.0)
    }
}

/// A logical instruction in the intermediate buffer, independent of the
/// target-VM encoding
#[derive(Debug, Clone)]
pub enum Pseudop {
    Pop,
    Dup,
    RotTwo,
    RotThree,

    Const(Value),
    GetVar(String),
    SetVar(String),
    DeleteVar(String),
    GetGlobal(String),
    GetAttr(String),
    SetAttr(String),
    Define(String),

    Call(u16),
    CallVarargs(u16),

    Lambda(Rc<CodeObject>),
    BuildTuple(u16),
    BuildTupleUnpack(u16),

    Jump(Label),
    JumpForward(Label),
    PopJumpIfTrue(Label),
    PopJumpIfFalse(Label),
    Label(Label),
    RetVal,

    SetupLoop(Label),
    SetupExcept(Label),
    SetupFinally(Label),
    SetupWith(Label),
    PopBlock,
    PopExcept,
    EndFinally,
    WithCleanupStart,
    WithCleanupFinish,

    CompareOp(u8),
    Item,
    Iter,
    UnaryPositive,
    UnaryNegative,
    UnaryNot,
    UnaryInvert,
    BinaryAdd,
    BinarySubtract,
    BinaryMultiply,
    BinaryMatrixMultiply,
    BinaryTrueDivide,
    BinaryFloorDivide,
    BinaryPower,
    BinaryModulo,
    BinaryLshift,
    BinaryRshift,
    BinaryAnd,
    BinaryXor,
    BinaryOr,
    Raise(u8),
    ExceptionMatch,

    Position(u32, u32),
}

/// `COMPARE_OP` argument selecting the exception-match comparison
pub const COMPARE_EXCEPTION_MATCH: u8 = 10;

pub type SpaceId = usize;

/// One lexical scope: formals, variable classification lists, pools, and the
/// pseudo-op buffer. Spaces form a tree navigated upward through parent ids.
#[derive(Debug)]
pub struct CodeSpace {
    pub parent: Option<SpaceId>,
    pub name: Option<String>,

    pub args: Vec<String>,
    pub varargs: bool,

    /// locals that stayed local
    pub fast_vars: Vec<String>,
    /// locals promoted because a child scope captured them
    pub cell_vars: Vec<String>,
    /// closure cells inherited from an ancestor
    pub free_vars: Vec<String>,
    /// names resolved to module globals
    pub global_vars: Vec<String>,

    pub names: Vec<String>,
    pub consts: Vec<Value>,
    pub pseudops: Vec<Pseudop>,
    pub declared_at: Option<Position>,

    next_label: u32,
}

impl CodeSpace {
    fn new(
        parent: Option<SpaceId>,
        args: &[String],
        varargs: bool,
        name: Option<&str>,
        declared_at: Option<Position>,
    ) -> CodeSpace {
        let mut space = CodeSpace {
            parent,
            name: name.map(str::to_string),
            args: Vec::new(),
            varargs,
            fast_vars: Vec::new(),
            cell_vars: Vec::new(),
            free_vars: Vec::new(),
            global_vars: Vec::new(),
            names: Vec::new(),
            // slot zero is reserved for the docstring, None otherwise
            consts: vec![Value::None],
            pseudops: Vec::new(),
            declared_at,
            next_label: 0,
        };
        for arg in args {
            push_unique(&mut space.args, arg);
            push_unique(&mut space.fast_vars, arg);
        }
        space
    }

    pub fn gen_label(&mut self) -> Label {
        self.next_label += 1;
        Label(self.next_label)
    }

    /// Index of `value` in the constant pool, by strict identity-style
    /// comparison (so 1 and True stay distinct entries)
    pub fn const_index(&self, value: &Value) -> Option<usize> {
        self.consts.iter().position(|c| const_eq(c, value))
    }

    pub fn declare_const(&mut self, value: Value) -> usize {
        match self.const_index(&value) {
            Some(i) => i,
            None => {
                self.consts.push(value);
                self.consts.len() - 1
            }
        }
    }

    pub fn declare_var(&mut self, name: &str) {
        push_unique(&mut self.fast_vars, name);
    }

    pub fn request_name(&mut self, name: &str) {
        push_unique(&mut self.names, name);
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) -> usize {
    match list.iter().position(|v| v == value) {
        Some(i) => i,
        None => {
            list.push(value.to_string());
            list.len() - 1
        }
    }
}

/// Constant pool comparison. Deliberately type-strict: booleans never
/// collapse into integers, and code objects compare by identity.
fn const_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        (Value::Complex { re: a1, im: b1 }, Value::Complex { re: a2, im: b2 }) => {
            a1.to_bits() == a2.to_bits() && b1.to_bits() == b2.to_bits()
        }
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Symbol(x), Value::Symbol(y)) => x == y,
        (Value::Keyword(x), Value::Keyword(y)) => x == y,
        (Value::Code(x), Value::Code(y)) => Rc::ptr_eq(x, y),
        (Value::Pair(x), Value::Pair(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

// ============================================================================
// Compiler
// ============================================================================

/// Owns the code-space arena for one compilation unit, along with the shared
/// position table, the environment handle, and the declared target version
pub struct Compiler {
    pub(crate) spaces: Vec<CodeSpace>,
    active: Vec<SpaceId>,
    pub positions: PositionMap,
    pub env: Env,
    pub filename: Option<String>,
    pub target: TargetVersion,
}

impl Compiler {
    pub fn new(env: Env, filename: Option<&str>, target: TargetVersion) -> Compiler {
        Compiler {
            spaces: Vec::new(),
            active: Vec::new(),
            positions: PositionMap::new(),
            env,
            filename: filename.map(str::to_string),
            target,
        }
    }

    pub fn space(&self, id: SpaceId) -> &CodeSpace {
        &self.spaces[id]
    }

    /// The top-level code space of the unit
    pub fn root_space(&mut self) -> SpaceId {
        self.new_space(None, &[], false, None, None)
    }

    /// A nested scope under the currently active space. Fails when no space
    /// is active.
    pub fn child_space(
        &mut self,
        args: &[String],
        varargs: bool,
        name: Option<&str>,
        declared_at: Option<Position>,
    ) -> Result<SpaceId, CompileError> {
        let parent = *self.active.last().ok_or(CompileError::InactiveScope)?;
        let declared_at = declared_at.or(self.spaces[parent].declared_at);
        Ok(self.new_space(Some(parent), args, varargs, name, declared_at))
    }

    fn new_space(
        &mut self,
        parent: Option<SpaceId>,
        args: &[String],
        varargs: bool,
        name: Option<&str>,
        declared_at: Option<Position>,
    ) -> SpaceId {
        self.spaces
            .push(CodeSpace::new(parent, args, varargs, name, declared_at));
        let id = self.spaces.len() - 1;
        if varargs {
            self.prep_varargs(id);
        }
        id
    }

    /// Function-entry step converting the host's rest-arg tuple into a
    /// proper list bound to the last formal
    fn prep_varargs(&mut self, id: SpaceId) {
        if let Some(pos) = self.spaces[id].declared_at {
            self.pseudop(id, Pseudop::Position(pos.0, pos.1));
        }
        let rest = match self.spaces[id].args.last() {
            Some(rest) => rest.clone(),
            None => return,
        };
        self.pseudop_get_var(id, "make-proper");
        self.pseudop_get_var(id, &rest);
        self.pseudop(id, Pseudop::CallVarargs(0));
        self.pseudop_set_var(id, &rest);
    }

    pub fn is_active(&self, id: SpaceId) -> bool {
        self.active.last() == Some(&id)
    }

    pub fn require_active(&self, id: SpaceId) -> Result<(), CompileError> {
        if self.is_active(id) {
            Ok(())
        } else {
            Err(CompileError::InactiveScope)
        }
    }

    pub fn active_id(&self) -> Result<SpaceId, CompileError> {
        self.active.last().copied().ok_or(CompileError::InactiveScope)
    }

    /// Runs `body` with `id` active. Installs a marker under `__compiler__`
    /// in the environment, saving any previous entry; the previous binding
    /// and activation stack are restored on every exit path.
    pub fn activate<R>(
        &mut self,
        id: SpaceId,
        body: impl FnOnce(&mut Compiler) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let saved = self.env.get(COMPILER_KEY);
        let scope_name = self.spaces[id].name.clone();
        let marker = Value::string(&format!(
            "#<compiler {}>",
            scope_name.as_deref().unwrap_or("<anon>")
        ));
        self.env.define(COMPILER_KEY, marker);
        self.active.push(id);

        let result = body(self);

        self.active.pop();
        match saved {
            Some(previous) => self.env.define(COMPILER_KEY, previous),
            None => {
                self.env.remove(COMPILER_KEY);
            }
        }
        result
    }

    // ========================================================================
    // Variable classification
    // ========================================================================

    /// Resolves a name used in this scope to exactly one of fast, cell,
    /// free, or global. Classification happens once per name per scope.
    pub fn request_var(&mut self, id: SpaceId, name: &str) {
        {
            let space = &self.spaces[id];
            if space.fast_vars.iter().any(|v| v == name)
                || space.cell_vars.iter().any(|v| v == name)
                || space.free_vars.iter().any(|v| v == name)
                || space.global_vars.iter().any(|v| v == name)
            {
                return;
            }
        }

        let captured = match self.spaces[id].parent {
            Some(parent) => self.request_cell(parent, name),
            None => false,
        };

        let space = &mut self.spaces[id];
        if captured {
            trace!(name, space = ?space.name, "classified free");
            push_unique(&mut space.free_vars, name);
        } else {
            trace!(name, space = ?space.name, "classified global");
            push_unique(&mut space.global_vars, name);
            push_unique(&mut space.names, name);
        }
    }

    /// Asks this scope to provide `name` as a closure cell for a descendant.
    /// A fast local gets promoted; an already-threaded cell or free var is
    /// reaffirmed; globals refuse.
    fn request_cell(&mut self, id: SpaceId, name: &str) -> bool {
        let parent = self.spaces[id].parent;
        let space = &mut self.spaces[id];

        if space.global_vars.iter().any(|v| v == name) {
            return false;
        }
        if let Some(i) = space.fast_vars.iter().position(|v| v == name) {
            space.fast_vars.remove(i);
            push_unique(&mut space.cell_vars, name);
            trace!(name, space = ?space.name, "promoted fast to cell");
            return true;
        }
        if space.free_vars.iter().any(|v| v == name) || space.cell_vars.iter().any(|v| v == name) {
            return true;
        }

        match parent {
            Some(parent) if self.request_cell(parent, name) => {
                // the ancestor owns it; thread it through here as a free var
                push_unique(&mut self.spaces[id].free_vars, name);
                true
            }
            _ => false,
        }
    }

    // ========================================================================
    // Pseudo-op emission
    // ========================================================================

    pub fn pseudop(&mut self, id: SpaceId, op: Pseudop) {
        self.spaces[id].pseudops.push(op);
    }

    pub fn gen_label(&mut self, id: SpaceId) -> Label {
        self.spaces[id].gen_label()
    }

    pub fn pseudop_position(&mut self, id: SpaceId, line: u32, col: u32) {
        self.pseudop(id, Pseudop::Position(line, col));
    }

    /// Emits a position record for `expr` when the shared table knows one
    pub fn pseudop_position_of(&mut self, id: SpaceId, expr: &Value) {
        if let Value::Pair(p) = expr {
            if let Some(&(line, col)) = self.positions.get(&p.id()) {
                self.pseudop(id, Pseudop::Position(line, col));
            }
        }
    }

    pub fn pseudop_const(&mut self, id: SpaceId, value: Value) {
        self.spaces[id].declare_const(value.clone());
        self.pseudop(id, Pseudop::Const(value));
    }

    pub fn pseudop_get_var(&mut self, id: SpaceId, name: &str) {
        self.request_var(id, name);
        self.pseudop(id, Pseudop::GetVar(name.to_string()));
    }

    pub fn pseudop_set_var(&mut self, id: SpaceId, name: &str) {
        self.request_var(id, name);
        self.pseudop(id, Pseudop::SetVar(name.to_string()));
    }

    /// A global store: forces the name into the global classification no
    /// matter what the surrounding scope would otherwise decide
    pub fn pseudop_define(&mut self, id: SpaceId, name: &str) {
        let space = &mut self.spaces[id];
        push_unique(&mut space.global_vars, name);
        push_unique(&mut space.names, name);
        self.pseudop(id, Pseudop::Define(name.to_string()));
    }

    pub fn pseudop_lambda(&mut self, id: SpaceId, code: Rc<CodeObject>) {
        let space = &mut self.spaces[id];
        space.declare_const(Value::Code(code.clone()));
        space.declare_const(Value::string(&code.name));
        self.pseudop(id, Pseudop::Lambda(code));
    }

    pub fn pseudop_call(&mut self, id: SpaceId, argc: u16) {
        self.pseudop(id, Pseudop::Call(argc));
    }

    pub fn pseudop_return(&mut self, id: SpaceId) {
        self.pseudop(id, Pseudop::RetVal);
    }

    pub fn pseudop_pop(&mut self, id: SpaceId) {
        self.pseudop(id, Pseudop::Pop);
    }

    /// Assembles the active space into a code object for the compiler's
    /// declared target version
    pub fn complete(&mut self, id: SpaceId) -> Result<Rc<CodeObject>, Error> {
        self.require_active(id)?;
        let space = &self.spaces[id];
        debug!(
            name = ?space.name,
            pseudops = space.pseudops.len(),
            consts = space.consts.len(),
            "completing code space"
        );
        let code = crate::assembler::assemble(space, self.filename.as_deref(), self.target)?;
        Ok(Rc::new(code))
    }
}

// ============================================================================
// Stack depth analysis
// ============================================================================

/// Walks the pseudo-op buffer tracking a virtual stack: depth must never go
/// negative and must close at zero. Branch instructions record the depth at
/// their target so labels can adopt it.
pub fn max_stack(space: &CodeSpace) -> Result<u32, CompileError> {
    let mut depth: i32 = 0;
    let mut max: i32 = 0;
    let mut at_label: HashMap<Label, i32> = HashMap::new();

    for (index, op) in space.pseudops.iter().enumerate() {
        match op {
            Pseudop::Position(..) => {}

            Pseudop::Const(_)
            | Pseudop::GetVar(_)
            | Pseudop::GetGlobal(_)
            | Pseudop::GetAttr(_)
            | Pseudop::Dup => depth += 1,

            Pseudop::Pop
            | Pseudop::SetVar(_)
            | Pseudop::SetAttr(_)
            | Pseudop::Define(_)
            | Pseudop::RetVal
            | Pseudop::CallVarargs(_)
            | Pseudop::ExceptionMatch => depth -= 1,

            Pseudop::DeleteVar(_) => {}

            Pseudop::Call(argc) => depth -= *argc as i32,

            Pseudop::Lambda(code) => {
                // closure construction loads each captured cell, gathers
                // them into a tuple, then stacks the code and name
                // constants on top; a plain function loads just the two
                // constants
                let captured = code.freevars.len() as i32;
                let peak = if captured > 0 { captured.max(3) } else { 2 };
                max = max.max(depth + peak);
                depth += 1;
            }

            Pseudop::BuildTuple(count) | Pseudop::BuildTupleUnpack(count) => {
                depth -= *count as i32;
                depth += 1;
            }

            Pseudop::Jump(label) | Pseudop::JumpForward(label) => {
                at_label.insert(*label, depth);
            }

            Pseudop::PopJumpIfTrue(label) | Pseudop::PopJumpIfFalse(label) => {
                depth -= 1;
                at_label.insert(*label, depth);
            }

            Pseudop::Label(label) => {
                if let Some(&recorded) = at_label.get(label) {
                    depth = recorded;
                }
            }

            // the unwound exception triple arrives at the handler
            Pseudop::SetupExcept(label) => {
                at_label.insert(*label, depth + 3);
            }
            // pending value plus the unwind sentinel
            Pseudop::SetupFinally(label) | Pseudop::SetupWith(label) => {
                at_label.insert(*label, depth + 2);
            }

            Pseudop::SetupLoop(_)
            | Pseudop::PopBlock
            | Pseudop::PopExcept
            | Pseudop::EndFinally
            | Pseudop::WithCleanupStart
            | Pseudop::WithCleanupFinish
            | Pseudop::RotTwo
            | Pseudop::RotThree
            | Pseudop::Iter
            | Pseudop::UnaryPositive
            | Pseudop::UnaryNegative
            | Pseudop::UnaryNot
            | Pseudop::UnaryInvert => {}

            Pseudop::CompareOp(_)
            | Pseudop::Item
            | Pseudop::BinaryAdd
            | Pseudop::BinarySubtract
            | Pseudop::BinaryMultiply
            | Pseudop::BinaryMatrixMultiply
            | Pseudop::BinaryTrueDivide
            | Pseudop::BinaryFloorDivide
            | Pseudop::BinaryPower
            | Pseudop::BinaryModulo
            | Pseudop::BinaryLshift
            | Pseudop::BinaryRshift
            | Pseudop::BinaryAnd
            | Pseudop::BinaryXor
            | Pseudop::BinaryOr => depth -= 1,

            Pseudop::Raise(argc) => depth -= *argc as i32,
        }

        if depth < 0 {
            return Err(CompileError::StackDepth(format!(
                "negative depth after op {}",
                index
            )));
        }
        max = max.max(depth);
    }

    if depth != 0 {
        return Err(CompileError::StackDepth(format!(
            "terminal depth {} is not zero",
            depth
        )));
    }
    Ok(max as u32)
}

// ============================================================================
// Compilation entry points
// ============================================================================

/// Compiles a composed tree against `env`, producing a code object for the
/// default target version
pub fn compile_from_ast(
    ast: &Ast,
    env: &Env,
    filename: Option<&str>,
) -> Result<Rc<CodeObject>, Error> {
    compile_from_ast_for(ast, env, filename, TargetVersion::default())
}

pub fn compile_from_ast_for(
    ast: &Ast,
    env: &Env,
    filename: Option<&str>,
    target: TargetVersion,
) -> Result<Rc<CodeObject>, Error> {
    let mut positions = PositionMap::new();
    let expr = ast.simplify(&mut positions);
    compile_expression(expr, positions, env, filename, target)
}

fn compile_expression(
    expr: Value,
    positions: PositionMap,
    env: &Env,
    filename: Option<&str>,
    target: TargetVersion,
) -> Result<Rc<CodeObject>, Error> {
    let mut compiler = Compiler::new(env.clone(), filename, target);
    compiler.positions = positions;

    let root = compiler.root_space();
    compiler.activate(root, |c| {
        c.add_expression(root, &expr)?;
        c.pseudop_return(root);
        c.complete(root)
    })
}

pub fn compile_from_str(
    src: &str,
    env: &Env,
    filename: Option<&str>,
) -> Result<Rc<CodeObject>, Error> {
    compile_from_str_for(src, env, filename, TargetVersion::default())
}

pub fn compile_from_str_for(
    src: &str,
    env: &Env,
    filename: Option<&str>,
    target: TargetVersion,
) -> Result<Rc<CodeObject>, Error> {
    let mut stream = SourceStream::from_str(src, filename.unwrap_or("<string>"));
    compile_from_source(&mut stream, env, filename, target)
}

pub fn compile_from_stream(
    stream: &mut SourceStream,
    env: &Env,
) -> Result<Rc<CodeObject>, Error> {
    let filename = stream.filename().to_string();
    compile_from_source(stream, env, Some(&filename), TargetVersion::default())
}

fn compile_from_source(
    stream: &mut SourceStream,
    env: &Env,
    filename: Option<&str>,
    target: TargetVersion,
) -> Result<Rc<CodeObject>, Error> {
    match compose_from_stream(&mut Reader::new(), stream)? {
        Some(ast) => compile_from_ast_for(&ast, env, filename, target),
        // an empty unit still produces runnable code: it returns None
        None => compile_expression(Value::None, PositionMap::new(), env, filename, target),
    }
}

/// Lazily compiles each top-level form of a unit, sharing one environment so
/// macro definitions are visible to the forms that follow them
pub struct CompileAll {
    forms: ComposeAll,
    env: Env,
    filename: Option<String>,
    target: TargetVersion,
}

impl Iterator for CompileAll {
    type Item = Result<Rc<CodeObject>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.forms.next()? {
            Ok(ast) => Some(compile_from_ast_for(
                &ast,
                &self.env,
                self.filename.as_deref(),
                self.target,
            )),
            Err(e) => Some(Err(e.into())),
        }
    }
}

pub fn compile_all_from_str(src: &str, env: &Env, filename: Option<&str>) -> CompileAll {
    compile_all_from_str_for(src, env, filename, TargetVersion::default())
}

pub fn compile_all_from_str_for(
    src: &str,
    env: &Env,
    filename: Option<&str>,
    target: TargetVersion,
) -> CompileAll {
    CompileAll {
        forms: compose_all_from_stream(SourceStream::from_str(
            src,
            filename.unwrap_or("<string>"),
        )),
        env: env.clone(),
        filename: filename.map(str::to_string),
        target,
    }
}

pub fn compile_all_from_stream(stream: SourceStream, env: &Env) -> CompileAll {
    let filename = stream.filename().to_string();
    CompileAll {
        forms: compose_all_from_stream(stream),
        env: env.clone(),
        filename: Some(filename),
        target: TargetVersion::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::symbol;

    fn compiler() -> Compiler {
        Compiler::new(Env::new(), None, TargetVersion::default())
    }

    #[test]
    fn test_classification_is_exclusive() {
        let mut c = compiler();
        let root = c.root_space();
        c.request_var(root, "x");
        c.request_var(root, "x");

        let space = c.space(root);
        assert_eq!(space.global_vars, vec!["x"]);
        assert_eq!(space.names, vec!["x"]);
        assert!(space.fast_vars.is_empty());
        assert!(space.free_vars.is_empty());
    }

    #[test]
    fn test_parent_local_promoted_to_cell() {
        let mut c = compiler();
        let root = c.root_space();
        let outer = c.new_space(Some(root), &["x".to_string()], false, Some("outer"), None);
        let inner = c.new_space(Some(outer), &["y".to_string()], false, Some("inner"), None);

        c.request_var(inner, "x");

        assert_eq!(c.space(outer).cell_vars, vec!["x"]);
        assert!(c.space(outer).fast_vars.is_empty());
        assert_eq!(c.space(inner).free_vars, vec!["x"]);
        assert!(c.space(inner).global_vars.is_empty());
    }

    #[test]
    fn test_intermediate_scope_threads_free_var() {
        let mut c = compiler();
        let root = c.root_space();
        let a = c.new_space(Some(root), &["x".to_string()], false, Some("a"), None);
        let b = c.new_space(Some(a), &[], false, Some("b"), None);
        let d = c.new_space(Some(b), &[], false, Some("d"), None);

        c.request_var(d, "x");

        assert_eq!(c.space(a).cell_vars, vec!["x"]);
        assert_eq!(c.space(b).free_vars, vec!["x"]);
        assert_eq!(c.space(d).free_vars, vec!["x"]);
    }

    #[test]
    fn test_globals_are_never_captured() {
        let mut c = compiler();
        let root = c.root_space();
        c.request_var(root, "print");
        let kid = c.new_space(Some(root), &[], false, None, None);

        c.request_var(kid, "print");

        assert_eq!(c.space(kid).global_vars, vec!["print"]);
        assert!(c.space(root).cell_vars.is_empty());
    }

    #[test]
    fn test_define_forces_global() {
        let mut c = compiler();
        let root = c.root_space();
        let kid = c.new_space(Some(root), &["x".to_string()], false, None, None);
        c.pseudop_define(kid, "x");

        let space = c.space(kid);
        assert!(space.global_vars.iter().any(|v| v == "x"));
        assert!(space.names.iter().any(|v| v == "x"));
    }

    #[test]
    fn test_const_pool_keeps_types_distinct() {
        let mut c = compiler();
        let root = c.root_space();
        let space = &mut c.spaces[root];
        let i = space.declare_const(Value::Int(1));
        let b = space.declare_const(Value::Bool(true));
        let again = space.declare_const(Value::Int(1));
        assert_ne!(i, b);
        assert_eq!(i, again);
        // slot zero is reserved
        assert_eq!(space.consts[0], Value::None);
    }

    #[test]
    fn test_varargs_prologue() {
        let mut c = compiler();
        let root = c.root_space();
        let kid = c.new_space(Some(root), &["rest".to_string()], true, None, None);

        let ops = &c.space(kid).pseudops;
        assert!(matches!(&ops[0], Pseudop::GetVar(n) if n == "make-proper"));
        assert!(matches!(&ops[1], Pseudop::GetVar(n) if n == "rest"));
        assert!(matches!(&ops[2], Pseudop::CallVarargs(0)));
        assert!(matches!(&ops[3], Pseudop::SetVar(n) if n == "rest"));
        assert_eq!(max_stack(c.space(kid)).unwrap(), 2);
    }

    #[test]
    fn test_activation_restores_compiler_key() {
        let env = Env::new();
        env.define(COMPILER_KEY, Value::Symbol(symbol("previous")));

        let mut c = Compiler::new(env.clone(), None, TargetVersion::default());
        let root = c.root_space();
        c.activate(root, |c| {
            assert!(matches!(c.env.get(COMPILER_KEY), Some(Value::Str(_))));
            Ok(())
        })
        .unwrap();

        assert_eq!(env.get(COMPILER_KEY), Some(Value::Symbol(symbol("previous"))));
    }

    #[test]
    fn test_activation_restores_on_error() {
        let env = Env::new();
        let mut c = Compiler::new(env.clone(), None, TargetVersion::default());
        let root = c.root_space();
        let result: Result<(), Error> =
            c.activate(root, |_| Err(CompileError::InactiveScope.into()));
        assert!(result.is_err());
        assert_eq!(env.get(COMPILER_KEY), None);
        assert!(c.active_id().is_err());
    }

    #[test]
    fn test_max_stack_simple() {
        let mut c = compiler();
        let root = c.root_space();
        c.pseudop_const(root, Value::Int(1));
        c.pseudop_return(root);
        assert_eq!(max_stack(c.space(root)).unwrap(), 1);
    }

    #[test]
    fn test_max_stack_call() {
        let mut c = compiler();
        let root = c.root_space();
        c.pseudop_get_var(root, "f");
        c.pseudop_const(root, Value::Int(1));
        c.pseudop_const(root, Value::Int(2));
        c.pseudop_call(root, 2);
        c.pseudop_return(root);
        assert_eq!(max_stack(c.space(root)).unwrap(), 3);
    }

    #[test]
    fn test_max_stack_rejects_negative() {
        let mut c = compiler();
        let root = c.root_space();
        c.pseudop_pop(root);
        assert!(matches!(
            max_stack(c.space(root)),
            Err(CompileError::StackDepth(_))
        ));
    }

    #[test]
    fn test_max_stack_rejects_nonzero_exit() {
        let mut c = compiler();
        let root = c.root_space();
        c.pseudop_const(root, Value::Int(1));
        assert!(matches!(
            max_stack(c.space(root)),
            Err(CompileError::StackDepth(_))
        ));
    }

    #[test]
    fn test_max_stack_label_adoption() {
        let mut c = compiler();
        let root = c.root_space();
        let done = c.gen_label(root);

        // while-style loop: sentinel, test, conditional exit, body, jump back
        let top = c.gen_label(root);
        c.pseudop_const(root, Value::None);
        c.pseudop(root, Pseudop::Label(top));
        c.pseudop_get_var(root, "t");
        c.pseudop(root, Pseudop::PopJumpIfFalse(done));
        c.pseudop_pop(root);
        c.pseudop_const(root, Value::Int(1));
        c.pseudop(root, Pseudop::Jump(top));
        c.pseudop(root, Pseudop::Label(done));
        c.pseudop_return(root);

        assert_eq!(max_stack(c.space(root)).unwrap(), 2);
    }

    #[test]
    fn test_labels_unique_per_space() {
        let mut c = compiler();
        let root = c.root_space();
        let a = c.gen_label(root);
        let b = c.gen_label(root);
        assert_ne!(a, b);
        assert_eq!(format!("{}", a), "label_0001");
    }
}
