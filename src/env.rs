// ABOUTME: Compilation environment: module bindings over a builtins table

use crate::codespace::Compiler;
use crate::error::Error;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Well-known key under which the active compiler is noted while a code
/// space is activated
pub const COMPILER_KEY: &str = "__compiler__";

/// A special form's lowering function. Returning `None` means pseudo-ops
/// were emitted directly; returning `Some(expr)` hands back a rewritten
/// expression for the compiler to start over on.
pub type SpecialFn = fn(&mut Compiler, &Value) -> Result<Option<Value>, Error>;

/// A built-in special form. These are compile-time only: they resolve during
/// special lookup and are never callable at run time.
#[derive(Debug, Clone, Copy)]
pub struct Special {
    name: &'static str,
    invoke: SpecialFn,
}

impl Special {
    pub fn new(name: &'static str, invoke: SpecialFn) -> Special {
        Special { name, invoke }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn invoke(&self, compiler: &mut Compiler, tail: &Value) -> Result<Option<Value>, Error> {
        (self.invoke)(compiler, tail)
    }
}

/// The compilation environment: module-level bindings backed by a builtins
/// table that is consulted when a name is not bound at module level.
#[derive(Debug, Clone)]
pub struct Env(Rc<RefCell<EnvInner>>);

#[derive(Debug)]
struct EnvInner {
    bindings: HashMap<String, Value>,
    builtins: HashMap<String, Value>,
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    /// An environment with no builtins at all
    pub fn new() -> Env {
        Env(Rc::new(RefCell::new(EnvInner {
            bindings: HashMap::new(),
            builtins: HashMap::new(),
        })))
    }

    /// An environment whose builtins table holds every built-in special form
    pub fn with_builtins() -> Env {
        let env = Env::new();
        crate::specials::register_specials(&env);
        env
    }

    /// Binds a name at module level
    pub fn define(&self, name: &str, value: Value) {
        self.0.borrow_mut().bindings.insert(name.to_string(), value);
    }

    /// Binds a name in the builtins table
    pub fn define_builtin(&self, name: &str, value: Value) {
        self.0.borrow_mut().builtins.insert(name.to_string(), value);
    }

    /// Module-level lookup only
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.borrow().bindings.get(name).cloned()
    }

    /// Module-level lookup, falling back to builtins
    pub fn resolve(&self, name: &str) -> Option<Value> {
        let inner = self.0.borrow();
        inner
            .bindings
            .get(name)
            .or_else(|| inner.builtins.get(name))
            .cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.0.borrow_mut().bindings.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.borrow().bindings.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_get() {
        let env = Env::new();
        env.define("x", Value::Int(42));
        assert_eq!(env.get("x"), Some(Value::Int(42)));
        assert_eq!(env.get("y"), None);
    }

    #[test]
    fn test_module_bindings_shadow_builtins() {
        let env = Env::new();
        env.define_builtin("x", Value::Int(1));
        assert_eq!(env.get("x"), None);
        assert_eq!(env.resolve("x"), Some(Value::Int(1)));

        env.define("x", Value::Int(2));
        assert_eq!(env.resolve("x"), Some(Value::Int(2)));
    }

    #[test]
    fn test_remove() {
        let env = Env::new();
        env.define("x", Value::Int(1));
        assert_eq!(env.remove("x"), Some(Value::Int(1)));
        assert_eq!(env.get("x"), None);
        assert_eq!(env.remove("x"), None);
    }

    #[test]
    fn test_clones_share_state() {
        let env = Env::new();
        let alias = env.clone();
        alias.define("x", Value::Int(9));
        assert_eq!(env.get("x"), Some(Value::Int(9)));
    }
}
