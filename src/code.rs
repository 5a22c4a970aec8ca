// ABOUTME: Emitted code objects and their flag word

use crate::value::Value;
use bitflags::bitflags;

bitflags! {
    /// Flag bits of an emitted code object, matching the target VM's ABI
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CodeFlags: u32 {
        const OPTIMIZED = 0x0001;
        const NEWLOCALS = 0x0002;
        const VARARGS = 0x0004;
        const VARKEYWORDS = 0x0008;
        const NESTED = 0x0010;
        const GENERATOR = 0x0020;
        const NOFREE = 0x0040;
        const COROUTINE = 0x0080;
        const ITERABLE_COROUTINE = 0x0100;
    }
}

/// A fully assembled function body, ready for the target VM. Field layout
/// follows the VM's code-object ABI: locals are the fast slots followed by
/// the cell slots, and the line-number table is packed per dialect.
#[derive(Debug, Clone)]
pub struct CodeObject {
    pub argcount: u32,
    pub nlocals: u32,
    pub stacksize: u32,
    pub flags: CodeFlags,
    pub code: Vec<u8>,
    pub consts: Vec<Value>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub filename: String,
    pub name: String,
    pub firstlineno: u32,
    pub lnotab: Vec<u8>,
    pub freevars: Vec<String>,
    pub cellvars: Vec<String>,
}

impl CodeObject {
    /// True when this code captures anything from an enclosing scope
    pub fn is_closure(&self) -> bool {
        !self.freevars.is_empty()
    }
}
