// ABOUTME: Pseudo-op assembly: version dispatch, opcode translation, line tables

pub mod legacy;
pub mod opcode;
pub mod wordcode;

use crate::code::{CodeFlags, CodeObject};
use crate::codespace::{max_stack, CodeSpace, Label, Pseudop, COMPARE_EXCEPTION_MATCH};
use crate::error::{CompileError, Error};
use crate::value::Value;
use opcode::Opcode;
use std::fmt;
use tracing::debug;

/// The declared target-VM version an emitted code object must run on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetVersion {
    pub major: u16,
    pub minor: u16,
}

impl TargetVersion {
    pub const fn new(major: u16, minor: u16) -> TargetVersion {
        TargetVersion { major, minor }
    }

    pub const V3_5: TargetVersion = TargetVersion::new(3, 5);
    pub const V3_6: TargetVersion = TargetVersion::new(3, 6);
}

impl Default for TargetVersion {
    fn default() -> Self {
        TargetVersion::V3_6
    }
}

impl fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The two supported encodings: variable-width bytecode up to 3.5, fixed
/// two-byte wordcode from 3.6 on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Legacy,
    Wordcode,
}

pub fn dialect_for(target: TargetVersion) -> Result<Dialect, Error> {
    match (target.major, target.minor) {
        (3, 3..=5) => Ok(Dialect::Legacy),
        (3, minor) if minor >= 6 => Ok(Dialect::Wordcode),
        (major, minor) => Err(Error::UnsupportedVersion { major, minor }),
    }
}

/// Argument slot of a translated instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arg {
    None,
    Imm(u32),
    Target(Label),
}

/// One element of the translated instruction stream. Labels and positions
/// are bookkeeping, not encoded instructions.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Item {
    Op(Opcode, Arg),
    Label(Label),
    Position(u32, u32),
}

/// A raw line-table record: byte offset, line, column
pub(crate) type LineEntry = (u32, u32, u32);

/// Assembles one code space for the given target
pub fn assemble(
    space: &CodeSpace,
    filename: Option<&str>,
    target: TargetVersion,
) -> Result<CodeObject, Error> {
    let stacksize = max_stack(space)?;
    let dialect = dialect_for(target)?;
    let items = translate(space, dialect)?;

    let (code, lnt) = match dialect {
        Dialect::Legacy => legacy::encode(&items)?,
        Dialect::Wordcode => wordcode::encode(&items)?,
    };

    let (firstlineno, lnotab) = lnt_compile(
        &lnt,
        space.declared_at.map(|p| p.0),
        dialect == Dialect::Wordcode,
    );

    let mut argcount = space.args.len() as u32;
    let mut flags = CodeFlags::NEWLOCALS | CodeFlags::NESTED;
    if space.varargs {
        argcount -= 1;
        flags |= CodeFlags::VARARGS;
    }
    if space.free_vars.is_empty() {
        flags |= CodeFlags::NOFREE;
    }

    let mut varnames = space.fast_vars.clone();
    varnames.extend(space.cell_vars.iter().cloned());

    debug!(
        name = ?space.name,
        bytes = code.len(),
        stacksize,
        %target,
        "assembled code space"
    );

    Ok(CodeObject {
        argcount,
        nlocals: (space.fast_vars.len() + space.cell_vars.len()) as u32,
        stacksize,
        flags,
        code,
        consts: space.consts.clone(),
        names: space.names.clone(),
        varnames,
        filename: filename.unwrap_or("<thistle>").to_string(),
        name: space.name.clone().unwrap_or_else(|| "<anon>".to_string()),
        firstlineno,
        lnotab,
        freevars: space.free_vars.clone(),
        cellvars: space.cell_vars.clone(),
    })
}

// ============================================================================
// Pseudo-op translation
// ============================================================================

/// Walks the pseudo-op buffer yielding (opcode, argument) pairs, resolving
/// constant-pool and name-pool indices. Only the varargs call and closure
/// construction differ between dialects.
pub(crate) fn translate(space: &CodeSpace, dialect: Dialect) -> Result<Vec<Item>, CompileError> {
    let mut items = Vec::with_capacity(space.pseudops.len());

    for op in &space.pseudops {
        match op {
            Pseudop::Position(line, col) => items.push(Item::Position(*line, *col)),
            Pseudop::Label(l) => items.push(Item::Label(*l)),

            Pseudop::Const(v) => {
                let i = space
                    .const_index(v)
                    .ok_or_else(|| CompileError::MissingConst(format!("{}", v)))?;
                items.push(Item::Op(Opcode::LoadConst, Arg::Imm(i as u32)));
            }

            Pseudop::GetVar(n) => items.push(var_access(
                space,
                n,
                Opcode::LoadDeref,
                Opcode::LoadFast,
                Opcode::LoadGlobal,
            )?),
            Pseudop::SetVar(n) => items.push(var_access(
                space,
                n,
                Opcode::StoreDeref,
                Opcode::StoreFast,
                Opcode::StoreGlobal,
            )?),
            Pseudop::DeleteVar(n) => items.push(var_access(
                space,
                n,
                Opcode::DeleteDeref,
                Opcode::DeleteFast,
                Opcode::DeleteGlobal,
            )?),

            Pseudop::GetGlobal(n) => {
                items.push(Item::Op(Opcode::LoadGlobal, Arg::Imm(name_index(space, n)?)));
            }
            Pseudop::GetAttr(n) => {
                items.push(Item::Op(Opcode::LoadAttr, Arg::Imm(name_index(space, n)?)));
            }
            Pseudop::SetAttr(n) => {
                items.push(Item::Op(Opcode::StoreAttr, Arg::Imm(name_index(space, n)?)));
            }

            Pseudop::Define(n) => {
                if !space.global_vars.iter().any(|v| v == n) {
                    return Err(CompileError::syntax(
                        format!("undeclared global name {}", n),
                        None,
                    ));
                }
                items.push(Item::Op(Opcode::StoreGlobal, Arg::Imm(name_index(space, n)?)));
            }

            Pseudop::Call(argc) => {
                items.push(Item::Op(Opcode::CallFunction, Arg::Imm(*argc as u32)));
            }
            Pseudop::CallVarargs(argc) => match dialect {
                Dialect::Legacy => {
                    items.push(Item::Op(Opcode::CallFunctionVar, Arg::Imm(*argc as u32)));
                }
                Dialect::Wordcode => {
                    items.push(Item::Op(Opcode::CallFunctionEx, Arg::Imm(0)));
                }
            },

            Pseudop::Lambda(code) => {
                let cells = space.cell_vars.len() as u32;
                for free in &code.freevars {
                    let fi = if let Some(i) = space.cell_vars.iter().position(|v| v == free) {
                        i as u32
                    } else if let Some(i) = space.free_vars.iter().position(|v| v == free) {
                        cells + i as u32
                    } else {
                        return Err(CompileError::syntax(
                            format!("missing closure cell {}", free),
                            None,
                        ));
                    };
                    items.push(Item::Op(Opcode::LoadClosure, Arg::Imm(fi)));
                }

                let ci = space
                    .const_index(&Value::Code(code.clone()))
                    .ok_or_else(|| CompileError::MissingConst(code.name.clone()))?;
                let ni = space
                    .const_index(&Value::string(&code.name))
                    .ok_or_else(|| CompileError::MissingConst(code.name.clone()))?;

                if code.is_closure() {
                    items.push(Item::Op(
                        Opcode::BuildTuple,
                        Arg::Imm(code.freevars.len() as u32),
                    ));
                    items.push(Item::Op(Opcode::LoadConst, Arg::Imm(ci as u32)));
                    items.push(Item::Op(Opcode::LoadConst, Arg::Imm(ni as u32)));
                    match dialect {
                        Dialect::Legacy => {
                            items.push(Item::Op(Opcode::MakeClosure, Arg::Imm(0)));
                        }
                        Dialect::Wordcode => {
                            items.push(Item::Op(Opcode::MakeFunction, Arg::Imm(0x08)));
                        }
                    }
                } else {
                    items.push(Item::Op(Opcode::LoadConst, Arg::Imm(ci as u32)));
                    items.push(Item::Op(Opcode::LoadConst, Arg::Imm(ni as u32)));
                    items.push(Item::Op(Opcode::MakeFunction, Arg::Imm(0)));
                }
            }

            Pseudop::BuildTuple(n) => {
                items.push(Item::Op(Opcode::BuildTuple, Arg::Imm(*n as u32)));
            }
            Pseudop::BuildTupleUnpack(n) => {
                items.push(Item::Op(Opcode::BuildTupleUnpack, Arg::Imm(*n as u32)));
            }

            Pseudop::Pop => items.push(Item::Op(Opcode::PopTop, Arg::None)),
            Pseudop::Dup => items.push(Item::Op(Opcode::DupTop, Arg::None)),
            Pseudop::RotTwo => items.push(Item::Op(Opcode::RotTwo, Arg::None)),
            Pseudop::RotThree => items.push(Item::Op(Opcode::RotThree, Arg::None)),
            Pseudop::RetVal => items.push(Item::Op(Opcode::ReturnValue, Arg::None)),

            Pseudop::Jump(l) => items.push(Item::Op(Opcode::JumpAbsolute, Arg::Target(*l))),
            Pseudop::JumpForward(l) => {
                items.push(Item::Op(Opcode::JumpForward, Arg::Target(*l)));
            }
            Pseudop::PopJumpIfTrue(l) => {
                items.push(Item::Op(Opcode::PopJumpIfTrue, Arg::Target(*l)));
            }
            Pseudop::PopJumpIfFalse(l) => {
                items.push(Item::Op(Opcode::PopJumpIfFalse, Arg::Target(*l)));
            }

            Pseudop::SetupLoop(l) => items.push(Item::Op(Opcode::SetupLoop, Arg::Target(*l))),
            Pseudop::SetupExcept(l) => {
                items.push(Item::Op(Opcode::SetupExcept, Arg::Target(*l)));
            }
            Pseudop::SetupFinally(l) => {
                items.push(Item::Op(Opcode::SetupFinally, Arg::Target(*l)));
            }
            Pseudop::SetupWith(l) => items.push(Item::Op(Opcode::SetupWith, Arg::Target(*l))),
            Pseudop::PopBlock => items.push(Item::Op(Opcode::PopBlock, Arg::None)),
            Pseudop::PopExcept => items.push(Item::Op(Opcode::PopExcept, Arg::None)),
            Pseudop::EndFinally => items.push(Item::Op(Opcode::EndFinally, Arg::None)),
            Pseudop::WithCleanupStart => {
                items.push(Item::Op(Opcode::WithCleanupStart, Arg::None));
            }
            Pseudop::WithCleanupFinish => {
                items.push(Item::Op(Opcode::WithCleanupFinish, Arg::None));
            }

            Pseudop::CompareOp(cmp) => {
                items.push(Item::Op(Opcode::CompareOp, Arg::Imm(*cmp as u32)));
            }
            Pseudop::ExceptionMatch => {
                items.push(Item::Op(
                    Opcode::CompareOp,
                    Arg::Imm(COMPARE_EXCEPTION_MATCH as u32),
                ));
            }
            Pseudop::Item => items.push(Item::Op(Opcode::BinarySubscr, Arg::None)),
            Pseudop::Iter => items.push(Item::Op(Opcode::GetIter, Arg::None)),

            Pseudop::UnaryPositive => items.push(Item::Op(Opcode::UnaryPositive, Arg::None)),
            Pseudop::UnaryNegative => items.push(Item::Op(Opcode::UnaryNegative, Arg::None)),
            Pseudop::UnaryNot => items.push(Item::Op(Opcode::UnaryNot, Arg::None)),
            Pseudop::UnaryInvert => items.push(Item::Op(Opcode::UnaryInvert, Arg::None)),
            Pseudop::BinaryAdd => items.push(Item::Op(Opcode::BinaryAdd, Arg::None)),
            Pseudop::BinarySubtract => items.push(Item::Op(Opcode::BinarySubtract, Arg::None)),
            Pseudop::BinaryMultiply => items.push(Item::Op(Opcode::BinaryMultiply, Arg::None)),
            Pseudop::BinaryMatrixMultiply => {
                items.push(Item::Op(Opcode::BinaryMatrixMultiply, Arg::None));
            }
            Pseudop::BinaryTrueDivide => {
                items.push(Item::Op(Opcode::BinaryTrueDivide, Arg::None));
            }
            Pseudop::BinaryFloorDivide => {
                items.push(Item::Op(Opcode::BinaryFloorDivide, Arg::None));
            }
            Pseudop::BinaryPower => items.push(Item::Op(Opcode::BinaryPower, Arg::None)),
            Pseudop::BinaryModulo => items.push(Item::Op(Opcode::BinaryModulo, Arg::None)),
            Pseudop::BinaryLshift => items.push(Item::Op(Opcode::BinaryLshift, Arg::None)),
            Pseudop::BinaryRshift => items.push(Item::Op(Opcode::BinaryRshift, Arg::None)),
            Pseudop::BinaryAnd => items.push(Item::Op(Opcode::BinaryAnd, Arg::None)),
            Pseudop::BinaryXor => items.push(Item::Op(Opcode::BinaryXor, Arg::None)),
            Pseudop::BinaryOr => items.push(Item::Op(Opcode::BinaryOr, Arg::None)),

            Pseudop::Raise(argc) => {
                items.push(Item::Op(Opcode::RaiseVarargs, Arg::Imm(*argc as u32)));
            }
        }
    }

    Ok(items)
}

/// Classifies a variable access into deref/fast/global opcodes with the
/// matching slot index. Cell slots come first, then free slots.
fn var_access(
    space: &CodeSpace,
    name: &str,
    deref: Opcode,
    fast: Opcode,
    global: Opcode,
) -> Result<Item, CompileError> {
    if let Some(i) = space.cell_vars.iter().position(|v| v == name) {
        return Ok(Item::Op(deref, Arg::Imm(i as u32)));
    }
    if let Some(i) = space.free_vars.iter().position(|v| v == name) {
        return Ok(Item::Op(
            deref,
            Arg::Imm((space.cell_vars.len() + i) as u32),
        ));
    }
    if let Some(i) = space.fast_vars.iter().position(|v| v == name) {
        return Ok(Item::Op(fast, Arg::Imm(i as u32)));
    }
    if space.global_vars.iter().any(|v| v == name) {
        return Ok(Item::Op(global, Arg::Imm(name_index(space, name)?)));
    }
    Err(CompileError::syntax(
        format!("unresolved variable {}", name),
        None,
    ))
}

fn name_index(space: &CodeSpace, name: &str) -> Result<u32, CompileError> {
    space
        .names
        .iter()
        .position(|v| v == name)
        .map(|i| i as u32)
        .ok_or_else(|| CompileError::syntax(format!("{} missing from name pool", name), None))
}

// ============================================================================
// Line-number table packing
// ============================================================================

/// Packs (offset, line) records into delta byte-pairs. Repeated lines are
/// coalesced; offset gaps beyond 255 and line deltas beyond ±127 emit
/// continuation pairs. When `keep_negative` is unset (the legacy dialect)
/// entries whose line moves backwards are dropped, so a call is attributed
/// to its closing line.
pub(crate) fn lnt_compile(
    lnt: &[LineEntry],
    firstline: Option<u32>,
    keep_negative: bool,
) -> (u32, Vec<u8>) {
    let Some(&(_, first_entry_line, _)) = lnt.first() else {
        return (firstline.unwrap_or(1), Vec::new());
    };
    let firstline = firstline.unwrap_or(first_entry_line);

    let mut out = Vec::new();
    let mut prev_offset = 0u32;
    let mut prev_line = firstline as i64;

    for &(offset, line, _col) in lnt {
        if !out.is_empty() && line as i64 == prev_line {
            continue;
        }

        let mut d_offset = offset - prev_offset;
        let mut d_line = line as i64 - prev_line;

        if d_line < 0 && !keep_negative {
            continue;
        }

        while d_offset > 255 {
            out.push(255);
            out.push(0);
            d_offset -= 255;
        }
        let mut offset_byte = d_offset as u8;
        while d_line > 127 {
            out.push(offset_byte);
            out.push(127);
            offset_byte = 0;
            d_line -= 127;
        }
        while d_line < -128 {
            out.push(offset_byte);
            out.push((-128i8) as u8);
            offset_byte = 0;
            d_line += 128;
        }
        out.push(offset_byte);
        out.push((d_line as i8) as u8);

        prev_offset = offset;
        prev_line = line as i64;
    }

    (firstline, out)
}
