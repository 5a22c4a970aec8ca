// ABOUTME: Wordcode dialect encoder: fixed two-byte instructions for targets 3.6+

use super::opcode::Opcode;
use super::{Arg, Item, LineEntry};
use crate::codespace::Label;
use crate::error::CompileError;
use std::collections::HashMap;

/// Encodes the translated stream as fixed two-byte units. Every jump is
/// pre-padded with an `EXTENDED_ARG` unit so the patch pass always has
/// sixteen bits of target to write into: the high byte lands in the
/// `EXTENDED_ARG`, the low byte in the jump itself.
pub(crate) fn encode(items: &[Item]) -> Result<(Vec<u8>, Vec<LineEntry>), CompileError> {
    let mut coll: Vec<[u8; 2]> = Vec::new();
    let mut offset = 0u32;
    let mut labels: HashMap<Label, u32> = HashMap::new();
    let mut jabs: Vec<(usize, Label)> = Vec::new();
    let mut jrel: Vec<(usize, Label, u32)> = Vec::new();
    let mut lnt: Vec<LineEntry> = Vec::new();

    for item in items {
        match item {
            Item::Label(label) => {
                labels.insert(*label, offset);
            }
            Item::Position(line, col) => {
                lnt.push((offset, *line, *col));
            }
            Item::Op(op, arg) => {
                if op.has_jabs() || op.has_jrel() {
                    let label = target_of(*op, *arg)?;
                    if op.has_jabs() {
                        jabs.push((coll.len(), label));
                    } else {
                        jrel.push((coll.len(), label, offset));
                    }
                    coll.push([Opcode::ExtendedArg.value(), 0]);
                    coll.push([op.value(), 0]);
                    offset += 4;
                } else {
                    let value = imm_of(*arg);
                    // wide arguments get their own EXTENDED_ARG prefixes
                    for shift in [24u32, 16, 8] {
                        let byte = (value >> shift) & 0xff;
                        if byte != 0 || value >> shift > 0xff {
                            coll.push([Opcode::ExtendedArg.value(), byte as u8]);
                            offset += 2;
                        }
                    }
                    coll.push([op.value(), (value & 0xff) as u8]);
                    offset += 2;
                }
            }
        }
    }

    for (index, label) in jabs {
        let target = resolve(&labels, label)?;
        patch(&mut coll, index, target)?;
    }
    for (index, label, at) in jrel {
        let target = resolve(&labels, label)? as i64 - (at as i64 + 4);
        if target < 0 {
            return Err(CompileError::UnknownLabel(format!(
                "relative jump target {} out of range",
                target
            )));
        }
        patch(&mut coll, index, target as u32)?;
    }

    Ok((coll.concat(), lnt))
}

fn patch(coll: &mut [[u8; 2]], index: usize, target: u32) -> Result<(), CompileError> {
    if target > 0xffff {
        return Err(CompileError::UnknownLabel(format!(
            "jump target {} exceeds sixteen bits",
            target
        )));
    }
    coll[index][1] = ((target >> 8) & 0xff) as u8;
    coll[index + 1][1] = (target & 0xff) as u8;
    Ok(())
}

fn target_of(op: Opcode, arg: Arg) -> Result<Label, CompileError> {
    match arg {
        Arg::Target(label) => Ok(label),
        _ => Err(CompileError::syntax(
            format!("{:?} emitted without a jump target", op),
            None,
        )),
    }
}

fn imm_of(arg: Arg) -> u32 {
    match arg {
        Arg::Imm(value) => value,
        _ => 0,
    }
}

fn resolve(labels: &HashMap<Label, u32>, label: Label) -> Result<u32, CompileError> {
    labels
        .get(&label)
        .copied()
        .ok_or_else(|| CompileError::UnknownLabel(format!("{}", label)))
}
