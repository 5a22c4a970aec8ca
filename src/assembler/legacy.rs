// ABOUTME: Legacy dialect encoder: variable-width instructions for targets up to 3.5

use super::opcode::Opcode;
use super::{Arg, Item, LineEntry};
use crate::codespace::Label;
use crate::error::CompileError;
use std::collections::HashMap;

/// Encodes the translated stream as variable-width instructions: one opcode
/// byte, plus two little-endian argument bytes when the opcode takes an
/// argument. Jumps are emitted with zeroed arguments and patched once every
/// label offset is known.
pub(crate) fn encode(items: &[Item]) -> Result<(Vec<u8>, Vec<LineEntry>), CompileError> {
    let mut coll: Vec<Vec<u8>> = Vec::new();
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
                if op.has_jabs() {
                    jabs.push((coll.len(), target_of(*op, *arg)?));
                    coll.push(vec![op.value(), 0, 0]);
                    offset += 3;
                } else if op.has_jrel() {
                    jrel.push((coll.len(), target_of(*op, *arg)?, offset));
                    coll.push(vec![op.value(), 0, 0]);
                    offset += 3;
                } else if op.has_arg() {
                    let value = imm_of(*arg);
                    if value > 0xffff {
                        return Err(CompileError::syntax(
                            format!("argument {} too wide for {:?}", value, op),
                            None,
                        ));
                    }
                    coll.push(vec![op.value(), (value & 0xff) as u8, (value >> 8) as u8]);
                    offset += 3;
                } else {
                    coll.push(vec![op.value()]);
                    offset += 1;
                }
            }
        }
    }

    // patch every jump with its resolved little-endian target
    for (index, label) in jabs {
        let target = resolve(&labels, label)?;
        coll[index][1] = (target & 0xff) as u8;
        coll[index][2] = ((target >> 8) & 0xff) as u8;
    }
    for (index, label, at) in jrel {
        let target = resolve(&labels, label)? as i64 - (at as i64 + 3);
        if !(0..=0xffff).contains(&target) {
            return Err(CompileError::UnknownLabel(format!(
                "relative jump target {} out of range",
                target
            )));
        }
        coll[index][1] = (target & 0xff) as u8;
        coll[index][2] = ((target >> 8) & 0xff) as u8;
    }

    Ok((coll.concat(), lnt))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{Dialect, TargetVersion};
    use crate::codespace::{Compiler, Pseudop};
    use crate::env::Env;
    use crate::value::Value;

    fn items_for(build: impl FnOnce(&mut Compiler, usize)) -> Vec<Item> {
        let mut c = Compiler::new(Env::new(), None, TargetVersion::V3_5);
        let root = c.root_space();
        build(&mut c, root);
        crate::assembler::translate(c.space(root), Dialect::Legacy).unwrap()
    }

    #[test]
    fn test_mixed_width_encoding() {
        let items = items_for(|c, root| {
            c.pseudop_const(root, Value::Int(5));
            c.pseudop_pop(root);
        });
        let (code, _) = encode(&items).unwrap();
        // LOAD_CONST 1 (3 bytes) then POP_TOP (1 byte)
        assert_eq!(code, vec![100, 1, 0, 1]);
    }

    #[test]
    fn test_backward_absolute_jump() {
        let items = items_for(|c, root| {
            let top = c.gen_label(root);
            c.pseudop_const(root, Value::None); // 3 bytes at 0
            c.pseudop(root, Pseudop::Label(top)); // offset 3
            c.pseudop_pop(root); // 1 byte at 3
            c.pseudop_const(root, Value::None); // 3 bytes at 4
            c.pseudop(root, Pseudop::Jump(top)); // 3 bytes at 7
            c.pseudop_pop(root);
        });
        let (code, _) = encode(&items).unwrap();
        assert_eq!(&code[7..10], &[113, 3, 0]);
    }

    #[test]
    fn test_forward_relative_jump() {
        let items = items_for(|c, root| {
            let end = c.gen_label(root);
            c.pseudop(root, Pseudop::JumpForward(end)); // 3 bytes at 0
            c.pseudop_const(root, Value::None); // 3 bytes at 3
            c.pseudop_pop(root); // 1 byte at 6
            c.pseudop(root, Pseudop::Label(end)); // offset 7
        });
        let (code, _) = encode(&items).unwrap();
        // 7 - (0 + 3) = 4
        assert_eq!(&code[0..3], &[110, 4, 0]);
    }

    #[test]
    fn test_position_records_byte_offsets() {
        let items = items_for(|c, root| {
            c.pseudop_position(root, 3, 1);
            c.pseudop_const(root, Value::Int(1));
            c.pseudop_position(root, 4, 0);
            c.pseudop_pop(root);
        });
        let (_, lnt) = encode(&items).unwrap();
        assert_eq!(lnt, vec![(0, 3, 1), (3, 4, 0)]);
    }

    #[test]
    fn test_unknown_label_is_an_error() {
        let items = items_for(|c, root| {
            let ghost = c.gen_label(root);
            c.pseudop(root, Pseudop::Jump(ghost));
        });
        assert!(matches!(
            encode(&items),
            Err(CompileError::UnknownLabel(_))
        ));
    }
}
