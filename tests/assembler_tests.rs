// ABOUTME: Integration tests for bytecode encoding across both dialects

use thistle::{compile_from_str, compile_from_str_for, Env, Error, TargetVersion};

// a few wire values, for reading assembled code back
const POP_TOP: u8 = 1;
const RETURN_VALUE: u8 = 83;
const LOAD_CONST: u8 = 100;
const JUMP_ABSOLUTE: u8 = 113;
const POP_JUMP_IF_FALSE: u8 = 114;
const LOAD_GLOBAL: u8 = 116;
const CALL_FUNCTION: u8 = 131;
const MAKE_FUNCTION: u8 = 132;
const MAKE_CLOSURE: u8 = 134;
const CALL_FUNCTION_VAR: u8 = 140;
const CALL_FUNCTION_EX: u8 = 142;
const EXTENDED_ARG: u8 = 144;

/// Decodes wordcode into (offset, opcode, argument) rows, folding
/// EXTENDED_ARG prefixes into the following instruction's argument
fn word_ops(code: &[u8]) -> Vec<(u32, u8, u32)> {
    let mut rows = Vec::new();
    let mut ext: u32 = 0;
    let mut offset = 0u32;
    for chunk in code.chunks(2) {
        let (op, arg) = (chunk[0], chunk[1] as u32);
        if op == EXTENDED_ARG {
            ext = (ext << 8) | arg;
        } else {
            rows.push((offset, op, (ext << 8) | arg));
            ext = 0;
        }
        offset += 2;
    }
    rows
}

/// Decodes legacy bytecode into (offset, opcode, argument) rows
fn legacy_ops(code: &[u8]) -> Vec<(u32, u8, u32)> {
    let mut rows = Vec::new();
    let mut i = 0usize;
    while i < code.len() {
        let op = code[i];
        if op >= 90 {
            let arg = code[i + 1] as u32 | ((code[i + 2] as u32) << 8);
            rows.push((i as u32, op, arg));
            i += 3;
        } else {
            rows.push((i as u32, op, 0));
            i += 1;
        }
    }
    rows
}

fn compile_words(src: &str) -> Vec<u8> {
    compile_from_str(src, &Env::with_builtins(), None)
        .expect("compile failed")
        .code
        .clone()
}

#[test]
fn test_while_loop_jump_shape() {
    let code = compile_words("(while (gt? i 0) (set-var i (sub i 1)))");
    let rows = word_ops(&code);

    let conditionals: Vec<_> = rows
        .iter()
        .filter(|(_, op, _)| *op == POP_JUMP_IF_FALSE)
        .collect();
    let jumps: Vec<_> = rows
        .iter()
        .filter(|(_, op, _)| *op == JUMP_ABSOLUTE)
        .collect();

    assert_eq!(conditionals.len(), 1);
    assert_eq!(jumps.len(), 1);

    // the exit jump goes forward, the loop jump goes backward
    let (cond_at, _, cond_target) = *conditionals[0];
    let (jump_at, _, jump_target) = *jumps[0];
    assert!(cond_target > cond_at);
    assert!(jump_target < jump_at);

    // and the loop jump lands exactly where the condition is re-evaluated
    assert!(rows.iter().any(|&(off, _, _)| off == jump_target));
}

#[test]
fn test_module_ends_with_return() {
    let code = compile_words("(f 1)");
    assert_eq!(code[code.len() - 2], RETURN_VALUE);
}

#[test]
fn test_simple_call_sequence() {
    let code = compile_words("(f 1 2)");
    let rows = word_ops(&code);
    let ops: Vec<u8> = rows.iter().map(|&(_, op, _)| op).collect();
    assert_eq!(
        ops,
        vec![
            LOAD_GLOBAL,
            LOAD_CONST,
            LOAD_CONST,
            CALL_FUNCTION,
            RETURN_VALUE
        ]
    );
    assert_eq!(rows[3].2, 2); // two arguments
}

#[test]
fn test_dialects_encode_the_same_program_differently() {
    let src = "(cond ((f) 1) (else 2))";
    let env = Env::with_builtins();
    let legacy = compile_from_str_for(src, &env, None, TargetVersion::V3_5).unwrap();
    let words = compile_from_str_for(src, &env, None, TargetVersion::V3_6).unwrap();

    assert_ne!(legacy.code, words.code);

    // legacy jumps carry their target inline with no padding
    assert!(!legacy.code.contains(&EXTENDED_ARG));
    let legacy_rows = legacy_ops(&legacy.code);
    assert!(legacy_rows
        .iter()
        .any(|&(_, op, _)| op == POP_JUMP_IF_FALSE));

    // wordcode pre-pads every jump with EXTENDED_ARG
    let ext_count = words
        .code
        .chunks(2)
        .filter(|chunk| chunk[0] == EXTENDED_ARG)
        .count();
    let jump_count = word_ops(&words.code)
        .iter()
        .filter(|&&(_, op, _)| op == POP_JUMP_IF_FALSE || op == JUMP_ABSOLUTE)
        .count();
    assert!(ext_count >= jump_count);
}

#[test]
fn test_varargs_call_opcode_differs_by_dialect() {
    let src = "`(1 ,@(f))";
    let env = Env::with_builtins();
    let legacy = compile_from_str_for(src, &env, None, TargetVersion::V3_5).unwrap();
    let words = compile_from_str_for(src, &env, None, TargetVersion::V3_6).unwrap();

    assert!(legacy_ops(&legacy.code)
        .iter()
        .any(|&(_, op, _)| op == CALL_FUNCTION_VAR));
    assert!(word_ops(&words.code)
        .iter()
        .any(|&(_, op, _)| op == CALL_FUNCTION_EX));
}

#[test]
fn test_closure_construction_differs_by_dialect() {
    let src = "(lambda (x) (lambda (y) x))";
    let env = Env::with_builtins();

    let words = compile_from_str_for(src, &env, None, TargetVersion::V3_6).unwrap();
    let outer = words
        .consts
        .iter()
        .find_map(|c| match c {
            thistle::Value::Code(inner) => Some(inner.clone()),
            _ => None,
        })
        .unwrap();
    let rows = word_ops(&outer.code);
    // MAKE_FUNCTION with the closure bit set
    assert!(rows
        .iter()
        .any(|&(_, op, arg)| op == MAKE_FUNCTION && arg == 0x08));

    let legacy = compile_from_str_for(src, &env, None, TargetVersion::V3_5).unwrap();
    let outer = legacy
        .consts
        .iter()
        .find_map(|c| match c {
            thistle::Value::Code(inner) => Some(inner.clone()),
            _ => None,
        })
        .unwrap();
    assert!(legacy_ops(&outer.code)
        .iter()
        .any(|&(_, op, _)| op == MAKE_CLOSURE));
}

#[test]
fn test_line_number_table_decodes_in_wordcode() {
    let src = "(begin\n  (f 1)\n  (g 2))";
    let code = compile_from_str(src, &Env::with_builtins(), None).unwrap();

    let mut line = code.firstlineno as i64;
    let mut lines = vec![line];
    for chunk in code.lnotab.chunks(2) {
        line += chunk[1] as i8 as i64;
        lines.push(line);
    }
    assert!(lines.contains(&2));
    assert!(lines.contains(&3));
}

#[test]
fn test_legacy_line_table_skips_backward_lines() {
    // the closing call of a multi-line form points back at the opening line;
    // the legacy dialect drops that backward step
    let src = "(f (g)\n   (h))";
    let env = Env::with_builtins();
    let legacy = compile_from_str_for(src, &env, None, TargetVersion::V3_5).unwrap();

    let mut line = legacy.firstlineno as i64;
    for chunk in legacy.lnotab.chunks(2) {
        let delta = chunk[1] as i8 as i64;
        assert!(delta >= 0);
        line += delta;
    }
    assert!(line >= legacy.firstlineno as i64);
}

#[test]
fn test_begin_pops_between_expressions() {
    let code = compile_words("(begin 1 2)");
    let rows = word_ops(&code);
    assert!(rows.iter().any(|&(_, op, _)| op == POP_TOP));
}

#[test]
fn test_unsupported_versions_are_rejected() {
    let env = Env::with_builtins();
    for (major, minor) in [(2, 7), (3, 2), (4, 0)] {
        let result =
            compile_from_str_for("(f)", &env, None, TargetVersion::new(major, minor));
        assert!(matches!(
            result,
            Err(Error::UnsupportedVersion { .. })
        ));
    }
}

#[test]
fn test_closure_stacksize_counts_construction() {
    let code = compile_from_str(
        "((lambda (x) (lambda (y) (add x y))) 3)",
        &Env::with_builtins(),
        None,
    )
    .unwrap();

    // module level: plain function construction peaks at the two
    // code/name constant loads
    assert_eq!(code.stacksize, 2);

    let outer = code
        .consts
        .iter()
        .find_map(|c| match c {
            thistle::Value::Code(inner) => Some(inner.clone()),
            _ => None,
        })
        .unwrap();

    // the outer body builds the inner closure: its one captured cell,
    // the cell tuple, and the two constants stacked above it
    let inner = outer
        .consts
        .iter()
        .find_map(|c| match c {
            thistle::Value::Code(inner) => Some(inner.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(inner.freevars, vec!["x"]);
    assert_eq!(outer.stacksize, 3);

    // the inner body is callee plus two arguments
    assert_eq!(inner.stacksize, 3);
}

#[test]
fn test_stack_analysis_closes_for_larger_program() {
    // stacksize is only produced when the analysis closes at zero
    let src = "(defun fact (n)\n  (cond ((lte? n 1) 1)\n        (else (mul n (fact (sub n 1))))))";
    let code = compile_from_str(src, &Env::with_builtins(), None).unwrap();
    assert!(code.stacksize >= 1);

    let fact = code
        .consts
        .iter()
        .find_map(|c| match c {
            thistle::Value::Code(inner) => Some(inner.clone()),
            _ => None,
        })
        .unwrap();
    assert!(fact.stacksize >= 3);
}
