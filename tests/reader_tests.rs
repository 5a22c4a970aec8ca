// ABOUTME: Integration tests for the source stream, reader, and AST composer

use std::rc::Rc;
use thistle::value::{symbol, PositionMap, Value};
use thistle::{compose_from_str, Reader, SourceStream};

fn read_one(src: &str) -> Value {
    let mut stream = SourceStream::from_str(src, "test.lisp");
    Reader::new()
        .read(&mut stream)
        .expect("read failed")
        .expect("no value")
}

fn simplify(src: &str) -> Value {
    compose_from_str(src, "test.lisp")
        .unwrap()
        .unwrap()
        .simplify(&mut PositionMap::new())
}

#[test]
fn test_round_trip_through_printing() {
    let sources = [
        "42",
        "-7",
        "1.5",
        "(1 2 3)",
        "(a (b c) d)",
        "(1 . 2)",
        "(1 2 . 3)",
        "\"hello world\"",
        "(quote (x y))",
        ":key",
        "(fraction 1 2)",
        "(quasiquote (1 (unquote-splicing (list 2))))",
    ];
    for src in sources {
        let printed = format!("{}", read_one(src));
        let reread = format!("{}", read_one(&printed));
        assert_eq!(printed, reread, "round trip failed for {}", src);
    }
}

#[test]
fn test_every_pair_has_a_position() {
    fn check(value: &Value) {
        if let Value::Pair(p) = value {
            let (line, _col) = p.position().expect("pair without position");
            assert!(line >= 1);
            check(&p.head());
            check(&p.tail());
        }
    }
    check(&read_one("(a (b (c . d)) `(e ,f))"));
}

#[test]
fn test_shebang_line_is_skipped() {
    let mut stream = SourceStream::from_str("#!/usr/bin/env thistle\n(f 1)", "script");
    let value = Reader::new().read(&mut stream).unwrap().unwrap();
    assert_eq!(format!("{}", value), "(f 1)");
    // the form sits on line two since the shebang consumed line one
    assert_eq!(value.as_pair().unwrap().position(), Some((2, 0)));
}

#[test]
fn test_non_shebang_first_line_kept() {
    let mut stream = SourceStream::from_str("(f 1)", "script");
    let value = Reader::new().read(&mut stream).unwrap().unwrap();
    assert_eq!(value.as_pair().unwrap().position(), Some((1, 0)));
}

#[test]
fn test_dotted_simplify_prints_as_source() {
    // '(testing . 123) keeps its improper shape through simplification
    let value = simplify("'(testing . 123)");
    assert_eq!(format!("{}", value), "(quote (testing . 123))");

    let inner = value.as_pair().unwrap().tail();
    let inner = inner.as_pair().unwrap().head();
    assert_eq!(format!("{}", inner), "(testing . 123)");
    assert!(!inner.is_proper());
}

#[test]
fn test_quasiquote_splice_reading() {
    let value = read_one("`(1 2 ,@(list 3 4))");
    assert_eq!(
        format!("{}", value),
        "(quasiquote (1 2 (unquote-splicing (list 3 4))))"
    );
}

#[test]
fn test_reader_tables_are_instance_scoped() {
    let mut plain = Reader::new();
    let mut custom = Reader::new();
    custom
        .set_atom_regex(
            symbol("upper"),
            r"[A-Z]+",
            Rc::new(|atom| Ok(Value::string(&atom.to_lowercase()))),
        )
        .unwrap();

    let mut stream = SourceStream::from_str("ABC", "a");
    assert_eq!(
        custom.read(&mut stream).unwrap(),
        Some(Value::string("abc"))
    );

    let mut stream = SourceStream::from_str("ABC", "b");
    assert_eq!(
        plain.read(&mut stream).unwrap(),
        Some(Value::Symbol(symbol("ABC")))
    );
}

#[test]
fn test_multiple_forms_with_comments() {
    let src = "; leading comment\n(one) ; trailing\n(two)\n";
    let mut stream = SourceStream::from_str(src, "test");
    let mut reader = Reader::new();

    assert_eq!(
        format!("{}", reader.read(&mut stream).unwrap().unwrap()),
        "(one)"
    );
    assert_eq!(
        format!("{}", reader.read(&mut stream).unwrap().unwrap()),
        "(two)"
    );
    assert_eq!(reader.read(&mut stream).unwrap(), None);
}

#[test]
fn test_reader_errors_carry_file_and_position() {
    let mut stream = SourceStream::from_str("(a\n   (b", "broken.lisp");
    let err = Reader::new().read(&mut stream).unwrap_err();
    assert_eq!(err.filename, "broken.lisp");
    assert!(err.message.contains("EOF"));
}

#[test]
fn test_numeric_atom_grammar_priority() {
    // fractions win over integers, complexes over floats
    assert_eq!(format!("{}", read_one("3/4")), "(fraction 3 4)");
    assert_eq!(read_one("1.5+2j"), Value::Complex { re: 1.5, im: 2.0 });
    assert_eq!(read_one("0x10"), Value::Int(16));
    // and a failed prefix is just a symbol
    assert_eq!(read_one("0xgg"), Value::Symbol(symbol("0xgg")));
}
