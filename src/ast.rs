// ABOUTME: Typed expression tree over reader output, simplifying back to runtime values

use crate::error::ReaderError;
use crate::reader::Reader;
use crate::stream::SourceStream;
use crate::value::{symbol, Keyword, Pair, Position, PositionMap, Symbol, Value};
use std::rc::Rc;

/// A parsed expression with its source position
#[derive(Debug, Clone, PartialEq)]
pub struct Ast {
    pub pos: Position,
    pub kind: AstKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AstKind {
    Symbol(Symbol),
    Keyword(Keyword),
    Integer(i64),
    Decimal(f64),
    Fraction { p: i64, q: i64 },
    Complex { re: f64, im: f64 },
    Str(Rc<str>),
    List { proper: bool, items: Vec<Ast> },
    Quote(Box<Ast>),
    Quasi(Box<Ast>),
    Unquote(Box<Ast>),
    Splice(Box<Ast>),
}

impl Ast {
    fn new(pos: Position, kind: AstKind) -> Ast {
        Ast { pos, kind }
    }

    /// Wraps a reader value into a typed node. Pairs headed by the reader's
    /// template markers become the corresponding wrapper nodes.
    fn from_value(value: &Value, fallback: Position) -> Ast {
        match value {
            Value::Pair(p) => Self::from_pair(p, fallback),
            Value::Nil => Ast::new(
                fallback,
                AstKind::List {
                    proper: true,
                    items: Vec::new(),
                },
            ),
            Value::Symbol(s) => Ast::new(fallback, AstKind::Symbol(s.clone())),
            Value::Keyword(k) => Ast::new(fallback, AstKind::Keyword(k.clone())),
            Value::Int(n) => Ast::new(fallback, AstKind::Integer(*n)),
            Value::Float(n) => Ast::new(fallback, AstKind::Decimal(*n)),
            Value::Complex { re, im } => {
                Ast::new(fallback, AstKind::Complex { re: *re, im: *im })
            }
            Value::Str(s) => Ast::new(fallback, AstKind::Str(s.clone())),
            // custom atom patterns may hand these back directly; they
            // round-trip through the literal symbols
            Value::Bool(true) => Ast::new(fallback, AstKind::Symbol(symbol("True"))),
            Value::Bool(false) => Ast::new(fallback, AstKind::Symbol(symbol("False"))),
            Value::None => Ast::new(fallback, AstKind::Symbol(symbol("None"))),
            _ => unreachable!("compile-time values cannot appear in source"),
        }
    }

    fn from_pair(p: &Rc<Pair>, fallback: Position) -> Ast {
        let pos = p.position().unwrap_or(fallback);

        // template wrappers are two-element proper lists
        if let (Value::Symbol(head), Value::Pair(rest)) = (p.head(), p.tail()) {
            if rest.tail().is_nil() {
                let child_pos = rest
                    .head()
                    .as_pair()
                    .and_then(|cp| cp.position())
                    .unwrap_or(pos);
                let child = Box::new(Self::from_value(&rest.head(), child_pos));
                match head.as_str() {
                    "quote" => return Ast::new(pos, AstKind::Quote(child)),
                    "quasiquote" => return Ast::new(pos, AstKind::Quasi(child)),
                    "unquote" => return Ast::new(pos, AstKind::Unquote(child)),
                    "splice" => return Ast::new(pos, AstKind::Splice(child)),
                    "unquote-splicing" => {
                        let splice = Ast::new(child.pos, AstKind::Splice(child));
                        return Ast::new(pos, AstKind::Unquote(Box::new(splice)));
                    }
                    _ => {}
                }
            }
        }

        // the fraction source form keeps its own node
        if let Value::Symbol(head) = p.head() {
            if head == symbol("fraction") {
                let items = Value::Pair(p.clone()).unpack();
                if items.len() == 3 && Value::Pair(p.clone()).is_proper() {
                    if let (Value::Int(num), Value::Int(den)) = (&items[1], &items[2]) {
                        return Ast::new(pos, AstKind::Fraction { p: *num, q: *den });
                    }
                }
            }
        }

        let mut items = Vec::new();
        let mut proper = true;
        let mut cursor = Value::Pair(p.clone());
        let mut item_pos = pos;
        loop {
            match cursor {
                Value::Nil => break,
                Value::Pair(link) => {
                    item_pos = link.position().unwrap_or(item_pos);
                    items.push(Self::from_value(&link.head(), item_pos));
                    cursor = link.tail();
                }
                tail => {
                    items.push(Self::from_value(&tail, item_pos));
                    proper = false;
                    break;
                }
            }
        }

        Ast::new(pos, AstKind::List { proper, items })
    }

    /// Rebuilds the runtime value for this tree, registering every produced
    /// pair's identity in `positions` so the compiler can emit position
    /// pseudo-ops for it later.
    pub fn simplify(&self, positions: &mut PositionMap) -> Value {
        match &self.kind {
            AstKind::Symbol(s) => match s.as_str() {
                "None" => Value::None,
                "True" | "#t" => Value::Bool(true),
                "False" | "#f" => Value::Bool(false),
                _ => Value::Symbol(s.clone()),
            },
            AstKind::Keyword(k) => Value::Keyword(k.clone()),
            AstKind::Integer(n) => Value::Int(*n),
            AstKind::Decimal(n) => Value::Float(*n),
            AstKind::Complex { re, im } => Value::Complex { re: *re, im: *im },
            AstKind::Str(s) => Value::Str(s.clone()),

            AstKind::Fraction { p, q } => {
                let items = [
                    (Value::Symbol(symbol("fraction")), self.pos),
                    (Value::Int(*p), self.pos),
                    (Value::Int(*q), self.pos),
                ];
                build_list(&items, Value::Nil, positions)
            }

            AstKind::List { proper, items } => {
                if items.is_empty() {
                    return Value::Nil;
                }
                let (chain, tail) = if *proper {
                    (&items[..], Value::Nil)
                } else {
                    let (last, rest) = items.split_last().expect("nonempty");
                    (rest, last.simplify(positions))
                };

                let mut parts = Vec::with_capacity(chain.len());
                for (index, item) in chain.iter().enumerate() {
                    // the head pair answers for the whole list's position
                    let pos = if index == 0 { self.pos } else { item.pos };
                    parts.push((item.simplify(positions), pos));
                }
                build_list(&parts, tail, positions)
            }

            AstKind::Quote(x) => self.wrap("quote", x, positions),
            AstKind::Quasi(x) => self.wrap("quasiquote", x, positions),
            AstKind::Unquote(inner) => match &inner.kind {
                AstKind::Splice(y) => self.wrap("unquote-splicing", y, positions),
                _ => self.wrap("unquote", inner, positions),
            },
            AstKind::Splice(x) => self.wrap("splice", x, positions),
        }
    }

    fn wrap(&self, name: &str, child: &Ast, positions: &mut PositionMap) -> Value {
        let parts = [
            (Value::Symbol(symbol(name)), self.pos),
            (child.simplify(positions), child.pos),
        ];
        build_list(&parts, Value::Nil, positions)
    }
}

/// Cons up a list from (value, position) parts, registering each new pair
fn build_list(parts: &[(Value, Position)], tail: Value, positions: &mut PositionMap) -> Value {
    let mut result = tail;
    for (value, pos) in parts.iter().rev() {
        let pair = Pair::new(value.clone(), result);
        pair.set_position(*pos);
        positions.insert(pair.id(), *pos);
        result = Value::Pair(pair);
    }
    result
}

// ============================================================================
// Composition entry points
// ============================================================================

/// Reads one expression from a stream into a typed tree; None at end of input
pub fn compose_from_stream(
    reader: &mut Reader,
    stream: &mut SourceStream,
) -> Result<Option<Ast>, ReaderError> {
    match reader.read_with_position(stream)? {
        Some((value, pos)) => Ok(Some(Ast::from_value(&value, pos))),
        None => Ok(None),
    }
}

/// Reads one expression from source text; None when the text holds no forms
pub fn compose_from_str(src: &str, filename: &str) -> Result<Option<Ast>, ReaderError> {
    let mut stream = SourceStream::from_str(src, filename);
    compose_from_stream(&mut Reader::new(), &mut stream)
}

/// Lazily yields every top-level expression in a stream
pub struct ComposeAll {
    reader: Reader,
    stream: SourceStream,
    done: bool,
}

impl Iterator for ComposeAll {
    type Item = Result<Ast, ReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match compose_from_stream(&mut self.reader, &mut self.stream) {
            Ok(Some(ast)) => Some(Ok(ast)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

pub fn compose_all_from_stream(stream: SourceStream) -> ComposeAll {
    ComposeAll {
        reader: Reader::new(),
        stream,
        done: false,
    }
}

pub fn compose_all_from_str(src: &str, filename: &str) -> ComposeAll {
    compose_all_from_stream(SourceStream::from_str(src, filename))
}
