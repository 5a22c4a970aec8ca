// ABOUTME: Table-driven s-expression reader with run-time modifiable macros

use crate::error::ReaderError;
use crate::stream::SourceStream;
use crate::value::{cons, keyword, make_proper, symbol, Position, Symbol, Value};
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{char, digit0, digit1, one_of};
use nom::combinator::{all_consuming, opt, recognize};
use nom::multi::many1;
use nom::{IResult, Parser};
use regex_lite::Regex;
use std::collections::HashMap;
use std::rc::Rc;

/// Outcome of a single read step. These are the reader's normal return
/// channel, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A complete value was read
    Value,
    /// Nothing to yield (comment); keep reading
    Skip,
    /// The lone `.` inside a pair
    Dot,
    /// A closing parenthesis
    CloseParen,
    /// End of input
    Eof,
}

/// A character event macro: invoked with the reader, the stream, and the
/// character that triggered it
pub type EventMacroFn =
    Rc<dyn Fn(&mut Reader, &mut SourceStream, char) -> Result<(Event, Value), ReaderError>>;

/// A value-returning character macro, for `set_macro_character`
pub type CharMacroFn =
    Rc<dyn Fn(&mut Reader, &mut SourceStream, char) -> Result<Value, ReaderError>>;

pub type AtomMatchFn = Rc<dyn Fn(&str) -> bool>;
pub type AtomConvertFn = Rc<dyn Fn(&str) -> Result<Value, String>>;

struct AtomPattern {
    name: Symbol,
    matches: AtomMatchFn,
    convert: AtomConvertFn,
}

/// The s-expression reader. State is two tables: per-character event macros
/// and an ordered list of atom patterns. Both are instance-scoped, so
/// concurrent readers must be independent instances.
pub struct Reader {
    event_macros: HashMap<char, EventMacroFn>,
    atom_patterns: Vec<AtomPattern>,
    terminating: Vec<char>,
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader {
    /// A reader with the default syntax installed
    pub fn new() -> Reader {
        let mut reader = Reader::bare();
        reader.add_default_macros();
        reader.add_default_atoms();
        reader
    }

    /// A reader with empty tables; only atoms-as-symbols will parse
    pub fn bare() -> Reader {
        Reader {
            event_macros: HashMap::new(),
            atom_patterns: Vec::new(),
            terminating: vec!['\n', '\r', '\t', ' '],
        }
    }

    /// Reads one value from the stream. Returns None once the stream is
    /// exhausted.
    pub fn read(&mut self, stream: &mut SourceStream) -> Result<Option<Value>, ReaderError> {
        let (event, pos, value) = self.read_event(stream)?;
        match event {
            Event::Value => Ok(Some(value)),
            Event::Eof => Ok(None),
            _ => Err(stream.error("invalid syntax", Some(pos))),
        }
    }

    /// Like `read`, but also reports where the value began
    pub fn read_with_position(
        &mut self,
        stream: &mut SourceStream,
    ) -> Result<Option<(Value, Position)>, ReaderError> {
        let (event, pos, value) = self.read_event(stream)?;
        match event {
            Event::Value => Ok(Some((value, pos))),
            Event::Eof => Ok(None),
            _ => Err(stream.error("invalid syntax", Some(pos))),
        }
    }

    /// One step of the reading algorithm: skip whitespace, dispatch the next
    /// character through the event-macro table (defaulting to the atom
    /// reader), stamp pair results with their start position.
    fn read_event(
        &mut self,
        stream: &mut SourceStream,
    ) -> Result<(Event, Position, Value), ReaderError> {
        loop {
            stream.skip_whitespace();

            let position = stream.position();
            let c = match stream.read_char() {
                Some(c) => c,
                None => return Ok((Event::Eof, position, Value::None)),
            };

            let (event, value) = match self.event_macros.get(&c).cloned() {
                Some(macro_fn) => macro_fn(self, stream, c)?,
                None => self.read_atom(stream, c, position)?,
            };

            if let Value::Pair(p) = &value {
                p.set_position(position);
                fill_positions(&value, position);
            }

            if event == Event::Skip {
                continue;
            }
            return Ok((event, position, value));
        }
    }

    // ========================================================================
    // Table management
    // ========================================================================

    /// Installs a character event macro
    pub fn set_event_macro(&mut self, ch: char, macro_fn: EventMacroFn, terminating: bool) {
        self.event_macros.insert(ch, macro_fn);
        if terminating && !self.terminating.contains(&ch) {
            self.terminating.push(ch);
        }
    }

    /// Looks up a character event macro and whether it terminates atoms
    pub fn get_event_macro(&self, ch: char) -> Option<(EventMacroFn, bool)> {
        self.event_macros
            .get(&ch)
            .cloned()
            .map(|m| (m, self.terminating.contains(&ch)))
    }

    /// Removes a character event macro
    pub fn clear_event_macro(&mut self, ch: char) {
        if self.event_macros.remove(&ch).is_some() {
            self.terminating.retain(|&t| t != ch);
        }
    }

    /// Installs a character event macro for the duration of `body`. The
    /// previous binding (or absence) is restored on every exit path.
    pub fn temporary_event_macro<R>(
        &mut self,
        ch: char,
        macro_fn: EventMacroFn,
        terminating: bool,
        body: impl FnOnce(&mut Reader) -> R,
    ) -> R {
        let old = self.get_event_macro(ch);
        self.set_event_macro(ch, macro_fn, terminating);

        let result = body(self);

        match old {
            None => self.clear_event_macro(ch),
            Some((prev, prev_term)) => self.set_event_macro(ch, prev, prev_term),
        }
        result
    }

    /// Value-returning convenience: the supplied function's result is
    /// wrapped in a `Value` event
    pub fn set_macro_character(&mut self, ch: char, macro_fn: CharMacroFn, terminating: bool) {
        let adapter: EventMacroFn = Rc::new(move |reader, stream, c| {
            macro_fn(reader, stream, c).map(|v| (Event::Value, v))
        });
        self.set_event_macro(ch, adapter, terminating);
    }

    /// Registers (or replaces) a named atom pattern. New patterns are tried
    /// before previously registered ones.
    pub fn set_atom_pattern(&mut self, name: Symbol, matches: AtomMatchFn, convert: AtomConvertFn) {
        for patt in &mut self.atom_patterns {
            if patt.name == name {
                patt.matches = matches;
                patt.convert = convert;
                return;
            }
        }
        self.atom_patterns.insert(
            0,
            AtomPattern {
                name,
                matches,
                convert,
            },
        );
    }

    pub fn get_atom_pattern(&self, name: &Symbol) -> Option<(AtomMatchFn, AtomConvertFn)> {
        self.atom_patterns
            .iter()
            .find(|p| p.name == *name)
            .map(|p| (p.matches.clone(), p.convert.clone()))
    }

    pub fn clear_atom_pattern(&mut self, name: &Symbol) {
        self.atom_patterns.retain(|p| p.name != *name);
    }

    /// Registers an atom pattern from a regex source string. The pattern is
    /// anchored so it must match the whole atom.
    pub fn set_atom_regex(
        &mut self,
        name: Symbol,
        pattern: &str,
        convert: AtomConvertFn,
    ) -> Result<(), ReaderError> {
        let re = Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| ReaderError::bare(format!("invalid atom pattern: {}", e)))?;
        self.set_atom_pattern(name, Rc::new(move |atom| re.is_match(atom)), convert);
        Ok(())
    }

    // ========================================================================
    // Default syntax
    // ========================================================================

    fn add_default_macros(&mut self) {
        self.set_event_macro('(', Rc::new(|r, s, c| r.read_pair(s, c)), true);
        self.set_event_macro(')', Rc::new(|r, s, c| r.close_paren(s, c)), true);
        self.set_event_macro('"', Rc::new(|r, s, c| r.read_string(s, c)), true);
        self.set_event_macro('\'', Rc::new(|r, s, c| r.read_quote(s, c)), true);
        self.set_event_macro('`', Rc::new(|r, s, c| r.read_quasiquote(s, c)), true);
        self.set_event_macro(';', Rc::new(|r, s, c| r.read_comment(s, c)), true);
    }

    fn add_default_atoms(&mut self) {
        // registered last-wins-first, so the effective order is
        // fraction, complex, float, binary, oct, hex, int, keyword
        self.set_atom_pattern(
            symbol("keyword"),
            Rc::new(match_keyword),
            Rc::new(|atom| Ok(Value::Keyword(keyword(atom)))),
        );
        self.set_atom_pattern(symbol("int"), Rc::new(match_integer), Rc::new(as_integer));
        self.set_atom_pattern(symbol("hex"), Rc::new(match_hex), Rc::new(as_hex));
        self.set_atom_pattern(symbol("oct"), Rc::new(match_octal), Rc::new(as_octal));
        self.set_atom_pattern(symbol("binary"), Rc::new(match_binary), Rc::new(as_binary));
        self.set_atom_pattern(symbol("float"), Rc::new(match_float), Rc::new(as_float));
        self.set_atom_pattern(symbol("complex"), Rc::new(match_complex), Rc::new(as_complex));
        self.set_atom_pattern(
            symbol("fraction"),
            Rc::new(match_fraction),
            Rc::new(as_fraction),
        );
    }

    // ========================================================================
    // Built-in event macros
    // ========================================================================

    /// Default handler when no event macro claims the character
    fn read_atom(
        &mut self,
        stream: &mut SourceStream,
        c: char,
        position: Position,
    ) -> Result<(Event, Value), ReaderError> {
        let terms = self.terminating.clone();
        let rest = stream.read_until(|ch| terms.contains(&ch));

        let mut atom = String::with_capacity(1 + rest.len());
        atom.push(c);
        atom.push_str(&rest);

        if atom == "." {
            return Ok((Event::Dot, Value::None));
        }

        for patt in &self.atom_patterns {
            if (patt.matches)(&atom) {
                return match (patt.convert)(&atom) {
                    Ok(v) => Ok((Event::Value, v)),
                    Err(msg) => Err(stream.error(msg, Some(position))),
                };
            }
        }

        Ok((Event::Value, Value::Symbol(symbol(&atom))))
    }

    /// Accumulates children until the closing parenthesis; a lone dot makes
    /// the next value the improper tail and demands an immediate close
    fn read_pair(
        &mut self,
        stream: &mut SourceStream,
        _c: char,
    ) -> Result<(Event, Value), ReaderError> {
        let mut result = Value::Nil;
        let mut work: Option<Rc<crate::value::Pair>> = None;

        loop {
            let (event, position, value) = self.read_event(stream)?;

            match event {
                Event::CloseParen => break,

                Event::Dot => {
                    let tail_cell = match &work {
                        Some(pair) => pair.clone(),
                        None => return Err(stream.error("invalid dotted list", Some(position))),
                    };

                    // the next value becomes the tail, then the list must end
                    let (event, position, value) = self.read_event(stream)?;
                    if event != Event::Value {
                        return Err(stream.error("invalid list syntax", Some(position)));
                    }
                    tail_cell.set_tail(value);

                    let (close, close_pos, _) = self.read_event(stream)?;
                    if close != Event::CloseParen {
                        return Err(stream.error("invalid use of dot in list", Some(close_pos)));
                    }
                    break;
                }

                Event::Eof => return Err(stream.error("unexpected EOF", None)),

                Event::Value => {
                    let new_work = crate::value::Pair::new(value, Value::Nil);
                    new_work.set_position(position);
                    match &work {
                        None => result = Value::Pair(new_work.clone()),
                        Some(prev) => prev.set_tail(Value::Pair(new_work.clone())),
                    }
                    work = Some(new_work);
                }

                Event::Skip => {}
            }
        }

        Ok((Event::Value, result))
    }

    fn close_paren(
        &mut self,
        _stream: &mut SourceStream,
        _c: char,
    ) -> Result<(Event, Value), ReaderError> {
        Ok((Event::CloseParen, Value::None))
    }

    /// Scans to the matching quote, carrying backslash escapes through
    /// verbatim, then applies unicode-escape decoding to the collected text
    fn read_string(
        &mut self,
        stream: &mut SourceStream,
        quote: char,
    ) -> Result<(Event, Value), ReaderError> {
        let mut raw = String::new();
        loop {
            let c = match stream.read_char() {
                Some(c) => c,
                None => return Err(stream.error("unexpected EOF", None)),
            };
            if c == quote {
                break;
            }
            raw.push(c);
            if c == '\\' {
                match stream.read_char() {
                    Some(escaped) => raw.push(escaped),
                    None => return Err(stream.error("unexpected EOF", None)),
                }
            }
        }

        let decoded = decode_unicode_escape(&raw).map_err(|msg| stream.error(msg, None))?;
        Ok((Event::Value, Value::string(&decoded)))
    }

    fn read_quote(
        &mut self,
        stream: &mut SourceStream,
        ch: char,
    ) -> Result<(Event, Value), ReaderError> {
        let (event, pos, child) = self.read_event(stream)?;
        if event != Event::Value {
            return Err(stream.error(format!("invalid use of {}", ch), Some(pos)));
        }
        Ok((
            Event::Value,
            make_proper(&[Value::Symbol(symbol("quote")), child]),
        ))
    }

    /// Installs a temporary `,` macro while reading the quasiquoted form
    fn read_quasiquote(
        &mut self,
        stream: &mut SourceStream,
        ch: char,
    ) -> Result<(Event, Value), ReaderError> {
        let unquote: EventMacroFn = Rc::new(|r, s, c| r.read_unquote(s, c));
        let (event, pos, child) =
            self.temporary_event_macro(',', unquote, true, |r| r.read_event(&mut *stream))?;

        if event != Event::Value {
            return Err(stream.error(format!("invalid use of {}", ch), Some(pos)));
        }
        Ok((
            Event::Value,
            make_proper(&[Value::Symbol(symbol("quasiquote")), child]),
        ))
    }

    /// Installs a temporary `@` macro while reading the unquoted form;
    /// `,@x` collapses to `(unquote-splicing x)`
    fn read_unquote(
        &mut self,
        stream: &mut SourceStream,
        ch: char,
    ) -> Result<(Event, Value), ReaderError> {
        let splice: EventMacroFn = Rc::new(|r, s, c| r.read_splice(s, c));
        let (event, pos, child) =
            self.temporary_event_macro('@', splice, true, |r| r.read_event(&mut *stream))?;

        if event != Event::Value {
            return Err(stream.error(format!("invalid use of {}", ch), Some(pos)));
        }

        let value = match child.as_pair() {
            Some(p) if p.head() == Value::Symbol(symbol("splice")) => {
                cons(Value::Symbol(symbol("unquote-splicing")), p.tail())
            }
            _ => make_proper(&[Value::Symbol(symbol("unquote")), child]),
        };
        Ok((Event::Value, value))
    }

    fn read_splice(
        &mut self,
        stream: &mut SourceStream,
        ch: char,
    ) -> Result<(Event, Value), ReaderError> {
        let (event, pos, child) = self.read_event(stream)?;
        if event != Event::Value {
            return Err(stream.error(format!("invalid use of {}", ch), Some(pos)));
        }
        Ok((
            Event::Value,
            make_proper(&[Value::Symbol(symbol("splice")), child]),
        ))
    }

    fn read_comment(
        &mut self,
        stream: &mut SourceStream,
        _ch: char,
    ) -> Result<(Event, Value), ReaderError> {
        stream.readline();
        Ok((Event::Skip, Value::None))
    }
}

/// Backfills positions on pairs a macro consed up around its subread, such
/// as the wrapper cells of the quote family. Already-stamped pairs keep
/// their own positions.
fn fill_positions(value: &Value, pos: Position) {
    if let Value::Pair(p) = value {
        if p.position().is_none() {
            p.set_position(pos);
        }
        fill_positions(&p.head(), p.position().unwrap_or(pos));
        fill_positions(&p.tail(), p.position().unwrap_or(pos));
    }
}

// ============================================================================
// Atom grammar
// ============================================================================

fn integer_literal(input: &str) -> IResult<&str, &str> {
    recognize((opt(char('-')), digit1)).parse(input)
}

fn binary_literal(input: &str) -> IResult<&str, &str> {
    recognize((tag("0b"), many1(one_of("01")))).parse(input)
}

fn octal_literal(input: &str) -> IResult<&str, &str> {
    recognize((tag("0o"), many1(one_of("01234567")))).parse(input)
}

fn hex_literal(input: &str) -> IResult<&str, &str> {
    recognize((tag("0x"), many1(one_of("0123456789abcdef")))).parse(input)
}

fn exponent(input: &str) -> IResult<&str, &str> {
    recognize((char('e'), opt(char('-')), digit1)).parse(input)
}

fn float_literal(input: &str) -> IResult<&str, &str> {
    recognize((
        opt(char('-')),
        alt((
            recognize((
                alt((
                    recognize((digit0, char('.'), digit1)),
                    recognize((digit1, char('.'), digit0)),
                )),
                opt(exponent),
            )),
            recognize((digit1, exponent)),
        )),
    ))
    .parse(input)
}

fn fraction_literal(input: &str) -> IResult<&str, &str> {
    recognize((opt(char('-')), digit1, char('/'), digit1)).parse(input)
}

fn decimal_digits(input: &str) -> IResult<&str, &str> {
    // digits with an optional decimal point: 3, 3.5, .5
    alt((recognize((digit0, char('.'), digit1)), digit1)).parse(input)
}

fn complex_literal(input: &str) -> IResult<&str, &str> {
    recognize((
        opt(char('-')),
        decimal_digits,
        char('+'),
        opt(alt((recognize((digit0, char('.'), digit0)), digit0))),
        one_of("ij"),
    ))
    .parse(input)
}

fn match_integer(atom: &str) -> bool {
    all_consuming(integer_literal).parse(atom).is_ok()
}

fn match_binary(atom: &str) -> bool {
    all_consuming(binary_literal).parse(atom).is_ok()
}

fn match_octal(atom: &str) -> bool {
    all_consuming(octal_literal).parse(atom).is_ok()
}

fn match_hex(atom: &str) -> bool {
    all_consuming(hex_literal).parse(atom).is_ok()
}

fn match_float(atom: &str) -> bool {
    all_consuming(float_literal).parse(atom).is_ok()
}

fn match_fraction(atom: &str) -> bool {
    all_consuming(fraction_literal).parse(atom).is_ok()
}

fn match_complex(atom: &str) -> bool {
    all_consuming(complex_literal).parse(atom).is_ok()
}

fn match_keyword(atom: &str) -> bool {
    atom.len() >= 2 && (atom.starts_with(':') || atom.ends_with(':'))
}

// ============================================================================
// Atom conversions
// ============================================================================

fn as_integer(atom: &str) -> Result<Value, String> {
    atom.parse::<i64>()
        .map(Value::Int)
        .map_err(|_| format!("invalid integer literal {}", atom))
}

fn as_binary(atom: &str) -> Result<Value, String> {
    i64::from_str_radix(&atom[2..], 2)
        .map(Value::Int)
        .map_err(|_| format!("invalid binary literal {}", atom))
}

fn as_octal(atom: &str) -> Result<Value, String> {
    i64::from_str_radix(&atom[2..], 8)
        .map(Value::Int)
        .map_err(|_| format!("invalid octal literal {}", atom))
}

fn as_hex(atom: &str) -> Result<Value, String> {
    i64::from_str_radix(&atom[2..], 16)
        .map(Value::Int)
        .map_err(|_| format!("invalid hex literal {}", atom))
}

fn as_float(atom: &str) -> Result<Value, String> {
    atom.parse::<f64>()
        .map(Value::Float)
        .map_err(|_| format!("invalid float literal {}", atom))
}

/// Fractions cannot live in a constant pool, so they convert to the source
/// form `(fraction p q)` with the components parsed once, here.
fn as_fraction(atom: &str) -> Result<Value, String> {
    let (p, q) = atom
        .split_once('/')
        .ok_or_else(|| format!("invalid fraction literal {}", atom))?;
    let p: i64 = p
        .parse()
        .map_err(|_| format!("invalid fraction literal {}", atom))?;
    let q: i64 = q
        .parse()
        .map_err(|_| format!("invalid fraction literal {}", atom))?;
    Ok(make_proper(&[
        Value::Symbol(symbol("fraction")),
        Value::Int(p),
        Value::Int(q),
    ]))
}

/// `a+bi` or `a+bj`; an empty imaginary digit run means 1
fn as_complex(atom: &str) -> Result<Value, String> {
    let body = &atom[..atom.len() - 1];
    let plus = body[1..]
        .find('+')
        .map(|i| i + 1)
        .ok_or_else(|| format!("invalid complex literal {}", atom))?;

    let re: f64 = body[..plus]
        .parse()
        .map_err(|_| format!("invalid complex literal {}", atom))?;
    let imag_text = &body[plus + 1..];
    let im: f64 = if imag_text.is_empty() {
        1.0
    } else {
        imag_text
            .parse()
            .map_err(|_| format!("invalid complex literal {}", atom))?
    };
    Ok(Value::Complex { re, im })
}

/// Unicode-escape decoding of a raw string body: `\n`, `\t`, `\r`, `\0`,
/// `\xNN`, `\uXXXX`, `\UXXXXXXXX`; unknown escapes are kept verbatim.
fn decode_unicode_escape(raw: &str) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Option::None => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('f') => out.push('\x0c'),
            Some('v') => out.push('\x0b'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\n') => {} // escaped newline is a line continuation
            Some('x') => out.push(take_hex_escape(&mut chars, 2)?),
            Some('u') => out.push(take_hex_escape(&mut chars, 4)?),
            Some('U') => out.push(take_hex_escape(&mut chars, 8)?),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

fn take_hex_escape(chars: &mut std::str::Chars<'_>, width: usize) -> Result<char, String> {
    let mut code = 0u32;
    for _ in 0..width {
        let digit = chars
            .next()
            .and_then(|c| c.to_digit(16))
            .ok_or_else(|| "truncated escape in string literal".to_string())?;
        code = code * 16 + digit;
    }
    char::from_u32(code).ok_or_else(|| "invalid character escape in string literal".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_one(src: &str) -> Value {
        let mut stream = SourceStream::from_str(src, "test");
        Reader::new()
            .read(&mut stream)
            .expect("read failed")
            .expect("no value")
    }

    fn read_err(src: &str) -> ReaderError {
        let mut stream = SourceStream::from_str(src, "test");
        Reader::new()
            .read(&mut stream)
            .expect_err("expected a reader error")
    }

    #[test]
    fn test_read_numbers() {
        assert_eq!(read_one("123"), Value::Int(123));
        assert_eq!(read_one("-123"), Value::Int(-123));
        assert_eq!(read_one("1.5"), Value::Float(1.5));
        assert_eq!(read_one(".5"), Value::Float(0.5));
        assert_eq!(read_one("1."), Value::Float(1.0));
        assert_eq!(read_one("1e-3"), Value::Float(0.001));
        assert_eq!(read_one("0b101"), Value::Int(5));
        assert_eq!(read_one("0o17"), Value::Int(15));
        assert_eq!(read_one("0xff"), Value::Int(255));
    }

    #[test]
    fn test_read_complex() {
        assert_eq!(read_one("8+1j"), Value::Complex { re: 8.0, im: 1.0 });
        assert_eq!(read_one("3+i"), Value::Complex { re: 3.0, im: 1.0 });
        assert_eq!(
            read_one("-1.1+2j"),
            Value::Complex { re: -1.1, im: 2.0 }
        );
    }

    #[test]
    fn test_read_fraction_becomes_source_form() {
        assert_eq!(format!("{}", read_one("1/2")), "(fraction 1 2)");
        assert_eq!(format!("{}", read_one("-1/2")), "(fraction -1 2)");
    }

    #[test]
    fn test_read_symbols_and_keywords() {
        assert_eq!(read_one("lambda"), Value::Symbol(symbol("lambda")));
        // a failed numeric prefix falls through to symbol
        assert_eq!(read_one("123abc"), Value::Symbol(symbol("123abc")));
        assert_eq!(read_one(":foo"), Value::Keyword(keyword("foo")));
        assert_eq!(read_one("foo:"), Value::Keyword(keyword("foo")));
    }

    #[test]
    fn test_read_strings() {
        assert_eq!(read_one("\"hello world\""), Value::string("hello world"));
        assert_eq!(read_one("\"\""), Value::string(""));
        assert_eq!(read_one("\"a\\nb\""), Value::string("a\nb"));
        assert_eq!(read_one("\"say \\\"hi\\\"\""), Value::string("say \"hi\""));
        assert_eq!(read_one("\"\\u00e9\""), Value::string("\u{e9}"));
    }

    #[test]
    fn test_read_list() {
        assert_eq!(format!("{}", read_one("(1 2 3)")), "(1 2 3)");
        assert_eq!(format!("{}", read_one("(a (b c) d)")), "(a (b c) d)");
        assert_eq!(read_one("()"), Value::Nil);
    }

    #[test]
    fn test_read_dotted_list() {
        assert_eq!(format!("{}", read_one("(1 . 2)")), "(1 . 2)");
        assert_eq!(format!("{}", read_one("(1 2 . 3)")), "(1 2 . 3)");
        // 1.4 is a float, not a dotted tail
        assert_eq!(format!("{}", read_one("(1.4)")), "(1.4)");
        assert_eq!(format!("{}", read_one("(1 . 4)")), "(1 . 4)");
    }

    #[test]
    fn test_dot_errors() {
        assert!(read_err("(. 1)").message.contains("invalid dotted list"));
        assert!(read_err("(1 . 2 3)")
            .message
            .contains("invalid use of dot"));
    }

    #[test]
    fn test_unterminated_forms() {
        assert!(read_err("(1 2").message.contains("unexpected EOF"));
        assert!(read_err("\"abc").message.contains("unexpected EOF"));
    }

    #[test]
    fn test_read_quote_family() {
        assert_eq!(format!("{}", read_one("'x")), "(quote x)");
        assert_eq!(format!("{}", read_one("`x")), "(quasiquote x)");
        assert_eq!(format!("{}", read_one("`,x")), "(quasiquote (unquote x))");
        assert_eq!(
            format!("{}", read_one("`(1 2 ,@(list 3 4))")),
            "(quasiquote (1 2 (unquote-splicing (list 3 4))))"
        );
    }

    #[test]
    fn test_unquote_only_inside_quasiquote() {
        // without a surrounding backquote, comma has no meaning
        assert_eq!(read_one(",x"), Value::Symbol(symbol(",x")));
    }

    #[test]
    fn test_temporary_macro_restored_after_error() {
        let mut reader = Reader::new();
        let mut stream = SourceStream::from_str("`(", "test");
        assert!(reader.read(&mut stream).is_err());
        // the ',' macro installed for the quasiquote subread must be gone
        assert!(reader.get_event_macro(',').is_none());
    }

    #[test]
    fn test_comments_skipped() {
        let mut stream = SourceStream::from_str("; hi\n42 ; tail\n", "test");
        let mut reader = Reader::new();
        assert_eq!(reader.read(&mut stream).unwrap(), Some(Value::Int(42)));
        assert_eq!(reader.read(&mut stream).unwrap(), Option::None);
    }

    #[test]
    fn test_positions_stamped_on_pairs() {
        let value = read_one("  (a b)");
        let pair = value.as_pair().unwrap();
        assert_eq!(pair.position(), Some((1, 2)));
    }

    #[test]
    fn test_inner_pair_positions() {
        let value = read_one("(a\n  (b))");
        let outer = value.as_pair().unwrap();
        let second = outer.tail();
        let inner = second.as_pair().unwrap().head();
        assert_eq!(inner.as_pair().unwrap().position(), Some((2, 2)));
    }

    #[test]
    fn test_multiple_top_level_reads() {
        let mut stream = SourceStream::from_str("1 two \"three\"", "test");
        let mut reader = Reader::new();
        assert_eq!(reader.read(&mut stream).unwrap(), Some(Value::Int(1)));
        assert_eq!(
            reader.read(&mut stream).unwrap(),
            Some(Value::Symbol(symbol("two")))
        );
        assert_eq!(
            reader.read(&mut stream).unwrap(),
            Some(Value::string("three"))
        );
        assert_eq!(reader.read(&mut stream).unwrap(), Option::None);
    }

    #[test]
    fn test_round_trip() {
        for src in [
            "(1 2 3)",
            "(a (b c) d)",
            "(1 . 2)",
            "(quote (x y))",
            "(fraction 1 2)",
            "(\"s\" :key 1.5)",
        ] {
            let printed = format!("{}", read_one(src));
            assert_eq!(format!("{}", read_one(&printed)), printed);
        }
    }

    #[test]
    fn test_custom_atom_regex() {
        let mut reader = Reader::new();
        reader
            .set_atom_regex(
                symbol("percent"),
                r"\d+%",
                Rc::new(|atom| {
                    atom[..atom.len() - 1]
                        .parse::<i64>()
                        .map(Value::Int)
                        .map_err(|_| "bad percent".to_string())
                }),
            )
            .unwrap();

        let mut stream = SourceStream::from_str("15%", "test");
        assert_eq!(reader.read(&mut stream).unwrap(), Some(Value::Int(15)));
    }

    #[test]
    fn test_custom_pattern_conversion_error_has_position() {
        let mut reader = Reader::new();
        reader
            .set_atom_regex(
                symbol("bang"),
                r"!+",
                Rc::new(|_| Err("banged out".to_string())),
            )
            .unwrap();

        let mut stream = SourceStream::from_str("  !!", "test");
        let err = reader.read(&mut stream).unwrap_err();
        assert_eq!(err.position(), (1, 2));
        assert!(err.message.contains("banged out"));
    }

    #[test]
    fn test_clear_atom_pattern() {
        let mut reader = Reader::new();
        reader.clear_atom_pattern(&symbol("int"));
        assert_eq!(read_with(&mut reader, "123"), Value::Symbol(symbol("123")));
    }

    fn read_with(reader: &mut Reader, src: &str) -> Value {
        let mut stream = SourceStream::from_str(src, "test");
        reader.read(&mut stream).unwrap().unwrap()
    }

    #[test]
    fn test_set_macro_character() {
        let mut reader = Reader::new();
        reader.set_macro_character(
            '!',
            Rc::new(|_r, _s, _c| Ok(Value::Symbol(symbol("bang")))),
            true,
        );
        assert_eq!(read_with(&mut reader, "!"), Value::Symbol(symbol("bang")));
    }
}
