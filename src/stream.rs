// ABOUTME: Seekable character source with line/column bookkeeping and shebang skipping

use crate::error::ReaderError;
use crate::value::Position;
use std::io::Read;
use std::rc::Rc;

/// A character stream over a fully buffered source. Buffering the input keeps
/// the stream seekable, which `peek` and `read_until` rely on.
///
/// `position()` reports the line and column of the *next* character to be
/// read; lines start at 1 and columns at 0.
pub struct SourceStream {
    filename: Rc<str>,
    chars: Vec<char>,
    off: usize,
    lin: u32,
    col: u32,
}

impl SourceStream {
    /// Builds a stream over a source string. A leading `#!` line is skipped.
    pub fn from_str(source: &str, filename: &str) -> SourceStream {
        let mut stream = SourceStream {
            filename: Rc::from(filename),
            chars: source.chars().collect(),
            off: 0,
            lin: 1,
            col: 0,
        };
        stream.skip_exec();
        stream
    }

    /// Builds a stream by draining a reader. A leading `#!` line is skipped.
    pub fn from_reader(mut reader: impl Read, filename: &str) -> std::io::Result<SourceStream> {
        let mut source = String::new();
        reader.read_to_string(&mut source)?;
        Ok(SourceStream::from_str(&source, filename))
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Line and column of the next character to be read
    pub fn position(&self) -> Position {
        (self.lin, self.col)
    }

    pub fn at_eof(&self) -> bool {
        self.off >= self.chars.len()
    }

    /// Builds a syntax error at `position`, or at the current position when
    /// none is given. Never raises on its own.
    pub fn error(&self, message: impl Into<String>, position: Option<Position>) -> ReaderError {
        let pos = position.unwrap_or((self.lin, self.col));
        ReaderError::new(message, self.filename.to_string(), pos)
    }

    /// Reads up to `count` characters, updating the line and column. A `\n`
    /// advances the line and resets the column, a bare `\r` resets the
    /// column only.
    pub fn read(&mut self, count: usize) -> String {
        let end = (self.off + count).min(self.chars.len());
        let data: String = self.chars[self.off..end].iter().collect();
        self.off = end;

        for c in data.chars() {
            match c {
                '\n' => {
                    self.lin += 1;
                    self.col = 0;
                }
                '\r' => {
                    self.col = 0;
                }
                _ => {
                    self.col += 1;
                }
            }
        }
        data
    }

    /// Reads a single character, or None at end of input
    pub fn read_char(&mut self) -> Option<char> {
        let data = self.read(1);
        data.chars().next()
    }

    /// Non-consuming lookahead of up to `count` characters
    pub fn peek(&self, count: usize) -> String {
        let end = (self.off + count).min(self.chars.len());
        self.chars[self.off..end].iter().collect()
    }

    pub fn peek_char(&self) -> Option<char> {
        self.chars.get(self.off).copied()
    }

    /// Reads through the end of the current line, advancing the line counter
    pub fn readline(&mut self) -> String {
        let mut end = self.off;
        while end < self.chars.len() && self.chars[end] != '\n' {
            end += 1;
        }
        if end < self.chars.len() {
            end += 1; // include the newline
        }
        let data: String = self.chars[self.off..end].iter().collect();
        self.off = end;
        self.lin += 1;
        self.col = 0;
        data
    }

    /// Reads the longest prefix whose characters fail `test`. The first
    /// character satisfying `test` is left in the stream.
    pub fn read_until(&mut self, test: impl Fn(char) -> bool) -> String {
        let mut count = 0;
        while let Some(&c) = self.chars.get(self.off + count) {
            if test(c) {
                break;
            }
            count += 1;
        }
        if count > 0 {
            self.read(count)
        } else {
            String::new()
        }
    }

    pub fn skip_whitespace(&mut self) {
        self.read_until(|c| !c.is_whitespace());
    }

    /// Discards one line iff the stream starts with `#!`
    pub fn skip_exec(&mut self) {
        if self.peek(2) == "#!" {
            self.readline();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_tracking() {
        let mut s = SourceStream::from_str("ab\ncd", "test");
        assert_eq!(s.position(), (1, 0));
        s.read(1);
        assert_eq!(s.position(), (1, 1));
        s.read(2); // 'b' and the newline
        assert_eq!(s.position(), (2, 0));
        s.read(1);
        assert_eq!(s.position(), (2, 1));
    }

    #[test]
    fn test_carriage_return_resets_column() {
        let mut s = SourceStream::from_str("ab\rcd", "test");
        s.read(3);
        assert_eq!(s.position(), (1, 0));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut s = SourceStream::from_str("hello", "test");
        assert_eq!(s.peek(3), "hel");
        assert_eq!(s.position(), (1, 0));
        assert_eq!(s.read(5), "hello");
    }

    #[test]
    fn test_read_until() {
        let mut s = SourceStream::from_str("abc def", "test");
        let word = s.read_until(|c| c.is_whitespace());
        assert_eq!(word, "abc");
        // the space is still in the stream
        assert_eq!(s.peek(1), " ");
    }

    #[test]
    fn test_skip_whitespace() {
        let mut s = SourceStream::from_str("  \n\t x", "test");
        s.skip_whitespace();
        assert_eq!(s.peek(1), "x");
        assert_eq!(s.position(), (2, 2));
    }

    #[test]
    fn test_skip_exec_removes_shebang_line() {
        let s = SourceStream::from_str("#!/usr/bin/env thistle\n(+ 1 2)", "test");
        assert_eq!(s.position(), (2, 0));
        assert_eq!(s.peek(1), "(");
    }

    #[test]
    fn test_skip_exec_leaves_other_input() {
        let s = SourceStream::from_str("#x\nrest", "test");
        assert_eq!(s.position(), (1, 0));
        assert_eq!(s.peek(2), "#x");
    }

    #[test]
    fn test_readline() {
        let mut s = SourceStream::from_str("one\ntwo", "test");
        assert_eq!(s.readline(), "one\n");
        assert_eq!(s.position(), (2, 0));
        assert_eq!(s.readline(), "two");
    }

    #[test]
    fn test_eof_behaviour() {
        let mut s = SourceStream::from_str("x", "test");
        assert_eq!(s.read_char(), Some('x'));
        assert!(s.at_eof());
        assert_eq!(s.read_char(), None);
        assert_eq!(s.peek(4), "");
    }

    #[test]
    fn test_error_carries_filename_and_position() {
        let mut s = SourceStream::from_str("ab", "demo.lisp");
        s.read(1);
        let err = s.error("boom", None);
        assert_eq!(err.filename, "demo.lisp");
        assert_eq!(err.position(), (1, 1));

        let err = s.error("boom", Some((5, 2)));
        assert_eq!(err.position(), (5, 2));
    }
}
