// ABOUTME: Error types for read-time and compile-time failures

use crate::value::Position;
use thiserror::Error;

/// An error in surface syntax during read time. Always carries the filename
/// and the (line, column) the reader was looking at.
#[derive(Error, Debug, Clone)]
#[error("{filename}:{line}:{column}: {message}")]
pub struct ReaderError {
    pub message: String,
    pub filename: String,
    pub line: u32,
    pub column: u32,
}

impl ReaderError {
    pub fn new(message: impl Into<String>, filename: impl Into<String>, pos: Position) -> Self {
        ReaderError {
            message: message.into(),
            filename: filename.into(),
            line: pos.0,
            column: pos.1,
        }
    }

    /// For failures with no stream attached (e.g. a bad pattern registration)
    pub fn bare(message: impl Into<String>) -> Self {
        ReaderError::new(message, "<reader>", (1, 0))
    }

    pub fn position(&self) -> Position {
        (self.line, self.column)
    }
}

/// An error raised while lowering expressions to pseudo-ops or assembling
/// them into bytes
#[derive(Error, Debug, Clone)]
pub enum CompileError {
    /// Malformed special form, undeclared global, unresolved name
    #[error("{message} at line {line}, column {column}")]
    SyntaxAt {
        message: String,
        line: u32,
        column: u32,
    },

    #[error("{message}")]
    Syntax { message: String },

    /// A macro body stepped outside the compile-time evaluable subset, or
    /// otherwise failed to produce an expansion
    #[error("expansion of macro {name} failed: {message}")]
    MacroExpansion { name: String, message: String },

    #[error("compiler code space is not active")]
    InactiveScope,

    /// Stack depth analysis went negative or did not close at zero
    #[error("stack depth analysis failed: {0}")]
    StackDepth(String),

    #[error("missing constant pool entry for {0}")]
    MissingConst(String),

    #[error("jump to undefined label {0}")]
    UnknownLabel(String),
}

impl CompileError {
    /// Create a syntax error, attaching a position when one is known
    pub fn syntax(message: impl Into<String>, position: Option<Position>) -> Self {
        match position {
            Some((line, column)) => CompileError::SyntaxAt {
                message: message.into(),
                line,
                column,
            },
            None => CompileError::Syntax {
                message: message.into(),
            },
        }
    }

    pub fn macro_expansion(name: &str, message: impl Into<String>) -> Self {
        CompileError::MacroExpansion {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Top-level error for the whole front end
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("no assembler dialect for target version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
