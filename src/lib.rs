// ABOUTME: Library module exposing the reader, compiler, and assembler

pub mod assembler;
pub mod ast;
pub mod code;
pub mod codespace;
pub mod env;
pub mod error;
pub mod macros;
pub mod reader;
pub mod specials;
pub mod stream;
pub mod value;

pub use assembler::TargetVersion;
pub use ast::{compose_all_from_str, compose_all_from_stream, compose_from_str, compose_from_stream};
pub use code::{CodeFlags, CodeObject};
pub use codespace::{
    compile_all_from_str, compile_all_from_str_for, compile_all_from_stream, compile_from_ast,
    compile_from_ast_for, compile_from_str, compile_from_str_for, compile_from_stream, Compiler,
};
pub use env::Env;
pub use error::{CompileError, Error, ReaderError};
pub use reader::Reader;
pub use stream::SourceStream;
pub use value::Value;
