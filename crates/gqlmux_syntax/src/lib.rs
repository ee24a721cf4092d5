//! Syntax layer for gqlmux.
//!
//! This crate provides:
//! - `token`: Token kinds and token structures
//! - `lexer`: Tokenization and string literal decoding
//! - `ast`: Owned syntax tree for executable documents
//! - `parser`: Recursive descent parser

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::*;
pub use lexer::Lexer;
pub use parser::{parse, ParseResult, MAX_NESTING};
pub use token::{Token, TokenKind};
