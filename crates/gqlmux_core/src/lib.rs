//! Core utilities for gqlmux.
//!
//! This crate provides foundational types shared by the parser, the runtime and
//! the server:
//! - `span`: byte spans and line/column locations
//! - `diagnostics`: error reporting for documents
//! - `size`: human-readable byte size limits (`"20mb"`)

pub mod diagnostics;
pub mod size;
pub mod span;

pub use diagnostics::{Diagnostic, DiagnosticBag, DiagnosticSeverity, Label};
pub use size::{parse_size, ByteSize, SizeError};
pub use span::{SourceLocation, Span};
