//! Incremental SAX scan of S3 response bodies.
//!
//! S3 and Walrus responses reuse a small, closed set of XML element names.
//! The scanner tracks them on a fixed-depth stack and dispatches to a
//! per-operation [`ResponseVisitor`], so a listing of any size is parsed in
//! bounded memory as the body streams in. The shared `<Error>` envelope is
//! handled here once, for every operation.
//!
//! # Modules
//!
//! - [`tags`] - The recognized tag set and the fixed-depth tag stack
//! - [`scanner`] - The event loop driving a visitor over a streaming body

pub mod scanner;
pub mod tags;

pub use scanner::{scan, ResponseVisitor, ScanError};
pub use tags::{ResponseTag, TagStack, MAX_DEPTH};
