//! Error kinds, typed errors and decode diagnostics.

use crate::source::SourceSpan;
use crate::tree::NodeId;
use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure of a cursor read, an edit, an encode pass or a derivation.
///
/// Errors are plain values: decoders return them, aggregate scopes turn them
/// into ErrorNodes, and derivation caches keep them for replay (hence `Clone`).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("out of range: {requested} bits requested at bit {position}, {available} available")]
    OutOfRange {
        position: u64,
        requested: u64,
        available: u64,
    },
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("structural corruption at bit {position}: {message}")]
    StructuralCorruption { position: u64, message: String },
    #[error("not encodable: {0}")]
    NotEncodable(String),
    #[error("derivation `{function}` failed: {message}")]
    Derivation { function: String, message: String },
    #[error("invalid node: {0}")]
    InvalidNode(NodeId),
}

impl Error {
    pub fn corrupt(position: u64, message: impl Into<String>) -> Self {
        Error::StructuralCorruption {
            position,
            message: message.into(),
        }
    }

    pub fn mismatch(message: impl Into<String>) -> Self {
        Error::TypeMismatch(message.into())
    }

    pub fn derivation(function: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Derivation {
            function: function.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfRange { .. } => ErrorKind::OutOfRange,
            Error::TypeMismatch(_) => ErrorKind::TypeMismatch,
            Error::StructuralCorruption { .. } => ErrorKind::StructuralCorruption,
            Error::NotEncodable(_) => ErrorKind::NotEncodable,
            Error::Derivation { .. } => ErrorKind::DerivationError,
            Error::InvalidNode(_) => ErrorKind::InvalidNode,
        }
    }
}

/// Classification of an [`Error`], also carried by ErrorNodes and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    OutOfRange,
    TypeMismatch,
    StructuralCorruption,
    NotEncodable,
    DerivationError,
    /// A node id that was removed by an edit or never existed.
    InvalidNode,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::OutOfRange => "OutOfRange",
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::StructuralCorruption => "StructuralCorruption",
            ErrorKind::NotEncodable => "NotEncodable",
            ErrorKind::DerivationError => "DerivationError",
            ErrorKind::InvalidNode => "InvalidNode",
        };
        f.write_str(s)
    }
}

/// One step of a node path: a struct field name or a sequence index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// Render a path as `a.b[2].c`.
pub fn format_path(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for seg in path {
        match seg {
            PathSegment::Field(name) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
            }
            PathSegment::Index(i) => {
                out.push('[');
                out.push_str(&i.to_string());
                out.push(']');
            }
        }
    }
    out
}

/// A failure recorded during decoding. The ErrorNode it produced lives in the tree;
/// the diagnostic is the flat list view handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    pub span: SourceSpan,
    pub path: Vec<PathSegment>,
}

impl Diagnostic {
    pub fn from_error(err: &Error, span: SourceSpan, path: Vec<PathSegment>) -> Self {
        Diagnostic {
            kind: err.kind(),
            message: err.to_string(),
            span,
            path,
        }
    }

    pub fn path_string(&self) -> String {
        format_path(&self.path)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.path_string();
        let path = if path.is_empty() { "<root>" } else { path.as_str() };
        write!(f, "{} at {} {}: {}", self.kind, path, self.span, self.message)
    }
}
