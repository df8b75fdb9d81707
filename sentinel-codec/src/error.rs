use thiserror::Error;

/// Errors surfaced while encoding, decoding, or validating a bundle.
///
/// Every variant carries the 1-based line number it was detected at so
/// callers can point a user at the offending text directly, per the
/// single-pass scanner design (predictable error locations instead of the
/// ad-hoc locations a backtracking regex parser would produce).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("duplicate path in patch: {0}")]
    DuplicatePath(String),

    #[error("unterminated file block starting at line {line} for path {path}")]
    UnterminatedBlock { line: usize, path: String },

    #[error("line {line}: end marker path mismatch: expected {expected}, found {found}")]
    MismatchedEndMarker {
        line: usize,
        expected: String,
        found: String,
    },

    #[error("invalid base64 content for {path}: {message}")]
    InvalidBase64 { path: String, message: String },

    #[error("unknown operation {operation:?} at line {line}")]
    UnknownOperation { line: usize, operation: String },

    #[error("change preamble at line {line} is missing required field {field}")]
    MissingField { line: usize, field: String },
}
