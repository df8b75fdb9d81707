//! Bundle codec for the Sentinel Cycle Engine.
//!
//! Two textual dialects share one marker grammar: context bundles
//! (whole-file snapshots sent to the model) and patch
//! bundles (file operations returned by the model). Both are parsed by a
//! single linear scan, never a backtracking regex, and round-trip losslessly
//! for valid input.

pub mod bundle;
pub mod change;
pub mod error;

pub use bundle::CATS_END_TAG;
pub use bundle::CATS_START_TAG;
pub use bundle::DOGS_END_TAG;
pub use bundle::DOGS_START_TAG;
pub use bundle::Dialect;
pub use bundle::MARKER_GLYPH;
pub use bundle::ParsedPatch;
pub use bundle::ValidationResult;
pub use bundle::VerifyResult;
pub use bundle::decode_context;
pub use bundle::decode_patch;
pub use bundle::encode_context;
pub use bundle::encode_patch;
pub use bundle::validate;
pub use bundle::verify_against;
pub use change::Change;
pub use change::Encoding;
pub use change::InternalPatch;
pub use change::Op;
pub use error::CodecError;
