//! The structured, version-tagged change representation that the bundle
//! grammar is parsed into (and serialized back out of). Kept distinct from
//! the wire text so the rest of the engine never regexes bundles directly.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::error::CodecError;

/// File operation declared by a single `Change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Create,
    Modify,
    Delete,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Create => "CREATE",
            Op::Modify => "MODIFY",
            Op::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Op> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATE" => Some(Op::Create),
            "MODIFY" => Some(Op::Modify),
            "DELETE" => Some(Op::Delete),
            _ => None,
        }
    }
}

/// How `new_content`/`old_content` bytes are represented in the wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Utf8,
    Base64,
}

impl Encoding {
    pub fn parse(s: &str) -> Option<Encoding> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf8" => Some(Encoding::Utf8),
            "base64" => Some(Encoding::Base64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Base64 => "base64",
        }
    }
}

/// A single, immutable file operation parsed from (or destined for) a
/// patch bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub op: Op,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub new_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub old_content: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub encoding: Encoding,
}

impl Change {
    /// Builds a `CREATE` change. Fails the `CREATE` invariant at the
    /// construction boundary: content is mandatory.
    pub fn create(path: impl Into<String>, new_content: impl Into<String>, reason: impl Into<String>) -> Self {
        Change {
            op: Op::Create,
            path: path.into(),
            new_content: Some(new_content.into()),
            old_content: None,
            reason: reason.into(),
            encoding: Encoding::Utf8,
        }
    }

    pub fn modify(
        path: impl Into<String>,
        new_content: impl Into<String>,
        old_content: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Change {
            op: Op::Modify,
            path: path.into(),
            new_content: Some(new_content.into()),
            old_content,
            reason: reason.into(),
            encoding: Encoding::Utf8,
        }
    }

    pub fn delete(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Change {
            op: Op::Delete,
            path: path.into(),
            new_content: None,
            old_content: None,
            reason: reason.into(),
            encoding: Encoding::Utf8,
        }
    }

    /// Decodes `new_content` according to `encoding`, returning raw bytes.
    pub fn decoded_new_content(&self) -> Result<Option<Vec<u8>>, CodecError> {
        decode_field(&self.path, self.new_content.as_deref(), self.encoding)
    }

    pub fn decoded_old_content(&self) -> Result<Option<Vec<u8>>, CodecError> {
        decode_field(&self.path, self.old_content.as_deref(), self.encoding)
    }
}

fn decode_field(
    path: &str,
    field: Option<&str>,
    encoding: Encoding,
) -> Result<Option<Vec<u8>>, CodecError> {
    let Some(text) = field else {
        return Ok(None);
    };
    match encoding {
        Encoding::Utf8 => Ok(Some(text.as_bytes().to_vec())),
        Encoding::Base64 => BASE64
            .decode(text.trim())
            .map(Some)
            .map_err(|e| CodecError::InvalidBase64 {
                path: path.to_string(),
                message: e.to_string(),
            }),
    }
}

/// The version-tagged structured form of a change set, carrying the same
/// semantics as a patch bundle without the textual grammar. `version` is
/// pinned by `codec.internal_patch_version` (default `2`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalPatch {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub changes: Vec<Change>,
}

impl InternalPatch {
    pub fn new(version: u32, timestamp: DateTime<Utc>, changes: Vec<Change>) -> Self {
        InternalPatch {
            version,
            timestamp,
            metadata: serde_json::Value::Null,
            changes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn internal_patch_json_round_trip() {
        let changes = vec![
            Change::create("/a.txt", "x\n", "add a"),
            Change::modify("/b.txt", "y\n", Some("z\n".to_string()), "update b"),
            Change::delete("/c.txt", "remove c"),
        ];
        let patch = InternalPatch::new(2, Utc::now(), changes);
        let json = serde_json::to_string(&patch).unwrap();
        let back: InternalPatch = serde_json::from_str(&json).unwrap();
        assert_eq!(patch, back);
    }

    #[test]
    fn base64_encoding_round_trips_binary_content() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"\x00\x01\xff");
        let change = Change {
            op: Op::Create,
            path: "/bin.dat".to_string(),
            new_content: Some(encoded),
            old_content: None,
            reason: String::new(),
            encoding: Encoding::Base64,
        };
        let decoded = change.decoded_new_content().unwrap().unwrap();
        assert_eq!(decoded, vec![0x00, 0x01, 0xff]);
    }

    #[test]
    fn op_and_encoding_parse_are_case_insensitive() {
        assert_eq!(Op::parse("create"), Some(Op::Create));
        assert_eq!(Op::parse("DELETE"), Some(Op::Delete));
        assert_eq!(Op::parse("bogus"), None);
        assert_eq!(Encoding::parse("UTF8"), None);
        assert_eq!(Encoding::parse("utf8"), Some(Encoding::Utf8));
    }
}
