//! Wire grammar for context bundles (whole-file snapshots sent to the model)
//! and patch bundles (file operations returned by the model). Both dialects
//! share one marker grammar and are parsed by a single linear pass over the
//! bundle's lines rather than a backtracking regex, so a malformed bundle
//! fails at a precise, reportable line.

use std::collections::HashMap;
use std::collections::HashSet;

use similar::ChangeTag;
use similar::TextDiff;

use crate::change::Change;
use crate::change::Encoding;
use crate::change::Op;
use crate::error::CodecError;

/// Fixed glyph prefixing every marker line, distinguishing it from bundle
/// content that happens to resemble a marker.
pub const MARKER_GLYPH: &str = "\u{1F43E}";
pub const CATS_START_TAG: &str = "--- CATS_START_FILE:";
pub const CATS_END_TAG: &str = "--- CATS_END_FILE:";
pub const DOGS_START_TAG: &str = "--- DOGS_START_FILE:";
pub const DOGS_END_TAG: &str = "--- DOGS_END_FILE:";

const CHANGE_FENCE_OPEN: &str = "```change";
const FENCE_CLOSE: &str = "```";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Context,
    Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerifyResult {
    pub verified: bool,
    pub mismatches: Vec<String>,
}

/// Result of `decode_patch`: the ordered change list plus convenience
/// partitions by operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedPatch {
    pub creates: Vec<Change>,
    pub modifies: Vec<Change>,
    pub deletes: Vec<Change>,
    pub changes: Vec<Change>,
}

impl ParsedPatch {
    /// Builds a `ParsedPatch` from an already-materialized change list, e.g.
    /// one taken back out of a `CycleContext` rather than freshly parsed
    /// from bundle text.
    pub fn from_changes(changes: Vec<Change>) -> Self {
        let mut out = ParsedPatch {
            changes: changes.clone(),
            ..Default::default()
        };
        for change in changes {
            match change.op {
                Op::Create => out.creates.push(change),
                Op::Modify => out.modifies.push(change),
                Op::Delete => out.deletes.push(change),
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

fn marker_line(tag: &str, path: &str) -> String {
    format!("{MARKER_GLYPH} {tag} {path} ---")
}

/// If `line` is a marker line for `tag`, returns the declared path.
fn parse_marker(line: &str, tag: &str) -> Option<String> {
    let prefix = format!("{MARKER_GLYPH} {tag} ");
    let rest = line.strip_prefix(&prefix)?;
    rest.strip_suffix(" ---").map(|p| p.to_string())
}

/// Encodes a sequence of whole files into a context bundle.
pub fn encode_context<I, S1, S2>(files: I) -> String
where
    I: IntoIterator<Item = (S1, S2)>,
    S1: AsRef<str>,
    S2: AsRef<str>,
{
    let mut out = String::new();
    for (path, content) in files {
        let path = path.as_ref();
        out.push_str(&marker_line(CATS_START_TAG, path));
        out.push('\n');
        for line in content.as_ref().split('\n') {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&marker_line(CATS_END_TAG, path));
        out.push('\n');
    }
    out
}

/// Parses a context bundle back into an ordered list of `(path, content)`.
/// Text outside marker blocks is commentary and is ignored.
pub fn decode_context(bundle_text: &str) -> Result<Vec<(String, String)>, CodecError> {
    let mut files = Vec::new();
    let mut lines = bundle_text.lines().enumerate().peekable();

    while let Some((idx, line)) = lines.next() {
        let Some(path) = parse_marker(line, CATS_START_TAG) else {
            continue;
        };
        let start_line = idx + 1;
        let mut content_lines = Vec::new();
        let mut closed = false;
        for (_, inner_line) in lines.by_ref() {
            if let Some(end_path) = parse_marker(inner_line, CATS_END_TAG) {
                if end_path != path {
                    return Err(CodecError::MismatchedEndMarker {
                        line: start_line,
                        expected: path.clone(),
                        found: end_path,
                    });
                }
                closed = true;
                break;
            }
            content_lines.push(inner_line.to_string());
        }
        if !closed {
            return Err(CodecError::UnterminatedBlock {
                line: start_line,
                path,
            });
        }
        files.push((path, content_lines.join("\n")));
    }

    Ok(files)
}

struct PendingChange {
    preamble_line: usize,
    op: Op,
    path: String,
    reason: String,
    encoding: Encoding,
}

/// Encodes a change set into a patch bundle. `metadata`, when present, is
/// emitted as a leading commentary block; it plays no role in round-trip
/// equality of the decoded change list.
pub fn encode_patch(changes: &[Change], metadata: Option<&serde_json::Value>) -> String {
    let mut out = String::new();
    if let Some(meta) = metadata {
        out.push_str("```meta\n");
        out.push_str(&serde_json::to_string_pretty(meta).unwrap_or_else(|_| "{}".to_string()));
        out.push('\n');
        out.push_str(FENCE_CLOSE);
        out.push('\n');
    }

    for change in changes {
        out.push_str(CHANGE_FENCE_OPEN);
        out.push('\n');
        out.push_str(&format!("operation: {}\n", change.op.as_str()));
        out.push_str(&format!("path: {}\n", change.path));
        if !change.reason.is_empty() {
            out.push_str(&format!("reason: {}\n", change.reason));
        }
        out.push_str(&format!("encoding: {}\n", change.encoding.as_str()));
        out.push_str(FENCE_CLOSE);
        out.push('\n');

        if change.op != Op::Delete {
            let content = change.new_content.as_deref().unwrap_or("");
            out.push_str(&marker_line(DOGS_START_TAG, &change.path));
            out.push('\n');
            for line in content.split('\n') {
                out.push_str(line);
                out.push('\n');
            }
            out.push_str(&marker_line(DOGS_END_TAG, &change.path));
            out.push('\n');
        }
    }
    out
}

/// Parses a patch bundle into a `ParsedPatch`. Empty input parses to an
/// empty `ParsedPatch` without error.
pub fn decode_patch(bundle_text: &str) -> Result<ParsedPatch, CodecError> {
    let mut changes: Vec<Change> = Vec::new();
    let mut seen_paths: HashSet<String> = HashSet::new();

    let raw_lines: Vec<&str> = bundle_text.lines().collect();
    let mut i = 0usize;

    while i < raw_lines.len() {
        let line = raw_lines[i];

        if line.trim_end() == "```meta" {
            i += 1;
            while i < raw_lines.len() && raw_lines[i].trim_end() != FENCE_CLOSE {
                i += 1;
            }
            i += 1; // consume closing fence
            continue;
        }

        if line.trim_end() == CHANGE_FENCE_OPEN {
            let preamble_line = i + 1;
            i += 1;
            let mut fields: HashMap<String, String> = HashMap::new();
            while i < raw_lines.len() && raw_lines[i].trim_end() != FENCE_CLOSE {
                let field_line = raw_lines[i];
                if let Some((key, value)) = field_line.split_once(':') {
                    fields.insert(key.trim().to_string(), value.trim().to_string());
                }
                i += 1;
            }
            if i >= raw_lines.len() {
                return Err(CodecError::Malformed {
                    line: preamble_line,
                    message: "unterminated change preamble".to_string(),
                });
            }
            i += 1; // consume closing fence of preamble

            let operation = fields.get("operation").ok_or_else(|| CodecError::MissingField {
                line: preamble_line,
                field: "operation".to_string(),
            })?;
            let op = Op::parse(operation).ok_or_else(|| CodecError::UnknownOperation {
                line: preamble_line,
                operation: operation.clone(),
            })?;
            let path = fields
                .get("path")
                .ok_or_else(|| CodecError::MissingField {
                    line: preamble_line,
                    field: "path".to_string(),
                })?
                .clone();
            let reason = fields.get("reason").cloned().unwrap_or_default();
            let encoding = fields
                .get("encoding")
                .and_then(|s| Encoding::parse(s))
                .unwrap_or_default();

            if !seen_paths.insert(path.clone()) {
                return Err(CodecError::DuplicatePath(path));
            }

            let pending = PendingChange {
                preamble_line,
                op,
                path,
                reason,
                encoding,
            };

            if pending.op == Op::Delete {
                changes.push(Change {
                    op: pending.op,
                    path: pending.path,
                    new_content: None,
                    old_content: None,
                    reason: pending.reason,
                    encoding: pending.encoding,
                });
                continue;
            }

            // Scan forward for the matching DOGS_START_FILE block. Anything
            // else encountered first is commentary; another change preamble
            // or end-of-input before the block means the content was
            // omitted where the dialect required it.
            let mut found_start: Option<usize> = None;
            let mut j = i;
            while j < raw_lines.len() {
                let candidate = raw_lines[j];
                if candidate.trim_end() == CHANGE_FENCE_OPEN {
                    break;
                }
                if let Some(p) = parse_marker(candidate, DOGS_START_TAG) {
                    if p == pending.path {
                        found_start = Some(j);
                    }
                    break;
                }
                j += 1;
            }

            let Some(start_idx) = found_start else {
                return Err(CodecError::UnterminatedBlock {
                    line: pending.preamble_line,
                    path: pending.path,
                });
            };

            let mut k = start_idx + 1;
            let mut content_lines = Vec::new();
            let mut closed = false;
            while k < raw_lines.len() {
                if let Some(end_path) = parse_marker(raw_lines[k], DOGS_END_TAG) {
                    if end_path != pending.path {
                        return Err(CodecError::MismatchedEndMarker {
                            line: start_idx + 1,
                            expected: pending.path.clone(),
                            found: end_path,
                        });
                    }
                    closed = true;
                    break;
                }
                content_lines.push(raw_lines[k].to_string());
                k += 1;
            }
            if !closed {
                return Err(CodecError::UnterminatedBlock {
                    line: start_idx + 1,
                    path: pending.path,
                });
            }

            changes.push(Change {
                op: pending.op,
                path: pending.path,
                new_content: Some(content_lines.join("\n")),
                old_content: None,
                reason: pending.reason,
                encoding: pending.encoding,
            });
            i = k + 1;
            continue;
        }

        i += 1;
    }

    Ok(ParsedPatch::from_changes(changes))
}

/// Structural validation: attempts a full decode and reports the first
/// error encountered, wrapped in the `{valid, errors[]}` shape §4.3 asks
/// for so callers don't need to match on `CodecError` directly.
pub fn validate(bundle_text: &str, dialect: Dialect) -> ValidationResult {
    let result = match dialect {
        Dialect::Context => decode_context(bundle_text).map(|_| ()),
        Dialect::Patch => decode_patch(bundle_text).map(|_| ()),
    };
    match result {
        Ok(()) => ValidationResult {
            valid: true,
            errors: Vec::new(),
        },
        Err(e) => ValidationResult {
            valid: false,
            errors: vec![e.to_string()],
        },
    }
}

/// Renders a short unified-diff-style snippet (at most 6 changed lines) of
/// `expected` against `actual`, for mismatch reports a human can act on
/// without reaching for an external diff tool.
fn diff_snippet(expected: &str, actual: &str) -> String {
    let diff = TextDiff::from_lines(expected, actual);
    let mut lines = Vec::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => continue,
        };
        lines.push(format!("{sign}{}", change.to_string_lossy().trim_end_matches('\n')));
        if lines.len() == 6 {
            lines.push("...".to_string());
            break;
        }
    }
    lines.join("\n")
}

/// Semantic check of a parsed patch against a pre-change snapshot: a
/// `MODIFY`'s declared `old_content` matches, `DELETE` targets exist, and
/// `CREATE` targets are absent.
pub fn verify_against(patch: &ParsedPatch, snapshot: &HashMap<String, Vec<u8>>) -> VerifyResult {
    let mut mismatches = Vec::new();

    for change in &patch.changes {
        match change.op {
            Op::Create => {
                if snapshot.contains_key(&change.path) {
                    mismatches.push(format!("CREATE target already exists: {}", change.path));
                }
            }
            Op::Delete => {
                if !snapshot.contains_key(&change.path) {
                    mismatches.push(format!("DELETE target does not exist: {}", change.path));
                }
            }
            Op::Modify => {
                if !snapshot.contains_key(&change.path) {
                    mismatches.push(format!("MODIFY target does not exist: {}", change.path));
                    continue;
                }
                if let Some(declared_old) = &change.old_content {
                    let actual = snapshot.get(&change.path).cloned().unwrap_or_default();
                    if declared_old.as_bytes() != actual.as_slice() {
                        mismatches.push(format!(
                            "MODIFY old_content mismatch for {}:\n{}",
                            change.path,
                            diff_snippet(declared_old, &String::from_utf8_lossy(&actual))
                        ));
                    }
                }
            }
        }
    }

    VerifyResult {
        verified: mismatches.is_empty(),
        mismatches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn context_round_trip_single_file() {
        let files = vec![("/src/main.js".to_string(), "export {}\n".to_string())];
        let encoded = encode_context(files.clone());
        let decoded = decode_context(&encoded).unwrap();
        assert_eq!(files, decoded);
    }

    #[test]
    fn context_round_trip_multiple_files_and_commentary() {
        let files = vec![
            ("/a.txt".to_string(), "one\ntwo\n".to_string()),
            ("/b.txt".to_string(), "".to_string()),
        ];
        let mut encoded = String::from("model commentary before the bundle\n");
        encoded.push_str(&encode_context(files.clone()));
        encoded.push_str("trailing commentary\n");
        let decoded = decode_context(&encoded).unwrap();
        assert_eq!(files, decoded);
    }

    #[test]
    fn context_unterminated_block_errors_with_line() {
        let bad = format!("{MARKER_GLYPH} {CATS_START_TAG} /a.txt ---\nstuff\n");
        let err = decode_context(&bad).unwrap_err();
        assert!(matches!(err, CodecError::UnterminatedBlock { line: 1, .. }));
    }

    #[test]
    fn patch_round_trip_create_modify_delete() {
        let changes = vec![
            Change::create("/a.txt", "x\n", ""),
            Change::modify("/b.txt", "y\n", Some("z\n".to_string()), ""),
            Change::delete("/c.txt", ""),
        ];
        let encoded = encode_patch(&changes, None);
        let parsed = decode_patch(&encoded).unwrap();
        assert_eq!(parsed.changes, changes);
        assert_eq!(parsed.creates.len(), 1);
        assert_eq!(parsed.modifies.len(), 1);
        assert_eq!(parsed.deletes.len(), 1);
    }

    #[test]
    fn patch_round_trip_with_metadata_commentary() {
        let changes = vec![Change::create("/a.txt", "hi\n", "initial add")];
        let meta = serde_json::json!({ "model": "test" });
        let encoded = encode_patch(&changes, Some(&meta));
        let parsed = decode_patch(&encoded).unwrap();
        assert_eq!(parsed.changes, changes);
    }

    #[test]
    fn patch_duplicate_path_is_an_error() {
        let changes = vec![
            Change::create("/a.txt", "x\n", ""),
            Change::create("/a.txt", "y\n", ""),
        ];
        let encoded = encode_patch(&changes, None);
        let err = decode_patch(&encoded).unwrap_err();
        assert_eq!(err, CodecError::DuplicatePath("/a.txt".to_string()));
    }

    #[test]
    fn patch_empty_bundle_parses_to_zero_changes() {
        let parsed = decode_patch("").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn patch_missing_content_block_for_create_errors() {
        let bad = "```change\noperation: CREATE\npath: /a.txt\nencoding: utf8\n```\n";
        let err = decode_patch(bad).unwrap_err();
        assert!(matches!(err, CodecError::UnterminatedBlock { .. }));
    }

    #[test]
    fn verify_against_detects_modify_mismatch_and_delete_missing() {
        let changes = vec![
            Change::modify("/a.txt", "new\n", Some("declared-old\n".to_string()), ""),
            Change::delete("/missing.txt", ""),
        ];
        let patch = ParsedPatch::from_changes(changes);
        let mut snapshot = HashMap::new();
        snapshot.insert("/a.txt".to_string(), b"actual-old\n".to_vec());

        let result = verify_against(&patch, &snapshot);
        assert!(!result.verified);
        assert_eq!(result.mismatches.len(), 2);
    }

    #[test]
    fn validate_reports_errors_without_panicking() {
        let result = validate("not a bundle at all", Dialect::Patch);
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }
}
