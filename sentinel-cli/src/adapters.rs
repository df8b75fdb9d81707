//! Scripted collaborators used by the `sentinel` binary in place of a real
//! LLM transport, content-addressed store, and test runner: a fixed list of
//! paths stands in for model-driven curation, a bundle read from disk (or
//! stdin) stands in for a model-driven proposal, and a shell command run
//! against a materialized temp directory stands in for a real test suite.
//!
//! Grounded on `core/src/exec.rs`'s child-process spawn/timeout/capture
//! shape for `ShellVerifier`, and `file-search/src/lib.rs`'s `ignore::
//! WalkBuilder` use for directory discovery.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use ignore::WalkBuilder;
use sentinel_core::cycle::Curator;
use sentinel_core::cycle::ProposalGenerator;
use sentinel_core::reflection::ReflectionEntry;
use sentinel_core::reflection::ReflectionSink;
use sentinel_core::verifier::VerificationOutcome;
use sentinel_core::verifier::VerifierAdapter;
use sentinel_core::vfs::InMemoryVfs;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Walks `root` (honouring `.gitignore`, as `codex-file-search` does),
/// seeding `vfs` with every regular file found. Returns the discovered
/// paths, VFS-absolute and sorted, for use as a default curation set.
pub fn seed_vfs_from_dir(vfs: &InMemoryVfs, root: &Path) -> anyhow::Result<Vec<String>> {
    let mut paths = Vec::new();
    for entry in WalkBuilder::new(root).hidden(false).build() {
        let entry = entry?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let vfs_path = format!("/{}", relative.to_string_lossy().replace('\\', "/"));
        let bytes = std::fs::read(entry.path())?;
        vfs.seed([(vfs_path.clone(), bytes)]);
        paths.push(vfs_path);
    }
    paths.sort();
    Ok(paths)
}

/// Writes every `(VFS-absolute path, bytes)` pair into `dir`, creating
/// parent directories as needed. Used to give a real shell command a real
/// filesystem to run against.
fn materialize(dir: &Path, snapshot: &HashMap<String, Vec<u8>>) -> std::io::Result<()> {
    for (path, bytes) in snapshot {
        let relative = path.trim_start_matches('/');
        let dest = dir.join(relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, bytes)?;
    }
    Ok(())
}

/// Returns a fixed set of paths regardless of `goal`: curation here is a
/// pre-selected list on disk, not a model call.
pub struct StaticCurator(pub Vec<String>);

#[async_trait]
impl Curator for StaticCurator {
    async fn curate(&self, _goal: &str) -> sentinel_core::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Returns a fixed patch bundle regardless of the context bundle sent to
/// it: the "model" here is whatever text the caller supplied up front.
pub struct StaticGenerator(pub String);

#[async_trait]
impl ProposalGenerator for StaticGenerator {
    async fn generate(&self, _context_bundle: &str) -> sentinel_core::Result<String> {
        Ok(self.0.clone())
    }
}

/// Reads the patch bundle to hand to `StaticGenerator` from a file, or
/// from stdin when `path` is `-`.
pub fn read_patch_source(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}

/// Runs `command` via `sh -c` against a temp-directory materialization of
/// the post-apply snapshot. The timeout is enforced by the caller's
/// `run_with_timeout` wrapper, which drops this future on expiry; `Command`
/// is configured `kill_on_drop` so the child does not outlive it.
pub struct ShellVerifier {
    pub command: String,
    pub timeout: Duration,
}

#[async_trait]
impl VerifierAdapter for ShellVerifier {
    async fn run(
        &self,
        snapshot: &HashMap<String, Vec<u8>>,
    ) -> Result<VerificationOutcome, sentinel_core::verifier::VerifierError> {
        let workdir = tempfile::tempdir().map_err(|e| {
            sentinel_core::verifier::VerifierError(format!("failed to create temp dir: {e}"))
        })?;
        materialize(workdir.path(), snapshot).map_err(|e| {
            sentinel_core::verifier::VerifierError(format!("failed to materialize snapshot: {e}"))
        })?;

        let start = std::time::Instant::now();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| sentinel_core::verifier::VerifierError(format!("failed to spawn verify_cmd: {e}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout).await;
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr).await;
        }
        let status = child
            .wait()
            .await
            .map_err(|e| sentinel_core::verifier::VerifierError(format!("verify_cmd wait failed: {e}")))?;

        let passed = status.success();
        let summary = if passed {
            format!("{} exited 0", self.command)
        } else {
            let tail = if stderr.trim().is_empty() { stdout } else { stderr };
            let tail: String = tail.lines().rev().take(5).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n");
            format!("{} exited {}: {tail}", self.command, status.code().unwrap_or(-1))
        };

        Ok(VerificationOutcome {
            passed,
            summary,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Appends one JSON line per recorded cycle outcome, mirroring
/// `core/src/rollout.rs`'s append-only session log. A write failure is
/// logged and otherwise swallowed: the reflection sink must never fail the
/// cycle it is recording.
pub struct JsonlReflectionSink {
    path: PathBuf,
}

impl JsonlReflectionSink {
    pub fn new(path: PathBuf) -> Self {
        JsonlReflectionSink { path }
    }
}

#[async_trait]
impl ReflectionSink for JsonlReflectionSink {
    async fn record(&self, entry: ReflectionEntry) {
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize reflection entry");
                return;
            }
        };
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{line}")
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to append reflection entry"),
            Err(e) => tracing::warn!(error = %e, "reflection write task panicked"),
        }
    }
}

