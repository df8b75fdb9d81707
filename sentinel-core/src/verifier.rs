//! Verifier contract: runs tests against a VFS snapshot and summarizes the
//! result. A timeout is surfaced as a failed outcome, not a panic.
//!
//! Grounded on `core/src/exec.rs`'s `process_exec_tool_call` timeout
//! handling: a `tokio::time::timeout` wraps the inner future, and expiry is
//! mapped to a domain result rather than propagated as an error.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub summary: String,
    pub duration_ms: u64,
}

impl VerificationOutcome {
    pub fn timeout() -> Self {
        VerificationOutcome {
            passed: false,
            summary: "timeout".to_string(),
            duration_ms: 0,
        }
    }
}

/// A transient failure of the verifier itself (process spawn error, I/O
/// error reaching the snapshot), distinct from an assertion failure: the
/// caller retries once on this, never on `VerificationOutcome { passed:
/// false, .. }`.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("verifier error: {0}")]
pub struct VerifierError(pub String);

#[async_trait]
pub trait VerifierAdapter: Send + Sync {
    async fn run(
        &self,
        snapshot: &HashMap<String, Vec<u8>>,
    ) -> Result<VerificationOutcome, VerifierError>;

    fn timeout(&self) -> Duration;
}

/// Runs `inner` under `adapter.timeout()`, mapping expiry to a failed
/// outcome rather than an error.
pub async fn run_with_timeout(
    adapter: &dyn VerifierAdapter,
    snapshot: &HashMap<String, Vec<u8>>,
) -> Result<VerificationOutcome, VerifierError> {
    match tokio::time::timeout(adapter.timeout(), adapter.run(snapshot)).await {
        Ok(result) => result,
        Err(_elapsed) => Ok(VerificationOutcome::timeout()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct ScriptedVerifier {
        outcome: VerificationOutcome,
        delay: Duration,
        timeout: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VerifierAdapter for ScriptedVerifier {
        async fn run(
            &self,
            _snapshot: &HashMap<String, Vec<u8>>,
        ) -> Result<VerificationOutcome, VerifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.outcome.clone())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }
    }

    #[tokio::test]
    async fn passing_outcome_is_returned_verbatim() {
        let verifier = ScriptedVerifier {
            outcome: VerificationOutcome {
                passed: true,
                summary: "ok".to_string(),
                duration_ms: 5,
            },
            delay: Duration::from_millis(0),
            timeout: Duration::from_secs(1),
            calls: AtomicUsize::new(0),
        };
        let result = run_with_timeout(&verifier, &HashMap::new()).await.unwrap();
        assert!(result.passed);
    }

    #[tokio::test]
    async fn exceeding_timeout_is_a_failed_outcome_not_an_error() {
        let verifier = ScriptedVerifier {
            outcome: VerificationOutcome {
                passed: true,
                summary: "ok".to_string(),
                duration_ms: 5,
            },
            delay: Duration::from_millis(50),
            timeout: Duration::from_millis(5),
            calls: AtomicUsize::new(0),
        };
        let result = run_with_timeout(&verifier, &HashMap::new()).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.summary, "timeout");
    }
}
