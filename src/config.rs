use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared by every actor hosted in an [`ActorSystem`](crate::ActorSystem).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TxnConfig {
    /// How long a `call` waits for its reply. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Delay before the first commit re-dispatch after a failed attempt.
    pub commit_retry_backoff: Duration,
    /// Upper bound for the doubling commit re-dispatch delay.
    pub max_commit_retry_backoff: Duration,
    /// Delay before a failed ledger purge is tried again.
    pub purge_retry_backoff: Duration,
    /// Resume commit dispatch when a coordinator activates with a durable
    /// decision whose commit phase never completed. A coordinator that
    /// activates with participants but no decision aborts.
    pub resume_on_activate: bool,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(30)),
            commit_retry_backoff: Duration::from_millis(10),
            max_commit_retry_backoff: Duration::from_secs(1),
            purge_retry_backoff: Duration::from_millis(50),
            resume_on_activate: true,
        }
    }
}

impl TxnConfig {
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_commit_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.commit_retry_backoff = initial;
        self.max_commit_retry_backoff = max.max(initial);
        self
    }

    pub fn with_purge_retry_backoff(mut self, backoff: Duration) -> Self {
        self.purge_retry_backoff = backoff;
        self
    }

    pub fn with_resume_on_activate(mut self, resume: bool) -> Self {
        self.resume_on_activate = resume;
        self
    }

    /// Backoff to wait before commit dispatch attempt number `attempt`
    /// (zero-based, counting failed attempts so far).
    pub fn commit_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.commit_retry_backoff
            .saturating_mul(factor)
            .min(self.max_commit_retry_backoff)
    }
}
