use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Severity of a reconciliation issue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How deeply cited sources are checked before commit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    /// Sources are recorded as cited, never fetched.
    Off,
    /// The URL must answer with a success status.
    #[default]
    Fetch,
    /// The fetched page must also mention the recommended version.
    FetchAndMatchVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResearchConfig {
    /// Dispatch attempts per opportunity in one round before it is skipped.
    pub retry_budget: u32,
    /// Targeted re-dispatch rounds allowed per opportunity during reconciliation.
    pub max_redispatch_rounds: u32,
    pub worker_timeout_secs: u64,
    pub max_concurrent_workers: usize,
    /// Issues at or above this severity are escalated instead of tie-broken.
    pub escalation_threshold: Severity,
    pub verification: VerificationMode,
    pub verification_timeout_secs: u64,
    /// Abort the commit when hard gaps remain instead of reporting them.
    pub strict_gaps: bool,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            retry_budget: 2,
            max_redispatch_rounds: 2,
            worker_timeout_secs: 300,
            max_concurrent_workers: 8,
            escalation_threshold: Severity::High,
            verification: VerificationMode::Fetch,
            verification_timeout_secs: 20,
            strict_gaps: false,
        }
    }
}

impl ResearchConfig {
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    pub fn with_max_redispatch_rounds(mut self, rounds: u32) -> Self {
        self.max_redispatch_rounds = rounds;
        self
    }

    pub fn with_worker_timeout(mut self, secs: u64) -> Self {
        self.worker_timeout_secs = secs;
        self
    }

    pub fn with_max_concurrent_workers(mut self, workers: usize) -> Self {
        self.max_concurrent_workers = workers;
        self
    }

    pub fn with_escalation_threshold(mut self, threshold: Severity) -> Self {
        self.escalation_threshold = threshold;
        self
    }

    pub fn with_verification(mut self, mode: VerificationMode) -> Self {
        self.verification = mode;
        self
    }

    pub fn with_strict_gaps(mut self, strict: bool) -> Self {
        self.strict_gaps = strict;
        self
    }

    /// At least one attempt is always made.
    pub fn attempts_per_round(&self) -> u32 {
        self.retry_budget.max(1)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Release tasks left in progress by an interrupted run.
    pub release_stale_on_recover: bool,
    /// Upper bound on driver loop iterations.
    pub max_iterations: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            release_stale_on_recover: true,
            max_iterations: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn with_release_stale_on_recover(mut self, release: bool) -> Self {
        self.release_stale_on_recover = release;
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub research: ResearchConfig,
    pub scheduler: SchedulerConfig,
}

impl OrchestratorConfig {
    pub fn with_research(mut self, research: ResearchConfig) -> Self {
        self.research = research;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.research.retry_budget, 2);
        assert_eq!(config.research.max_redispatch_rounds, 2);
        assert_eq!(config.research.escalation_threshold, Severity::High);
        assert_eq!(config.research.verification, VerificationMode::Fetch);
        assert!(!config.research.strict_gaps);
        assert!(config.scheduler.release_stale_on_recover);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"research": {"retry_budget": 4, "verification": "fetch_and_match_version"}}"#,
        )
        .unwrap();
        assert_eq!(config.research.retry_budget, 4);
        assert_eq!(
            config.research.verification,
            VerificationMode::FetchAndMatchVersion
        );
        assert_eq!(config.research.worker_timeout_secs, 300);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_zero_budget_still_attempts_once() {
        let config = ResearchConfig::default().with_retry_budget(0);
        assert_eq!(config.attempts_per_round(), 1);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}
