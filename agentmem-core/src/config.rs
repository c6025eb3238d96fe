//! Configuration for the memory and skill substrate.
//!
//! All options form a closed set with conservative defaults; `validate()`
//! rejects configurations that would violate substrate invariants (weights
//! not summing to one, zero capacities).

use std::time::Duration;

use crate::error::{Error, Result};

/// Weights of the episode scoring function.
///
/// `score = w_success * success + w_importance * importance
///        + w_recency * recency + w_utility * utility`
///
/// The four weights must sum to 1.0 (within a small epsilon).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    /// Weight of the boolean success signal
    pub w_success: f64,
    /// Weight of the caller-assigned importance
    pub w_importance: f64,
    /// Weight of the exponential recency term
    pub w_recency: f64,
    /// Weight of the consolidation-derived utility term
    pub w_utility: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            w_success: 0.4,
            w_importance: 0.3,
            w_recency: 0.2,
            w_utility: 0.1,
        }
    }
}

impl ScoreWeights {
    /// Check that the weights are non-negative and sum to 1.0.
    pub fn validate(&self) -> Result<()> {
        let parts = [
            self.w_success,
            self.w_importance,
            self.w_recency,
            self.w_utility,
        ];
        if parts.iter().any(|w| *w < 0.0) {
            return Err(Error::Configuration(
                "score weights must be non-negative".to_string(),
            ));
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(Error::Configuration(format!(
                "score weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }
}

/// Per-tier TTLs applied to mirrored shared-KV entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierTtls {
    /// Working-memory steps (`agent:<agent_id>:working:<step_id>`)
    pub working: Duration,
    /// Episodic records (`memory:episodic:<memory_id>`)
    pub episodic: Duration,
    /// Semantic patterns (`memory:semantic:<memory_id>`)
    pub semantic: Duration,
    /// Skills (`memory:skill:<skill_id>` and `skill:name:<name>`)
    pub skill: Duration,
    /// Session records (`session:<session_id>`)
    pub session: Duration,
}

impl Default for TierTtls {
    fn default() -> Self {
        Self {
            working: Duration::from_secs(3600),
            episodic: Duration::from_secs(30 * 24 * 3600),
            semantic: Duration::from_secs(90 * 24 * 3600),
            skill: Duration::from_secs(180 * 24 * 3600),
            session: Duration::from_secs(3600),
        }
    }
}

/// Lock-related timeouts and thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// Default deadline for read-lock acquisition
    pub read_timeout: Duration,
    /// Default deadline for write-lock acquisition
    pub write_timeout: Duration,
    /// Default deadline for process-lock acquisition
    pub process_lock_timeout: Duration,
    /// Process locks older than this with a dead owner are reclaimed
    pub process_lock_stale_after: Duration,
    /// Waiters queued longer than this are reported by long-wait detection
    pub long_wait_threshold: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            process_lock_timeout: Duration::from_secs(60),
            process_lock_stale_after: Duration::from_secs(300),
            long_wait_threshold: Duration::from_secs(300),
        }
    }
}

/// Shared-KV connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedKvConfig {
    /// Maximum pooled connections to the shared KV
    pub pool_size: usize,
    /// Connect timeout per attempt
    pub connect_timeout: Duration,
    /// Consecutive failures before the backend is declared unhealthy
    pub unhealthy_fail_threshold: u32,
    /// Interval between health probes while unhealthy
    pub probe_interval: Duration,
}

impl Default for SharedKvConfig {
    fn default() -> Self {
        Self {
            pool_size: 50,
            connect_timeout: Duration::from_secs(5),
            unhealthy_fail_threshold: 3,
            probe_interval: Duration::from_secs(5),
        }
    }
}

/// Consolidator cadence and clustering thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsolidationConfig {
    /// Interval between consolidation runs
    pub interval: Duration,
    /// Cosine similarity above which two outcomes count as near-duplicates
    pub duplicate_threshold: f64,
    /// Minimum cluster size that produces a semantic pattern
    pub min_cluster_size: usize,
    /// Episodes sampled per run
    pub batch_size: usize,
    /// Patterns not reinforced within this window are decayed
    pub decay_window: Duration,
    /// Multiplicative confidence decay factor
    pub decay_factor: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            duplicate_threshold: 0.9,
            min_cluster_size: 2,
            batch_size: 256,
            decay_window: Duration::from_secs(60 * 24 * 3600),
            decay_factor: 0.95,
        }
    }
}

/// Main configuration for the memory and skill substrate.
///
/// # Examples
///
/// ```
/// use agentmem_core::config::MemoryConfig;
///
/// let config = MemoryConfig::default();
/// assert!(config.validate().is_ok());
///
/// let custom = MemoryConfig {
///     working_capacity: 100,
///     cache_size: 500,
///     ..MemoryConfig::default()
/// };
/// assert!(custom.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Per-session working-memory ring buffer capacity
    pub working_capacity: usize,
    /// Entries per bounded TTL cache
    pub cache_size: usize,
    /// TTL of in-process cache entries
    pub cache_ttl: Duration,
    /// Payloads at or above this size are compression candidates
    pub compression_threshold_bytes: usize,
    /// Payloads above this size are rejected outright
    pub max_payload_bytes: usize,
    /// Maximum results a single `query`/`search` call may request
    pub max_query_limit: usize,
    /// Maximum concurrent executions in `batch_execute`
    pub max_batch_concurrency: usize,
    /// Sessions idle longer than this are expired
    pub session_idle_ttl: Duration,
    /// Minimum score assigned to a successful episode on (re)scoring
    pub min_success_score: f64,
    /// Recency decay constant of the scoring function
    pub recency_tau: Duration,
    /// Confidence growth rate: `confidence = 1 - exp(-alpha * support)`
    pub confidence_alpha: f64,
    /// EWMA factor for skill average duration
    pub duration_ewma_beta: f64,
    /// Episode scoring weights
    pub score_weights: ScoreWeights,
    /// Per-tier shared-KV TTLs
    pub ttls: TierTtls,
    /// Lock timeouts and thresholds
    pub locks: LockConfig,
    /// Shared-KV connection behavior
    pub shared_kv: SharedKvConfig,
    /// Consolidator behavior
    pub consolidation: ConsolidationConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            working_capacity: 50,
            cache_size: 100,
            cache_ttl: Duration::from_secs(3600),
            compression_threshold_bytes: 1024,
            max_payload_bytes: 16 * 1024 * 1024,
            max_query_limit: 100,
            max_batch_concurrency: 10,
            session_idle_ttl: Duration::from_secs(3600),
            min_success_score: 0.4,
            recency_tau: Duration::from_secs(30 * 24 * 3600),
            confidence_alpha: 0.3,
            duration_ewma_beta: 0.2,
            score_weights: ScoreWeights::default(),
            ttls: TierTtls::default(),
            locks: LockConfig::default(),
            shared_kv: SharedKvConfig::default(),
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Validate the configuration as a whole.
    pub fn validate(&self) -> Result<()> {
        self.score_weights.validate()?;
        if self.working_capacity == 0 {
            return Err(Error::Configuration(
                "working_capacity must be at least 1".to_string(),
            ));
        }
        if self.cache_size == 0 {
            return Err(Error::Configuration(
                "cache_size must be at least 1".to_string(),
            ));
        }
        if self.max_query_limit == 0 {
            return Err(Error::Configuration(
                "max_query_limit must be at least 1".to_string(),
            ));
        }
        if self.max_batch_concurrency == 0 {
            return Err(Error::Configuration(
                "max_batch_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_payload_bytes < self.compression_threshold_bytes {
            return Err(Error::Configuration(
                "max_payload_bytes must be >= compression_threshold_bytes".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.consolidation.decay_factor) {
            return Err(Error::Configuration(
                "consolidation.decay_factor must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.duration_ewma_beta) {
            return Err(Error::Configuration(
                "duration_ewma_beta must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MemoryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_values_match_documented_defaults() {
        let config = MemoryConfig::default();
        assert_eq!(config.working_capacity, 50);
        assert_eq!(config.cache_size, 100);
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.compression_threshold_bytes, 1024);
        assert_eq!(config.max_payload_bytes, 16 * 1024 * 1024);
        assert_eq!(config.locks.read_timeout, Duration::from_secs(10));
        assert_eq!(config.locks.write_timeout, Duration::from_secs(30));
        assert_eq!(config.shared_kv.pool_size, 50);
        assert_eq!(config.shared_kv.unhealthy_fail_threshold, 3);
        assert_eq!(config.consolidation.interval, Duration::from_secs(300));
    }

    #[test]
    fn test_bad_weights_rejected() {
        let config = MemoryConfig {
            score_weights: ScoreWeights {
                w_success: 0.5,
                w_importance: 0.5,
                w_recency: 0.5,
                w_utility: 0.0,
            },
            ..MemoryConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(msg)) if msg.contains("sum to 1.0")
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = MemoryConfig {
            working_capacity: 0,
            ..MemoryConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
