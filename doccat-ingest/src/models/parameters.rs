//! Pipeline parameters
//!
//! Resolved once when a session is created (request → firm override →
//! TOML `[pipeline]` → built-in defaults) and frozen into the session row.

use doccat_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Schema version of the serialized parameters
pub const PARAMETERS_VERSION: i64 = 1;

/// Similarity grouping policy
///
/// Has no default: every firm or session must choose one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusteringPolicy {
    /// Minimum cosine similarity to a cluster centroid (0.0 - 1.0]
    pub similarity_threshold: f32,
    /// Groups smaller than this stay unclustered (Uncertain)
    pub min_cluster_size: usize,
}

/// When enough reclassifications accumulate, the session is reclustered
///
/// Either bound may be set; crossing any configured bound triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReclassifyThreshold {
    /// Absolute number of reclassifications
    #[serde(default)]
    pub count: Option<u32>,
    /// Fraction of the session's reviewable documents (0.0 - 1.0]
    #[serde(default)]
    pub fraction: Option<f64>,
}

impl ReclassifyThreshold {
    /// Number of pending reclassifications that triggers reclustering
    ///
    /// None when neither bound is configured.
    pub fn trigger_count(&self, total_documents: i64) -> Option<i64> {
        let by_count = self.count.map(|c| (c as i64).max(1));
        let by_fraction = self
            .fraction
            .filter(|_| total_documents > 0)
            .map(|f| ((f * total_documents as f64) - 1e-9).ceil().max(1.0) as i64);

        match (by_count, by_fraction) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Per-session pipeline parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineParameters {
    /// Required; see [`ClusteringPolicy`]
    #[serde(default)]
    pub clustering: Option<ClusteringPolicy>,

    /// Sample document ids kept per cluster (default: 5)
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Documents per review batch (default: 25)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent batches one reviewer may hold (default: 1)
    #[serde(default = "default_max_batches_per_reviewer")]
    pub max_batches_per_reviewer: usize,

    /// Assignment idle time before reclaim, seconds (default: 1800)
    #[serde(default = "default_idle_reclaim_secs")]
    pub idle_reclaim_secs: u64,

    #[serde(default)]
    pub reclassify_threshold: ReclassifyThreshold,

    /// Attempts per document per scoring call (default: 3)
    #[serde(default = "default_scoring_max_attempts")]
    pub scoring_max_attempts: u32,

    /// Initial retry backoff, doubled per attempt (default: 200ms)
    #[serde(default = "default_scoring_backoff_ms")]
    pub scoring_backoff_ms: u64,

    /// In-flight scoring requests per stage (default: 4)
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Consecutive per-document failures that fail the whole stage (default: 10)
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,

    /// Triage results below this confidence become Uncertain
    #[serde(default)]
    pub triage_min_confidence: Option<f32>,
}

fn default_sample_size() -> usize {
    5
}

fn default_batch_size() -> usize {
    25
}

fn default_max_batches_per_reviewer() -> usize {
    1
}

fn default_idle_reclaim_secs() -> u64 {
    1800
}

fn default_scoring_max_attempts() -> u32 {
    3
}

fn default_scoring_backoff_ms() -> u64 {
    200
}

fn default_max_concurrent_requests() -> usize {
    4
}

fn default_max_consecutive_failures() -> usize {
    10
}

impl Default for PipelineParameters {
    fn default() -> Self {
        Self {
            clustering: None,
            sample_size: default_sample_size(),
            batch_size: default_batch_size(),
            max_batches_per_reviewer: default_max_batches_per_reviewer(),
            idle_reclaim_secs: default_idle_reclaim_secs(),
            reclassify_threshold: ReclassifyThreshold::default(),
            scoring_max_attempts: default_scoring_max_attempts(),
            scoring_backoff_ms: default_scoring_backoff_ms(),
            max_concurrent_requests: default_max_concurrent_requests(),
            max_consecutive_failures: default_max_consecutive_failures(),
            triage_min_confidence: None,
        }
    }
}

/// Smallest group that may form a cluster; singletons stay Uncertain
pub const MIN_CLUSTER_SIZE: usize = 2;

impl PipelineParameters {
    /// Clustering policy, or an input error when none was configured
    pub fn clustering_policy(&self) -> Result<ClusteringPolicy> {
        self.clustering.ok_or_else(|| {
            Error::InvalidInput(
                "clustering policy (similarity_threshold, min_cluster_size) must be configured for the firm or session".to_string(),
            )
        })
    }

    /// Validate ranges before the parameters are frozen into a session
    pub fn validate(&self) -> Result<()> {
        let policy = self.clustering_policy()?;
        if !(policy.similarity_threshold > 0.0 && policy.similarity_threshold <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "similarity_threshold must be in (0, 1], got {}",
                policy.similarity_threshold
            )));
        }
        if policy.min_cluster_size < MIN_CLUSTER_SIZE {
            return Err(Error::InvalidInput(format!(
                "min_cluster_size must be at least {}, got {}",
                MIN_CLUSTER_SIZE, policy.min_cluster_size
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if self.max_batches_per_reviewer == 0 {
            return Err(Error::InvalidInput(
                "max_batches_per_reviewer must be at least 1".to_string(),
            ));
        }
        if self.scoring_max_attempts == 0 {
            return Err(Error::InvalidInput("scoring_max_attempts must be at least 1".to_string()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(Error::InvalidInput(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if let Some(fraction) = self.reclassify_threshold.fraction {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(Error::InvalidInput(format!(
                    "reclassify_threshold.fraction must be in (0, 1], got {}",
                    fraction
                )));
            }
        }
        if let Some(min) = self.triage_min_confidence {
            if !(0.0..=1.0).contains(&min) {
                return Err(Error::InvalidInput(format!(
                    "triage_min_confidence must be in [0, 1], got {}",
                    min
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_policy() -> PipelineParameters {
        PipelineParameters {
            clustering: Some(ClusteringPolicy {
                similarity_threshold: 0.8,
                min_cluster_size: 2,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_leave_clustering_unset() {
        let params = PipelineParameters::default();
        assert!(params.clustering.is_none());
        assert_eq!(params.batch_size, 25);
        assert_eq!(params.max_batches_per_reviewer, 1);
        assert_eq!(params.idle_reclaim_secs, 1800);
        assert!(matches!(params.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let params: PipelineParameters = serde_json::from_str(
            r#"{"clustering":{"similarity_threshold":0.75,"min_cluster_size":3},"batch_size":10}"#,
        )
        .unwrap();
        assert_eq!(params.batch_size, 10);
        assert_eq!(params.sample_size, 5);
        assert_eq!(params.clustering.unwrap().min_cluster_size, 3);
        params.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut params = with_policy();
        params.batch_size = 0;
        assert!(params.validate().is_err());

        let mut params = with_policy();
        params.clustering = Some(ClusteringPolicy {
            similarity_threshold: 1.5,
            min_cluster_size: 2,
        });
        assert!(params.validate().is_err());

        let mut params = with_policy();
        params.reclassify_threshold.fraction = Some(0.0);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_trigger_count_takes_the_tighter_bound() {
        let fraction_only = ReclassifyThreshold {
            count: None,
            fraction: Some(0.2),
        };
        assert_eq!(fraction_only.trigger_count(100), Some(20));
        assert_eq!(fraction_only.trigger_count(7), Some(2));
        assert_eq!(fraction_only.trigger_count(0), None);

        let both = ReclassifyThreshold {
            count: Some(5),
            fraction: Some(0.2),
        };
        assert_eq!(both.trigger_count(100), Some(5));
        assert_eq!(both.trigger_count(10), Some(2));

        assert_eq!(ReclassifyThreshold::default().trigger_count(100), None);
    }

    #[test]
    fn test_validate_rejects_singleton_clusters() {
        for min in [0, 1] {
            let mut params = with_policy();
            params.clustering = Some(ClusteringPolicy {
                similarity_threshold: 0.8,
                min_cluster_size: min,
            });
            match params.validate() {
                Err(Error::InvalidInput(msg)) => assert!(msg.contains("min_cluster_size")),
                other => panic!("expected invalid input, got {:?}", other),
            }
        }
        with_policy().validate().unwrap();
    }
}
