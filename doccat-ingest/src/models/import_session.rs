//! Session pipeline state machine
//!
//! NOT_STARTED → TRIAGING → DEDUPLICATING → EMBEDDING → CLUSTERING → NAMING
//! → READY_FOR_VALIDATION → EXTRACTING → COMPLETED
//!
//! READY_FOR_VALIDATION may loop back through RECLUSTERING → CLUSTERING, and
//! any state except COMPLETED may move to FAILED. A FAILED session is resumed
//! by an operator into the running state of the stage that failed.

use super::parameters::PipelineParameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Pipeline state of an import session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    /// Documents are being registered; no stage has run
    NotStarted,
    /// Relevance triage through the scoring collaborator
    Triaging,
    /// Content fingerprinting and duplicate grouping
    Deduplicating,
    /// Vector embedding of canonical, relevant documents
    Embedding,
    /// Similarity grouping into clusters
    Clustering,
    /// AI-assisted cluster naming
    Naming,
    /// Reviewers validate documents and clusters
    ReadyForValidation,
    /// Reclassified documents are detached before clustering again
    #[serde(rename = "RECLUSTERING")]
    ReClustering,
    /// Export of approved clusters
    Extracting,
    /// Final state
    Completed,
    /// Stage-wide failure or operator cancellation; resumable
    Failed,
}

impl PipelineState {
    pub const ALL: [PipelineState; 11] = [
        PipelineState::NotStarted,
        PipelineState::Triaging,
        PipelineState::Deduplicating,
        PipelineState::Embedding,
        PipelineState::Clustering,
        PipelineState::Naming,
        PipelineState::ReadyForValidation,
        PipelineState::ReClustering,
        PipelineState::Extracting,
        PipelineState::Completed,
        PipelineState::Failed,
    ];

    /// Wire/database name
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::NotStarted => "NOT_STARTED",
            PipelineState::Triaging => "TRIAGING",
            PipelineState::Deduplicating => "DEDUPLICATING",
            PipelineState::Embedding => "EMBEDDING",
            PipelineState::Clustering => "CLUSTERING",
            PipelineState::Naming => "NAMING",
            PipelineState::ReadyForValidation => "READY_FOR_VALIDATION",
            PipelineState::ReClustering => "RECLUSTERING",
            PipelineState::Extracting => "EXTRACTING",
            PipelineState::Completed => "COMPLETED",
            PipelineState::Failed => "FAILED",
        }
    }

    /// No transition leaves this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed)
    }

    /// Reviewer decisions are accepted in this state
    pub fn is_reviewable(&self) -> bool {
        matches!(
            self,
            PipelineState::ReadyForValidation | PipelineState::ReClustering
        )
    }

    /// Stage whose work runs while the session is in this state
    pub fn running_stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Triaging => Some(Stage::Triage),
            PipelineState::Deduplicating => Some(Stage::Deduplicate),
            PipelineState::Embedding => Some(Stage::Embed),
            PipelineState::Clustering => Some(Stage::Cluster),
            PipelineState::Naming => Some(Stage::Name),
            PipelineState::ReClustering => Some(Stage::ReCluster),
            PipelineState::Extracting => Some(Stage::Extract),
            _ => None,
        }
    }

    /// Successor entered automatically when this state's stage succeeds
    pub fn next_automatic(&self) -> Option<PipelineState> {
        match self {
            PipelineState::Triaging => Some(PipelineState::Deduplicating),
            PipelineState::Deduplicating => Some(PipelineState::Embedding),
            PipelineState::Embedding => Some(PipelineState::Clustering),
            PipelineState::Clustering => Some(PipelineState::Naming),
            PipelineState::Naming => Some(PipelineState::ReadyForValidation),
            PipelineState::ReClustering => Some(PipelineState::Clustering),
            PipelineState::Extracting => Some(PipelineState::Completed),
            _ => None,
        }
    }

    /// Whether `self → target` is an edge of the state machine
    ///
    /// `FAILED → <running state>` is only valid for the stage that failed;
    /// that extra check happens where the failed stage is known.
    pub fn can_transition_to(&self, target: PipelineState) -> bool {
        use PipelineState::*;
        match (*self, target) {
            (Completed, _) => false,
            (_, Failed) => *self != Failed,
            (NotStarted, Triaging) => true,
            (Triaging, Deduplicating) => true,
            (Deduplicating, Embedding) => true,
            (Embedding, Clustering) => true,
            (Clustering, Naming) => true,
            (Naming, ReadyForValidation) => true,
            (ReadyForValidation, ReClustering) => true,
            (ReClustering, Clustering) => true,
            (ReadyForValidation, Extracting) => true,
            (Extracting, Completed) => true,
            (Failed, target) => target.running_stage().is_some(),
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineState {
    type Err = doccat_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PipelineState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| doccat_common::Error::Internal(format!("Unknown pipeline state: {}", s)))
    }
}

/// Pipeline stage (unit of automatic work with its own statistics)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Triage,
    Deduplicate,
    Embed,
    Cluster,
    Name,
    ReCluster,
    Extract,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Triage,
        Stage::Deduplicate,
        Stage::Embed,
        Stage::Cluster,
        Stage::Name,
        Stage::ReCluster,
        Stage::Extract,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Triage => "TRIAGE",
            Stage::Deduplicate => "DEDUPLICATE",
            Stage::Embed => "EMBED",
            Stage::Cluster => "CLUSTER",
            Stage::Name => "NAME",
            Stage::ReCluster => "RE_CLUSTER",
            Stage::Extract => "EXTRACT",
        }
    }

    /// Session state while this stage runs
    pub fn running_state(&self) -> PipelineState {
        match self {
            Stage::Triage => PipelineState::Triaging,
            Stage::Deduplicate => PipelineState::Deduplicating,
            Stage::Embed => PipelineState::Embedding,
            Stage::Cluster => PipelineState::Clustering,
            Stage::Name => PipelineState::Naming,
            Stage::ReCluster => PipelineState::ReClustering,
            Stage::Extract => PipelineState::Extracting,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = doccat_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| doccat_common::Error::Internal(format!("Unknown stage: {}", s)))
    }
}

/// Import session (one row of `import_sessions`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSession {
    pub session_id: Uuid,
    /// Firm owning the resulting taxonomy
    pub firm_id: String,
    pub source_file_name: String,
    pub source_file_size: i64,
    pub state: PipelineState,
    /// Frozen at creation
    pub parameters: PipelineParameters,
    pub parameters_version: i64,
    /// Last stage that completed successfully
    pub checkpoint: Option<Stage>,
    /// Stage to resume when `state == Failed`
    pub failed_stage: Option<Stage>,
    pub last_error: Option<String>,
    /// Reviewable (canonical, batched) documents
    pub total_documents: i64,
    pub reclassification_count: i64,
    /// Reclassification count when reclustering was last triggered
    pub recluster_baseline: i64,
    pub reclustering_rounds: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ImportSession {
    /// Create a session in NOT_STARTED
    pub fn new(
        firm_id: String,
        source_file_name: String,
        source_file_size: i64,
        parameters: PipelineParameters,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            firm_id,
            source_file_name,
            source_file_size,
            state: PipelineState::NotStarted,
            parameters,
            parameters_version: super::parameters::PARAMETERS_VERSION,
            checkpoint: None,
            failed_stage: None,
            last_error: None,
            total_documents: 0,
            reclassification_count: 0,
            recluster_baseline: 0,
            reclustering_rounds: 0,
            started_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Reclassifications since the last reclustering trigger
    pub fn pending_reclassifications(&self) -> i64 {
        self.reclassification_count - self.recluster_baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn test_forward_chain_reaches_review_then_completion() {
        let mut state = Triaging;
        let mut visited = vec![state];
        while let Some(next) = state.next_automatic() {
            assert!(state.can_transition_to(next), "{} -> {}", state, next);
            state = next;
            visited.push(state);
            if state == ReadyForValidation {
                break;
            }
        }
        assert_eq!(
            visited,
            vec![Triaging, Deduplicating, Embedding, Clustering, Naming, ReadyForValidation]
        );
        assert!(ReadyForValidation.can_transition_to(Extracting));
        assert!(Extracting.can_transition_to(Completed));
    }

    #[test]
    fn test_reclustering_loop_is_the_only_backward_edge() {
        assert!(ReadyForValidation.can_transition_to(ReClustering));
        assert!(ReClustering.can_transition_to(Clustering));
        assert!(!Naming.can_transition_to(Clustering));
        assert!(!ReClustering.can_transition_to(Naming));
        assert!(!Clustering.can_transition_to(Triaging));
        assert!(!ReadyForValidation.can_transition_to(Clustering));
    }

    #[test]
    fn test_exhaustive_transition_table() {
        let allowed: Vec<(PipelineState, PipelineState)> = vec![
            (NotStarted, Triaging),
            (Triaging, Deduplicating),
            (Deduplicating, Embedding),
            (Embedding, Clustering),
            (Clustering, Naming),
            (Naming, ReadyForValidation),
            (ReadyForValidation, ReClustering),
            (ReClustering, Clustering),
            (ReadyForValidation, Extracting),
            (Extracting, Completed),
        ];

        for from in PipelineState::ALL {
            for to in PipelineState::ALL {
                let expected = if from == Completed {
                    false
                } else if to == Failed {
                    from != Failed
                } else if from == Failed {
                    to.running_stage().is_some()
                } else {
                    allowed.contains(&(from, to))
                };
                assert_eq!(from.can_transition_to(to), expected, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_completed_is_the_only_terminal_state() {
        for state in PipelineState::ALL {
            assert_eq!(state.is_terminal(), state == Completed);
        }
        assert!(!Failed.is_terminal());
    }

    #[test]
    fn test_reviewable_states() {
        let reviewable: Vec<_> = PipelineState::ALL
            .into_iter()
            .filter(|s| s.is_reviewable())
            .collect();
        assert_eq!(reviewable, vec![ReadyForValidation, ReClustering]);
    }

    #[test]
    fn test_stage_state_mapping_round_trips() {
        for stage in Stage::ALL {
            assert_eq!(stage.running_state().running_stage(), Some(stage));
        }
    }

    #[test]
    fn test_wire_names_parse_back() {
        for state in PipelineState::ALL {
            assert_eq!(state.as_str().parse::<PipelineState>().unwrap(), state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("SCANNING".parse::<PipelineState>().is_err());
    }
}
