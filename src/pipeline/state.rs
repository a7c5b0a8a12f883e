//! Pipeline status, transition table and per-run state

use crate::error::{Result, TrendError};
use crate::feedback::ClassificationResult;
use crate::quality::{Assessment, EvidenceBundle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Where a run is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Initialized,
    PlanningComplete,
    PlanningAccepted,
    CollectingData,
    DataSufficient,
    AnalysisComplete,
    SynthesisComplete,
    AwaitingReview,
    ReportAccepted,
    NeedsRevision,
    NeedsRecollection,
    Revising,
    Completed,
    Failed,
}

impl PipelineStatus {
    /// Declared successors. `Failed` is reachable from every non-terminal status.
    pub fn successors(self) -> &'static [PipelineStatus] {
        use PipelineStatus::*;
        match self {
            Initialized => &[PlanningComplete, Failed],
            PlanningComplete => &[PlanningAccepted, PlanningComplete, Failed],
            PlanningAccepted => &[CollectingData, Failed],
            CollectingData => &[DataSufficient, CollectingData, Failed],
            DataSufficient => &[AnalysisComplete, Failed],
            AnalysisComplete => &[SynthesisComplete, Failed],
            SynthesisComplete => &[AwaitingReview, Failed],
            AwaitingReview => &[ReportAccepted, NeedsRevision, NeedsRecollection, Failed],
            ReportAccepted => &[Completed, Failed],
            NeedsRevision => &[Revising, Completed, Failed],
            NeedsRecollection => &[CollectingData, Failed],
            Revising => &[AwaitingReview, Failed],
            Completed | Failed => &[],
        }
    }

    pub fn can_transition_to(self, next: PipelineStatus) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStatus::Completed | PipelineStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        use PipelineStatus::*;
        match self {
            Initialized => "initialized",
            PlanningComplete => "planning_complete",
            PlanningAccepted => "planning_accepted",
            CollectingData => "collecting_data",
            DataSufficient => "data_sufficient",
            AnalysisComplete => "analysis_complete",
            SynthesisComplete => "synthesis_complete",
            AwaitingReview => "awaiting_review",
            ReportAccepted => "report_accepted",
            NeedsRevision => "needs_revision",
            NeedsRecollection => "needs_recollection",
            Revising => "revising",
            Completed => "completed",
            Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum FailureReason {
    InsufficientData,
    PlanRejected,
    Cancelled,
    /// A collaborator failed during a stage
    Stage(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::InsufficientData => f.write_str("insufficient data"),
            FailureReason::PlanRejected => f.write_str("plan rejected"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Stage(message) => write!(f, "stage error: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    /// Last status before the run failed
    pub status: PipelineStatus,
    pub detail: String,
}

/// Annotation on a `Completed` run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionNote {
    MaxRevisionsReached,
}

/// Report plan agreed with the reviewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub topic: String,
    /// Section headings
    pub outline: Vec<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: PipelineStatus,
    pub to: PipelineStatus,
    pub at: DateTime<Utc>,
}

/// Everything one run knows. Owned by the orchestrator, mutated by one stage
/// at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub run_id: Uuid,
    pub topic: String,
    pub plan: Option<Plan>,
    pub keywords: Vec<String>,
    pub evidence: EvidenceBundle,
    pub sections: BTreeMap<String, String>,
    pub draft_report: Option<String>,
    pub review_feedback: Option<String>,
    pub last_classification: Option<ClassificationResult>,
    pub last_assessment: Option<Assessment>,
    /// Advisory model commentary on data sufficiency
    pub sufficiency_notes: Vec<String>,
    status: PipelineStatus,
    pub data_retry_count: u32,
    pub recollection_used: bool,
    pub revision_count: u32,
    pub plan_iterations: u32,
    pub failure: Option<Failure>,
    pub completion_note: Option<CompletionNote>,
    history: Vec<TransitionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(topic: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            topic: topic.into(),
            plan: None,
            keywords: Vec::new(),
            evidence: EvidenceBundle::new(),
            sections: BTreeMap::new(),
            draft_report: None,
            review_feedback: None,
            last_classification: None,
            last_assessment: None,
            sufficiency_notes: Vec::new(),
            status: PipelineStatus::Initialized,
            data_retry_count: 0,
            recollection_used: false,
            revision_count: 0,
            plan_iterations: 0,
            failure: None,
            completion_note: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, rejecting anything outside the transition table
    pub fn transition(&mut self, next: PipelineStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TrendError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        tracing::debug!("Run {}: {} -> {}", self.run_id, self.status, next);
        self.history.push(TransitionRecord {
            from: self.status,
            to: next,
            at: now,
        });
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// End the run in `Failed`, remembering the status it failed from.
    /// A run that is already terminal is left alone.
    pub fn fail(&mut self, reason: FailureReason, detail: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        let detail = detail.into();
        tracing::warn!(
            "Run {} failed at {}: {} {}",
            self.run_id,
            self.status,
            reason,
            detail
        );
        self.failure = Some(Failure {
            reason,
            status: self.status,
            detail,
        });
        // every non-terminal status lists Failed as a successor
        let _ = self.transition(PipelineStatus::Failed);
    }

    /// Add keywords not already present, stopping at `cap`. Returns how many
    /// were added.
    pub fn merge_keywords<I>(&mut self, keywords: I, cap: usize) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut added = 0;
        for keyword in keywords {
            if self.keywords.len() >= cap {
                break;
            }
            let keyword = keyword.trim().to_string();
            if keyword.is_empty()
                || self
                    .keywords
                    .iter()
                    .any(|k| k.eq_ignore_ascii_case(&keyword))
            {
                continue;
            }
            self.keywords.push(keyword);
            added += 1;
        }
        added
    }

    /// Terminal outcome as an error, when the run failed
    pub fn failure_error(&self) -> Option<TrendError> {
        self.failure.as_ref().map(|failure| TrendError::PipelineFailed {
            status: failure.status,
            reason: if failure.detail.is_empty() {
                failure.reason.to_string()
            } else {
                format!("{}: {}", failure.reason, failure.detail)
            },
        })
    }
}
