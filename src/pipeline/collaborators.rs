//! Narrow interfaces to the services a run depends on

use super::state::Plan;
use crate::chunking::RawDocument;
use crate::error::{Result, TrendError};
use crate::feedback::ClassificationResult;
use crate::quality::EvidenceBundle;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("{source_name} unavailable: {message}")]
    Unavailable {
        source_name: String,
        message: String,
    },

    #[error("{0} timed out")]
    Timeout(String),
}

impl From<SourceError> for TrendError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unavailable {
                source_name,
                message,
            } => TrendError::SourceUnavailable {
                source_name,
                message,
            },
            SourceError::Timeout(source_name) => TrendError::SourceUnavailable {
                source_name,
                message: "timed out".to_string(),
            },
        }
    }
}

/// Academic archive, news feed or any other searchable document source
#[async_trait]
pub trait DocumentSource: Send + Sync {
    fn name(&self) -> &str;

    /// Up to `limit` documents matching `query`, best first
    async fn fetch(&self, query: &str, limit: usize)
        -> std::result::Result<Vec<RawDocument>, SourceError>;
}

/// Text generation for plans and reports
#[async_trait]
pub trait ReportAuthor: Send + Sync {
    async fn draft_plan(&self, topic: &str) -> Result<Plan>;

    async fn refine_plan(&self, plan: &Plan, feedback: &str) -> Result<Plan>;

    /// New search keywords suggested by the evidence so far
    async fn expand_keywords(
        &self,
        keywords: &[String],
        evidence: &EvidenceBundle,
    ) -> Result<Vec<String>>;

    /// Section heading to section body
    async fn analyze(
        &self,
        plan: &Plan,
        evidence: &EvidenceBundle,
    ) -> Result<BTreeMap<String, String>>;

    async fn synthesize(
        &self,
        plan: &Plan,
        sections: &BTreeMap<String, String>,
        evidence: &EvidenceBundle,
    ) -> Result<String>;

    async fn revise(
        &self,
        draft: &str,
        feedback: &str,
        classification: &ClassificationResult,
    ) -> Result<String>;
}

/// Human review. Answers are free text and always go through the feedback
/// classifier.
#[async_trait]
pub trait ReviewChannel: Send + Sync {
    async fn review_plan(&self, plan: &Plan) -> Result<String>;

    async fn review_report(&self, draft: &str) -> Result<String>;
}
