//! Run controller
//!
//! Drives one [`PipelineState`] from `Initialized` to a terminal status. Every
//! retry ceiling (plan reviews, data retries, revisions, the single
//! recollection) is counted and enforced here; collaborators never loop.

use super::collaborators::ReviewChannel;
use super::collection::{collect_round, CollectionSettings, RoundOutcome};
use super::state::{CompletionNote, FailureReason, PipelineState, PipelineStatus};
use super::tools::{resolve_tools, Phase, Tool, ToolBox, ToolSelector};
use crate::config::{Config, PipelineConfig};
use crate::error::{Result, TrendError};
use crate::feedback::{ClassificationResult, FeedbackAction, FeedbackClassifier, Severity};
use crate::llm::{call_with_retry, LanguageModel};
use crate::quality::{Assessment, QualityGate, QualityThresholds};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Terminal state of a run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: PipelineState,
}

impl RunOutcome {
    pub fn status(&self) -> PipelineStatus {
        self.state.status()
    }

    pub fn is_completed(&self) -> bool {
        self.state.status() == PipelineStatus::Completed
    }

    /// The final report, or the failure with its last status and reason
    pub fn into_result(self) -> Result<PipelineState> {
        match self.state.failure_error() {
            Some(err) => Err(err),
            None => Ok(self.state),
        }
    }
}

enum StepError {
    Cancelled,
    Failed(FailureReason, String),
    Error(TrendError),
}

impl From<TrendError> for StepError {
    fn from(err: TrendError) -> Self {
        StepError::Error(err)
    }
}

type Step = std::result::Result<(), StepError>;

/// Await `fut` unless the run is cancelled first
async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> std::result::Result<T, StepError>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        result = fut => result.map_err(StepError::from),
    }
}

pub struct Orchestrator {
    toolbox: Arc<ToolBox>,
    review: Arc<dyn ReviewChannel>,
    classifier: FeedbackClassifier,
    gate: QualityGate,
    limits: PipelineConfig,
    collection: CollectionSettings,
    selector: Option<Arc<dyn ToolSelector>>,
    advisor: Option<Arc<dyn LanguageModel>>,
    advisor_attempts: u32,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        toolbox: Arc<ToolBox>,
        review: Arc<dyn ReviewChannel>,
        classifier: FeedbackClassifier,
    ) -> Result<Self> {
        if config.pipeline.max_data_retries == 0 || config.pipeline.max_plan_iterations == 0 {
            return Err(TrendError::InvalidConfig(
                "max_data_retries and max_plan_iterations must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            toolbox,
            review,
            classifier,
            gate: QualityGate::new(QualityThresholds::from(&config.quality))?,
            limits: config.pipeline.clone(),
            collection: CollectionSettings::from_config(&config.pipeline),
            selector: None,
            advisor: None,
            advisor_attempts: config.llm.max_attempts,
        })
    }

    /// Let an external collaborator choose among the eligible tools
    pub fn with_selector(mut self, selector: Arc<dyn ToolSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Ask a model for a narrative sufficiency opinion after each round.
    /// The numeric gate still decides.
    pub fn with_advisor(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.advisor = Some(model);
        self
    }

    /// Start a fresh run for `topic` and drive it to completion or failure
    pub async fn run(&self, topic: &str, cancel: &CancellationToken) -> RunOutcome {
        let mut state = PipelineState::new(topic);
        info!("Run {} started: '{}'", state.run_id, topic);
        self.drive(&mut state, cancel).await;

        match &state.failure {
            Some(failure) => info!(
                "Run {} failed at {}: {}",
                state.run_id, failure.status, failure.reason
            ),
            None => info!(
                "Run {} completed after {} revisions",
                state.run_id, state.revision_count
            ),
        }
        RunOutcome { state }
    }

    /// Step `state` until it is terminal
    pub async fn drive(&self, state: &mut PipelineState, cancel: &CancellationToken) {
        while !state.is_terminal() {
            if cancel.is_cancelled() {
                state.fail(FailureReason::Cancelled, "");
                break;
            }

            let status = state.status();
            match self.step(state, cancel).await {
                Ok(()) => {}
                Err(StepError::Cancelled) => state.fail(FailureReason::Cancelled, ""),
                Err(StepError::Failed(reason, detail)) => state.fail(reason, detail),
                Err(StepError::Error(e)) => {
                    state.fail(FailureReason::Stage(status.to_string()), e.to_string())
                }
            }
        }
    }

    async fn step(&self, state: &mut PipelineState, cancel: &CancellationToken) -> Step {
        use PipelineStatus::*;
        match state.status() {
            Initialized => self.draft_plan(state, cancel).await,
            PlanningComplete => self.review_plan(state, cancel).await,
            PlanningAccepted => {
                if state.keywords.is_empty() {
                    let topic = state.topic.clone();
                    state.merge_keywords([topic], self.limits.max_keywords);
                }
                Ok(state.transition(CollectingData)?)
            }
            CollectingData => self.collect(state, cancel).await,
            DataSufficient => self.analyze(state, cancel).await,
            AnalysisComplete => self.synthesize(state, cancel).await,
            SynthesisComplete => Ok(state.transition(AwaitingReview)?),
            AwaitingReview => self.review_report(state, cancel).await,
            ReportAccepted => Ok(state.transition(Completed)?),
            NeedsRevision => {
                state.revision_count += 1;
                if state.revision_count > self.limits.max_revisions {
                    info!(
                        "Run {} hit {} revisions, completing as is",
                        state.run_id, self.limits.max_revisions
                    );
                    state.completion_note = Some(CompletionNote::MaxRevisionsReached);
                    Ok(state.transition(Completed)?)
                } else {
                    Ok(state.transition(Revising)?)
                }
            }
            NeedsRecollection => {
                state.recollection_used = true;
                state.data_retry_count = 0;
                let keywords = state
                    .last_classification
                    .as_ref()
                    .map(|c| c.extracted_keywords.clone())
                    .unwrap_or_default();
                let added = state.merge_keywords(keywords, self.limits.max_keywords);
                debug!("Recollection with {} new keywords", added);
                Ok(state.transition(CollectingData)?)
            }
            Revising => self.revise(state, cancel).await,
            Completed | Failed => Ok(()),
        }
    }

    async fn draft_plan(&self, state: &mut PipelineState, cancel: &CancellationToken) -> Step {
        let author = self.toolbox.author();
        let plan = guarded(cancel, author.draft_plan(&state.topic)).await?;
        state.keywords.clear();
        state.merge_keywords(plan.keywords.iter().cloned(), self.limits.max_keywords);
        state.plan = Some(plan);
        Ok(state.transition(PipelineStatus::PlanningComplete)?)
    }

    async fn review_plan(&self, state: &mut PipelineState, cancel: &CancellationToken) -> Step {
        let plan = state
            .plan
            .clone()
            .ok_or_else(|| TrendError::Other(anyhow::anyhow!("no plan to review")))?;

        let feedback = guarded(cancel, self.review.review_plan(&plan)).await?;
        let classification = self.classify(&feedback, cancel).await?;
        state.plan_iterations += 1;
        state.review_feedback = Some(feedback.clone());
        state.last_classification = Some(classification.clone());

        if classification.is_approved() {
            return Ok(state.transition(PipelineStatus::PlanningAccepted)?);
        }

        if state.plan_iterations >= self.limits.max_plan_iterations {
            return Err(StepError::Failed(
                FailureReason::PlanRejected,
                format!("plan not accepted after {} reviews", state.plan_iterations),
            ));
        }

        let author = self.toolbox.author();
        let refined = guarded(cancel, author.refine_plan(&plan, &feedback)).await?;
        state.keywords.clear();
        state.merge_keywords(
            refined
                .keywords
                .iter()
                .cloned()
                .chain(classification.extracted_keywords.iter().cloned()),
            self.limits.max_keywords,
        );
        state.plan = Some(refined);
        Ok(state.transition(PipelineStatus::PlanningComplete)?)
    }

    async fn collect(&self, state: &mut PipelineState, cancel: &CancellationToken) -> Step {
        let eligible = self.toolbox.eligible(Phase::Collection);
        let tools = self.choose_tools(Phase::Collection, &eligible, state, cancel).await?;

        let outcome = collect_round(
            Arc::clone(&self.toolbox),
            &tools,
            &state.keywords,
            self.collection,
            cancel,
        )
        .await;

        // Nothing is applied to the state until the round has fully finished
        let RoundOutcome::Completed {
            batch,
            failed_queries,
        } = outcome
        else {
            return Err(StepError::Cancelled);
        };

        let merged = state.evidence.merge(batch);
        state.evidence.attempt_count += 1;
        let assessment = self.gate.assess(&state.evidence);
        info!(
            "Collection attempt {}: +{} papers, +{} references, +{} news, {} failed queries, sufficient={}",
            state.evidence.attempt_count,
            merged.papers,
            merged.reference_hits,
            merged.news_items,
            failed_queries,
            assessment.sufficient
        );
        self.advise(state, &assessment, cancel).await;
        let sufficient = assessment.sufficient;
        let reasons = assessment.reasons.join("; ");
        state.last_assessment = Some(assessment);

        if sufficient {
            return Ok(state.transition(PipelineStatus::DataSufficient)?);
        }

        state.data_retry_count += 1;
        if state.data_retry_count >= self.limits.max_data_retries {
            return Err(StepError::Failed(
                FailureReason::InsufficientData,
                format!(
                    "{} after {} attempts",
                    reasons, state.evidence.attempt_count
                ),
            ));
        }

        self.expand_keywords(state, cancel).await?;
        Ok(state.transition(PipelineStatus::CollectingData)?)
    }

    /// Best effort: a failed expansion retries with the same keywords
    async fn expand_keywords(&self, state: &mut PipelineState, cancel: &CancellationToken) -> Step {
        let eligible = self.toolbox.eligible(Phase::Expansion);
        let tools = self.choose_tools(Phase::Expansion, &eligible, state, cancel).await?;
        if !tools.contains(&Tool::ExpandKeywords) {
            return Ok(());
        }

        let expansion = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
            result = self.toolbox.expand_keywords(&state.keywords, &state.evidence) => result,
        };

        match expansion {
            Ok(keywords) => {
                let added = state.merge_keywords(keywords, self.limits.max_keywords);
                debug!("Expanded keyword set by {} to {}", added, state.keywords.len());
            }
            Err(e) => warn!("Keyword expansion failed, retrying with current keywords: {}", e),
        }
        Ok(())
    }

    async fn choose_tools(
        &self,
        phase: Phase,
        eligible: &[Tool],
        state: &PipelineState,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<Tool>, StepError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            tools = resolve_tools(phase, eligible, self.selector.as_deref(), state) => Ok(tools),
        }
    }

    async fn advise(
        &self,
        state: &mut PipelineState,
        assessment: &Assessment,
        cancel: &CancellationToken,
    ) {
        let Some(model) = &self.advisor else {
            return;
        };

        let m = &assessment.metrics;
        let prompt = format!(
            "Topic: {}\nPapers: {}\nReference passages: {}\nNews items: {}\nDistinct sources: {}\n\
             Organization mention ratio: {:.2}\n\n\
             In two sentences, is this evidence enough for a technology trend report, and what is missing?",
            state.topic, m.papers, m.reference_hits, m.news_items, m.distinct_sources, m.company_ratio
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            answer = call_with_retry(model.as_ref(), &prompt, self.advisor_attempts) => match answer {
                Ok(note) if !note.trim().is_empty() => {
                    state.sufficiency_notes.push(note.trim().to_string())
                }
                Ok(_) => {}
                Err(e) => debug!("Sufficiency advice unavailable: {}", e),
            },
        }
    }

    async fn analyze(&self, state: &mut PipelineState, cancel: &CancellationToken) -> Step {
        let plan = state
            .plan
            .clone()
            .ok_or_else(|| TrendError::Other(anyhow::anyhow!("no plan to analyze against")))?;
        let author = self.toolbox.author();
        state.sections = guarded(cancel, author.analyze(&plan, &state.evidence)).await?;
        Ok(state.transition(PipelineStatus::AnalysisComplete)?)
    }

    async fn synthesize(&self, state: &mut PipelineState, cancel: &CancellationToken) -> Step {
        let plan = state
            .plan
            .clone()
            .ok_or_else(|| TrendError::Other(anyhow::anyhow!("no plan to synthesize")))?;
        let author = self.toolbox.author();
        let draft = guarded(
            cancel,
            author.synthesize(&plan, &state.sections, &state.evidence),
        )
        .await?;
        state.draft_report = Some(draft);
        Ok(state.transition(PipelineStatus::SynthesisComplete)?)
    }

    async fn review_report(&self, state: &mut PipelineState, cancel: &CancellationToken) -> Step {
        let draft = state.draft_report.clone().unwrap_or_default();
        let feedback = guarded(cancel, self.review.review_report(&draft)).await?;
        let mut classification = self.classify(&feedback, cancel).await?;

        if classification.action == FeedbackAction::Recollection && state.recollection_used {
            info!("Recollection already used in run {}, revising instead", state.run_id);
            classification = ClassificationResult {
                action: FeedbackAction::Revision,
                severity: Some(Severity::Major),
                ..classification
            };
        }

        let next = match classification.action {
            FeedbackAction::Approved => PipelineStatus::ReportAccepted,
            FeedbackAction::Revision => PipelineStatus::NeedsRevision,
            FeedbackAction::Recollection => PipelineStatus::NeedsRecollection,
        };
        state.review_feedback = Some(feedback);
        state.last_classification = Some(classification);
        Ok(state.transition(next)?)
    }

    async fn revise(&self, state: &mut PipelineState, cancel: &CancellationToken) -> Step {
        let draft = state.draft_report.clone().unwrap_or_default();
        let feedback = state.review_feedback.clone().unwrap_or_default();
        let classification = state
            .last_classification
            .clone()
            .unwrap_or_else(ClassificationResult::fallback);

        let author = self.toolbox.author();
        let revised = guarded(cancel, author.revise(&draft, &feedback, &classification)).await?;
        state.draft_report = Some(revised);
        Ok(state.transition(PipelineStatus::AwaitingReview)?)
    }

    async fn classify(
        &self,
        feedback: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<ClassificationResult, StepError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            result = self.classifier.classify(feedback) => Ok(result),
        }
    }
}
