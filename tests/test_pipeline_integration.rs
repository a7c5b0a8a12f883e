//! Integration tests for the report pipeline: retry ceilings, recollection,
//! revision limits and cancellation, driven through scripted collaborators.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trendforge::chunking::{DocumentMetadata, RawDocument};
use trendforge::config::Config;
use trendforge::error::{Result, TrendError};
use trendforge::feedback::FeedbackClassifier;
use trendforge::llm::{LanguageModel, ModelError};
use trendforge::pipeline::{
    CompletionNote, DocumentSource, FailureReason, ModelToolSelector, Orchestrator, Plan,
    PipelineStatus, ReviewChannel, SourceError, TemplateAuthor, ToolBox,
};

/// Returns the same papers for every query
struct PaperFeed {
    papers: Vec<RawDocument>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl PaperFeed {
    fn new(count: usize) -> Self {
        let papers = (0..count)
            .map(|i| {
                RawDocument::new(
                    format!("paper-{}", i),
                    format!("Solid-state battery electrolyte study number {}", i),
                )
                .with_metadata(DocumentMetadata {
                    title: Some(format!("Electrolyte interfaces {}", i)),
                    source: "arxiv".to_string(),
                    url: Some(format!("https://arxiv.org/abs/2501.{:05}", i)),
                    published: None,
                })
            })
            .collect();
        Self {
            papers,
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl DocumentSource for PaperFeed {
    fn name(&self) -> &str {
        "papers"
    }

    async fn fetch(
        &self,
        _query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<RawDocument>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.papers.iter().take(limit).cloned().collect())
    }
}

/// Answers reviews from a queue, then repeats a fallback answer
struct ScriptedReview {
    plan_answers: Mutex<VecDeque<String>>,
    report_answers: Mutex<VecDeque<String>>,
    plan_fallback: String,
    report_fallback: String,
}

impl ScriptedReview {
    fn approving() -> Self {
        Self {
            plan_answers: Mutex::new(VecDeque::new()),
            report_answers: Mutex::new(VecDeque::new()),
            plan_fallback: String::new(),
            report_fallback: String::new(),
        }
    }

    fn reports(mut self, answers: &[&str]) -> Self {
        self.report_answers = Mutex::new(answers.iter().map(|a| a.to_string()).collect());
        self
    }

    fn report_fallback(mut self, answer: &str) -> Self {
        self.report_fallback = answer.to_string();
        self
    }

    fn plan_fallback(mut self, answer: &str) -> Self {
        self.plan_fallback = answer.to_string();
        self
    }
}

#[async_trait]
impl ReviewChannel for ScriptedReview {
    async fn review_plan(&self, _plan: &Plan) -> Result<String> {
        let next = self.plan_answers.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.plan_fallback.clone()))
    }

    async fn review_report(&self, _draft: &str) -> Result<String> {
        let next = self.report_answers.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.report_fallback.clone()))
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.quality.min_papers = 30;
    config.quality.min_distinct_sources = 1;
    config.quality.organizations.clear();
    config.pipeline.results_per_query = 100;
    config
}

fn orchestrator(config: &Config, feed: Arc<PaperFeed>, review: ScriptedReview) -> Orchestrator {
    let toolbox = ToolBox::new(
        Arc::new(TemplateAuthor::new()),
        config.pipeline.results_per_query,
    )
    .with_papers(feed);
    let classifier = FeedbackClassifier::new(None, config.feedback.clone(), 1);
    Orchestrator::new(config, Arc::new(toolbox), Arc::new(review), classifier).unwrap()
}

fn visits(outcome: &trendforge::pipeline::RunOutcome, status: PipelineStatus) -> usize {
    outcome
        .state
        .history()
        .iter()
        .filter(|record| record.to == status)
        .count()
}

#[tokio::test]
async fn test_insufficient_data_fails_after_max_attempts() {
    let config = test_config();
    let feed = Arc::new(PaperFeed::new(25));
    let orch = orchestrator(&config, Arc::clone(&feed), ScriptedReview::approving());

    let outcome = orch
        .run("solid-state batteries", &CancellationToken::new())
        .await;

    assert_eq!(outcome.status(), PipelineStatus::Failed);
    let failure = outcome.state.failure.clone().unwrap();
    assert_eq!(failure.reason, FailureReason::InsufficientData);
    assert_eq!(failure.status, PipelineStatus::CollectingData);
    assert!(failure.detail.contains("papers: 25 < 30 required"));
    assert!(failure.detail.ends_with("after 3 attempts"));

    assert_eq!(outcome.state.evidence.attempt_count, 3);
    assert_eq!(outcome.state.data_retry_count, 3);
    assert_eq!(outcome.state.evidence.papers.len(), 25);
    assert!(outcome.state.draft_report.is_none());

    println!("✓ Failed after {} fetches", feed.calls.load(Ordering::SeqCst));

    let err = outcome.into_result().unwrap_err();
    assert!(matches!(err, TrendError::PipelineFailed { .. }));
}

#[tokio::test]
async fn test_sufficient_data_completes_with_report() {
    let config = test_config();
    let feed = Arc::new(PaperFeed::new(30));
    let orch = orchestrator(&config, feed, ScriptedReview::approving());

    let outcome = orch
        .run("solid-state batteries", &CancellationToken::new())
        .await;

    assert!(outcome.is_completed());
    assert_eq!(outcome.state.evidence.attempt_count, 1);
    assert_eq!(outcome.state.data_retry_count, 0);
    assert!(outcome.state.completion_note.is_none());

    let report = outcome.state.draft_report.clone().unwrap();
    assert!(report.starts_with("# solid-state batteries"));
    assert!(report.contains("## References"));

    let state = outcome.into_result().unwrap();
    assert_eq!(state.status(), PipelineStatus::Completed);
}

#[tokio::test]
async fn test_second_recollection_becomes_revision() {
    let config = test_config();
    let feed = Arc::new(PaperFeed::new(30));
    let review = ScriptedReview::approving().reports(&[
        "We need more data on \"sulfide electrolytes\"",
        "Still not enough data here",
        "ok",
    ]);
    let orch = orchestrator(&config, feed, review);

    let outcome = orch.run("solid-state batteries", &CancellationToken::new()).await;

    assert!(outcome.is_completed());
    assert!(outcome.state.recollection_used);
    assert_eq!(visits(&outcome, PipelineStatus::NeedsRecollection), 1);
    assert_eq!(visits(&outcome, PipelineStatus::NeedsRevision), 1);
    assert_eq!(outcome.state.revision_count, 1);
    assert_eq!(outcome.state.evidence.attempt_count, 2);
    assert!(outcome
        .state
        .keywords
        .iter()
        .any(|k| k == "sulfide electrolytes"));

    let report = outcome.state.draft_report.unwrap();
    assert!(report.contains("> Revision (major): Still not enough data here"));
}

#[tokio::test]
async fn test_revision_ceiling_completes_run() {
    let mut config = test_config();
    config.pipeline.max_revisions = 2;
    let feed = Arc::new(PaperFeed::new(30));
    let review = ScriptedReview::approving().report_fallback("Tighten the outlook section");
    let orch = orchestrator(&config, feed, review);

    let outcome = orch.run("solid-state batteries", &CancellationToken::new()).await;

    assert!(outcome.is_completed());
    assert_eq!(
        outcome.state.completion_note,
        Some(CompletionNote::MaxRevisionsReached)
    );
    assert_eq!(outcome.state.revision_count, 3);
    assert_eq!(visits(&outcome, PipelineStatus::Revising), 2);
    assert!(outcome.state.failure.is_none());
}

#[tokio::test]
async fn test_plan_rejection_ceiling_fails_run() {
    let mut config = test_config();
    config.pipeline.max_plan_iterations = 2;
    let feed = Arc::new(PaperFeed::new(30));
    let review = ScriptedReview::approving().plan_fallback("Add a section on \"sodium-ion\"");
    let orch = orchestrator(&config, Arc::clone(&feed), review);

    let outcome = orch.run("solid-state batteries", &CancellationToken::new()).await;

    assert_eq!(outcome.status(), PipelineStatus::Failed);
    let failure = outcome.state.failure.clone().unwrap();
    assert_eq!(failure.reason, FailureReason::PlanRejected);
    assert_eq!(failure.status, PipelineStatus::PlanningComplete);
    assert_eq!(outcome.state.plan_iterations, 2);
    assert_eq!(feed.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancellation_stops_collection_round() {
    let config = test_config();
    let feed = Arc::new(PaperFeed::new(30).slow(Duration::from_secs(20)));
    let orch = orchestrator(&config, feed, ScriptedReview::approving());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let outcome = orch.run("solid-state batteries", &cancel).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.status(), PipelineStatus::Failed);
    let failure = outcome.state.failure.clone().unwrap();
    assert_eq!(failure.reason, FailureReason::Cancelled);
    assert_eq!(failure.status, PipelineStatus::CollectingData);
    assert_eq!(outcome.state.evidence.attempt_count, 0);
    assert!(outcome.state.evidence.papers.is_empty());
}

/// Always answers with the same text
struct FixedAnswer(&'static str);

#[async_trait]
impl LanguageModel for FixedAnswer {
    async fn call(&self, _prompt: &str) -> std::result::Result<String, ModelError> {
        Ok(self.0.to_string())
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

#[tokio::test]
async fn test_model_selector_narrows_collection_tools() {
    let config = test_config();
    let papers = Arc::new(PaperFeed::new(30));
    let news = Arc::new(PaperFeed::new(5));
    let toolbox = ToolBox::new(
        Arc::new(TemplateAuthor::new()),
        config.pipeline.results_per_query,
    )
    .with_papers(Arc::clone(&papers) as Arc<dyn DocumentSource>)
    .with_news(Arc::clone(&news) as Arc<dyn DocumentSource>);
    let classifier = FeedbackClassifier::new(None, config.feedback.clone(), 1);
    let selector = ModelToolSelector::new(
        Arc::new(FixedAnswer("{\"tools\": [\"search_papers\"]}")),
        1,
    );
    let orch = Orchestrator::new(
        &config,
        Arc::new(toolbox),
        Arc::new(ScriptedReview::approving()),
        classifier,
    )
    .unwrap()
    .with_selector(Arc::new(selector));

    let outcome = orch.run("solid-state batteries", &CancellationToken::new()).await;

    assert!(outcome.is_completed());
    assert!(papers.calls.load(Ordering::SeqCst) > 0);
    assert_eq!(news.calls.load(Ordering::SeqCst), 0);
    assert!(outcome.state.evidence.news_items.is_empty());
}
