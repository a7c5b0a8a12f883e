//! Parallel evidence collection
//!
//! One round fans every (tool, keyword) pair out to a bounded set of tasks.
//! Results are merged in (tool, keyword) order once all tasks finish, so the
//! order of completion never changes the evidence a round produces.

use super::tools::{Tool, ToolBox, ToolOutput};
use crate::config::PipelineConfig;
use crate::quality::EvidenceBatch;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSettings {
    /// Concurrent tool calls
    pub max_parallel: usize,
    /// Per-call deadline
    pub query_timeout: Duration,
}

impl CollectionSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_parallel: config.max_parallel_queries.max(1),
            query_timeout: Duration::from_secs(config.query_timeout_secs.max(1)),
        }
    }
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            query_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    Completed {
        batch: EvidenceBatch,
        /// Calls that errored or timed out
        failed_queries: usize,
    },
    Cancelled,
}

/// Run every tool for every keyword.
///
/// A failed or timed-out call contributes nothing and the round goes on.
/// Cancellation aborts the outstanding calls.
pub async fn collect_round(
    toolbox: Arc<ToolBox>,
    tools: &[Tool],
    keywords: &[String],
    settings: CollectionSettings,
    cancel: &CancellationToken,
) -> RoundOutcome {
    let semaphore = Arc::new(Semaphore::new(settings.max_parallel.max(1)));
    let mut tasks = JoinSet::new();

    for (tool_idx, tool) in tools.iter().copied().enumerate() {
        for (kw_idx, keyword) in keywords.iter().enumerate() {
            let toolbox = Arc::clone(&toolbox);
            let semaphore = Arc::clone(&semaphore);
            let keyword = keyword.clone();
            let deadline = settings.query_timeout;

            tasks.spawn(async move {
                let slot = (tool_idx, kw_idx);
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (slot, None);
                };
                match tokio::time::timeout(deadline, toolbox.search(tool, &keyword)).await {
                    Ok(Ok(output)) => (slot, Some(output)),
                    Ok(Err(e)) => {
                        warn!("{} '{}' failed: {}", tool, keyword, e);
                        (slot, None)
                    }
                    Err(_) => {
                        warn!("{} '{}' timed out after {:?}", tool, keyword, deadline);
                        (slot, None)
                    }
                }
            });
        }
    }

    let mut results = Vec::with_capacity(tasks.len());
    let mut failed_queries = 0;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tasks.abort_all();
                debug!("Collection round cancelled");
                return RoundOutcome::Cancelled;
            }
            joined = tasks.join_next() => match joined {
                Some(Ok(result)) => results.push(result),
                Some(Err(e)) => {
                    warn!("Collection task panicked: {}", e);
                    failed_queries += 1;
                }
                None => break,
            },
        }
    }

    results.sort_by_key(|(slot, _)| *slot);

    let mut batch = EvidenceBatch::default();
    for (_, output) in results {
        match output {
            Some(ToolOutput::Papers(mut items)) => {
                items.sort_by(|a, b| a.key.cmp(&b.key));
                batch.papers.extend(items);
            }
            Some(ToolOutput::News(mut items)) => {
                items.sort_by(|a, b| a.key.cmp(&b.key));
                batch.news_items.extend(items);
            }
            Some(ToolOutput::References(hits)) => batch.reference_hits.extend(hits),
            None => failed_queries += 1,
        }
    }

    debug!(
        "Round collected {} papers, {} references, {} news ({} failed calls)",
        batch.papers.len(),
        batch.reference_hits.len(),
        batch.news_items.len(),
        failed_queries
    );

    RoundOutcome::Completed {
        batch,
        failed_queries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::RawDocument;
    use crate::pipeline::{DocumentSource, SourceError, TemplateAuthor};
    use async_trait::async_trait;

    /// Answers `<query>-1`, slower for earlier keywords
    struct Staggered;

    #[async_trait]
    impl DocumentSource for Staggered {
        fn name(&self) -> &str {
            "staggered"
        }

        async fn fetch(&self, query: &str, _limit: usize) -> Result<Vec<RawDocument>, SourceError> {
            let delay = match query {
                "a" => 40,
                "b" => 20,
                "slow" => 5_000,
                _ => 0,
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if query == "bad" {
                return Err(SourceError::Unavailable {
                    source_name: "staggered".to_string(),
                    message: "503".to_string(),
                });
            }
            Ok(vec![RawDocument::new(format!("{}-1", query), "text")])
        }
    }

    fn toolbox() -> Arc<ToolBox> {
        Arc::new(ToolBox::new(Arc::new(TemplateAuthor::new()), 5).with_papers(Arc::new(Staggered)))
    }

    fn keywords(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[tokio::test]
    async fn test_merge_follows_keyword_order() {
        let outcome = collect_round(
            toolbox(),
            &[Tool::SearchPapers],
            &keywords(&["a", "b", "c"]),
            CollectionSettings::default(),
            &CancellationToken::new(),
        )
        .await;

        let RoundOutcome::Completed {
            batch,
            failed_queries,
        } = outcome
        else {
            panic!("round was cancelled");
        };
        let keys: Vec<&str> = batch.papers.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["a-1", "b-1", "c-1"]);
        assert_eq!(failed_queries, 0);
    }

    #[tokio::test]
    async fn test_failures_and_timeouts_are_counted() {
        let settings = CollectionSettings {
            max_parallel: 2,
            query_timeout: Duration::from_millis(200),
        };
        let outcome = collect_round(
            toolbox(),
            &[Tool::SearchPapers],
            &keywords(&["ok", "bad", "slow"]),
            settings,
            &CancellationToken::new(),
        )
        .await;

        let RoundOutcome::Completed {
            batch,
            failed_queries,
        } = outcome
        else {
            panic!("round was cancelled");
        };
        assert_eq!(batch.papers.len(), 1);
        assert_eq!(batch.papers[0].key, "ok-1");
        assert_eq!(failed_queries, 2);
    }

    #[tokio::test]
    async fn test_cancelled_round_returns_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = collect_round(
            toolbox(),
            &[Tool::SearchPapers],
            &keywords(&["slow"]),
            CollectionSettings::default(),
            &cancel,
        )
        .await;
        assert_eq!(outcome, RoundOutcome::Cancelled);
    }
}
