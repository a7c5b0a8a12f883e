//! Tool-dispatch table
//!
//! Each phase declares which tools it may use. An optional selector narrows
//! that set; the toolbox executes the chosen tools with typed inputs and
//! outputs.

use super::collaborators::{DocumentSource, ReportAuthor};
use super::state::PipelineState;
use crate::chunking::RawDocument;
use crate::error::Result;
use crate::quality::{EvidenceBundle, EvidenceItem, ReferenceHit};
use crate::retrieval::HybridRetriever;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Named tools, ordered for deterministic merging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    SearchPapers,
    SearchReferences,
    SearchNews,
    ExpandKeywords,
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tool::SearchPapers => "search_papers",
            Tool::SearchReferences => "search_references",
            Tool::SearchNews => "search_news",
            Tool::ExpandKeywords => "expand_keywords",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Per-keyword searches during data collection
    Collection,
    /// Keyword expansion after an insufficient round
    Expansion,
}

impl Phase {
    pub fn eligible(self) -> &'static [Tool] {
        match self {
            Phase::Collection => &[Tool::SearchPapers, Tool::SearchReferences, Tool::SearchNews],
            Phase::Expansion => &[Tool::ExpandKeywords],
        }
    }
}

/// Picks tools for a phase, e.g. from a language model's plan
#[async_trait]
pub trait ToolSelector: Send + Sync {
    async fn select(&self, phase: Phase, eligible: &[Tool], state: &PipelineState) -> Vec<Tool>;
}

/// Tools to run for `phase`.
///
/// Picks outside `eligible` are ignored; an empty pick means all of them.
pub async fn resolve_tools(
    phase: Phase,
    eligible: &[Tool],
    selector: Option<&dyn ToolSelector>,
    state: &PipelineState,
) -> Vec<Tool> {
    let Some(selector) = selector else {
        return eligible.to_vec();
    };

    let mut picked: Vec<Tool> = selector
        .select(phase, eligible, state)
        .await
        .into_iter()
        .filter(|tool| {
            let ok = eligible.contains(tool);
            if !ok {
                warn!("Ignoring ineligible tool {} for {:?}", tool, phase);
            }
            ok
        })
        .collect();
    picked.sort();
    picked.dedup();

    if picked.is_empty() {
        eligible.to_vec()
    } else {
        picked
    }
}

/// Output of one search tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Papers(Vec<EvidenceItem>),
    References(Vec<ReferenceHit>),
    News(Vec<EvidenceItem>),
}

/// Everything the tools need to run
pub struct ToolBox {
    papers: Option<Arc<dyn DocumentSource>>,
    news: Option<Arc<dyn DocumentSource>>,
    retriever: Option<Arc<HybridRetriever>>,
    author: Arc<dyn ReportAuthor>,
    results_per_query: usize,
}

impl ToolBox {
    pub fn new(author: Arc<dyn ReportAuthor>, results_per_query: usize) -> Self {
        Self {
            papers: None,
            news: None,
            retriever: None,
            author,
            results_per_query: results_per_query.max(1),
        }
    }

    pub fn with_papers(mut self, source: Arc<dyn DocumentSource>) -> Self {
        self.papers = Some(source);
        self
    }

    pub fn with_news(mut self, source: Arc<dyn DocumentSource>) -> Self {
        self.news = Some(source);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<HybridRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn author(&self) -> &Arc<dyn ReportAuthor> {
        &self.author
    }

    /// Whether the collaborator behind a tool is wired in
    pub fn is_available(&self, tool: Tool) -> bool {
        match tool {
            Tool::SearchPapers => self.papers.is_some(),
            Tool::SearchNews => self.news.is_some(),
            Tool::SearchReferences => self.retriever.is_some(),
            Tool::ExpandKeywords => true,
        }
    }

    /// Tools of a phase whose collaborators are wired in
    pub fn eligible(&self, phase: Phase) -> Vec<Tool> {
        phase
            .eligible()
            .iter()
            .copied()
            .filter(|tool| self.is_available(*tool))
            .collect()
    }

    /// Run a search tool for one keyword
    pub async fn search(&self, tool: Tool, keyword: &str) -> Result<ToolOutput> {
        debug!("{} '{}'", tool, keyword);
        match tool {
            Tool::SearchPapers => {
                let docs = self.fetch(self.papers.as_ref(), keyword).await?;
                Ok(ToolOutput::Papers(to_items(docs, keyword)))
            }
            Tool::SearchNews => {
                let docs = self.fetch(self.news.as_ref(), keyword).await?;
                Ok(ToolOutput::News(to_items(docs, keyword)))
            }
            Tool::SearchReferences => {
                let Some(retriever) = &self.retriever else {
                    return Ok(ToolOutput::References(Vec::new()));
                };
                let candidates = match retriever.retrieve_default(keyword).await {
                    Ok(candidates) => candidates,
                    Err(crate::error::TrendError::EmptyCorpus) => Vec::new(),
                    Err(e) => return Err(e),
                };
                Ok(ToolOutput::References(
                    candidates
                        .into_iter()
                        .map(|c| ReferenceHit {
                            chunk_id: c.chunk_id,
                            source_doc_id: c.source_doc_id,
                            text: c.text,
                            fused_score: c.fused_score,
                            keyword: keyword.to_string(),
                        })
                        .collect(),
                ))
            }
            Tool::ExpandKeywords => Err(crate::error::TrendError::InvalidQuery(
                "expand_keywords is not a search tool".to_string(),
            )),
        }
    }

    /// Run the keyword expansion tool
    pub async fn expand_keywords(
        &self,
        keywords: &[String],
        evidence: &EvidenceBundle,
    ) -> Result<Vec<String>> {
        debug!("{} from {} keywords", Tool::ExpandKeywords, keywords.len());
        self.author.expand_keywords(keywords, evidence).await
    }

    async fn fetch(
        &self,
        source: Option<&Arc<dyn DocumentSource>>,
        keyword: &str,
    ) -> Result<Vec<RawDocument>> {
        match source {
            Some(source) => Ok(source.fetch(keyword, self.results_per_query).await?),
            None => Ok(Vec::new()),
        }
    }
}

fn to_items(docs: Vec<RawDocument>, keyword: &str) -> Vec<EvidenceItem> {
    docs.into_iter()
        .map(|doc| EvidenceItem {
            key: doc.metadata.url.clone().unwrap_or_else(|| doc.id.clone()),
            title: doc.metadata.title,
            text: doc.text,
            source: doc.metadata.source,
            url: doc.metadata.url,
            keyword: keyword.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<Tool>);

    #[async_trait]
    impl ToolSelector for Fixed {
        async fn select(&self, _phase: Phase, _eligible: &[Tool], _state: &PipelineState) -> Vec<Tool> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_no_selector_uses_all_eligible() {
        let state = PipelineState::new("t");
        let tools = resolve_tools(
            Phase::Collection,
            Phase::Collection.eligible(),
            None,
            &state,
        )
        .await;
        assert_eq!(tools, Phase::Collection.eligible());
    }

    #[tokio::test]
    async fn test_ineligible_picks_ignored() {
        let state = PipelineState::new("t");
        let selector = Fixed(vec![Tool::ExpandKeywords, Tool::SearchNews, Tool::SearchNews]);
        let tools = resolve_tools(
            Phase::Collection,
            Phase::Collection.eligible(),
            Some(&selector),
            &state,
        )
        .await;
        assert_eq!(tools, vec![Tool::SearchNews]);
    }

    #[tokio::test]
    async fn test_empty_pick_falls_back() {
        let state = PipelineState::new("t");
        let selector = Fixed(vec![Tool::ExpandKeywords]);
        let tools = resolve_tools(
            Phase::Collection,
            &[Tool::SearchPapers],
            Some(&selector),
            &state,
        )
        .await;
        assert_eq!(tools, vec![Tool::SearchPapers]);
    }

    #[test]
    fn test_items_keyed_by_url_then_id() {
        let mut with_url = RawDocument::new("p1", "text");
        with_url.metadata.url = Some("https://arxiv.org/abs/1".to_string());
        let items = to_items(vec![with_url, RawDocument::new("p2", "text")], "robots");

        assert_eq!(items[0].key, "https://arxiv.org/abs/1");
        assert_eq!(items[1].key, "p2");
        assert!(items.iter().all(|i| i.keyword == "robots"));
    }
}
