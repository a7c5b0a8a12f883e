//! Collaborators that work without network or model access
//!
//! `TemplateAuthor` writes plans and reports from fixed templates and the
//! collected evidence. `JsonlSource` serves documents from a JSON-lines file
//! through a BM25 index. Together they make a run fully reproducible.

use super::collaborators::{DocumentSource, ReportAuthor, SourceError};
use super::state::Plan;
use crate::chunking::{Chunk, ChunkId, RawDocument};
use crate::embedding::{Bm25Params, KeywordIndex, Tokenizer};
use crate::error::{Result, TrendError};
use crate::feedback::{quoted_phrases, ClassificationResult, FeedbackAction, Severity};
use crate::quality::{EvidenceBundle, EvidenceItem};
use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

const OUTLINE: [&str; 4] = [
    "Overview",
    "Research Directions",
    "Industry Activity",
    "Outlook",
];

/// New keywords suggested per expansion
const EXPANSION_SIZE: usize = 5;

/// Deterministic report author
pub struct TemplateAuthor {
    tokenizer: Tokenizer,
}

impl TemplateAuthor {
    pub fn new() -> Self {
        Self {
            tokenizer: Tokenizer::new(true),
        }
    }

    fn topic_keywords(&self, topic: &str) -> Vec<String> {
        let mut keywords = vec![topic.trim().to_string()];
        for token in self.tokenizer.tokenize(topic) {
            if token.chars().count() > 2 && !keywords.contains(&token) {
                keywords.push(token);
            }
        }
        keywords
    }
}

impl Default for TemplateAuthor {
    fn default() -> Self {
        Self::new()
    }
}

/// Phrases after a `keywords:` label, comma separated
fn labelled_keywords(feedback: &str) -> Vec<String> {
    feedback
        .lines()
        .filter_map(|line| {
            let lower = line.to_lowercase();
            let at = lower.find("keywords:")?;
            line.get(at + "keywords:".len()..).map(str::to_string)
        })
        .flat_map(|rest| {
            rest.split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect::<Vec<_>>()
        })
        .collect()
}

fn item_line(item: &EvidenceItem) -> String {
    let title = item.title.as_deref().unwrap_or(&item.key);
    if item.source.is_empty() {
        format!("- {}", title)
    } else {
        format!("- {} ({})", title, item.source)
    }
}

#[async_trait]
impl ReportAuthor for TemplateAuthor {
    async fn draft_plan(&self, topic: &str) -> Result<Plan> {
        if topic.trim().is_empty() {
            return Err(TrendError::InvalidQuery("topic is empty".to_string()));
        }
        Ok(Plan {
            topic: topic.trim().to_string(),
            outline: OUTLINE.iter().map(|s| s.to_string()).collect(),
            keywords: self.topic_keywords(topic),
        })
    }

    async fn refine_plan(&self, plan: &Plan, feedback: &str) -> Result<Plan> {
        let mut refined = plan.clone();
        for keyword in quoted_phrases(feedback)
            .into_iter()
            .chain(labelled_keywords(feedback))
        {
            if !refined
                .keywords
                .iter()
                .any(|k| k.eq_ignore_ascii_case(&keyword))
            {
                refined.keywords.push(keyword);
            }
        }
        Ok(refined)
    }

    async fn expand_keywords(
        &self,
        keywords: &[String],
        evidence: &EvidenceBundle,
    ) -> Result<Vec<String>> {
        let known: AHashSet<String> = keywords
            .iter()
            .flat_map(|k| self.tokenizer.tokenize(k))
            .collect();

        let mut counts: AHashMap<String, usize> = AHashMap::new();
        let titles = evidence
            .papers
            .iter()
            .chain(evidence.news_items.iter())
            .filter_map(|item| item.title.as_deref());
        for title in titles {
            let unique: AHashSet<String> = self.tokenizer.tokenize(title).into_iter().collect();
            for token in unique {
                if token.chars().count() >= 4 && !known.contains(&token) {
                    *counts.entry(token).or_insert(0) += 1;
                }
            }
        }

        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(ranked
            .into_iter()
            .take(EXPANSION_SIZE)
            .map(|(term, _)| term)
            .collect())
    }

    async fn analyze(
        &self,
        plan: &Plan,
        evidence: &EvidenceBundle,
    ) -> Result<BTreeMap<String, String>> {
        let headings = if plan.outline.is_empty() {
            vec![OUTLINE[0].to_string()]
        } else {
            plan.outline.clone()
        };

        let mut lines: Vec<Vec<String>> = vec![Vec::new(); headings.len()];
        let items = evidence
            .papers
            .iter()
            .chain(evidence.news_items.iter())
            .map(item_line)
            .chain(evidence.reference_hits.iter().map(|hit| {
                format!("- [{}] {}", hit.chunk_id, preview(&hit.text, 120))
            }));
        for (i, line) in items.enumerate() {
            lines[i % headings.len()].push(line);
        }

        Ok(headings
            .into_iter()
            .zip(lines)
            .enumerate()
            .map(|(i, (heading, body))| {
                let body = if body.is_empty() {
                    "No evidence was collected for this section.".to_string()
                } else {
                    body.join("\n")
                };
                (format!("{:02} {}", i + 1, heading), body)
            })
            .collect())
    }

    async fn synthesize(
        &self,
        plan: &Plan,
        sections: &BTreeMap<String, String>,
        evidence: &EvidenceBundle,
    ) -> Result<String> {
        let mut report = format!("# {}: technology trends\n", plan.topic);
        for (key, body) in sections {
            // keys carry a two-digit ordering prefix
            let heading = key.split_once(' ').map(|(_, h)| h).unwrap_or(key);
            report.push_str(&format!("\n## {}\n\n{}\n", heading, body));
        }

        let cited: Vec<&EvidenceItem> = evidence
            .papers
            .iter()
            .filter(|p| p.url.is_some())
            .collect();
        if !cited.is_empty() {
            report.push_str("\n## References\n\n");
            for (i, paper) in cited.iter().enumerate() {
                let title = paper.title.as_deref().unwrap_or(&paper.key);
                let url = paper.url.as_deref().unwrap_or_default();
                report.push_str(&format!("{}. {} <{}>\n", i + 1, title, url));
            }
        }
        Ok(report)
    }

    async fn revise(
        &self,
        draft: &str,
        feedback: &str,
        classification: &ClassificationResult,
    ) -> Result<String> {
        let severity = match (classification.action, classification.severity) {
            (FeedbackAction::Revision, Some(Severity::Major)) => "major",
            _ => "minor",
        };
        Ok(format!(
            "{}\n\n> Revision ({}): {}\n",
            draft.trim_end(),
            severity,
            feedback.trim()
        ))
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// Read a JSON-lines file holding one `RawDocument` per line.
/// Blank lines are skipped.
pub fn read_documents(path: &Path) -> Result<Vec<RawDocument>> {
    let content = fs::read_to_string(path).map_err(|e| TrendError::Io {
        source: e,
        context: format!("Failed to read documents from {}", path.display()),
    })?;

    let mut documents = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let doc: RawDocument = serde_json::from_str(line).map_err(|e| TrendError::Json {
            source: e,
            context: format!("{} line {}", path.display(), line_no + 1),
        })?;
        documents.push(doc);
    }
    Ok(documents)
}

/// Documents from a JSON-lines file, served through a BM25 index
pub struct JsonlSource {
    name: String,
    documents: Vec<RawDocument>,
    index: KeywordIndex,
}

impl JsonlSource {
    pub fn load(name: impl Into<String>, path: &Path) -> Result<Self> {
        let source = Self::from_documents(name, read_documents(path)?);
        info!(
            "Loaded {} documents for source '{}'",
            source.documents.len(),
            source.name
        );
        Ok(source)
    }

    pub fn from_documents(name: impl Into<String>, documents: Vec<RawDocument>) -> Self {
        let name = name.into();
        let documents: Vec<RawDocument> = documents
            .into_iter()
            .map(|mut doc| {
                if doc.metadata.source.is_empty() {
                    doc.metadata.source = name.clone();
                }
                doc
            })
            .collect();

        // one pseudo-chunk per document, id = position + 1
        let chunks: Vec<Chunk> = documents
            .iter()
            .enumerate()
            .map(|(i, doc)| {
                let text = match &doc.metadata.title {
                    Some(title) => format!("{}\n{}", title, doc.text),
                    None => doc.text.clone(),
                };
                Chunk {
                    id: ChunkId(i as u64 + 1),
                    source_doc_id: doc.id.clone(),
                    sequence_index: 0,
                    end: text.chars().count(),
                    start: 0,
                    text,
                }
            })
            .collect();

        let mut index = KeywordIndex::new(Tokenizer::new(true), Bm25Params::default());
        index.index(&chunks);

        Self {
            name,
            documents,
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DocumentSource for JsonlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<RawDocument>, SourceError> {
        Ok(self
            .index
            .search_text(query, limit)
            .into_iter()
            .filter_map(|(id, _)| self.documents.get((id.0 as usize).checked_sub(1)?))
            .cloned()
            .collect())
    }
}
