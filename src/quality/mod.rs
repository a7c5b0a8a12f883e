//! Data sufficiency gate
//!
//! Evidence gathered during collection is measured against numeric
//! thresholds. The gate is pure: the same bundle and thresholds always give
//! the same assessment.

use crate::chunking::ChunkId;
use crate::config::QualityConfig;
use crate::error::{Result, TrendError};
use ahash::AHashSet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A paper or news article found by a document source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Stable deduplication key (URL when present, else document id)
    pub key: String,
    pub title: Option<String>,
    pub text: String,
    /// Publisher or archive
    pub source: String,
    pub url: Option<String>,
    /// Keyword whose query found this item
    pub keyword: String,
}

/// A chunk of local reference material selected by the retriever
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceHit {
    pub chunk_id: ChunkId,
    pub source_doc_id: String,
    pub text: String,
    pub fused_score: f32,
    pub keyword: String,
}

/// Items produced by one collection round, not yet merged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBatch {
    pub papers: Vec<EvidenceItem>,
    pub reference_hits: Vec<ReferenceHit>,
    pub news_items: Vec<EvidenceItem>,
}

impl EvidenceBatch {
    pub fn is_empty(&self) -> bool {
        self.papers.is_empty() && self.reference_hits.is_empty() && self.news_items.is_empty()
    }
}

/// Counts of items a merge actually added
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub papers: usize,
    pub reference_hits: usize,
    pub news_items: usize,
}

/// Everything collected during a run.
///
/// Lists only grow and never hold two items with the same key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub papers: Vec<EvidenceItem>,
    pub reference_hits: Vec<ReferenceHit>,
    pub news_items: Vec<EvidenceItem>,
    /// Collection rounds merged into this bundle
    pub attempt_count: u32,
}

impl EvidenceBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch, skipping items already present
    pub fn merge(&mut self, batch: EvidenceBatch) -> MergeStats {
        let mut stats = MergeStats::default();

        let mut seen: AHashSet<String> = self.papers.iter().map(|p| p.key.clone()).collect();
        for paper in batch.papers {
            if seen.insert(paper.key.clone()) {
                self.papers.push(paper);
                stats.papers += 1;
            }
        }

        let mut seen: AHashSet<ChunkId> = self.reference_hits.iter().map(|r| r.chunk_id).collect();
        for hit in batch.reference_hits {
            if seen.insert(hit.chunk_id) {
                self.reference_hits.push(hit);
                stats.reference_hits += 1;
            }
        }

        let mut seen: AHashSet<String> = self.news_items.iter().map(|n| n.key.clone()).collect();
        for item in batch.news_items {
            if seen.insert(item.key.clone()) {
                self.news_items.push(item);
                stats.news_items += 1;
            }
        }

        stats
    }

    pub fn total_items(&self) -> usize {
        self.papers.len() + self.reference_hits.len() + self.news_items.len()
    }

    /// (source, text) of every item
    fn items(&self) -> impl Iterator<Item = (&str, String)> {
        let papers = self
            .papers
            .iter()
            .chain(self.news_items.iter())
            .map(|item| (item.source.as_str(), item_text(item)));
        let hits = self
            .reference_hits
            .iter()
            .map(|hit| (hit.source_doc_id.as_str(), hit.text.clone()));
        papers.chain(hits)
    }
}

fn item_text(item: &EvidenceItem) -> String {
    match &item.title {
        Some(title) => format!("{}\n{}", title, item.text),
        None => item.text.clone(),
    }
}

/// Sufficiency thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub min_papers: usize,
    pub min_company_ratio: f32,
    pub min_distinct_sources: usize,
    pub min_reference_hits: usize,
    pub min_news_items: usize,
    pub organizations: Vec<String>,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self::from(&QualityConfig::default())
    }
}

impl From<&QualityConfig> for QualityThresholds {
    fn from(config: &QualityConfig) -> Self {
        Self {
            min_papers: config.min_papers,
            min_company_ratio: config.min_company_ratio,
            min_distinct_sources: config.min_distinct_sources,
            min_reference_hits: config.min_reference_hits,
            min_news_items: config.min_news_items,
            organizations: config.organizations.clone(),
        }
    }
}

/// What the gate measured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMetrics {
    pub papers: usize,
    pub reference_hits: usize,
    pub news_items: usize,
    pub distinct_sources: usize,
    /// Items mentioning a configured organisation
    pub company_mentions: usize,
    pub company_ratio: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub sufficient: bool,
    /// One line per failed threshold; empty when sufficient
    pub reasons: Vec<String>,
    pub metrics: EvidenceMetrics,
}

/// Compiled thresholds
#[derive(Debug, Clone)]
pub struct QualityGate {
    thresholds: QualityThresholds,
    organizations: Option<Regex>,
}

impl QualityGate {
    pub fn new(thresholds: QualityThresholds) -> Result<Self> {
        if !(0.0..=1.0).contains(&thresholds.min_company_ratio) {
            return Err(TrendError::InvalidConfig(format!(
                "min_company_ratio must be within [0, 1], got {}",
                thresholds.min_company_ratio
            )));
        }

        let names: Vec<String> = thresholds
            .organizations
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(regex::escape)
            .collect();

        let organizations = if names.is_empty() {
            None
        } else {
            let pattern = format!(r"(?i)\b(?:{})\b", names.join("|"));
            Some(Regex::new(&pattern).map_err(|e| {
                TrendError::InvalidConfig(format!("Invalid organization pattern: {}", e))
            })?)
        };

        Ok(Self {
            thresholds,
            organizations,
        })
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// Measure the bundle and check every threshold
    pub fn assess(&self, evidence: &EvidenceBundle) -> Assessment {
        let t = &self.thresholds;

        let mut sources = BTreeSet::new();
        let mut mentions = 0;
        let mut total = 0;
        for (source, text) in evidence.items() {
            total += 1;
            if !source.is_empty() {
                sources.insert(source.to_lowercase());
            }
            if self
                .organizations
                .as_ref()
                .is_some_and(|re| re.is_match(&text))
            {
                mentions += 1;
            }
        }

        let ratio = if total == 0 {
            0.0
        } else {
            mentions as f32 / total as f32
        };

        let metrics = EvidenceMetrics {
            papers: evidence.papers.len(),
            reference_hits: evidence.reference_hits.len(),
            news_items: evidence.news_items.len(),
            distinct_sources: sources.len(),
            company_mentions: mentions,
            company_ratio: ratio,
        };

        let mut reasons = Vec::new();
        if metrics.papers < t.min_papers {
            reasons.push(format!(
                "papers: {} < {} required",
                metrics.papers, t.min_papers
            ));
        }
        if self.organizations.is_some() && metrics.company_ratio < t.min_company_ratio {
            reasons.push(format!(
                "company ratio: {:.2} < {:.2} required",
                metrics.company_ratio, t.min_company_ratio
            ));
        }
        if metrics.distinct_sources < t.min_distinct_sources {
            reasons.push(format!(
                "distinct sources: {} < {} required",
                metrics.distinct_sources, t.min_distinct_sources
            ));
        }
        if metrics.reference_hits < t.min_reference_hits {
            reasons.push(format!(
                "reference hits: {} < {} required",
                metrics.reference_hits, t.min_reference_hits
            ));
        }
        if metrics.news_items < t.min_news_items {
            reasons.push(format!(
                "news items: {} < {} required",
                metrics.news_items, t.min_news_items
            ));
        }

        Assessment {
            sufficient: reasons.is_empty(),
            reasons,
            metrics,
        }
    }
}

/// One-shot assessment
pub fn assess(evidence: &EvidenceBundle, thresholds: &QualityThresholds) -> Result<Assessment> {
    Ok(QualityGate::new(thresholds.clone())?.assess(evidence))
}
