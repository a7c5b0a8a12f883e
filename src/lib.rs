//! Trendforge - technology trend reports from hybrid retrieval
//!
//! Reference documents are chunked and indexed twice, by BM25 keywords and by
//! embedding vectors. Queries fuse both rankings and rerank them for
//! diversity. A bounded-retry pipeline plans a report, collects evidence from
//! several sources in parallel, checks it against sufficiency thresholds, and
//! iterates on reviewer feedback until the report is accepted or a retry
//! ceiling is reached.

pub mod chunking;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod feedback;
pub mod llm;
pub mod pipeline;
pub mod quality;
pub mod retrieval;
pub mod storage;

pub use error::{Result, TrendError};
