/// BM25 keyword index over chunks
use crate::chunking::{Chunk, ChunkId};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tantivy::tokenizer::{
    Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, StopWordFilter, TextAnalyzer, Token,
    TokenStream,
};

/// BM25 scoring constants
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    /// Term frequency saturation
    pub k1: f32,
    /// Document length normalization
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Text analyzer shared by indexing, querying and Jaccard similarity.
///
/// Splits on non-alphanumeric characters, drops tokens longer than 40 bytes,
/// lowercases, and optionally removes English stopwords.
#[derive(Clone)]
pub struct Tokenizer {
    analyzer: TextAnalyzer,
}

impl Tokenizer {
    pub fn new(remove_stopwords: bool) -> Self {
        let builder = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(40))
            .filter(LowerCaser);

        let analyzer = match StopWordFilter::new(Language::English) {
            Some(stopwords) if remove_stopwords => builder.filter(stopwords).build(),
            _ => builder.build(),
        };

        Self { analyzer }
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let mut analyzer = self.analyzer.clone();
        let mut stream = analyzer.token_stream(text);
        let mut tokens = Vec::new();
        stream.process(&mut |token: &Token| tokens.push(token.text.clone()));
        tokens
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(true)
    }
}

/// One persisted posting entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub term: String,
    pub chunk_id: ChunkId,
    pub term_frequency: u32,
}

/// Inverted index with BM25 ranking.
///
/// Postings are derived data: re-indexing a chunk replaces whatever was
/// recorded for it before.
pub struct KeywordIndex {
    tokenizer: Tokenizer,
    params: Bm25Params,
    /// term -> chunk -> term frequency
    postings: AHashMap<String, BTreeMap<ChunkId, u32>>,
    /// chunk -> distinct terms, for removal
    chunk_terms: AHashMap<ChunkId, Vec<String>>,
    doc_lengths: BTreeMap<ChunkId, u32>,
    total_length: u64,
}

impl KeywordIndex {
    pub fn new(tokenizer: Tokenizer, params: Bm25Params) -> Self {
        Self {
            tokenizer,
            params,
            postings: AHashMap::new(),
            chunk_terms: AHashMap::new(),
            doc_lengths: BTreeMap::new(),
            total_length: 0,
        }
    }

    /// Rebuild an index from persisted postings.
    ///
    /// Chunk lengths are the sum of their term frequencies, which is exactly
    /// what [`KeywordIndex::index`] records.
    pub fn from_postings(
        tokenizer: Tokenizer,
        params: Bm25Params,
        postings: impl IntoIterator<Item = Posting>,
    ) -> Self {
        let mut index = Self::new(tokenizer, params);
        for posting in postings {
            if posting.term_frequency == 0 {
                continue;
            }
            index
                .postings
                .entry(posting.term.clone())
                .or_default()
                .insert(posting.chunk_id, posting.term_frequency);
            index
                .chunk_terms
                .entry(posting.chunk_id)
                .or_default()
                .push(posting.term);
            *index.doc_lengths.entry(posting.chunk_id).or_insert(0) += posting.term_frequency;
            index.total_length += posting.term_frequency as u64;
        }
        index
    }

    /// Tokenize and index chunks
    pub fn index(&mut self, chunks: &[Chunk]) {
        for chunk in chunks {
            self.remove(chunk.id);

            let tokens = self.tokenizer.tokenize(&chunk.text);
            let mut frequencies: AHashMap<String, u32> = AHashMap::new();
            for token in tokens.iter() {
                *frequencies.entry(token.clone()).or_insert(0) += 1;
            }

            let length = tokens.len() as u32;
            let mut terms = Vec::with_capacity(frequencies.len());
            for (term, tf) in frequencies {
                self.postings
                    .entry(term.clone())
                    .or_default()
                    .insert(chunk.id, tf);
                terms.push(term);
            }

            self.chunk_terms.insert(chunk.id, terms);
            self.doc_lengths.insert(chunk.id, length);
            self.total_length += length as u64;
        }
    }

    /// Drop a chunk from the index
    pub fn remove(&mut self, id: ChunkId) {
        if let Some(terms) = self.chunk_terms.remove(&id) {
            for term in terms {
                if let Some(list) = self.postings.get_mut(&term) {
                    list.remove(&id);
                    if list.is_empty() {
                        self.postings.remove(&term);
                    }
                }
            }
        }
        if let Some(length) = self.doc_lengths.remove(&id) {
            self.total_length -= length as u64;
        }
    }

    /// Rank chunks for already-split query terms.
    ///
    /// Each term is passed through the analyzer, so callers may hand in raw
    /// keywords. Returns at most `k` results, best first, ties by chunk id.
    pub fn search(&self, query_terms: &[String], k: usize) -> Vec<(ChunkId, f32)> {
        if k == 0 || self.doc_lengths.is_empty() {
            return Vec::new();
        }

        let mut terms: Vec<String> = query_terms
            .iter()
            .flat_map(|t| self.tokenizer.tokenize(t))
            .collect();
        terms.sort();
        terms.dedup();

        let n = self.doc_lengths.len() as f32;
        let avg_len = (self.total_length as f32 / n).max(f32::EPSILON);
        let Bm25Params { k1, b } = self.params;

        let mut scores: AHashMap<ChunkId, f32> = AHashMap::new();
        for term in &terms {
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            let df = list.len() as f32;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();

            for (chunk_id, tf) in list {
                let tf = *tf as f32;
                let len = self.doc_lengths.get(chunk_id).copied().unwrap_or(0) as f32;
                let norm = tf + k1 * (1.0 - b + b * len / avg_len);
                *scores.entry(*chunk_id).or_insert(0.0) += idf * tf * (k1 + 1.0) / norm;
            }
        }

        let mut ranked: Vec<(ChunkId, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(k);
        ranked
    }

    /// Tokenize free text and rank chunks
    pub fn search_text(&self, query: &str, k: usize) -> Vec<(ChunkId, f32)> {
        self.search(&[query.to_string()], k)
    }

    /// Export postings sorted by term then chunk id
    pub fn postings(&self) -> Vec<Posting> {
        let mut terms: Vec<&String> = self.postings.keys().collect();
        terms.sort();

        terms
            .into_iter()
            .flat_map(|term| {
                self.postings[term].iter().map(move |(chunk_id, tf)| Posting {
                    term: term.clone(),
                    chunk_id: *chunk_id,
                    term_frequency: *tf,
                })
            })
            .collect()
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    /// Number of indexed chunks
    pub fn len(&self) -> usize {
        self.doc_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lengths.is_empty()
    }
}
