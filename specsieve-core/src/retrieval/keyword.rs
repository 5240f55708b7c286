use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lowercase and split on anything that is not alphanumeric, `.` or `_`.
/// Dots at token edges are punctuation and are dropped, so `OBS.R01.`
/// becomes `obs.r01`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '.' || c == '_'))
        .map(|t| t.trim_matches('.'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Okapi BM25 over a fixed set of documents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Index {
    k1: f32,
    b: f32,
    term_freqs: Vec<BTreeMap<String, u32>>,
    doc_lengths: Vec<usize>,
    doc_freqs: BTreeMap<String, usize>,
    avg_length: f32,
}

impl Bm25Index {
    pub fn build<'a, I>(documents: I, k1: f32, b: f32) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut term_freqs = Vec::new();
        let mut doc_lengths = Vec::new();
        let mut doc_freqs: BTreeMap<String, usize> = BTreeMap::new();

        for doc in documents {
            let tokens = tokenize(doc);
            let mut freqs: BTreeMap<String, u32> = BTreeMap::new();
            for token in &tokens {
                *freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *doc_freqs.entry(term.clone()).or_insert(0) += 1;
            }
            doc_lengths.push(tokens.len());
            term_freqs.push(freqs);
        }

        let avg_length = if doc_lengths.is_empty() {
            0.0
        } else {
            doc_lengths.iter().sum::<usize>() as f32 / doc_lengths.len() as f32
        };

        Self {
            k1,
            b,
            term_freqs,
            doc_lengths,
            doc_freqs,
            avg_length,
        }
    }

    pub fn len(&self) -> usize {
        self.term_freqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.term_freqs.is_empty()
    }

    fn idf(&self, term: &str) -> f32 {
        let n = self.len() as f32;
        let df = self.doc_freqs.get(term).copied().unwrap_or(0) as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Documents with a positive score, best first; ties keep index order
    pub fn search(&self, query: &str) -> Vec<(usize, f32)> {
        let terms = tokenize(query);
        if terms.is_empty() || self.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .term_freqs
            .iter()
            .enumerate()
            .filter_map(|(idx, freqs)| {
                let length_norm = if self.avg_length > 0.0 {
                    self.doc_lengths[idx] as f32 / self.avg_length
                } else {
                    0.0
                };
                let score: f32 = terms
                    .iter()
                    .filter_map(|term| freqs.get(term).map(|tf| (term, *tf as f32)))
                    .map(|(term, tf)| {
                        let denom = tf + self.k1 * (1.0 - self.b + self.b * length_norm);
                        self.idf(term) * tf * (self.k1 + 1.0) / denom
                    })
                    .sum();
                (score > 0.0).then_some((idx, score))
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
    }
}
