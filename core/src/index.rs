use crate::document::Document;
use crate::tokenizer::term_counts;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub type TermId = u32;
pub type DocId = u32;

/// Term weighting options for the TF-IDF model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TfidfConfig {
    /// Use `1 + ln(tf)` instead of the raw term count.
    pub sublinear_tf: bool,
    /// Use `1 + ln((1 + N) / (1 + df))` instead of `1 + ln(N / df)`.
    pub smooth_idf: bool,
}

impl Default for TfidfConfig {
    fn default() -> Self {
        Self { sublinear_tf: true, smooth_idf: true }
    }
}

impl TfidfConfig {
    fn tf(&self, raw: u32) -> f32 {
        match raw {
            0 => 0.0,
            _ if self.sublinear_tf => 1.0 + (raw as f32).ln(),
            _ => raw as f32,
        }
    }

    fn idf(&self, num_docs: u32, df: u32) -> f32 {
        let n = num_docs as f32;
        let df = df.max(1) as f32;
        if self.smooth_idf {
            ((1.0 + n) / (1.0 + df)).ln() + 1.0
        } else {
            (n / df).ln() + 1.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: DocId,
    pub weight: f32, // l2-normalized tf-idf weight
}

/// Sparse TF-IDF matrix stored column-wise: one postings list per term,
/// rows aligned with the document order the index was built from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LexicalIndex {
    config: TfidfConfig,
    dictionary: HashMap<String, TermId>,
    idf: Vec<f32>,
    postings: Vec<Vec<Posting>>, // indexed by term id, each sorted by doc_id
    num_docs: u32,
}

impl LexicalIndex {
    pub fn build(documents: &[Document], config: TfidfConfig) -> Self {
        let num_docs = documents.len() as u32;
        let mut dictionary: HashMap<String, TermId> = HashMap::new();
        let mut raw: Vec<Vec<(DocId, u32)>> = Vec::new();

        for (doc_id, doc) in documents.iter().enumerate() {
            for (term, tf) in term_counts(&doc.content) {
                let next = raw.len() as TermId;
                let tid = *dictionary.entry(term).or_insert(next);
                if tid == next {
                    raw.push(Vec::new());
                }
                raw[tid as usize].push((doc_id as DocId, tf));
            }
        }

        let idf: Vec<f32> = raw.iter().map(|plist| config.idf(num_docs, plist.len() as u32)).collect();

        // First pass: per-row weights, summed smallest first so equal rows get equal norms
        let mut row_weights: Vec<Vec<f32>> = vec![Vec::new(); documents.len()];
        for (tid, plist) in raw.iter().enumerate() {
            for &(doc_id, tf) in plist {
                row_weights[doc_id as usize].push(config.tf(tf) * idf[tid]);
            }
        }
        let norms: Vec<f32> = row_weights
            .into_iter()
            .map(|mut ws| {
                ws.sort_by(f32::total_cmp);
                let norm = ws.iter().map(|w| w * w).sum::<f32>().sqrt();
                if norm == 0.0 { 1.0 } else { norm }
            })
            .collect();

        // Second pass: normalized postings, already in doc order
        let postings = raw
            .into_iter()
            .enumerate()
            .map(|(tid, plist)| {
                plist
                    .into_iter()
                    .map(|(doc_id, tf)| Posting {
                        doc_id,
                        weight: config.tf(tf) * idf[tid] / norms[doc_id as usize],
                    })
                    .collect()
            })
            .collect();

        tracing::debug!(num_docs, num_terms = dictionary.len(), "lexical index built");
        Self { config, dictionary, idf, postings, num_docs }
    }

    /// Number of rows, one per indexed document.
    pub fn rows(&self) -> usize {
        self.num_docs as usize
    }

    pub fn num_terms(&self) -> usize {
        self.dictionary.len()
    }

    pub fn config(&self) -> TfidfConfig {
        self.config
    }

    /// Normalized query weights; terms missing from the vocabulary are ignored.
    fn query_weights(&self, query: &str) -> BTreeMap<TermId, f32> {
        let mut weights: BTreeMap<TermId, f32> = BTreeMap::new();
        for (term, tf) in term_counts(query) {
            if let Some(&tid) = self.dictionary.get(&term) {
                weights.insert(tid, self.config.tf(tf) * self.idf[tid as usize]);
            }
        }
        let norm = weights.values().map(|w| w * w).sum::<f32>().sqrt();
        if norm > 0.0 {
            for w in weights.values_mut() {
                *w /= norm;
            }
        }
        weights
    }

    /// Cosine similarity between `query` and every row, in row order.
    pub fn score(&self, query: &str) -> Vec<f32> {
        let mut scores = vec![0.0f32; self.rows()];
        for (tid, q_w) in self.query_weights(query) {
            for p in &self.postings[tid as usize] {
                scores[p.doc_id as usize] += p.weight * q_w; // both sides are unit length
            }
        }
        for s in scores.iter_mut() {
            *s = s.clamp(0.0, 1.0);
        }
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs() -> Vec<Document> {
        vec![
            Document::new("/a", "Cats", "cats are great pets"),
            Document::new("/b", "Dogs", "dogs are loyal pets"),
            Document::new("/c", "Empty", ""),
        ]
    }

    #[test]
    fn one_row_per_document() {
        let index = LexicalIndex::build(&docs(), TfidfConfig::default());
        assert_eq!(index.rows(), 3);
        assert_eq!(index.score("pets").len(), 3);
    }

    #[test]
    fn shared_term_scores_both() {
        let index = LexicalIndex::build(&docs(), TfidfConfig::default());
        let s = index.score("pets");
        assert!(s[0] > 0.0 && s[1] > 0.0);
        assert!((s[0] - s[1]).abs() < 1e-6);
        assert_eq!(s[2], 0.0);
    }

    #[test]
    fn identical_text_scores_one() {
        let index = LexicalIndex::build(&docs(), TfidfConfig::default());
        let s = index.score("cats are great pets");
        assert!((s[0] - 1.0).abs() < 1e-5);
        assert!(s[0] > s[1]);
    }

    #[test]
    fn unknown_terms_score_zero() {
        let index = LexicalIndex::build(&docs(), TfidfConfig { sublinear_tf: false, smooth_idf: false });
        assert!(index.score("zebra").iter().all(|&s| s == 0.0));
    }
}
