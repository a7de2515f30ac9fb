//! Hybrid ranking engine: TF-IDF cosine retrieval re-scored by a
//! feedback-trained forest.

use crate::document::{validate_batch, Document};
use crate::error::{SearchError, SearchResult};
use crate::feedback::{FeedbackLedger, FeedbackRecord, NEUTRAL_PRIOR};
use crate::index::{LexicalIndex, TfidfConfig};
use crate::reranker::{ForestConfig, Reranker, TrainingSample};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap, HashSet};

/// One ranked hit. Serializes as `[url, title, relevance]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedResult {
    pub url: String,
    pub title: String,
    pub relevance: f32,
}

impl Serialize for RankedResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut t = serializer.serialize_tuple(3)?;
        t.serialize_element(&self.url)?;
        t.serialize_element(&self.title)?;
        t.serialize_element(&self.relevance)?;
        t.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrainOutcome {
    /// The ledger held no usable feedback; the model is unchanged.
    NothingToTrain,
    Trained { samples: usize, skipped: usize },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankingEngine {
    documents: Vec<Document>,
    positions: HashMap<String, usize>,
    index: LexicalIndex,
    reranker: Reranker,
    ledger: FeedbackLedger,
    /// Click priors frozen at the last retrain, fed to the re-ranker at query time.
    priors: HashMap<String, f32>,
}

impl RankingEngine {
    pub fn new(documents: Vec<Document>) -> SearchResult<Self> {
        Self::with_config(documents, TfidfConfig::default(), ForestConfig::default())
    }

    pub fn with_config(documents: Vec<Document>, tfidf: TfidfConfig, forest: ForestConfig) -> SearchResult<Self> {
        let mut engine = Self {
            index: LexicalIndex::build(&[], tfidf),
            reranker: Reranker::new(forest),
            ..Self::default()
        };
        engine.build(documents)?;
        Ok(engine)
    }

    /// Replaces the collection and its index. On error nothing changes.
    pub fn build(&mut self, documents: Vec<Document>) -> SearchResult<()> {
        validate_batch(&documents)?;
        let index = LexicalIndex::build(&documents, self.index.config());
        let positions = documents.iter().enumerate().map(|(i, d)| (d.url.clone(), i)).collect();
        self.documents = documents;
        self.positions = positions;
        self.index = index;
        debug_assert_eq!(self.index.rows(), self.documents.len());
        tracing::info!(documents = self.documents.len(), terms = self.index.num_terms(), "index rebuilt");
        Ok(())
    }

    /// Lexical similarity of `query` against every document, in collection order.
    pub fn score(&self, query: &str) -> Vec<(usize, f32)> {
        self.index.score(query).into_iter().enumerate().collect()
    }

    /// Tag-filtered, re-ranked results in descending relevance.
    ///
    /// Relevance ties fall back to lexical similarity and then to collection
    /// order, so an untrained engine ranks purely lexically.
    pub fn rank(&self, query: &str, filter: Option<&BTreeSet<String>>) -> SearchResult<Vec<RankedResult>> {
        if query.trim().is_empty() {
            return Err(SearchError::invalid("query is empty"));
        }
        let filter = filter.filter(|f| !f.is_empty());

        let mut hits: Vec<(usize, f32, f32)> = self
            .score(query)
            .into_iter()
            .filter(|&(pos, _)| filter.map_or(true, |f| self.documents[pos].matches_any(f)))
            .map(|(pos, sim)| {
                let relevance = self.reranker.predict(&self.features(sim, &self.documents[pos].url));
                (pos, sim, relevance)
            })
            .collect();
        // Untrained relevance is constant, so lexical similarity orders; a trained
        // model's ties keep collection order.
        let trained = self.reranker.is_trained();
        hits.sort_by(|a, b| {
            let by_relevance = b.2.total_cmp(&a.2);
            if trained {
                by_relevance
            } else {
                by_relevance.then_with(|| b.1.total_cmp(&a.1))
            }
        });

        Ok(hits
            .into_iter()
            .map(|(pos, _, relevance)| {
                let doc = &self.documents[pos];
                RankedResult { url: doc.url.clone(), title: doc.title.clone(), relevance }
            })
            .collect())
    }

    pub fn absorb_feedback(&mut self, query: &str, url: &str, clicked: bool) -> SearchResult<()> {
        if !self.positions.contains_key(url) {
            return Err(SearchError::UnknownDocument { url: url.to_string() });
        }
        self.ledger.append(FeedbackRecord::new(query, url, clicked));
        tracing::debug!(query, url, clicked, ledger = self.ledger.len(), "feedback recorded");
        Ok(())
    }

    /// Full refit of the re-ranker from the whole ledger.
    pub fn retrain(&mut self) -> SearchResult<RetrainOutcome> {
        if self.ledger.is_empty() {
            tracing::info!("no feedback recorded, nothing to train");
            return Ok(RetrainOutcome::NothingToTrain);
        }

        let priors = self.ledger.click_priors();
        let mut scored: HashMap<&str, Vec<f32>> = HashMap::new();
        let mut samples = Vec::with_capacity(self.ledger.len());
        let mut skipped = 0usize;
        for record in self.ledger.drain_for_training() {
            let Some(&pos) = self.positions.get(&record.url) else {
                tracing::warn!(url = %record.url, "feedback references a removed document, skipping");
                skipped += 1;
                continue;
            };
            let scores = scored.entry(record.query.as_str()).or_insert_with(|| self.index.score(&record.query));
            let prior = priors.get(&record.url).copied().unwrap_or(NEUTRAL_PRIOR);
            samples.push(TrainingSample {
                features: vec![scores[pos], prior],
                target: if record.clicked { 1.0 } else { 0.0 },
            });
        }
        if samples.is_empty() {
            tracing::info!(skipped, "no usable feedback, nothing to train");
            return Ok(RetrainOutcome::NothingToTrain);
        }

        let mut reranker = Reranker::new(self.reranker.config());
        reranker.fit(&samples)?;
        self.reranker = reranker;
        self.priors = priors;
        Ok(RetrainOutcome::Trained { samples: samples.len(), skipped })
    }

    /// Adds documents and rebuilds the index. Fails without changes on a url collision.
    pub fn append_documents(&mut self, new_documents: Vec<Document>) -> SearchResult<()> {
        let mut batch: HashSet<&str> = HashSet::with_capacity(new_documents.len());
        for doc in &new_documents {
            doc.validate()?;
            if self.positions.contains_key(&doc.url) || !batch.insert(doc.url.as_str()) {
                return Err(SearchError::DuplicateDocument { url: doc.url.clone() });
            }
        }
        let mut documents = Vec::with_capacity(self.documents.len() + new_documents.len());
        documents.extend(self.documents.iter().cloned());
        documents.extend(new_documents);
        self.build(documents)
    }

    /// Removes a document and rebuilds. Its feedback stays in the ledger.
    pub fn remove_document(&mut self, url: &str) -> SearchResult<Document> {
        let pos = *self
            .positions
            .get(url)
            .ok_or_else(|| SearchError::UnknownDocument { url: url.to_string() })?;
        let mut documents = self.documents.clone();
        let removed = documents.remove(pos);
        self.build(documents)?;
        Ok(removed)
    }

    fn features(&self, similarity: f32, url: &str) -> [f32; 2] {
        [similarity, self.priors.get(url).copied().unwrap_or(NEUTRAL_PRIOR)]
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn document(&self, url: &str) -> Option<&Document> {
        self.positions.get(url).map(|&pos| &self.documents[pos])
    }

    pub fn index_rows(&self) -> usize {
        self.index.rows()
    }

    pub fn is_trained(&self) -> bool {
        self.reranker.is_trained()
    }

    pub fn ledger(&self) -> &FeedbackLedger {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pets() -> Vec<Document> {
        vec![
            Document::new("/a", "Cats", "cats are great pets"),
            Document::new("/b", "Dogs", "dogs are loyal pets"),
        ]
    }

    fn urls(results: &[RankedResult]) -> Vec<&str> {
        results.iter().map(|r| r.url.as_str()).collect()
    }

    #[test]
    fn pets_returns_both() {
        let engine = RankingEngine::new(pets()).unwrap();
        let results = engine.rank("pets", None).unwrap();
        assert_eq!(urls(&results), vec!["/a", "/b"]);
    }

    #[test]
    fn cats_ranks_a_first() {
        let engine = RankingEngine::new(pets()).unwrap();
        let results = engine.rank("cats", None).unwrap();
        assert_eq!(urls(&results), vec!["/a", "/b"]);
        let scores = engine.score("cats");
        assert!(scores[0].1 > scores[1].1);
    }

    #[test]
    fn untrained_orders_lexically() {
        let mut docs = pets();
        docs.push(Document::new("/c", "Cat care", "cats cats cats"));
        let engine = RankingEngine::new(docs).unwrap();
        let results = engine.rank("cats", None).unwrap();
        assert_eq!(urls(&results), vec!["/c", "/a", "/b"]);
        assert!(results.iter().all(|r| r.relevance == 0.0));
    }

    #[test]
    fn tag_filter_keeps_intersecting_docs() {
        let docs = vec![
            Document::new("/a", "Cats", "cats are great pets").with_tags(["feline"]),
            Document::new("/b", "Dogs", "dogs are loyal pets").with_tags(["canine"]),
        ];
        let engine = RankingEngine::new(docs).unwrap();
        let filter: BTreeSet<String> = ["canine".to_string()].into_iter().collect();
        assert_eq!(urls(&engine.rank("pets", Some(&filter)).unwrap()), vec!["/b"]);
        assert_eq!(engine.rank("pets", Some(&BTreeSet::new())).unwrap().len(), 2);
    }

    #[test]
    fn empty_collection_ranks_nothing() {
        let engine = RankingEngine::new(Vec::new()).unwrap();
        assert!(engine.rank("anything", None).unwrap().is_empty());
    }

    #[test]
    fn blank_query_is_invalid() {
        let engine = RankingEngine::new(pets()).unwrap();
        assert!(matches!(engine.rank("   ", None), Err(SearchError::InvalidInput(_))));
    }

    #[test]
    fn build_rejects_malformed_and_keeps_old_state() {
        let mut engine = RankingEngine::new(pets()).unwrap();
        let err = engine.build(vec![Document::new("", "No url", "x")]).unwrap_err();
        assert!(matches!(err, SearchError::InvalidInput(_)));
        assert_eq!(engine.len(), 2);
        assert_eq!(engine.index_rows(), 2);
    }

    #[test]
    fn duplicate_append_leaves_engine_unchanged() {
        let mut engine = RankingEngine::new(pets()).unwrap();
        let err = engine
            .append_documents(vec![Document::new("/c", "Birds", "birds"), Document::new("/a", "Cats 2", "more cats")])
            .unwrap_err();
        assert_eq!(err, SearchError::DuplicateDocument { url: "/a".into() });
        assert_eq!(engine.len(), 2);
        assert_eq!(engine.index_rows(), 2);
    }

    #[test]
    fn append_rebuilds_index() {
        let mut engine = RankingEngine::new(pets()).unwrap();
        engine.append_documents(vec![Document::new("/c", "Birds", "birds are noisy pets")]).unwrap();
        assert_eq!(engine.index_rows(), 3);
        assert_eq!(engine.rank("birds", None).unwrap()[0].url, "/c");
    }

    #[test]
    fn feedback_for_unknown_url_fails() {
        let mut engine = RankingEngine::new(pets()).unwrap();
        let err = engine.absorb_feedback("pets", "/zzz", true).unwrap_err();
        assert!(matches!(err, SearchError::UnknownDocument { .. }));
        assert!(engine.ledger().is_empty());
    }

    #[test]
    fn retrain_with_empty_ledger_is_noop() {
        let mut engine = RankingEngine::new(pets()).unwrap();
        assert_eq!(engine.retrain().unwrap(), RetrainOutcome::NothingToTrain);
        assert!(!engine.is_trained());
    }

    #[test]
    fn feedback_breaks_lexical_tie() {
        let mut engine = RankingEngine::new(pets()).unwrap();
        assert_eq!(urls(&engine.rank("pets", None).unwrap()), vec!["/a", "/b"]);

        engine.absorb_feedback("pets", "/b", true).unwrap();
        engine.absorb_feedback("pets", "/a", false).unwrap();
        let outcome = engine.retrain().unwrap();
        assert_eq!(outcome, RetrainOutcome::Trained { samples: 2, skipped: 0 });
        assert!(engine.is_trained());

        let first = engine.rank("pets", None).unwrap();
        assert_eq!(urls(&first), vec!["/b", "/a"]);
        assert_eq!(first, engine.rank("pets", None).unwrap());
    }

    #[test]
    fn trained_ties_keep_collection_order() {
        let docs = vec![
            Document::new("/a", "Dogs", "dogs are loyal pets"),
            Document::new("/b", "Cats", "cats are great pets"),
        ];
        let mut engine = RankingEngine::new(docs).unwrap();
        assert_eq!(urls(&engine.rank("cats", None).unwrap()), vec!["/b", "/a"]);

        // one clicked sample: every tree is a single leaf, so relevance ties
        engine.absorb_feedback("cats", "/b", true).unwrap();
        engine.retrain().unwrap();
        let results = engine.rank("cats", None).unwrap();
        assert!(results.iter().all(|r| r.relevance == results[0].relevance));
        assert_eq!(urls(&results), vec!["/a", "/b"]);
    }

    #[test]
    fn removed_documents_are_skipped_in_retrain() {
        let mut engine = RankingEngine::new(pets()).unwrap();
        engine.absorb_feedback("cats", "/a", true).unwrap();
        engine.absorb_feedback("dogs", "/b", true).unwrap();
        engine.remove_document("/a").unwrap();
        assert_eq!(engine.retrain().unwrap(), RetrainOutcome::Trained { samples: 1, skipped: 1 });
        assert!(engine.document("/a").is_none());
        assert_eq!(engine.index_rows(), 1);
    }
}
