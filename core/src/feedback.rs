use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Click prior for documents that have never received feedback.
pub const NEUTRAL_PRIOR: f32 = 0.5;

/// One observation: a result `url` shown for `query`, and whether it was clicked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub query: String,
    pub url: String,
    pub clicked: bool,
    pub recorded_at: String,
}

impl FeedbackRecord {
    pub fn new(query: impl Into<String>, url: impl Into<String>, clicked: bool) -> Self {
        let recorded_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        Self { query: query.into(), url: url.into(), clicked, recorded_at }
    }
}

/// Append-only feedback history. Retraining reads all of it and never clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackLedger {
    records: Vec<FeedbackRecord>,
}

impl FeedbackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: FeedbackRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeedbackRecord> {
        self.records.iter()
    }

    /// The full history, for a complete refit.
    pub fn drain_for_training(&self) -> &[FeedbackRecord] {
        &self.records
    }

    /// Laplace-smoothed click rate per url: `(clicks + 1) / (observations + 2)`.
    pub fn click_priors(&self) -> HashMap<String, f32> {
        let mut counts: HashMap<&str, (u32, u32)> = HashMap::new();
        for r in &self.records {
            let entry = counts.entry(r.url.as_str()).or_insert((0, 0));
            entry.0 += u32::from(r.clicked);
            entry.1 += 1;
        }
        counts
            .into_iter()
            .map(|(url, (clicks, seen))| (url.to_string(), (clicks as f32 + 1.0) / (seen as f32 + 2.0)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draining_keeps_history() {
        let mut ledger = FeedbackLedger::new();
        ledger.append(FeedbackRecord::new("cats", "/a", true));
        assert_eq!(ledger.drain_for_training().len(), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn priors_are_smoothed() {
        let mut ledger = FeedbackLedger::new();
        ledger.append(FeedbackRecord::new("pets", "/a", true));
        ledger.append(FeedbackRecord::new("pets", "/a", true));
        ledger.append(FeedbackRecord::new("pets", "/b", false));
        let priors = ledger.click_priors();
        assert!((priors["/a"] - 0.75).abs() < 1e-6);
        assert!((priors["/b"] - 1.0 / 3.0).abs() < 1e-6);
        assert!(!priors.contains_key("/c"));
    }
}
