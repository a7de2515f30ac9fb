use crate::error::{SearchError, SearchResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// A page-like document. `url` is the unique key of the collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "tags", rename = "filters")]
    pub tags: BTreeSet<String>,
}

impl Document {
    pub fn new(url: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self { url: url.into(), title: title.into(), content: content.into(), tags: BTreeSet::new() }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// True when the tag set shares at least one tag with `filter`.
    pub fn matches_any(&self, filter: &BTreeSet<String>) -> bool {
        filter.iter().any(|tag| self.tags.contains(tag))
    }

    pub fn validate(&self) -> SearchResult<()> {
        if self.url.trim().is_empty() {
            return Err(SearchError::invalid("document url is empty"));
        }
        if self.title.trim().is_empty() {
            return Err(SearchError::invalid(format!("document {} has an empty title", self.url)));
        }
        Ok(())
    }
}

/// Validates every document and rejects a batch with repeated urls.
pub fn validate_batch(documents: &[Document]) -> SearchResult<()> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(documents.len());
    for doc in documents {
        doc.validate()?;
        if !seen.insert(doc.url.as_str()) {
            return Err(SearchError::invalid(format!("url {} appears more than once", doc.url)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_url_is_malformed() {
        let doc = Document::new("  ", "Title", "body");
        assert!(matches!(doc.validate(), Err(SearchError::InvalidInput(_))));
    }

    #[test]
    fn repeated_urls_rejected() {
        let docs = vec![Document::new("/a", "A", "x"), Document::new("/a", "A again", "y")];
        assert!(matches!(validate_batch(&docs), Err(SearchError::InvalidInput(_))));
    }

    #[test]
    fn filters_field_maps_to_tags() {
        let doc: Document = serde_json::from_str(
            r#"{"url":"/a","title":"Cats","content":"cats","filters":["pets","animals"]}"#,
        )
        .unwrap();
        assert!(doc.tags.contains("pets"));
        let filter: BTreeSet<String> = ["animals".to_string()].into_iter().collect();
        assert!(doc.matches_any(&filter));
    }

    #[test]
    fn tags_alias_accepted() {
        let doc: Document = serde_json::from_str(r#"{"url":"/b","title":"Dogs","tags":["pets"]}"#).unwrap();
        assert_eq!(doc.tags.len(), 1);
        assert!(doc.content.is_empty());
    }
}
