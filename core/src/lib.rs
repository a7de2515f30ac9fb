//! Ranking core: lexical retrieval, a feedback-trained re-ranker, the durable
//! store that keeps the model across restarts, and the dispatcher that runs
//! ranking work off the I/O loop.

pub mod dispatcher;
pub mod document;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod index;
pub mod persist;
pub mod reranker;
pub mod settings;
pub mod store;
pub mod tokenizer;

pub use dispatcher::{Dispatcher, JobHandle, JobState};
pub use document::Document;
pub use engine::{RankedResult, RankingEngine, RetrainOutcome};
pub use error::{SearchError, SearchResult};
pub use feedback::{FeedbackLedger, FeedbackRecord};
pub use index::{LexicalIndex, TfidfConfig};
pub use reranker::{ForestConfig, Reranker};
pub use settings::{SettingEntry, SettingKind, SettingValue, Settings};
pub use store::{SharedEngine, Store, StoreCell, StoreValue, ValueKind, MODEL_KEY, SETTINGS_KEY};
