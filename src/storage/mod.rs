//! Persistent storage: symbol index, explanation cache, event log, sessions.

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Dimensionality of stored code embeddings.
pub const EMBEDDING_DIM: usize = 384;

/// One indexed symbol occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub path: String,
    pub symbol: String,
    /// Symbol kind: function, class, method, import, ...
    pub kind: String,
    pub line_start: u32,
    pub line_end: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl SymbolRecord {
    pub fn new(
        path: impl Into<String>,
        symbol: impl Into<String>,
        kind: impl Into<String>,
        line_start: u32,
        line_end: u32,
    ) -> Self {
        Self {
            path: path.into(),
            symbol: symbol.into(),
            kind: kind.into(),
            line_start,
            line_end,
            language: None,
            embedding: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// A symbol record paired with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredSymbol {
    pub record: SymbolRecord,
    pub score: f32,
}

/// One persisted analysis event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Content-addressed fingerprint over an ordered sequence of parts.
pub fn fingerprint<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    format!("{:x}", hasher.finalize())
}
