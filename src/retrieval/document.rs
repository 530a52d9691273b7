//! Retrievable documents and the read-only store the orchestrator hydrates from

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocumentStoreError {
    #[error("Document store lock poisoned")]
    LockPoisoned,

    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

/// A retrievable unit (document or chunk)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Opaque identifier shared by every retrieval backend
    pub id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub body: String,

    /// Attributes that query filters match against
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Title and body joined, as scored by embedders and the cross-encoder
    pub fn text(&self) -> String {
        if self.title.is_empty() {
            self.body.clone()
        } else if self.body.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n{}", self.title, self.body)
        }
    }

    /// True when every filter key is present in the metadata with an equal value
    pub fn matches(&self, filters: &BTreeMap<String, String>) -> bool {
        filters
            .iter()
            .all(|(key, value)| self.metadata.get(key) == Some(value))
    }
}

/// Read access to document text and metadata
pub trait DocumentStore: Send + Sync {
    fn get(&self, id: &str) -> Option<Document>;
}

/// Document store backed by a hash map
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<String, Document>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: Document) -> Result<(), DocumentStoreError> {
        if document.id.is_empty() {
            return Err(DocumentStoreError::InvalidDocument(
                "Document id cannot be empty".to_string(),
            ));
        }

        let mut documents = self
            .documents
            .write()
            .map_err(|_| DocumentStoreError::LockPoisoned)?;
        documents.insert(document.id.clone(), document);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn get(&self, id: &str) -> Option<Document> {
        self.documents.read().ok()?.get(id).cloned()
    }
}
