// Retrieval Module
// Context assembly for retrieval-augmented and full-context runs

pub mod embedding;

pub use embedding::EmbeddingRetriever;

use crate::inference::GatewayError;

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ContextError {
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("document {0} has no text")]
    EmptyDocument(String),

    #[error("invalid retrieval settings: {0}")]
    InvalidSettings(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] GatewayError),
}

impl ContextError {
    /// Whether the failure means the inference backend itself is gone
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Embedding(err) if err.is_critical())
    }
}

/// Parameters for one context assembly
#[derive(Debug, Clone, PartialEq)]
pub struct ContextRequest {
    pub query: String,
    pub document_id: String,
    pub embedding_model: String,
    pub top_k: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    /// Position of the chunk in the document
    pub index: usize,
    pub text: String,
    pub score: f32,
}

/// Chunks selected for a query and the text built from them
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssembledContext {
    pub chunks: Vec<RetrievedChunk>,
    pub text: String,
}

/// Supplies document context for runs
#[async_trait::async_trait]
pub trait ContextAssembler: Send + Sync {
    async fn assemble_context(
        &self,
        request: &ContextRequest,
    ) -> Result<AssembledContext, ContextError>;

    /// Whole document text, for full-context runs
    async fn full_document(&self, document_id: &str) -> Result<String, ContextError>;
}

/// Documents available for retrieval, keyed by id
#[derive(Debug, Default)]
pub struct DocumentLibrary {
    documents: DashMap<String, String>,
}

impl DocumentLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, text: impl Into<String>) {
        self.documents.insert(id.into(), text.into());
    }

    pub fn get(&self, id: &str) -> Result<String, ContextError> {
        let text = self
            .documents
            .get(id)
            .map(|doc| doc.value().clone())
            .ok_or_else(|| ContextError::DocumentNotFound(id.to_string()))?;
        if text.trim().is_empty() {
            return Err(ContextError::EmptyDocument(id.to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_lookup() {
        let library = DocumentLibrary::new();
        library.insert("guide.md", "Rust ownership rules");
        library.insert("blank.md", "   ");

        assert_eq!(library.get("guide.md").unwrap(), "Rust ownership rules");
        assert!(matches!(
            library.get("missing.md"),
            Err(ContextError::DocumentNotFound(_))
        ));
        assert!(matches!(
            library.get("blank.md"),
            Err(ContextError::EmptyDocument(_))
        ));
    }

    #[test]
    fn test_critical_embedding_error() {
        let err = ContextError::from(GatewayError::Critical("gone".into()));
        assert!(err.is_critical());
        assert!(!ContextError::DocumentNotFound("x".into()).is_critical());
    }
}
