// Embedding Retriever
// Chunks documents, embeds them and ranks chunks by cosine similarity

use crate::inference::InferenceGateway;
use crate::retrieval::{
    AssembledContext, ContextAssembler, ContextError, ContextRequest, DocumentLibrary,
    RetrievedChunk,
};

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Chunk texts with their embeddings
type EmbeddedChunks = Arc<Vec<(String, Vec<f32>)>>;

/// (document, embedding model, chunk size, chunk overlap)
type ChunkKey = (String, String, usize, usize);

/// Context assembler backed by embedding similarity search
pub struct EmbeddingRetriever {
    gateway: Arc<InferenceGateway>,
    library: Arc<DocumentLibrary>,
    cache: DashMap<ChunkKey, EmbeddedChunks>,
}

impl EmbeddingRetriever {
    pub fn new(gateway: Arc<InferenceGateway>, library: Arc<DocumentLibrary>) -> Self {
        Self {
            gateway,
            library,
            cache: DashMap::new(),
        }
    }

    /// Embed every chunk of a document once per model and chunking
    async fn embedded_chunks(
        &self,
        request: &ContextRequest,
    ) -> Result<EmbeddedChunks, ContextError> {
        let key = (
            request.document_id.clone(),
            request.embedding_model.clone(),
            request.chunk_size,
            request.chunk_overlap,
        );
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.value().clone());
        }

        let text = self.library.get(&request.document_id)?;
        let chunks = chunk_text(&text, request.chunk_size, request.chunk_overlap)?;

        let mut embedded = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let vector = self.gateway.embed(&request.embedding_model, &chunk).await?;
            embedded.push((chunk, vector));
        }
        debug!(
            document = %request.document_id,
            model = %request.embedding_model,
            chunks = embedded.len(),
            "embedded document"
        );

        let embedded = Arc::new(embedded);
        self.cache.insert(key, embedded.clone());
        Ok(embedded)
    }
}

#[async_trait::async_trait]
impl ContextAssembler for EmbeddingRetriever {
    async fn assemble_context(
        &self,
        request: &ContextRequest,
    ) -> Result<AssembledContext, ContextError> {
        if request.top_k == 0 {
            return Err(ContextError::InvalidSettings("top_k must be at least 1".into()));
        }

        let chunks = self.embedded_chunks(request).await?;
        let query = self
            .gateway
            .embed(&request.embedding_model, &request.query)
            .await?;

        let mut ranked: Vec<RetrievedChunk> = chunks
            .iter()
            .enumerate()
            .map(|(index, (text, vector))| RetrievedChunk {
                index,
                text: text.clone(),
                score: cosine_similarity(&query, vector),
            })
            .collect();
        // Highest score first; earlier chunks win ties
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
        ranked.truncate(request.top_k);

        let text = ranked
            .iter()
            .map(|chunk| chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(AssembledContext {
            chunks: ranked,
            text,
        })
    }

    async fn full_document(&self, document_id: &str) -> Result<String, ContextError> {
        self.library.get(document_id)
    }
}

/// Split text into windows of `size` characters overlapping by `overlap`
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Result<Vec<String>, ContextError> {
    if size == 0 {
        return Err(ContextError::InvalidSettings("chunk_size must be at least 1".into()));
    }
    if overlap >= size {
        return Err(ContextError::InvalidSettings(format!(
            "chunk_overlap ({}) must be smaller than chunk_size ({})",
            overlap, size
        )));
    }

    let chars: Vec<char> = text.chars().collect();
    let step = size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        if !chunk.trim().is_empty() {
            chunks.push(chunk.trim().to_string());
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }

    Ok(chunks)
}

/// Cosine similarity; 0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
