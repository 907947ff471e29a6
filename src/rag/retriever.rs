use serde::Serialize;
use std::sync::{Arc, RwLock};

use super::embedder::Embedder;
use super::index::VectorIndex;
use crate::documents::Category;
use crate::error::{AppResult, IndexError};

/// The loaded index, shared between the build pipeline and concurrent queries.
pub type SharedIndex = Arc<RwLock<Box<dyn VectorIndex>>>;

pub fn shared(index: Box<dyn VectorIndex>) -> SharedIndex {
    Arc::new(RwLock::new(index))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalOptions {
    pub k: usize,
    pub min_similarity: f32,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self { k: 5, min_similarity: 0.6 }
    }
}

/// A retrieved chunk as handed to the generator.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Evidence {
    pub chunk_id: String,
    pub similarity_score: f32,
    pub source_url: String,
    pub text: String,
    pub document_id: String,
    pub category: Category,
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: SharedIndex,
    defaults: RetrievalOptions,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: SharedIndex, defaults: RetrievalOptions) -> Self {
        Self { embedder, index, defaults }
    }

    pub fn defaults(&self) -> RetrievalOptions {
        self.defaults
    }

    /// Embed the question and return the evidence that clears the similarity floor.
    ///
    /// An empty result means the knowledge base cannot answer; it is not an error.
    pub async fn retrieve(&self, question: &str, options: Option<RetrievalOptions>) -> AppResult<Vec<Evidence>> {
        let opts = options.unwrap_or(self.defaults);
        let query = self.embedder.embed(question).await?;

        let hits = {
            let index = self.index.read().map_err(|e| IndexError::Storage(format!("index lock poisoned: {e}")))?;
            index.search(&query, opts.k, opts.min_similarity)?
        };

        if hits.is_empty() {
            tracing::info!(k = opts.k, min_similarity = opts.min_similarity, "no evidence cleared threshold");
        } else {
            tracing::debug!(hits = hits.len(), top = hits[0].score, "retrieved evidence");
        }

        Ok(hits
            .into_iter()
            .map(|h| Evidence {
                chunk_id: h.chunk_id,
                similarity_score: h.score,
                source_url: h.metadata.source_url,
                text: h.metadata.text,
                document_id: h.metadata.document_id,
                category: h.metadata.category,
            })
            .collect())
    }
}
