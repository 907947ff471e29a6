// ============================================
// PIPELINE - knowledge base context object
// build_index / query / full / stats
// ============================================

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::answers::AnswerLog;
use crate::config::{EmbeddingBackend, Settings, VectorBackend};
use crate::db::Database;
use crate::documents::{supersede, Document, DocumentStore};
use crate::error::{AppError, AppResult, IndexError};
use crate::rag::retriever::shared;
use crate::rag::{
    chunk_document, open_index, Answer, ChunkMetadata, ChunkerConfig, Embedder, EmbeddingRecord,
    GroundedGenerator, HashingEmbedder, LanguageModel, OpenAiCompatibleModel, RetrievalOptions, Retriever,
    SharedIndex, SidecarEmbedder,
};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DocumentFailure {
    pub document_id: String,
    pub reason: String,
}

/// Outcome of a build. Per-document failures are collected here instead of aborting.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct IndexSummary {
    pub succeeded: usize,
    /// Documents the chunker rejected or the store could not read.
    pub skipped: usize,
    /// Documents whose chunks could not be embedded.
    pub failed: usize,
    pub chunks_indexed: usize,
    pub failures: Vec<DocumentFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub backend: VectorBackend,
    pub model_name: String,
    pub model_version: String,
    pub dimensions: usize,
    pub records: usize,
    pub answers_logged: Option<usize>,
}

enum Prepared {
    Ready { document_id: String, items: Vec<(EmbeddingRecord, ChunkMetadata)> },
    Skipped(DocumentFailure),
    Failed(DocumentFailure),
}

pub fn build_embedder(settings: &Settings) -> AppResult<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match settings.embedding_backend {
        EmbeddingBackend::Hashing => Arc::new(HashingEmbedder::new(settings.embedding_dimensions)),
        EmbeddingBackend::Sidecar => Arc::new(SidecarEmbedder::new(
            &settings.embedding_url,
            &settings.embedding_model_name,
            &settings.embedding_model_version,
            settings.embedding_dimensions,
            Duration::from_secs(settings.embedding_timeout_seconds),
        )?),
    };
    Ok(embedder)
}

/// Chunk and embed one document. No index access, so documents can run in parallel.
async fn prepare(doc: Document, chunker: ChunkerConfig, embedder: Arc<dyn Embedder>) -> Prepared {
    let chunks = match chunk_document(&doc, &chunker) {
        Ok(chunks) => chunks,
        Err(e) => {
            return Prepared::Skipped(DocumentFailure { document_id: doc.id, reason: e.to_string() });
        }
    };
    tracing::debug!(document = %doc.id, chunks = chunks.len(), "chunked document");

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embedder.embed_batch(&texts).await;

    let mut items = Vec::with_capacity(chunks.len());
    for (chunk, vector) in chunks.iter().zip(vectors) {
        match vector {
            Ok(vector) => items.push((
                EmbeddingRecord {
                    chunk_id: chunk.id.clone(),
                    vector,
                    model_name: embedder.model_name().to_string(),
                    model_version: embedder.model_version().to_string(),
                },
                ChunkMetadata::from(chunk),
            )),
            Err(e) => {
                return Prepared::Failed(DocumentFailure {
                    document_id: doc.id,
                    reason: format!("chunk {}: {e}", chunk.id),
                });
            }
        }
    }
    if items.len() != chunks.len() {
        return Prepared::Failed(DocumentFailure {
            document_id: doc.id,
            reason: format!("embedder returned {} vectors for {} chunks", items.len(), chunks.len()),
        });
    }
    Prepared::Ready { document_id: doc.id, items }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> AppError {
    IndexError::Storage(format!("index lock poisoned: {e}")).into()
}

/// Explicitly constructed owner of every pipeline component.
pub struct KnowledgeBase {
    settings: Settings,
    chunker: ChunkerConfig,
    embedder: Arc<dyn Embedder>,
    index: SharedIndex,
    retriever: Retriever,
    generator: GroundedGenerator,
    answers: Option<AnswerLog>,
}

impl KnowledgeBase {
    /// Build every component from configuration.
    pub fn open(settings: Settings) -> AppResult<Self> {
        settings.validate()?;
        let embedder = build_embedder(&settings)?;
        let model: Arc<dyn LanguageModel> = Arc::new(OpenAiCompatibleModel::from_settings(&settings)?);
        Self::from_parts(settings, embedder, model)
    }

    /// Assemble around injected embedder and language model.
    pub fn from_parts(
        settings: Settings,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn LanguageModel>,
    ) -> AppResult<Self> {
        let index = open_index(
            settings.vector_backend,
            &settings.vector_db_path(),
            embedder.dimensions(),
            embedder.model_name(),
            embedder.model_version(),
        )?;
        let index = shared(index);

        let answers = if settings.record_answers {
            Some(AnswerLog::new(Database::open(&settings.database_path()).map_err(AppError::Db)?))
        } else {
            None
        };

        let chunker = ChunkerConfig {
            min_tokens: settings.chunk_min_tokens,
            max_tokens: settings.chunk_max_tokens,
            overlap_tokens: settings.chunk_overlap_tokens,
        };
        let retriever = Retriever::new(
            embedder.clone(),
            index.clone(),
            RetrievalOptions { k: settings.retrieval_k, min_similarity: settings.retrieval_min_similarity },
        );
        let generator = GroundedGenerator::from_settings(model, &settings);

        tracing::info!(
            backend = settings.vector_backend.as_str(),
            model = embedder.model_name(),
            llm = %settings.llm_model_name,
            "knowledge base ready"
        );

        Ok(Self { settings, chunker, embedder, index, retriever, generator, answers })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Full rebuild from `documents`.
    ///
    /// Chunking and embedding run with bounded concurrency; upserts are applied one
    /// document at a time in input order. A dimension mismatch aborts the build.
    pub async fn build_index(&self, documents: Vec<Document>) -> AppResult<IndexSummary> {
        let documents = supersede(documents);
        tracing::info!(documents = documents.len(), "building index");

        self.index.write().map_err(poisoned)?.clear()?;

        let chunker = self.chunker;
        let embedder = self.embedder.clone();
        let mut prepared = stream::iter(documents.into_iter().map(move |doc| prepare(doc, chunker, embedder.clone())))
            .buffered(self.settings.index_concurrency.max(1));

        let mut summary = IndexSummary::default();
        while let Some(outcome) = prepared.next().await {
            match outcome {
                Prepared::Ready { document_id, items } => {
                    let n = items.len();
                    {
                        let mut index = self.index.write().map_err(poisoned)?;
                        for (record, metadata) in items {
                            index.upsert(record, metadata)?;
                        }
                    }
                    tracing::debug!(document = %document_id, chunks = n, "indexed document");
                    summary.succeeded += 1;
                    summary.chunks_indexed += n;
                }
                Prepared::Skipped(failure) => {
                    tracing::warn!(document = %failure.document_id, reason = %failure.reason, "skipping document");
                    summary.skipped += 1;
                    summary.failures.push(failure);
                }
                Prepared::Failed(failure) => {
                    tracing::warn!(document = %failure.document_id, reason = %failure.reason, "failed to embed document");
                    summary.failed += 1;
                    summary.failures.push(failure);
                }
            }
        }

        self.index.read().map_err(poisoned)?.save()?;
        tracing::info!(
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            chunks = summary.chunks_indexed,
            "index build finished"
        );
        Ok(summary)
    }

    pub async fn query(&self, question: &str) -> AppResult<Answer> {
        self.query_with(question, None).await
    }

    /// Retrieve then generate. Missing evidence yields an ungrounded answer, not an error.
    pub async fn query_with(&self, question: &str, options: Option<RetrievalOptions>) -> AppResult<Answer> {
        let evidence = self.retriever.retrieve(question, options).await?;
        let answer = self.generator.answer(question, &evidence).await?;

        if let Some(log) = &self.answers {
            if let Err(e) = log.record(&answer) {
                tracing::warn!(error = %e, "failed to record answer");
            }
        }
        tracing::info!(grounded = answer.grounded, citations = answer.citations.len(), "answered query");
        Ok(answer)
    }

    /// Rebuild from every record in `store`. Unreadable records count as skipped.
    pub async fn build_from_store(&self, store: &DocumentStore) -> AppResult<IndexSummary> {
        let (documents, errors) = store.load_all();
        tracing::info!(source = %store.base().display(), documents = documents.len(), unreadable = errors.len(), "loaded document store");
        let mut summary = self.build_index(documents).await?;
        for e in errors {
            summary.skipped += 1;
            summary.failures.push(DocumentFailure { document_id: String::new(), reason: e.to_string() });
        }
        Ok(summary)
    }

    /// Index the crawler's output directory, then answer `question`.
    pub async fn full(&self, store: &DocumentStore, question: &str) -> AppResult<(IndexSummary, Answer)> {
        let summary = self.build_from_store(store).await?;
        let answer = self.query(question).await?;
        Ok((summary, answer))
    }

    pub fn stats(&self) -> AppResult<IndexStats> {
        let index = self.index.read().map_err(poisoned)?;
        let answers_logged = match &self.answers {
            Some(log) => Some(log.count()?),
            None => None,
        };
        Ok(IndexStats {
            backend: index.backend(),
            model_name: self.embedder.model_name().to_string(),
            model_version: self.embedder.model_version().to_string(),
            dimensions: index.dimensions(),
            records: index.len(),
            answers_logged,
        })
    }

    /// Logged answers, most recent first. Empty when answer recording is off.
    pub fn recent_answers(&self, limit: usize) -> AppResult<Vec<Answer>> {
        match &self.answers {
            Some(log) => log.recent(limit),
            None => Ok(Vec::new()),
        }
    }

    /// Persist the index and release the components.
    pub fn close(self) -> AppResult<()> {
        self.index.read().map_err(poisoned)?.save()?;
        tracing::debug!("knowledge base closed");
        Ok(())
    }
}
