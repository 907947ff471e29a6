pub mod chunker;
pub mod embedder;
pub mod format;
pub mod generator;
pub mod index;
pub mod llm;
pub mod memory;
pub mod retriever;
pub mod sqlite;

pub use chunker::{chunk_document, chunk_text, count_tokens, Chunk, ChunkerConfig};
pub use embedder::{Embedder, EmbeddingRecord, HashingEmbedder, SidecarEmbedder};
pub use format::format_context_with_citations;
pub use generator::{Answer, GroundedGenerator, RetryPolicy, TraceEntry, UNAVAILABLE_TEXT};
pub use index::{open_index, ChunkMetadata, SearchHit, VectorIndex};
pub use llm::{CompletionRequest, LanguageModel, OpenAiCompatibleModel};
pub use memory::MemoryIndex;
pub use retriever::{Evidence, RetrievalOptions, Retriever, SharedIndex};
pub use sqlite::SqliteIndex;
