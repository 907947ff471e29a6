// ============================================
// SITEKB - SOURCE-GROUNDED KNOWLEDGE BASE
// Chunk, embed, index and answer from crawled pages
// ============================================

pub mod answers;
pub mod config;
pub mod db;
pub mod documents;
pub mod error;
pub mod pipeline;
pub mod rag;

pub use config::Settings;
pub use documents::{Category, Document, DocumentStore};
pub use error::{AppError, AppResult};
pub use pipeline::{IndexStats, IndexSummary, KnowledgeBase};
pub use rag::{Answer, RetrievalOptions};
