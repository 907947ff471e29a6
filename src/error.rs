use std::sync::{MutexGuard, PoisonError};
use rusqlite::Connection;
use thiserror::Error;

/// Raised by the chunker for input it cannot treat as text. Never raised for length alone.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChunkingError {
    #[error("document {doc_id}: text contains {what} at byte {offset}")]
    Malformed { doc_id: String, what: &'static str, offset: usize },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("cannot embed empty text")]
    EmptyInput,
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),
    #[error("embedding backend returned a bad response: {0}")]
    BadResponse(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("vector for chunk {0} contains non-finite values")]
    NonFinite(String),
    #[error("index storage error: {0}")]
    Storage(String),
    #[error("corrupt index: {0}")]
    Corrupt(String),
}

/// Failure of a single language-model call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LlmError {
    #[error("language model call timed out after {0}s")]
    Timeout(u64),
    #[error("language model rate limited: {0}")]
    RateLimited(String),
    #[error("language model returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("language model transport error: {0}")]
    Transport(String),
    #[error("malformed language model response: {0}")]
    Malformed(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout(_)
            | LlmError::RateLimited(_)
            | LlmError::Transport(_)
            | LlmError::Malformed(_) => true,
            LlmError::Http { status, .. } => *status >= 500,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerationError {
    #[error("generation failed after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: LlmError },
    #[error("generation failed: {0}")]
    Fatal(LlmError),
}

#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to write {path}: {reason}")]
    Write { path: String, reason: String },
    #[error("invalid document {path}: {reason}")]
    InvalidDocument { path: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Chunking(#[from] ChunkingError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Database error: {0}")]
    Db(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Process exit status for an error that reaches the entry point.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) => 2,
            AppError::Generation(_) => 3,
            AppError::Chunking(_) => 4,
            AppError::Embedding(_) => 5,
            AppError::Index(_) => 6,
            AppError::Storage(_) | AppError::Db(_) | AppError::Internal(_) => 1,
        }
    }

    pub fn is_dimension_mismatch(&self) -> bool {
        matches!(self, AppError::Index(IndexError::DimensionMismatch { .. }))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Db(e.to_string())
    }
}

impl From<PoisonError<MutexGuard<'_, Connection>>> for AppError {
    fn from(e: PoisonError<MutexGuard<'_, Connection>>) -> Self {
        AppError::Db(format!("Lock poisoned: {e}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<rusqlite::Error> for IndexError {
    fn from(e: rusqlite::Error) -> Self {
        IndexError::Storage(e.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
