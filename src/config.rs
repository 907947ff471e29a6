// ============================================
// CONFIG - sitekb.toml + SITEKB_* overrides
// ============================================

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "sitekb.toml";
const ENV_PREFIX: &str = "SITEKB_";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingBackend {
    Hashing,
    Sidecar,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum VectorBackend {
    InMemory,
    Persistent,
}

impl EmbeddingBackend {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hashing" | "hash" => Some(Self::Hashing),
            "sidecar" | "sentence-transformers" => Some(Self::Sidecar),
            _ => None,
        }
    }
}

impl VectorBackend {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in-memory" | "memory" | "faiss" => Some(Self::InMemory),
            "persistent" | "sqlite" | "chroma" => Some(Self::Persistent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InMemory => "in-memory",
            Self::Persistent => "persistent",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub documents_dir: Option<PathBuf>,
    pub vector_db_path: Option<PathBuf>,

    pub chunk_min_tokens: usize,
    pub chunk_max_tokens: usize,
    pub chunk_overlap_tokens: usize,

    pub embedding_backend: EmbeddingBackend,
    pub embedding_model_name: String,
    pub embedding_model_version: String,
    pub embedding_dimensions: usize,
    pub embedding_url: String,
    pub embedding_timeout_seconds: u64,

    pub vector_backend: VectorBackend,
    pub retrieval_k: usize,
    pub retrieval_min_similarity: f32,

    pub llm_model_name: String,
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_http_referer: String,
    pub llm_app_title: String,
    pub llm_temperature: f32,
    pub llm_retry_count: u32,
    pub llm_timeout_seconds: u64,
    pub llm_backoff_base_ms: u64,

    pub index_concurrency: usize,
    pub record_answers: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".sitekb"))
            .unwrap_or_else(|| PathBuf::from(".sitekb"));
        Self {
            data_dir,
            documents_dir: None,
            vector_db_path: None,
            chunk_min_tokens: 50,
            chunk_max_tokens: 400,
            chunk_overlap_tokens: 75,
            embedding_backend: EmbeddingBackend::Sidecar,
            embedding_model_name: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            embedding_model_version: "1".to_string(),
            embedding_dimensions: 384,
            embedding_url: "http://127.0.0.1:8765".to_string(),
            embedding_timeout_seconds: 30,
            vector_backend: VectorBackend::InMemory,
            retrieval_k: 5,
            retrieval_min_similarity: 0.6,
            llm_model_name: "mistralai/mistral-7b-instruct".to_string(),
            llm_base_url: "https://openrouter.ai/api/v1".to_string(),
            llm_api_key: String::new(),
            llm_http_referer: String::new(),
            llm_app_title: String::new(),
            llm_temperature: 0.0,
            llm_retry_count: 3,
            llm_timeout_seconds: 60,
            llm_backoff_base_ms: 500,
            index_concurrency: 4,
            record_answers: true,
        }
    }
}

impl Settings {
    /// Resolve settings: explicit file, else `./sitekb.toml` if present, else defaults;
    /// then environment overrides; then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
            .map_err(|e| ConfigError(format!("{}: {}", path.display(), e.0)))
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError(e.to_string()))
    }

    /// Apply `SITEKB_<FIELD>` overrides. `lookup` abstracts the environment for tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |field: &str| lookup(&format!("{ENV_PREFIX}{}", field.to_ascii_uppercase()));

        if let Some(v) = get("data_dir") { self.data_dir = PathBuf::from(v); }
        if let Some(v) = get("documents_dir") { self.documents_dir = Some(PathBuf::from(v)); }
        if let Some(v) = get("vector_db_path") { self.vector_db_path = Some(PathBuf::from(v)); }

        if let Some(v) = get("chunk_min_tokens") { self.chunk_min_tokens = parse_num("chunk_min_tokens", &v)?; }
        if let Some(v) = get("chunk_max_tokens") { self.chunk_max_tokens = parse_num("chunk_max_tokens", &v)?; }
        if let Some(v) = get("chunk_overlap_tokens") { self.chunk_overlap_tokens = parse_num("chunk_overlap_tokens", &v)?; }

        if let Some(v) = get("embedding_backend") {
            self.embedding_backend = EmbeddingBackend::from_str(&v)
                .ok_or_else(|| ConfigError(format!("unknown embedding_backend '{v}'")))?;
        }
        if let Some(v) = get("embedding_model_name") { self.embedding_model_name = v; }
        if let Some(v) = get("embedding_model_version") { self.embedding_model_version = v; }
        if let Some(v) = get("embedding_dimensions") { self.embedding_dimensions = parse_num("embedding_dimensions", &v)?; }
        if let Some(v) = get("embedding_url") { self.embedding_url = v; }
        if let Some(v) = get("embedding_timeout_seconds") { self.embedding_timeout_seconds = parse_num("embedding_timeout_seconds", &v)?; }

        if let Some(v) = get("vector_backend") {
            self.vector_backend = VectorBackend::from_str(&v)
                .ok_or_else(|| ConfigError(format!("unknown vector_backend '{v}'")))?;
        }
        if let Some(v) = get("retrieval_k") { self.retrieval_k = parse_num("retrieval_k", &v)?; }
        if let Some(v) = get("retrieval_min_similarity") { self.retrieval_min_similarity = parse_num("retrieval_min_similarity", &v)?; }

        if let Some(v) = get("llm_model_name") { self.llm_model_name = v; }
        if let Some(v) = get("llm_base_url") { self.llm_base_url = v; }
        if let Some(v) = get("llm_api_key").or_else(|| lookup("OPENROUTER_API_KEY")) { self.llm_api_key = v; }
        if let Some(v) = get("llm_http_referer") { self.llm_http_referer = v; }
        if let Some(v) = get("llm_app_title") { self.llm_app_title = v; }
        if let Some(v) = get("llm_temperature") { self.llm_temperature = parse_num("llm_temperature", &v)?; }
        if let Some(v) = get("llm_retry_count") { self.llm_retry_count = parse_num("llm_retry_count", &v)?; }
        if let Some(v) = get("llm_timeout_seconds") { self.llm_timeout_seconds = parse_num("llm_timeout_seconds", &v)?; }
        if let Some(v) = get("llm_backoff_base_ms") { self.llm_backoff_base_ms = parse_num("llm_backoff_base_ms", &v)?; }

        if let Some(v) = get("index_concurrency") { self.index_concurrency = parse_num("index_concurrency", &v)?; }
        if let Some(v) = get("record_answers") {
            self.record_answers = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_min_tokens == 0 {
            return Err(ConfigError("chunk_min_tokens must be at least 1".into()));
        }
        if self.chunk_min_tokens > self.chunk_max_tokens {
            return Err(ConfigError(format!(
                "chunk_min_tokens ({}) exceeds chunk_max_tokens ({})",
                self.chunk_min_tokens, self.chunk_max_tokens
            )));
        }
        if self.chunk_overlap_tokens >= self.chunk_max_tokens {
            return Err(ConfigError(format!(
                "chunk_overlap_tokens ({}) must be below chunk_max_tokens ({})",
                self.chunk_overlap_tokens, self.chunk_max_tokens
            )));
        }
        if self.retrieval_k == 0 {
            return Err(ConfigError("retrieval_k must be at least 1".into()));
        }
        if !(-1.0..=1.0).contains(&self.retrieval_min_similarity) {
            return Err(ConfigError(format!(
                "retrieval_min_similarity {} is outside [-1, 1]",
                self.retrieval_min_similarity
            )));
        }
        if self.index_concurrency == 0 {
            return Err(ConfigError("index_concurrency must be at least 1".into()));
        }
        if self.embedding_dimensions == 0 {
            return Err(ConfigError("embedding_dimensions must be at least 1".into()));
        }
        Ok(())
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.documents_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("documents"))
    }

    pub fn vector_db_path(&self) -> PathBuf {
        self.vector_db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("vector_db"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("sitekb.db")
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_seconds)
    }

    pub fn llm_backoff_base(&self) -> Duration {
        Duration::from_millis(self.llm_backoff_base_ms)
    }
}

fn parse_num<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError(format!("{ENV_PREFIX}{} has invalid value '{raw}'", field.to_ascii_uppercase())))
}
