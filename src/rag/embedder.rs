use super::index::normalize;
use crate::error::EmbeddingError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use unicode_segmentation::UnicodeSegmentation;

/// A chunk's vector plus the model that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model_name: String,
    pub model_version: String,
}

/// Maps text to fixed-dimension vectors. Deterministic for a given model version.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn model_version(&self) -> &str;
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// One result per input, in input order. A failed item does not fail its neighbours.
    async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>, EmbeddingError>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await);
        }
        out
    }
}

// ─── Feature hashing ─────────────────────────────────────

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "has",
    "have", "how", "i", "in", "is", "it", "its", "me", "my", "of", "on", "or", "our", "so",
    "that", "the", "their", "there", "these", "this", "to", "was", "we", "were", "what", "when",
    "where", "which", "who", "why", "will", "with", "you", "your",
];

/// Offline embedder: signed SHA-256 feature hashing over lowercased word stems.
///
/// Needs no model download, so it backs tests and air-gapped installs. Similarity
/// tracks lexical overlap, not meaning.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub const MODEL_NAME: &'static str = "feature-hash";
    pub const MODEL_VERSION: &'static str = "hash-v1";

    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(1) }
    }

    fn features(text: &str) -> Vec<String> {
        let words: Vec<String> = text.unicode_words().map(|w| w.to_lowercase()).collect();
        let content: Vec<String> = words
            .iter()
            .filter(|w| !STOPWORDS.contains(&w.as_str()))
            .map(|w| stem(w))
            .collect();
        if !content.is_empty() {
            return content;
        }
        if !words.is_empty() {
            return words;
        }
        vec![text.trim().to_lowercase()]
    }

    fn embed_sync(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let mut v = vec![0.0f32; self.dimensions];
        for feature in Self::features(text) {
            let digest = Sha256::digest(feature.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        normalize(&mut v);
        Ok(v)
    }
}

fn stem(word: &str) -> String {
    if word.chars().count() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        Self::MODEL_NAME
    }

    fn model_version(&self) -> &str {
        Self::MODEL_VERSION
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_sync(text)
    }
}

// ─── Sidecar HTTP embedder ───────────────────────────────

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [&'a str],
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    vectors: Vec<Vec<f32>>,
    #[serde(default)]
    dimensions: Option<usize>,
}

/// Talks to a local sentence-transformer service: `POST {base}/embed`.
///
/// A batch goes out as one request, so a transport failure fails every item in it.
#[derive(Clone)]
pub struct SidecarEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    version: String,
    dimensions: usize,
}

impl SidecarEmbedder {
    pub fn new(
        base_url: &str,
        model: &str,
        version: &str,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/embed", base_url.trim_end_matches('/')),
            model: model.to_string(),
            version: version.to_string(),
            dimensions,
        })
    }

    async fn request(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = EmbedRequest { texts, model: &self.model };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::Unavailable(format!("HTTP {status}: {text}")));
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::BadResponse(e.to_string()))?;

        if parsed.vectors.len() != texts.len() {
            return Err(EmbeddingError::BadResponse(format!(
                "vector count mismatch: got {}, expected {}",
                parsed.vectors.len(),
                texts.len()
            )));
        }
        if let Some(dims) = parsed.dimensions {
            if parsed.vectors.iter().any(|v| v.len() != dims) {
                return Err(EmbeddingError::BadResponse(format!(
                    "vectors disagree with reported dimensions {dims}"
                )));
            }
        }
        Ok(parsed.vectors)
    }
}

#[async_trait]
impl Embedder for SidecarEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn model_version(&self) -> &str {
        &self.version
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let mut vectors = self.request(&[text]).await?;
        vectors.pop().ok_or_else(|| EmbeddingError::BadResponse("empty vector list".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>, EmbeddingError>> {
        let mut out: Vec<Result<Vec<f32>, EmbeddingError>> = texts
            .iter()
            .map(|t| if t.trim().is_empty() { Err(EmbeddingError::EmptyInput) } else { Ok(Vec::new()) })
            .collect();

        let pending: Vec<usize> = (0..texts.len()).filter(|&i| out[i].is_ok()).collect();
        if pending.is_empty() {
            return out;
        }

        let batch: Vec<&str> = pending.iter().map(|&i| texts[i].as_str()).collect();
        match self.request(&batch).await {
            Ok(vectors) => {
                for (i, v) in pending.into_iter().zip(vectors) {
                    out[i] = Ok(v);
                }
            }
            Err(e) => {
                tracing::warn!(items = pending.len(), error = %e, "embedding batch failed");
                for i in pending {
                    out[i] = Err(e.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_hashing_deterministic_and_normalized() {
        let e = HashingEmbedder::new(384);
        let a = e.embed("AIMS Cameroon offers a master's programme.").await.unwrap();
        let b = e.embed("AIMS Cameroon offers a master's programme.").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hashing_similarity_tracks_overlap() {
        let e = HashingEmbedder::new(384);
        let q = e.embed("Where is AIMS Cameroon located?").await.unwrap();
        let near = e.embed("AIMS Cameroon is located in Limbe.").await.unwrap();
        let far = e.embed("Tuition fees are payable each semester.").await.unwrap();
        assert!(cosine(&q, &near) > cosine(&q, &far));
        assert!(cosine(&q, &near) > 0.3);
    }

    #[tokio::test]
    async fn test_hashing_empty_input() {
        let e = HashingEmbedder::new(16);
        assert_eq!(e.embed("   ").await, Err(EmbeddingError::EmptyInput));
        // Stopwords only still produce a vector.
        assert!(e.embed("the of and").await.is_ok());
        assert!(e.embed("???").await.is_ok());
    }

    #[tokio::test]
    async fn test_default_batch_reports_per_item() {
        let e = HashingEmbedder::new(32);
        let results = e.embed_batch(&["alpha".into(), "".into(), "beta".into()]).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert_eq!(results[1], Err(EmbeddingError::EmptyInput));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn test_hashing_batch_matches_single_calls() {
        let e = HashingEmbedder::new(64);
        let texts: Vec<String> = vec![
            "AIMS Cameroon offers a structured master's programme.".into(),
            "".into(),
            "Applications close in March.".into(),
            "the of and".into(),
        ];
        let batch = e.embed_batch(&texts).await;
        assert_eq!(batch.len(), texts.len());
        for (text, result) in texts.iter().zip(&batch) {
            assert_eq!(result, &e.embed(text).await);
        }
    }

    #[test]
    fn test_stem() {
        assert_eq!(stem("programs"), "program");
        assert_eq!(stem("class"), "class");
        assert_eq!(stem("bus"), "bus");
    }

    const STUB_DIMS: usize = 16;

    #[derive(Deserialize)]
    struct StubRequest {
        texts: Vec<String>,
    }

    /// Serves `/embed` on an ephemeral port and returns the base URL.
    async fn stub_sidecar(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn embed_ok(axum::Json(req): axum::Json<StubRequest>) -> axum::Json<serde_json::Value> {
        let e = HashingEmbedder::new(STUB_DIMS);
        let vectors: Vec<Vec<f32>> = req.texts.iter().map(|t| e.embed_sync(t).unwrap()).collect();
        axum::Json(serde_json::json!({ "vectors": vectors, "dimensions": STUB_DIMS }))
    }

    async fn embed_down() -> (axum::http::StatusCode, &'static str) {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "model loading")
    }

    async fn embed_short(axum::Json(req): axum::Json<StubRequest>) -> axum::Json<serde_json::Value> {
        let vectors = vec![vec![0.5f32; STUB_DIMS]; req.texts.len().saturating_sub(1)];
        axum::Json(serde_json::json!({ "vectors": vectors }))
    }

    fn sidecar(base: &str) -> SidecarEmbedder {
        SidecarEmbedder::new(base, "all-MiniLM-L6-v2", "1", STUB_DIMS, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_sidecar_batch_matches_single_calls() {
        let base = stub_sidecar(axum::Router::new().route("/embed", axum::routing::post(embed_ok))).await;
        let e = sidecar(&base);
        let texts: Vec<String> = vec!["Admissions open in January.".into(), "  ".into(), "Scholarships cover tuition.".into()];

        let batch = e.embed_batch(&texts).await;
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[1], Err(EmbeddingError::EmptyInput));
        for (text, result) in texts.iter().zip(&batch) {
            assert_eq!(result, &e.embed(text).await);
        }
        assert_eq!(batch[0].as_ref().unwrap().len(), STUB_DIMS);
    }

    #[tokio::test]
    async fn test_sidecar_backend_failure_fails_whole_batch() {
        let base = stub_sidecar(axum::Router::new().route("/embed", axum::routing::post(embed_down))).await;
        let e = sidecar(&base);
        let results = e.embed_batch(&["alpha".into(), "".into(), "beta".into()]).await;
        assert!(matches!(&results[0], Err(EmbeddingError::Unavailable(msg)) if msg.contains("503")));
        assert_eq!(results[1], Err(EmbeddingError::EmptyInput));
        assert_eq!(results[0], results[2]);
        assert!(matches!(e.embed("alpha").await, Err(EmbeddingError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_sidecar_vector_count_mismatch() {
        let base = stub_sidecar(axum::Router::new().route("/embed", axum::routing::post(embed_short))).await;
        let e = sidecar(&base);
        let results = e.embed_batch(&["alpha".into(), "beta".into()]).await;
        assert!(results.iter().all(|r| matches!(r, Err(EmbeddingError::BadResponse(_)))));
    }

    #[tokio::test]
    async fn test_sidecar_unreachable() {
        let e = SidecarEmbedder::new("http://127.0.0.1:1", "all-MiniLM-L6-v2", "1", 384, Duration::from_secs(2)).unwrap();
        let results = e.embed_batch(&["hello".into(), " ".into(), "world".into()]).await;
        assert!(matches!(results[0], Err(EmbeddingError::Unavailable(_))));
        assert_eq!(results[1], Err(EmbeddingError::EmptyInput));
        assert!(matches!(results[2], Err(EmbeddingError::Unavailable(_))));
        assert_eq!(e.embed("").await, Err(EmbeddingError::EmptyInput));
    }
}
