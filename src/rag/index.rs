use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;

use super::chunker::Chunk;
use super::embedder::EmbeddingRecord;
use super::memory::MemoryIndex;
use super::sqlite::SqliteIndex;
use crate::config::VectorBackend;
use crate::documents::Category;
use crate::error::IndexError;

/// Chunk fields stored next to each vector so a hit can be cited without the document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub source_url: String,
    pub category: Category,
    pub text: String,
    pub token_count: usize,
    pub sequence_index: usize,
}

impl From<&Chunk> for ChunkMetadata {
    fn from(chunk: &Chunk) -> Self {
        Self {
            document_id: chunk.document_id.clone(),
            source_url: chunk.source_url.clone(),
            category: chunk.category,
            text: chunk.text.clone(),
            token_count: chunk.token_count,
            sequence_index: chunk.sequence_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Capability interface over vector storage backends.
///
/// Scores are cosine similarities. Results come back in descending score order;
/// equal scores keep insertion order, and re-upserting a chunk keeps its original position.
pub trait VectorIndex: Send + Sync {
    fn backend(&self) -> VectorBackend;
    fn dimensions(&self) -> usize;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record count that surfaces storage failures instead of reporting zero.
    fn count(&self) -> Result<usize, IndexError> {
        Ok(self.len())
    }

    fn upsert(&mut self, record: EmbeddingRecord, metadata: ChunkMetadata) -> Result<(), IndexError>;
    /// Returns whether the chunk was present.
    fn remove(&mut self, chunk_id: &str) -> Result<bool, IndexError>;
    fn search(&self, query: &[f32], k: usize, min_similarity: f32) -> Result<Vec<SearchHit>, IndexError>;
    /// Drop records produced by any other embedding model. Returns how many were removed.
    fn purge_stale(&mut self, model_name: &str, model_version: &str) -> Result<usize, IndexError>;
    /// Remove everything and adopt a new dimension.
    fn reset(&mut self, dimensions: usize) -> Result<(), IndexError>;

    fn clear(&mut self) -> Result<(), IndexError> {
        self.reset(self.dimensions())
    }

    fn save(&self) -> Result<(), IndexError>;
}

/// Load (or create) the configured backend at `path` for the given embedding model.
///
/// Stale records are purged. An index left empty adopts `dimensions`; a non-empty
/// index with a different dimension is a configuration error.
pub fn open_index(
    backend: VectorBackend,
    path: &Path,
    dimensions: usize,
    model_name: &str,
    model_version: &str,
) -> Result<Box<dyn VectorIndex>, IndexError> {
    let mut index: Box<dyn VectorIndex> = match backend {
        VectorBackend::InMemory => Box::new(MemoryIndex::open(path, dimensions)?),
        VectorBackend::Persistent => Box::new(SqliteIndex::open(&path.join("index.db"), dimensions)?),
    };

    let purged = index.purge_stale(model_name, model_version)?;
    if purged > 0 {
        tracing::warn!(purged, model = model_name, version = model_version, "purged stale embeddings");
    }

    if index.dimensions() != dimensions {
        if index.count()? > 0 {
            return Err(IndexError::DimensionMismatch { expected: index.dimensions(), actual: dimensions });
        }
        index.reset(dimensions)?;
    }

    tracing::debug!(backend = backend.as_str(), records = index.len(), dimensions, "vector index opened");
    Ok(index)
}

// ─── Shared math ─────────────────────────────────────────

/// L2 normalize in place. Zero vectors are left as they are.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Dot product. On pre-normalized vectors this is cosine similarity.
pub fn dot_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Validate and normalize an incoming vector against the index dimension.
pub(crate) fn prepare_vector(chunk_id: &str, vector: &[f32], dimensions: usize) -> Result<Vec<f32>, IndexError> {
    if vector.len() != dimensions {
        return Err(IndexError::DimensionMismatch { expected: dimensions, actual: vector.len() });
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(IndexError::NonFinite(chunk_id.to_string()));
    }
    let mut v = vector.to_vec();
    normalize(&mut v);
    Ok(v)
}

/// Min-heap entry for top-K selection.
#[derive(Debug)]
struct HeapEntry {
    score: f32,
    seq: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed on score so the weakest entry sits on top.
        // Equal scores: the later insertion is weaker.
        match other.score.partial_cmp(&self.score) {
            Some(Ordering::Equal) | None => self.seq.cmp(&other.seq),
            Some(ord) => ord,
        }
    }
}

/// Select the best `k` of `(insertion seq, score)` pairs that clear `min_similarity`.
/// Output is sorted by score descending, then insertion order.
pub(crate) fn top_k<I>(scored: I, k: usize, min_similarity: f32) -> Vec<(u64, f32)>
where
    I: IntoIterator<Item = (u64, f32)>,
{
    if k == 0 {
        return Vec::new();
    }
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(k + 1);
    for (seq, score) in scored {
        if !score.is_finite() || score < min_similarity {
            continue;
        }
        heap.push(HeapEntry { score, seq });
        if heap.len() > k {
            heap.pop();
        }
    }
    let mut results: Vec<(u64, f32)> = heap.into_iter().map(|e| (e.seq, e.score)).collect();
    results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
    results
}

/// Normalized copy of a query vector, checked against the index dimension.
pub(crate) fn prepare_query(query: &[f32], dimensions: usize) -> Result<Vec<f32>, IndexError> {
    if query.len() != dimensions {
        return Err(IndexError::DimensionMismatch { expected: dimensions, actual: query.len() });
    }
    let mut q = query.to_vec();
    normalize(&mut q);
    Ok(q)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn record(id: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            chunk_id: id.into(),
            vector,
            model_name: "test-model".into(),
            model_version: "1".into(),
        }
    }

    pub(crate) fn meta(doc: &str, text: &str) -> ChunkMetadata {
        ChunkMetadata {
            document_id: doc.into(),
            source_url: format!("https://aims-cameroon.org/{doc}"),
            category: Category::Admissions,
            text: text.into(),
            token_count: text.split_whitespace().count(),
            sequence_index: 0,
        }
    }

    /// Behaviour every backend must share.
    pub(crate) fn exercise_backend(index: &mut dyn VectorIndex) {
        assert!(index.is_empty());
        index.upsert(record("a", vec![1.0, 0.0, 0.0]), meta("d1", "alpha")).unwrap();
        index.upsert(record("b", vec![0.0, 2.0, 0.0]), meta("d1", "beta")).unwrap();
        index.upsert(record("c", vec![1.0, 1.0, 0.0]), meta("d2", "gamma")).unwrap();
        index.upsert(record("tie", vec![3.0, 0.0, 0.0]), meta("d2", "same direction as a")).unwrap();
        assert_eq!(index.len(), 4);

        // Identical vector comes back first with similarity ~1.
        let hits = index.search(&[0.0, 1.0, 0.0], 2, -1.0).unwrap();
        assert_eq!(hits[0].chunk_id, "b");
        assert!((hits[0].score - 1.0).abs() < 1e-5);

        // Ties keep insertion order.
        let hits = index.search(&[1.0, 0.0, 0.0], 10, 0.0).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "tie", "c", "b"]);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }

        // Threshold filters, fewer than k is fine.
        let hits = index.search(&[1.0, 0.0, 0.0], 10, 0.9).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.score >= 0.9));

        // Re-upsert keeps position, replaces content.
        index.upsert(record("a", vec![2.0, 0.0, 0.0]), meta("d1", "alpha v2")).unwrap();
        let hits = index.search(&[1.0, 0.0, 0.0], 2, 0.0).unwrap();
        assert_eq!(hits[0].chunk_id, "a");
        assert_eq!(hits[0].metadata.text, "alpha v2");
        assert_eq!(hits[1].chunk_id, "tie");
        assert_eq!(index.len(), 4);

        let err = index.upsert(record("bad", vec![1.0, 0.0]), meta("d3", "short")).unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { expected: 3, actual: 2 }));
        let err = index.upsert(record("nan", vec![f32::NAN, 0.0, 0.0]), meta("d3", "nan")).unwrap_err();
        assert!(matches!(err, IndexError::NonFinite(_)));
        assert!(matches!(index.search(&[1.0], 3, 0.0), Err(IndexError::DimensionMismatch { .. })));

        assert!(index.remove("tie").unwrap());
        assert!(!index.remove("tie").unwrap());
        assert_eq!(index.len(), 3);
        assert!(index.search(&[1.0, 0.0, 0.0], 0, 0.0).unwrap().is_empty());

        let mut stale = record("old", vec![0.0, 0.0, 1.0]);
        stale.model_version = "0".into();
        index.upsert(stale, meta("d4", "old model")).unwrap();
        assert_eq!(index.purge_stale("test-model", "1").unwrap(), 1);
        assert_eq!(index.len(), 3);

        index.clear().unwrap();
        assert!(index.is_empty());
        assert!(index.search(&[1.0, 0.0, 0.0], 5, -1.0).unwrap().is_empty());
    }

    #[test]
    fn test_top_k_ordering_and_ties() {
        let scored = vec![(0, 0.5), (1, 0.9), (2, 0.5), (3, f32::NAN), (4, 0.1), (5, 0.9)];
        assert_eq!(top_k(scored.clone(), 3, 0.0), vec![(1, 0.9), (5, 0.9), (0, 0.5)]);
        assert_eq!(top_k(scored.clone(), 10, 0.2), vec![(1, 0.9), (5, 0.9), (0, 0.5), (2, 0.5)]);
        assert!(top_k(scored, 0, 0.0).is_empty());
    }

    #[test]
    fn test_normalize_and_dot() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((dot_similarity(&v, &v) - 1.0).abs() < 1e-6);
        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_open_index_purges_and_adopts_dimensions() {
        let dir = TempDir::new().unwrap();
        for backend in [VectorBackend::InMemory, VectorBackend::Persistent] {
            let path = dir.path().join(backend.as_str());
            {
                let mut index = open_index(backend, &path, 3, "test-model", "1").unwrap();
                index.upsert(record("a", vec![1.0, 0.0, 0.0]), meta("d1", "alpha")).unwrap();
                index.save().unwrap();
            }

            let reopened = open_index(backend, &path, 3, "test-model", "1").unwrap();
            assert_eq!(reopened.len(), 1);
            drop(reopened);

            let err = open_index(backend, &path, 4, "test-model", "1").err().unwrap();
            assert!(matches!(err, IndexError::DimensionMismatch { expected: 3, actual: 4 }));

            // A different model makes every record stale, so the new dimension is adopted.
            let fresh = open_index(backend, &path, 4, "other-model", "2").unwrap();
            assert!(fresh.is_empty());
            assert_eq!(fresh.dimensions(), 4);
        }
    }
}
