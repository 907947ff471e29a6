use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::embedder::EmbeddingRecord;
use super::index::{dot_similarity, prepare_query, prepare_vector, top_k, ChunkMetadata, SearchHit, VectorIndex};
use crate::config::VectorBackend;
use crate::db::now_iso;
use crate::error::IndexError;

const VECTORS_MAGIC: u32 = 0x52414756; // "RAGV"
const VECTORS_VERSION: u32 = 1;
const FORMAT_VERSION: u32 = 1;
const INDEX_FILES: [&str; 3] = ["meta.json", "chunks.jsonl", "vectors.bin"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMeta {
    pub version: u32,
    pub backend: String,
    pub model_name: String,
    pub model_version: String,
    pub dimensions: usize,
    pub chunk_count: usize,
    pub last_indexed: String,
}

/// One line of chunks.jsonl.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredChunk {
    chunk_id: String,
    model_name: String,
    model_version: String,
    #[serde(flatten)]
    metadata: ChunkMetadata,
}

#[derive(Debug, Clone)]
struct Entry {
    chunk_id: String,
    vector: Vec<f32>,
    model_name: String,
    model_version: String,
    metadata: ChunkMetadata,
}

/// Exact-search index held in memory, optionally persisted to a directory.
pub struct MemoryIndex {
    dir: Option<PathBuf>,
    dimensions: usize,
    entries: BTreeMap<u64, Entry>,
    by_id: HashMap<String, u64>,
    next_seq: u64,
}

impl MemoryIndex {
    /// Purely in-memory index; `save` is a no-op.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dir: None,
            dimensions,
            entries: BTreeMap::new(),
            by_id: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Load the index saved under `dir`, or start an empty one that will save there.
    pub fn open(dir: &Path, dimensions: usize) -> Result<Self, IndexError> {
        let mut index = Self::new(dimensions);
        index.dir = Some(dir.to_path_buf());
        if !dir.join("meta.json").exists() {
            return Ok(index);
        }

        let (meta, entries) = read_index(dir)?;
        index.dimensions = meta.dimensions;
        for entry in entries {
            index.insert_new(entry);
        }
        tracing::info!(path = %dir.display(), records = index.len(), "loaded vector index");
        Ok(index)
    }

    fn insert_new(&mut self, entry: Entry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_id.insert(entry.chunk_id.clone(), seq);
        self.entries.insert(seq, entry);
    }
}

impl VectorIndex for MemoryIndex {
    fn backend(&self) -> VectorBackend {
        VectorBackend::InMemory
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn upsert(&mut self, record: EmbeddingRecord, metadata: ChunkMetadata) -> Result<(), IndexError> {
        let vector = prepare_vector(&record.chunk_id, &record.vector, self.dimensions)?;
        let entry = Entry {
            chunk_id: record.chunk_id,
            vector,
            model_name: record.model_name,
            model_version: record.model_version,
            metadata,
        };
        match self.by_id.get(&entry.chunk_id) {
            Some(seq) => {
                self.entries.insert(*seq, entry);
            }
            None => self.insert_new(entry),
        }
        Ok(())
    }

    fn remove(&mut self, chunk_id: &str) -> Result<bool, IndexError> {
        Ok(match self.by_id.remove(chunk_id) {
            Some(seq) => self.entries.remove(&seq).is_some(),
            None => false,
        })
    }

    fn search(&self, query: &[f32], k: usize, min_similarity: f32) -> Result<Vec<SearchHit>, IndexError> {
        let q = prepare_query(query, self.dimensions)?;
        let scored = self.entries.iter().map(|(seq, e)| (*seq, dot_similarity(&q, &e.vector)));
        Ok(top_k(scored, k, min_similarity)
            .into_iter()
            .filter_map(|(seq, score)| {
                self.entries.get(&seq).map(|e| SearchHit {
                    chunk_id: e.chunk_id.clone(),
                    score,
                    metadata: e.metadata.clone(),
                })
            })
            .collect())
    }

    fn purge_stale(&mut self, model_name: &str, model_version: &str) -> Result<usize, IndexError> {
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.model_name != model_name || e.model_version != model_version)
            .map(|e| e.chunk_id.clone())
            .collect();
        for id in &stale {
            self.remove(id)?;
        }
        Ok(stale.len())
    }

    fn reset(&mut self, dimensions: usize) -> Result<(), IndexError> {
        self.entries.clear();
        self.by_id.clear();
        self.next_seq = 0;
        self.dimensions = dimensions;
        Ok(())
    }

    fn save(&self) -> Result<(), IndexError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let entries: Vec<&Entry> = self.entries.values().collect();
        let (model_name, model_version) = entries
            .first()
            .map(|e| (e.model_name.clone(), e.model_version.clone()))
            .unwrap_or_default();
        let meta = IndexMeta {
            version: FORMAT_VERSION,
            backend: VectorBackend::InMemory.as_str().to_string(),
            model_name,
            model_version,
            dimensions: self.dimensions,
            chunk_count: entries.len(),
            last_indexed: now_iso(),
        };
        write_index(dir, &entries, &meta)?;
        tracing::info!(path = %dir.display(), records = entries.len(), "saved vector index");
        Ok(())
    }
}

fn storage<E: std::fmt::Display>(what: &str) -> impl FnOnce(E) -> IndexError + '_ {
    move |e| IndexError::Storage(format!("{what}: {e}"))
}

/// Write meta.json, chunks.jsonl and vectors.bin into a temp dir, then swap them in
/// under an exclusive lock.
fn write_index(dir: &Path, entries: &[&Entry], meta: &IndexMeta) -> Result<(), IndexError> {
    use fs2::FileExt;

    std::fs::create_dir_all(dir).map_err(storage("failed to create index dir"))?;

    let lock_file = std::fs::File::create(dir.join(".lock")).map_err(storage("failed to create lock file"))?;
    lock_file.lock_exclusive().map_err(storage("failed to acquire lock"))?;

    let temp_dir = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&temp_dir).map_err(storage("failed to create temp dir"))?;

    let result = write_files(&temp_dir, entries, meta).and_then(|()| {
        for name in INDEX_FILES {
            std::fs::rename(temp_dir.join(name), dir.join(name))
                .map_err(|e| IndexError::Storage(format!("failed to move {name}: {e}")))?;
        }
        Ok(())
    });

    let _ = std::fs::remove_dir_all(&temp_dir);
    let _ = lock_file.unlock();
    result
}

fn write_files(dir: &Path, entries: &[&Entry], meta: &IndexMeta) -> Result<(), IndexError> {
    let meta_json = serde_json::to_string_pretty(meta).map_err(storage("failed to serialize meta"))?;
    std::fs::write(dir.join("meta.json"), meta_json).map_err(storage("failed to write meta.json"))?;

    let mut chunks_file = std::io::BufWriter::new(
        std::fs::File::create(dir.join("chunks.jsonl")).map_err(storage("failed to create chunks.jsonl"))?,
    );
    for entry in entries {
        let stored = StoredChunk {
            chunk_id: entry.chunk_id.clone(),
            model_name: entry.model_name.clone(),
            model_version: entry.model_version.clone(),
            metadata: entry.metadata.clone(),
        };
        let line = serde_json::to_string(&stored).map_err(storage("failed to serialize chunk"))?;
        writeln!(chunks_file, "{line}").map_err(storage("failed to write chunk"))?;
    }
    chunks_file.flush().map_err(storage("failed to flush chunks.jsonl"))?;

    // vectors.bin: magic(u32) + version(u32) + dims(u32) + count(u32) + f32[]
    let mut data = Vec::with_capacity(16 + entries.len() * meta.dimensions * 4);
    data.extend_from_slice(&VECTORS_MAGIC.to_le_bytes());
    data.extend_from_slice(&VECTORS_VERSION.to_le_bytes());
    data.extend_from_slice(&(meta.dimensions as u32).to_le_bytes());
    data.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        for &val in &entry.vector {
            data.extend_from_slice(&val.to_le_bytes());
        }
    }
    std::fs::write(dir.join("vectors.bin"), data).map_err(storage("failed to write vectors.bin"))?;
    Ok(())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_index(dir: &Path) -> Result<(IndexMeta, Vec<Entry>), IndexError> {
    use fs2::FileExt;

    let lock = match std::fs::File::open(dir.join(".lock")) {
        Ok(f) => {
            f.lock_shared().map_err(storage("failed to acquire shared lock"))?;
            Some(f)
        }
        Err(_) => None,
    };

    let meta_json = std::fs::read_to_string(dir.join("meta.json")).map_err(storage("failed to read meta.json"))?;
    let meta: IndexMeta =
        serde_json::from_str(&meta_json).map_err(|e| IndexError::Corrupt(format!("meta.json: {e}")))?;
    if meta.version != FORMAT_VERSION {
        return Err(IndexError::Corrupt(format!("unsupported index format version {}", meta.version)));
    }

    let chunks_file = std::fs::File::open(dir.join("chunks.jsonl")).map_err(storage("failed to open chunks.jsonl"))?;
    let mut stored = Vec::with_capacity(meta.chunk_count);
    for (n, line) in BufReader::new(chunks_file).lines().enumerate() {
        let line = line.map_err(storage("failed to read chunks.jsonl"))?;
        if line.trim().is_empty() {
            continue;
        }
        let chunk: StoredChunk = serde_json::from_str(&line)
            .map_err(|e| IndexError::Corrupt(format!("chunks.jsonl line {}: {e}", n + 1)))?;
        stored.push(chunk);
    }

    let vectors_file = std::fs::File::open(dir.join("vectors.bin")).map_err(storage("failed to open vectors.bin"))?;
    let file_len = vectors_file.metadata().map_err(storage("failed to stat vectors.bin"))?.len() as usize;
    if file_len < 16 {
        return Err(IndexError::Corrupt("vectors.bin too small (no header)".into()));
    }
    let mmap = unsafe { memmap2::MmapOptions::new().map(&vectors_file).map_err(storage("failed to mmap vectors.bin"))? };

    let magic = read_u32(&mmap, 0);
    let version = read_u32(&mmap, 4);
    let dims = read_u32(&mmap, 8) as usize;
    let count = read_u32(&mmap, 12) as usize;
    if magic != VECTORS_MAGIC {
        return Err(IndexError::Corrupt(format!("invalid vectors.bin magic: {magic:#X}")));
    }
    if version != VECTORS_VERSION {
        return Err(IndexError::Corrupt(format!("unsupported vectors.bin version: {version}")));
    }
    let expected_len = 16 + dims * count * 4;
    if file_len != expected_len {
        return Err(IndexError::Corrupt(format!(
            "vectors.bin size mismatch: got {file_len}, expected {expected_len} (dims={dims}, count={count})"
        )));
    }
    if dims != meta.dimensions || count != stored.len() {
        return Err(IndexError::Corrupt(format!(
            "vectors.bin holds {count}x{dims}, chunks.jsonl has {} records of {} dims",
            stored.len(),
            meta.dimensions
        )));
    }

    let floats = &mmap[16..];
    let entries = stored
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            let start = i * dims * 4;
            let vector = floats[start..start + dims * 4]
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Entry {
                chunk_id: s.chunk_id,
                vector,
                model_name: s.model_name,
                model_version: s.model_version,
                metadata: s.metadata,
            }
        })
        .collect();

    drop(mmap);
    if let Some(f) = lock {
        let _ = f.unlock();
    }
    Ok((meta, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::index::tests::{exercise_backend, meta, record};
    use tempfile::TempDir;

    #[test]
    fn test_backend_contract() {
        let mut index = MemoryIndex::new(3);
        exercise_backend(&mut index);
    }

    #[test]
    fn test_save_load_preserves_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vector_db");
        let mut index = MemoryIndex::open(&path, 3).unwrap();
        index.upsert(record("first", vec![1.0, 0.0, 0.0]), meta("d1", "first text")).unwrap();
        index.upsert(record("second", vec![1.0, 0.0, 0.0]), meta("d2", "second text")).unwrap();
        index.upsert(record("third", vec![0.0, 1.0, 0.0]), meta("d2", "third text")).unwrap();
        index.save().unwrap();

        let loaded = MemoryIndex::open(&path, 3).unwrap();
        assert_eq!(loaded.len(), 3);
        let before = index.search(&[1.0, 0.2, 0.0], 3, -1.0).unwrap();
        let after = loaded.search(&[1.0, 0.2, 0.0], 3, -1.0).unwrap();
        assert_eq!(before, after);
        assert_eq!(after[0].chunk_id, "first");
        assert_eq!(after[1].chunk_id, "second");
        assert_eq!(after[0].metadata.source_url, "https://aims-cameroon.org/d1");

        let meta: IndexMeta =
            serde_json::from_str(&std::fs::read_to_string(path.join("meta.json")).unwrap()).unwrap();
        assert_eq!(meta.chunk_count, 3);
        assert_eq!(meta.model_name, "test-model");
        assert_eq!(meta.backend, "in-memory");
    }

    #[test]
    fn test_vectors_bin_format() {
        let dir = TempDir::new().unwrap();
        let mut index = MemoryIndex::open(dir.path(), 4).unwrap();
        index.upsert(record("a", vec![1.0, 0.0, 0.0, 0.0]), meta("d1", "a")).unwrap();
        index.upsert(record("b", vec![0.0, 1.0, 0.0, 0.0]), meta("d1", "b")).unwrap();
        index.save().unwrap();

        let data = std::fs::read(dir.path().join("vectors.bin")).unwrap();
        assert_eq!(read_u32(&data, 0), VECTORS_MAGIC);
        assert_eq!(read_u32(&data, 4), VECTORS_VERSION);
        assert_eq!(read_u32(&data, 8), 4);
        assert_eq!(read_u32(&data, 12), 2);
        assert_eq!(data.len(), 16 + 4 * 2 * 4);
        assert!(!dir.path().read_dir().unwrap().flatten().any(|e| e.file_name().to_string_lossy().starts_with(".tmp-")));
    }

    #[test]
    fn test_corrupt_files_rejected() {
        let dir = TempDir::new().unwrap();
        let mut index = MemoryIndex::open(dir.path(), 2).unwrap();
        index.upsert(record("a", vec![1.0, 0.0]), meta("d1", "a")).unwrap();
        index.save().unwrap();

        let mut data = std::fs::read(dir.path().join("vectors.bin")).unwrap();
        data[0..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        std::fs::write(dir.path().join("vectors.bin"), &data).unwrap();
        assert!(matches!(MemoryIndex::open(dir.path(), 2), Err(IndexError::Corrupt(m)) if m.contains("magic")));

        data[0..4].copy_from_slice(&VECTORS_MAGIC.to_le_bytes());
        data.truncate(20);
        std::fs::write(dir.path().join("vectors.bin"), &data).unwrap();
        assert!(matches!(MemoryIndex::open(dir.path(), 2), Err(IndexError::Corrupt(m)) if m.contains("mismatch")));
    }

    #[test]
    fn test_unsaved_index_has_no_files() {
        let index = MemoryIndex::new(3);
        index.save().unwrap();
        assert_eq!(index.len(), 0);
    }
}
