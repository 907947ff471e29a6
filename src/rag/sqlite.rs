use rusqlite::{params, OptionalExtension};
use std::path::Path;

use super::embedder::EmbeddingRecord;
use super::index::{dot_similarity, prepare_query, prepare_vector, top_k, ChunkMetadata, SearchHit, VectorIndex};
use crate::config::VectorBackend;
use crate::db::Database;
use crate::documents::Category;
use crate::error::IndexError;

const DIMENSIONS_KEY: &str = "index_dimensions";

/// Durable backend: every upsert is written through to SQLite.
///
/// Search is an exact scan over all stored vectors, so ranking matches
/// [`MemoryIndex`](super::memory::MemoryIndex) exactly. The cost is linear in index size.
pub struct SqliteIndex {
    db: Database,
    dimensions: usize,
}

fn lock_err<T>(e: std::sync::PoisonError<T>) -> IndexError {
    IndexError::Storage(format!("lock poisoned: {e}"))
}

fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect()
}

impl SqliteIndex {
    pub fn open(path: &Path, dimensions: usize) -> Result<Self, IndexError> {
        let db = Database::open(path).map_err(IndexError::Storage)?;
        Self::with_database(db, dimensions)
    }

    pub fn with_database(db: Database, dimensions: usize) -> Result<Self, IndexError> {
        let stored = db.meta_get(DIMENSIONS_KEY).map_err(IndexError::Storage)?;
        let dimensions = match stored {
            Some(d) => d.parse().map_err(|_| IndexError::Corrupt(format!("bad stored dimension '{d}'")))?,
            None => {
                db.meta_set(DIMENSIONS_KEY, &dimensions.to_string()).map_err(IndexError::Storage)?;
                dimensions
            }
        };
        Ok(Self { db, dimensions })
    }
}

impl VectorIndex for SqliteIndex {
    fn backend(&self) -> VectorBackend {
        VectorBackend::Persistent
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn len(&self) -> usize {
        self.count().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not count index records");
            0
        })
    }

    fn count(&self) -> Result<usize, IndexError> {
        let conn = self.db.conn.lock().map_err(lock_err)?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn upsert(&mut self, record: EmbeddingRecord, metadata: ChunkMetadata) -> Result<(), IndexError> {
        let vector = prepare_vector(&record.chunk_id, &record.vector, self.dimensions)?;
        let conn = self.db.conn.lock().map_err(lock_err)?;
        conn.execute(
            "INSERT INTO embeddings
                (chunk_id, document_id, source_url, category, text, token_count, sequence_index,
                 model_name, model_version, vector)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(chunk_id) DO UPDATE SET
                document_id = excluded.document_id,
                source_url = excluded.source_url,
                category = excluded.category,
                text = excluded.text,
                token_count = excluded.token_count,
                sequence_index = excluded.sequence_index,
                model_name = excluded.model_name,
                model_version = excluded.model_version,
                vector = excluded.vector",
            params![
                record.chunk_id,
                metadata.document_id,
                metadata.source_url,
                metadata.category.as_str(),
                metadata.text,
                metadata.token_count as i64,
                metadata.sequence_index as i64,
                record.model_name,
                record.model_version,
                encode_vector(&vector),
            ],
        )?;
        Ok(())
    }

    fn remove(&mut self, chunk_id: &str) -> Result<bool, IndexError> {
        let conn = self.db.conn.lock().map_err(lock_err)?;
        let n = conn.execute("DELETE FROM embeddings WHERE chunk_id = ?1", [chunk_id])?;
        Ok(n > 0)
    }

    fn search(&self, query: &[f32], k: usize, min_similarity: f32) -> Result<Vec<SearchHit>, IndexError> {
        let q = prepare_query(query, self.dimensions)?;
        let conn = self.db.conn.lock().map_err(lock_err)?;

        let mut scored = Vec::new();
        {
            let mut stmt = conn.prepare("SELECT seq, vector FROM embeddings")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let seq: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                let v = decode_vector(&blob);
                if v.len() != self.dimensions {
                    return Err(IndexError::Corrupt(format!("record {seq} has {} dims", v.len())));
                }
                scored.push((seq as u64, dot_similarity(&q, &v)));
            }
        }

        let mut stmt = conn.prepare(
            "SELECT chunk_id, document_id, source_url, category, text, token_count, sequence_index
             FROM embeddings WHERE seq = ?1",
        )?;
        let mut hits = Vec::new();
        for (seq, score) in top_k(scored, k, min_similarity) {
            let hit = stmt
                .query_row([seq as i64], |row| {
                    let category: String = row.get(3)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        category,
                        ChunkMetadata {
                            document_id: row.get(1)?,
                            source_url: row.get(2)?,
                            category: Category::Institutional,
                            text: row.get(4)?,
                            token_count: row.get::<_, i64>(5)? as usize,
                            sequence_index: row.get::<_, i64>(6)? as usize,
                        },
                    ))
                })
                .optional()?;
            if let Some((chunk_id, category, mut metadata)) = hit {
                metadata.category = Category::parse(&category)
                    .ok_or_else(|| IndexError::Corrupt(format!("unknown category '{category}'")))?;
                hits.push(SearchHit { chunk_id, score, metadata });
            }
        }
        Ok(hits)
    }

    fn purge_stale(&mut self, model_name: &str, model_version: &str) -> Result<usize, IndexError> {
        let conn = self.db.conn.lock().map_err(lock_err)?;
        let n = conn.execute(
            "DELETE FROM embeddings WHERE model_name != ?1 OR model_version != ?2",
            [model_name, model_version],
        )?;
        Ok(n)
    }

    fn reset(&mut self, dimensions: usize) -> Result<(), IndexError> {
        {
            let conn = self.db.conn.lock().map_err(lock_err)?;
            // Also resets the AUTOINCREMENT counter so insertion order restarts.
            conn.execute_batch(
                "DELETE FROM embeddings;
                 DELETE FROM sqlite_sequence WHERE name = 'embeddings';",
            )?;
        }
        self.db.meta_set(DIMENSIONS_KEY, &dimensions.to_string()).map_err(IndexError::Storage)?;
        self.dimensions = dimensions;
        Ok(())
    }

    fn save(&self) -> Result<(), IndexError> {
        let conn = self.db.conn.lock().map_err(lock_err)?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}
