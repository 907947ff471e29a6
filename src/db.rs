// ============================================
// DATABASE - SQLite persistence layer
// Answer log + persistent vector backend
// ============================================

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe database handle shared by the answer log and the persistent index.
#[derive(Clone)]
pub struct Database {
    pub conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and run all migrations.
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create data directory: {e}"))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| format!("Failed to open database: {e}"))?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| format!("Failed to set pragmas: {e}"))?;

        let db = Self { conn: Arc::new(Mutex::new(conn)) };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("Failed to open database: {e}"))?;
        let db = Self { conn: Arc::new(Mutex::new(conn)) };
        db.migrate()?;
        Ok(db)
    }

    /// Run schema migrations. Idempotent.
    fn migrate(&self) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );"
        ).map_err(|e| format!("Migration _meta failed: {e}"))?;

        let version: i64 = conn
            .query_row(
                "SELECT COALESCE((SELECT value FROM _meta WHERE key = 'schema_version'), '0')",
                [],
                |row| row.get::<_, String>(0),
            )
            .map_err(|e| format!("Failed to read schema version: {e}"))?
            .parse()
            .unwrap_or(0);

        if version < 1 {
            Self::migrate_v1(&conn)?;
        }
        if version < 2 {
            Self::migrate_v2(&conn)?;
        }

        Ok(())
    }

    /// V1: answer log
    fn migrate_v1(conn: &Connection) -> Result<(), String> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS answers (
                id         TEXT PRIMARY KEY,
                query      TEXT NOT NULL,
                text       TEXT NOT NULL,
                grounded   INTEGER NOT NULL,
                citations  TEXT NOT NULL DEFAULT '[]',
                trace      TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_answers_created ON answers(created_at DESC);

            INSERT OR REPLACE INTO _meta (key, value) VALUES ('schema_version', '1');
            "
        ).map_err(|e| format!("Migration v1 failed: {e}"))?;
        Ok(())
    }

    /// V2: embedding records for the persistent vector backend.
    /// `seq` is the insertion order used to break similarity ties.
    fn migrate_v2(conn: &Connection) -> Result<(), String> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS embeddings (
                seq            INTEGER PRIMARY KEY AUTOINCREMENT,
                chunk_id       TEXT NOT NULL UNIQUE,
                document_id    TEXT NOT NULL,
                source_url     TEXT NOT NULL,
                category       TEXT NOT NULL,
                text           TEXT NOT NULL,
                token_count    INTEGER NOT NULL,
                sequence_index INTEGER NOT NULL,
                model_name     TEXT NOT NULL,
                model_version  TEXT NOT NULL,
                vector         BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_embeddings_document ON embeddings(document_id);
            CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_name, model_version);

            INSERT OR REPLACE INTO _meta (key, value) VALUES ('schema_version', '2');
            "
        ).map_err(|e| format!("Migration v2 failed: {e}"))?;
        Ok(())
    }

    pub fn meta_get(&self, key: &str) -> Result<Option<String>, String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare("SELECT value FROM _meta WHERE key = ?1")
            .map_err(|e| e.to_string())?;
        let mut rows = stmt.query([key]).map_err(|e| e.to_string())?;
        match rows.next().map_err(|e| e.to_string())? {
            Some(row) => Ok(Some(row.get(0).map_err(|e| e.to_string())?)),
            None => Ok(None),
        }
    }

    pub fn meta_set(&self, key: &str, value: &str) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT OR REPLACE INTO _meta (key, value) VALUES (?1, ?2)",
            [key, value],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Helper: current UTC timestamp in ISO 8601.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
