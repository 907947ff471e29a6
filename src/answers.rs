// ============================================
// ANSWER LOG - append-only record of served answers
// ============================================

use crate::db::Database;
use crate::error::AppResult;
use crate::rag::Answer;

/// Answers are written for traceability only and never fed back into retrieval.
#[derive(Clone)]
pub struct AnswerLog {
    db: Database,
}

impl AnswerLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn record(&self, answer: &Answer) -> AppResult<()> {
        let citations = serde_json::to_string(&answer.citations)?;
        let trace = serde_json::to_string(&answer.trace)?;
        let created_at = answer.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let conn = self.db.conn.lock()?;
        conn.execute(
            "INSERT INTO answers (id, query, text, grounded, citations, trace, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![answer.id, answer.query, answer.text, answer.grounded, citations, trace, created_at],
        )?;
        Ok(())
    }

    pub fn count(&self) -> AppResult<usize> {
        let conn = self.db.conn.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM answers", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> AppResult<Vec<Answer>> {
        let conn = self.db.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, query, text, grounded, citations, trace, created_at
             FROM answers ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut answers = Vec::new();
        for row in rows {
            let (id, query, text, grounded, citations, trace, created_at) = row?;
            let timestamp = chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| crate::error::AppError::Internal(format!("bad answer timestamp: {e}")))?
                .with_timezone(&chrono::Utc);
            answers.push(Answer {
                id,
                query,
                text,
                grounded,
                citations: serde_json::from_str(&citations)?,
                trace: serde_json::from_str(&trace)?,
                timestamp,
            });
        }
        Ok(answers)
    }
}
