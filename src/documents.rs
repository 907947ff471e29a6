// ============================================
// DOCUMENTS - crawler output records + JSON store
// ============================================

use crate::error::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Html,
    Pdf,
}

/// Fixed knowledge-scope tags.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Institutional,
    AcademicPrograms,
    Admissions,
    Funding,
    FacultyResearch,
    StudentLife,
    Administration,
    FaqPolicy,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Institutional,
        Category::AcademicPrograms,
        Category::Admissions,
        Category::Funding,
        Category::FacultyResearch,
        Category::StudentLife,
        Category::Administration,
        Category::FaqPolicy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Institutional => "institutional",
            Category::AcademicPrograms => "academic-programs",
            Category::Admissions => "admissions",
            Category::Funding => "funding",
            Category::FacultyResearch => "faculty-research",
            Category::StudentLife => "student-life",
            Category::Administration => "administration",
            Category::FaqPolicy => "faq-policy",
        }
    }

    /// Accepts the kebab-case tags and the scraper's display labels.
    pub fn parse(s: &str) -> Option<Self> {
        let key = s.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        let cat = match key.as_str() {
            "institutional" => Category::Institutional,
            "academic-programs" | "academics" => Category::AcademicPrograms,
            "admissions" => Category::Admissions,
            "funding" | "scholarships" => Category::Funding,
            "faculty-research" | "faculty" | "research" => Category::FacultyResearch,
            "student-life" => Category::StudentLife,
            "administration" => Category::Administration,
            "faq-policy" | "faqs" | "faq" | "policies" => Category::FaqPolicy,
            _ => return None,
        };
        Some(cat)
    }

    /// Keyword scoring over url, title and text; `Institutional` when nothing matches.
    pub fn infer(url: &str, title: &str, text: &str) -> Self {
        let haystack = format!("{url} {title} {text}").to_lowercase();
        let table: [(Category, &[&str]); 7] = [
            (Category::Admissions, &["admission", "apply", "application", "eligibility", "deadline", "entrance"]),
            (Category::AcademicPrograms, &["program", "curriculum", "course", "academic", "degree", "master", "study"]),
            (Category::Funding, &["scholarship", "funding", "financial", "tuition", "fully funded", "stipend"]),
            (Category::FacultyResearch, &["faculty", "professor", "lecturer", "researcher", "research", "publication"]),
            (Category::StudentLife, &["student life", "accommodation", "campus", "housing", "dormitory"]),
            (Category::Administration, &["contact", "office", "director", "email", "phone"]),
            (Category::FaqPolicy, &["faq", "q&a", "policy", "regulation", "guideline", "code of conduct"]),
        ];

        let mut best = (Category::Institutional, 0usize);
        for (cat, keywords) in table {
            let score: usize = keywords.iter().map(|k| haystack.matches(k).count()).sum();
            if score > best.1 {
                best = (cat, score);
            }
        }
        best.0
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Category::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("unknown category '{raw}'")))
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fetched page or PDF with its extracted plain text. Never mutated; a re-fetch supersedes it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub source_url: String,
    pub title: String,
    pub raw_text: String,
    pub content_type: ContentType,
    pub fetched_at: DateTime<Utc>,
    pub category: Category,
}

/// Wire shape of a stored record. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct DocumentRecord {
    #[serde(alias = "doc_id")]
    id: String,
    source_url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    raw_text: String,
    #[serde(default)]
    content_type: ContentType,
    #[serde(alias = "scrape_timestamp")]
    fetched_at: DateTime<Utc>,
    #[serde(default)]
    category: Option<Category>,
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rec = DocumentRecord::deserialize(deserializer)?;
        if rec.id.trim().is_empty() {
            return Err(serde::de::Error::custom("document id is empty"));
        }
        url::Url::parse(&rec.source_url)
            .map_err(|e| serde::de::Error::custom(format!("invalid source_url '{}': {e}", rec.source_url)))?;
        let category = rec
            .category
            .unwrap_or_else(|| Category::infer(&rec.source_url, &rec.title, &rec.raw_text));
        Ok(Document {
            id: rec.id,
            source_url: rec.source_url,
            title: rec.title,
            raw_text: rec.raw_text,
            content_type: rec.content_type,
            fetched_at: rec.fetched_at,
            category,
        })
    }
}

/// Keep the latest fetch per document id, preserving first-seen order.
pub fn supersede(documents: Vec<Document>) -> Vec<Document> {
    let mut out: Vec<Document> = Vec::with_capacity(documents.len());
    let mut position: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for doc in documents {
        match position.get(&doc.id) {
            Some(&i) => {
                if doc.fetched_at >= out[i].fetched_at {
                    out[i] = doc;
                }
            }
            None => {
                position.insert(doc.id.clone(), out.len());
                out.push(doc);
            }
        }
    }
    out
}

/// Directory of `<id>.json` document records.
pub struct DocumentStore {
    base: PathBuf,
}

impl DocumentStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Sorted list of record files.
    pub fn list(&self) -> Vec<PathBuf> {
        let pattern = format!("{}/*.json", glob::Pattern::escape(&self.base.to_string_lossy()));
        let mut files: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(entries) => entries.flatten().filter(|p| p.is_file()).collect(),
            Err(_) => Vec::new(),
        };
        files.sort();
        files
    }

    pub fn load(&self, id: &str) -> Result<Document, StorageError> {
        self.load_path(&self.base.join(format!("{id}.json")))
    }

    fn load_path(&self, path: &Path) -> Result<Document, StorageError> {
        let content = std::fs::read_to_string(path).map_err(|e| StorageError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| StorageError::InvalidDocument {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Load every record; unreadable ones are returned separately.
    pub fn load_all(&self) -> (Vec<Document>, Vec<StorageError>) {
        let mut docs = Vec::new();
        let mut errors = Vec::new();
        for path in self.list() {
            match self.load_path(&path) {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable document");
                    errors.push(e);
                }
            }
        }
        (docs, errors)
    }

    pub fn save(&self, doc: &Document) -> Result<PathBuf, StorageError> {
        let path = self.base.join(format!("{}.json", doc.id));
        let write_err = |reason: String| StorageError::Write { path: path.display().to_string(), reason };
        std::fs::create_dir_all(&self.base).map_err(|e| write_err(e.to_string()))?;
        let json = serde_json::to_string_pretty(doc).map_err(|e| write_err(e.to_string()))?;
        std::fs::write(&path, json).map_err(|e| write_err(e.to_string()))?;
        tracing::debug!(id = %doc.id, path = %path.display(), "saved document");
        Ok(path)
    }
}
