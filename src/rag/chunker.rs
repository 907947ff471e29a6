use crate::documents::{Category, Document};
use crate::error::ChunkingError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::OnceLock;
use unicode_segmentation::UnicodeSegmentation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self { min_tokens: 50, max_tokens: 400, overlap_tokens: 75 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub token_count: usize,
    pub sequence_index: usize,
    /// Tokens repeated from the end of the previous chunk.
    pub overlap_with_previous: usize,
    pub source_url: String,
    pub category: Category,
}

/// Chunk text before document metadata is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    pub token_count: usize,
    pub overlap: usize,
}

/// Word-bound segments that are not whitespace.
pub fn count_tokens(text: &str) -> usize {
    text.split_word_bounds().filter(|w| !w.trim().is_empty()).count()
}

/// Split `text` after its first `n` tokens. Both halves are trimmed.
pub fn split_at_tokens(text: &str, n: usize) -> (&str, &str) {
    let mut seen = 0;
    let mut cut = text.len();
    for (idx, seg) in text.split_word_bound_indices() {
        if seg.trim().is_empty() {
            continue;
        }
        if seen == n {
            cut = idx;
            break;
        }
        seen += 1;
    }
    (text[..cut].trim_end(), text[cut..].trim_start())
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// UAX #29 sentence segmentation with whitespace collapsed inside each sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    normalized
        .split_sentence_bounds()
        .map(|s| whitespace_re().replace_all(s, " ").trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn check_text(doc_id: &str, text: &str) -> Result<(), ChunkingError> {
    for (offset, c) in text.char_indices() {
        let what = match c {
            '\0' => "a NUL byte",
            '\u{FFFD}' => "a replacement character (failed decoding)",
            c if c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\x0c') => "a control character",
            _ => continue,
        };
        return Err(ChunkingError::Malformed { doc_id: doc_id.to_string(), what, offset });
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Unit {
    text: String,
    tokens: usize,
}

impl Unit {
    fn new(text: &str) -> Self {
        Self { text: text.to_string(), tokens: count_tokens(text) }
    }

    /// Hard split at a token boundary. Only used when a sentence cannot fit.
    fn split(&self, n: usize) -> (Unit, Unit) {
        let (head, tail) = split_at_tokens(&self.text, n);
        (Unit::new(head), Unit::new(tail))
    }
}

struct Builder<'a> {
    cfg: &'a ChunkerConfig,
    out: Vec<TextChunk>,
    current: Vec<Unit>,
    tokens: usize,
    /// Leading units of `current` carried over from the previous chunk.
    carried: usize,
    previous: Vec<Unit>,
}

impl<'a> Builder<'a> {
    fn push(&mut self, unit: Unit) {
        self.tokens += unit.tokens;
        self.current.push(unit);
    }

    fn has_fresh_content(&self) -> bool {
        self.current.len() > self.carried
    }

    fn close(&mut self) {
        let text = self.current.iter().map(|u| u.text.as_str()).collect::<Vec<_>>().join(" ");
        let overlap = self.current[..self.carried].iter().map(|u| u.tokens).sum();
        self.out.push(TextChunk { token_count: count_tokens(&text), text, overlap });
        self.previous = std::mem::take(&mut self.current);
        self.tokens = 0;
        self.carried = 0;
    }

    /// Start the next chunk with the trailing sentences whose total is closest to,
    /// without exceeding, the overlap window.
    fn start_with_overlap(&mut self) {
        let mut taken = 0;
        let mut total = 0;
        for unit in self.previous.iter().rev() {
            if total + unit.tokens > self.cfg.overlap_tokens {
                break;
            }
            total += unit.tokens;
            taken += 1;
        }
        let start = self.previous.len() - taken;
        self.current = self.previous[start..].to_vec();
        self.tokens = total;
        self.carried = taken;
    }

    fn shed_overlap_for(&mut self, incoming: usize) {
        while self.carried > 0 && self.tokens + incoming > self.cfg.max_tokens {
            let dropped = self.current.remove(0);
            self.tokens -= dropped.tokens;
            self.carried -= 1;
        }
    }

    /// Grow a short final chunk backwards into the previous chunk's sentences.
    fn extend_final(&mut self) {
        if self.out.is_empty() || self.tokens >= self.cfg.min_tokens {
            return;
        }
        let available = self.previous.len().saturating_sub(self.carried);
        for unit in self.previous[..available].iter().rev() {
            if self.tokens >= self.cfg.min_tokens {
                break;
            }
            if self.tokens + unit.tokens <= self.cfg.max_tokens {
                self.tokens += unit.tokens;
                self.current.insert(0, unit.clone());
                self.carried += 1;
                continue;
            }
            // Whole sentence does not fit: borrow only its trailing tokens.
            let need = self.cfg.min_tokens - self.tokens;
            let (_, tail) = unit.split(unit.tokens - need);
            self.tokens += tail.tokens;
            self.current.insert(0, tail);
            self.carried += 1;
            break;
        }
    }
}

/// Greedy sentence packing with sentence-aligned overlap.
pub fn chunk_text(text: &str, cfg: &ChunkerConfig) -> Vec<TextChunk> {
    let max = cfg.max_tokens.max(1);
    let mut queue: VecDeque<Unit> = split_sentences(text).iter().map(|s| Unit::new(s)).collect();
    let mut b = Builder {
        cfg,
        out: Vec::new(),
        current: Vec::new(),
        tokens: 0,
        carried: 0,
        previous: Vec::new(),
    };

    while let Some(unit) = queue.pop_front() {
        if b.tokens + unit.tokens <= max {
            b.push(unit);
            continue;
        }

        if !b.has_fresh_content() {
            b.shed_overlap_for(unit.tokens);
            if b.tokens + unit.tokens <= max {
                b.push(unit);
            } else {
                // Sentence longer than a whole chunk.
                let (head, tail) = unit.split(max);
                b.push(head);
                queue.push_front(tail);
            }
            continue;
        }

        if b.tokens < cfg.min_tokens {
            let (head, tail) = unit.split(max - b.tokens);
            b.push(head);
            queue.push_front(tail);
            continue;
        }

        b.close();
        b.start_with_overlap();
        queue.push_front(unit);
    }

    if b.has_fresh_content() {
        b.extend_final();
        b.close();
    }
    b.out
}

/// Chunk a document. Empty text yields no chunks; only non-text input is an error.
pub fn chunk_document(doc: &Document, cfg: &ChunkerConfig) -> Result<Vec<Chunk>, ChunkingError> {
    check_text(&doc.id, &doc.raw_text)?;
    let chunks = chunk_text(&doc.raw_text, cfg)
        .into_iter()
        .enumerate()
        .map(|(i, c)| Chunk {
            id: format!("{}_chunk_{i}", doc.id),
            document_id: doc.id.clone(),
            text: c.text,
            token_count: c.token_count,
            sequence_index: i,
            overlap_with_previous: c.overlap,
            source_url: doc.source_url.clone(),
            category: doc.category,
        })
        .collect();
    Ok(chunks)
}
