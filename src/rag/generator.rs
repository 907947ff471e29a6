use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::format::build_user_prompt;
use super::llm::{CompletionRequest, LanguageModel};
use super::retriever::Evidence;
use crate::config::Settings;
use crate::error::GenerationError;

/// Fixed reply when the knowledge base cannot support an answer.
pub const UNAVAILABLE_TEXT: &str = "information not available";

pub const SYSTEM_PROMPT: &str = "You answer questions about an institution using ONLY the provided context. \
Each context block is labeled with its source. Do not use outside knowledge and do not guess. \
If the context does not contain the answer, reply exactly: 'information not available'.";

const MAX_BACKOFF: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub source_url: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub id: String,
    pub query: String,
    pub text: String,
    pub grounded: bool,
    /// Deduplicated source URLs in retrieval order. Empty unless grounded.
    pub citations: Vec<String>,
    pub trace: Vec<TraceEntry>,
    pub timestamp: DateTime<Utc>,
}

impl Answer {
    fn new(query: &str, text: String, grounded: bool, citations: Vec<String>, trace: Vec<TraceEntry>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query: query.to_string(),
            text,
            grounded,
            citations,
            trace,
            timestamp: Utc::now(),
        }
    }

    pub fn unavailable(query: &str, trace: Vec<TraceEntry>) -> Self {
        Self::new(query, UNAVAILABLE_TEXT.to_string(), false, Vec::new(), trace)
    }
}

/// Bounded retries with exponential backoff: `base * 2^(n-1)`, capped at 8s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exp).min(MAX_BACKOFF)
    }
}

const DECLINE_PREFIXES: &[&str] = &[
    "information not available",
    "information is not available",
    "the information is not available",
];

/// True when the model declined or produced nothing usable.
///
/// Only a reply that opens with the decline phrase counts; a partial answer that
/// mentions missing information later on stays an answer.
pub fn signals_unavailable(response: &str) -> bool {
    let normalized = response
        .trim()
        .trim_matches(|c: char| c == '\'' || c == '"' || c == '.' || c.is_whitespace())
        .to_lowercase();
    normalized.is_empty() || DECLINE_PREFIXES.iter().any(|p| normalized.starts_with(p))
}

pub fn dedup_citations(evidence: &[Evidence]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    evidence
        .iter()
        .filter(|e| seen.insert(e.source_url.as_str()))
        .map(|e| e.source_url.clone())
        .collect()
}

pub struct GroundedGenerator {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    temperature: f32,
}

impl GroundedGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy, temperature: f32) -> Self {
        Self { model, retry, temperature }
    }

    pub fn from_settings(model: Arc<dyn LanguageModel>, settings: &Settings) -> Self {
        let retry = RetryPolicy { retries: settings.llm_retry_count, base: settings.llm_backoff_base() };
        Self::new(model, retry, settings.llm_temperature)
    }

    /// Answer strictly from `evidence`. Empty evidence never reaches the model.
    pub async fn answer(&self, question: &str, evidence: &[Evidence]) -> Result<Answer, GenerationError> {
        if evidence.is_empty() {
            return Ok(Answer::unavailable(question, Vec::new()));
        }

        let trace: Vec<TraceEntry> = evidence
            .iter()
            .map(|e| TraceEntry {
                chunk_id: e.chunk_id.clone(),
                document_id: e.document_id.clone(),
                source_url: e.source_url.clone(),
                score: e.similarity_score,
            })
            .collect();

        let request = CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            user: build_user_prompt(question, evidence),
            temperature: self.temperature,
        };

        let response = self.complete_with_retry(&request).await?;
        if signals_unavailable(&response) {
            tracing::info!(evidence = evidence.len(), "model declined to answer from context");
            return Ok(Answer::unavailable(question, trace));
        }

        Ok(Answer::new(question, response, true, dedup_citations(evidence), trace))
    }

    async fn complete_with_retry(&self, request: &CompletionRequest) -> Result<String, GenerationError> {
        let max_attempts = self.retry.retries.saturating_add(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.model.complete(request).await {
                Ok(text) => return Ok(text),
                Err(e) if !e.is_retryable() => {
                    tracing::error!(model = self.model.model_name(), error = %e, "language model call failed");
                    return Err(GenerationError::Fatal(e));
                }
                Err(e) if attempt >= max_attempts => {
                    tracing::error!(attempts = attempt, error = %e, "language model retries exhausted");
                    return Err(GenerationError::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying language model call");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::documents::Category;
    use crate::error::LlmError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned results and records every prompt it receives.
    pub(crate) struct ScriptedModel {
        script: Mutex<VecDeque<Result<String, LlmError>>>,
        pub(crate) calls: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedModel {
        pub(crate) fn new(script: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()), calls: Mutex::new(Vec::new()) })
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Malformed("script exhausted".into())))
        }
    }

    pub(crate) fn fast_retry(retries: u32) -> RetryPolicy {
        RetryPolicy { retries, base: Duration::from_millis(1) }
    }

    fn evidence(chunk: &str, url: &str, text: &str) -> Evidence {
        Evidence {
            chunk_id: chunk.into(),
            similarity_score: 0.8,
            source_url: url.into(),
            text: text.into(),
            document_id: chunk.split("_chunk_").next().unwrap_or(chunk).into(),
            category: Category::AcademicPrograms,
        }
    }

    #[tokio::test]
    async fn test_no_evidence_skips_model() {
        let model = ScriptedModel::new(vec![Ok("should not be used".into())]);
        let gen = GroundedGenerator::new(model.clone(), fast_retry(3), 0.0);
        let answer = gen.answer("What is the weather?", &[]).await.unwrap();
        assert!(!answer.grounded);
        assert_eq!(answer.text, UNAVAILABLE_TEXT);
        assert!(answer.citations.is_empty());
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_grounded_answer_cites_dedup_in_order() {
        let model = ScriptedModel::new(vec![Ok("A one-year MSc in Mathematical Sciences.".into())]);
        let gen = GroundedGenerator::new(model.clone(), fast_retry(0), 0.0);
        let ev = vec![
            evidence("b_chunk_0", "https://aims-cameroon.org/b", "MSc details"),
            evidence("a_chunk_0", "https://aims-cameroon.org/a", "Programme overview"),
            evidence("b_chunk_1", "https://aims-cameroon.org/b", "More MSc details"),
        ];
        let answer = gen.answer("What program is offered?", &ev).await.unwrap();
        assert!(answer.grounded);
        assert_eq!(answer.citations, vec!["https://aims-cameroon.org/b", "https://aims-cameroon.org/a"]);
        assert_eq!(answer.trace.len(), 3);
        assert_eq!(answer.trace[2].chunk_id, "b_chunk_1");

        let calls = model.calls.lock().unwrap();
        assert_eq!(calls[0].system, SYSTEM_PROMPT);
        assert!(calls[0].user.contains("Programme overview"));
        assert!(calls[0].user.contains("source=https://aims-cameroon.org/a"));
    }

    #[tokio::test]
    async fn test_model_declines() {
        for reply in ["", "   ", "Information not available.", "'information not available'"] {
            let model = ScriptedModel::new(vec![Ok(reply.into())]);
            let gen = GroundedGenerator::new(model, fast_retry(0), 0.0);
            let answer = gen.answer("q", &[evidence("d_chunk_0", "https://x.org", "t")]).await.unwrap();
            assert!(!answer.grounded, "reply {reply:?} should be ungrounded");
            assert_eq!(answer.text, UNAVAILABLE_TEXT);
            assert!(answer.citations.is_empty());
        }
    }

    #[test]
    fn test_decline_phrase_must_open_the_reply() {
        assert!(signals_unavailable("The information is not available in the current documents."));
        assert!(signals_unavailable("  \"Information not available\"  "));
        assert!(!signals_unavailable(
            "The MSc lasts one year. Information is not available about tuition for 2026."
        ));
        assert!(!signals_unavailable("Fees are listed; further information not available online is omitted."));
    }

    #[tokio::test]
    async fn test_partial_answer_stays_grounded() {
        let reply = "Admissions open in January. Information is not available about the deadline.";
        let model = ScriptedModel::new(vec![Ok(reply.into())]);
        let gen = GroundedGenerator::new(model, fast_retry(0), 0.0);
        let answer = gen.answer("When do admissions open?", &[evidence("d_chunk_0", "https://x.org", "January")]).await.unwrap();
        assert!(answer.grounded);
        assert_eq!(answer.text, reply);
        assert_eq!(answer.citations, vec!["https://x.org".to_string()]);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let model = ScriptedModel::new(vec![
            Err(LlmError::Timeout(1)),
            Err(LlmError::RateLimited("429".into())),
            Ok("Limbe.".into()),
        ]);
        let gen = GroundedGenerator::new(model.clone(), fast_retry(3), 0.0);
        let answer = gen.answer("Where?", &[evidence("d_chunk_0", "https://x.org", "Limbe")]).await.unwrap();
        assert!(answer.grounded);
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let model = ScriptedModel::new(vec![
            Err(LlmError::Timeout(1)),
            Err(LlmError::Timeout(1)),
            Err(LlmError::Http { status: 502, body: "bad gateway".into() }),
        ]);
        let gen = GroundedGenerator::new(model.clone(), fast_retry(2), 0.0);
        let err = gen.answer("Where?", &[evidence("d_chunk_0", "https://x.org", "Limbe")]).await.unwrap_err();
        assert_eq!(
            err,
            GenerationError::Exhausted { attempts: 3, last: LlmError::Http { status: 502, body: "bad gateway".into() } }
        );
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let model = ScriptedModel::new(vec![Err(LlmError::Http { status: 401, body: "no key".into() })]);
        let gen = GroundedGenerator::new(model.clone(), fast_retry(5), 0.0);
        let err = gen.answer("Where?", &[evidence("d_chunk_0", "https://x.org", "Limbe")]).await.unwrap_err();
        assert!(matches!(err, GenerationError::Fatal(LlmError::Http { status: 401, .. })));
        assert_eq!(model.call_count(), 1);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy { retries: 10, base: Duration::from_millis(500) };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(4), Duration::from_millis(4000));
        assert_eq!(policy.delay(5), Duration::from_secs(8));
        assert_eq!(policy.delay(30), Duration::from_secs(8));
    }
}
