//! Knowledge extractor: reduced text to validated facts via the LLM.
//!
//! Every call gets a timeout. Transient failures (network, rate limit,
//! timeout) are retried with backoff up to the policy's attempt budget;
//! permanent ones fail at once. A response that does not parse into facts
//! is not an error: it yields zero facts and a recorded validation failure.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ExtractionError, LlmError};
use crate::llm::costs;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::llm::retry::RetryPolicy;
use crate::pipeline::types::{ExtractedFact, normalize_label};

/// Max tokens for the extraction call.
const EXTRACTION_MAX_TOKENS: u32 = 2048;

const EXTRACTION_TEMPERATURE: f32 = 0.0;

/// Longest label accepted from the model.
const MAX_LABEL_CHARS: usize = 200;

const DEFAULT_SYSTEM_PROMPT: &str = "You extract durable knowledge from email newsletters and \
     research digests. Identify concrete concepts (compounds, organisms, technologies, \
     organizations, methods) and how they relate.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"facts\": [{\"subject\": \"...\", \"relation\": \"...\", \"object\": \"...\", \
     \"excerpt\": \"...\", \"confidence\": 0.0}]}\n\n\
     Rules:\n\
     - subject and object are short noun phrases as written in the text\n\
     - relation is a short verb phrase (e.g. \"inhibits\", \"is part of\")\n\
     - excerpt quotes the sentence that supports the fact\n\
     - confidence is between 0.0 and 1.0\n\
     - return {\"facts\": []} when nothing is worth keeping";

/// Prompt settings for one extraction call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionPrompt {
    /// Overrides the built-in system prompt when set.
    pub system: Option<String>,
    /// Topics the model should focus on.
    pub topics: Vec<String>,
}

impl ExtractionPrompt {
    fn system_prompt(&self) -> String {
        let mut prompt = self
            .system
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
            .to_string();
        if !self.topics.is_empty() {
            prompt.push_str("\n\nFocus on these topics: ");
            prompt.push_str(&self.topics.join(", "));
        }
        prompt
    }
}

/// Token usage and estimated cost of the successful call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionUsage {
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: Decimal,
}

/// Result of a successful extraction call.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub facts: Vec<ExtractedFact>,
    /// Entries dropped as malformed.
    pub rejected: usize,
    /// Entries dropped for confidence below the configured minimum.
    pub below_threshold: usize,
    /// Set when the response as a whole could not be read as facts.
    pub validation_error: Option<String>,
    pub usage: ExtractionUsage,
    pub attempts: u32,
}

impl Extraction {
    /// Metrics for the extract-stage audit record.
    pub fn audit_detail(&self) -> serde_json::Value {
        serde_json::json!({
            "facts": self.facts.len(),
            "rejected": self.rejected,
            "below_threshold": self.below_threshold,
            "validation_error": self.validation_error,
            "model": self.usage.model,
            "input_tokens": self.usage.input_tokens,
            "output_tokens": self.usage.output_tokens,
            "cost": self.usage.cost.to_string(),
            "attempts": self.attempts,
        })
    }
}

/// LLM-backed fact extractor with timeout and retry.
pub struct KnowledgeExtractor {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
    retry: RetryPolicy,
    min_confidence: f32,
}

impl KnowledgeExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            llm,
            timeout,
            retry,
            min_confidence: 0.0,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence.clamp(0.0, 1.0);
        self
    }

    /// Extract facts from `text`.
    pub async fn extract(
        &self,
        text: &str,
        subject: Option<&str>,
        prompt: &ExtractionPrompt,
    ) -> Result<Extraction, ExtractionError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(prompt.system_prompt()),
            ChatMessage::user(build_user_prompt(text, subject)),
        ])
        .with_temperature(EXTRACTION_TEMPERATURE)
        .with_max_tokens(EXTRACTION_MAX_TOKENS);

        let model = self.llm.model_name().to_string();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, self.llm.complete(request.clone()))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout {
                    provider: model.clone(),
                    timeout: self.timeout,
                }),
            };

            match result {
                Ok(response) => {
                    let mut extraction = parse_facts(&response.content, self.min_confidence);
                    extraction.attempts = attempt;
                    extraction.usage = ExtractionUsage {
                        cost: costs::estimate(
                            self.llm.cost_per_token(),
                            response.input_tokens,
                            response.output_tokens,
                        ),
                        model,
                        input_tokens: response.input_tokens,
                        output_tokens: response.output_tokens,
                    };
                    if let Some(err) = &extraction.validation_error {
                        warn!(error = %err, "Extraction response failed validation");
                    }
                    debug!(
                        facts = extraction.facts.len(),
                        rejected = extraction.rejected,
                        attempts = attempt,
                        "Extraction complete"
                    );
                    return Ok(extraction);
                }
                Err(e) if e.is_transient() && self.retry.has_attempts_left(attempt) => {
                    let delay = self.retry.delay(attempt, e.retry_after());
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient extraction failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(ExtractionError::Transient {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    return Err(ExtractionError::Permanent {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}

fn build_user_prompt(text: &str, subject: Option<&str>) -> String {
    let mut prompt = String::with_capacity(text.len() + 64);
    if let Some(subject) = subject {
        prompt.push_str(&format!("Subject: {subject}\n\n"));
    }
    prompt.push_str(text);
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FactEntry {
    #[serde(default)]
    subject: String,
    #[serde(default)]
    relation: String,
    #[serde(default)]
    object: String,
    #[serde(default)]
    excerpt: String,
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ConceptEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    urls: Vec<String>,
}

/// Parse model output into validated facts. Never fails; problems are
/// reported through `rejected` and `validation_error`.
fn parse_facts(raw: &str, min_confidence: f32) -> Extraction {
    let mut extraction = Extraction {
        facts: Vec::new(),
        rejected: 0,
        below_threshold: 0,
        validation_error: None,
        usage: ExtractionUsage {
            model: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            cost: Decimal::ZERO,
        },
        attempts: 0,
    };

    let json_str = extract_json_object(raw);
    let value: serde_json::Value = match serde_json::from_str(&json_str) {
        Ok(v) => v,
        Err(e) => {
            extraction.validation_error = Some(format!("response is not JSON: {e}"));
            return extraction;
        }
    };

    let candidates: Vec<ExtractedFact> = if let Some(items) = value.get("facts").and_then(|v| v.as_array()) {
        items
            .iter()
            .filter_map(|item| match serde_json::from_value::<FactEntry>(item.clone()) {
                Ok(entry) => Some(ExtractedFact {
                    subject: entry.subject,
                    relation: entry.relation,
                    object: entry.object,
                    excerpt: entry.excerpt,
                    confidence: entry.confidence.unwrap_or(1.0),
                }),
                Err(_) => {
                    extraction.rejected += 1;
                    None
                }
            })
            .collect()
    } else if let Some(items) = value.get("concepts").and_then(|v| v.as_array()) {
        let mut facts = Vec::new();
        for item in items {
            match serde_json::from_value::<ConceptEntry>(item.clone()) {
                Ok(concept) => facts.extend(concept_facts(concept)),
                Err(_) => extraction.rejected += 1,
            }
        }
        facts
    } else {
        extraction.validation_error = Some("response has no \"facts\" or \"concepts\" array".into());
        return extraction;
    };

    for fact in candidates {
        match validate_fact(fact) {
            Some(fact) if fact.confidence < min_confidence => extraction.below_threshold += 1,
            Some(fact) => extraction.facts.push(fact),
            None => extraction.rejected += 1,
        }
    }
    extraction
}

/// Concept-shaped output: each keyword represents the concept, each URL describes it.
fn concept_facts(concept: ConceptEntry) -> Vec<ExtractedFact> {
    let name = concept.name.trim().to_string();
    let keywords = concept
        .keywords
        .into_iter()
        .map(|k| ExtractedFact::new(k, "represents", name.clone(), 1.0));
    let urls = concept
        .urls
        .into_iter()
        .map(|u| ExtractedFact::new(u, "describes", name.clone(), 1.0));
    keywords.chain(urls).collect()
}

/// Trim labels and clamp confidence. `None` when the fact is unusable.
fn validate_fact(mut fact: ExtractedFact) -> Option<ExtractedFact> {
    fact.subject = fact.subject.trim().to_string();
    fact.relation = fact.relation.trim().to_string();
    fact.object = fact.object.trim().to_string();
    fact.excerpt = fact.excerpt.trim().to_string();

    let labels_ok = [&fact.subject, &fact.relation, &fact.object]
        .iter()
        .all(|label| !label.is_empty() && label.chars().count() <= MAX_LABEL_CHARS);
    if !labels_ok || !fact.confidence.is_finite() {
        return None;
    }
    if normalize_label(&fact.subject) == normalize_label(&fact.object) {
        return None;
    }
    fact.confidence = fact.confidence.clamp(0.0, 1.0);
    Some(fact)
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::llm::provider::CompletionResponse;

    #[derive(Clone, Copy)]
    enum Step {
        Reply(&'static str),
        RateLimited,
        Rejected,
    }

    /// Replays scripted steps, one per call; the last one repeats.
    struct ScriptedLlm {
        script: Vec<Step>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl ScriptedLlm {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script,
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "claude-sonnet-test"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            costs::model_cost("claude-sonnet-test")
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.script[n.min(self.script.len() - 1)] {
                Step::Reply(content) => Ok(CompletionResponse {
                    content: content.to_string(),
                    input_tokens: 100,
                    output_tokens: 20,
                }),
                Step::RateLimited => Err(LlmError::RateLimited {
                    provider: "mock".into(),
                    retry_after: None,
                }),
                Step::Rejected => Err(LlmError::ContentRejected {
                    provider: "mock".into(),
                    reason: "policy".into(),
                }),
            }
        }
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(5))
    }

    const ONE_FACT: &str = r#"{"facts":[{"subject":"CompoundX","relation":"inhibits","object":"Y","excerpt":"Novel compound X inhibits Y","confidence":0.9}]}"#;

    #[tokio::test]
    async fn extracts_facts() {
        let llm = Arc::new(ScriptedLlm::new(vec![Step::Reply(ONE_FACT)]));
        let extractor = KnowledgeExtractor::new(llm.clone(), Duration::from_secs(5), fast_retry(3));
        let out = extractor
            .extract("Novel compound X inhibits Y", None, &ExtractionPrompt::default())
            .await
            .unwrap();
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.facts[0].subject, "CompoundX");
        assert_eq!(out.attempts, 1);
        assert_eq!(out.usage.input_tokens, 100);
        assert!(out.usage.cost > Decimal::ZERO);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Step::RateLimited,
            Step::RateLimited,
            Step::Reply(ONE_FACT),
        ]));
        let extractor = KnowledgeExtractor::new(llm.clone(), Duration::from_secs(5), fast_retry(3));
        let out = extractor
            .extract("text", None, &ExtractionPrompt::default())
            .await
            .unwrap();
        assert_eq!(out.attempts, 3);
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn transient_exhaustion_reports_attempts() {
        let llm = Arc::new(ScriptedLlm::new(vec![Step::RateLimited]));
        let extractor = KnowledgeExtractor::new(llm.clone(), Duration::from_secs(5), fast_retry(3));
        let err = extractor
            .extract("text", None, &ExtractionPrompt::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Transient { attempts: 3, .. }));
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let llm = Arc::new(ScriptedLlm::new(vec![Step::Rejected]));
        let extractor = KnowledgeExtractor::new(llm.clone(), Duration::from_secs(5), fast_retry(3));
        let err = extractor
            .extract("text", None, &ExtractionPrompt::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Permanent { attempts: 1, .. }));
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let mut scripted = ScriptedLlm::new(vec![Step::Reply(ONE_FACT)]);
        scripted.delay = Duration::from_millis(200);
        let llm = Arc::new(scripted);
        let extractor =
            KnowledgeExtractor::new(llm.clone(), Duration::from_millis(10), fast_retry(2));
        let err = extractor
            .extract("text", None, &ExtractionPrompt::default())
            .await
            .unwrap_err();
        assert!(err.reason().contains("timeout"), "{}", err.reason());
        assert_eq!(err.attempts(), 2);
        assert_eq!(llm.calls(), 2);
    }

    #[test]
    fn malformed_response_is_zero_facts_with_validation_error() {
        let out = parse_facts("I could not find anything interesting.", 0.0);
        assert!(out.facts.is_empty());
        assert!(out.validation_error.is_some());

        let out = parse_facts(r#"{"summary": "no facts key"}"#, 0.0);
        assert!(out.facts.is_empty());
        assert!(out.validation_error.is_some());
    }

    #[test]
    fn invalid_entries_are_counted() {
        let raw = r#"```json
{"facts":[
  {"subject":"A","relation":"binds","object":"B","confidence":0.8},
  {"subject":"","relation":"binds","object":"B","confidence":0.8},
  {"subject":"C","relation":"is","object":"c","confidence":0.8},
  {"subject":"D","relation":"binds","object":"E","confidence":"high"},
  {"subject":"F","relation":"binds","object":"G","confidence":0.1}
]}
```"#;
        let out = parse_facts(raw, 0.5);
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.rejected, 3);
        assert_eq!(out.below_threshold, 1);
        assert!(out.validation_error.is_none());
    }

    #[test]
    fn confidence_is_clamped() {
        let out = parse_facts(
            r#"{"facts":[{"subject":"A","relation":"r","object":"B","confidence":7.5}]}"#,
            0.0,
        );
        assert_eq!(out.facts[0].confidence, 1.0);
    }

    #[test]
    fn concept_shape_maps_to_represents_and_describes() {
        let raw = r#"{"concepts":[{"name":"CRISPR","keywords":["gene editing","Cas9"],"urls":["https://example.org/crispr"]}]}"#;
        let out = parse_facts(raw, 0.0);
        assert_eq!(out.facts.len(), 3);
        assert_eq!(out.facts[0].relation, "represents");
        assert_eq!(out.facts[0].object, "CRISPR");
        assert_eq!(out.facts[2].relation, "describes");
        assert_eq!(out.facts[2].subject, "https://example.org/crispr");
    }

    #[test]
    fn prompt_includes_topics() {
        let prompt = ExtractionPrompt {
            system: None,
            topics: vec!["biology".into(), "chemistry".into()],
        };
        let system = prompt.system_prompt();
        assert!(system.contains("\"facts\""));
        assert!(system.ends_with("biology, chemistry"));

        let custom = ExtractionPrompt {
            system: Some("Custom prompt".into()),
            topics: vec![],
        };
        assert_eq!(custom.system_prompt(), "Custom prompt");
    }

    #[test]
    fn extract_json_handles_wrapping() {
        assert_eq!(extract_json_object("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(extract_json_object("Sure:\n```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json_object("Here you go {\"a\":1} done"), "{\"a\":1}");
    }
}
