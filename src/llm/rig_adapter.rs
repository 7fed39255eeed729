//! Bridge from rig-core's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionError, CompletionModel};
use rig::message::Message;
use rust_decimal::Decimal;

use crate::error::LlmError;
use crate::llm::costs;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider, Role};

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    costs: (Decimal, Decimal),
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            costs: costs::model_cost(model_name),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        self.costs
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut preamble: Vec<String> = Vec::new();
        let mut history: Vec<Message> = Vec::new();
        for msg in request.messages {
            match msg.role {
                Role::System => preamble.push(msg.content),
                Role::User => history.push(Message::user(msg.content)),
                Role::Assistant => history.push(Message::assistant(msg.content)),
            }
        }

        let prompt = history.pop().ok_or_else(|| LlmError::InvalidResponse {
            provider: self.model_name.clone(),
            reason: "completion request has no user message".into(),
        })?;

        let mut builder = self.model.completion_request(prompt).messages(history);
        if !preamble.is_empty() {
            builder = builder.preamble(preamble.join("\n\n"));
        }
        if let Some(t) = request.temperature {
            builder = builder.temperature(f64::from(t));
        }
        if let Some(n) = request.max_tokens {
            builder = builder.max_tokens(u64::from(n));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_completion_error(&self.model_name, e))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
        })
    }
}

/// Classify rig errors into our taxonomy. Rig surfaces HTTP status only as text.
fn map_completion_error(model: &str, err: CompletionError) -> LlmError {
    let reason = err.to_string();
    let lower = reason.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("overloaded") {
        LlmError::RateLimited {
            provider: model.to_string(),
            retry_after: None,
        }
    } else if lower.contains("401") || lower.contains("authentication") || lower.contains("api key") {
        LlmError::AuthFailed {
            provider: model.to_string(),
        }
    } else if lower.contains("content policy") || lower.contains("content_filter") || lower.contains("safety") {
        LlmError::ContentRejected {
            provider: model.to_string(),
            reason,
        }
    } else {
        LlmError::RequestFailed {
            provider: model.to_string(),
            reason,
        }
    }
}
