//! Background intake worker.
//!
//! Timer-based loop, also triggerable on demand through [`IntakeRunner`]. Each tick:
//! 1. Reads runtime settings (allow-list, prompt, topics) from the settings store
//! 2. Fetches new messages from the mail source
//! 3. Runs them through `IntakeProcessor::process_batch()`
//!
//! Messages are never marked in the source; redeliveries are skipped by the
//! audit ledger.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::mail::MailSource;
use crate::pipeline::extractor::ExtractionPrompt;
use crate::pipeline::filter::AllowList;
use crate::pipeline::processor::IntakeProcessor;
use crate::pipeline::types::IntakeRun;
use crate::store::SettingsStore;

pub const ALLOWED_SENDERS_KEY: &str = "allowed_senders";
pub const PROMPT_KEY: &str = "llm_prompt";
pub const TOPICS_KEY: &str = "concept_topics";

/// Settings read once per tick and passed explicitly into the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub allow_list: AllowList,
    pub prompt: ExtractionPrompt,
}

/// One source wired to the processor. Cheap to clone; the timer loop and
/// the operator API each hold one.
#[derive(Clone)]
pub struct IntakeRunner {
    source: Arc<dyn MailSource>,
    processor: Arc<IntakeProcessor>,
    settings: Arc<dyn SettingsStore>,
    fallback_allow_list: Arc<AllowList>,
}

impl IntakeRunner {
    /// `fallback_allow_list` is used when the settings store has no allow-list.
    pub fn new(
        source: Arc<dyn MailSource>,
        processor: Arc<IntakeProcessor>,
        settings: Arc<dyn SettingsStore>,
        fallback_allow_list: AllowList,
    ) -> Self {
        Self {
            source,
            processor,
            settings,
            fallback_allow_list: Arc::new(fallback_allow_list),
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Run one intake tick now.
    pub async fn run_once(&self) -> Result<IntakeRun, PipelineError> {
        run_intake_once(
            self.source.as_ref(),
            &self.processor,
            self.settings.as_ref(),
            &self.fallback_allow_list,
        )
        .await
    }
}

/// Spawn a background task that polls `source` every `config.poll_interval`.
///
/// `config.allowed_senders` is used when the settings store has no allow-list.
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_intake_worker(
    source: Arc<dyn MailSource>,
    processor: Arc<IntakeProcessor>,
    settings: Arc<dyn SettingsStore>,
    config: &PipelineConfig,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let runner = IntakeRunner::new(source, processor, settings, config.allowed_senders.clone());
    let interval = config.poll_interval.max(Duration::from_secs(1));
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            source = runner.source_name(),
            "Intake worker started, polling every {}s",
            interval.as_secs()
        );

        let mut tick = tokio::time::interval(interval);

        // First tick fires immediately
        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Intake worker shutting down");
                return;
            }

            if let Err(e) = runner.run_once().await {
                error!("Intake run failed: {e}");
            }
        }
    });

    (handle, shutdown_flag)
}

/// One intake tick: refresh settings, fetch, process.
pub async fn run_intake_once(
    source: &dyn MailSource,
    processor: &IntakeProcessor,
    settings: &dyn SettingsStore,
    fallback_allow_list: &AllowList,
) -> Result<IntakeRun, PipelineError> {
    let runtime = load_runtime_settings(settings, fallback_allow_list).await;
    processor.set_prompt(runtime.prompt);
    if runtime.allow_list.is_empty() {
        warn!(source = source.name(), "Allow-list is empty, every sender will be dismissed");
    }

    let messages = source.fetch_new().await?;
    if messages.is_empty() {
        debug!(source = source.name(), "No new messages");
    }
    processor
        .process_batch(source.name(), messages, Arc::new(runtime.allow_list))
        .await
}

/// Read runtime settings, falling back per key when absent or unreadable.
pub async fn load_runtime_settings(
    settings: &dyn SettingsStore,
    fallback_allow_list: &AllowList,
) -> RuntimeSettings {
    let allow_list = match read(settings, ALLOWED_SENDERS_KEY).await {
        Some(value) => parse_allow_list(&value).unwrap_or_else(|| {
            warn!(key = ALLOWED_SENDERS_KEY, "Unrecognized setting shape, using fallback");
            fallback_allow_list.clone()
        }),
        None => fallback_allow_list.clone(),
    };

    let system = read(settings, PROMPT_KEY).await.and_then(|v| match v {
        Value::String(s) => Some(s),
        Value::Object(map) => map.get("prompt").and_then(Value::as_str).map(str::to_string),
        _ => None,
    });

    let topics = read(settings, TOPICS_KEY)
        .await
        .map(|v| match &v {
            Value::Object(map) => map.get("topics").map(string_list).unwrap_or_default(),
            other => string_list(other),
        })
        .unwrap_or_default();

    RuntimeSettings {
        allow_list,
        prompt: ExtractionPrompt { system, topics },
    }
}

async fn read(settings: &dyn SettingsStore, key: &str) -> Option<Value> {
    match settings.get_setting(key).await {
        Ok(value) => value,
        Err(e) => {
            warn!(key, "Failed to read setting: {e}");
            None
        }
    }
}

/// A JSON string array, or a comma-separated string.
fn parse_allow_list(value: &Value) -> Option<AllowList> {
    match value {
        Value::Array(_) => Some(AllowList::new(string_list(value))),
        Value::String(s) => Some(AllowList::from_csv(s)),
        _ => None,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};
    use crate::mail::RawMessage;
    use crate::pipeline::types::TerminalState;
    use crate::store::{AuditStore, FsBlobStore, LibSqlBackend};

    struct NoFactsLlm;

    #[async_trait]
    impl LlmProvider for NoFactsLlm {
        fn model_name(&self) -> &str {
            "mock"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: r#"{"facts":[]}"#.into(),
                input_tokens: 10,
                output_tokens: 2,
            })
        }
    }

    /// Returns the same single message on every fetch.
    struct OneMessageSource {
        fetches: AtomicU32,
    }

    #[async_trait]
    impl MailSource for OneMessageSource {
        fn name(&self) -> &str {
            "test"
        }

        async fn fetch_new(&self) -> Result<Vec<RawMessage>, PipelineError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![RawMessage::from_parts(
                "w1",
                "alice@allowed.com",
                "<p>Compound X inhibits Y</p>",
            )])
        }
    }

    #[tokio::test]
    async fn worker_runs_a_tick_and_stops_on_shutdown() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path()).await.unwrap());
        let config = PipelineConfig {
            allowed_senders: AllowList::new(["allowed.com"]),
            poll_interval: Duration::from_secs(1),
            ..PipelineConfig::default()
        };
        let processor = Arc::new(IntakeProcessor::new(
            Arc::new(NoFactsLlm),
            store.clone(),
            store.clone(),
            blobs,
            &config,
        ));
        let source = Arc::new(OneMessageSource {
            fetches: AtomicU32::new(0),
        });

        let (handle, shutdown) = spawn_intake_worker(source.clone(), processor, store.clone(), &config);

        // First tick fires immediately.
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.recent_runs(1).await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker never completed a run");

        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker ignored shutdown")
            .unwrap();

        let runs = store.recent_runs(5).await.unwrap();
        assert_eq!(runs[0].source, "test");
        assert_eq!(runs[0].fetched, 1);
        assert!(source.fetches.load(Ordering::SeqCst) >= 1);
        let terminal = store.terminal("w1").await.unwrap().unwrap();
        assert_eq!(terminal.terminal_state(), Some(TerminalState::Done));
    }

    #[tokio::test]
    async fn runner_runs_on_demand() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path()).await.unwrap());
        let config = PipelineConfig::default();
        let processor = Arc::new(IntakeProcessor::new(
            Arc::new(NoFactsLlm),
            store.clone(),
            store.clone(),
            blobs,
            &config,
        ));
        let runner = IntakeRunner::new(
            Arc::new(OneMessageSource {
                fetches: AtomicU32::new(0),
            }),
            processor,
            store.clone(),
            AllowList::new(["allowed.com"]),
        );

        let first = runner.run_once().await.unwrap();
        assert_eq!(first.done, 1);
        let second = runner.run_once().await.unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(store.recent_runs(5).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_settings_use_fallback() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let fallback = AllowList::new(["allowed.com"]);
        let runtime = load_runtime_settings(&store, &fallback).await;
        assert_eq!(runtime.allow_list, fallback);
        assert_eq!(runtime.prompt, ExtractionPrompt::default());
    }

    #[tokio::test]
    async fn stored_settings_take_precedence() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store
            .set_setting(ALLOWED_SENDERS_KEY, &json!(["news@digest.org", "lab.edu"]))
            .await
            .unwrap();
        store
            .set_setting(PROMPT_KEY, &json!({ "prompt": "Extract science facts." }))
            .await
            .unwrap();
        store
            .set_setting(TOPICS_KEY, &json!({ "topics": ["biology", "materials"] }))
            .await
            .unwrap();

        let runtime = load_runtime_settings(&store, &AllowList::new(["allowed.com"])).await;
        assert_eq!(runtime.allow_list, AllowList::new(["news@digest.org", "lab.edu"]));
        assert_eq!(runtime.prompt.system.as_deref(), Some("Extract science facts."));
        assert_eq!(runtime.prompt.topics, vec!["biology", "materials"]);
    }

    #[tokio::test]
    async fn csv_allow_list_setting() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store
            .set_setting(ALLOWED_SENDERS_KEY, &json!("a.com, b.com"))
            .await
            .unwrap();
        store.set_setting(TOPICS_KEY, &json!(["chemistry"])).await.unwrap();

        let runtime = load_runtime_settings(&store, &AllowList::default()).await;
        assert_eq!(runtime.allow_list.len(), 2);
        assert_eq!(runtime.prompt.topics, vec!["chemistry"]);
    }

    #[tokio::test]
    async fn unrecognized_shape_falls_back() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store.set_setting(ALLOWED_SENDERS_KEY, &json!(42)).await.unwrap();
        let fallback = AllowList::new(["allowed.com"]);
        let runtime = load_runtime_settings(&store, &fallback).await;
        assert_eq!(runtime.allow_list, fallback);
    }
}
