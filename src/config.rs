//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::llm::retry::RetryPolicy;
use crate::pipeline::filter::AllowList;

/// When the raw message is copied to blob storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchivePolicy {
    /// Every accepted message is archived before reduction.
    #[default]
    Always,
    /// Only messages whose run ends in `Failed`.
    OnFailure,
    Never,
}

impl FromStr for ArchivePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "on_failure" | "on-failure" | "failure" => Ok(Self::OnFailure),
            "never" | "off" => Ok(Self::Never),
            other => Err(ConfigError::InvalidValue {
                key: "MAIL_KNOWLEDGE_ARCHIVE_POLICY".into(),
                message: format!("unknown policy '{other}' (expected always, on_failure, never)"),
            }),
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on reduced body length, in characters.
    pub max_body_length: usize,
    /// Remove newsletter headers/footers and embedded addresses.
    pub strip_boilerplate: bool,
    /// Per-call timeout for the LLM.
    pub extraction_timeout: Duration,
    pub extraction_retry: RetryPolicy,
    /// Retry policy for the commit stage.
    pub graph_retry: RetryPolicy,
    /// Timeout applied to every audit/graph/blob call.
    pub store_timeout: Duration,
    /// Facts below this confidence are dropped before commit.
    pub min_confidence: f32,
    pub archive_policy: ArchivePolicy,
    /// Messages processed concurrently within one batch.
    pub concurrency: usize,
    /// Fallback allow-list when the settings store has none.
    pub allowed_senders: AllowList,
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_body_length: 12_000,
            strip_boilerplate: true,
            extraction_timeout: Duration::from_secs(60),
            extraction_retry: RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(30)),
            graph_retry: RetryPolicy::new(3, Duration::from_millis(200), Duration::from_secs(5)),
            store_timeout: Duration::from_secs(10),
            min_confidence: 0.0,
            archive_policy: ArchivePolicy::Always,
            concurrency: 4,
            allowed_senders: AllowList::default(),
            poll_interval: Duration::from_secs(300),
        }
    }
}

impl PipelineConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_body_length = env_parse("MAIL_KNOWLEDGE_MAX_BODY_CHARS")?
            .unwrap_or(defaults.max_body_length);
        let strip_boilerplate = env_parse("MAIL_KNOWLEDGE_STRIP_BOILERPLATE")?
            .unwrap_or(defaults.strip_boilerplate);
        let extraction_timeout = env_parse("MAIL_KNOWLEDGE_LLM_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.extraction_timeout);

        let mut extraction_retry = defaults.extraction_retry;
        if let Some(n) = env_parse::<u32>("MAIL_KNOWLEDGE_LLM_MAX_ATTEMPTS")? {
            extraction_retry.max_attempts = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("MAIL_KNOWLEDGE_LLM_BACKOFF_MS")? {
            extraction_retry.initial_backoff = Duration::from_millis(ms);
        }

        let mut graph_retry = defaults.graph_retry;
        if let Some(n) = env_parse::<u32>("MAIL_KNOWLEDGE_GRAPH_MAX_ATTEMPTS")? {
            graph_retry.max_attempts = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("MAIL_KNOWLEDGE_GRAPH_BACKOFF_MS")? {
            graph_retry.initial_backoff = Duration::from_millis(ms);
        }

        let store_timeout = env_parse("MAIL_KNOWLEDGE_STORE_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.store_timeout);

        let min_confidence: f32 = env_parse("MAIL_KNOWLEDGE_MIN_CONFIDENCE")?
            .unwrap_or(defaults.min_confidence);
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_KNOWLEDGE_MIN_CONFIDENCE".into(),
                message: format!("{min_confidence} is outside 0.0..=1.0"),
            });
        }

        let archive_policy = match std::env::var("MAIL_KNOWLEDGE_ARCHIVE_POLICY") {
            Ok(s) => s.parse()?,
            Err(_) => defaults.archive_policy,
        };

        let concurrency = env_parse::<usize>("MAIL_KNOWLEDGE_CONCURRENCY")?
            .unwrap_or(defaults.concurrency)
            .max(1);

        let allowed_senders = std::env::var("MAIL_KNOWLEDGE_ALLOWED_SENDERS")
            .map(|s| AllowList::from_csv(&s))
            .unwrap_or_default();

        let poll_interval = env_parse("MAIL_KNOWLEDGE_POLL_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);

        Ok(Self {
            max_body_length,
            strip_boilerplate,
            extraction_timeout,
            extraction_retry,
            graph_retry,
            store_timeout,
            min_confidence,
            archive_policy,
            concurrency,
            allowed_senders,
            poll_interval,
        })
    }
}

/// Parse an optional environment variable. Unset is `Ok(None)`, unparseable is an error.
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
