//! Error types for the mail knowledge pipeline.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Provider {provider} rejected the content: {reason}")]
    ContentRejected { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlmError {
    /// Whether a retry of the same request may succeed.
    ///
    /// Network failures, rate limits and timeouts are transient. Content
    /// rejection, auth and context-length failures will fail again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::Timeout { .. } | Self::Io(_)
        )
    }

    /// Server-provided delay hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// The message body could not be turned into usable text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedInputError {
    #[error("body is not valid UTF-8 (invalid byte at offset {offset})")]
    NotUtf8 { offset: usize },

    #[error("body contains no readable text")]
    Empty,

    #[error("first word is {word_chars} chars, longer than the {max_chars}-char budget")]
    Untruncatable { word_chars: usize, max_chars: usize },
}

/// Knowledge extraction failed after the retry policy was applied.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("transient extraction failure after {attempts} attempt(s): {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: LlmError,
    },

    #[error("permanent extraction failure: {source}")]
    Permanent {
        attempts: u32,
        #[source]
        source: LlmError,
    },
}

impl ExtractionError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Transient { attempts, .. } | Self::Permanent { attempts, .. } => *attempts,
        }
    }

    /// Short machine-friendly reason for audit records.
    pub fn reason(&self) -> String {
        match self {
            Self::Transient { attempts, source } => match source {
                LlmError::Timeout { timeout, .. } => {
                    format!("timeout after {attempts} attempt(s) ({timeout:?} each)")
                }
                other => format!("transient after {attempts} attempt(s): {other}"),
            },
            Self::Permanent { source, .. } => format!("permanent: {source}"),
        }
    }
}

/// Graph store write failures. Always safe to retry.
#[derive(Debug, thiserror::Error)]
pub enum GraphWriteError {
    #[error("graph store unavailable: {0}")]
    Unavailable(String),

    #[error("timeout after {0:?} waiting for graph store")]
    Timeout(Duration),

    #[error("invalid fact: {0}")]
    InvalidFact(String),
}

impl GraphWriteError {
    /// Audit reason for a commit that gave up after `attempts`.
    pub fn reason(&self, attempts: u32) -> String {
        match self {
            Self::Timeout(timeout) => {
                format!("timeout after {attempts} attempt(s) ({timeout:?} each)")
            }
            other => format!("{other} (after {attempts} attempt(s))"),
        }
    }
}

impl From<DatabaseError> for GraphWriteError {
    fn from(e: DatabaseError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// The audit ledger could not be written. Fatal for the pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum AuditWriteError {
    #[error("audit store failure: {0}")]
    Store(String),

    #[error("timeout after {0:?} waiting for audit store")]
    Timeout(Duration),
}

impl From<DatabaseError> for AuditWriteError {
    fn from(e: DatabaseError) -> Self {
        Self::Store(e.to_string())
    }
}

/// Blob store errors.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout after {0:?} waiting for blob store")]
    Timeout(Duration),

    #[error("invalid blob key: {0}")]
    InvalidKey(String),
}

/// Run-level failures: the run ended without claiming success.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Audit write failed: {0}")]
    Audit(#[from] AuditWriteError),

    #[error("No archived copy of message {0}")]
    NotArchived(String),

    #[error("Archive read failed: {0}")]
    Archive(#[from] BlobError),

    #[error("Message parse failed: {0}")]
    Parse(String),

    #[error("Mail source {name} failed: {reason}")]
    Source { name: String, reason: String },
}
