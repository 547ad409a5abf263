//! Error types for mail-digest.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub(crate) fn missing(key: &str) -> Self {
        Self::MissingRequired {
            key: key.to_string(),
            hint: format!("Set the {key} environment variable"),
        }
    }
}

/// Mail server errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Cannot connect to {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Cannot select folder '{folder}': {reason}")]
    Folder { folder: String, reason: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("IMAP session already closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Summarization provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} rate limited")]
    RateLimited { provider: String },
}

/// Failures that end a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error("Invalid date range: {start} is after {end}")]
    InvalidRange { start: String, end: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_names_the_variable() {
        let err = ConfigError::missing("GEMINI_API_KEY");
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn pipeline_error_is_transparent_over_mailbox() {
        let err: PipelineError = MailboxError::Auth("LOGIN failed".into()).into();
        assert_eq!(err.to_string(), "Authentication rejected: LOGIN failed");
    }
}
