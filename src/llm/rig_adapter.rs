//! Bridges rig's `CompletionModel` to [`LlmProvider`].

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionError, CompletionModel, Message};

use super::provider::{CompletionRequest, CompletionResponse, LlmProvider};
use crate::error::LlmError;

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: impl Into<String>, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.into(),
            provider,
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

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut builder = self.model.completion_request(Message::user(request.prompt));
        if let Some(t) = request.temperature {
            builder = builder.temperature(f64::from(t));
        }
        if let Some(n) = request.max_tokens {
            builder = builder.max_tokens(u64::from(n));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_completion_error(self.provider, e))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect();

        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.provider.to_string(),
                reason: "no text in response".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: saturate(response.usage.input_tokens),
            output_tokens: saturate(response.usage.output_tokens),
        })
    }
}

fn saturate(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn map_completion_error(provider: &str, err: CompletionError) -> LlmError {
    match err {
        CompletionError::ResponseError(reason) => LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason,
        },
        other => classify_failure(provider, other.to_string()),
    }
}

/// Sort a transport or provider failure by the status it reports.
fn classify_failure(provider: &str, reason: String) -> LlmError {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("resource_exhausted") || lower.contains("rate limit") {
        LlmError::RateLimited {
            provider: provider.to_string(),
        }
    } else if lower.contains("401")
        || lower.contains("403")
        || lower.contains("permission_denied")
        || lower.contains("api key not valid")
    {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_errors_are_rate_limits() {
        let err = classify_failure("gemini", r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED"}}"#.into());
        assert!(matches!(err, LlmError::RateLimited { .. }));
    }

    #[test]
    fn key_errors_are_auth_failures() {
        let err = classify_failure("gemini", "API key not valid. Please pass a valid API key.".into());
        assert!(matches!(err, LlmError::AuthFailed { .. }));
        let err = classify_failure("gemini", "HTTP status 403 Forbidden".into());
        assert!(matches!(err, LlmError::AuthFailed { .. }));
    }

    #[test]
    fn other_failures_keep_their_reason() {
        match classify_failure("gemini", "connection reset".into()) {
            LlmError::RequestFailed { provider, reason } => {
                assert_eq!(provider, "gemini");
                assert_eq!(reason, "connection reset");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn response_errors_are_invalid_responses() {
        let err = map_completion_error("gemini", CompletionError::ResponseError("empty candidates".into()));
        assert!(matches!(err, LlmError::InvalidResponse { reason, .. } if reason == "empty candidates"));
    }
}
