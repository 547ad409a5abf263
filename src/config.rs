//! Configuration types.
//!
//! Everything is read once at startup into [`AppConfig`] and handed to the
//! pipeline components explicitly.

use chrono::{FixedOffset, Offset, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

pub const ENV_EMAIL_ADDRESS: &str = "EMAIL_ADDRESS";
pub const ENV_EMAIL_PASSWORD: &str = "EMAIL_PASSWORD";
pub const ENV_GEMINI_API_KEY: &str = "GEMINI_API_KEY";

/// Default IMAP server.
pub const DEFAULT_IMAP_HOST: &str = "imap.163.com";
/// Folder scanned and summarized.
pub const DEFAULT_FOLDER: &str = "Newsletter";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_BIND: &str = "0.0.0.0:10000";

/// Calendar dates are always taken in UTC+8.
pub const LOCAL_UTC_OFFSET_HOURS: i32 = 8;

/// Longest body prefix (in characters) sent to the summarizer.
pub const MAX_PROMPT_BODY_CHARS: usize = 8000;

/// Payload of the IMAP `ID` command. Some providers refuse SELECT without it.
pub const CLIENT_ID: &str = r#"("name" "my-gradio-client" "version" "1.0")"#;

/// Mailbox login pair.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub email_address: Option<String>,
    pub email_password: Option<SecretString>,
    pub gemini_api_key: Option<SecretString>,
    pub imap_host: String,
    pub imap_port: u16,
    pub folder: String,
    pub model: String,
    /// Listen address for the web UI.
    pub bind_addr: String,
    pub utc_offset_hours: i32,
    pub max_prompt_chars: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            email_address: None,
            email_password: None,
            gemini_api_key: None,
            imap_host: DEFAULT_IMAP_HOST.to_string(),
            imap_port: 993,
            folder: DEFAULT_FOLDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            bind_addr: DEFAULT_BIND.to_string(),
            utc_offset_hours: LOCAL_UTC_OFFSET_HOURS,
            max_prompt_chars: MAX_PROMPT_BODY_CHARS,
        }
    }
}

impl AppConfig {
    /// Build config from environment variables.
    ///
    /// Credentials are optional here; each operation checks what it needs.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let imap_port = match non_empty_env("MAIL_DIGEST_IMAP_PORT") {
            Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "MAIL_DIGEST_IMAP_PORT".into(),
                message: format!("{e}"),
            })?,
            None => defaults.imap_port,
        };

        Ok(Self {
            email_address: non_empty_env(ENV_EMAIL_ADDRESS),
            email_password: non_empty_env(ENV_EMAIL_PASSWORD).map(SecretString::from),
            gemini_api_key: non_empty_env(ENV_GEMINI_API_KEY).map(SecretString::from),
            imap_host: non_empty_env("MAIL_DIGEST_IMAP_HOST").unwrap_or(defaults.imap_host),
            imap_port,
            folder: non_empty_env("MAIL_DIGEST_FOLDER").unwrap_or(defaults.folder),
            model: non_empty_env("MAIL_DIGEST_MODEL").unwrap_or(defaults.model),
            bind_addr: non_empty_env("MAIL_DIGEST_BIND").unwrap_or(defaults.bind_addr),
            ..defaults
        })
    }

    /// Mailbox credentials, required by both the scan and the summarizer.
    pub fn require_mailbox(&self) -> Result<Credentials, ConfigError> {
        let username = self
            .email_address
            .clone()
            .ok_or_else(|| ConfigError::missing(ENV_EMAIL_ADDRESS))?;
        let password = self
            .email_password
            .clone()
            .ok_or_else(|| ConfigError::missing(ENV_EMAIL_PASSWORD))?;
        Ok(Credentials { username, password })
    }

    /// Mailbox credentials plus the summarization key.
    pub fn require_all(&self) -> Result<(Credentials, SecretString), ConfigError> {
        let credentials = self.require_mailbox()?;
        let api_key = self
            .gemini_api_key
            .clone()
            .filter(|key| !key.expose_secret().is_empty())
            .ok_or_else(|| ConfigError::missing(ENV_GEMINI_API_KEY))?;
        Ok((credentials, api_key))
    }

    /// The fixed offset used for every calendar-date computation.
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> AppConfig {
        AppConfig {
            email_address: Some("reader@163.com".into()),
            email_password: Some(SecretString::from("auth-code")),
            gemini_api_key: Some(SecretString::from("key")),
            ..AppConfig::default()
        }
    }

    #[test]
    fn defaults_point_at_newsletter_folder() {
        let config = AppConfig::default();
        assert_eq!(config.imap_host, "imap.163.com");
        assert_eq!(config.imap_port, 993);
        assert_eq!(config.folder, "Newsletter");
        assert_eq!(config.local_offset().local_minus_utc(), 8 * 3600);
    }

    #[test]
    fn require_mailbox_reports_missing_password() {
        let config = AppConfig {
            email_password: None,
            ..configured()
        };
        let err = config.require_mailbox().unwrap_err();
        assert!(err.to_string().contains(ENV_EMAIL_PASSWORD));
    }

    #[test]
    fn require_all_needs_api_key() {
        let config = AppConfig {
            gemini_api_key: None,
            ..configured()
        };
        assert!(config.require_mailbox().is_ok());
        let err = config.require_all().unwrap_err();
        assert!(err.to_string().contains(ENV_GEMINI_API_KEY));
    }

    #[test]
    fn require_all_returns_everything() {
        let (creds, key) = configured().require_all().unwrap();
        assert_eq!(creds.username, "reader@163.com");
        assert_eq!(key.expose_secret(), "key");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = configured().require_mailbox().unwrap();
        let shown = format!("{creds:?}");
        assert!(!shown.contains("auth-code"));
        assert!(shown.contains("REDACTED"));
    }
}
