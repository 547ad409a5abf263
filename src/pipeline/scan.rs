//! Unread scan: count unseen messages per local calendar day.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use chrono::NaiveDate;
use regex::Regex;
use tracing::{debug, info, warn};

use super::types::{DateCount, ScanOutcome};
use crate::config::AppConfig;
use crate::error::{MailboxError, PipelineError};
use crate::mailbox::{FetchPart, MailSession, MailboxConnector, SearchCriteria};
use crate::mime::header::{decode_header, header_value, local_date, parse_date};

pub struct UnreadScanner {
    config: Arc<AppConfig>,
    connector: Arc<dyn MailboxConnector>,
}

impl UnreadScanner {
    pub fn new(config: Arc<AppConfig>, connector: Arc<dyn MailboxConnector>) -> Self {
        Self { config, connector }
    }

    /// Run a scan and format the result for display. Never fails: errors
    /// become the status line of a failed outcome.
    pub async fn scan(&self) -> ScanOutcome {
        match self.scan_dates().await {
            Ok(counts) => {
                info!(days = counts.len(), "Unread scan finished");
                ScanOutcome::found(counts)
            }
            Err(PipelineError::Config(e)) => {
                warn!("Unread scan not configured: {e}");
                ScanOutcome::failed(format!("错误：请先设置邮箱信息 ({e})"))
            }
            Err(e) => {
                warn!("Unread scan failed: {e}");
                ScanOutcome::failed(format!("错误: {e}"))
            }
        }
    }

    /// Unseen-message counts per local date, newest first.
    pub async fn scan_dates(&self) -> Result<Vec<DateCount>, PipelineError> {
        let credentials = self.config.require_mailbox()?;
        let mut session = self.connector.connect(&credentials).await?;
        let result = self.scan_session(session.as_mut()).await;
        session.close().await;
        Ok(result?)
    }

    async fn scan_session(&self, session: &mut dyn MailSession) -> Result<Vec<DateCount>, MailboxError> {
        session.identify().await;
        session.select(&self.config.folder, true).await?;

        let ids = session.search(&SearchCriteria::Unseen).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        info!(unseen = ids.len(), folder = %self.config.folder, "Parsing unread dates");

        let offset = self.config.local_offset();
        let mut per_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        for id in ids {
            let raw = match session.fetch(id, FetchPart::DateHeader).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(id = %id, "Skipping message, date fetch failed: {e}");
                    continue;
                }
            };
            let parsed = header_value(&raw, "Date").and_then(|v| parse_date(&decode_header(Some(&v))));
            match parsed {
                Some(dt) => *per_day.entry(local_date(&dt, offset)).or_default() += 1,
                None => debug!(id = %id, "Dropping message with unparseable Date header"),
            }
        }

        Ok(per_day
            .into_iter()
            .rev()
            .map(|(date, count)| DateCount { date, count })
            .collect())
    }
}

static DATE_CHOICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{4}-\d{2}-\d{2})\s*\(\d+封\)\s*$").unwrap());

/// Parse a selector label back into its date: `"2024-01-11 (2封)"`.
pub fn parse_date_choice(choice: &str) -> Option<NaiveDate> {
    let date = DATE_CHOICE.captures(choice)?.get(1)?;
    NaiveDate::parse_from_str(date.as_str(), "%Y-%m-%d").ok()
}
