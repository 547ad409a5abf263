//! Shared types for the scan and summarize pipelines.

use chrono::NaiveDate;
use serde::Serialize;

// ── Unread scan ─────────────────────────────────────────────────────

/// Unread messages on one local calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateCount {
    pub date: NaiveDate,
    pub count: usize,
}

impl DateCount {
    /// `2024-01-11 (2封)`
    pub fn label(&self) -> String {
        format!("{} ({}封)", self.date.format("%Y-%m-%d"), self.count)
    }
}

/// Result of one unread scan, ready for a date selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanOutcome {
    pub status: String,
    /// Formatted labels, newest first.
    pub choices: Vec<String>,
    pub counts: Vec<DateCount>,
    pub ok: bool,
}

impl ScanOutcome {
    pub fn found(counts: Vec<DateCount>) -> Self {
        let status = if counts.is_empty() {
            "✅ 操作完成。恭喜！没有未读邮件。"
        } else {
            "✅ 日期解析完毕！请在下方选择日期范围。"
        };
        Self {
            status: status.to_string(),
            choices: counts.iter().map(DateCount::label).collect(),
            counts,
            ok: true,
        }
    }

    pub fn failed(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            choices: Vec::new(),
            counts: Vec::new(),
            ok: false,
        }
    }
}

// ── Range summary ───────────────────────────────────────────────────

/// What the summarizer produced for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryOutcome {
    Summary(String),
    Failed(String),
}

/// One rendered block of the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRecord {
    /// 1-based position in the search result.
    pub ordinal: usize,
    pub subject: String,
    pub sender: String,
    pub date: String,
    pub outcome: SummaryOutcome,
}

/// One observable state of a summarize run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryUpdate {
    pub status: String,
    /// Everything rendered so far.
    pub output: String,
    /// Fraction of messages processed, once the total is known.
    pub progress: Option<f32>,
    /// Set on the last update of a run.
    pub terminal: bool,
}
