//! HTML rendering of summary records into the append-only output buffer.

use super::types::{SummaryOutcome, SummaryRecord};

/// Accumulated output of one run. Records can only be appended.
#[derive(Debug, Default, Clone)]
pub struct OutputBuffer {
    html: String,
    records: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: &SummaryRecord) {
        self.html.push_str(&render_record(record));
        self.records += 1;
    }

    pub fn as_str(&self) -> &str {
        &self.html
    }

    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }
}

/// Render one block: heading, sender/date line, then the summary or error.
pub fn render_record(record: &SummaryRecord) -> String {
    let heading = format!("<h3>{}. {}</h3>", record.ordinal, escape(&record.subject));
    match &record.outcome {
        SummaryOutcome::Summary(summary) => format!(
            "{heading}<p style='color: #555; font-size: 0.9em; margin-top:-10px;'><b>发件人:</b> {}<br><b>日期:</b> {}</p>\
             <div style='border-left: 4px solid #4CAF50; padding-left: 1em; white-space: pre-wrap;'>{}</div><hr>",
            escape(&record.sender),
            escape(&record.date),
            escape(summary),
        ),
        SummaryOutcome::Failed(error) => format!(
            "{heading}<p><b>发件人:</b> {}<br><b>日期:</b> {}</p><p>❌ 调用 Gemini API 失败: {}</p><hr>",
            escape(&record.sender),
            escape(&record.date),
            escape(error),
        ),
    }
}

/// Minimal HTML escaping for text placed in element content.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
