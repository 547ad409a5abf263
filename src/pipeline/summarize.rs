//! Range summary: fetch every message in a local date range, summarize the
//! HTML ones and stream the growing output.

use std::pin::Pin;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use super::render::OutputBuffer;
use super::types::{SummaryOutcome, SummaryRecord, SummaryUpdate};
use crate::config::{AppConfig, Credentials};
use crate::error::{ConfigError, MailboxError, PipelineError};
use crate::llm::{self, LlmProvider};
use crate::mailbox::{FetchPart, MailSession, MailboxConnector, SearchCriteria};
use crate::mime::extract::parse_message;

/// Stream of states for one run; the last item has `terminal` set.
pub type SummaryStream = Pin<Box<dyn Stream<Item = SummaryUpdate> + Send>>;

/// Build the summarization prompt from at most `max_chars` characters of body.
pub fn build_prompt(body: &str, max_chars: usize) -> String {
    let prefix: String = body.chars().take(max_chars).collect();
    format!("请用中文全面、详细地总结以下邮件内容（不用Markdown回复）:\n\n---\n\n{prefix}")
}

/// Subject shortened for status lines.
fn short_subject(subject: &str) -> String {
    subject.chars().take(20).collect()
}

/// Pushes states to the consumer. A dropped consumer does not stop the run.
struct Updates {
    tx: mpsc::UnboundedSender<SummaryUpdate>,
}

impl Updates {
    fn send(&self, status: impl Into<String>, output: &OutputBuffer, progress: Option<f32>, terminal: bool) {
        let update = SummaryUpdate {
            status: status.into(),
            output: output.as_str().to_string(),
            progress,
            terminal,
        };
        if self.tx.send(update).is_err() {
            debug!("Summary consumer went away");
        }
    }

    fn status(&self, status: impl Into<String>, output: &OutputBuffer) {
        self.send(status, output, None, false);
    }

    fn progress(&self, status: impl Into<String>, output: &OutputBuffer, fraction: f32) {
        self.send(status, output, Some(fraction), false);
    }

    fn finish(&self, status: impl Into<String>, output: &OutputBuffer, progress: Option<f32>) {
        self.send(status, output, progress, true);
    }
}

pub struct RangeSummarizer {
    config: Arc<AppConfig>,
    connector: Arc<dyn MailboxConnector>,
    /// Absent when no API key was configured.
    llm: Option<Arc<dyn LlmProvider>>,
}

impl RangeSummarizer {
    pub fn new(
        config: Arc<AppConfig>,
        connector: Arc<dyn MailboxConnector>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        Self { config, connector, llm }
    }

    /// Start a run over `[start, end]` (local dates, inclusive) and return
    /// its updates. Must be called inside a tokio runtime.
    pub fn summarize_range(self: &Arc<Self>, start: NaiveDate, end: NaiveDate) -> SummaryStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(start, end, Updates { tx }).await;
        });
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    async fn run(&self, start: NaiveDate, end: NaiveDate, updates: Updates) {
        let mut output = OutputBuffer::new();

        let (credentials, llm, criteria) = match self.preflight(start, end) {
            Ok(ready) => ready,
            Err(PipelineError::Config(e)) => {
                warn!("Summarize run not configured: {e}");
                updates.finish("❌ 错误：启动失败！请检查所有Secrets是否都已正确配置。", &output, None);
                return;
            }
            Err(e) => {
                updates.finish(format!("❌ 错误：{e}"), &output, None);
                return;
            }
        };

        updates.status("正在连接到IMAP服务器...", &output);
        let mut session = match self.connector.connect(&credentials).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Summarize run could not connect: {e}");
                updates.finish(format!("发生严重错误: {e}"), &output, None);
                return;
            }
        };

        let result = self
            .run_session(session.as_mut(), llm.as_ref(), &criteria, start, end, &mut output, &updates)
            .await;
        session.close().await;

        match result {
            Ok((status, progress)) => updates.finish(status, &output, progress),
            Err(MailboxError::Folder { folder, reason }) => {
                warn!(folder = %folder, "Cannot select folder: {reason}");
                updates.finish(format!("❌ 错误：无法选择文件夹 '{folder}'。"), &output, None);
            }
            Err(e) => {
                warn!("Summarize run aborted: {e}");
                updates.finish(format!("发生严重错误: {e}"), &output, None);
            }
        }
    }

    fn preflight(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<(Credentials, Arc<dyn LlmProvider>, SearchCriteria), PipelineError> {
        let (credentials, _key) = self.config.require_all()?;
        let llm = self
            .llm
            .clone()
            .ok_or_else(|| ConfigError::missing(crate::config::ENV_GEMINI_API_KEY))?;
        let invalid = || PipelineError::InvalidRange {
            start: start.to_string(),
            end: end.to_string(),
        };
        if start > end {
            return Err(invalid());
        }
        let criteria = SearchCriteria::inclusive_range(start, end).ok_or_else(invalid)?;
        Ok((credentials, llm, criteria))
    }

    /// Everything between login and logout. Returns the final status; the
    /// caller emits it once the session is closed.
    #[allow(clippy::too_many_arguments)]
    async fn run_session(
        &self,
        session: &mut dyn MailSession,
        llm: &dyn LlmProvider,
        criteria: &SearchCriteria,
        start: NaiveDate,
        end: NaiveDate,
        output: &mut OutputBuffer,
        updates: &Updates,
    ) -> Result<(String, Option<f32>), MailboxError> {
        session.identify().await;
        updates.status("✅ 登录成功，正在选择文件夹...", output);
        session.select(&self.config.folder, false).await?;

        updates.status(
            format!(
                "正在搜索从 {} 到 {} 的邮件...",
                start.format("%Y-%m-%d"),
                end.format("%Y-%m-%d")
            ),
            output,
        );
        let ids = session.search(criteria).await?;
        if ids.is_empty() {
            return Ok(("✅ 搜索完成！在指定日期范围内没有收到任何邮件。".to_string(), None));
        }

        let total = ids.len();
        info!(total, start = %start, end = %end, "Summarizing messages");
        updates.progress(format!("✅ 找到 {total} 封邮件，准备开始处理..."), output, 0.0);

        for (index, id) in ids.into_iter().enumerate() {
            let ordinal = index + 1;
            updates.progress(
                format!("正在处理第 {ordinal}/{total} 封邮件"),
                output,
                index as f32 / total as f32,
            );

            let raw = match session.fetch(id, FetchPart::Full).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(id = %id, "Skipping message, fetch failed: {e}");
                    continue;
                }
            };

            let message = parse_message(&raw);
            let Some(body) = message.body_text.as_deref() else {
                debug!(id = %id, subject = %message.subject, "No HTML body, skipping");
                continue;
            };

            updates.status(
                format!("正在为邮件“{}...”调用AI总结...", short_subject(&message.subject)),
                output,
            );
            let prompt = build_prompt(body, self.config.max_prompt_chars);
            let (outcome, status) = match llm::summarize(llm, &prompt).await {
                Ok(summary) => (
                    SummaryOutcome::Summary(summary),
                    format!("第 {ordinal}/{total} 封邮件总结完毕..."),
                ),
                Err(e) => {
                    warn!(id = %id, "Summarization failed: {e}");
                    (
                        SummaryOutcome::Failed(e.to_string()),
                        format!("第 {ordinal}/{total} 封邮件AI总结失败。"),
                    )
                }
            };

            output.push(&SummaryRecord {
                ordinal,
                subject: message.subject,
                sender: message.sender,
                date: message.date,
                outcome,
            });
            updates.progress(status, output, ordinal as f32 / total as f32);
        }

        Ok((format!("🎉 全部 {total} 封邮件处理完毕！"), Some(1.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::StreamExt;
    use secrecy::SecretString;

    use crate::error::LlmError;
    use crate::llm::{CompletionRequest, CompletionResponse};
    use crate::mailbox::MemoryMailbox;

    /// Echoes the first body line; fails when the prompt contains "FAIL".
    #[derive(Default)]
    struct StubLlm {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            if request.prompt.contains("FAIL") {
                return Err(LlmError::RateLimited { provider: "stub".into() });
            }
            let body = request.prompt.rsplit("---\n\n").next().unwrap_or_default();
            Ok(CompletionResponse {
                content: format!("summary of {}", body.lines().next().unwrap_or_default()),
                input_tokens: 0,
                output_tokens: 0,
            })
        }
    }

    fn config() -> AppConfig {
        AppConfig {
            email_address: Some("reader@163.com".into()),
            email_password: Some(SecretString::from("code")),
            gemini_api_key: Some(SecretString::from("key")),
            ..AppConfig::default()
        }
    }

    fn html_msg(subject: &str, date: &str, body: &str) -> String {
        format!(
            "From: Digest <d@example.com>\r\nSubject: {subject}\r\nDate: {date}\r\n\
             Content-Type: text/html; charset=utf-8\r\n\r\n<p>{body}</p>\r\n"
        )
    }

    fn plain_msg(subject: &str, date: &str) -> String {
        format!(
            "From: d@example.com\r\nSubject: {subject}\r\nDate: {date}\r\n\
             Content-Type: text/plain\r\n\r\njust text\r\n"
        )
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn summarizer(config: AppConfig, mailbox: &MemoryMailbox, llm: Option<Arc<StubLlm>>) -> Arc<RangeSummarizer> {
        Arc::new(RangeSummarizer::new(
            Arc::new(config),
            Arc::new(mailbox.clone()),
            llm.map(|l| l as Arc<dyn LlmProvider>),
        ))
    }

    async fn collect(s: &Arc<RangeSummarizer>, start: NaiveDate, end: NaiveDate) -> Vec<SummaryUpdate> {
        s.summarize_range(start, end).collect().await
    }

    fn newsletter(config: &AppConfig) -> MemoryMailbox {
        let mailbox = MemoryMailbox::new(config.local_offset());
        mailbox.create_folder("Newsletter");
        mailbox
    }

    #[tokio::test]
    async fn skips_messages_without_html() {
        let config = config();
        let mb = newsletter(&config);
        mb.add_message("Newsletter", html_msg("One", "Wed, 10 Jan 2024 08:00:00 +0800", "first"), false)
            .add_message("Newsletter", plain_msg("Two", "Wed, 10 Jan 2024 09:00:00 +0800"), false)
            .add_message("Newsletter", html_msg("Three", "Wed, 10 Jan 2024 10:00:00 +0800", "third"), false);
        let llm = Arc::new(StubLlm::default());

        let updates = collect(&summarizer(config, &mb, Some(Arc::clone(&llm))), day(10), day(10)).await;
        let last = updates.last().unwrap();

        assert!(last.terminal);
        assert_eq!(last.status, "🎉 全部 3 封邮件处理完毕！");
        assert_eq!(last.output.matches("<h3>").count(), 2);
        let one = last.output.find("<h3>1. One</h3>").unwrap();
        let three = last.output.find("<h3>3. Three</h3>").unwrap();
        assert!(one < three);
        assert!(last.output.contains("summary of first"));
        assert!(!last.output.contains("Two"));
        assert!(!last.output.contains("❌"));
        assert_eq!(llm.prompts.lock().unwrap().len(), 2);
        assert_eq!(mb.open_sessions(), 0);
        assert!(mb.commands().contains(&"SELECT Newsletter".to_string()));
    }

    #[tokio::test]
    async fn failed_summary_is_recorded_and_run_continues() {
        let config = config();
        let mb = newsletter(&config);
        mb.add_message("Newsletter", html_msg("A", "Wed, 10 Jan 2024 08:00:00 +0800", "alpha"), false)
            .add_message("Newsletter", html_msg("B", "Wed, 10 Jan 2024 09:00:00 +0800", "FAIL here"), false)
            .add_message("Newsletter", html_msg("C", "Wed, 10 Jan 2024 10:00:00 +0800", "gamma"), false);

        let s = summarizer(config, &mb, Some(Arc::new(StubLlm::default())));
        let updates = collect(&s, day(10), day(10)).await;
        let output = &updates.last().unwrap().output;

        let a = output.find("<h3>1. A</h3>").unwrap();
        let b = output.find("<h3>2. B</h3>").unwrap();
        let c = output.find("<h3>3. C</h3>").unwrap();
        assert!(a < b && b < c);
        assert!(output.contains("summary of alpha"));
        assert!(output.contains("summary of gamma"));
        assert!(output.contains("❌ 调用 Gemini API 失败: Provider stub rate limited"));
        assert!(updates.iter().any(|u| u.status == "第 2/3 封邮件AI总结失败。"));
    }

    #[tokio::test]
    async fn output_only_grows_and_progress_never_decreases() {
        let config = config();
        let mb = newsletter(&config);
        for hour in 8..12 {
            let date = format!("Wed, 10 Jan 2024 {hour:02}:00:00 +0800");
            mb.add_message("Newsletter", html_msg("S", &date, "body"), false);
        }

        let s = summarizer(config, &mb, Some(Arc::new(StubLlm::default())));
        let updates = collect(&s, day(10), day(10)).await;

        let mut previous = String::new();
        let mut last_progress = 0.0f32;
        for update in &updates {
            assert!(update.output.starts_with(&previous));
            previous = update.output.clone();
            if let Some(p) = update.progress {
                assert!(p >= last_progress);
                last_progress = p;
            }
        }
        assert_eq!(updates.iter().filter(|u| u.terminal).count(), 1);
        assert_eq!(last_progress, 1.0);
    }

    #[tokio::test]
    async fn range_boundaries_use_local_days() {
        let config = config();
        let mb = newsletter(&config);
        // 23:59:59 on the 10th local, then 00:00:00 on the 11th local
        mb.add_message("Newsletter", html_msg("Edge", "Wed, 10 Jan 2024 15:59:59 +0000", "in"), false)
            .add_message("Newsletter", html_msg("Next", "Wed, 10 Jan 2024 16:00:00 +0000", "out"), false);

        let s = summarizer(config, &mb, Some(Arc::new(StubLlm::default())));
        let updates = collect(&s, day(9), day(10)).await;
        let last = updates.last().unwrap();
        assert_eq!(last.status, "🎉 全部 1 封邮件处理完毕！");
        assert!(last.output.contains("Edge"));
        assert!(!last.output.contains("Next"));
        assert!(mb.commands().contains(&"SEARCH SINCE 09-Jan-2024 BEFORE 11-Jan-2024".to_string()));
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_any_network() {
        let config = AppConfig {
            gemini_api_key: None,
            ..config()
        };
        let mb = newsletter(&config);
        let s = summarizer(config, &mb, Some(Arc::new(StubLlm::default())));

        let updates = collect(&s, day(10), day(10)).await;
        assert_eq!(updates.len(), 1);
        assert!(updates[0].terminal);
        assert_eq!(updates[0].status, "❌ 错误：启动失败！请检查所有Secrets是否都已正确配置。");
        assert!(updates[0].output.is_empty());
        assert_eq!(mb.connect_count(), 0);
    }

    #[tokio::test]
    async fn missing_provider_is_a_config_error() {
        let config = config();
        let mb = newsletter(&config);
        let updates = collect(&summarizer(config, &mb, None), day(10), day(10)).await;
        assert_eq!(updates.len(), 1);
        assert!(updates[0].status.contains("Secrets"));
        assert_eq!(mb.connect_count(), 0);
    }

    #[tokio::test]
    async fn reversed_range_is_rejected() {
        let config = config();
        let mb = newsletter(&config);
        let s = summarizer(config, &mb, Some(Arc::new(StubLlm::default())));
        let updates = collect(&s, day(11), day(10)).await;
        assert_eq!(updates.len(), 1);
        assert!(updates[0].terminal);
        assert!(updates[0].status.contains("Invalid date range"));
        assert_eq!(mb.connect_count(), 0);
    }

    #[tokio::test]
    async fn empty_range_is_success_with_no_output() {
        let config = config();
        let mb = newsletter(&config);
        mb.add_message("Newsletter", html_msg("Old", "Mon, 01 Jan 2024 08:00:00 +0800", "x"), false);
        let s = summarizer(config, &mb, Some(Arc::new(StubLlm::default())));

        let updates = collect(&s, day(10), day(10)).await;
        let last = updates.last().unwrap();
        assert!(last.terminal);
        assert_eq!(last.status, "✅ 搜索完成！在指定日期范围内没有收到任何邮件。");
        assert!(last.output.is_empty());
        assert_eq!(mb.open_sessions(), 0);
    }

    #[tokio::test]
    async fn connection_and_folder_failures_are_terminal() {
        let config = config();

        let unreachable = newsletter(&config);
        unreachable.set_unreachable();
        let s = summarizer(config.clone(), &unreachable, Some(Arc::new(StubLlm::default())));
        let last = collect(&s, day(10), day(10)).await.pop().unwrap();
        assert!(last.terminal);
        assert!(last.status.starts_with("发生严重错误: "));

        let no_folder = MemoryMailbox::new(config.local_offset());
        let s = summarizer(config, &no_folder, Some(Arc::new(StubLlm::default())));
        let last = collect(&s, day(10), day(10)).await.pop().unwrap();
        assert_eq!(last.status, "❌ 错误：无法选择文件夹 'Newsletter'。");
        assert_eq!(no_folder.open_sessions(), 0);
        assert_eq!(no_folder.commands().last().map(String::as_str), Some("LOGOUT"));
    }

    #[tokio::test]
    async fn fetch_failure_skips_one_message() {
        let config = config();
        let mb = newsletter(&config);
        mb.add_message("Newsletter", html_msg("A", "Wed, 10 Jan 2024 08:00:00 +0800", "a"), false)
            .add_message("Newsletter", html_msg("B", "Wed, 10 Jan 2024 09:00:00 +0800", "b"), false)
            .fail_fetch(1);
        let s = summarizer(config, &mb, Some(Arc::new(StubLlm::default())));
        let last = collect(&s, day(10), day(10)).await.pop().unwrap();
        assert!(!last.output.contains("<h3>1."));
        assert!(last.output.contains("<h3>2. B</h3>"));
    }

    #[test]
    fn prompt_truncates_by_characters() {
        let body = "字".repeat(10);
        let prompt = build_prompt(&body, 4);
        assert!(prompt.starts_with("请用中文全面、详细地总结以下邮件内容"));
        assert!(prompt.ends_with("---\n\n字字字字"));
    }
}
