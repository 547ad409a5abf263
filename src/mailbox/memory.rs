//! In-memory mailbox, used to exercise the pipelines without a server.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::FixedOffset;
use secrecy::ExposeSecret;

use super::{FetchPart, MailSession, MailboxConnector, MessageId, SearchCriteria};
use crate::config::Credentials;
use crate::error::MailboxError;
use crate::mime::header::{decode_header, header_value, local_date, parse_date};

#[derive(Debug, Clone)]
struct StoredMessage {
    raw: Vec<u8>,
    seen: bool,
}

#[derive(Debug, Default)]
struct State {
    folders: HashMap<String, Vec<StoredMessage>>,
    password: Option<String>,
    unreachable: bool,
    failing_fetches: HashSet<u32>,
    connects: usize,
    open_sessions: usize,
    commands: Vec<String>,
}

/// Shared handle; clones see the same mailbox.
#[derive(Debug, Clone)]
pub struct MemoryMailbox {
    state: Arc<Mutex<State>>,
    offset: FixedOffset,
}

impl MemoryMailbox {
    /// Empty mailbox whose date searches use `offset` for calendar dates.
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            state: Arc::default(),
            offset,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ensure `folder` exists even when empty.
    pub fn create_folder(&self, folder: &str) -> &Self {
        self.lock().folders.entry(folder.to_string()).or_default();
        self
    }

    /// Append a message; its sequence number is its 1-based position.
    pub fn add_message(&self, folder: &str, raw: impl Into<Vec<u8>>, seen: bool) -> &Self {
        self.lock()
            .folders
            .entry(folder.to_string())
            .or_default()
            .push(StoredMessage {
                raw: raw.into(),
                seen,
            });
        self
    }

    /// Only this password will be accepted.
    pub fn require_password(&self, password: &str) -> &Self {
        self.lock().password = Some(password.to_string());
        self
    }

    /// Make every connection attempt fail at the transport level.
    pub fn set_unreachable(&self) -> &Self {
        self.lock().unreachable = true;
        self
    }

    /// Make fetches of message `id` fail.
    pub fn fail_fetch(&self, id: u32) -> &Self {
        self.lock().failing_fetches.insert(id);
        self
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    /// Commands issued so far, e.g. `SELECT Newsletter`.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn is_seen(&self, folder: &str, id: u32) -> Option<bool> {
        let state = self.lock();
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        state.folders.get(folder)?.get(index).map(|m| m.seen)
    }
}

#[async_trait]
impl MailboxConnector for MemoryMailbox {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn MailSession>, MailboxError> {
        let mut state = self.lock();
        state.connects += 1;
        if state.unreachable {
            return Err(MailboxError::Connection {
                host: "memory".into(),
                reason: "unreachable".into(),
            });
        }
        if let Some(expected) = &state.password
            && expected != credentials.password.expose_secret()
        {
            return Err(MailboxError::Auth("LOGIN failed".into()));
        }
        state.open_sessions += 1;
        drop(state);

        Ok(Box::new(MemorySession {
            mailbox: self.clone(),
            selected: None,
            readonly: true,
            closed: false,
        }))
    }
}

struct MemorySession {
    mailbox: MemoryMailbox,
    selected: Option<String>,
    readonly: bool,
    closed: bool,
}

impl MemorySession {
    /// Append `command` to the log and hand back the locked state.
    fn record(&self, command: String) -> Result<MutexGuard<'_, State>, MailboxError> {
        if self.closed {
            return Err(MailboxError::Closed);
        }
        let mut state = self.mailbox.lock();
        state.commands.push(command);
        Ok(state)
    }

    /// Append `command` to the log without touching anything else.
    fn log(&self, command: &str) {
        self.mailbox.lock().commands.push(command.to_string());
    }

    fn folder(&self) -> Result<&str, MailboxError> {
        self.selected
            .as_deref()
            .ok_or_else(|| MailboxError::Protocol("no folder selected".into()))
    }
}

#[async_trait]
impl MailSession for MemorySession {
    async fn identify(&mut self) {
        if !self.closed {
            self.log("ID");
        }
    }

    async fn select(&mut self, folder: &str, readonly: bool) -> Result<(), MailboxError> {
        let verb = if readonly { "EXAMINE" } else { "SELECT" };
        let state = self.record(format!("{verb} {folder}"))?;
        let exists = state.folders.contains_key(folder);
        drop(state);

        if exists {
            self.selected = Some(folder.to_string());
            self.readonly = readonly;
            Ok(())
        } else {
            self.selected = None;
            Err(MailboxError::Folder {
                folder: folder.to_string(),
                reason: "no such mailbox".into(),
            })
        }
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<MessageId>, MailboxError> {
        let folder = self.folder()?.to_string();
        let offset = self.mailbox.offset;
        let state = self.record(format!("SEARCH {}", criteria.to_imap()))?;
        let messages = state.folders.get(&folder).map(Vec::as_slice).unwrap_or_default();

        Ok(messages
            .iter()
            .zip(1u32..)
            .filter(|(message, _)| {
                let date = header_value(&message.raw, "Date")
                    .and_then(|v| parse_date(&decode_header(Some(&v))))
                    .map(|dt| local_date(&dt, offset));
                criteria.matches(date, message.seen)
            })
            .map(|(_, id)| MessageId(id))
            .collect())
    }

    async fn fetch(&mut self, id: MessageId, part: FetchPart) -> Result<Vec<u8>, MailboxError> {
        let folder = self.folder()?.to_string();
        let readonly = self.readonly;
        let mut state = self.record(format!("FETCH {id} {}", part.as_imap()))?;

        if state.failing_fetches.contains(&id.0) {
            return Err(MailboxError::Protocol(format!("FETCH {id} failed")));
        }
        let index = usize::try_from(id.0).ok().and_then(|n| n.checked_sub(1));
        let message = match (index, state.folders.get_mut(&folder)) {
            (Some(index), Some(messages)) => messages.get_mut(index),
            _ => None,
        }
        .ok_or_else(|| MailboxError::Protocol(format!("no message {id}")))?;

        match part {
            FetchPart::DateHeader => {
                let date = header_value(&message.raw, "Date").unwrap_or_default();
                Ok(format!("Date: {date}\r\n\r\n").into_bytes())
            }
            FetchPart::Full => {
                if !readonly {
                    message.seen = true;
                }
                Ok(message.raw.clone())
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.selected.take().is_some() {
            self.log("CLOSE");
        }
        self.log("LOGOUT");
        self.closed = true;
        let mut state = self.mailbox.lock();
        state.open_sessions = state.open_sessions.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    fn creds(password: &str) -> Credentials {
        Credentials {
            username: "u".into(),
            password: SecretString::from(password),
        }
    }

    fn message(date: &str) -> String {
        format!("Date: {date}\r\nSubject: s\r\n\r\nbody")
    }

    #[tokio::test]
    async fn date_search_uses_local_calendar_days() {
        let mailbox = MemoryMailbox::new(offset());
        mailbox
            .add_message("Newsletter", message("Wed, 10 Jan 2024 15:59:59 +0000"), false)
            .add_message("Newsletter", message("Wed, 10 Jan 2024 16:00:00 +0000"), false)
            .add_message("Newsletter", message("Tue, 09 Jan 2024 16:00:00 +0000"), false);

        let mut session = mailbox.connect(&creds("x")).await.unwrap();
        session.select("Newsletter", true).await.unwrap();
        let day = chrono::NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let criteria = SearchCriteria::inclusive_range(day, day).unwrap();
        let ids = session.search(&criteria).await.unwrap();
        assert_eq!(ids, vec![MessageId(1), MessageId(3)]);
        session.close().await;
        assert_eq!(mailbox.open_sessions(), 0);
    }

    #[tokio::test]
    async fn full_fetch_marks_seen_only_when_writable() {
        let mailbox = MemoryMailbox::new(offset());
        mailbox.add_message("Newsletter", message("Wed, 10 Jan 2024 09:00:00 +0800"), false);

        let mut session = mailbox.connect(&creds("x")).await.unwrap();
        session.select("Newsletter", true).await.unwrap();
        session.fetch(MessageId(1), FetchPart::Full).await.unwrap();
        assert_eq!(mailbox.is_seen("Newsletter", 1), Some(false));

        session.select("Newsletter", false).await.unwrap();
        session.fetch(MessageId(1), FetchPart::Full).await.unwrap();
        assert_eq!(mailbox.is_seen("Newsletter", 1), Some(true));
        session.close().await;
    }

    #[tokio::test]
    async fn wrong_password_and_missing_folder() {
        let mailbox = MemoryMailbox::new(offset());
        mailbox.require_password("right");
        assert!(matches!(
            mailbox.connect(&creds("wrong")).await,
            Err(MailboxError::Auth(_))
        ));

        let mut session = mailbox.connect(&creds("right")).await.unwrap();
        assert!(matches!(
            session.select("Nope", true).await,
            Err(MailboxError::Folder { .. })
        ));
        session.close().await;
        assert_eq!(mailbox.commands(), vec!["EXAMINE Nope", "LOGOUT"]);
    }

    #[tokio::test]
    async fn close_logs_out_once_and_ends_the_session() {
        let mailbox = MemoryMailbox::new(offset());
        mailbox.create_folder("Newsletter");

        let mut session = mailbox.connect(&creds("x")).await.unwrap();
        session.identify().await;
        session.select("Newsletter", true).await.unwrap();
        session.close().await;
        session.close().await;
        session.identify().await;

        assert_eq!(
            mailbox.commands(),
            vec!["ID", "EXAMINE Newsletter", "CLOSE", "LOGOUT"]
        );
        assert_eq!(mailbox.open_sessions(), 0);
        assert!(matches!(
            session.select("Newsletter", true).await,
            Err(MailboxError::Closed)
        ));
    }
}
