//! Mailbox access: the session seam used by the pipelines, search criteria,
//! and the IMAP and in-memory implementations.

pub mod imap;
pub mod memory;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::config::Credentials;
use crate::error::MailboxError;

pub use imap::ImapConnector;
pub use memory::MemoryMailbox;

/// Message sequence number as returned by `SEARCH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u32);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which part of a message to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPart {
    /// Only the `Date:` header, without touching the `\Seen` flag.
    DateHeader,
    /// The complete RFC 822 message.
    Full,
}

impl FetchPart {
    pub fn as_imap(self) -> &'static str {
        match self {
            Self::DateHeader => "BODY.PEEK[HEADER.FIELDS (DATE)]",
            Self::Full => "RFC822",
        }
    }
}

/// Search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCriteria {
    Unseen,
    /// Half-open: `since <= date < before`.
    DateRange { since: NaiveDate, before: NaiveDate },
}

impl SearchCriteria {
    /// Messages whose local date lies in `[start, end]`, both inclusive.
    ///
    /// Returns `None` if `end` is the last representable date.
    pub fn inclusive_range(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        Some(Self::DateRange {
            since: start,
            before: end.succ_opt()?,
        })
    }

    /// IMAP `SEARCH` arguments.
    pub fn to_imap(&self) -> String {
        match self {
            Self::Unseen => "UNSEEN".to_string(),
            Self::DateRange { since, before } => format!(
                "SINCE {} BEFORE {}",
                imap_date(*since),
                imap_date(*before)
            ),
        }
    }

    /// Whether a message with the given local date and flags matches.
    pub fn matches(&self, local_date: Option<NaiveDate>, seen: bool) -> bool {
        match self {
            Self::Unseen => !seen,
            Self::DateRange { since, before } => {
                local_date.is_some_and(|d| *since <= d && d < *before)
            }
        }
    }
}

/// `10-Jan-2024`, the date form used by IMAP search keys.
pub fn imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

/// Opens authenticated sessions.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    /// Connect and log in. Fails with [`MailboxError::Auth`] on bad
    /// credentials and [`MailboxError::Connection`] / [`MailboxError::Tls`]
    /// on transport failures.
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn MailSession>, MailboxError>;
}

/// One authenticated connection. Owns at most one selected folder.
///
/// Callers must invoke [`MailSession::close`] on every exit path.
#[async_trait]
pub trait MailSession: Send {
    /// Send the client-identification command. Rejections are logged only.
    async fn identify(&mut self);

    async fn select(&mut self, folder: &str, readonly: bool) -> Result<(), MailboxError>;

    /// An empty result is not an error.
    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<MessageId>, MailboxError>;

    async fn fetch(&mut self, id: MessageId, part: FetchPart) -> Result<Vec<u8>, MailboxError>;

    /// Close the selected folder, if any, and log out. Never fails.
    async fn close(&mut self);
}
