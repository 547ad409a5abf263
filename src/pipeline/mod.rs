//! The two mailbox pipelines.
//!
//! 1. [`UnreadScanner`]: read-only pass over unseen messages, grouped by
//!    local calendar day.
//! 2. [`RangeSummarizer`]: fetch every message in a date range, summarize
//!    its HTML body and stream the growing output.
//!
//! Both open exactly one session per run and close it on every path.

pub mod render;
pub mod scan;
pub mod summarize;
pub mod types;

pub use scan::{UnreadScanner, parse_date_choice};
pub use summarize::{RangeSummarizer, SummaryStream, build_prompt};
pub use types::{DateCount, ScanOutcome, SummaryOutcome, SummaryRecord, SummaryUpdate};
