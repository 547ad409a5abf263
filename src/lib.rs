//! Mail digest: scan a newsletter folder for unread mail and summarize the
//! messages of a chosen date range with an LLM.

pub mod config;
pub mod error;
pub mod llm;
pub mod mailbox;
pub mod mime;
pub mod pipeline;
pub mod web;
