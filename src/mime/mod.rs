//! MIME helpers: header decoding and readable-text extraction.

pub mod extract;
pub mod header;

pub use extract::{ParsedMessage, html_to_text, parse_message};
pub use header::{decode_header, header_value, local_date, parse_date};
