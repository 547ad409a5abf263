//! Header decoding: RFC 2047 encoded words, raw header lookup, date parsing.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use tracing::debug;

/// Encoded words in the wild are often missing their padding.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode a header value into plain text.
///
/// `None` yields an empty string. Undecodable bytes become U+FFFD and an
/// encoded word that cannot be parsed is kept verbatim, so this never fails.
pub fn decode_header(value: Option<&str>) -> String {
    match value {
        Some(v) => decode_encoded_words(v),
        None => String::new(),
    }
}

/// Decode every `=?charset?enc?text?=` word in `input`.
///
/// Whitespace between two adjacent encoded words is dropped (RFC 2047 §6.2).
pub fn decode_encoded_words(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut remaining = input;
    let mut last_was_encoded = false;

    while let Some(start) = remaining.find("=?") {
        let before = &remaining[..start];
        if !last_was_encoded || !before.trim().is_empty() {
            result.push_str(before);
        }

        let after_start = &remaining[start + 2..];
        match decode_word(after_start) {
            Some((text, consumed)) => {
                result.push_str(&text);
                remaining = &after_start[consumed..];
                last_was_encoded = true;
            }
            None => {
                result.push_str("=?");
                remaining = after_start;
                last_was_encoded = false;
            }
        }
    }

    result.push_str(remaining);
    result
}

/// Decode one word starting right after `=?`. Returns the text and the number
/// of bytes consumed, including the closing `?=`.
fn decode_word(s: &str) -> Option<(String, usize)> {
    let first_q = s.find('?')?;
    let charset = &s[..first_q];
    if charset.is_empty() || charset.contains(char::is_whitespace) {
        return None;
    }

    let rest = &s[first_q + 1..];
    let second_q = rest.find('?')?;
    let encoding = &rest[..second_q];

    let payload = &rest[second_q + 1..];
    let end = payload.find("?=")?;
    let encoded = &payload[..end];
    if encoded.contains(char::is_whitespace) {
        return None;
    }

    let bytes = match encoding {
        "B" | "b" => LENIENT_BASE64.decode(encoded).ok()?,
        "Q" | "q" => decode_q(encoded),
        _ => return None,
    };

    // RFC 2231 allows a language suffix: `utf-8*en`.
    let charset = charset.split('*').next().unwrap_or(charset);
    Some((decode_charset(charset, &bytes), first_q + 1 + second_q + 1 + end + 2))
}

/// Q encoding: `_` is a space, `=XX` is a byte.
fn decode_q(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                out.push(b' ');
                i += 1;
            }
            b'=' if i + 2 < bytes.len() => {
                match hex_pair(bytes[i + 1], bytes[i + 2]) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'=');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

fn hex_pair(hi: u8, lo: u8) -> Option<u8> {
    let hi = (hi as char).to_digit(16)?;
    let lo = (lo as char).to_digit(16)?;
    u8::try_from(hi * 16 + lo).ok()
}

/// Decode bytes in the named charset, falling back to lossy UTF-8.
pub fn decode_charset(charset: &str, bytes: &[u8]) -> String {
    match encoding_rs::Encoding::for_label(charset.trim().as_bytes()) {
        Some(encoding) => {
            let (decoded, _, had_errors) = encoding.decode(bytes);
            if had_errors {
                debug!(charset, "Replaced undecodable bytes in header");
            }
            decoded.into_owned()
        }
        None => {
            debug!(charset, "Unknown charset, decoding as UTF-8");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Return the raw (still encoded) value of the first header called `name`,
/// with folded continuation lines joined.
pub fn header_value(raw: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut found: Option<String> = None;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            if let Some(value) = found.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if found.is_some() {
            break;
        }
        if let Some((key, value)) = line.split_once(':')
            && key.trim().eq_ignore_ascii_case(name)
        {
            found = Some(value.trim().to_string());
        }
    }

    found
}

/// Parse a mail `Date:` header.
///
/// Accepts RFC 2822 plus the usual damage: trailing zone comments, missing
/// weekday, named zones, single-digit days. A value without a zone is taken
/// as UTC.
pub fn parse_date(value: &str) -> Option<DateTime<FixedOffset>> {
    let trimmed = strip_comment(value.trim());
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt);
    }

    let no_dow = strip_day_of_week(trimmed);
    let zoned = replace_named_zone(no_dow);

    const ZONED: [&str; 3] = ["%d %b %Y %H:%M:%S %z", "%d %b %Y %H:%M %z", "%Y-%m-%d %H:%M:%S %z"];
    for fmt in ZONED {
        if let Ok(dt) = DateTime::parse_from_str(&zoned, fmt) {
            return Some(dt);
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt);
    }

    const NAIVE: [&str; 3] = ["%d %b %Y %H:%M:%S", "%d %b %Y %H:%M", "%Y-%m-%d %H:%M:%S"];
    for fmt in NAIVE {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(no_dow, fmt) {
            return Some(Utc.from_utc_datetime(&ndt).fixed_offset());
        }
    }

    None
}

/// Calendar date of `dt` as seen from `offset`.
pub fn local_date(dt: &DateTime<FixedOffset>, offset: FixedOffset) -> NaiveDate {
    dt.with_timezone(&offset).date_naive()
}

fn strip_comment(s: &str) -> &str {
    match s.find('(') {
        Some(pos) => s[..pos].trim_end(),
        None => s,
    }
}

fn strip_day_of_week(s: &str) -> &str {
    match s.split_once(',') {
        Some((dow, rest)) if dow.trim().chars().all(|c| c.is_ascii_alphabetic()) => rest.trim(),
        _ => {
            let mut parts = s.splitn(2, ' ');
            match (parts.next(), parts.next()) {
                (Some(first), Some(rest))
                    if first.len() == 3 && first.chars().all(|c| c.is_ascii_alphabetic()) =>
                {
                    rest.trim()
                }
                _ => s,
            }
        }
    }
}

fn replace_named_zone(s: &str) -> String {
    const ZONES: [(&str, &str); 9] = [
        ("GMT", "+0000"),
        ("UTC", "+0000"),
        ("UT", "+0000"),
        ("CST", "+0800"),
        ("EST", "-0500"),
        ("EDT", "-0400"),
        ("PST", "-0800"),
        ("PDT", "-0700"),
        ("Z", "+0000"),
    ];
    if let Some((head, last)) = s.rsplit_once(' ') {
        for (name, offset) in ZONES {
            if last.eq_ignore_ascii_case(name) {
                return format!("{head} {offset}");
            }
        }
    }
    s.to_string()
}
