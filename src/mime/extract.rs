//! Message text extraction: headers plus the first HTML part as plain text.

use mail_parser::{Message, MessageParser, MessagePart, MimeHeaders, PartType};

use super::header::{decode_charset, decode_header, header_value};

/// Elements rendered as their own line.
const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "center", "dd", "div", "dl", "dt",
    "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav",
    "ol", "p", "pre", "section", "table", "tbody", "td", "tfoot", "th", "thead", "title", "tr",
    "ul",
];

/// Elements whose content is never text.
const SKIPPED_TAGS: &[&str] = &["script", "style", "head", "noscript", "template"];

/// A fetched message reduced to what the summarizer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub subject: String,
    pub sender: String,
    pub date: String,
    /// `None` when the message has no HTML part, or the part renders to
    /// nothing. Such messages are skipped, not reported.
    pub body_text: Option<String>,
}

/// Parse a full RFC 822 message.
pub fn parse_message(raw: &[u8]) -> ParsedMessage {
    let Some(message) = MessageParser::default().parse(raw) else {
        return ParsedMessage {
            subject: decode_header(header_value(raw, "Subject").as_deref()),
            sender: decode_header(header_value(raw, "From").as_deref()),
            date: decode_header(header_value(raw, "Date").as_deref()),
            body_text: None,
        };
    };
    ParsedMessage {
        subject: message.subject().unwrap_or_default().to_string(),
        sender: sender(&message),
        date: message
            .header_raw("Date")
            .map(str::trim)
            .unwrap_or_default()
            .to_string(),
        body_text: html_text(&message),
    }
}

/// Plain text of the first `text/html` part, if any.
pub fn first_html_text(raw: &[u8]) -> Option<String> {
    html_text(&MessageParser::default().parse(raw)?)
}

fn html_text(message: &Message<'_>) -> Option<String> {
    let text = html_to_text(&first_html_part(message)?);
    (!text.is_empty()).then_some(text)
}

/// `Name <address>` of the first From entry, or whichever half is present.
fn sender(message: &Message<'_>) -> String {
    let Some(addr) = message.from().and_then(|a| a.first()) else {
        return String::new();
    };
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) => format!("{name} <{address}>"),
        (Some(name), None) => name.to_string(),
        (None, Some(address)) => address.to_string(),
        (None, None) => String::new(),
    }
}

/// Walk parts in document order and return the first HTML one. Later HTML
/// parts, e.g. inside a nested `multipart/related`, are ignored.
fn first_html_part(message: &Message<'_>) -> Option<String> {
    message
        .parts
        .iter()
        .find(|part| is_html(part))
        .map(part_text)
}

fn is_html(part: &MessagePart<'_>) -> bool {
    MimeHeaders::content_type(part).is_some_and(|ct| {
        ct.ctype().eq_ignore_ascii_case("text")
            && ct.subtype().is_some_and(|s| s.eq_ignore_ascii_case("html"))
    })
}

fn part_text(part: &MessagePart<'_>) -> String {
    match &part.body {
        PartType::Html(html) => html.to_string(),
        PartType::Text(text) => text.to_string(),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
            // Parts flagged as attachments keep their raw bytes.
            let charset = MimeHeaders::content_type(part)
                .and_then(|ct| ct.attribute("charset"))
                .unwrap_or("utf-8");
            decode_charset(charset, bytes)
        }
        _ => String::new(),
    }
}

/// Convert HTML into trimmed, non-empty lines.
///
/// Block elements and `<br>` break lines, inline markup is dropped,
/// `script`/`style`/`head` content and comments are removed and character
/// references are decoded.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(lt) = rest.find('<') {
        out.push_str(&rest[..lt]);
        rest = &rest[lt..];

        if let Some(after) = rest.strip_prefix("<!--") {
            rest = after.find("-->").map_or("", |end| &after[end + 3..]);
            continue;
        }

        // `<` not followed by a tag start is plain text, as is an unclosed tag.
        let opens_tag = rest[1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?'));
        if !opens_tag {
            out.push('<');
            rest = &rest[1..];
            continue;
        }
        let Some(gt) = rest.find('>') else {
            break;
        };
        let tag = &rest[1..gt];
        rest = &rest[gt + 1..];

        let closing = tag.starts_with('/');
        let name = tag_name(tag);

        if !closing && !tag.ends_with('/') && SKIPPED_TAGS.contains(&name.as_str()) {
            rest = skip_element(rest, &name);
            out.push('\n');
        } else if BLOCK_TAGS.contains(&name.as_str()) {
            out.push('\n');
        }
    }
    out.push_str(rest);

    decode_entities(&out)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn tag_name(tag: &str) -> String {
    tag.trim_start_matches('/')
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Return what follows the closing tag of `name`, or nothing if unclosed.
fn skip_element<'a>(rest: &'a str, name: &str) -> &'a str {
    let close = format!("</{name}");
    match rest.to_ascii_lowercase().find(&close) {
        Some(pos) => {
            let after = &rest[pos..];
            after.find('>').map_or("", |gt| &after[gt + 1..])
        }
        None => "",
    }
}

fn decode_entities(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        let decoded = rest[1..]
            .char_indices()
            .take(11)
            .find(|&(_, c)| c == ';')
            .and_then(|(semi, _)| entity_char(&rest[1..semi + 1]).map(|ch| (ch, semi + 2)));

        match decoded {
            Some((ch, consumed)) => {
                out.push(ch);
                rest = &rest[consumed..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn entity_char(name: &str) -> Option<char> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse().ok()?,
        };
        return char::from_u32(code);
    }
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "copy" => '©',
        "reg" => '®',
        "hellip" => '…',
        "mdash" => '—',
        "ndash" => '–',
        "middot" => '·',
        "ldquo" => '“',
        "rdquo" => '”',
        "lsquo" => '‘',
        "rsquo" => '’',
        "zwnj" => '\u{200c}',
        _ => return None,
    })
}
