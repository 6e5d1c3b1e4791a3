//! Helpers for pulling normalized fields out of parsed MIME messages.

use chrono::{DateTime, Utc};
use mail_parser::HeaderValue;

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    // Normalize whitespace
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract email addresses from an optional mail_parser Address field.
///
/// Returns an empty vec if the address is None.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

/// Sender address and display name, `("unknown", None)` when absent.
pub fn extract_sender(parsed: &mail_parser::Message) -> (String, Option<String>) {
    let first = parsed.from().and_then(|addr| addr.first());
    let address = first
        .and_then(|a| a.address())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".into());
    let name = first
        .and_then(|a| a.name())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    (address, name)
}

/// Plain-text body, falling back to the HTML part with tags removed.
pub fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Message-id style header as angle-bracketed ids separated by spaces.
pub fn header_ids(value: &HeaderValue) -> Option<String> {
    let ids: Vec<String> = match value {
        HeaderValue::Text(id) => vec![bracket_id(id)],
        HeaderValue::TextList(ids) => ids.iter().map(|id| bracket_id(id)).collect(),
        _ => Vec::new(),
    };
    let ids: Vec<String> = ids.into_iter().filter(|id| id != "<>").collect();
    if ids.is_empty() { None } else { Some(ids.join(" ")) }
}

/// Wrap a bare message id in angle brackets.
pub fn bracket_id(id: &str) -> String {
    let id = id.trim().trim_start_matches('<').trim_end_matches('>');
    format!("<{id}>")
}

pub fn to_utc(date: &mail_parser::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(date.to_timestamp(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── HTML stripping ──────────────────────────────────────────────

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
    }

    #[test]
    fn strip_html_nested_tags() {
        assert_eq!(
            strip_html("<div><p>Need <b>5</b> servers</p></div>"),
            "Need 5 servers"
        );
    }

    #[test]
    fn strip_html_whitespace_normalized() {
        assert_eq!(strip_html("<p>a</p>\n\n   <p>b</p>"), "a b");
    }

    // ── Parsed message helpers ──────────────────────────────────────

    fn parse(raw: &str) -> mail_parser::Message<'_> {
        mail_parser::MessageParser::default()
            .parse(raw.as_bytes())
            .unwrap()
    }

    #[test]
    fn sender_with_display_name() {
        let msg = parse("From: Jane Buyer <jane@acme.test>\r\nSubject: hi\r\n\r\nbody");
        let (address, name) = extract_sender(&msg);
        assert_eq!(address, "jane@acme.test");
        assert_eq!(name.as_deref(), Some("Jane Buyer"));
    }

    #[test]
    fn missing_sender_is_unknown() {
        let msg = parse("Subject: hi\r\n\r\nbody");
        assert_eq!(extract_sender(&msg), ("unknown".to_string(), None));
    }

    #[test]
    fn html_only_body_is_stripped() {
        let msg = parse(
            "From: a@b.test\r\nContent-Type: text/html\r\n\r\n<html><body><p>Need quotes</p></body></html>",
        );
        assert_eq!(extract_text(&msg), "Need quotes");
    }

    #[test]
    fn recipients_from_list() {
        let msg = parse("From: a@b.test\r\nTo: sales@acme.test, ops@acme.test\r\n\r\nx");
        assert_eq!(
            extract_addresses(msg.to()),
            vec!["sales@acme.test".to_string(), "ops@acme.test".to_string()]
        );
    }

    #[test]
    fn references_become_bracketed_list() {
        let msg = parse(
            "From: a@b.test\r\nReferences: <one@x> <two@x>\r\nIn-Reply-To: <two@x>\r\n\r\nx",
        );
        assert_eq!(header_ids(msg.references()).as_deref(), Some("<one@x> <two@x>"));
        assert_eq!(header_ids(msg.in_reply_to()).as_deref(), Some("<two@x>"));
    }

    #[test]
    fn bracket_id_is_idempotent() {
        assert_eq!(bracket_id("abc@x"), "<abc@x>");
        assert_eq!(bracket_id("<abc@x>"), "<abc@x>");
    }
}
