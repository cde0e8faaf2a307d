//! Smol utilities for logging

use std::ascii;

/// Longest run of raw bytes worth putting in a single log line
pub const LOG_EXCERPT: usize = 512;

/// Make an Ascii-safe string
pub fn ascii_escape(s: &[u8]) -> String {
    s.iter()
        .flat_map(|&b| ascii::escape_default(b))
        .map(char::from)
        .collect()
}

/// Like `ascii_escape`, but cut after `limit` input bytes
pub fn ascii_excerpt(s: &[u8], limit: usize) -> String {
    if s.len() <= limit {
        return ascii_escape(s);
    }

    let mut escaped = ascii_escape(&s[.. limit]);
    escaped.push_str("...");
    escaped
}

#[test]
fn escape_keeps_printables() {
    assert_eq!(ascii_escape(b"GET / HTTP/1.1"), "GET / HTTP/1.1");
}

#[test]
fn escape_quotes_control_and_high_bytes() {
    assert_eq!(ascii_escape(b"a\r\n\xff"), "a\\r\\n\\xff");
}

#[test]
fn excerpt_truncates() {
    assert_eq!(ascii_excerpt(b"abcdef", 3), "abc...");
    assert_eq!(ascii_excerpt(b"abc", 3), "abc");
}
