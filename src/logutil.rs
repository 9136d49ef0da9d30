//! Logging utilities for sanitizing user text and binary payloads so logs stay single-line.

use std::fmt::Write;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// UTF-8 safe truncation for log display. Never slices inside a multi-byte char.
pub fn truncate_for_log(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return escape_log(input);
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = escape_log(&input[..cut]);
    out.push_str("...");
    out
}

/// Lowercase hex of at most `max` leading bytes.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(max.min(data.len()) * 2);
    for b in data.iter().take(max) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Meshtastic user-facing node id (`!1234abcd`).
pub fn node_id(num: u32) -> String {
    format!("!{:08x}", num)
}

/// Parse `!1234abcd`, `0x1234ABCD` or a decimal node number.
pub fn parse_node_id(input: &str) -> Option<u32> {
    let s = input.trim();
    if let Some(hex) = s.strip_prefix('!').or_else(|| s.strip_prefix("0x")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_truncates() {
        let s = "Line1\nLine2\r\tEnd";
        let esc = escape_log(s);
        assert_eq!(esc, "Line1\\nLine2\\r\\tEnd");
    }

    #[test]
    fn truncate_does_not_split_multibyte() {
        let s = "ab—cd";
        let out = truncate_for_log(s, 6);
        assert!(out.ends_with("..."));
        assert!(out.starts_with("ab"));
    }

    #[test]
    fn node_id_round_trip() {
        assert_eq!(node_id(0xdeadbeef), "!deadbeef");
        assert_eq!(parse_node_id("!deadbeef"), Some(0xdeadbeef));
        assert_eq!(parse_node_id("0xDEADBEEF"), Some(0xdeadbeef));
        assert_eq!(parse_node_id("42"), Some(42));
        assert_eq!(parse_node_id("!zz"), None);
    }

    #[test]
    fn hex_snippet_caps_output() {
        assert_eq!(hex_snippet(&[0x94, 0xc3, 0x00, 0x10], 2), "94c3");
    }
}
