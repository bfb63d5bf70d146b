//! Helpers that keep gateway payloads readable (and single-line) in logs.

use std::fmt::Write;

/// Longest payload preview emitted into a log line.
const MAX_PREVIEW: usize = 240;

/// Escape a payload for single-line logging.
///
/// Newlines, carriage returns, tabs and backslashes are escaped, other control
/// characters become `\xNN`, and anything past [`MAX_PREVIEW`] characters is cut
/// with an ellipsis so a large JSON document never floods the log.
pub fn escape_log(s: &str) -> String {
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

/// Lower-case hex of the first `max` bytes of a binary envelope.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(max.min(data.len()) * 2 + 1);
    for b in data.iter().take(max) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    if data.len() > max {
        out.push('…');
    }
    out
}

/// Mask a secret for display, keeping only its length visible.
pub fn redact(secret: &str) -> String {
    if secret.is_empty() {
        "<unset>".to_string()
    } else {
        format!("<{} chars>", secret.chars().count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_tabs() {
        let esc = escape_log("{\"a\":1,\n\t\"b\":2}\r");
        assert_eq!(esc, "{\"a\":1,\\n\\t\"b\":2}\\r");
    }

    #[test]
    fn truncates_long_payloads() {
        let long = "x".repeat(MAX_PREVIEW + 50);
        let esc = escape_log(&long);
        assert!(esc.ends_with('…'));
        assert_eq!(esc.chars().count(), MAX_PREVIEW + 1);
    }

    #[test]
    fn hex_snippet_marks_truncation() {
        assert_eq!(hex_snippet(&[0x0a, 0xff, 0x01], 8), "0aff01");
        assert_eq!(hex_snippet(&[0x0a, 0xff, 0x01], 2), "0aff…");
    }

    #[test]
    fn redact_hides_content() {
        assert_eq!(redact(""), "<unset>");
        assert_eq!(redact("hunter2"), "<7 chars>");
    }
}
