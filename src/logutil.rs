//! Helpers that keep untrusted text (payloads, downlink bodies, tokens) safe to log.

use std::fmt::Write;

const MAX_PREVIEW: usize = 300;

/// Escape control characters so a log record stays on one line, and cap its length.
///
/// Backslashes are doubled, `\n` `\r` `\t` are written as escapes, and any other control
/// character becomes `\xNN`. Input longer than 300 chars is cut and ends with `…`.
pub fn escape_log(s: &str) -> String {
    preview(s, MAX_PREVIEW)
}

fn preview(s: &str, limit: usize) -> String {
    let mut chars = s.chars();
    let mut escaped = String::with_capacity(s.len().min(limit) + 8);
    for c in chars.by_ref().take(limit) {
        push_escaped(&mut escaped, c);
    }
    if chars.next().is_some() {
        escaped.push('…');
    }
    escaped
}

fn push_escaped(buf: &mut String, c: char) {
    let short = match c {
        '\\' => "\\\\",
        '\n' => "\\n",
        '\r' => "\\r",
        '\t' => "\\t",
        c if c.is_control() => {
            let _ = write!(buf, "\\x{:02X}", c as u32);
            return;
        }
        c => {
            buf.push(c);
            return;
        }
    };
    buf.push_str(short);
}

/// Show only the head of a secret, e.g. `eyJhbGci…(812)`.
pub fn mask_secret(secret: &str) -> String {
    let head: String = secret.chars().take(8).collect();
    format!("{}…({})", preview(&head, 8), secret.chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_control_characters() {
        assert_eq!(escape_log("a\nb\r\tc"), "a\\nb\\r\\tc");
        assert_eq!(escape_log("x\u{1}y"), "x\\x01y");
        assert_eq!(escape_log("C6FC"), "C6FC");
    }

    #[test]
    fn long_input_is_truncated() {
        let out = escape_log(&"A".repeat(400));
        assert_eq!(out.chars().count(), MAX_PREVIEW + 1);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask_secret("abcdefghijkl"), "abcdefgh…(12)");
        assert_eq!(mask_secret(""), "…(0)");
    }
}
