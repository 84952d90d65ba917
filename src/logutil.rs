//! Log rendering helpers for radio payloads and user input, which can
//! contain anything: newlines, terminal control bytes, multi-kilobyte
//! reassembled messages. Log records stay single-line and bounded.

/// Default byte budget for a payload preview in a log record.
const DEFAULT_PREVIEW_BYTES: usize = 240;

/// Render a string single-line at the default preview budget.
pub fn escape_log(s: &str) -> String {
    log_preview(s, DEFAULT_PREVIEW_BYTES)
}

/// Render a string single-line within roughly `max_bytes` of output.
/// Backslashes and control characters are rendered with
/// [`char::escape_default`] (`\n`, `\t`, `\u{1f}`, ...). When the budget
/// runs out, a `..(+N chars)` marker reports how much was dropped, so a
/// truncated frame is distinguishable from a short one.
pub fn log_preview(s: &str, max_bytes: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_bytes) + 16);
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' || ch.is_control() {
            out.extend(ch.escape_default());
        } else {
            out.push(ch);
        }
        if out.len() >= max_bytes {
            let dropped = chars.clone().count();
            if dropped > 0 {
                use std::fmt::Write;
                let _ = write!(out, " ..(+{} chars)", dropped);
            }
            break;
        }
    }
    out
}

/// Short prefix of a UUID (or any id) for log lines.
pub fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}
