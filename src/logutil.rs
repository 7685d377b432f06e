//! Log sanitization for strings that arrive from the radio network.
//! Node names are attacker-controlled; keep them on one log line.

/// Escape a string for single-line logging:
/// - `\n`, `\r`, `\t` and backslash are backslash-escaped
/// - other control characters become `\u{NN}` escapes
///
/// Long strings are cut at `MAX_CHARS` with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_CHARS: usize = 160;
    let mut out = String::with_capacity(s.len().min(MAX_CHARS) + 4);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_CHARS {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\u{{{:02x}}}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
