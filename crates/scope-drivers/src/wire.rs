//! Reply-text helpers shared by the vendor adapters.
//!
//! Most replies go through [`scope_scpi::parse_f64`] and friends. The helpers
//! here cover what those do not: values with a unit glued on
//! (`1.00E+09Sa/s`), SI-suffixed memory depths (`14M`, `70K`) and the echoed
//! headers of the legacy Siglent command set.

use scope_core::{ScopeError, ScopeResult};

/// Leading numeric part of `text`, scaled by a `k`/`K`/`M`/`G` suffix.
pub fn leading_number(text: &str) -> Option<f64> {
    let text = text.trim().trim_matches('"');
    let end = text
        .char_indices()
        .find(|&(i, c)| {
            !(c.is_ascii_digit()
                || c == '.'
                || c == '-'
                || c == '+'
                || ((c == 'e' || c == 'E')
                    && text[i + 1..]
                        .starts_with(|n: char| n.is_ascii_digit() || n == '-' || n == '+')))
        })
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let value: f64 = text[..end].parse().ok()?;
    let scale = match text[end..].chars().next() {
        Some('k' | 'K') => 1e3,
        Some('M') => 1e6,
        Some('G') => 1e9,
        _ => 1.0,
    };
    Some(value * scale)
}

/// Drop an echoed command header: `C1:VDIV 1.00E-01V` → `1.00E-01V`.
pub fn strip_header(reply: &str) -> &str {
    let reply = reply.trim();
    match reply.split_once(' ') {
        Some((head, rest))
            if head.contains(':')
                || (head.len() > 1 && head.chars().all(|c| c.is_ascii_uppercase())) =>
        {
            rest.trim()
        }
        _ => reply,
    }
}

/// Number from a reply that may carry an echoed header, a unit and an SI suffix.
pub fn parse_number(reply: &str) -> ScopeResult<f64> {
    leading_number(strip_header(reply)).ok_or_else(|| ScopeError::parse(reply, "number"))
}

/// Memory depth in the suffixed form Siglent accepts (`10k`, `2.5M`).
pub fn fmt_depth(points: u64) -> String {
    if points >= 1_000_000 && points % 100_000 == 0 {
        trim_float(points as f64 / 1e6) + "M"
    } else if points >= 1_000 && points % 100 == 0 {
        trim_float(points as f64 / 1e3) + "k"
    } else {
        points.to_string()
    }
}

fn trim_float(v: f64) -> String {
    let s = format!("{:.1}", v);
    s.strip_suffix(".0").map(str::to_string).unwrap_or(s)
}
