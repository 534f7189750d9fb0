//! Logging helpers that keep clinical text out of logs
//!
//! Prompts and responses carry patient information. Log their length, and at
//! most a short preview at trace level.

/// Safely truncates a string to a maximum number of characters, respecting UTF-8 boundaries
///
/// # Examples
///
/// ```rust
/// use quill::utils::logging::truncate_string;
///
/// assert_eq!(truncate_string("Mean gradient 42 mmHg", 13), "Mean gradient");
/// assert_eq!(truncate_string("µg/kg/min", 2), "µg");
/// assert_eq!(truncate_string("Short", 100), "Short");
/// ```
pub fn truncate_string(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Single-line preview with the total length, for trace logs
///
/// ```rust
/// use quill::utils::logging::preview;
///
/// assert_eq!(preview("Severe AS.\nAVA 0.7 cm2", 10), "Severe AS. ... (22 chars)");
/// assert_eq!(preview("TAVI", 10), "TAVI");
/// ```
pub fn preview(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    let flattened: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if total <= max_chars {
        flattened
    } else {
        format!("{} ... ({} chars)", truncate_string(&flattened, max_chars), total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_string_utf8_safe() {
        let text = "Dose 5 µg/kg";
        assert_eq!(truncate_string(text, 8), "Dose 5 µ");
        assert_eq!(truncate_string(text, 0), "");
    }

    #[test]
    fn test_preview_flattens_newlines() {
        assert_eq!(preview("a\nb", 10), "a b");
        assert_eq!(preview("abcdef", 3), "abc ... (6 chars)");
    }
}
