//! Cleanup rules applied to every piece of extracted document text before it
//! reaches the cache tiers or the shard stores.

/// Extracted text is truncated at this many characters.
pub const MAX_CONTENT_CHARS: usize = 100_000;

/// Truncate a string to at most `max` characters, always on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Normalize raw extractor output: control characters are stripped (tab, CR
/// and LF survive), runs of horizontal whitespace collapse to one space, runs
/// of more than two newlines collapse to two, and the result is capped at
/// [`MAX_CONTENT_CHARS`].
pub fn clean_extracted(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_CONTENT_CHARS * 4));
    let mut pending_space = false;
    let mut newline_run = 0usize;
    let mut chars_written = 0usize;

    for c in raw.chars() {
        if chars_written >= MAX_CONTENT_CHARS {
            break;
        }
        if c.is_control() && c != '\t' && c != '\r' && c != '\n' {
            continue;
        }
        match c {
            '\r' => continue, // CR folds into the following LF
            '\n' => {
                newline_run += 1;
                pending_space = false;
                if newline_run <= 2 {
                    out.push('\n');
                    chars_written += 1;
                }
            }
            c if c.is_whitespace() => {
                pending_space = true;
            }
            c => {
                if pending_space && !out.is_empty() && newline_run == 0 {
                    out.push(' ');
                    chars_written += 1;
                }
                pending_space = false;
                newline_run = 0;
                out.push(c);
                chars_written += 1;
            }
        }
    }

    // A trailing newline run carries no content
    while out.ends_with('\n') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_control_characters() {
        assert_eq!(clean_extracted("a\u{0}b\u{7}c"), "abc");
    }

    #[test]
    fn collapses_whitespace_runs() {
        assert_eq!(clean_extracted("a   b\t\tc"), "a b c");
    }

    #[test]
    fn collapses_newline_runs_to_two() {
        assert_eq!(clean_extracted("a\n\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn keeps_single_newlines() {
        assert_eq!(clean_extracted("a\nb"), "a\nb");
    }

    #[test]
    fn truncates_multibyte_on_char_boundary() {
        let s = "検索".repeat(60_000);
        let cleaned = clean_extracted(&s);
        assert_eq!(cleaned.chars().count(), MAX_CONTENT_CHARS);
        assert!(cleaned.is_char_boundary(cleaned.len()));
    }

    #[test]
    fn truncate_chars_short_input_unchanged() {
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
    }
}
