//! Small string helpers shared across the gateway.

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Log lines carry message previews; this keeps them bounded without ever
/// slicing inside a multi-byte UTF-8 character.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    let Some((cut, _)) = s.char_indices().nth(max_chars) else {
        return s.to_string();
    };
    format!("{}...", s[..cut].trim_end())
}

/// Return the greatest valid UTF-8 char boundary at or below `index`.
///
/// Mirrors `str::floor_char_boundary` while remaining compatible with stable
/// toolchains where that API is not available.
pub fn floor_utf8_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    (0..=index).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_string_is_unchanged() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
        assert_eq!(truncate_with_ellipsis("hello", 5), "hello");
        assert_eq!(truncate_with_ellipsis("", 10), "");
    }

    #[test]
    fn truncate_long_string_appends_ellipsis() {
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
        let long = "a".repeat(200);
        let result = truncate_with_ellipsis(&long, 50);
        assert_eq!(result.len(), 53);
        assert!(result.ends_with("..."));
    }

    #[test]
    fn truncate_respects_multibyte_boundaries() {
        assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
        assert_eq!(truncate_with_ellipsis("Hi 😊", 10), "Hi 😊");
        let result = truncate_with_ellipsis("مرحبا بكم في المتجر", 8);
        assert!(result.ends_with("..."));
    }

    #[test]
    fn floor_boundary_ascii_and_multibyte() {
        assert_eq!(floor_utf8_char_boundary("hello", 3), 3);
        assert_eq!(floor_utf8_char_boundary("hello", 99), 5);
        let s = "aé你🦀";
        // Index 2 is inside "é"; floor moves back to 1.
        assert_eq!(floor_utf8_char_boundary(s, 2), 1);
        // Index 5 is inside "你"; floor moves back to 3.
        assert_eq!(floor_utf8_char_boundary(s, 5), 3);
    }
}
