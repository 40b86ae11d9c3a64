//! branchlm library
//!
//! Streams tokens from a local llama.cpp model over HTTP and keeps every
//! finished turn, including its context state, so later requests can branch
//! from any earlier turn without re-evaluating the conversation.

pub mod inference;
pub mod prompts;
pub mod server;
pub mod storage;
pub mod types;

/// Safely truncate a string at a char boundary, never panics.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // Walk backwards from max_bytes to find a valid char boundary
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Slice by character indices with Python slice semantics.
///
/// Negative indices count back from the end, both ends are clamped to the
/// string, and `start >= end` yields an empty string.
pub fn char_slice(s: &str, start: i64, end: i64) -> &str {
    let len = s.chars().count() as i64;
    let resolve = |idx: i64| (if idx < 0 { (len + idx).max(0) } else { idx.min(len) }) as usize;

    let (from, to) = (resolve(start), resolve(end));
    if from >= to {
        return "";
    }
    let byte_at = |idx: usize| s.char_indices().nth(idx).map(|(b, _)| b).unwrap_or(s.len());
    &s[byte_at(from)..byte_at(to)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str_respects_char_boundary() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello", 3), "hel");
        // 'é' occupies bytes 1..3
        assert_eq!(truncate_str("héllo", 2), "h");
    }

    #[test]
    fn test_char_slice_uses_char_indices() {
        assert_eq!(char_slice("naïve café", 2, 5), "ïve");
        assert_eq!(char_slice("naïve café", 6, 10), "café");
    }

    #[test]
    fn test_char_slice_clamps() {
        assert_eq!(char_slice("abc", 1, 100), "bc");
        assert_eq!(char_slice("abc", 50, 100), "");
        assert_eq!(char_slice("abc", 2, 1), "");
        assert_eq!(char_slice("", 0, 3), "");
    }

    #[test]
    fn test_char_slice_negative_indices_count_from_end() {
        assert_eq!(char_slice("naïve café", -4, 10), "café");
        assert_eq!(char_slice("naïve café", 0, -5), "naïve");
        assert_eq!(char_slice("abc", -100, 2), "ab");
        assert_eq!(char_slice("abc", -1, -2), "");
    }
}
