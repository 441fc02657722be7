pub use self::prebuffered::Prebuffered;

mod prebuffered;

pub(crate) const CRLF: &[u8] = b"\r\n";
pub(crate) const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Returns the index of the first occurrence of `needle` in `haystack`,
/// starting the search at `from`.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Returns the offset where a later search for `needle` has to resume after
/// `haystack_len` bytes were scanned without a match.
///
/// A match may straddle the end of the scanned region, so the last
/// `needle_len - 1` bytes are scanned again.
pub(crate) fn resume_offset(haystack_len: usize, needle_len: usize) -> usize {
    haystack_len.saturating_sub(needle_len.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_from_offset() {
        let data = b"a\r\nb\r\n\r\nc";
        assert_eq!(find_subsequence(data, CRLF, 0), Some(1));
        assert_eq!(find_subsequence(data, CRLF, 2), Some(4));
        assert_eq!(find_subsequence(data, HEAD_TERMINATOR, 0), Some(4));
        assert_eq!(find_subsequence(data, HEAD_TERMINATOR, 5), None);
        assert_eq!(find_subsequence(data, CRLF, 100), None);
    }

    #[test]
    fn resume_covers_straddling_match() {
        let first = b"abc\r\n\r";
        assert_eq!(find_subsequence(first, HEAD_TERMINATOR, 0), None);
        let resume = resume_offset(first.len(), HEAD_TERMINATOR.len());
        let full = b"abc\r\n\r\nbody";
        assert_eq!(find_subsequence(full, HEAD_TERMINATOR, resume), Some(3));
    }
}
