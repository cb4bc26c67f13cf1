/// Position of the first occurrence of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Find the first blank line, either `\n\n` or `\r\n\r\n`.
///
/// Returns the offset where the blank line starts and the delimiter found.
/// Whichever delimiter occurs first wins.
pub(crate) fn find_blank_line(b: &[u8]) -> Option<(usize, &'static [u8])> {
    for i in 0..b.len() {
        let rest = &b[i..];
        if rest.starts_with(b"\n\n") {
            return Some((i, b"\n\n"));
        }
        if rest.starts_with(b"\r\n\r\n") {
            return Some((i, b"\r\n\r\n"));
        }
    }
    None
}

/// Strip trailing CR/LF.
pub(crate) fn trim_line_end(mut b: &[u8]) -> &[u8] {
    while let [rest @ .., b'\r' | b'\n'] = b {
        b = rest;
    }
    b
}

/// Strip leading spaces and tabs.
pub(crate) fn skip_blanks(mut b: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = b {
        b = rest;
    }
    b
}
