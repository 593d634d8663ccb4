//! URL pattern matching for the exchange routing table.

/// Returns `true` if `path` matches `pattern`.
///
/// A pattern is a path-shaped string whose bytes are matched literally,
/// except that `:` consumes the rest of the current path segment (up to the
/// next `/` in both the pattern and the path), and a pattern ending in `/`
/// matches any remainder of the path.
pub fn matches(pattern: &str, path: &str) -> bool {
    let pattern = pattern.as_bytes();
    let path = path.as_bytes();

    let (mut i, mut j) = (0, 0);
    while i < path.len() {
        if j == pattern.len() {
            return pattern.last() == Some(&b'/');
        }

        match pattern[j] {
            b':' => {
                j = seek(pattern, b'/', j);
                i = seek(path, b'/', i);
            }
            byte if byte == path[i] => {
                i += 1;
                j += 1;
            }
            _ => return false,
        }
    }

    j == pattern.len()
}

/// Index of the next `byte` in `text` at or after `start`, or `text.len()`.
fn seek(text: &[u8], byte: u8, start: usize) -> usize {
    match text[start..].iter().position(|&b| b == byte) {
        Some(offset) => start + offset,
        None => text.len(),
    }
}
