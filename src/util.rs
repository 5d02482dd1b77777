/// Strip an ISBN down to its digits plus a possible trailing check `X`.
/// Cache keys and read-path lookups both go through this so they agree.
pub fn normalize_isbn(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == 'X' || *c == 'x')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

pub fn truncate_on_char_boundary(s: &str, max_bytes: usize) -> (&str, usize) {
    if s.len() <= max_bytes {
        return (s, 0);
    }

    let mut end = max_bytes.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    (&s[..end], s.len() - end)
}
