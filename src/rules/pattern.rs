/// Match `subject` against a glob-lite pattern.
///
/// Supported forms: `*` (any), `*X*` (contains), `X*` (prefix), `*X`
/// (suffix), and bare `X` (substring). Matching is case-sensitive and there
/// is no escaping. Empty patterns are rejected when rules are compiled, so
/// callers never pass one here.
pub fn match_pattern(subject: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(rest) = pattern.strip_prefix('*') {
        if let Some(inner) = rest.strip_suffix('*') {
            return subject.contains(inner);
        }
        return subject.ends_with(rest);
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        return subject.starts_with(prefix);
    }

    subject.contains(pattern)
}
