// Subject validation and wildcard matching.
//
// Subjects are dot-separated token sequences. `*` matches exactly one
// token; `>` matches one or more trailing tokens and is only legal as
// the final token of a pattern.

/// True when `s` is a structurally valid subject or pattern.
pub fn valid_subject(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = s.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        match *token {
            "" => return false,
            "*" => {}
            ">" => {
                if i != tokens.len() - 1 {
                    return false;
                }
            }
            literal => {
                if !valid_token(literal) {
                    return false;
                }
            }
        }
    }
    true
}

/// True when `s` is a single literal token: non-empty, no separators,
/// no wildcards, no whitespace. Queue-group names must satisfy this.
pub fn valid_token(s: &str) -> bool {
    !s.is_empty()
        && !s
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

/// Match a concrete `subject` against a `pattern` that may contain
/// wildcards.
///
/// ```
/// use lariat_wire::subject::matches;
///
/// assert!(matches("orders.*.created", "orders.eu.created"));
/// assert!(matches("orders.>", "orders.eu.created"));
/// assert!(!matches("orders.>", "orders"));
/// ```
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.').peekable();
    loop {
        match (pat.next(), sub.peek()) {
            (None, None) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {
                sub.next();
            }
            (Some(p), Some(s)) => {
                if p != *s {
                    return false;
                }
                sub.next();
            }
        }
    }
}
