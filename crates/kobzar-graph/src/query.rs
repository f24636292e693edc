//! Cypher text helpers: literal quoting for parameter inlining, the
//! read-only guard for generated queries, and LIMIT clamping.

use crate::error::{GraphError, Result};

/// Hard cap on rows any generated retrieval query may return.
pub const MAX_RESEARCH_LIMIT: u64 = 50;

/// Keywords that make a query a write. Generated retrieval queries containing
/// any of these are rejected before execution.
const WRITE_KEYWORDS: [&str; 6] = ["CREATE", "MERGE", "DELETE", "SET", "DETACH", "REMOVE"];

/// Quote a string as a single-quoted Cypher literal.
pub fn lit(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// True when `query` contains none of the write keywords (as whole words,
/// case-insensitive — `OFFSET` must not trip the `SET` check).
pub fn is_read_only(query: &str) -> bool {
    let upper = query.to_uppercase();
    let mut words = upper.split(|c: char| !c.is_ascii_alphabetic());
    words.all(|w| !WRITE_KEYWORDS.contains(&w))
}

/// Validate a generated retrieval query: must be read-only and bounded.
/// Returns the query with `LIMIT` clamped to [`MAX_RESEARCH_LIMIT`]
/// (appended when absent).
pub fn validate_research_query(query: &str) -> Result<String> {
    let trimmed = query.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(GraphError::Rejected("empty query".into()));
    }
    if !is_read_only(trimmed) {
        return Err(GraphError::Rejected(format!(
            "write keyword in generated query: {trimmed}"
        )));
    }

    match extract_limit(trimmed) {
        Some(n) if n <= MAX_RESEARCH_LIMIT => Ok(trimmed.to_string()),
        Some(n) => Err(GraphError::Rejected(format!(
            "LIMIT {n} exceeds the {MAX_RESEARCH_LIMIT}-row cap"
        ))),
        None => Ok(format!("{trimmed} LIMIT {MAX_RESEARCH_LIMIT}")),
    }
}

/// Extract the trailing LIMIT value, if the query has one.
fn extract_limit(query: &str) -> Option<u64> {
    let upper = query.to_uppercase();
    let idx = upper.rfind("LIMIT")?;
    query[idx + "LIMIT".len()..]
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_and_escapes() {
        assert_eq!(lit("plain"), "'plain'");
        assert_eq!(lit("it's"), r"'it\'s'");
        assert_eq!(lit(r"back\slash"), r"'back\\slash'");
        assert_eq!(lit("line\nbreak"), r"'line\nbreak'");
    }

    #[test]
    fn read_only_detection() {
        assert!(is_read_only("MATCH (m:Message) RETURN m.uid LIMIT 10"));
        assert!(!is_read_only("CREATE (m:Message)"));
        assert!(!is_read_only("match (m) set m.text = 'x'"));
        assert!(!is_read_only("MATCH (m) DETACH DELETE m"));
        // SET inside a longer word must not trigger.
        assert!(is_read_only("MATCH (m) RETURN m.uid SKIP 5"));
        assert!(is_read_only("MATCH (t:Topic) WHERE t.title = 'offset' RETURN t.title"));
    }

    #[test]
    fn limit_is_enforced() {
        let q = validate_research_query("MATCH (m:Message) RETURN m.uid").unwrap();
        assert!(q.ends_with("LIMIT 50"));

        let q = validate_research_query("MATCH (m) RETURN m.uid LIMIT 10").unwrap();
        assert!(q.ends_with("LIMIT 10"));

        assert!(validate_research_query("MATCH (m) RETURN m.uid LIMIT 500").is_err());
    }

    #[test]
    fn writes_are_rejected() {
        assert!(validate_research_query("MERGE (t:Topic {title:'x'}) RETURN t.title").is_err());
        assert!(validate_research_query("").is_err());
    }

    #[test]
    fn trailing_semicolon_is_stripped() {
        let q = validate_research_query("MATCH (m) RETURN m.uid LIMIT 5;").unwrap();
        assert_eq!(q, "MATCH (m) RETURN m.uid LIMIT 5");
    }
}
