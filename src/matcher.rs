//! Keyword matching of comment text against a reel rule.

use crate::model::Rule;

/// Returns true when `text` should be answered by `rule`.
///
/// Wildcard rules (no keywords, or the `.` keyword) match everything.
/// Otherwise any keyword that occurs in the text, ignoring case, is a match.
/// There is no tokenization: `"price"` matches `"prices"`.
pub fn matches(text: &str, rule: &Rule) -> bool {
    if rule.is_wildcard() {
        return true;
    }
    let haystack = text.to_lowercase();
    rule.match_words
        .iter()
        .any(|keyword| haystack.contains(&keyword.to_lowercase()))
}
