//! SQL construction helpers for the local store.
//!
//! Tags are stored as a normalized CSV and matched *exactly*: a query for
//! `test` must never match a row tagged `testing`. The match wraps both
//! sides in commas (`',' || tags_csv || ','` against `%,test,%`) with
//! LIKE wildcards escaped, which makes substring false-positives
//! impossible while staying on a plain B-tree-friendly expression.

use crate::models::TagMatch;

/// Escapes SQL LIKE wildcards in a string to make them literal.
///
/// SQL LIKE treats `%` and `_` as wildcards; a tag containing either must
/// have them escaped (with `\`, which itself needs escaping) before being
/// embedded in a LIKE pattern.
///
/// # Examples
///
/// ```
/// use memoir::storage::sqlite::escape_like_wildcards;
///
/// assert_eq!(escape_like_wildcards("100%"), "100\\%");
/// assert_eq!(escape_like_wildcards("user_name"), "user\\_name");
/// assert_eq!(escape_like_wildcards("path\\file"), "path\\\\file");
/// ```
#[must_use]
pub fn escape_like_wildcards(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' | '_' | '\\' => {
                result.push('\\');
                result.push(c);
            },
            _ => result.push(c),
        }
    }
    result
}

/// Renders a tag list into the normalized CSV stored in `tags_csv`.
///
/// Tags are trimmed and empties dropped; order is preserved.
#[must_use]
pub fn tags_to_csv(tags: &[String]) -> String {
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Splits a stored CSV back into tags.
#[must_use]
pub fn csv_to_tags(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Builds an exact-match tag predicate over the `tags_csv` column.
///
/// Returns the clause (without a leading `AND`) and its positional
/// parameters, numbered from `start_param`. `TagMatch::All` requires
/// every tag; `TagMatch::Any` requires at least one.
#[must_use]
pub fn build_tag_clause(
    tags: &[String],
    match_mode: TagMatch,
    start_param: usize,
) -> (String, Vec<String>) {
    let mut conditions = Vec::with_capacity(tags.len());
    let mut params = Vec::with_capacity(tags.len());
    let mut idx = start_param;

    for tag in tags {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            continue;
        }
        conditions.push(format!(
            "(',' || tags_csv || ',') LIKE ?{idx} ESCAPE '\\'"
        ));
        params.push(format!("%,{},%", escape_like_wildcards(trimmed)));
        idx += 1;
    }

    if conditions.is_empty() {
        return (String::new(), params);
    }

    let joiner = match match_mode {
        TagMatch::All => " AND ",
        TagMatch::Any => " OR ",
    };
    (format!("({})", conditions.join(joiner)), params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like_wildcards() {
        assert_eq!(escape_like_wildcards("normal"), "normal");
        assert_eq!(escape_like_wildcards("100%"), "100\\%");
        assert_eq!(escape_like_wildcards("_private"), "\\_private");
        assert_eq!(escape_like_wildcards("a\\b"), "a\\\\b");
        assert_eq!(escape_like_wildcards(""), "");
    }

    #[test]
    fn test_tags_csv_round_trip() {
        let tags = vec!["biology".to_string(), "quote".to_string()];
        let csv = tags_to_csv(&tags);
        assert_eq!(csv, "biology,quote");
        assert_eq!(csv_to_tags(&csv), tags);
    }

    #[test]
    fn test_tags_to_csv_trims_and_drops_empties() {
        let tags = vec![
            "  spaced  ".to_string(),
            String::new(),
            "ok".to_string(),
        ];
        assert_eq!(tags_to_csv(&tags), "spaced,ok");
    }

    #[test]
    fn test_build_tag_clause_any() {
        let tags = vec!["bug".to_string(), "feature".to_string()];
        let (clause, params) = build_tag_clause(&tags, TagMatch::Any, 1);
        assert!(clause.contains("?1"));
        assert!(clause.contains(" OR "));
        assert_eq!(params, vec!["%,bug,%", "%,feature,%"]);
    }

    #[test]
    fn test_build_tag_clause_all() {
        let tags = vec!["security".to_string(), "urgent".to_string()];
        let (clause, params) = build_tag_clause(&tags, TagMatch::All, 3);
        assert!(clause.contains("?3"));
        assert!(clause.contains("?4"));
        assert!(clause.contains(" AND "));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_build_tag_clause_escapes_wildcards() {
        let tags = vec!["100%_done".to_string()];
        let (_, params) = build_tag_clause(&tags, TagMatch::Any, 1);
        assert_eq!(params, vec!["%,100\\%\\_done,%"]);
    }

    #[test]
    fn test_build_tag_clause_empty() {
        let (clause, params) = build_tag_clause(&[], TagMatch::Any, 1);
        assert!(clause.is_empty());
        assert!(params.is_empty());
    }
}
