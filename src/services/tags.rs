//! Tag normalization at the service boundary.
//!
//! Protocol surfaces hand tags over in whatever shape the client chose:
//! missing, a single string, a comma-separated string, or an array. One
//! utility flattens all of them; nothing deeper in the stack ever parses
//! tag shapes again.

use serde_json::Value;

use crate::models::MAX_TAG_LENGTH;
use crate::{Error, Result};

/// Normalizes any accepted tag shape into a clean list.
///
/// - `None` / `Null` becomes `[]`
/// - `"a, b, c"` splits on commas, trims, drops empties
/// - `"a"` becomes `["a"]`
/// - `["a", "b"]` passes through (non-string elements are rejected)
///
/// Normalization is idempotent: feeding the output back in reproduces it.
///
/// # Errors
///
/// Returns [`Error::Validation`] for a tag longer than 100 characters or
/// for shapes that are neither strings nor string arrays.
pub fn normalize_tags(input: Option<&Value>) -> Result<Vec<String>> {
    let raw: Vec<String> = match input {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => split_csv(s),
        Some(Value::Array(items)) => {
            let mut tags = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => tags.extend(split_csv(s)),
                    other => {
                        return Err(Error::Validation(format!(
                            "tags array may only contain strings, got {other}"
                        )));
                    },
                }
            }
            tags
        },
        Some(other) => {
            return Err(Error::Validation(format!(
                "tags must be a string or an array of strings, got {other}"
            )));
        },
    };

    let mut seen = std::collections::HashSet::new();
    let mut tags = Vec::with_capacity(raw.len());
    for tag in raw {
        if tag.chars().count() > MAX_TAG_LENGTH {
            return Err(Error::Validation(format!(
                "tag too long ({} chars, max {MAX_TAG_LENGTH})",
                tag.chars().count()
            )));
        }
        if seen.insert(tag.clone()) {
            tags.push(tag);
        }
    }
    Ok(tags)
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Unions a top-level `tags` parameter with `metadata.tags`.
///
/// Order is preserved (top-level first), duplicates dropped.
///
/// # Errors
///
/// Returns [`Error::Validation`] when either source fails
/// [`normalize_tags`].
pub fn merge_tag_sources(
    top_level: Option<&Value>,
    metadata_tags: Option<&Value>,
) -> Result<Vec<String>> {
    let mut tags = normalize_tags(top_level)?;
    let mut seen: std::collections::HashSet<String> = tags.iter().cloned().collect();
    for tag in normalize_tags(metadata_tags)? {
        if seen.insert(tag.clone()) {
            tags.push(tag);
        }
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(None => Vec::<String>::new(); "missing")]
    #[test_case(Some(json!(null)) => Vec::<String>::new(); "explicit null")]
    #[test_case(Some(json!("a")) => vec!["a".to_string()]; "single string")]
    #[test_case(Some(json!("a, b, c")) => vec!["a".to_string(), "b".to_string(), "c".to_string()]; "comma separated")]
    #[test_case(Some(json!(["a", "b"])) => vec!["a".to_string(), "b".to_string()]; "array passthrough")]
    #[test_case(Some(json!(" a ,, b ")) => vec!["a".to_string(), "b".to_string()]; "trims and drops empties")]
    #[test_case(Some(json!(["a", "a", "b"])) => vec!["a".to_string(), "b".to_string()]; "dedups preserving order")]
    fn test_normalize_shapes(input: Option<Value>) -> Vec<String> {
        normalize_tags(input.as_ref()).unwrap()
    }

    #[test]
    fn test_non_string_shapes_rejected() {
        assert!(normalize_tags(Some(&json!(42))).is_err());
        assert!(normalize_tags(Some(&json!([1, 2]))).is_err());
        assert!(normalize_tags(Some(&json!({"tag": "x"}))).is_err());
    }

    #[test]
    fn test_overlong_tag_rejected() {
        let long = "x".repeat(101);
        let err = normalize_tags(Some(&json!(long))).unwrap_err();
        assert!(err.to_string().contains("tag too long"));

        let exactly_100 = "x".repeat(100);
        assert!(normalize_tags(Some(&json!(exactly_100))).is_ok());
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let once = normalize_tags(Some(&json!("c, a, b, a"))).unwrap();
        let twice = normalize_tags(Some(&json!(once.clone()))).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_unions_order_preserving() {
        let merged = merge_tag_sources(
            Some(&json!("alpha, beta")),
            Some(&json!(["beta", "gamma"])),
        )
        .unwrap();
        assert_eq!(merged, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_merge_with_only_metadata_tags() {
        let merged = merge_tag_sources(None, Some(&json!("x"))).unwrap();
        assert_eq!(merged, vec!["x"]);
    }
}
