//! Content hashing: the identity function for memories.
//!
//! The hash covers the content plus a canonical subset of metadata
//! (sorted tags and the type label), separated by a NUL byte so content
//! ending in metadata-ish text cannot collide with actual metadata. Two
//! stores of the same text with the same tags and type are duplicates;
//! changing either produces a distinct memory.

use sha2::{Digest, Sha256};

/// Computes the 64-hex-char content hash for a memory.
///
/// Tags are sorted before hashing so insertion order does not change
/// identity.
///
/// # Example
///
/// ```rust
/// use memoir::services::content_hash;
///
/// let a = content_hash("note text", &["b".into(), "a".into()], Some("note"));
/// let b = content_hash("note text", &["a".into(), "b".into()], Some("note"));
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
#[must_use]
pub fn content_hash(content: &str, tags: &[String], memory_type: Option<&str>) -> String {
    let mut sorted: Vec<&str> = tags.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let canonical = serde_json::json!({
        "tags": sorted,
        "type": memory_type,
    })
    .to_string();

    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(b"\x00");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
