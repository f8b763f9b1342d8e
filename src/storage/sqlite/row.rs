//! Row conversion between the `memories` table and [`Memory`] objects.

use rusqlite::Row;
use serde_json::{Map, Value};

use super::sql::csv_to_tags;
use crate::models::Memory;

/// Column list shared by every `SELECT` that produces a full memory.
///
/// The embedding is joined in from `memory_embeddings`; consolidation
/// operates on vectors, so bulk reads must carry them.
pub const MEMORY_COLUMNS: &str = "m.content_hash, m.content, m.tags_csv, m.memory_type, \
     m.metadata_json, m.created_at, m.created_at_iso, m.updated_at, m.updated_at_iso, \
     m.deleted_at, e.vector";

/// Encodes an embedding as a little-endian f32 blob.
#[must_use]
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decodes a little-endian f32 blob back into an embedding.
///
/// Trailing partial floats (a corrupted blob) are dropped.
#[must_use]
pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Builds a [`Memory`] from a row selected with [`MEMORY_COLUMNS`].
///
/// Metadata that fails to parse as a JSON object degrades to an empty
/// map rather than poisoning the whole read.
pub fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let tags_csv: String = row.get(2)?;
    let metadata_json: String = row.get(4)?;
    let metadata: Map<String, Value> = serde_json::from_str::<Value>(&metadata_json)
        .ok()
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();

    let vector_blob: Option<Vec<u8>> = row.get(10)?;

    Ok(Memory {
        content_hash: row.get(0)?,
        content: row.get(1)?,
        tags: csv_to_tags(&tags_csv),
        memory_type: row.get(3)?,
        metadata,
        embedding: vector_blob.map(|blob| blob_to_vector(&blob)),
        created_at: row.get(5)?,
        created_at_iso: row.get(6)?,
        updated_at: row.get(7)?,
        updated_at_iso: row.get(8)?,
        deleted_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_vector_blob_round_trip() {
        let vector = vec![0.25_f32, -1.5, 3.75, 0.0];
        let blob = vector_to_blob(&vector);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vector(&blob), vector);
    }

    #[test]
    fn test_blob_to_vector_drops_trailing_garbage() {
        let mut blob = vector_to_blob(&[1.0, 2.0]);
        blob.push(0xFF);
        assert_eq!(blob_to_vector(&blob), vec![1.0, 2.0]);
    }

    #[test]
    fn test_memory_from_row_with_malformed_metadata() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE memories (
                content_hash TEXT, content TEXT, tags_csv TEXT, memory_type TEXT,
                metadata_json TEXT, created_at REAL, created_at_iso TEXT,
                updated_at REAL, updated_at_iso TEXT, deleted_at REAL
            );
            CREATE TABLE memory_embeddings (content_hash TEXT, vector BLOB);",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO memories VALUES (?1, 'text', 'a,b', 'note', 'not-json',
             1000.0, '1970-01-01T00:16:40.000Z', 1000.0, '1970-01-01T00:16:40.000Z', NULL)",
            rusqlite::params!["ff".repeat(32)],
        )
        .unwrap();

        let memory = conn
            .query_row(
                &format!(
                    "SELECT {} FROM memories m
                     LEFT JOIN memory_embeddings e ON m.content_hash = e.content_hash",
                    super::MEMORY_COLUMNS
                ),
                [],
                memory_from_row,
            )
            .unwrap();

        assert_eq!(memory.tags, vec!["a", "b"]);
        assert!(memory.metadata.is_empty());
        assert!(memory.embedding.is_none());
        assert!(!memory.is_deleted());
    }
}
