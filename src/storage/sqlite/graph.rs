//! Graph queries over the `memory_graph` table.
//!
//! Traversals are recursive CTEs with path tracking: the walked path is
//! carried as a CSV of fixed-width (64-char) hashes and `instr()` guards
//! against revisiting a node, so cycles terminate without materializing
//! the graph in memory.

use rusqlite::{Connection, params};
use serde_json::{Map, Value};

use crate::models::{Association, Direction, GraphPath, RelationshipType, Subgraph};

/// Edge source expression for the requested direction.
///
/// `Both` unions the reversed edges in, which is what makes symmetric
/// relationships (stored as two rows) and asymmetric ones (one row)
/// traverse correctly in a single query shape.
const fn edge_view(direction: Direction) -> &'static str {
    match direction {
        Direction::Outgoing => "SELECT source_hash AS src, target_hash AS dst FROM memory_graph",
        Direction::Incoming => "SELECT target_hash AS src, source_hash AS dst FROM memory_graph",
        Direction::Both => {
            "SELECT source_hash AS src, target_hash AS dst FROM memory_graph
             UNION
             SELECT target_hash AS src, source_hash AS dst FROM memory_graph"
        },
    }
}

/// Inserts an edge, and its mirror when the relationship is symmetric.
pub fn store_association(conn: &Connection, association: &Association) -> rusqlite::Result<()> {
    let metadata = Value::Object(association.metadata.clone()).to_string();
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO memory_graph
         (source_hash, target_hash, relationship_type, similarity, metadata_json)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    stmt.execute(params![
        association.source_hash,
        association.target_hash,
        association.relationship_type.as_str(),
        f64::from(association.similarity),
        metadata,
    ])?;
    if association.relationship_type.is_symmetric() {
        stmt.execute(params![
            association.target_hash,
            association.source_hash,
            association.relationship_type.as_str(),
            f64::from(association.similarity),
            metadata,
        ])?;
    }
    Ok(())
}

/// All edges incident to `content_hash`, either endpoint.
pub fn get_associations(conn: &Connection, content_hash: &str) -> rusqlite::Result<Vec<Association>> {
    let mut stmt = conn.prepare_cached(
        "SELECT source_hash, target_hash, relationship_type, similarity, metadata_json
         FROM memory_graph
         WHERE source_hash = ?1 OR target_hash = ?1",
    )?;
    let rows = stmt.query_map(params![content_hash], association_from_row)?;
    rows.collect()
}

#[allow(clippy::cast_possible_truncation)]
fn association_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Association> {
    let relationship: String = row.get(2)?;
    let similarity: f64 = row.get(3)?;
    let metadata_json: String = row.get(4)?;
    let metadata: Map<String, Value> = serde_json::from_str::<Value>(&metadata_json)
        .ok()
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();
    Ok(Association {
        source_hash: row.get(0)?,
        target_hash: row.get(1)?,
        relationship_type: RelationshipType::parse(&relationship)
            .unwrap_or(RelationshipType::Related),
        similarity: similarity as f32,
        metadata,
    })
}

/// Hashes reachable within `max_hops`, with their minimum hop distance.
pub fn find_connected(
    conn: &Connection,
    content_hash: &str,
    max_hops: usize,
    direction: Direction,
) -> rusqlite::Result<Vec<(String, usize)>> {
    let sql = format!(
        "WITH RECURSIVE edges AS ({edges}),
         walk(node, depth, path) AS (
             SELECT ?1, 0, ?1
             UNION ALL
             SELECT e.dst, w.depth + 1, w.path || ',' || e.dst
             FROM edges e
             JOIN walk w ON e.src = w.node
             WHERE w.depth < ?2 AND instr(w.path, e.dst) = 0
         )
         SELECT node, MIN(depth) FROM walk WHERE node != ?1 GROUP BY node ORDER BY MIN(depth)",
        edges = edge_view(direction)
    );
    let mut stmt = conn.prepare(&sql)?;
    #[allow(clippy::cast_sign_loss)]
    let rows = stmt.query_map(params![content_hash, max_hops as i64], |row| {
        let depth: i64 = row.get(1)?;
        Ok((row.get::<_, String>(0)?, depth as usize))
    })?;
    rows.collect()
}

/// Shortest path from `from` to `to`, following both directions.
pub fn shortest_path(
    conn: &Connection,
    from: &str,
    to: &str,
) -> rusqlite::Result<Option<GraphPath>> {
    // Depth cap keeps pathological graphs bounded; 16 hops is far beyond
    // any meaningful association chain.
    let sql = format!(
        "WITH RECURSIVE edges AS ({edges}),
         walk(node, depth, path) AS (
             SELECT ?1, 0, ?1
             UNION ALL
             SELECT e.dst, w.depth + 1, w.path || ',' || e.dst
             FROM edges e
             JOIN walk w ON e.src = w.node
             WHERE w.depth < 16 AND instr(w.path, e.dst) = 0
         )
         SELECT path, depth FROM walk WHERE node = ?2 ORDER BY depth LIMIT 1",
        edges = edge_view(Direction::Both)
    );
    let mut stmt = conn.prepare(&sql)?;
    let result = stmt
        .query_row(params![from, to], |row| {
            let path: String = row.get(0)?;
            let depth: i64 = row.get(1)?;
            #[allow(clippy::cast_sign_loss)]
            let length = depth as usize;
            Ok(GraphPath {
                hashes: path.split(',').map(ToString::to_string).collect(),
                length,
            })
        })
        .map(Some);
    match result {
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        other => other,
    }
}

/// Nodes within `radius` hops plus every edge between them.
pub fn get_subgraph(
    conn: &Connection,
    content_hash: &str,
    radius: usize,
) -> rusqlite::Result<Subgraph> {
    let mut nodes: Vec<String> = vec![content_hash.to_string()];
    nodes.extend(
        find_connected(conn, content_hash, radius, Direction::Both)?
            .into_iter()
            .map(|(hash, _)| hash),
    );

    let placeholders: Vec<String> = (1..=nodes.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT source_hash, target_hash, relationship_type, similarity, metadata_json
         FROM memory_graph
         WHERE source_hash IN ({list}) AND target_hash IN ({list})",
        list = placeholders.join(",")
    );
    let mut stmt = conn.prepare(&sql)?;
    let edges = stmt
        .query_map(
            rusqlite::params_from_iter(nodes.iter()),
            association_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Subgraph { nodes, edges })
}
