//! CSV compression codec for quality metadata.
//!
//! Remote vector indexes cap per-record metadata (10 KB by default).
//! Quality bookkeeping — score, provider, confidence, access counters,
//! and a short history — is the bulkiest part of that payload, so it is
//! flattened into a single CSV record with provider names and decisions
//! mapped to one-letter codes. The uncompressed form is reconstructed on
//! read.
//!
//! Two record lengths are in the wild: the 13-part baseline and a 16-part
//! extension carrying quality-boost audit fields. Both decode.

use csv::{ReaderBuilder, WriterBuilder};
use serde_json::{Map, Value, json};

/// Metadata key holding the compressed record.
pub const COMPRESSED_KEY: &str = "q_csv";

const BASELINE_PARTS: usize = 13;
const EXTENDED_PARTS: usize = 16;

fn provider_to_code(provider: &str) -> &'static str {
    match provider {
        "implicit" => "i",
        "local_onnx" => "o",
        "external" => "e",
        _ => "n",
    }
}

fn code_to_provider(code: &str) -> &'static str {
    match code {
        "i" => "implicit",
        "o" => "local_onnx",
        "e" => "external",
        _ => "none",
    }
}

fn decision_to_code(decision: &str) -> &'static str {
    match decision {
        "retain" => "r",
        "archive" => "a",
        "review" => "v",
        _ => "",
    }
}

fn code_to_decision(code: &str) -> Option<&'static str> {
    match code {
        "r" => Some("retain"),
        "a" => Some("archive"),
        "v" => Some("review"),
        _ => None,
    }
}

fn fmt_f64(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_default()
}

fn fmt_u64(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn get_f64(metadata: &Map<String, Value>, key: &str) -> Option<f64> {
    metadata.get(key).and_then(Value::as_f64)
}

fn get_u64(metadata: &Map<String, Value>, key: &str) -> Option<u64> {
    metadata.get(key).and_then(Value::as_u64)
}

fn get_str<'a>(metadata: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(Value::as_str)
}

/// Compresses the quality fields of `metadata` into one CSV record.
///
/// Returns `None` when there is nothing quality-related to compress.
/// History is capped at three entries; entries beyond that are dropped
/// oldest-first before encoding.
#[must_use]
pub fn compress_quality_metadata(metadata: &Map<String, Value>) -> Option<String> {
    get_f64(metadata, "quality_score")?;

    let history: Vec<&Value> = metadata
        .get("quality_history")
        .and_then(Value::as_array)
        .map(|entries| entries.iter().rev().take(3).rev().collect())
        .unwrap_or_default();

    let history_field = |idx: usize, key: &str| -> String {
        history
            .get(idx)
            .and_then(|entry| entry.get(key))
            .map(|v| match v {
                Value::String(s) => provider_to_code(s).to_string(),
                other => other.as_f64().map(|f| format!("{f:.4}")).unwrap_or_default(),
            })
            .unwrap_or_default()
    };

    let mut record: Vec<String> = vec![
        fmt_f64(get_f64(metadata, "quality_score")),
        provider_to_code(get_str(metadata, "quality_provider").unwrap_or("none")).to_string(),
        fmt_f64(get_f64(metadata, "quality_confidence")),
        fmt_f64(get_f64(metadata, "quality_calculated_at")),
        fmt_u64(get_u64(metadata, "access_count")),
        fmt_f64(get_f64(metadata, "last_accessed_at")),
        history_field(0, "score"),
        history_field(0, "provider"),
        history_field(1, "score"),
        history_field(1, "provider"),
        history_field(2, "score"),
        history_field(2, "provider"),
        decision_to_code(get_str(metadata, "quality_decision").unwrap_or("")).to_string(),
    ];

    // Extended parts: boost audit trail, present only when a boost fired.
    if metadata
        .get("quality_boost_applied")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        record.push("1".to_string());
        record.push(fmt_f64(get_f64(metadata, "quality_boost_factor")));
        record.push(fmt_f64(get_f64(metadata, "original_quality_before_boost")));
    }

    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(&record).ok()?;
    let bytes = writer.into_inner().ok()?;
    Some(String::from_utf8(bytes).ok()?.trim_end().to_string())
}

/// Expands a compressed record back into quality metadata fields.
///
/// Accepts both the 13-part baseline and the 16-part extended form;
/// anything else is rejected as `None`.
#[must_use]
pub fn expand_quality_metadata(compressed: &str) -> Option<Map<String, Value>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .from_reader(compressed.as_bytes());
    let record = reader.records().next()?.ok()?;
    let parts: Vec<&str> = record.iter().collect();
    if parts.len() != BASELINE_PARTS && parts.len() != EXTENDED_PARTS {
        return None;
    }

    let parse_f64 = |s: &str| -> Option<f64> { s.parse().ok() };
    let parse_u64 = |s: &str| -> Option<u64> { s.parse().ok() };

    let mut metadata = Map::new();
    if let Some(score) = parse_f64(parts[0]) {
        metadata.insert("quality_score".to_string(), json!(score));
    }
    metadata.insert(
        "quality_provider".to_string(),
        json!(code_to_provider(parts[1])),
    );
    if let Some(confidence) = parse_f64(parts[2]) {
        metadata.insert("quality_confidence".to_string(), json!(confidence));
    }
    if let Some(calculated_at) = parse_f64(parts[3]) {
        metadata.insert("quality_calculated_at".to_string(), json!(calculated_at));
    }
    if let Some(access_count) = parse_u64(parts[4]) {
        metadata.insert("access_count".to_string(), json!(access_count));
    }
    if let Some(last_accessed) = parse_f64(parts[5]) {
        metadata.insert("last_accessed_at".to_string(), json!(last_accessed));
    }

    let mut history = Vec::new();
    for idx in 0..3 {
        let score_part = parts[6 + idx * 2];
        let provider_part = parts[7 + idx * 2];
        if let Some(score) = parse_f64(score_part) {
            history.push(json!({
                "score": score,
                "provider": code_to_provider(provider_part),
            }));
        }
    }
    if !history.is_empty() {
        metadata.insert("quality_history".to_string(), Value::Array(history));
    }

    if let Some(decision) = code_to_decision(parts[12]) {
        metadata.insert("quality_decision".to_string(), json!(decision));
    }

    if parts.len() == EXTENDED_PARTS && parts[13] == "1" {
        metadata.insert("quality_boost_applied".to_string(), json!(true));
        if let Some(factor) = parse_f64(parts[14]) {
            metadata.insert("quality_boost_factor".to_string(), json!(factor));
        }
        if let Some(original) = parse_f64(parts[15]) {
            metadata.insert("original_quality_before_boost".to_string(), json!(original));
        }
    }

    Some(metadata)
}

/// Replaces inline quality fields with the compressed record, in place.
///
/// No-op when the metadata has no quality score.
pub fn compact_in_place(metadata: &mut Map<String, Value>) {
    let Some(compressed) = compress_quality_metadata(metadata) else {
        return;
    };
    for key in [
        "quality_score",
        "quality_provider",
        "quality_confidence",
        "quality_calculated_at",
        "quality_history",
        "quality_decision",
        "quality_boost_applied",
        "quality_boost_factor",
        "original_quality_before_boost",
        "access_count",
        "last_accessed_at",
    ] {
        metadata.remove(key);
    }
    metadata.insert(COMPRESSED_KEY.to_string(), json!(compressed));
}

/// Reverses [`compact_in_place`], restoring inline fields.
pub fn restore_in_place(metadata: &mut Map<String, Value>) {
    let Some(compressed) = metadata
        .get(COMPRESSED_KEY)
        .and_then(Value::as_str)
        .map(ToString::to_string)
    else {
        return;
    };
    if let Some(expanded) = expand_quality_metadata(&compressed) {
        metadata.remove(COMPRESSED_KEY);
        for (key, value) in expanded {
            metadata.entry(key).or_insert(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("quality_score".to_string(), json!(0.82));
        metadata.insert("quality_provider".to_string(), json!("implicit"));
        metadata.insert("quality_confidence".to_string(), json!(0.64));
        metadata.insert("quality_calculated_at".to_string(), json!(1_700_000_000.0));
        metadata.insert("access_count".to_string(), json!(12_u64));
        metadata.insert("last_accessed_at".to_string(), json!(1_700_000_500.0));
        metadata.insert(
            "quality_history".to_string(),
            json!([
                {"score": 0.7, "provider": "implicit"},
                {"score": 0.75, "provider": "local_onnx"},
            ]),
        );
        metadata.insert("quality_decision".to_string(), json!("retain"));
        metadata
    }

    #[test]
    fn test_round_trip_baseline() {
        let metadata = sample_metadata();
        let compressed = compress_quality_metadata(&metadata).unwrap();
        let expanded = expand_quality_metadata(&compressed).unwrap();

        assert!((expanded["quality_score"].as_f64().unwrap() - 0.82).abs() < 1e-3);
        assert_eq!(expanded["quality_provider"], json!("implicit"));
        assert_eq!(expanded["access_count"], json!(12));
        assert_eq!(expanded["quality_decision"], json!("retain"));
        assert_eq!(expanded["quality_history"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_round_trip_extended() {
        let mut metadata = sample_metadata();
        metadata.insert("quality_boost_applied".to_string(), json!(true));
        metadata.insert("quality_boost_factor".to_string(), json!(1.2));
        metadata.insert("original_quality_before_boost".to_string(), json!(0.68));

        let compressed = compress_quality_metadata(&metadata).unwrap();
        assert_eq!(compressed.split(',').count(), 16);

        let expanded = expand_quality_metadata(&compressed).unwrap();
        assert_eq!(expanded["quality_boost_applied"], json!(true));
        assert!((expanded["quality_boost_factor"].as_f64().unwrap() - 1.2).abs() < 1e-3);
        assert!(
            (expanded["original_quality_before_boost"].as_f64().unwrap() - 0.68).abs() < 1e-3
        );
    }

    #[test]
    fn test_thirteen_part_records_still_decode() {
        // Record produced by a build predating the boost audit fields
        let legacy = "0.5000,i,0.3000,1700000000.0000,4,1700000100.0000,,,,,,,r";
        let expanded = expand_quality_metadata(legacy).unwrap();
        assert!((expanded["quality_score"].as_f64().unwrap() - 0.5).abs() < 1e-6);
        assert_eq!(expanded["quality_decision"], json!("retain"));
        assert!(!expanded.contains_key("quality_boost_applied"));
    }

    #[test]
    fn test_wrong_part_count_rejected() {
        assert!(expand_quality_metadata("0.5,i,0.3").is_none());
        assert!(expand_quality_metadata("").is_none());
    }

    #[test]
    fn test_no_quality_fields_means_no_record() {
        assert!(compress_quality_metadata(&Map::new()).is_none());
    }

    #[test]
    fn test_history_capped_at_three() {
        let mut metadata = sample_metadata();
        metadata.insert(
            "quality_history".to_string(),
            json!([
                {"score": 0.1, "provider": "implicit"},
                {"score": 0.2, "provider": "implicit"},
                {"score": 0.3, "provider": "implicit"},
                {"score": 0.4, "provider": "implicit"},
                {"score": 0.5, "provider": "implicit"},
            ]),
        );
        let compressed = compress_quality_metadata(&metadata).unwrap();
        let expanded = expand_quality_metadata(&compressed).unwrap();
        let history = expanded["quality_history"].as_array().unwrap();
        // The three most recent entries survive
        assert_eq!(history.len(), 3);
        assert!((history[0]["score"].as_f64().unwrap() - 0.3).abs() < 1e-6);
        assert!((history[2]["score"].as_f64().unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_compact_and_restore_in_place() {
        let mut metadata = sample_metadata();
        metadata.insert("unrelated".to_string(), json!("survives"));

        compact_in_place(&mut metadata);
        assert!(metadata.contains_key(COMPRESSED_KEY));
        assert!(!metadata.contains_key("quality_score"));
        assert_eq!(metadata["unrelated"], json!("survives"));

        restore_in_place(&mut metadata);
        assert!(!metadata.contains_key(COMPRESSED_KEY));
        assert!((metadata["quality_score"].as_f64().unwrap() - 0.82).abs() < 1e-3);
        assert_eq!(metadata["unrelated"], json!("survives"));
    }
}
