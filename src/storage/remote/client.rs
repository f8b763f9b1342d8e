//! HTTP client for the remote cloud service.
//!
//! Wraps the metadata DB (SQL over HTTP), the vector index, and the
//! optional blob store behind retrying helpers. Transient failures
//! (timeouts, 5xx, 429) back off exponentially with jitter; limit-class
//! responses (413, 507) and caller errors are permanent and surface
//! immediately so the sync engine stops enqueueing.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde_json::{Map, Value, json};

use crate::config::CloudflareConfig;
use crate::{Error, Result};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;

/// How a failed request should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help; surface immediately.
    Permanent,
    /// A resource limit; permanent and reported as [`Error::Limit`].
    Limit,
}

/// Classifies an HTTP status for the retry policy.
#[must_use]
pub fn classify_status(status: StatusCode) -> FailureClass {
    match status.as_u16() {
        413 | 507 => FailureClass::Limit,
        408 | 429 | 500..=599 => FailureClass::Transient,
        _ => FailureClass::Permanent,
    }
}

/// Backoff delay before `attempt` (0-based), with jitter.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1_u64 << attempt.min(6));
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

/// A single match from a vector index query.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    /// Vector id — the raw 64-char content hash.
    pub id: String,
    /// Index-native cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// Client for the remote service's three sub-APIs.
pub struct RemoteClient {
    http: reqwest::Client,
    account_id: String,
    d1_database_id: String,
    vectorize_index: String,
    r2_bucket: Option<String>,
    auth_header: String,
}

impl RemoteClient {
    /// Builds a client from credentials.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the HTTP client cannot be built.
    pub fn new(config: &CloudflareConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::storage("http_client_build", e))?;
        Ok(Self {
            http,
            account_id: config.account_id.clone(),
            d1_database_id: config.d1_database_id.clone(),
            vectorize_index: config.vectorize_index.clone(),
            r2_bucket: config.r2_bucket.clone(),
            auth_header: format!("Bearer {}", config.api_token.expose_secret()),
        })
    }

    /// Bucket configured for oversized content, if any.
    #[must_use]
    pub fn r2_bucket(&self) -> Option<&str> {
        self.r2_bucket.as_deref()
    }

    async fn post_json(&self, operation: &str, url: &str, body: Value) -> Result<Value> {
        let mut attempt = 0;
        loop {
            let response = self
                .http
                .post(url)
                .header("Authorization", &self.auth_header)
                .json(&body)
                .send()
                .await;

            let outcome = match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<Value>()
                            .await
                            .map_err(|e| Error::storage(operation, e));
                    }
                    let text = resp.text().await.unwrap_or_default();
                    match classify_status(status) {
                        FailureClass::Limit => {
                            return Err(Error::Limit(format!("{operation}: {status} {text}")));
                        },
                        FailureClass::Permanent => {
                            return Err(Error::storage(
                                operation,
                                format!("permanent {status}: {text}"),
                            ));
                        },
                        FailureClass::Transient => {
                            Err(Error::storage(operation, format!("{status}: {text}")))
                        },
                    }
                },
                // Network-level failures (connect, timeout) are transient.
                Err(e) => Err(Error::storage(operation, e)),
            };

            match outcome {
                Err(err) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    metrics::counter!("remote_retry_total").increment(1);
                    tracing::warn!(operation, attempt, error = %err, "remote call failed, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                },
                other => return other.map(|()| Value::Null),
            }
        }
    }

    /// Runs a SQL statement against the metadata DB.
    ///
    /// # Errors
    ///
    /// Returns a classified error per the retry policy.
    pub async fn d1_query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Map<String, Value>>> {
        let url = format!(
            "{API_BASE}/accounts/{}/d1/database/{}/query",
            self.account_id, self.d1_database_id
        );
        let body = json!({ "sql": sql, "params": params });
        let payload = self.post_json("d1_query", &url, body).await?;

        let rows = payload
            .pointer("/result/0/results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }

    /// Upserts vectors, NDJSON-encoded as the index API demands.
    ///
    /// Each entry is `(id, vector, metadata)`; the id is the raw content
    /// hash (64 bytes — longer ids are rejected by the service).
    ///
    /// # Errors
    ///
    /// Returns a classified error per the retry policy.
    pub async fn vectorize_upsert(
        &self,
        entries: &[(String, Vec<f32>, Map<String, Value>)],
    ) -> Result<()> {
        let url = format!(
            "{API_BASE}/accounts/{}/vectorize/v2/indexes/{}/upsert",
            self.account_id, self.vectorize_index
        );
        let mut ndjson = String::new();
        for (id, vector, metadata) in entries {
            let line = json!({ "id": id, "values": vector, "metadata": metadata });
            ndjson.push_str(&line.to_string());
            ndjson.push('\n');
        }

        let mut attempt = 0;
        loop {
            let response = self
                .http
                .post(&url)
                .header("Authorization", &self.auth_header)
                .header("Content-Type", "application/x-ndjson")
                .body(ndjson.clone())
                .send()
                .await;

            let outcome: Result<()> = match response {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    match classify_status(status) {
                        FailureClass::Limit => {
                            return Err(Error::Limit(format!("vectorize_upsert: {status} {text}")));
                        },
                        FailureClass::Permanent => {
                            return Err(Error::storage(
                                "vectorize_upsert",
                                format!("permanent {status}: {text}"),
                            ));
                        },
                        FailureClass::Transient => Err(Error::storage(
                            "vectorize_upsert",
                            format!("{status}: {text}"),
                        )),
                    }
                },
                Err(e) => Err(Error::storage("vectorize_upsert", e)),
            };

            match outcome {
                Err(err) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    metrics::counter!("remote_retry_total").increment(1);
                    tracing::warn!(attempt, error = %err, "vector upsert failed, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                },
                other => return other,
            }
        }
    }

    /// Queries the vector index for the `top_k` nearest ids.
    ///
    /// # Errors
    ///
    /// Returns a classified error per the retry policy.
    pub async fn vectorize_query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>> {
        let url = format!(
            "{API_BASE}/accounts/{}/vectorize/v2/indexes/{}/query",
            self.account_id, self.vectorize_index
        );
        let body = json!({ "vector": vector, "topK": top_k, "returnMetadata": "none" });
        let payload = self.post_json("vectorize_query", &url, body).await?;

        let matches = payload
            .pointer("/result/matches")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        #[allow(clippy::cast_possible_truncation)]
        let parsed = matches
            .iter()
            .filter_map(|m| {
                Some(VectorMatch {
                    id: m.get("id")?.as_str()?.to_string(),
                    score: m.get("score")?.as_f64()? as f32,
                })
            })
            .collect();
        Ok(parsed)
    }

    /// Removes vectors by id.
    ///
    /// # Errors
    ///
    /// Returns a classified error per the retry policy.
    pub async fn vectorize_delete(&self, ids: &[String]) -> Result<()> {
        let url = format!(
            "{API_BASE}/accounts/{}/vectorize/v2/indexes/{}/delete_by_ids",
            self.account_id, self.vectorize_index
        );
        self.post_json("vectorize_delete", &url, json!({ "ids": ids }))
            .await
            .map(|_| ())
    }

    async fn r2_request(
        &self,
        operation: &str,
        method: reqwest::Method,
        key: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let Some(bucket) = &self.r2_bucket else {
            return Err(Error::Unsupported(
                "no blob bucket configured".to_string(),
            ));
        };
        let url = format!(
            "{API_BASE}/accounts/{}/r2/buckets/{bucket}/objects/{key}",
            self.account_id
        );

        let mut attempt = 0;
        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("Authorization", &self.auth_header);
            if let Some(bytes) = &body {
                request = request.body(bytes.clone());
            }

            let outcome: Result<Vec<u8>> = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .bytes()
                        .await
                        .map(|b| b.to_vec())
                        .map_err(|e| Error::storage(operation, e));
                },
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    match classify_status(status) {
                        FailureClass::Limit => {
                            return Err(Error::Limit(format!("{operation}: {status} {text}")));
                        },
                        FailureClass::Permanent => {
                            return Err(Error::storage(
                                operation,
                                format!("permanent {status}: {text}"),
                            ));
                        },
                        FailureClass::Transient => {
                            Err(Error::storage(operation, format!("{status}: {text}")))
                        },
                    }
                },
                Err(e) => Err(Error::storage(operation, e)),
            };

            match outcome {
                Err(err) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    metrics::counter!("remote_retry_total").increment(1);
                    tracing::warn!(operation, attempt, error = %err, "blob call failed, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                },
                other => return other,
            }
        }
    }

    /// Uploads a blob object keyed by content hash.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] without a configured bucket, or a
    /// classified error per the retry policy.
    pub async fn r2_put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.r2_request("r2_put", reqwest::Method::PUT, key, Some(bytes.to_vec()))
            .await
            .map(|_| ())
    }

    /// Downloads a blob object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] without a configured bucket, or a
    /// classified error per the retry policy.
    pub async fn r2_get(&self, key: &str) -> Result<Vec<u8>> {
        self.r2_request("r2_get", reqwest::Method::GET, key, None).await
    }

    /// Removes a blob object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] without a configured bucket, or a
    /// classified error per the retry policy.
    pub async fn r2_delete(&self, key: &str) -> Result<()> {
        self.r2_request("r2_delete", reqwest::Method::DELETE, key, None)
            .await
            .map(|_| ())
    }

    /// Approximate number of vectors in the index, from index info.
    ///
    /// # Errors
    ///
    /// Returns a classified error per the retry policy.
    pub async fn vectorize_count(&self) -> Result<u64> {
        let url = format!(
            "{API_BASE}/accounts/{}/vectorize/v2/indexes/{}/info",
            self.account_id, self.vectorize_index
        );
        let payload = self.post_json("vectorize_info", &url, json!({})).await?;
        Ok(payload
            .pointer("/result/vectorCount")
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            FailureClass::Transient
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            FailureClass::Transient
        );
        assert_eq!(
            classify_status(StatusCode::GATEWAY_TIMEOUT),
            FailureClass::Transient
        );
        assert_eq!(
            classify_status(StatusCode::PAYLOAD_TOO_LARGE),
            FailureClass::Limit
        );
        assert_eq!(
            classify_status(StatusCode::INSUFFICIENT_STORAGE),
            FailureClass::Limit
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            FailureClass::Permanent
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            FailureClass::Permanent
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            FailureClass::Permanent
        );
    }

    #[test]
    fn test_backoff_grows_with_jitter() {
        let first = backoff_delay(0);
        let third = backoff_delay(2);
        assert!(first >= Duration::from_millis(500));
        assert!(first <= Duration::from_millis(750));
        assert!(third >= Duration::from_millis(2_000));
        assert!(third <= Duration::from_millis(3_000));
    }
}
