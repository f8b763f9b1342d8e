//! Service layer: the business logic shared by every protocol surface.

mod chunker;
mod hasher;
mod memory;
mod tags;
mod timeparse;

pub use chunker::{ContentSplitter, DEFAULT_OVERLAP};
pub use hasher::content_hash;
pub use memory::{
    CountOutcome, DeleteOutcome, GetOutcome, HealthOutcome, ListOutcome, MemoryService,
    SearchOutcome, StoreOutcome, StoreRequest, UpdateOutcome,
};
pub use tags::{merge_tag_sources, normalize_tags};
pub use timeparse::parse_time_expression;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::Result;
use crate::config::Config;
use crate::embedding::{CachingEmbedder, Embedder, HashedEmbedder};
use crate::storage;

type ServiceCache = Mutex<HashMap<String, Arc<MemoryService>>>;

/// Process-wide cache of constructed services, keyed like the storage
/// cache (`backend:path`). Hits are an `Arc` clone.
static SERVICE_CACHE: Lazy<ServiceCache> = Lazy::new(|| Mutex::new(HashMap::new()));

fn cache_key(config: &Config) -> String {
    format!(
        "{}:{}",
        config.backend.as_str(),
        config.sqlite_path.display()
    )
}

/// Default embedder stack: deterministic hashed projection behind an
/// LRU cache. Deployments with the `fastembed` feature swap the inner
/// embedder at composition time.
#[must_use]
pub fn default_embedder() -> Arc<dyn Embedder> {
    Arc::new(CachingEmbedder::new(HashedEmbedder::new()))
}

/// Fetches or builds the service for `config`.
///
/// # Errors
///
/// Returns any storage construction or initialization error.
pub async fn get_or_create_service(config: &Config) -> Result<Arc<MemoryService>> {
    let key = cache_key(config);
    {
        let cache = SERVICE_CACHE
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(service) = cache.get(&key) {
            metrics::counter!("service_cache_hit_total").increment(1);
            return Ok(Arc::clone(service));
        }
    }

    let embedder = default_embedder();
    let store = storage::create_storage(config, Arc::clone(&embedder)).await?;
    let service = Arc::new(MemoryService::new(store, embedder, config.clone()));

    let mut cache = SERVICE_CACHE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let entry = cache.entry(key).or_insert_with(|| Arc::clone(&service));
    Ok(Arc::clone(entry))
}

/// Drops cached services and storages; call on process shutdown after
/// [`MemoryService::shutdown`].
pub fn clear_service_cache() {
    let mut cache = SERVICE_CACHE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    cache.clear();
    storage::clear_storage_cache();
}
