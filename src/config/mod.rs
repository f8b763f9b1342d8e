//! Configuration management.
//!
//! Configuration is read once from the environment (after layering `.env`
//! files) and is immutable afterwards; changing a variable requires a
//! process restart. `.env` files are looked up at the current directory,
//! then at the project root (detected via a `.git` or `Cargo.toml`
//! marker), then at `~/.mcp-memory/.env`, and never override variables
//! that are already set.

use std::collections::HashMap;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::{Error, Result};

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// Local `SQLite` vector store only (single-device default).
    #[default]
    SqliteVec,
    /// Local primary plus remote secondary with background sync.
    Hybrid,
    /// Remote cloud store only.
    Cloudflare,
}

impl StorageBackend {
    /// Stable name used in health payloads and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SqliteVec => "sqlite_vec",
            Self::Hybrid => "hybrid",
            Self::Cloudflare => "cloudflare",
        }
    }
}

/// Which process owns the hybrid sync queue when several share a DB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncOwner {
    /// The HTTP server instance drains the queue.
    Http,
    /// The JSON-RPC server instance drains the queue.
    Rpc,
    /// Both instances drain (legacy default; duplicates work).
    #[default]
    Both,
}

impl SyncOwner {
    /// Stable name used in sync status payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Rpc => "rpc",
            Self::Both => "both",
        }
    }
}

/// How consolidation persists discovered associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphStorageMode {
    /// Legacy: create Memory records representing associations.
    MemoriesOnly,
    /// Only edges in the `memory_graph` table.
    #[default]
    GraphOnly,
    /// Both, as a migration mode.
    DualWrite,
}

/// Hybrid engine tuning.
#[derive(Debug, Clone)]
pub struct HybridConfig {
    /// Background sync interval, seconds.
    pub sync_interval_secs: u64,
    /// Operations drained per batch.
    pub batch_size: usize,
    /// Queue capacity before backpressure kicks in.
    pub max_queue_size: usize,
    /// Drift check interval, seconds.
    pub drift_check_interval_secs: u64,
    /// Memories examined per drift batch.
    pub drift_batch_size: usize,
    /// Queue ownership.
    pub sync_owner: SyncOwner,
    /// Whether metadata drift sync is enabled.
    pub sync_updates: bool,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 300,
            batch_size: 100,
            max_queue_size: 2_000,
            drift_check_interval_secs: 3_600,
            drift_batch_size: 500,
            sync_owner: SyncOwner::default(),
            sync_updates: true,
        }
    }
}

/// Credentials and identifiers for the remote cloud backend.
#[derive(Debug, Clone)]
pub struct CloudflareConfig {
    /// API token; zeroized on drop and redacted from Debug output.
    pub api_token: SecretString,
    /// Account identifier.
    pub account_id: String,
    /// Vectorize index name.
    pub vectorize_index: String,
    /// D1 database identifier.
    pub d1_database_id: String,
    /// Optional R2 bucket for content larger than 1 MB.
    pub r2_bucket: Option<String>,
}

/// Content-splitting behavior.
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Whether oversized content is split automatically.
    pub auto_split: bool,
    /// Overlap between consecutive chunks, characters.
    pub overlap: usize,
    /// Prefer natural boundaries (paragraph, sentence, word) over hard cuts.
    pub preserve_boundaries: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            auto_split: true,
            overlap: 50,
            preserve_boundaries: true,
        }
    }
}

/// Consolidation scheduling and quality-boost tuning.
#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Master switch.
    pub enabled: bool,
    /// Run the daily horizon.
    pub schedule_daily: bool,
    /// Run the weekly horizon.
    pub schedule_weekly: bool,
    /// Run the monthly horizon.
    pub schedule_monthly: bool,
    /// Whether well-connected memories get a quality boost.
    pub quality_boost_enabled: bool,
    /// Associations needed before the boost applies.
    pub min_connections_for_boost: usize,
    /// Multiplier applied to `quality_score`, capped at 1.0.
    pub quality_boost_factor: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule_daily: true,
            schedule_weekly: true,
            schedule_monthly: false,
            quality_boost_enabled: true,
            min_connections_for_boost: 5,
            quality_boost_factor: 1.2,
        }
    }
}

/// Immutable process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Selected storage backend.
    pub backend: StorageBackend,
    /// Local database file path.
    pub sqlite_path: PathBuf,
    /// Extra pragmas applied at connect time, `name=value` pairs.
    pub sqlite_pragmas: Vec<(String, String)>,
    /// Hybrid engine tuning.
    pub hybrid: HybridConfig,
    /// Days a tombstone survives before physical purge.
    pub tombstone_retention_days: u32,
    /// Remote backend credentials (required for hybrid/cloudflare).
    pub cloudflare: Option<CloudflareConfig>,
    /// Embedding model override.
    pub embedding_model: Option<String>,
    /// Stamp memories with the originating hostname.
    pub include_hostname: bool,
    /// Chunking behavior.
    pub chunking: ChunkingConfig,
    /// Truncate retrieval responses at memory boundaries; 0 disables.
    pub max_response_chars: usize,
    /// Consolidation behavior.
    pub consolidation: ConsolidationConfig,
    /// Association persistence mode.
    pub graph_mode: GraphStorageMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            sqlite_path: default_sqlite_path(),
            sqlite_pragmas: Vec::new(),
            hybrid: HybridConfig::default(),
            tombstone_retention_days: 30,
            cloudflare: None,
            embedding_model: None,
            include_hostname: false,
            chunking: ChunkingConfig::default(),
            max_response_chars: 0,
            consolidation: ConsolidationConfig::default(),
            graph_mode: GraphStorageMode::default(),
        }
    }
}

/// Platform-aware default database location.
fn default_sqlite_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "memoir", "memoir").map_or_else(
        || PathBuf::from("memoir.db"),
        |dirs| dirs.data_dir().join("memoir.db"),
    )
}

/// Walks up from the current directory looking for a repository root
/// marker (`.git` or `Cargo.toml`).
fn find_project_root() -> Option<PathBuf> {
    let mut dir = std::env::current_dir().ok()?;
    loop {
        if dir.join(".git").exists() || dir.join("Cargo.toml").exists() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Layers `.env` files without overriding already-set variables.
fn load_dotenv_layers() {
    // dotenvy never overrides variables that are already present, so the
    // precedence is: process env > CWD > project root > home fallback.
    let _ = dotenvy::dotenv();
    if let Some(root) = find_project_root() {
        let _ = dotenvy::from_path(root.join(".env"));
    }
    if let Some(home) = std::env::var_os("HOME") {
        let _ = dotenvy::from_path(PathBuf::from(home).join(".mcp-memory").join(".env"));
    }
}

fn parse_pragmas(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "MCP_MEMORY_SQLITE_PRAGMAS entry '{pair}' is not name=value"
                    ))
                })
        })
        .collect()
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Validation(format!(
            "{key} must be a boolean, got '{raw}'"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::Validation(format!("{key} must be numeric, got '{raw}'")))
}

impl Config {
    /// Loads configuration from the process environment, layering `.env`
    /// files first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the offending variable when a
    /// value fails to parse, or listing the missing credential variables
    /// when the selected backend requires the remote adapter.
    pub fn load() -> Result<Self> {
        load_dotenv_layers();
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    ///
    /// The seam exists so tests can inject environments without touching
    /// process state.
    ///
    /// # Errors
    ///
    /// Same contract as [`Config::load`].
    #[allow(clippy::too_many_lines)]
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("MCP_MEMORY_STORAGE_BACKEND") {
            config.backend = match raw.to_ascii_lowercase().as_str() {
                "sqlite_vec" | "sqlite-vec" | "sqlite" => StorageBackend::SqliteVec,
                "hybrid" => StorageBackend::Hybrid,
                "cloudflare" => StorageBackend::Cloudflare,
                other => {
                    return Err(Error::Validation(format!(
                        "MCP_MEMORY_STORAGE_BACKEND must be sqlite_vec, hybrid, or cloudflare, got '{other}'"
                    )));
                },
            };
        }

        if let Some(path) = lookup("MCP_MEMORY_SQLITE_PATH") {
            config.sqlite_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("MCP_MEMORY_SQLITE_PRAGMAS") {
            config.sqlite_pragmas = parse_pragmas(&raw)?;
        }

        if let Some(raw) = lookup("MCP_HYBRID_SYNC_INTERVAL") {
            config.hybrid.sync_interval_secs = parse_number("MCP_HYBRID_SYNC_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("MCP_HYBRID_BATCH_SIZE") {
            config.hybrid.batch_size = parse_number("MCP_HYBRID_BATCH_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("MCP_HYBRID_MAX_QUEUE_SIZE") {
            config.hybrid.max_queue_size = parse_number("MCP_HYBRID_MAX_QUEUE_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("MCP_HYBRID_DRIFT_CHECK_INTERVAL") {
            config.hybrid.drift_check_interval_secs =
                parse_number("MCP_HYBRID_DRIFT_CHECK_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("MCP_HYBRID_DRIFT_BATCH_SIZE") {
            config.hybrid.drift_batch_size = parse_number("MCP_HYBRID_DRIFT_BATCH_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("MCP_HYBRID_SYNC_OWNER") {
            config.hybrid.sync_owner = match raw.to_ascii_lowercase().as_str() {
                "http" => SyncOwner::Http,
                "rpc" => SyncOwner::Rpc,
                "both" => SyncOwner::Both,
                other => {
                    return Err(Error::Validation(format!(
                        "MCP_HYBRID_SYNC_OWNER must be http, rpc, or both, got '{other}'"
                    )));
                },
            };
        }
        if let Some(raw) = lookup("MCP_HYBRID_SYNC_UPDATES") {
            config.hybrid.sync_updates = parse_bool("MCP_HYBRID_SYNC_UPDATES", &raw)?;
        }

        if let Some(raw) = lookup("TOMBSTONE_RETENTION_DAYS") {
            config.tombstone_retention_days = parse_number("TOMBSTONE_RETENTION_DAYS", &raw)?;
        }

        config.cloudflare = Self::cloudflare_from_lookup(lookup, config.backend)?;

        config.embedding_model = lookup("MCP_EMBEDDING_MODEL");
        if let Some(raw) = lookup("MCP_MEMORY_INCLUDE_HOSTNAME") {
            config.include_hostname = parse_bool("MCP_MEMORY_INCLUDE_HOSTNAME", &raw)?;
        }

        if let Some(raw) = lookup("MCP_ENABLE_AUTO_SPLIT") {
            config.chunking.auto_split = parse_bool("MCP_ENABLE_AUTO_SPLIT", &raw)?;
        }
        if let Some(raw) = lookup("MCP_CONTENT_SPLIT_OVERLAP") {
            config.chunking.overlap = parse_number("MCP_CONTENT_SPLIT_OVERLAP", &raw)?;
        }
        if let Some(raw) = lookup("CONTENT_PRESERVE_BOUNDARIES") {
            config.chunking.preserve_boundaries = parse_bool("CONTENT_PRESERVE_BOUNDARIES", &raw)?;
        }
        if let Some(raw) = lookup("MCP_MAX_RESPONSE_CHARS") {
            config.max_response_chars = parse_number("MCP_MAX_RESPONSE_CHARS", &raw)?;
        }

        if let Some(raw) = lookup("MCP_CONSOLIDATION_ENABLED") {
            config.consolidation.enabled = parse_bool("MCP_CONSOLIDATION_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("MCP_SCHEDULE_DAILY") {
            config.consolidation.schedule_daily = parse_bool("MCP_SCHEDULE_DAILY", &raw)?;
        }
        if let Some(raw) = lookup("MCP_SCHEDULE_WEEKLY") {
            config.consolidation.schedule_weekly = parse_bool("MCP_SCHEDULE_WEEKLY", &raw)?;
        }
        if let Some(raw) = lookup("MCP_SCHEDULE_MONTHLY") {
            config.consolidation.schedule_monthly = parse_bool("MCP_SCHEDULE_MONTHLY", &raw)?;
        }
        if let Some(raw) = lookup("MCP_CONSOLIDATION_QUALITY_BOOST_ENABLED") {
            config.consolidation.quality_boost_enabled =
                parse_bool("MCP_CONSOLIDATION_QUALITY_BOOST_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("MCP_CONSOLIDATION_MIN_CONNECTIONS_FOR_BOOST") {
            config.consolidation.min_connections_for_boost =
                parse_number("MCP_CONSOLIDATION_MIN_CONNECTIONS_FOR_BOOST", &raw)?;
        }
        if let Some(raw) = lookup("MCP_CONSOLIDATION_QUALITY_BOOST_FACTOR") {
            config.consolidation.quality_boost_factor =
                parse_number("MCP_CONSOLIDATION_QUALITY_BOOST_FACTOR", &raw)?;
        }

        if let Some(raw) = lookup("GRAPH_STORAGE_MODE") {
            config.graph_mode = match raw.to_ascii_lowercase().as_str() {
                "memories_only" => GraphStorageMode::MemoriesOnly,
                "graph_only" => GraphStorageMode::GraphOnly,
                "dual_write" => GraphStorageMode::DualWrite,
                other => {
                    return Err(Error::Validation(format!(
                        "GRAPH_STORAGE_MODE must be memories_only, graph_only, or dual_write, got '{other}'"
                    )));
                },
            };
        }

        Ok(config)
    }

    fn cloudflare_from_lookup(
        lookup: &dyn Fn(&str) -> Option<String>,
        backend: StorageBackend,
    ) -> Result<Option<CloudflareConfig>> {
        const REQUIRED: [&str; 4] = [
            "CLOUDFLARE_API_TOKEN",
            "CLOUDFLARE_ACCOUNT_ID",
            "CLOUDFLARE_VECTORIZE_INDEX",
            "CLOUDFLARE_D1_DATABASE_ID",
        ];

        let values: HashMap<&str, Option<String>> =
            REQUIRED.iter().map(|&k| (k, lookup(k))).collect();
        let missing: Vec<&str> = REQUIRED
            .iter()
            .filter(|&&k| values.get(k).is_none_or(|v| v.is_none()))
            .copied()
            .collect();

        if missing.len() == REQUIRED.len() {
            // No remote credentials at all
            return if matches!(
                backend,
                StorageBackend::Hybrid | StorageBackend::Cloudflare
            ) {
                Err(Error::Validation(format!(
                    "backend '{}' requires: {}",
                    backend.as_str(),
                    missing.join(", ")
                )))
            } else {
                Ok(None)
            };
        }
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "incomplete remote credentials, missing: {}",
                missing.join(", ")
            )));
        }

        let get = |k: &str| values.get(k).cloned().flatten().unwrap_or_default();
        Ok(Some(CloudflareConfig {
            api_token: SecretString::from(get("CLOUDFLARE_API_TOKEN")),
            account_id: get("CLOUDFLARE_ACCOUNT_ID"),
            vectorize_index: get("CLOUDFLARE_VECTORIZE_INDEX"),
            d1_database_id: get("CLOUDFLARE_D1_DATABASE_ID"),
            r2_bucket: lookup("CLOUDFLARE_R2_BUCKET"),
        }))
    }
}
