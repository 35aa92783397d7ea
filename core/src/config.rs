use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: String,
    pub wal_flush_interval_ms: u64,
}

/// Pipeline knobs from spec §4.2 / §6. Every field is overridable via
/// `RETRIEVAL_<FIELD>` environment variables, mirroring `StorageConfig`'s
/// `ALAYASIKI_` layering.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    pub seed_k: usize,
    pub hop_depth: u8,
    pub hop_fanout: usize,
    pub final_k: usize,
    pub alpha_vec: f32,
    pub beta_bm25: f32,
    pub gamma_graph: f32,
    pub delta_recency: f32,
    pub recency_halflife_days: f32,
    pub use_mmr: bool,
    pub mmr_lambda: f32,
    pub mmr_pool: usize,
    /// Per-node-type score multiplier for `edge_support` (Stage 5). Overridden
    /// wholesale by the `GRAPH_BONUS_MAP` JSON env var when present; not part
    /// of the `config`-crate layering because it's a JSON object, not a flat
    /// key, so `AppConfig::load` merges it in as a post-processing step.
    #[serde(default = "default_bonus_map")]
    pub graph_bonus_map: HashMap<String, f32>,
    /// Database statement budget in seconds (§5 Timeouts).
    pub store_timeout_secs: u64,
    /// Embedding-server call budget in seconds (§5 Timeouts).
    pub embedding_timeout_secs: u64,
}

fn default_bonus_map() -> HashMap<String, f32> {
    HashMap::from([
        ("decision".to_string(), 1.20),
        ("outcome".to_string(), 1.10),
        ("assumption".to_string(), 1.05),
    ])
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            seed_k: 40,
            hop_depth: 2,
            hop_fanout: 80,
            final_k: 12,
            alpha_vec: 0.55,
            beta_bm25: 0.25,
            gamma_graph: 0.15,
            delta_recency: 0.05,
            recency_halflife_days: 45.0,
            use_mmr: true,
            mmr_lambda: 0.7,
            mmr_pool: 100,
            graph_bonus_map: default_bonus_map(),
            store_timeout_secs: 10,
            embedding_timeout_secs: 30,
        }
    }
}

/// Deriver poll cadence (§5 Scheduling model).
#[derive(Debug, Deserialize, Clone)]
pub struct DeriverConfig {
    pub poll_sleep_seconds: u64,
}

impl Default for DeriverConfig {
    fn default() -> Self {
        Self {
            poll_sleep_seconds: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub deriver: DeriverConfig,
    /// Base URL of the external embedding service (§6). `None` falls back to
    /// the in-process deterministic embedder, which is what test and
    /// local-dev configurations do.
    #[serde(default)]
    pub embedding_url: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(File::with_name("config/default"))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("ALAYASIKI").separator("__"));

        let mut cfg: AppConfig = builder.build()?.try_deserialize()?;

        if let Ok(raw) = env::var("GRAPH_BONUS_MAP") {
            let parsed: HashMap<String, f32> = serde_json::from_str(&raw).map_err(|e| {
                ConfigError::Message(format!("invalid GRAPH_BONUS_MAP: {e}"))
            })?;
            cfg.retrieval.graph_bonus_map = parsed;
        }
        if let Ok(url) = env::var("EMBEDDING_URL") {
            cfg.embedding_url = Some(url);
        }

        Ok(cfg)
    }
}
