use crate::storage::{self, StorageManager};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

const TASK_QUEUE_MAX_THREADS: u16 = 4;
const TASK_QUEUE_MAX_RETRIES: u8 = 3;
const TASK_QUEUE_RETRY_BASE_MS: u64 = 5000;

/// Default embedding model, 384-dimensional output
const DEFAULT_SEMANTIC_MODEL: &str = "all-MiniLM-L6-v2";
const DEFAULT_DIMENSIONS: usize = 384;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
/// Budget for the whole semantic path of a single query
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 2000;

const DEFAULT_COLLECTION: &str = "products";
const DEFAULT_QDRANT_URL: &str = "http://localhost:6333";
const DEFAULT_VECTOR_TIMEOUT_MS: u64 = 1500;
const DEFAULT_SCROLL_PAGE_SIZE: usize = 100;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

const DEFAULT_SHARE_TTL_SECS: i64 = 24 * 60 * 60;
const DEFAULT_SHARE_CODE_LENGTH: usize = 8;

/// Configuration for semantic search functionality
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticSearchConfig {
    /// When disabled every query goes straight to keyword matching
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2").
    /// "hashing" selects the offline feature-hashing embedder.
    #[serde(default = "default_semantic_model")]
    pub model: String,

    /// Vector dimensionality; must match the model output
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for SemanticSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: DEFAULT_SEMANTIC_MODEL.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    /// In-process index persisted to vectors.bin
    #[default]
    Memory,
    Qdrant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default)]
    pub backend: VectorBackend,

    #[serde(default = "default_collection")]
    pub collection: String,

    #[serde(default = "default_qdrant_url")]
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_vector_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_scroll_page_size")]
    pub scroll_page_size: usize,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Memory,
            collection: DEFAULT_COLLECTION.to_string(),
            url: DEFAULT_QDRANT_URL.to_string(),
            api_key: None,
            timeout_ms: DEFAULT_VECTOR_TIMEOUT_MS,
            scroll_page_size: DEFAULT_SCROLL_PAGE_SIZE,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "max_page_size")]
    pub max_page_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareConfig {
    /// How long a share code stays redeemable
    #[serde(default = "default_share_ttl_secs")]
    pub ttl_secs: i64,
    #[serde(default = "default_share_code_length")]
    pub code_length: usize,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_SHARE_TTL_SECS,
            code_length: DEFAULT_SHARE_CODE_LENGTH,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_semantic_model() -> String {
    DEFAULT_SEMANTIC_MODEL.to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_query_timeout_ms() -> u64 {
    DEFAULT_QUERY_TIMEOUT_MS
}

fn default_collection() -> String {
    DEFAULT_COLLECTION.to_string()
}

fn default_qdrant_url() -> String {
    DEFAULT_QDRANT_URL.to_string()
}

fn default_vector_timeout_ms() -> u64 {
    DEFAULT_VECTOR_TIMEOUT_MS
}

fn default_scroll_page_size() -> usize {
    DEFAULT_SCROLL_PAGE_SIZE
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn max_page_size() -> usize {
    MAX_PAGE_SIZE
}

fn default_share_ttl_secs() -> i64 {
    DEFAULT_SHARE_TTL_SECS
}

fn default_share_code_length() -> usize {
    DEFAULT_SHARE_CODE_LENGTH
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "task_queue_max_threads")]
    pub task_queue_max_threads: u16,
    #[serde(default = "task_queue_max_retries")]
    pub task_queue_max_retries: u8,
    /// First retry delay; doubles on every following attempt
    #[serde(default = "task_queue_retry_base_ms")]
    pub task_queue_retry_base_ms: u64,

    #[serde(default)]
    pub semantic_search: SemanticSearchConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub share: ShareConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_queue_max_threads: TASK_QUEUE_MAX_THREADS,
            task_queue_max_retries: TASK_QUEUE_MAX_RETRIES,
            task_queue_retry_base_ms: TASK_QUEUE_RETRY_BASE_MS,
            semantic_search: SemanticSearchConfig::default(),
            vector_store: VectorStoreConfig::default(),
            search: SearchConfig::default(),
            share: ShareConfig::default(),
            base_path: String::new(),
        }
    }
}

fn task_queue_max_threads() -> u16 {
    TASK_QUEUE_MAX_THREADS
}

fn task_queue_max_retries() -> u8 {
    TASK_QUEUE_MAX_RETRIES
}

fn task_queue_retry_base_ms() -> u64 {
    TASK_QUEUE_RETRY_BASE_MS
}

/// Resolve the data directory: `KIOSK_BASE_PATH` or `~/.local/share/kiosk`.
pub fn base_path() -> anyhow::Result<String> {
    if let Ok(path) = std::env::var("KIOSK_BASE_PATH") {
        return Ok(path);
    }

    let home = homedir::my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;

    Ok(format!("{}/.local/share/kiosk", home.to_string_lossy()))
}

impl Config {
    fn validate(&mut self) -> anyhow::Result<()> {
        if self.task_queue_max_threads == 0 {
            self.task_queue_max_threads = 1
        }

        let sem = &self.semantic_search;
        if sem.dimensions == 0 || sem.dimensions > u16::MAX as usize {
            bail!(
                "semantic_search.dimensions must be between 1 and {}, got {}",
                u16::MAX,
                sem.dimensions
            );
        }
        if sem.download_timeout_secs == 0 {
            bail!("semantic_search.download_timeout_secs must be greater than 0");
        }
        if sem.query_timeout_ms == 0 {
            bail!("semantic_search.query_timeout_ms must be greater than 0");
        }

        let vs = &self.vector_store;
        if vs.backend == VectorBackend::Qdrant {
            url::Url::parse(&vs.url)
                .with_context(|| format!("vector_store.url is not a valid url: {}", vs.url))?;
        }
        if vs.collection.trim().is_empty() {
            bail!("vector_store.collection must not be empty");
        }
        if vs.scroll_page_size == 0 {
            self.vector_store.scroll_page_size = DEFAULT_SCROLL_PAGE_SIZE;
        }

        if self.search.max_page_size == 0 {
            bail!("search.max_page_size must be greater than 0");
        }
        self.search.default_page_size = self
            .search
            .default_page_size
            .clamp(1, self.search.max_page_size);

        if self.share.ttl_secs <= 0 {
            bail!("share.ttl_secs must be greater than 0");
        }
        if !(4..=32).contains(&self.share.code_length) {
            bail!(
                "share.code_length must be between 4 and 32, got {}",
                self.share.code_length
            );
        }

        Ok(())
    }

    pub fn load_with(base_path: &str) -> anyhow::Result<Self> {
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists("config.yaml") {
            store.write(
                "config.yaml",
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str =
            String::from_utf8(store.read("config.yaml")?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_string();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write("config.yaml", config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }
}
