//! Configuration module for the recommendation core.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//! - CLI argument overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `FOLIO_` and use double underscores
//! to separate nested levels:
//! - `FOLIO_INDEX__STAGING_CAP=8192` sets `index.staging_cap`
//! - `FOLIO_EMBEDDING__MODEL=BGESmallENV15` sets `embedding.model`
//! - `FOLIO_STORAGE__FSYNC=false` sets `storage.fsync`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};
use crate::index::IndexConfig;
use crate::store::StoreOptions;
use crate::vector::VectorDimension;

/// Directory holding the settings file, searched for in ancestors.
const CONFIG_DIR: &str = ".folio";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory for the vector log
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Workspace root directory (where .folio is located)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    /// Global debug mode
    #[serde(default = "default_false")]
    pub debug: bool,

    /// ANN index tuning
    #[serde(default)]
    pub index: IndexSettings,

    /// Encoder settings
    #[serde(default)]
    pub embedding: EmbeddingSettings,

    /// Query defaults
    #[serde(default)]
    pub recommend: RecommendSettings,

    /// Vector log settings
    #[serde(default)]
    pub storage: StorageSettings,

    /// Async worker pool
    #[serde(default)]
    pub workers: WorkerSettings,

    /// Change-feed synchronisation
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IndexSettings {
    /// Embedding dimension; must match the encoder
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Maximum staged vectors before an add forces a rebuild
    #[serde(default = "default_staging_cap")]
    pub staging_cap: usize,

    /// Rebuild when pending staging work exceeds this fraction of items
    #[serde(default = "default_rebuild_fraction")]
    pub rebuild_fraction: f64,

    /// Minimum pending staging work before a rebuild triggers
    #[serde(default = "default_min_rebuild_staging")]
    pub min_rebuild_staging: usize,

    /// Snapshots at or below this size are searched exhaustively
    #[serde(default = "default_linear_scan_threshold")]
    pub linear_scan_threshold: usize,

    /// IVF partitions per snapshot (0 = about sqrt(items))
    #[serde(default)]
    pub partitions: usize,

    /// Partitions probed per query
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,

    /// Seed for K-means, keeps rebuilds reproducible
    #[serde(default = "default_kmeans_seed")]
    pub kmeans_seed: u64,

    #[serde(default = "default_max_kmeans_iterations")]
    pub max_kmeans_iterations: usize,

    /// Rebuild in the background when the trigger fires
    #[serde(default = "default_true")]
    pub auto_rebuild: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EmbeddingSettings {
    /// Model to use for embeddings
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Where downloaded models are cached (defaults to the user cache dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// Show a progress bar while downloading a model
    #[serde(default = "default_false")]
    pub show_download_progress: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RecommendSettings {
    /// Results returned when the caller gives no k
    #[serde(default = "default_k")]
    pub default_k: usize,

    /// Drop results below this score (unset = accept all)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f32>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageSettings {
    /// sync_data after every vector log append
    #[serde(default = "default_true")]
    pub fsync: bool,

    /// Compact the log once dead records exceed this fraction
    #[serde(default = "default_compact_ratio")]
    pub compact_ratio: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Concurrent core calls in the async service
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SyncSettings {
    /// Changes pulled per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Cursor file (defaults to `<data_path>/sync_cursors.json`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_file: Option<PathBuf>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_data_path() -> PathBuf {
    PathBuf::from(".folio/data")
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_dimension() -> usize {
    crate::vector::VECTOR_DIMENSION_384
}
fn default_staging_cap() -> usize {
    4096
}
fn default_rebuild_fraction() -> f64 {
    0.05
}
fn default_min_rebuild_staging() -> usize {
    64
}
fn default_linear_scan_threshold() -> usize {
    2048
}
fn default_nprobe() -> usize {
    8
}
fn default_kmeans_seed() -> u64 {
    42
}
fn default_max_kmeans_iterations() -> usize {
    25
}
fn default_embedding_model() -> String {
    "AllMiniLML6V2".to_string()
}
fn default_k() -> usize {
    10
}
fn default_compact_ratio() -> f64 {
    0.5
}
fn default_pool_size() -> usize {
    num_cpus::get()
}
fn default_batch_size() -> usize {
    256
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_path: default_data_path(),
            workspace_root: None,
            debug: false,
            index: IndexSettings::default(),
            embedding: EmbeddingSettings::default(),
            recommend: RecommendSettings::default(),
            storage: StorageSettings::default(),
            workers: WorkerSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            staging_cap: default_staging_cap(),
            rebuild_fraction: default_rebuild_fraction(),
            min_rebuild_staging: default_min_rebuild_staging(),
            linear_scan_threshold: default_linear_scan_threshold(),
            partitions: 0,
            nprobe: default_nprobe(),
            kmeans_seed: default_kmeans_seed(),
            max_kmeans_iterations: default_max_kmeans_iterations(),
            auto_rebuild: true,
        }
    }
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            cache_dir: None,
            show_download_progress: false,
        }
    }
}

impl Default for RecommendSettings {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            min_score: None,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            fsync: true,
            compact_ratio: default_compact_ratio(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            cursor_file: None,
        }
    }
}

impl IndexSettings {
    /// Converts to the index's own configuration, validating ranges.
    pub fn to_index_config(&self) -> CoreResult<IndexConfig> {
        let dimension = VectorDimension::new(self.dimension).map_err(|e| CoreError::Config {
            reason: e.to_string(),
        })?;
        if !(0.0..=1.0).contains(&self.rebuild_fraction) {
            return Err(CoreError::Config {
                reason: format!(
                    "index.rebuild_fraction must be within [0, 1], got {}",
                    self.rebuild_fraction
                ),
            });
        }
        if self.staging_cap == 0 || self.nprobe == 0 {
            return Err(CoreError::Config {
                reason: "index.staging_cap and index.nprobe must be at least 1".to_string(),
            });
        }
        Ok(IndexConfig {
            dimension,
            staging_cap: self.staging_cap,
            rebuild_fraction: self.rebuild_fraction,
            min_rebuild_staging: self.min_rebuild_staging,
            linear_scan_threshold: self.linear_scan_threshold,
            partitions: self.partitions,
            nprobe: self.nprobe,
            kmeans_seed: self.kmeans_seed,
            max_kmeans_iterations: self.max_kmeans_iterations,
            auto_rebuild: self.auto_rebuild,
        })
    }
}

impl StorageSettings {
    #[must_use]
    pub fn to_store_options(&self) -> StoreOptions {
        StoreOptions {
            fsync: self.fsync,
            compact_ratio: self.compact_ratio,
        }
    }
}

fn env_provider() -> Env {
    // Double underscore (__) separates nested levels;
    // single underscores stay part of field names.
    Env::prefixed("FOLIO_").map(|key| key.as_str().to_lowercase().replace("__", ".").into())
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("settings.toml"));

        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            .merge(env_provider())
            .extract()
            .map_err(Box::new)
            .map(|mut settings: Settings| {
                if settings.workspace_root.is_none() {
                    settings.workspace_root = Self::workspace_root();
                }
                settings
            })
    }

    /// Load configuration from a specific file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(env_provider())
            .extract()
            .map_err(Box::new)
    }

    /// Find the settings file by looking for a .folio directory
    /// from the current directory up to the root
    fn find_workspace_config() -> Option<PathBuf> {
        Self::workspace_root().map(|root| root.join(CONFIG_DIR).join("settings.toml"))
    }

    /// Get the workspace root directory (where .folio is located)
    pub fn workspace_root() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        current
            .ancestors()
            .find(|ancestor| ancestor.join(CONFIG_DIR).is_dir())
            .map(Path::to_path_buf)
    }

    /// Check if configuration is properly initialized
    pub fn check_init() -> Result<(), String> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("settings.toml"));

        if !config_path.exists() {
            return Err("No configuration file found".to_string());
        }

        match std::fs::read_to_string(&config_path) {
            Ok(content) => {
                if let Err(e) = toml::from_str::<Settings>(&content) {
                    return Err(format!(
                        "Configuration file is corrupted: {e}\nRun 'folio init --force' to regenerate."
                    ));
                }
            }
            Err(e) => {
                return Err(format!("Cannot read configuration file: {e}"));
            }
        }

        Ok(())
    }

    /// Resolve a settings path against the workspace root
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.workspace_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Directory holding the vector log
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.data_path)
    }

    /// Location of the sync cursor file
    #[must_use]
    pub fn cursor_path(&self) -> PathBuf {
        match &self.sync.cursor_file {
            Some(path) => self.resolve(path),
            None => self.data_dir().join("sync_cursors.json"),
        }
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file with helpful comments
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(CONFIG_DIR).join("settings.toml");

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = format!(
            r#"# Folio Configuration File

# Version of the configuration schema
version = 1

# Directory for the vector log (relative to workspace root)
data_path = ".folio/data"

# Global debug mode
debug = false

[index]
# Embedding dimension; must match the model below
dimension = {dimension}

# Maximum staged vectors before an add forces a synchronous rebuild
staging_cap = 4096

# Rebuild in the background once staged work exceeds this fraction of items
rebuild_fraction = 0.05

# ...but never for fewer pending entries than this
min_rebuild_staging = 64

# Snapshots at or below this many items are searched exhaustively
linear_scan_threshold = 2048

# IVF partitions per snapshot (0 = about sqrt(items))
partitions = 0

# Partitions probed per query; higher is more accurate and slower
nprobe = 8

# K-means seed and iteration cap (rebuilds are reproducible for a fixed seed)
kmeans_seed = 42
max_kmeans_iterations = 25

# Rebuild automatically in the background
auto_rebuild = true

[embedding]
# Model to use for embeddings
model = "AllMiniLML6V2"

# Where downloaded models are cached (default: user cache dir)
# cache_dir = "/path/to/models"

show_download_progress = false

[recommend]
# Results returned when no k is given
default_k = 10

# Drop results scoring below this (-1.0 to 1.0); unset accepts all
# min_score = 0.3

[storage]
# Flush every vector log append to disk
fsync = true

# Compact the vector log once dead records exceed this fraction
compact_ratio = 0.5

[workers]
# Concurrent core calls in the async service (defaults to CPU count)
# pool_size = {pool_size}

[sync]
# Changes pulled per batch
batch_size = 256

# Cursor file (default: <data_path>/sync_cursors.json)
# cursor_file = ".folio/data/sync_cursors.json"
"#,
            dimension = default_dimension(),
            pool_size = num_cpus::get()
        );

        std::fs::write(&config_path, template)?;

        if force {
            println!("Overwrote configuration at: {}", config_path.display());
        } else {
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
        }

        Ok(config_path)
    }
}
