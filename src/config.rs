//! Configuration for embedding variables and their storage
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `EVSTORE__<SECTION>__<FIELD>` environment variables.
//!
//! ```toml
//! [embedding]
//! emb_index = 0
//! slot_num = 1
//! steps_to_live = 4000
//!
//! [storage]
//! storage_type = "dram_pmem"
//! primary_capacity = 1000000
//! ```

use crate::error::{Error, Result};
use crate::storage::kv::MapKind;
use crate::storage::shrink::ShrinkPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Per-variable embedding settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Column this variable reads and writes
    pub emb_index: usize,
    /// Column of the primary embedding sharing the slot
    pub primary_emb_index: usize,
    /// Number of blocks (dynamic-dimension embeddings)
    pub block_num: usize,
    /// Auxiliary optimizer columns per block
    pub slot_num: usize,
    /// Admission threshold; 0 admits every key
    pub filter_freq: i64,
    /// Drop keys not updated for this many steps; 0 disables
    pub steps_to_live: i64,
    /// Drop keys whose primary L2 weight is below this; <= 0 disables
    pub l2_weight_threshold: f64,
    pub record_freq: bool,
    pub record_version: bool,
    /// Number of default value rows
    pub default_value_dim: usize,
    /// Value returned for keys the filter did not admit
    pub default_value_no_permission: f64,
    /// Keep rejected keys (freq/version only) in checkpoints
    pub save_unfiltered_features: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            emb_index: 0,
            primary_emb_index: 0,
            block_num: 1,
            slot_num: 0,
            filter_freq: 0,
            steps_to_live: 0,
            l2_weight_threshold: -1.0,
            record_freq: false,
            record_version: false,
            default_value_dim: 4096,
            default_value_no_permission: 0.0,
            save_unfiltered_features: false,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_primary(&self) -> bool {
        self.emb_index == self.primary_emb_index
    }

    pub fn is_counter_filter(&self) -> bool {
        self.filter_freq != 0
    }

    pub fn is_save_freq(&self) -> bool {
        self.filter_freq != 0 || self.record_freq
    }

    pub fn is_save_version(&self) -> bool {
        self.steps_to_live != 0 || self.record_version
    }

    /// Elements per slot for fixed-length layouts
    pub fn total_num(&self, alloc_len: usize) -> usize {
        self.block_num * (1 + self.slot_num) * alloc_len
    }

    /// Columns per slot for indirect layouts
    pub fn column_num(&self) -> usize {
        self.block_num * (1 + self.slot_num)
    }

    /// Retention policy applied on save and shrink
    pub fn shrink_policy(&self) -> ShrinkPolicy {
        if self.steps_to_live != 0 {
            ShrinkPolicy::GlobalStep {
                steps_to_live: self.steps_to_live,
            }
        } else if self.l2_weight_threshold > 0.0 {
            ShrinkPolicy::L2Weight {
                threshold: self.l2_weight_threshold,
            }
        } else {
            ShrinkPolicy::None
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_value_dim == 0 {
            return Err(Error::Config("default_value_dim must be positive".into()));
        }
        if self.block_num == 0 {
            return Err(Error::Config("block_num must be positive".into()));
        }
        if self.emb_index >= self.column_num() || self.primary_emb_index >= self.column_num() {
            return Err(Error::Config(format!(
                "emb_index {} / primary_emb_index {} exceed {} columns",
                self.emb_index,
                self.primary_emb_index,
                self.column_num()
            )));
        }
        Ok(())
    }
}

/// Tier composition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Single host-memory tier
    Dram,
    /// Host memory in front of a capacity tier
    DramPmem,
}

/// Slot layout used by the storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotLayout {
    Normal,
    Light,
    NormalContiguous,
}

/// Storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub storage_type: StorageType,
    pub layout: SlotLayout,
    /// Keys kept in the primary tier before the cache evicts
    pub primary_capacity: usize,
    pub primary_map: MapKind,
    pub capacity_map: MapKind,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Dram,
            layout: SlotLayout::Normal,
            primary_capacity: 1_000_000,
            primary_map: MapKind::Lockless,
            capacity_map: MapKind::Locked,
        }
    }
}

impl StorageConfig {
    pub fn is_multi_level(&self) -> bool {
        self.storage_type != StorageType::Dram
    }
}

/// Checkpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Size of the fixed export buffer
    pub bytes_limit: usize,
    /// Ignore saved versions on restore
    pub reset_version: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            bytes_limit: crate::checkpoint::DEFAULT_BYTES_LIMIT,
            reset_version: false,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvConfig {
    pub embedding: EmbeddingConfig,
    pub storage: StorageConfig,
    pub checkpoint: CheckpointConfig,
}

/// Load configuration from a TOML file with environment overrides
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EvConfig> {
    let path = path.as_ref();
    let settings = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Toml))
        .add_source(
            config::Environment::with_prefix("EVSTORE")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| Error::Config(format!("Failed to load {}: {}", path.display(), e)))?;

    let cfg: EvConfig = settings
        .try_deserialize()
        .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;
    cfg.embedding.validate()?;
    Ok(cfg)
}

/// Load configuration from file or use defaults
pub fn load_config_or_default(path: Option<&Path>) -> EvConfig {
    match path {
        Some(path) => match load_config(path) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load config, using defaults");
                EvConfig::default()
            }
        },
        None => {
            info!("No config file specified, using defaults");
            EvConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_predicates() {
        let mut cfg = EmbeddingConfig::default();
        assert!(cfg.is_primary());
        assert!(!cfg.is_save_freq());
        assert!(!cfg.is_save_version());
        assert_eq!(cfg.shrink_policy(), ShrinkPolicy::None);

        cfg.filter_freq = 3;
        cfg.steps_to_live = 100;
        cfg.slot_num = 2;
        assert!(cfg.is_save_freq());
        assert!(cfg.is_save_version());
        assert_eq!(cfg.total_num(8), 24);
        assert_eq!(cfg.column_num(), 3);
        assert_eq!(
            cfg.shrink_policy(),
            ShrinkPolicy::GlobalStep { steps_to_live: 100 }
        );

        cfg.steps_to_live = 0;
        cfg.l2_weight_threshold = 0.5;
        assert_eq!(cfg.shrink_policy(), ShrinkPolicy::L2Weight { threshold: 0.5 });
    }

    #[test]
    fn test_validate() {
        let mut cfg = EmbeddingConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.emb_index = 1;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
        cfg.slot_num = 1;
        assert!(cfg.validate().is_ok());
        cfg.default_value_dim = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("evstore_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("evstore.toml");
        std::fs::write(
            &path,
            r#"
[embedding]
slot_num = 1
filter_freq = 2
default_value_dim = 8

[storage]
storage_type = "dram_pmem"
layout = "normal_contiguous"
primary_capacity = 128
"#,
        )?;

        let cfg = load_config(&path)?;
        assert_eq!(cfg.embedding.slot_num, 1);
        assert_eq!(cfg.embedding.filter_freq, 2);
        assert_eq!(cfg.embedding.default_value_dim, 8);
        assert_eq!(cfg.storage.storage_type, StorageType::DramPmem);
        assert_eq!(cfg.storage.layout, SlotLayout::NormalContiguous);
        assert_eq!(cfg.storage.primary_capacity, 128);
        // untouched sections keep defaults
        assert_eq!(cfg.checkpoint, CheckpointConfig::default());

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn test_load_config_or_default_missing_file() {
        let cfg = load_config_or_default(Some(Path::new("/nonexistent/evstore.toml")));
        assert_eq!(cfg, EvConfig::default());
    }

    #[test]
    fn test_toml_roundtrip() {
        let cfg = EvConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let parsed: EvConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, cfg);
    }
}
