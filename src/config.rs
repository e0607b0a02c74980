//! Configuration
//!
//! [`BlockCacheConfig`] carries every tunable of the cache, with builder
//! methods for programmatic setup. [`BlockCacheConfigSpec`] is the
//! serializable layer on top: a TOML file (pointed at by `OXICACHE_CONFIG`)
//! plus `OXICACHE__cache__<field>` environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::size;

/// Errors returned by configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// Two options contradict each other.
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Tunables of one block cache instance.
#[derive(Debug, Clone)]
pub struct BlockCacheConfig {
    /// Parent directory; the cache creates a unique subdirectory beneath it.
    pub path: PathBuf,
    /// Total byte budget across all cache files.
    pub cache_size: u64,
    /// Maximum bytes per cache file. Offsets are 32-bit, so at most 4 GiB.
    pub cache_file_size: u32,
    /// Size of one write buffer.
    pub write_buffer_size: u32,
    /// Write buffers pre-allocated at startup.
    pub write_buffer_count: u32,
    /// Byte ceiling the buffer pool may grow to (the pipeline depth).
    pub bufferpool_limit: u64,
    /// Offload inserts to a dedicated worker thread.
    pub pipeline_writes: bool,
    /// Bound on queued insert operations when pipelining.
    pub insert_queue_depth: usize,
    /// Number of flusher threads.
    pub writer_qdepth: usize,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            cache_size: u64::MAX,
            cache_file_size: (100 * size::MIB) as u32,
            write_buffer_size: size::MIB as u32,
            write_buffer_count: 16,
            bufferpool_limit: 64 * size::MIB,
            pipeline_writes: true,
            insert_queue_depth: 256,
            writer_qdepth: 1,
        }
    }
}

impl BlockCacheConfig {
    /// Start from defaults with the given cache directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the total byte budget.
    pub fn with_cache_size(mut self, bytes: u64) -> Self {
        self.cache_size = bytes;
        self
    }

    /// Set the per-file size limit.
    pub fn with_cache_file_size(mut self, bytes: u32) -> Self {
        self.cache_file_size = bytes;
        self
    }

    /// Set the write buffer size.
    pub fn with_write_buffer_size(mut self, bytes: u32) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    /// Set the number of pre-allocated write buffers.
    pub fn with_write_buffer_count(mut self, count: u32) -> Self {
        self.write_buffer_count = count;
        self
    }

    /// Set the buffer pool growth ceiling.
    pub fn with_bufferpool_limit(mut self, bytes: u64) -> Self {
        self.bufferpool_limit = bytes;
        self
    }

    /// Enable or disable the insert worker.
    pub fn with_pipeline_writes(mut self, pipeline: bool) -> Self {
        self.pipeline_writes = pipeline;
        self
    }

    /// Set the insert queue bound.
    pub fn with_insert_queue_depth(mut self, depth: usize) -> Self {
        self.insert_queue_depth = depth;
        self
    }

    /// Set the flusher thread count.
    pub fn with_writer_qdepth(mut self, qdepth: usize) -> Self {
        self.writer_qdepth = qdepth;
        self
    }

    /// Reject option combinations the cache cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_buffer_size == 0 {
            return Err(ConfigError::Inconsistent(
                "write_buffer_size must be non-zero".into(),
            ));
        }
        if self.cache_file_size == 0 {
            return Err(ConfigError::Inconsistent(
                "cache_file_size must be non-zero".into(),
            ));
        }
        if self.write_buffer_size as u64 > self.bufferpool_limit {
            return Err(ConfigError::Inconsistent(
                "bufferpool_limit is smaller than one write buffer".into(),
            ));
        }
        if self.writer_qdepth == 0 {
            return Err(ConfigError::Inconsistent(
                "writer_qdepth must be at least 1".into(),
            ));
        }
        if self.pipeline_writes && self.insert_queue_depth == 0 {
            return Err(ConfigError::Inconsistent(
                "insert_queue_depth must be at least 1 when pipelining".into(),
            ));
        }
        Ok(())
    }
}

/// Serializable configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlockCacheConfigSpec {
    /// The `[cache]` section.
    pub cache: Option<CacheSection>,
}

/// Fields of the `[cache]` section; unset fields keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[allow(missing_docs)]
pub struct CacheSection {
    pub path: Option<PathBuf>,
    pub cache_size: Option<u64>,
    pub cache_file_size: Option<u32>,
    pub write_buffer_size: Option<u32>,
    pub write_buffer_count: Option<u32>,
    pub bufferpool_limit: Option<u64>,
    pub pipeline_writes: Option<bool>,
    pub insert_queue_depth: Option<usize>,
    pub writer_qdepth: Option<usize>,
}

impl BlockCacheConfigSpec {
    /// Load the schema from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load from the `OXICACHE_CONFIG` env var (if set), then apply
    /// `OXICACHE__cache__<field>` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut spec = match env::var("OXICACHE_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        spec.apply_env_overrides()?;
        Ok(spec)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXICACHE__") {
                continue;
            }
            let path = key["OXICACHE__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["cache", "path"] => {
                    self.cache_mut().path = Some(PathBuf::from(value));
                }
                ["cache", "cache_size"] => {
                    self.cache_mut().cache_size = Some(parse_value(&key, &value)?);
                }
                ["cache", "cache_file_size"] => {
                    self.cache_mut().cache_file_size = Some(parse_value(&key, &value)?);
                }
                ["cache", "write_buffer_size"] => {
                    self.cache_mut().write_buffer_size = Some(parse_value(&key, &value)?);
                }
                ["cache", "write_buffer_count"] => {
                    self.cache_mut().write_buffer_count = Some(parse_value(&key, &value)?);
                }
                ["cache", "bufferpool_limit"] => {
                    self.cache_mut().bufferpool_limit = Some(parse_value(&key, &value)?);
                }
                ["cache", "pipeline_writes"] => {
                    self.cache_mut().pipeline_writes = Some(parse_value(&key, &value)?);
                }
                ["cache", "insert_queue_depth"] => {
                    self.cache_mut().insert_queue_depth = Some(parse_value(&key, &value)?);
                }
                ["cache", "writer_qdepth"] => {
                    self.cache_mut().writer_qdepth = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build a [`BlockCacheConfig`] from defaults plus whatever is set.
    pub fn to_config(&self) -> BlockCacheConfig {
        let mut config = BlockCacheConfig::default();
        if let Some(cache) = &self.cache {
            if let Some(path) = &cache.path {
                config.path = path.clone();
            }
            if let Some(v) = cache.cache_size {
                config.cache_size = v;
            }
            if let Some(v) = cache.cache_file_size {
                config.cache_file_size = v;
            }
            if let Some(v) = cache.write_buffer_size {
                config.write_buffer_size = v;
            }
            if let Some(v) = cache.write_buffer_count {
                config.write_buffer_count = v;
            }
            if let Some(v) = cache.bufferpool_limit {
                config.bufferpool_limit = v;
            }
            if let Some(v) = cache.pipeline_writes {
                config.pipeline_writes = v;
            }
            if let Some(v) = cache.insert_queue_depth {
                config.insert_queue_depth = v;
            }
            if let Some(v) = cache.writer_qdepth {
                config.writer_qdepth = v;
            }
        }
        config
    }

    fn cache_mut(&mut self) -> &mut CacheSection {
        if self.cache.is_none() {
            self.cache = Some(CacheSection::default());
        }
        self.cache.as_mut().expect("cache section")
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BlockCacheConfig::default();
        assert_eq!(config.cache_file_size, (100 * size::MIB) as u32);
        assert_eq!(config.write_buffer_size, size::MIB as u32);
        assert!(config.pipeline_writes);
        assert_eq!(config.writer_qdepth, 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_builder() {
        let config = BlockCacheConfig::new("/tmp/cache")
            .with_cache_size(size::GIB)
            .with_cache_file_size((16 * size::MIB) as u32)
            .with_write_buffer_size(64 * 1024)
            .with_pipeline_writes(false)
            .with_writer_qdepth(2);

        assert_eq!(config.path, PathBuf::from("/tmp/cache"));
        assert_eq!(config.cache_size, size::GIB);
        assert_eq!(config.cache_file_size, (16 * size::MIB) as u32);
        assert_eq!(config.write_buffer_size, 64 * 1024);
        assert!(!config.pipeline_writes);
        assert_eq!(config.writer_qdepth, 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let config = BlockCacheConfig::default().with_write_buffer_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_pool() {
        let config = BlockCacheConfig::default()
            .with_write_buffer_size((4 * size::MIB) as u32)
            .with_bufferpool_limit(size::MIB);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let spec: BlockCacheConfigSpec = toml::from_str(
            r#"
            [cache]
            path = "/var/cache/blocks"
            cache_size = 1073741824
            write_buffer_size = 65536
            pipeline_writes = false
            "#,
        )
        .unwrap();

        let config = spec.to_config();
        assert_eq!(config.path, PathBuf::from("/var/cache/blocks"));
        assert_eq!(config.cache_size, 1 << 30);
        assert_eq!(config.write_buffer_size, 65536);
        assert!(!config.pipeline_writes);
        // Untouched fields keep their defaults.
        assert_eq!(config.writer_qdepth, 1);
    }

    #[test]
    fn test_empty_spec_is_defaults() {
        let spec = BlockCacheConfigSpec::default();
        let config = spec.to_config();
        assert_eq!(config.cache_size, u64::MAX);
    }
}
