//! Store configuration.

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    header::{Header, MAX_CLIENTS},
    page::{DEFAULT_NODE_SIZE, MAX_NODE_SIZE, MIN_NODE_SIZE, is_valid_node_size},
};

/// Minimum growth chunk: 4 KiB.
const MIN_GROWTH_CHUNK: u64 = 4096;

/// Settings applied when a store is created or opened.
///
/// `node_size` and `max_clients` only matter at creation; an existing store
/// keeps the values recorded in its header.
///
/// # Validation Rules
///
/// - `node_size` must be a power of two between 128 and 65536
/// - `max_clients` must be between 1 and 1,048,576
/// - `growth_chunk` must be >= 4 KiB
/// - `initial_file_size` and `max_file_size` must leave room for the header
///   region, both client table images and at least one node
/// - `initial_file_size` must not exceed `max_file_size`
///
/// # Example
///
/// ```no_run
/// # use meowkey_store::StoreConfig;
/// let config = StoreConfig::builder()
///     .max_clients(64)
///     .sync_on_commit(false)
///     .build()
///     .expect("valid store config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Size of every tree node in bytes.
    #[serde(default = "default_node_size")]
    pub node_size: u32,
    /// Capacity of the client table.
    #[serde(default = "default_max_clients")]
    pub max_clients: u32,
    /// File size reserved when a store is created.
    #[serde(default = "default_initial_file_size")]
    pub initial_file_size: u64,
    /// Storage is extended in multiples of this many bytes.
    #[serde(default = "default_growth_chunk")]
    pub growth_chunk: u64,
    /// Hard upper bound on the file size.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Maximum nodes kept in the node cache (0 disables it).
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Whether every commit syncs to stable storage.
    #[serde(default = "default_sync_on_commit")]
    pub sync_on_commit: bool,
}

#[bon::bon]
impl StoreConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any value breaks a validation rule.
    #[builder]
    pub fn new(
        #[builder(default = default_node_size())] node_size: u32,
        #[builder(default = default_max_clients())] max_clients: u32,
        #[builder(default = default_initial_file_size())] initial_file_size: u64,
        #[builder(default = default_growth_chunk())] growth_chunk: u64,
        #[builder(default = default_max_file_size())] max_file_size: u64,
        #[builder(default = default_cache_capacity())] cache_capacity: usize,
        #[builder(default = default_sync_on_commit())] sync_on_commit: bool,
    ) -> Result<Self> {
        let config = Self {
            node_size,
            max_clients,
            initial_file_size,
            growth_chunk,
            max_file_size,
            cache_capacity,
            sync_on_commit,
        };
        config.validate()?;
        Ok(config)
    }
}

impl StoreConfig {
    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::InvalidConfig { message });

        if !is_valid_node_size(self.node_size) {
            return invalid(format!(
                "node_size must be a power of two in {MIN_NODE_SIZE}..={MAX_NODE_SIZE}, got {}",
                self.node_size
            ));
        }
        if self.max_clients == 0 || self.max_clients > MAX_CLIENTS {
            return invalid(format!(
                "max_clients must be in 1..={MAX_CLIENTS}, got {}",
                self.max_clients
            ));
        }
        if self.growth_chunk < MIN_GROWTH_CHUNK {
            return invalid(format!(
                "growth_chunk must be >= {MIN_GROWTH_CHUNK}, got {}",
                self.growth_chunk
            ));
        }
        let minimum = self.minimum_file_size();
        if self.max_file_size < minimum {
            return invalid(format!(
                "max_file_size must be >= {minimum} for {} clients, got {}",
                self.max_clients, self.max_file_size
            ));
        }
        if self.initial_file_size > self.max_file_size {
            return invalid(format!(
                "initial_file_size {} exceeds max_file_size {}",
                self.initial_file_size, self.max_file_size
            ));
        }
        Ok(())
    }

    /// Smallest file that holds the header region, both client table
    /// images and one node.
    pub fn minimum_file_size(&self) -> u64 {
        Header::initial(self.max_clients, self.node_size).data_start() + u64::from(self.node_size)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            node_size: default_node_size(),
            max_clients: default_max_clients(),
            initial_file_size: default_initial_file_size(),
            growth_chunk: default_growth_chunk(),
            max_file_size: default_max_file_size(),
            cache_capacity: default_cache_capacity(),
            sync_on_commit: default_sync_on_commit(),
        }
    }
}

fn default_node_size() -> u32 {
    DEFAULT_NODE_SIZE
}

fn default_max_clients() -> u32 {
    1000
}

fn default_initial_file_size() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_growth_chunk() -> u64 {
    1024 * 1024
}

fn default_max_file_size() -> u64 {
    64 * 1024 * 1024 * 1024 // 64 GiB
}

fn default_cache_capacity() -> usize {
    1024 // 4 MiB of 4 KiB nodes
}

fn default_sync_on_commit() -> bool {
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::builder().build().expect("defaults should be valid");
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.node_size, 4096);
        assert_eq!(config.max_clients, 1000);
        assert!(config.sync_on_commit);
    }

    #[test]
    fn test_builder_overrides() {
        let config = StoreConfig::builder()
            .max_clients(2)
            .node_size(256)
            .cache_capacity(0)
            .build()
            .unwrap();
        assert_eq!(config.max_clients, 2);
        assert_eq!(config.node_size, 256);
        assert_eq!(config.cache_capacity, 0);
    }

    #[test]
    fn test_rejects_bad_node_size() {
        let err = StoreConfig::builder().node_size(1000).build().unwrap_err();
        assert!(err.to_string().contains("node_size"), "got: {err}");
    }

    #[test]
    fn test_rejects_zero_clients() {
        let err = StoreConfig::builder().max_clients(0).build().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_rejects_small_growth_chunk() {
        assert!(StoreConfig::builder().growth_chunk(100).build().is_err());
    }

    #[test]
    fn test_rejects_max_file_size_below_minimum() {
        let err = StoreConfig::builder().max_file_size(1024).initial_file_size(0).build().unwrap_err();
        assert!(err.to_string().contains("max_file_size"), "got: {err}");
    }

    #[test]
    fn test_minimum_file_size_covers_both_client_images() {
        let config = StoreConfig::builder().node_size(256).max_clients(4).build().unwrap();
        assert_eq!(config.minimum_file_size(), 512 + 2 * 4 * 256 + 256);
    }

    #[test]
    fn test_rejects_initial_above_max() {
        let result = StoreConfig::builder()
            .initial_file_size(10 * 1024 * 1024)
            .max_file_size(8 * 1024 * 1024)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_serde_round_trip_and_defaults() {
        let config = StoreConfig::builder().max_clients(8).build().unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let partial: StoreConfig = serde_json::from_str(r#"{"max_clients": 3}"#).unwrap();
        assert_eq!(partial.max_clients, 3);
        assert_eq!(partial.node_size, DEFAULT_NODE_SIZE);
        partial.validate().unwrap();
    }

    #[test]
    fn test_deserialized_config_can_be_invalid_until_validated() {
        let config: StoreConfig = serde_json::from_str(r#"{"node_size": 7}"#).unwrap();
        assert!(config.validate().is_err());
    }
}
