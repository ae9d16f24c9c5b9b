//! Runtime configuration.
//!
//! [`RuntimeConfig`] holds the knobs shared by every entity of a node:
//! stream capacities, the node identity and the stack size of entity
//! threads. It can be built in code through [`RuntimeConfigBuilder`] or
//! loaded from a TOML document.
//!
//! ```toml
//! node_id = 1
//! stream_capacity = 64
//! thread_stack_size = 262144
//! ```

use serde::Deserialize;

/// Default capacity of a stream created with capacity `0`.
pub const DEFAULT_STREAM_CAPACITY: usize = 10;

/// Minimum stream capacity.
pub const MIN_STREAM_CAPACITY: usize = 1;

/// Maximum stream capacity.
pub const MAX_STREAM_CAPACITY: usize = 1 << 16;

/// Capacity of the single-use streams that deliver fetched data to waiters.
pub const FETCH_STREAM_CAPACITY: usize = 1;

/// Capacity of the output manager's wakeup stream.
pub const WAKEUP_STREAM_CAPACITY: usize = 1;

/// Errors raised while loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("invalid runtime configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of its accepted range.
    #[error("invalid value for `{field}`: {message}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        message: String,
    },
}

/// Configuration for one runtime node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Identity of this node in a distributed run.
    pub node_id: i32,

    /// Capacity of streams created with capacity `0`.
    pub stream_capacity: usize,

    /// Capacity of the output manager's wakeup stream.
    pub wakeup_stream_capacity: usize,

    /// Stack size for entity threads, `None` for the platform default.
    pub thread_stack_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            wakeup_stream_capacity: WAKEUP_STREAM_CAPACITY,
            thread_stack_size: None,
        }
    }
}

impl RuntimeConfig {
    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Parses a configuration from a TOML document.
    ///
    /// Missing keys take their default value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys and
    /// [`ConfigError::InvalidValue`] when a value is out of range.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is within its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id < 0 {
            return Err(ConfigError::InvalidValue {
                field: "node_id",
                message: format!("must be non-negative, got {}", self.node_id),
            });
        }
        if !(MIN_STREAM_CAPACITY..=MAX_STREAM_CAPACITY).contains(&self.stream_capacity) {
            return Err(ConfigError::InvalidValue {
                field: "stream_capacity",
                message: format!(
                    "must be between {MIN_STREAM_CAPACITY} and {MAX_STREAM_CAPACITY}, got {}",
                    self.stream_capacity
                ),
            });
        }
        if self.wakeup_stream_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "wakeup_stream_capacity",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Resolves a requested capacity, mapping `0` to the configured default.
    #[must_use]
    pub fn effective_capacity(&self, requested: usize) -> usize {
        if requested == 0 {
            self.stream_capacity
        } else {
            requested.clamp(MIN_STREAM_CAPACITY, MAX_STREAM_CAPACITY)
        }
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    node_id: Option<i32>,
    stream_capacity: Option<usize>,
    wakeup_stream_capacity: Option<usize>,
    thread_stack_size: Option<usize>,
}

impl RuntimeConfigBuilder {
    /// Sets the node identity.
    #[must_use]
    pub fn node_id(mut self, node_id: i32) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Sets the default stream capacity.
    #[must_use]
    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = Some(capacity);
        self
    }

    /// Sets the wakeup stream capacity.
    #[must_use]
    pub fn wakeup_stream_capacity(mut self, capacity: usize) -> Self {
        self.wakeup_stream_capacity = Some(capacity);
        self
    }

    /// Sets the entity thread stack size.
    #[must_use]
    pub fn thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = Some(bytes);
        self
    }

    /// Builds the configuration, clamping capacities into range.
    #[must_use]
    pub fn build(self) -> RuntimeConfig {
        RuntimeConfig {
            node_id: self.node_id.unwrap_or(0).max(0),
            stream_capacity: self
                .stream_capacity
                .unwrap_or(DEFAULT_STREAM_CAPACITY)
                .clamp(MIN_STREAM_CAPACITY, MAX_STREAM_CAPACITY),
            wakeup_stream_capacity: self
                .wakeup_stream_capacity
                .unwrap_or(WAKEUP_STREAM_CAPACITY)
                .max(1),
            thread_stack_size: self.thread_stack_size,
        }
    }
}
