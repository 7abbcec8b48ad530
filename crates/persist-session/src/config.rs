//! Session configuration.

use persist_core::naming::validate_identifier;
use persist_core::{Error, NamingContext, Result};
use serde::{Deserialize, Serialize};

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum identifiers per multi-load query.
    pub batch_fetch_size: usize,
    /// Maximum statements per write batch.
    pub write_batch_size: usize,
    /// Whether loaded entities start out read-only.
    pub default_read_only: bool,
    /// Whether loads and flushes use the second-level cache when one is attached.
    pub use_second_level_cache: bool,
    /// Lazy initializations of one role before a warning is logged. 0 disables.
    pub lazy_load_warn_threshold: usize,
    pub default_catalog: Option<String>,
    pub default_schema: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_fetch_size: 16,
            write_batch_size: 32,
            default_read_only: false,
            use_second_level_cache: true,
            lazy_load_warn_threshold: 10,
            default_catalog: None,
            default_schema: None,
        }
    }
}

impl SessionConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check batch sizes and identifier syntax.
    pub fn validate(&self) -> Result<()> {
        if self.batch_fetch_size == 0 {
            return Err(Error::Config("batch_fetch_size must be at least 1".to_string()));
        }
        if self.write_batch_size == 0 {
            return Err(Error::Config("write_batch_size must be at least 1".to_string()));
        }
        if let Some(catalog) = &self.default_catalog {
            validate_identifier("catalog", catalog)?;
        }
        if let Some(schema) = &self.default_schema {
            validate_identifier("schema", schema)?;
        }
        Ok(())
    }

    /// Naming context for SQL rendered on behalf of this session.
    pub fn naming_context(&self) -> Result<NamingContext> {
        NamingContext::new(self.default_catalog.as_deref(), self.default_schema.as_deref())
    }

    #[must_use]
    pub fn with_batch_fetch_size(mut self, size: usize) -> Self {
        self.batch_fetch_size = size;
        self
    }

    #[must_use]
    pub fn with_write_batch_size(mut self, size: usize) -> Self {
        self.write_batch_size = size;
        self
    }

    #[must_use]
    pub fn with_default_read_only(mut self, read_only: bool) -> Self {
        self.default_read_only = read_only;
        self
    }

    #[must_use]
    pub fn with_second_level_cache(mut self, enabled: bool) -> Self {
        self.use_second_level_cache = enabled;
        self
    }

    #[must_use]
    pub fn with_lazy_load_warn_threshold(mut self, threshold: usize) -> Self {
        self.lazy_load_warn_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_default_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.default_catalog = Some(catalog.into());
        self
    }

    #[must_use]
    pub fn with_default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = Some(schema.into());
        self
    }
}
