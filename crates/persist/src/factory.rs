//! Shared configuration for opening sessions.

use persist_core::{MetadataProvider, Result, SecondLevelCache, SqlExecutor};
use persist_session::{Session, SessionConfig};
use std::fmt;
use std::sync::Arc;

/// Opens sessions over one metamodel, configuration, and optional
/// second-level cache.
///
/// The factory is cheap to clone and may be shared between threads; each
/// session it opens is used by one caller.
#[derive(Clone)]
pub struct SessionFactory {
    metadata: Arc<dyn MetadataProvider>,
    config: SessionConfig,
    cache: Option<Arc<dyn SecondLevelCache>>,
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("entities", &self.metadata.entity_names())
            .field("config", &self.config)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl SessionFactory {
    pub fn builder(metadata: Arc<dyn MetadataProvider>) -> SessionFactoryBuilder {
        SessionFactoryBuilder {
            metadata,
            config: SessionConfig::default(),
            cache: None,
        }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataProvider> {
        &self.metadata
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a session over `executor`.
    pub fn open<E: SqlExecutor>(&self, executor: E) -> Result<Session<E>> {
        let session = Session::with_config(Arc::clone(&self.metadata), executor, self.config.clone())?;
        Ok(match &self.cache {
            Some(cache) => session.with_cache(Arc::clone(cache)),
            None => session,
        })
    }
}

/// Builder for [`SessionFactory`].
pub struct SessionFactoryBuilder {
    metadata: Arc<dyn MetadataProvider>,
    config: SessionConfig,
    cache: Option<Arc<dyn SecondLevelCache>>,
}

impl SessionFactoryBuilder {
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Read the configuration from a JSON document.
    pub fn config_json(self, json: &str) -> Result<Self> {
        Ok(self.config(SessionConfig::from_json(json)?))
    }

    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn SecondLevelCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validate the configuration and build the factory.
    pub fn build(self) -> Result<SessionFactory> {
        self.config.validate()?;
        tracing::info!(
            entities = self.metadata.entity_names().len(),
            cache = self.cache.is_some(),
            "Session factory ready"
        );
        Ok(SessionFactory {
            metadata: self.metadata,
            config: self.config,
            cache: self.cache,
        })
    }
}
