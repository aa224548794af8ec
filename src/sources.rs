//! Source Manager
//!
//! Owns one live connector per configured source. Connectors are obtained
//! from the [`ConnectorRegistry`] by DSN and connected once at startup.

use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::{SourceConfig, TomlConfig};
use crate::engine::registry::ConnectorRegistry;
use crate::engine::Connector;
use crate::error::{Result, SqlGateError};

/// A configured source with its connected connector
#[derive(Clone)]
pub struct ConnectedSource {
    pub config: SourceConfig,
    pub connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for ConnectedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedSource")
            .field("id", &self.config.id)
            .field("connector", &self.connector.id())
            .field("dsn", &self.config.redacted_dsn())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct SourceManager {
    sources: Vec<ConnectedSource>,
}

impl SourceManager {
    /// Connect every configured source, in order
    ///
    /// Fails on the first source that cannot be connected, after
    /// disconnecting the ones already open.
    ///
    /// # Errors
    /// The failing source's error, prefixed with its id.
    #[instrument(skip_all, fields(sources = config.sources.len()))]
    pub async fn connect_all(config: &TomlConfig, registry: &ConnectorRegistry) -> Result<Self> {
        let mut manager = Self::default();

        for source in &config.sources {
            match connect_source(source, registry).await {
                Ok(connector) => {
                    info!(
                        source = %source.id,
                        connector = connector.id(),
                        dsn = %source.redacted_dsn(),
                        "Connected source"
                    );
                    manager.sources.push(ConnectedSource { config: source.clone(), connector });
                }
                Err(e) => {
                    manager.disconnect_all().await;
                    return Err(e.for_source(&source.id));
                }
            }
        }

        Ok(manager)
    }

    /// Manager over already-connected connectors
    #[must_use]
    pub fn from_connected(sources: Vec<ConnectedSource>) -> Self {
        Self { sources }
    }

    /// Source by id, or the only source when `id` is omitted
    ///
    /// # Errors
    /// [`SqlGateError::ConnectorNotFound`] for an unknown id,
    /// [`SqlGateError::InvalidInput`] when `id` is omitted and several sources
    /// are configured.
    pub fn resolve(&self, id: Option<&str>) -> Result<&ConnectedSource> {
        match id {
            Some(id) => self.sources.iter().find(|s| s.config.id == id).ok_or_else(|| {
                SqlGateError::connector_not_found(format!(
                    "Unknown source '{id}' (configured: {})",
                    self.source_ids().join(", ")
                ))
            }),
            None => match self.sources.as_slice() {
                [only] => Ok(only),
                [] => Err(SqlGateError::invalid_input("No sources are configured")),
                _ => Err(SqlGateError::invalid_input(format!(
                    "Several sources are configured, pass 'source' (one of: {})",
                    self.source_ids().join(", ")
                ))),
            },
        }
    }

    /// Connector of a source
    ///
    /// # Errors
    /// See [`Self::resolve`].
    pub fn connector_for(&self, id: Option<&str>) -> Result<Arc<dyn Connector>> {
        self.resolve(id).map(|s| Arc::clone(&s.connector))
    }

    #[must_use]
    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.config.id.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectedSource> {
        self.sources.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Close every session; failures are logged
    pub async fn disconnect_all(&self) {
        for source in &self.sources {
            if let Err(e) = source.connector.disconnect().await {
                warn!(source = %source.config.id, error = %e, "Disconnect failed");
            }
        }
    }
}

async fn connect_source(
    source: &SourceConfig,
    registry: &ConnectorRegistry,
) -> Result<Arc<dyn Connector>> {
    if let Some(ssh) = &source.ssh {
        return Err(SqlGateError::connection_failed(format!(
            "SSH tunnels are not supported (ssh host '{}')",
            ssh.host
        )));
    }

    let dsn = source.dsn()?;
    let prototype = registry.resolve(dsn)?;
    let connector: Arc<dyn Connector> = Arc::from(prototype.new_instance());
    connector.connect(dsn, &source.connect_options()).await?;
    Ok(connector)
}
