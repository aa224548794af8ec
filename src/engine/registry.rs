//! Connector Registry
//!
//! Ordered catalog of connector prototypes. A DSN is dispatched to the first
//! registered connector whose parser accepts it, so registration rejects any
//! connector whose DSN shape overlaps one already registered.

use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::engine::Connector;
use crate::error::{redact_dsn, Result, SqlGateError};

/// Sample DSN advertised by a registered connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleDsn {
    pub id: &'static str,
    pub name: &'static str,
    pub dsn: &'static str,
}

#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: Vec<Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every connector compiled into this build, in
    /// dispatch order: postgres, mysql, mariadb, sqlserver, sqlite
    ///
    /// # Errors
    /// Only if two built-in connectors overlap, which is a build defect.
    pub fn with_default_connectors() -> Result<Self> {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "postgres")]
        registry.register(Arc::new(crate::engine::postgres::PostgresConnector::new()))?;

        #[cfg(feature = "mysql")]
        {
            registry.register(Arc::new(crate::engine::mysql::MySqlConnector::mysql()))?;
            registry.register(Arc::new(crate::engine::mysql::MySqlConnector::mariadb()))?;
        }

        #[cfg(feature = "sqlserver")]
        registry.register(Arc::new(crate::engine::sqlserver::SqlServerConnector::new()))?;

        #[cfg(feature = "sqlite")]
        registry.register(Arc::new(crate::engine::sqlite::SqliteConnector::default()))?;

        Ok(registry)
    }

    /// Append a connector to the dispatch order
    ///
    /// # Errors
    /// [`SqlGateError::ConfigError`] when the id is taken, or when the new
    /// connector's sample DSN is accepted by a registered parser (or the other
    /// way around).
    pub fn register(&mut self, connector: Arc<dyn Connector>) -> Result<()> {
        let sample = connector.dsn_parser().sample_dsn();

        for existing in &self.connectors {
            if existing.id() == connector.id() {
                return Err(SqlGateError::config_error(format!(
                    "Connector '{}' is already registered",
                    connector.id()
                )));
            }
            if existing.dsn_parser().is_valid_dsn(sample) {
                return Err(SqlGateError::config_error(format!(
                    "Connector '{}' overlaps '{}': sample DSN '{}' is accepted by both",
                    connector.id(),
                    existing.id(),
                    redact_dsn(sample)
                )));
            }
            if connector.dsn_parser().is_valid_dsn(existing.dsn_parser().sample_dsn()) {
                return Err(SqlGateError::config_error(format!(
                    "Connector '{}' overlaps '{}': it accepts the sample DSN of '{}'",
                    connector.id(),
                    existing.id(),
                    existing.id()
                )));
            }
        }

        debug!(connector = connector.id(), "Registered connector");
        self.connectors.push(connector);
        Ok(())
    }

    /// Connector by id
    #[must_use]
    pub fn get_connector(&self, id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.iter().find(|c| c.id() == id).cloned()
    }

    /// First connector, in registration order, whose parser accepts `dsn`
    #[must_use]
    pub fn get_connector_for_dsn(&self, dsn: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.iter().find(|c| c.dsn_parser().is_valid_dsn(dsn)).cloned()
    }

    /// Like [`Self::get_connector_for_dsn`], failing when nothing matches
    ///
    /// # Errors
    /// [`SqlGateError::ConnectorNotFound`] naming the (redacted) DSN.
    pub fn resolve(&self, dsn: &str) -> Result<Arc<dyn Connector>> {
        self.get_connector_for_dsn(dsn).ok_or_else(|| {
            SqlGateError::connector_not_found(format!(
                "No connector accepts DSN '{}' (available: {})",
                redact_dsn(dsn),
                self.get_available_connectors().join(", ")
            ))
        })
    }

    /// Registered connector ids, in dispatch order
    #[must_use]
    pub fn get_available_connectors(&self) -> Vec<&'static str> {
        self.connectors.iter().map(|c| c.id()).collect()
    }

    #[must_use]
    pub fn get_all_sample_dsns(&self) -> Vec<SampleDsn> {
        self.connectors
            .iter()
            .map(|c| SampleDsn { id: c.id(), name: c.name(), dsn: c.dsn_parser().sample_dsn() })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}
