//! Database sink contract and drivers.
//!
//! Drivers are resolved from a static factory table keyed by the kind tag
//! from the config (`postgresql`, `mongodb`); unknown tags produce an
//! "unsupported kind" error. Each driver holds one live connection for the
//! process lifetime: connected once at startup, closed once at shutdown.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use konsume_common::MessageData;
use konsume_config::DatabaseRouteConfig;

pub mod mongo;
pub mod postgres;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("unsupported database kind: {0}")]
    UnsupportedKind(String),

    #[error("connection error: {0}")]
    Connect(String),

    #[error("insert error: {0}")]
    Insert(String),

    #[error("close error: {0}")]
    Close(String),

    #[error("not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// Capability set every sink driver provides.
#[async_trait]
pub trait Sink: Send + Sync + std::fmt::Debug {
    async fn connect(&self, connection_string: &str, database: &str) -> Result<()>;

    /// Write one record according to the route's field mapping.
    async fn insert(&self, record: &MessageData, route: &DatabaseRouteConfig) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Resolve a driver by kind tag.
pub fn create_sink(kind: &str) -> Result<Arc<dyn Sink>> {
    match kind {
        "postgresql" => Ok(Arc::new(postgres::PostgresSink::new())),
        "mongodb" => Ok(Arc::new(mongo::MongoSink::new())),
        other => Err(SinkError::UnsupportedKind(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_kinds() {
        assert!(create_sink("postgresql").is_ok());
        assert!(create_sink("mongodb").is_ok());
    }

    #[test]
    fn rejects_unknown_kind() {
        match create_sink("sqlite") {
            Err(SinkError::UnsupportedKind(kind)) => assert_eq!(kind, "sqlite"),
            other => panic!("expected unsupported kind error, got {other:?}"),
        }
    }
}
