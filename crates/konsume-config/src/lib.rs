//! Configuration model for konsume.
//!
//! A single YAML or JSON file describes broker providers, the queues to
//! consume, the HTTP routes and database routes each message fans out to,
//! and the optional metrics endpoint. The loader (see [`loader`]) picks the
//! parser from the file extension; validation applies the defaulting rules
//! and cross-references (queue -> provider, database route -> database).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use konsume_common::logging::LogFormat;

mod loader;

pub use loader::{load, load_from_file};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(String),

    #[error("failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to unmarshal configuration file: {0}")]
    Parse(String),

    #[error("format not supported: {0}")]
    FormatNotSupported(String),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Broker kinds konsume can consume from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Rabbitmq,
    Kafka,
    Activemq,
}

/// Sink kinds konsume can write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Postgresql,
    Mongodb,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Postgresql => "postgresql",
            SinkKind::Mongodb => "mongodb",
        }
    }
}

/// Inter-attempt delay policy.
///
/// `Expo` is linear (`interval * attempt`), not exponential; the tag is kept
/// for config compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    #[default]
    Fixed,
    Expo,
    Random,
}

/// HTTP route flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum RouteType {
    #[default]
    #[serde(rename = "REST")]
    Rest,
    #[serde(rename = "graphql")]
    Graphql,
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub providers: Vec<ProviderConfig>,

    pub queues: Vec<QueueConfig>,

    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,

    #[serde(default)]
    pub metrics: Option<MetricsConfig>,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub log: LogFormat,
}

/// One broker endpoint. Exactly one of the per-kind settings blocks must be
/// present, matching `kind`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ProviderKind,

    /// Connection attempts beyond the first, with a fixed 5s backoff.
    #[serde(default)]
    pub retry: u32,

    #[serde(rename = "amqp-config", default)]
    pub amqp: Option<AmqpSettings>,

    #[serde(rename = "kafka-config", default)]
    pub kafka: Option<KafkaSettings>,

    #[serde(rename = "stomp-config", default)]
    pub stomp: Option<StompSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AmqpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub topic: String,
    pub group: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StompSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// One inbound stream bound to a provider.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub name: String,

    pub provider: String,

    #[serde(default)]
    pub retry: Option<RetryConfig>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(rename = "database-routes", alias = "database_routes", default)]
    pub database_routes: Vec<DatabaseRouteConfig>,
}

/// Per-queue retry policy for HTTP routes.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(rename = "max-retries", alias = "max_retries", default)]
    pub max_retries: u32,

    #[serde(default)]
    pub strategy: RetryStrategy,

    #[serde(default, with = "humantime_serde::option")]
    pub interval: Option<Duration>,

    /// Status codes at or above this value trigger a retry.
    #[serde(rename = "threshold-status", alias = "threshold_status", default)]
    pub threshold_status: u16,
}

/// An HTTP-side outbound effect.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub name: String,

    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(rename = "type", default)]
    pub kind: RouteType,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Body template. For REST routes an arbitrary JSON-like tree whose
    /// string leaves may contain `{{field}}` placeholders; for GraphQL
    /// routes it must hold an operation string under `query` or `mutation`.
    #[serde(default)]
    pub body: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub query: BTreeMap<String, String>,

    #[serde(default = "default_route_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// A database-side outbound effect.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseRouteConfig {
    pub name: String,

    /// Name of a configured database.
    pub provider: String,

    #[serde(default)]
    pub table: Option<String>,

    #[serde(default)]
    pub collection: Option<String>,

    /// Source message field -> destination column/field.
    pub mapping: BTreeMap<String, String>,
}

impl DatabaseRouteConfig {
    /// Table for relational sinks, collection for document sinks; validation
    /// guarantees exactly one is set.
    pub fn target(&self) -> &str {
        self.table
            .as_deref()
            .or(self.collection.as_deref())
            .unwrap_or_default()
    }
}

/// A persistent store target.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: SinkKind,

    #[serde(rename = "connection-string", alias = "connection_string")]
    pub connection_string: String,

    /// Connection attempts beyond the first, with a fixed 5s backoff.
    #[serde(default)]
    pub retry: u32,

    /// Database name, required for MongoDB.
    #[serde(default)]
    pub database: String,
}

/// Prometheus endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    #[serde(default = "default_metrics_path")]
    pub path: String,

    /// Status codes at or above this value count as failed requests.
    #[serde(rename = "threshold-status", alias = "threshold_status", default)]
    pub threshold_status: u16,
}

pub const DEFAULT_THRESHOLD_STATUS: u16 = 500;
pub const DEFAULT_ROUTE_TIMEOUT: Duration = Duration::from_secs(10);

fn default_method() -> String {
    "POST".to_string()
}

fn default_route_timeout() -> Duration {
    DEFAULT_ROUTE_TIMEOUT
}

fn default_metrics_port() -> u16 {
    8080
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Config {
    /// Validate the whole configuration, applying defaults in place.
    pub fn validate(&mut self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(ConfigError::Validation("no providers defined".into()));
        }
        if self.queues.is_empty() {
            return Err(ConfigError::Validation("no queues defined".into()));
        }

        for provider in &self.providers {
            provider.validate()?;
        }

        for database in &self.databases {
            database.validate()?;
        }

        let provider_names: Vec<&str> =
            self.providers.iter().map(|p| p.name.as_str()).collect();
        let database_names: Vec<&str> =
            self.databases.iter().map(|d| d.name.as_str()).collect();

        for queue in &mut self.queues {
            queue.validate(&provider_names, &database_names)?;
        }

        if let Some(metrics) = &mut self.metrics {
            metrics.validate()?;
        }

        debug!("configuration validated");
        Ok(())
    }
}

impl ProviderConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation("provider name not defined".into()));
        }

        let (expected, present) = match self.kind {
            ProviderKind::Rabbitmq => ("amqp-config", self.amqp.is_some()),
            ProviderKind::Kafka => ("kafka-config", self.kafka.is_some()),
            ProviderKind::Activemq => ("stomp-config", self.stomp.is_some()),
        };
        if !present {
            return Err(ConfigError::Validation(format!(
                "provider {}: {} not defined",
                self.name, expected
            )));
        }

        let blocks =
            self.amqp.is_some() as u8 + self.kafka.is_some() as u8 + self.stomp.is_some() as u8;
        if blocks != 1 {
            return Err(ConfigError::Validation(format!(
                "provider {}: exactly one of amqp-config, kafka-config, stomp-config must be set",
                self.name
            )));
        }

        if let Some(amqp) = &self.amqp {
            if amqp.host.is_empty() {
                return Err(ConfigError::Validation("amqp host not defined".into()));
            }
            if amqp.port == 0 {
                return Err(ConfigError::Validation("amqp port not defined".into()));
            }
            if amqp.username.is_empty() {
                return Err(ConfigError::Validation("amqp username not defined".into()));
            }
            if amqp.password.is_empty() {
                return Err(ConfigError::Validation("amqp password not defined".into()));
            }
        }

        if let Some(kafka) = &self.kafka {
            if kafka.brokers.is_empty() {
                return Err(ConfigError::Validation("kafka brokers not defined".into()));
            }
            if kafka.topic.is_empty() {
                return Err(ConfigError::Validation("kafka topic not defined".into()));
            }
            if kafka.group.is_empty() {
                return Err(ConfigError::Validation("kafka group not defined".into()));
            }
        }

        if let Some(stomp) = &self.stomp {
            if stomp.host.is_empty() {
                return Err(ConfigError::Validation("stomp host not defined".into()));
            }
            if stomp.port == 0 {
                return Err(ConfigError::Validation("stomp port not defined".into()));
            }
            if stomp.username.is_empty() {
                return Err(ConfigError::Validation("stomp username not defined".into()));
            }
            if stomp.password.is_empty() {
                return Err(ConfigError::Validation("stomp password not defined".into()));
            }
        }

        Ok(())
    }
}

impl QueueConfig {
    fn validate(&mut self, providers: &[&str], databases: &[&str]) -> Result<()> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation("queue name not defined".into()));
        }
        if self.provider.is_empty() {
            return Err(ConfigError::Validation("queue provider not defined".into()));
        }
        if !providers.contains(&self.provider.as_str()) {
            return Err(ConfigError::Validation(format!(
                "queue {}: provider {} does not exist in providers list",
                self.name, self.provider
            )));
        }

        if let Some(retry) = &mut self.retry {
            if retry.enabled {
                if retry.max_retries == 0 {
                    return Err(ConfigError::Validation("max retries not defined".into()));
                }
                match retry.interval {
                    Some(interval) if !interval.is_zero() => {}
                    _ => return Err(ConfigError::Validation("interval not defined".into())),
                }
                if retry.threshold_status == 0 {
                    debug!(queue = %self.name, "threshold status not defined, using default 500");
                    retry.threshold_status = DEFAULT_THRESHOLD_STATUS;
                }
            }
        }

        if self.routes.is_empty() && self.database_routes.is_empty() {
            warn!(
                queue = %self.name,
                "queue has neither routes nor database-routes; messages will only be counted"
            );
        }

        for route in &mut self.routes {
            route.validate()?;
        }

        for db_route in &self.database_routes {
            db_route.validate(databases)?;
        }

        Ok(())
    }
}

impl RouteConfig {
    fn validate(&mut self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation("route name not defined".into()));
        }
        if self.url.is_empty() {
            return Err(ConfigError::Validation("url not defined".into()));
        }

        if self.kind == RouteType::Graphql {
            if self.body.is_empty() {
                return Err(ConfigError::Validation(
                    "when using graphql type, body must be defined".into(),
                ));
            }
            let query = self.body.get("query");
            let mutation = self.body.get("mutation");
            if query.is_none() && mutation.is_none() {
                return Err(ConfigError::Validation(
                    "when using graphql type, body must contain query or mutation".into(),
                ));
            }
            let has_string_operation = query.map(|v| v.is_string()).unwrap_or(false)
                || mutation.map(|v| v.is_string()).unwrap_or(false);
            if !has_string_operation {
                return Err(ConfigError::Validation(
                    "when using graphql type, body must contain string for query or mutation"
                        .into(),
                ));
            }
            if self.method != "POST" {
                debug!(route = %self.name, "graphql route method is not POST, setting it to POST");
                self.method = "POST".to_string();
            }
        }

        Ok(())
    }
}

impl DatabaseRouteConfig {
    fn validate(&self, databases: &[&str]) -> Result<()> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation(
                "database route name not defined".into(),
            ));
        }
        if !databases.contains(&self.provider.as_str()) {
            return Err(ConfigError::Validation(format!(
                "database route {}: provider {} does not exist in databases list",
                self.name, self.provider
            )));
        }
        match (&self.table, &self.collection) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(ConfigError::Validation(format!(
                    "database route {}: exactly one of table or collection must be set",
                    self.name
                )));
            }
            _ => {}
        }
        if self.mapping.is_empty() {
            return Err(ConfigError::Validation(format!(
                "database route {}: mapping not defined",
                self.name
            )));
        }
        Ok(())
    }
}

impl DatabaseConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation("database name not defined".into()));
        }
        if self.connection_string.is_empty() {
            return Err(ConfigError::Validation(
                "database connection string not defined".into(),
            ));
        }
        if self.kind == SinkKind::Mongodb && self.database.is_empty() {
            return Err(ConfigError::Validation(
                "database database not defined".into(),
            ));
        }
        Ok(())
    }
}

impl MetricsConfig {
    fn validate(&mut self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.threshold_status == 0 {
            debug!("no threshold status defined for metrics endpoint, using default 500");
            self.threshold_status = DEFAULT_THRESHOLD_STATUS;
        }
        if self.path.is_empty() {
            self.path = default_metrics_path();
        }
        if !self.path.starts_with('/') {
            self.path = format!("/{}", self.path);
        }
        Ok(())
    }
}
