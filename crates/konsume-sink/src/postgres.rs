//! PostgreSQL sink driver (sqlx).
//!
//! Builds one parameter-bound INSERT per record from the fields present in
//! both the record and the route mapping, in the record's iteration order.
//! Values are never interpolated into the statement text.

use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{Result, Sink, SinkError};
use async_trait::async_trait;
use konsume_common::MessageData;
use konsume_config::DatabaseRouteConfig;

#[derive(Debug)]
pub struct PostgresSink {
    pool: RwLock<Option<PgPool>>,
}

impl PostgresSink {
    pub fn new() -> Self {
        Self {
            pool: RwLock::new(None),
        }
    }
}

impl Default for PostgresSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the INSERT statement and the values to bind, skipping record fields
/// the mapping does not cover. Returns `None` when no field is mapped.
fn build_insert<'a>(
    table: &str,
    record: &'a MessageData,
    mapping: &BTreeMap<String, String>,
) -> Option<(String, Vec<&'a Value>)> {
    let mut columns = Vec::new();
    let mut placeholders = Vec::new();
    let mut values = Vec::new();

    for (field, value) in record {
        let Some(column) = mapping.get(field) else {
            warn!(field = %field, "no mapping found for field, skipping");
            continue;
        };
        placeholders.push(format!("${}", columns.len() + 1));
        columns.push(column.as_str());
        values.push(value);
    }

    if columns.is_empty() {
        return None;
    }

    let statement = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders.join(", ")
    );
    Some((statement, values))
}

#[async_trait]
impl Sink for PostgresSink {
    async fn connect(&self, connection_string: &str, _database: &str) -> Result<()> {
        info!("connecting to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await
            .map_err(|e| SinkError::Connect(e.to_string()))?;
        *self.pool.write().await = Some(pool);
        info!("connected to PostgreSQL");
        Ok(())
    }

    async fn insert(&self, record: &MessageData, route: &DatabaseRouteConfig) -> Result<()> {
        let pool = self.pool.read().await.clone().ok_or(SinkError::NotConnected)?;

        let Some((statement, values)) = build_insert(route.target(), record, &route.mapping)
        else {
            warn!(table = %route.target(), "no mapped fields in record, nothing to insert");
            return Ok(());
        };

        let mut query = sqlx::query(&statement);
        for value in values {
            query = match value {
                Value::Null => query.bind(Option::<String>::None),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        query.bind(i)
                    } else {
                        query.bind(n.as_f64().unwrap_or_default())
                    }
                }
                Value::String(s) => query.bind(s.clone()),
                // Arrays and nested objects are stored as their JSON text.
                other => query.bind(other.to_string()),
            };
        }

        query
            .execute(&pool)
            .await
            .map_err(|e| SinkError::Insert(e.to_string()))?;

        debug!(table = %route.target(), "inserted row");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(pool) = self.pool.write().await.take() {
            info!("closing PostgreSQL connection");
            pool.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn record(value: serde_json::Value) -> MessageData {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn builds_parameter_bound_insert_in_stable_order() {
        let record = record(json!({
            "car_brand": "toyota",
            "car_model": "corolla",
            "car_year": 2021
        }));
        let mapping = mapping(&[
            ("car_brand", "brand"),
            ("car_model", "model"),
            ("car_year", "year"),
        ]);

        let (statement, values) = build_insert("cars", &record, &mapping).unwrap();
        assert_eq!(
            statement,
            "INSERT INTO cars (brand, model, year) VALUES ($1, $2, $3)"
        );
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], &json!("toyota"));
        assert_eq!(values[2], &json!(2021));
    }

    #[test]
    fn skips_unmapped_fields() {
        let record = record(json!({"car_brand": "t", "extra": true}));
        let mapping = mapping(&[("car_brand", "brand")]);

        let (statement, values) = build_insert("cars", &record, &mapping).unwrap();
        assert_eq!(statement, "INSERT INTO cars (brand) VALUES ($1)");
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn returns_none_when_nothing_is_mapped() {
        let record = record(json!({"a": 1}));
        let mapping = mapping(&[("b", "c")]);
        assert!(build_insert("cars", &record, &mapping).is_none());
    }
}
