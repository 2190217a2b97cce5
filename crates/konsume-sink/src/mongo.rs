//! MongoDB sink driver.
//!
//! Renames record fields per the route mapping before inserting; fields the
//! mapping does not cover pass through under their original name, unlike the
//! relational driver which skips them.

use std::collections::BTreeMap;
use std::time::Duration;

use mongodb::bson::{doc, Document};
use mongodb::{Client, Database};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{Result, Sink, SinkError};
use async_trait::async_trait;
use konsume_common::MessageData;
use konsume_config::DatabaseRouteConfig;

const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct MongoSink {
    client: RwLock<Option<Client>>,
    database: RwLock<Option<Database>>,
}

impl MongoSink {
    pub fn new() -> Self {
        Self {
            client: RwLock::new(None),
            database: RwLock::new(None),
        }
    }
}

impl Default for MongoSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply the field mapping: mapped fields are renamed, unmapped fields keep
/// their original name.
fn remap(record: &MessageData, mapping: &BTreeMap<String, String>) -> MessageData {
    let mut transformed = MessageData::new();
    for (field, value) in record {
        let key = mapping.get(field).unwrap_or(field);
        transformed.insert(key.clone(), value.clone());
    }
    transformed
}

#[async_trait]
impl Sink for MongoSink {
    async fn connect(&self, connection_string: &str, database: &str) -> Result<()> {
        info!("connecting to MongoDB");
        let client = Client::with_uri_str(connection_string)
            .await
            .map_err(|e| SinkError::Connect(e.to_string()))?;
        let db = client.database(database);

        tokio::time::timeout(Duration::from_secs(10), db.run_command(doc! {"ping": 1}))
            .await
            .map_err(|_| SinkError::Connect("ping timed out".into()))?
            .map_err(|e| SinkError::Connect(e.to_string()))?;

        *self.client.write().await = Some(client);
        *self.database.write().await = Some(db);
        info!("connected to MongoDB");
        Ok(())
    }

    async fn insert(&self, record: &MessageData, route: &DatabaseRouteConfig) -> Result<()> {
        let db = self
            .database
            .read()
            .await
            .clone()
            .ok_or(SinkError::NotConnected)?;

        let document = mongodb::bson::to_document(&remap(record, &route.mapping))
            .map_err(|e| SinkError::Insert(e.to_string()))?;
        let collection = db.collection::<Document>(route.target());

        tokio::time::timeout(OPERATION_TIMEOUT, collection.insert_one(document))
            .await
            .map_err(|_| SinkError::Insert("insert timed out".into()))?
            .map_err(|e| {
                SinkError::Insert(format!(
                    "error inserting into collection {}: {e}",
                    route.target()
                ))
            })?;

        debug!(collection = %route.target(), "inserted document");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.database.write().await.take();
        if let Some(client) = self.client.write().await.take() {
            info!("closing MongoDB connection");
            client.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remap_renames_mapped_and_keeps_unmapped() {
        let record = json!({
            "car_brand": "toyota",
            "car_year": 2021,
            "vin": "abc123"
        });
        let record = record.as_object().unwrap().clone();
        let mapping: BTreeMap<String, String> = [
            ("car_brand".to_string(), "brand".to_string()),
            ("car_year".to_string(), "year".to_string()),
        ]
        .into();

        let transformed = remap(&record, &mapping);
        assert_eq!(transformed.get("brand"), Some(&json!("toyota")));
        assert_eq!(transformed.get("year"), Some(&json!(2021)));
        // Unmapped fields pass through under their original name.
        assert_eq!(transformed.get("vin"), Some(&json!("abc123")));
        assert!(!transformed.contains_key("car_brand"));
    }
}
