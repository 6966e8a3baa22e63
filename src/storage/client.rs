use crate::codec;
use crate::error::{Error, Result};
use crate::storage::blob::{self, Blob};
use crate::storage::metadata::MetadataStore;
use crate::storage::model::{Document, ResourceMetadata};
use crate::time::DateTime;
use opendal::Operator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// What a consumer last processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerRecord {
    pub resource_id: String,
    pub publish_date: DateTime,
    pub consume_date: DateTime,
}

/// Where a consumer stands relative to the published resource.
#[derive(Debug, Clone)]
pub struct ConsumerStatus {
    pub up_to_date: bool,
    pub latest: Option<ResourceMetadata>,
    pub consumed: Option<ConsumerRecord>,
}

/// Tracks one client's consumption of a flat resource. The client's own
/// sidecar lives under `<base>/clients/<client_id>.json` next to the
/// resource's metadata document.
pub struct ResourceConsumer {
    resource_name: String,
    operator: Operator,
    client_store: MetadataStore<ConsumerRecord>,
    resource_store: MetadataStore<Value>,
}

impl ResourceConsumer {
    pub fn new(resource_name: &str, connection_string: &str, container: &str, client_id: &str) -> Result<Self> {
        let operator = blob::operator(connection_string, container)?;
        Ok(Self::with_operator(resource_name, operator, client_id))
    }

    pub fn with_operator(resource_name: &str, operator: Operator, client_id: &str) -> Self {
        let client_base = format!("{resource_name}/clients");
        let client_store = MetadataStore::new(operator.clone(), Some(&client_base), client_id, true);
        let resource_store = MetadataStore::new(operator.clone(), Some(resource_name), "metadata", false);
        Self {
            resource_name: resource_name.to_owned(),
            operator,
            client_store,
            resource_store,
        }
    }

    async fn latest(&mut self) -> Result<Option<ResourceMetadata>> {
        let document = match self.resource_store.read().await? {
            Some(value) => Document::from_value(false, value)?,
            None => return Ok(None),
        };
        Ok(document
            .entry(&self.resource_name, None)
            .and_then(|entry| entry.latest())
            .cloned())
    }

    /// Compares the client's record against the latest published version.
    /// A client with nothing to consume counts as up to date.
    pub async fn status(&mut self) -> Result<ConsumerStatus> {
        let consumed = self.client_store.read().await?;
        let latest = self.latest().await?;
        let up_to_date = match (&consumed, &latest) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(record), Some(metadata)) => record.resource_id == metadata.resource_id,
        };
        Ok(ConsumerStatus {
            up_to_date,
            latest,
            consumed,
        })
    }

    pub async fn is_behind(&mut self) -> Result<bool> {
        Ok(!self.status().await?.up_to_date)
    }

    /// Feeds the decoded resource to `callback` if the client is behind,
    /// then records the consumption. Returns whether anything was consumed.
    pub async fn consume_json(&mut self, callback: impl FnOnce(Value) -> Result<()>) -> Result<bool> {
        let status = self.status().await?;
        let Some(latest) = status.latest.filter(|_| !status.up_to_date) else {
            return Ok(false);
        };

        let blob = Blob::new(self.operator.clone(), latest.resource_path.clone());
        let bytes = blob
            .read()
            .await?
            .ok_or_else(|| Error::ResourceNotFound(latest.resource_path.clone()))?;
        callback(codec::from_json(&bytes)?)?;

        self.record(latest).await?;
        Ok(true)
    }

    /// Like [`Self::consume_json`], but hands the callback a downloaded
    /// local file. The file is removed again whether or not the callback
    /// succeeds.
    pub async fn consume_file(&mut self, callback: impl FnOnce(&Path) -> Result<()>) -> Result<bool> {
        let status = self.status().await?;
        let Some(latest) = status.latest.filter(|_| !status.up_to_date) else {
            return Ok(false);
        };

        let filename = std::env::temp_dir().join(&latest.resource_file);
        blob::download(&self.operator, &latest.resource_path, &filename, true).await?;
        let outcome = callback(&filename);
        std::fs::remove_file(&filename).ok();
        outcome?;

        self.record(latest).await?;
        Ok(true)
    }

    async fn record(&mut self, latest: ResourceMetadata) -> Result<()> {
        self.client_store
            .write(&ConsumerRecord {
                resource_id: latest.resource_id,
                publish_date: latest.publish_date,
                consume_date: DateTime::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blob::memory_operator;
    use crate::storage::model::NewResource;
    use crate::storage::{ResourceStorage, StorageOptions};
    use serde_json::json;

    async fn publish(operator: &Operator, file: &str) {
        let mut storage = ResourceStorage::with_operator("hosts", operator.clone(), StorageOptions::default());
        storage
            .push_json(
                &json!({"hosts": {}}),
                NewResource {
                    resource_file: Some(file.to_owned()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn untouched_client_with_no_resource_is_current() {
        let mut consumer = ResourceConsumer::with_operator("hosts", memory_operator(), "dashboard");
        let status = consumer.status().await.unwrap();
        assert!(status.up_to_date);
        assert!(status.latest.is_none());
        assert!(status.consumed.is_none());
    }

    #[tokio::test]
    async fn behind_client_consumes_once() {
        let operator = memory_operator();
        publish(&operator, "hosts_2024-05-01.json").await;

        let mut consumer = ResourceConsumer::with_operator("hosts", operator.clone(), "dashboard");
        assert!(consumer.is_behind().await.unwrap());

        let mut seen = None;
        let consumed = consumer
            .consume_json(|value| {
                seen = Some(value);
                Ok(())
            })
            .await
            .unwrap();
        assert!(consumed);
        assert_eq!(seen, Some(json!({"hosts": {}})));

        // Already current, so a second consume is a no-op
        let consumed = consumer.consume_json(|_| panic!("nothing new to consume")).await.unwrap();
        assert!(!consumed);
    }

    #[tokio::test]
    async fn callback_failure_leaves_the_client_behind() {
        let operator = memory_operator();
        publish(&operator, "hosts_2024-05-01.json").await;

        let mut consumer = ResourceConsumer::with_operator("hosts", operator.clone(), "dashboard");
        let result = consumer
            .consume_json(|_| Err(Error::IntegrityFailure(String::from("bad payload"))))
            .await;
        assert!(result.is_err());
        assert!(consumer.is_behind().await.unwrap());
    }
}
