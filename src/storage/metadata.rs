use crate::codec;
use crate::error::Result;
use crate::storage::blob::Blob;
use opendal::Operator;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// A JSON document stored as a sidecar blob, with an optional in-memory
/// cache of the last read. Updates replace the whole document.
pub struct MetadataStore<T> {
    blob: Blob,
    cached: bool,
    cache: Option<T>,
}

impl<T: Serialize + DeserializeOwned + Clone> MetadataStore<T> {
    pub fn new(operator: Operator, base_path: Option<&str>, metaname: &str, cached: bool) -> Self {
        let filename = format!("{metaname}.json");
        let metadata_path = match base_path {
            Some(base) => format!("{base}/{filename}"),
            None => filename,
        };
        debug!("metadata document at {metadata_path}");
        Self {
            blob: Blob::new(operator, metadata_path),
            cached,
            cache: None,
        }
    }

    /// Reads and decodes the document, or `None` if it has never been written.
    pub async fn read(&mut self) -> Result<Option<T>> {
        if self.cached {
            if let Some(document) = &self.cache {
                return Ok(Some(document.clone()));
            }
        }

        let document = match self.blob.read().await? {
            Some(bytes) => Some(codec::from_json(&bytes)?),
            None => None,
        };
        if self.cached {
            self.cache = document.clone();
        }
        Ok(document)
    }

    /// Atomically replaces the document with a full overwrite.
    pub async fn write(&mut self, document: &T) -> Result<()> {
        self.blob.write(codec::to_json(document)?).await?;
        if self.cached {
            self.cache = Some(document.clone());
        }
        Ok(())
    }

    pub async fn delete(&mut self) -> Result<()> {
        self.blob.delete().await?;
        self.cache = None;
        Ok(())
    }
}
