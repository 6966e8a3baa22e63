pub mod blob;
pub mod client;
pub mod metadata;
pub mod model;

use crate::codec;
use crate::error::{Error, Result};
use crate::time::DateTime;
use metadata::MetadataStore;
use model::{ArchiveEntry, Document, EntryMap, NewResource, ResourceEntry, ResourceMetadata};
use opendal::Operator;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// The pseudo resource-file name that always resolves to the latest version
/// of an archive entry.
pub const CURRENT: &str = "current";

pub type ResourceFactory = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Computes the on-store path of a resource file from the data path, the
/// resource group (if any) and the file name.
pub type ResourcePathFactory = Box<dyn Fn(&str, Option<&str>, &str) -> String + Send + Sync>;

/// Hook invoked after the data blob has been uploaded but before the
/// metadata document is committed.
pub type PostPush = fn(&mut ResourceMetadata);

pub struct StorageOptions {
    pub resource_base_path: Option<String>,
    pub group_resource: bool,
    pub archive: bool,
    pub metaname: Option<String>,
    pub resource_id_factory: Option<ResourceFactory>,
    pub resource_file_factory: Option<ResourceFactory>,
    pub resource_path_factory: Option<ResourcePathFactory>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            resource_base_path: None,
            group_resource: false,
            archive: true,
            metaname: None,
            resource_id_factory: None,
            resource_file_factory: None,
            resource_path_factory: None,
        }
    }
}

/// A named, versioned resource in the object store, indexed by a JSON
/// metadata document. The document is the single source of truth for
/// enumeration; blobs are only ever addressed through it.
pub struct ResourceStorage {
    resource_name: String,
    data_path: String,
    group_resource: bool,
    archive: bool,
    operator: Operator,
    metadata: MetadataStore<Value>,
    id_factory: Option<ResourceFactory>,
    file_factory: Option<ResourceFactory>,
    path_factory: Option<ResourcePathFactory>,
}

impl ResourceStorage {
    pub fn new(resource_name: &str, connection_string: &str, container: &str, options: StorageOptions) -> Result<Self> {
        let operator = blob::operator(connection_string, container)?;
        Ok(Self::with_operator(resource_name, operator, options))
    }

    pub fn with_operator(resource_name: &str, operator: Operator, options: StorageOptions) -> Self {
        let base_path = options
            .resource_base_path
            .unwrap_or_else(|| resource_name.to_owned());
        let data_path = match base_path.is_empty() {
            true => String::from("data"),
            false => format!("{base_path}/data"),
        };
        let metaname = options.metaname.as_deref().unwrap_or("metadata");
        let metadata = MetadataStore::new(
            operator.clone(),
            (!base_path.is_empty()).then_some(base_path.as_str()),
            metaname,
            true,
        );
        Self {
            resource_name: resource_name.to_owned(),
            data_path,
            group_resource: options.group_resource,
            archive: options.archive,
            operator,
            metadata,
            id_factory: options.resource_id_factory,
            file_factory: options.resource_file_factory,
            path_factory: options.resource_path_factory,
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn resource_path(&self, group: Option<&str>, file: &str) -> String {
        match (&self.path_factory, group) {
            (Some(factory), group) => factory(&self.data_path, group, file),
            (None, Some(group)) => format!("{}/{group}/{file}", self.data_path),
            (None, None) => format!("{}/{file}", self.data_path),
        }
    }

    fn qualified(&self, resource_id: &str, group: Option<&str>) -> String {
        match group {
            Some(group) => format!("{}.{group}.{resource_id}", self.resource_name),
            None => format!("{}.{resource_id}", self.resource_name),
        }
    }

    /// The parsed metadata document. A document that has never been written
    /// parses as empty.
    pub async fn document(&mut self) -> Result<Document> {
        match self.metadata.read().await? {
            Some(value) => Ok(Document::from_value(self.group_resource, value)?),
            None => Ok(Document::empty(self.group_resource)),
        }
    }

    async fn write_document(&mut self, document: &Document) -> Result<()> {
        self.metadata.write(&document.to_value()?).await
    }

    /// All entries of a group. Errors if the group has never been published.
    pub async fn group_metadata(&mut self, group: &str) -> Result<EntryMap> {
        let document = self.document().await?;
        document
            .group(group)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound(format!("{}.{group}", self.resource_name)))
    }

    /// Looks up the metadata of one published version. `resource_file`
    /// selects among archived versions; [`CURRENT`] always matches the
    /// latest one.
    pub async fn find_metadata(
        &mut self,
        resource_id: &str,
        group: Option<&str>,
        resource_file: &str,
    ) -> Result<Option<ResourceMetadata>> {
        if self.group_resource && group.is_none() {
            return Err(Error::MissingResourceGroup(self.resource_name.clone()));
        }

        let document = self.document().await?;
        let entry = match document.entry(resource_id, group) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        match entry {
            ResourceEntry::Archive(entry) => {
                let current = match &entry.current {
                    Some(current) => current,
                    None => return Ok(None),
                };
                if resource_file == CURRENT || current.resource_file == resource_file {
                    Ok(Some(current.clone()))
                } else {
                    Ok(entry
                        .histories
                        .iter()
                        .find(|metadata| metadata.resource_file == resource_file)
                        .cloned())
                }
            }
            ResourceEntry::Single(metadata) => Ok(Some(metadata.clone())),
        }
    }

    pub async fn require_metadata(
        &mut self,
        resource_id: &str,
        group: Option<&str>,
        resource_file: &str,
    ) -> Result<ResourceMetadata> {
        self.find_metadata(resource_id, group, resource_file)
            .await?
            .ok_or_else(|| Error::ResourceNotFound(self.qualified(resource_id, group)))
    }

    pub async fn is_exist(&mut self, resource_id: &str, group: Option<&str>) -> Result<bool> {
        Ok(self.find_metadata(resource_id, group, CURRENT).await?.is_some())
    }

    /// Uploads one version of a resource and records it in the metadata
    /// document. The blob is written before the document, so every recorded
    /// entry points at an existing blob; a crash in between leaves an orphan
    /// blob that the next push with the same path overwrites.
    pub async fn push_resource(
        &mut self,
        data: Vec<u8>,
        new: NewResource,
        post_push: Option<PostPush>,
    ) -> Result<Document> {
        if self.group_resource && new.resource_group.is_none() {
            return Err(Error::MissingResourceGroup(self.resource_name.clone()));
        }

        let resource_group = new.resource_group;
        let resource_id = new.resource_id.unwrap_or_else(|| match &self.id_factory {
            Some(factory) => factory(&self.resource_name),
            None => self.resource_name.clone(),
        });
        let resource_file = new.resource_file.unwrap_or_else(|| match &self.file_factory {
            Some(factory) => factory(&resource_id),
            None => default_resource_file(&resource_id),
        });
        let resource_path = self.resource_path(resource_group.as_deref(), &resource_file);

        let mut metadata = ResourceMetadata {
            resource_id: resource_id.clone(),
            resource_file,
            resource_path: resource_path.clone(),
            publish_date: DateTime::now(),
            resource_group: resource_group.clone(),
            file_md5: new.file_md5,
            features: new.features,
            layer: new.layer,
            extra: new.extra,
        };

        let mut document = self.document().await?;
        let previous = document.entries_mut(resource_group.as_deref()).remove(&resource_id);

        blob::write(&self.operator, &resource_path, data).await?;

        if let Some(post_push) = post_push {
            post_push(&mut metadata);
        }

        let entry = match self.archive {
            true => {
                let mut entry = match previous {
                    Some(ResourceEntry::Archive(entry)) => entry,
                    _ => ArchiveEntry {
                        current: None,
                        histories: Vec::new(),
                    },
                };
                if let Some(displaced) = entry.current.take() {
                    entry.histories.insert(0, displaced);
                }
                entry.current = Some(metadata);
                ResourceEntry::Archive(entry)
            }
            false => {
                // An update merges over whatever the previous push recorded
                if let Some(ResourceEntry::Single(previous)) = previous {
                    metadata.file_md5 = metadata.file_md5.or(previous.file_md5);
                    metadata.features = metadata.features.or(previous.features);
                    metadata.layer = metadata.layer.or(previous.layer);
                    let mut merged = previous.extra;
                    for (key, value) in std::mem::take(&mut metadata.extra) {
                        merged.insert(key, value);
                    }
                    metadata.extra = merged;
                }
                ResourceEntry::Single(metadata)
            }
        };
        document
            .entries_mut(resource_group.as_deref())
            .insert(resource_id, entry);

        self.write_document(&document).await?;
        Ok(document)
    }

    pub async fn push_json<T: Serialize>(
        &mut self,
        value: &T,
        new: NewResource,
        post_push: Option<PostPush>,
    ) -> Result<Document> {
        self.push_resource(codec::to_json(value)?, new, post_push).await
    }

    pub async fn push_file(&mut self, path: &Path, new: NewResource, post_push: Option<PostPush>) -> Result<Document> {
        let data = tokio::fs::read(path).await?;
        self.push_resource(data, new, post_push).await
    }

    /// Downloads one version to a local file and returns its metadata with
    /// the path written. Without a filename the file lands in the system
    /// temp directory under its on-store name.
    pub async fn download(
        &mut self,
        resource_id: &str,
        filename: Option<&Path>,
        overwrite: bool,
        group: Option<&str>,
        resource_file: &str,
    ) -> Result<(ResourceMetadata, PathBuf)> {
        let metadata = self.require_metadata(resource_id, group, resource_file).await?;
        let target = match filename {
            Some(path) => path.to_path_buf(),
            None => std::env::temp_dir().join(&metadata.resource_file),
        };
        blob::download(&self.operator, &metadata.resource_path, &target, overwrite).await?;
        Ok((metadata, target))
    }

    /// Downloads the latest version of every entry in a group into `folder`.
    pub async fn download_group(
        &mut self,
        group: &str,
        folder: Option<&Path>,
        overwrite: bool,
    ) -> Result<(EntryMap, PathBuf)> {
        if !self.group_resource {
            return Err(Error::NotGroupResource(self.resource_name.clone()));
        }

        let folder = match folder {
            Some(folder) => {
                if folder.exists() {
                    if !folder.is_dir() {
                        return Err(Error::StdIo(std::io::Error::new(
                            std::io::ErrorKind::NotADirectory,
                            format!("The path {} is not a folder", folder.display()),
                        )));
                    }
                    if !overwrite {
                        return Err(Error::PathAlreadyExists(folder.to_path_buf()));
                    }
                    std::fs::remove_dir_all(folder)?;
                }
                folder.to_path_buf()
            }
            None => std::env::temp_dir().join(group),
        };
        std::fs::create_dir_all(&folder)?;

        let entries = self.group_metadata(group).await?;
        for entry in entries.values() {
            if let Some(metadata) = entry.latest() {
                let target = folder.join(&metadata.resource_file);
                blob::download(&self.operator, &metadata.resource_path, &target, true).await?;
            }
        }
        Ok((entries, folder))
    }

    /// Deletes one resource, or every resource in a group when only the
    /// group is given. Returns the removed entries, or `None` if nothing
    /// matched. A blob that fails to delete is logged and skipped; the
    /// metadata document is rewritten after each removed entry.
    pub async fn delete_resource(
        &mut self,
        resource_id: Option<&str>,
        group: Option<&str>,
    ) -> Result<Option<EntryMap>> {
        if self.group_resource {
            if resource_id.is_none() && group.is_none() {
                return Err(Error::MissingDeleteTarget);
            }
        } else if resource_id.is_none() {
            return Err(Error::MissingDeleteTarget);
        }

        let mut document = self.document().await?;
        let targets: EntryMap = match resource_id {
            Some(resource_id) => match document.entry(resource_id, group) {
                Some(entry) => [(resource_id.to_owned(), entry.clone())].into(),
                None => {
                    debug!("resource {} does not exist", self.qualified(resource_id, group));
                    return Ok(None);
                }
            },
            None => {
                let group = group.unwrap_or_default();
                match document.group(group) {
                    Some(entries) => entries.clone(),
                    None => {
                        debug!("resource group {}.{group} does not exist", self.resource_name);
                        return Ok(None);
                    }
                }
            }
        };

        for (resource_id, entry) in &targets {
            debug!("deleting resource {}", self.qualified(resource_id, group));
            for path in entry.blob_paths() {
                if let Err(err) = self.operator.delete(path).await {
                    error!("failed to delete blob {path}: {err}");
                }
            }
            document.remove_entry(resource_id, group);
            self.write_document(&document).await?;
        }
        Ok(Some(targets))
    }
}

fn default_resource_file(resource_id: &str) -> String {
    format!("{resource_id}_{}.json", DateTime::now().format("%Y-%m-%d-%H-%M-%S"))
}
