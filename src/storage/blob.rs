use crate::config;
use crate::error::{Error, Result};
use opendal::layers::LoggingLayer;
use opendal::services::Azblob;
use opendal::{ErrorKind, Operator};
use std::path::Path;

/// Builds an object-store operator for a container from an Azure
/// connection string.
pub fn operator(connection_string: &str, container: &str) -> Result<Operator> {
    let builder = Azblob::from_connection_string(connection_string)?.container(container);
    Ok(Operator::new(builder)?.layer(LoggingLayer::default()).finish())
}

/// A single blob at a fixed path inside a container.
pub struct Blob {
    operator: Operator,
    path: String,
}

impl Blob {
    pub fn new(operator: Operator, path: String) -> Self {
        Self { operator, path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads the whole blob. Returns `None` if it doesn't exist.
    pub async fn read(&self) -> Result<Option<Vec<u8>>> {
        match self.operator.read(&self.path).await {
            Ok(buffer) => Ok(Some(buffer.to_vec())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        write(&self.operator, &self.path, data).await
    }

    /// Removes the blob. Deleting a blob that doesn't exist is not an error.
    pub async fn delete(&self) -> Result<()> {
        Ok(self.operator.delete(&self.path).await?)
    }

    /// Streams the blob into a local file. Refuses to replace an existing
    /// file unless `overwrite` is set, and never replaces a directory.
    pub async fn download(&self, filename: &Path, overwrite: bool) -> Result<()> {
        download(&self.operator, &self.path, filename, overwrite).await
    }
}

pub async fn write(operator: &Operator, path: &str, data: Vec<u8>) -> Result<()> {
    let (put_size, _) = config::blob_chunk_sizes();
    let mut write = operator.write_with(path, data);
    if let Some(chunk) = put_size {
        write = write.chunk(chunk);
    }
    write.await?;
    Ok(())
}

pub async fn download(operator: &Operator, path: &str, filename: &Path, overwrite: bool) -> Result<()> {
    if filename.exists() {
        if !filename.is_file() {
            return Err(Error::StdIo(std::io::Error::new(
                std::io::ErrorKind::IsADirectory,
                format!("The path {} is not a file", filename.display()),
            )));
        }
        if !overwrite {
            return Err(Error::PathAlreadyExists(filename.to_path_buf()));
        }
    }

    let (_, get_size) = config::blob_chunk_sizes();
    let mut read = operator.read_with(path);
    if let Some(chunk) = get_size {
        read = read.chunk(chunk);
    }
    let buffer = read.await?;
    tokio::fs::write(filename, buffer.to_bytes()).await?;
    Ok(())
}

#[cfg(test)]
pub fn memory_operator() -> Operator {
    let builder = opendal::services::Memory::default();
    Operator::new(builder).unwrap().finish()
}
