pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub enum Error {
    #[error("Archive deletion is disabled")]
    DeleteDisabled,
    #[error("Export failed: {0}")]
    ExportFailure(String),
    FailedConnection(#[from] diesel::r2d2::PoolError),
    FailedQuery(#[from] diesel::result::Error),
    #[error("Import failed: {0}")]
    ImportFailure(String),
    #[error("Integrity check failed: {0}")]
    IntegrityFailure(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("Invalid database connection string ({0})")]
    InvalidConnectionString(String),
    #[error("Can only operate on logged points seen before today")]
    InvalidDate,
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("{0} is not a valid epoch timestamp")]
    InvalidTimestamp(i64),
    InvalidUrl(#[from] url::ParseError),
    JsonSerialization(#[from] serde_json::Error),
    #[error("No layers found in {0:?}")]
    LayerNotFound(std::path::PathBuf),
    #[error("Please specify the resource id or resource group to delete")]
    MissingDeleteTarget,
    #[error("Missing resource group in metadata for group resource {0}")]
    MissingResourceGroup(String),
    #[error("{0} is not a group resource")]
    NotGroupResource(String),
    #[error("The path {0:?} already exists")]
    PathAlreadyExists(std::path::PathBuf),
    Request(#[from] reqwest::Error),
    #[error("The resource {0} has already been archived")]
    ResourceAlreadyExist(String),
    #[error("The resource {0} not found")]
    ResourceNotFound(String),
    #[error("The scan (id={0}, name={1}) is not completed")]
    ScanIncomplete(i64, String),
    #[error("No scans found in the active scan folder")]
    ScanListEmpty,
    StdIo(#[from] std::io::Error),
    Storage(#[from] opendal::Error),
    #[error("{0} exited with {1}")]
    ToolFailure(&'static str, std::process::ExitStatus),
    #[error("Please don't run continuous archive in working hours")]
    WithinWorkingHours,
}
