use crate::config;
use crate::error::Result;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// The scan API surface the harvester needs. Implemented by
/// [`NessusClient`] against the real server.
#[allow(async_fn_in_trait)]
pub trait ScanApi {
    async fn active_scans(&self) -> Result<ScanList>;
    async fn scan(&self, scan_id: i64) -> Result<ScanDetail>;
    async fn host_scan(&self, scan_id: i64, host_id: i64) -> Result<HostDetail>;
    fn host_report_url(&self, scan_id: i64, host_id: i64) -> String;
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanList {
    pub scans: Option<Vec<Scan>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scan {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub creation_date: i64,
    pub last_modification_date: i64,
}

impl Scan {
    /// Scans stay listed after they finish; only these states are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "aborted")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanDetail {
    pub hosts: Option<Vec<ScanHost>>,
}

/// One host row of a scan's host listing, with its severity tallies.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanHost {
    pub host_id: i64,
    pub hostname: String,
    #[serde(default)]
    pub info: i64,
    #[serde(default)]
    pub low: i64,
    #[serde(default)]
    pub medium: i64,
    #[serde(default)]
    pub high: i64,
    #[serde(default)]
    pub critical: i64,
    #[serde(default)]
    pub severity: i64,
    #[serde(default)]
    pub score: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostDetail {
    /// Free-form host properties; `host-fqdn` is the canonical name when set.
    pub info: Value,
    #[serde(default)]
    pub vulnerabilities: Vec<RawVulnerability>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawVulnerability {
    pub plugin_id: Option<i64>,
    pub plugin_name: Option<String>,
    pub plugin_family: Option<String>,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub severity: i64,
    #[serde(default)]
    pub offline: bool,
}

/// HTTP client for the scan server. The server runs with a self-signed
/// certificate, so TLS verification is off.
pub struct NessusClient {
    client: Client,
    base: String,
    url: String,
}

impl NessusClient {
    pub fn new() -> Result<Self> {
        let api_keys = format!("accessKey={}; secretKey={}", config::nessus_access_key(), config::nessus_secret_key());
        let mut headers = HeaderMap::new();
        headers.insert("X-ApiKeys", HeaderValue::from_str(&api_keys)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/plain"));

        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base: config::nessus_base().to_owned(),
            url: config::nessus_url().to_owned(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.client.get(format!("{}{path}", self.base)).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }
}

impl ScanApi for NessusClient {
    async fn active_scans(&self) -> Result<ScanList> {
        self.get_json("/scans?folder_id=3").await
    }

    async fn scan(&self, scan_id: i64) -> Result<ScanDetail> {
        self.get_json(&format!("/scans/{scan_id}")).await
    }

    async fn host_scan(&self, scan_id: i64, host_id: i64) -> Result<HostDetail> {
        self.get_json(&format!("/scans/{scan_id}/hosts/{host_id}")).await
    }

    fn host_report_url(&self, scan_id: i64, host_id: i64) -> String {
        format!("{}/#/scans/reports/{scan_id}/hosts/{host_id}/vulnerabilities", self.url)
    }
}
