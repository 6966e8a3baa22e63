pub mod nessus;

use crate::config;
use crate::error::{Error, Result};
use crate::storage::blob;
use crate::storage::metadata::MetadataStore;
use crate::storage::model::NewResource;
use crate::storage::{CURRENT, ResourceStorage, StorageOptions};
use crate::time::DateTime;
use nessus::{NessusClient, Scan, ScanApi, ScanHost};
use opendal::Operator;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Hostnames under the state web domain publish as `webapps`, everything
/// else as `hosts`.
pub fn host_group(hostname: &str) -> &'static str {
    match hostname.ends_with(".wa.gov.au") {
        true => "webapps",
        false => "hosts",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Vulnerability {
    pub scan_id: i64,
    pub plugin_id: Option<i64>,
    pub plugin_name: Option<String>,
    pub plugin_family: Option<String>,
    pub count: i64,
    pub severity: i64,
    pub offline: bool,
}

/// Aggregated scan findings for one host, possibly merged across scans.
#[derive(Debug, Clone, Serialize)]
pub struct HostResult {
    pub host_id: i64,
    pub info: i64,
    pub low: i64,
    pub medium: i64,
    pub high: i64,
    pub critical: i64,
    pub severity: i64,
    pub score: i64,
    pub host_info: Value,
    pub scan_id: i64,
    pub scan_name: String,
    pub report_url: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub other_scan_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub other_scan_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub other_report_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vulnerabilities: Option<Vec<Vulnerability>>,
}

impl HostResult {
    fn new(scan: &Scan, host: &ScanHost, host_info: Value, report_url: String, vulnerabilities: Vec<Vulnerability>) -> Self {
        Self {
            host_id: host.host_id,
            info: host.info,
            low: host.low,
            medium: host.medium,
            high: host.high,
            critical: host.critical,
            severity: host.severity,
            score: host.score,
            host_info,
            scan_id: scan.id,
            scan_name: scan.name.clone(),
            report_url,
            other_scan_ids: Vec::new(),
            other_scan_names: Vec::new(),
            other_report_urls: Vec::new(),
            vulnerabilities: Some(vulnerabilities),
        }
    }

    /// Folds a later scan of the same host in: extra scan references are
    /// appended, and vulnerabilities not already reported get added with
    /// their severity tallied. Offline findings never contribute.
    fn merge(&mut self, scan: &Scan, report_url: String, vulnerabilities: Vec<Vulnerability>) {
        self.other_scan_ids.push(scan.id);
        self.other_scan_names.push(scan.name.clone());
        self.other_report_urls.push(report_url);

        let Some(existing) = self.vulnerabilities.as_mut() else {
            return;
        };
        for vulnerability in vulnerabilities {
            if vulnerability.offline {
                continue;
            }
            if existing
                .iter()
                .any(|known| known.plugin_id == vulnerability.plugin_id)
            {
                continue;
            }
            match vulnerability.severity {
                0 => self.info += vulnerability.count,
                1 => self.low += vulnerability.count,
                2 => self.medium += vulnerability.count,
                3 => self.high += vulnerability.count,
                4 => self.critical += vulnerability.count,
                _ => (),
            }
            existing.push(vulnerability);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub scan_starttime: DateTime,
    pub scan_endtime: DateTime,
    pub hosts: BTreeMap<String, HostResult>,
}

/// One publishable group of hosts with the scan window derived from the
/// scans that contributed to it.
#[derive(Debug, Clone, Serialize)]
pub struct GroupResult {
    pub scan_starttime: DateTime,
    pub scan_endtime: DateTime,
    pub hosts: BTreeMap<String, HostResult>,
}

pub enum DownloadOutcome {
    Downloaded(ScanResult),
    NoNewScans(DateTime),
}

#[derive(Debug)]
pub enum HarvestOutcome {
    Published(Vec<String>),
    NoNewScans(Option<DateTime>),
}

/// The min `creation_date` / max `last_modification_date` across scans.
fn scan_window<'a>(scans: impl Iterator<Item = &'a Scan>) -> Result<(DateTime, DateTime)> {
    let mut starttime: Option<i64> = None;
    let mut endtime: Option<i64> = None;
    for scan in scans {
        starttime = Some(starttime.map_or(scan.creation_date, |start| start.min(scan.creation_date)));
        endtime = Some(endtime.map_or(scan.last_modification_date, |end| end.max(scan.last_modification_date)));
    }
    let (Some(start), Some(end)) = (starttime, endtime) else {
        return Err(Error::ScanListEmpty);
    };
    Ok((
        DateTime::from_timestamp(start).ok_or(Error::InvalidTimestamp(start))?,
        DateTime::from_timestamp(end).ok_or(Error::InvalidTimestamp(end))?,
    ))
}

/// Assembles the full per-host result across all active scans. Fails unless
/// every scan has reached a terminal state; returns early when nothing has
/// finished since `last_scan_time`.
pub async fn download<A: ScanApi>(
    api: &A,
    scans: &[Scan],
    download_vulnerability_detail: bool,
    last_scan_time: Option<DateTime>,
) -> Result<DownloadOutcome> {
    for scan in scans {
        if !scan.is_terminal() {
            return Err(Error::ScanIncomplete(scan.id, scan.name.clone()));
        }
    }
    let (scan_starttime, scan_endtime) = scan_window(scans.iter())?;

    if let Some(last_scan_time) = last_scan_time {
        if last_scan_time >= scan_endtime {
            return Ok(DownloadOutcome::NoNewScans(last_scan_time));
        }
    }

    let mut hosts: BTreeMap<String, HostResult> = BTreeMap::new();
    for scan in scans {
        let scan_detail = api.scan(scan.id).await?;
        for host in scan_detail.hosts.unwrap_or_default() {
            let detail = api.host_scan(scan.id, host.host_id).await?;
            let hostname = detail
                .info
                .get("host-fqdn")
                .and_then(Value::as_str)
                .filter(|fqdn| !fqdn.is_empty())
                .unwrap_or(&host.hostname)
                .to_owned();
            let report_url = api.host_report_url(scan.id, host.host_id);
            let vulnerabilities: Vec<Vulnerability> = detail
                .vulnerabilities
                .into_iter()
                .map(|raw| Vulnerability {
                    scan_id: scan.id,
                    plugin_id: raw.plugin_id,
                    plugin_name: raw.plugin_name,
                    plugin_family: raw.plugin_family,
                    count: raw.count,
                    severity: raw.severity,
                    offline: raw.offline,
                })
                .collect();

            match hosts.get_mut(&hostname) {
                Some(existing) => {
                    existing.merge(scan, report_url, vulnerabilities);
                    info!(
                        "{hostname} is scanned in multiple scans ({} , {})",
                        existing.scan_name,
                        existing.other_scan_names.join(" , ")
                    );
                }
                None => {
                    hosts.insert(hostname, HostResult::new(scan, &host, detail.info, report_url, vulnerabilities));
                }
            }
        }
    }

    if !download_vulnerability_detail {
        for host in hosts.values_mut() {
            host.vulnerabilities = None;
        }
    }

    Ok(DownloadOutcome::Downloaded(ScanResult {
        scan_starttime,
        scan_endtime,
        hosts,
    }))
}

/// Splits the download result into publish groups by host classification,
/// each with its own scan window.
pub fn group_result(scans: &[Scan], result: ScanResult) -> Result<BTreeMap<String, GroupResult>> {
    let mut group_hosts: BTreeMap<&'static str, BTreeMap<String, HostResult>> = BTreeMap::new();
    let mut group_scan_ids: BTreeMap<&'static str, BTreeSet<i64>> = BTreeMap::new();
    for (hostname, host) in result.hosts {
        let group = host_group(&hostname);
        let scan_ids = group_scan_ids.entry(group).or_default();
        scan_ids.insert(host.scan_id);
        scan_ids.extend(&host.other_scan_ids);
        group_hosts.entry(group).or_default().insert(hostname, host);
    }

    let mut groups = BTreeMap::new();
    for (group, hosts) in group_hosts {
        let scan_ids = &group_scan_ids[group];
        let (scan_starttime, scan_endtime) = scan_window(scans.iter().filter(|scan| scan_ids.contains(&scan.id)))?;
        groups.insert(
            group.to_owned(),
            GroupResult {
                scan_starttime,
                scan_endtime,
                hosts,
            },
        );
    }
    Ok(groups)
}

/// Top-level index document summarizing the latest harvest across groups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_starttime: Option<DateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_endtime: Option<DateTime>,
    #[serde(default)]
    pub harvest_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harvest_starttime: Option<DateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harvest_endtime: Option<DateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harvest_message: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harvest_detail: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub async fn harvest() -> Result<HarvestOutcome> {
    let api = NessusClient::new()?;
    let operator = blob::operator(config::nessus_connection_string(), config::nessus_container())?;
    harvest_with(&api, operator).await
}

/// Runs one harvest against the given API and store. The index metadata is
/// written on every path, success or failure, with the audit block filled in.
pub async fn harvest_with<A: ScanApi>(api: &A, operator: Operator) -> Result<HarvestOutcome> {
    let mut index: MetadataStore<HarvestMetadata> = MetadataStore::new(operator.clone(), None, "metadata", true);
    let previous = index.read().await?;
    let last_scan_time = previous.as_ref().and_then(|metadata| metadata.scan_endtime);

    let mut metadata = previous.unwrap_or_default();
    metadata.harvest_status = String::from("succeed");
    metadata.harvest_starttime = Some(DateTime::now());

    let outcome = run_harvest(api, &operator, last_scan_time, &mut metadata).await;

    metadata.harvest_endtime = Some(DateTime::now());
    if let Err(err) = &outcome {
        metadata.harvest_status = String::from("failed");
        metadata.harvest_message = Some(json!(err.to_string()));
    }
    index.write(&metadata).await?;
    outcome
}

async fn run_harvest<A: ScanApi>(
    api: &A,
    operator: &Operator,
    last_scan_time: Option<DateTime>,
    metadata: &mut HarvestMetadata,
) -> Result<HarvestOutcome> {
    let scans = api.active_scans().await?.scans.unwrap_or_default();
    let result = match download(api, &scans, false, last_scan_time).await? {
        DownloadOutcome::Downloaded(result) => result,
        DownloadOutcome::NoNewScans(since) => {
            metadata.harvest_message = Some(json!(format!("No new scans since {since}")));
            return Ok(HarvestOutcome::NoNewScans(Some(since)));
        }
    };

    let mut published = Vec::new();
    let mut skipped = Map::new();
    for (group_name, group) in group_result(&scans, result)? {
        let mut storage = ResourceStorage::with_operator(&group_name, operator.clone(), StorageOptions::default());

        // Another run may have already covered this window for the group
        if let Some(current) = storage.find_metadata(&group_name, None, CURRENT).await? {
            let published_end = current
                .extra
                .get("scan_endtime")
                .cloned()
                .and_then(|value| serde_json::from_value::<DateTime>(value).ok());
            if published_end.is_some_and(|end| end >= group.scan_endtime) {
                info!("no new scans for resource {group_name}");
                skipped.insert(
                    group_name.clone(),
                    json!(format!("No new scans for resource '{group_name}'")),
                );
                continue;
            }
        }

        let mut extra = Map::new();
        extra.insert(String::from("scan_starttime"), serde_json::to_value(group.scan_starttime)?);
        extra.insert(String::from("scan_endtime"), serde_json::to_value(group.scan_endtime)?);
        let document = storage
            .push_json(
                &group,
                NewResource {
                    extra,
                    ..Default::default()
                },
                None,
            )
            .await?;
        debug!("published scan results for group {group_name}");

        metadata.scan_starttime = Some(match metadata.scan_starttime {
            Some(start) => start.min(group.scan_starttime),
            None => group.scan_starttime,
        });
        metadata.scan_endtime = Some(match metadata.scan_endtime {
            Some(end) => end.max(group.scan_endtime),
            None => group.scan_endtime,
        });
        if let Some(current) = document.entry(&group_name, None).and_then(|entry| entry.latest()) {
            let detail = metadata.harvest_detail.get_or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(detail) = detail {
                detail.insert(group_name.clone(), serde_json::to_value(current)?);
            }
        }
        published.push(group_name);
    }

    if published.is_empty() {
        let message = match last_scan_time {
            Some(since) => format!("No new scans since {since}"),
            None => String::from("No new scans"),
        };
        metadata.harvest_message = Some(json!(message));
        return Ok(HarvestOutcome::NoNewScans(last_scan_time));
    }

    metadata.harvest_message = Some(match skipped.is_empty() {
        true => json!("OK"),
        false => Value::Object(skipped),
    });
    Ok(HarvestOutcome::Published(published))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blob::memory_operator;
    use crate::storage::model::ResourceEntry;
    use nessus::{HostDetail, ScanDetail, ScanList};

    const HOUR: i64 = 3600;
    const SCAN_1_START: i64 = 1_717_200_000;
    const SCAN_2_START: i64 = SCAN_1_START + 2 * HOUR;

    struct FixtureApi {
        scans: Vec<Scan>,
        hosts: BTreeMap<i64, Vec<ScanHost>>,
        details: BTreeMap<(i64, i64), HostDetail>,
    }

    impl ScanApi for FixtureApi {
        async fn active_scans(&self) -> Result<ScanList> {
            Ok(ScanList {
                scans: Some(self.scans.clone()),
            })
        }

        async fn scan(&self, scan_id: i64) -> Result<ScanDetail> {
            Ok(ScanDetail {
                hosts: self.hosts.get(&scan_id).cloned(),
            })
        }

        async fn host_scan(&self, scan_id: i64, host_id: i64) -> Result<HostDetail> {
            Ok(self.details[&(scan_id, host_id)].clone())
        }

        fn host_report_url(&self, scan_id: i64, host_id: i64) -> String {
            format!("https://scanner/#/scans/reports/{scan_id}/hosts/{host_id}/vulnerabilities")
        }
    }

    fn scan(id: i64, name: &str, status: &str, creation: i64) -> Scan {
        Scan {
            id,
            name: name.to_owned(),
            status: status.to_owned(),
            creation_date: creation,
            last_modification_date: creation + HOUR,
        }
    }

    fn host(host_id: i64, hostname: &str, high: i64) -> ScanHost {
        ScanHost {
            host_id,
            hostname: hostname.to_owned(),
            info: 0,
            low: 0,
            medium: 0,
            high,
            critical: 0,
            severity: 3,
            score: 10,
        }
    }

    fn vulnerability(plugin_id: i64, severity: i64, count: i64, offline: bool) -> Value {
        json!({
            "plugin_id": plugin_id,
            "plugin_name": format!("plugin {plugin_id}"),
            "plugin_family": "General",
            "count": count,
            "severity": severity,
            "offline": offline,
        })
    }

    fn detail(fqdn: Option<&str>, vulnerabilities: Vec<Value>) -> HostDetail {
        let info = match fqdn {
            Some(fqdn) => json!({"host-fqdn": fqdn, "operating-system": "Linux"}),
            None => json!({"operating-system": "Linux"}),
        };
        serde_json::from_value(json!({"info": info, "vulnerabilities": vulnerabilities})).unwrap()
    }

    /// Two completed scans; `portal.example.wa.gov.au` appears in both with
    /// one overlapping plugin, one new plugin, and one offline finding.
    fn fixture() -> FixtureApi {
        let scans = vec![
            scan(1, "weekly webapps", "completed", SCAN_1_START),
            scan(2, "weekly infrastructure", "completed", SCAN_2_START),
        ];
        let hosts = BTreeMap::from([
            (1, vec![host(11, "portal", 1), host(12, "internal-db", 0)]),
            (2, vec![host(21, "portal", 1), host(22, "mail.example.com", 2)]),
        ]);
        let details = BTreeMap::from([
            ((1, 11), detail(Some("portal.example.wa.gov.au"), vec![vulnerability(100, 3, 1, false)])),
            ((1, 12), detail(None, vec![vulnerability(101, 2, 1, false)])),
            (
                (2, 21),
                detail(
                    Some("portal.example.wa.gov.au"),
                    vec![
                        vulnerability(100, 3, 1, false),
                        vulnerability(102, 4, 2, false),
                        vulnerability(103, 1, 1, true),
                    ],
                ),
            ),
            ((2, 22), detail(Some("mail.example.com"), vec![vulnerability(104, 0, 3, false)])),
        ]);
        FixtureApi { scans, hosts, details }
    }

    #[tokio::test]
    async fn incomplete_scan_aborts_the_download() {
        let mut api = fixture();
        api.scans[1].status = String::from("running");
        let result = download(&api, &api.scans.clone(), true, None).await;
        assert!(matches!(result, Err(Error::ScanIncomplete(2, _))));
    }

    #[tokio::test]
    async fn duplicate_hosts_merge_across_scans() {
        let api = fixture();
        let DownloadOutcome::Downloaded(result) = download(&api, &api.scans.clone(), true, None).await.unwrap() else {
            panic!("expected a download");
        };

        let portal = &result.hosts["portal.example.wa.gov.au"];
        assert_eq!(portal.scan_id, 1);
        assert_eq!(portal.other_scan_ids, vec![2]);
        assert_eq!(portal.other_scan_names, vec![String::from("weekly infrastructure")]);

        // Plugin 100 is a duplicate and plugin 103 is offline, so only 102 lands
        let vulnerabilities = portal.vulnerabilities.as_ref().unwrap();
        let plugins: Vec<Option<i64>> = vulnerabilities.iter().map(|vulnerability| vulnerability.plugin_id).collect();
        assert_eq!(plugins, vec![Some(100), Some(102)]);
        assert_eq!(portal.critical, 2);
        assert_eq!(portal.high, 1);
    }

    #[tokio::test]
    async fn vulnerability_detail_can_be_stripped() {
        let api = fixture();
        let DownloadOutcome::Downloaded(result) = download(&api, &api.scans.clone(), false, None).await.unwrap() else {
            panic!("expected a download");
        };
        assert!(result.hosts.values().all(|host| host.vulnerabilities.is_none()));
    }

    #[tokio::test]
    async fn hosts_split_into_groups_with_their_own_windows() {
        let api = fixture();
        let DownloadOutcome::Downloaded(result) = download(&api, &api.scans.clone(), true, None).await.unwrap() else {
            panic!("expected a download");
        };
        let groups = group_result(&api.scans, result).unwrap();
        assert_eq!(groups.len(), 2);

        let webapps = &groups["webapps"];
        assert_eq!(webapps.hosts.len(), 1);
        assert!(webapps.hosts.contains_key("portal.example.wa.gov.au"));
        // The shared host pulls both scans into the webapps window
        assert_eq!(webapps.scan_starttime, DateTime::from_timestamp(SCAN_1_START).unwrap());
        assert_eq!(webapps.scan_endtime, DateTime::from_timestamp(SCAN_2_START + HOUR).unwrap());

        let hosts = &groups["hosts"];
        assert_eq!(hosts.hosts.len(), 2);
        assert!(hosts.hosts.contains_key("internal-db"));
        assert!(hosts.hosts.contains_key("mail.example.com"));
    }

    #[tokio::test]
    async fn repeated_harvest_publishes_nothing_new() {
        let api = fixture();
        let operator = memory_operator();

        let first = harvest_with(&api, operator.clone()).await.unwrap();
        match first {
            HarvestOutcome::Published(groups) => assert_eq!(groups, vec![String::from("hosts"), String::from("webapps")]),
            HarvestOutcome::NoNewScans(_) => panic!("first harvest must publish"),
        }

        let second = harvest_with(&api, operator.clone()).await.unwrap();
        assert!(matches!(second, HarvestOutcome::NoNewScans(Some(_))));

        // No second version of either group was pushed
        let mut storage = ResourceStorage::with_operator("webapps", operator.clone(), StorageOptions::default());
        let document = storage.document().await.unwrap();
        match document.entry("webapps", None).unwrap() {
            ResourceEntry::Archive(entry) => {
                assert!(entry.current.is_some());
                assert!(entry.histories.is_empty());
            }
            ResourceEntry::Single(_) => panic!("harvest groups are archive resources"),
        }

        let mut index: MetadataStore<HarvestMetadata> = MetadataStore::new(operator, None, "metadata", false);
        let metadata = index.read().await.unwrap().unwrap();
        assert_eq!(metadata.harvest_status, "succeed");
        assert!(metadata.scan_endtime.is_some());
        assert!(metadata.harvest_endtime.is_some());
    }
}
