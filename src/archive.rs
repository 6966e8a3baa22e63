use crate::codec;
use crate::config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::spatial;
use crate::storage::model::{Document, EntryMap, NewResource, ResourceMetadata};
use crate::storage::{CURRENT, ResourceStorage, StorageOptions};
use crate::time::{Date, DateTime};
use chrono::{Days, Timelike};
use serde_json::{Map, Value, json};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Timestamp format used inside SQL literals.
const SQL_DATETIME: &str = "%Y-%m-%d %H:%M:%S %z";

const EARLIEST_ARCHIVE_DATE_SQL: &str = "SELECT min(seen) AS value FROM tracking_loggedpoint";

/// Rows of one archive window, joined with the device dimension. `seen` is
/// exported as epoch seconds so the GeoPackage column stays a bigint.
fn archive_sql(start: &DateTime, end: &DateTime) -> String {
    format!(
        "SELECT a.id,a.point,a.heading,a.velocity,a.altitude,a.message,a.source_device_type,a.raw,\
         extract(epoch from a.seen)::bigint as seen,b.deviceid,b.registration \
         FROM tracking_loggedpoint a JOIN tracking_device b ON a.device_id = b.id \
         WHERE a.seen >= '{}' AND a.seen < '{}'",
        start.format(SQL_DATETIME),
        end.format(SQL_DATETIME)
    )
}

fn delete_window_sql(start: &DateTime, end: &DateTime) -> String {
    format!(
        "DELETE FROM tracking_loggedpoint WHERE seen >= '{}' AND seen < '{}'",
        start.format(SQL_DATETIME),
        end.format(SQL_DATETIME)
    )
}

/// Recreates devices referenced by a restored table but missing from the
/// device dimension.
fn missing_device_sql(table: &str) -> String {
    format!(
        "INSERT INTO tracking_device (deviceid) SELECT distinct a.deviceid FROM {table} a \
         WHERE NOT EXISTS(SELECT 1 FROM tracking_device b WHERE a.deviceid = b.deviceid)"
    )
}

fn restore_with_id_sql(table: &str) -> String {
    format!(
        "INSERT INTO tracking_loggedpoint (id,device_id,point,heading,velocity,altitude,seen,message,source_device_type,raw) \
         SELECT a.id,b.id,a.point,a.heading,a.velocity,a.altitude,to_timestamp(a.seen),a.message,a.source_device_type,a.raw \
         FROM {table} a JOIN tracking_device b on a.deviceid = b.deviceid"
    )
}

fn restore_sql(table: &str) -> String {
    format!(
        "INSERT INTO tracking_loggedpoint (device_id,point,heading,velocity,altitude,seen,message,source_device_type,raw) \
         SELECT b.id,a.point,a.heading,a.velocity,a.altitude,to_timestamp(a.seen),a.message,a.source_device_type,a.raw \
         FROM {table} a JOIN tracking_device b on a.deviceid = b.deviceid"
    )
}

pub fn archive_group(date: Date) -> String {
    format!("loggedpoint{}", date.format("%Y-%m"))
}

pub fn archive_id(date: Date) -> String {
    format!("loggedpoint{}", date.format("%Y-%m-%d"))
}

fn vrt_id(group: &str) -> String {
    format!("{group}.vrt")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveOptions {
    pub delete_after_archive: bool,
    pub check: bool,
    pub overwrite: bool,
}

/// Archives daily windows of `tracking_loggedpoint` into the resource
/// store, one GeoPackage per day grouped by month, and keeps each group's
/// union VRT in step.
pub struct Archiver {
    database: Database,
    storage: ResourceStorage,
}

impl Archiver {
    pub fn new() -> Result<Self> {
        let database = Database::new(config::database_url())?;
        let storage = ResourceStorage::new(
            config::loggedpoint_resource_name(),
            config::storage_connection_string(),
            config::storage_container(),
            StorageOptions {
                group_resource: true,
                archive: false,
                ..Default::default()
            },
        )?;
        Ok(Self { database, storage })
    }

    /// Archives every eligible day, oldest first, from the earliest `seen`
    /// in the source table up to the retention boundary. Refuses to run
    /// during configured working hours.
    pub async fn continuous_archive(&mut self, options: &ArchiveOptions, max_archive_days: Option<u32>) -> Result<()> {
        let now = DateTime::now();
        if within_working_hours(now.hour(), config::working_hours()) {
            return Err(Error::WithinWorkingHours);
        }

        let earliest = {
            let mut conn = self.database.connection()?;
            self.database.get_timestamp(&mut conn, EARLIEST_ARCHIVE_DATE_SQL)?
        };
        let Some(earliest) = earliest else {
            info!("no logged points to archive");
            return Ok(());
        };
        let mut date = Date::from(earliest.with_timezone(&config::timezone()).date_naive());
        let last = last_continuous_date(DateTime::today(), config::loggedpoint_active_days());

        info!(
            "begin continuous archive, earliest={date}, last={last}, delete_after_archive={}, check={}, max_archive_days={max_archive_days:?}",
            options.delete_after_archive, options.check
        );
        let mut archived = 0;
        while date < last && max_archive_days.is_none_or(|max| archived < max) {
            self.archive_by_date(date, options).await?;
            date = date.next_day();
            archived += 1;
        }
        Ok(())
    }

    /// Archives each day of the month that is strictly before today.
    pub async fn archive_by_month(&mut self, year: i32, month: u32, options: &ArchiveOptions) -> Result<()> {
        let today = DateTime::today();
        let mut date = Date::from_ymd(year, month, 1).ok_or(Error::InvalidDate)?;
        if date >= today {
            return Err(Error::InvalidDate);
        }
        let last = date.first_of_next_month().min(today);

        info!("begin archiving month {year}-{month:02}, start={date}, end={last}");
        while date < last {
            self.archive_by_date(date, options).await?;
            date = date.next_day();
        }
        Ok(())
    }

    pub async fn archive_by_date(&mut self, date: Date, options: &ArchiveOptions) -> Result<()> {
        if date >= DateTime::today() {
            return Err(Error::InvalidDate);
        }
        let group = archive_group(date);
        let id = archive_id(date);
        let start = date.midnight();
        let end = date.next_day().midnight();
        self.archive(&group, &id, start, end, options).await
    }

    /// Runs the pipeline for one window: export, upload, verify, VRT
    /// rebuild, source-row deletion. The working folder is removed on every
    /// exit path.
    async fn archive(&mut self, group: &str, id: &str, start: DateTime, end: DateTime, options: &ArchiveOptions) -> Result<()> {
        debug!("begin archiving window, group={group}, id={id}, start={start}, end={end}");
        if !options.overwrite && self.storage.is_exist(id, Some(group)).await? {
            return Err(Error::ResourceAlreadyExist(format!("{id} [{start} - {end})")));
        }

        let work_folder = WorkFolder::new("archive_loggedpoint")?;
        let export = {
            let mut conn = self.database.connection()?;
            self.database.export_spatial_data(
                &mut conn,
                &archive_sql(&start, &end),
                &work_folder.join("loggedpoint.gpkg"),
                Some(id),
            )?
        };
        let Some((layer_info, filename)) = export else {
            debug!("no logged points to archive, group={group}, id={id}");
            return Ok(());
        };

        let file_md5 = codec::file_md5(&filename)?;
        let mut extra = Map::new();
        extra.insert(String::from("start_archive"), timestamp_value());
        extra.insert(String::from("start_archive_date"), serde_json::to_value(start)?);
        extra.insert(String::from("end_archive_date"), serde_json::to_value(end)?);
        let new = NewResource {
            resource_id: Some(id.to_owned()),
            resource_file: Some(format!("{id}.gpkg")),
            resource_group: Some(group.to_owned()),
            file_md5: Some(file_md5.clone()),
            features: Some(layer_info.features),
            layer: Some(layer_info.layer.clone()),
            extra,
        };
        debug!("begin pushing archive file, group={group}, id={id}");
        self.storage.push_file(&filename, new, Some(stamp_end_archive)).await?;

        if options.check {
            let (_, downloaded) = self
                .storage
                .download(id, Some(&work_folder.join("loggedpoint_download.gpkg")), true, Some(group), CURRENT)
                .await?;
            let downloaded_md5 = codec::file_md5(&downloaded)?;
            if downloaded_md5 != file_md5 {
                return Err(Error::IntegrityFailure(format!(
                    "uploaded archive md5 {downloaded_md5} does not match source md5 {file_md5}"
                )));
            }
            let downloaded_info = spatial::layer_info(&downloaded, None)?;
            if downloaded_info.features != layer_info.features {
                return Err(Error::IntegrityFailure(format!(
                    "uploaded archive has {} features, source has {}",
                    downloaded_info.features, layer_info.features
                )));
            }
        }

        self.rebuild_vrt(group, &work_folder, options.check).await?;

        if options.delete_after_archive {
            let mut conn = self.database.connection()?;
            let deleted = self.database.update(&mut conn, &delete_window_sql(&start, &end))?;
            debug!("deleted {deleted} archived rows from tracking_loggedpoint, group={group}, id={id}");
        }

        debug!("end archiving window, group={group}, id={id}");
        Ok(())
    }

    /// Regenerates the group's union VRT from its current membership.
    async fn rebuild_vrt(&mut self, group: &str, work_folder: &WorkFolder, check: bool) -> Result<()> {
        debug!("begin updating the union vrt, group={group}");
        let entries = self.storage.group_metadata(group).await?;
        let vrt_id = vrt_id(group);
        let vrt_path = work_folder.join("loggedpoint.vrt");
        std::fs::write(&vrt_path, build_vrt(group, &entries))?;

        let file_md5 = codec::file_md5(&vrt_path)?;
        let new = NewResource {
            resource_id: Some(vrt_id.clone()),
            resource_file: Some(vrt_id.clone()),
            resource_group: Some(group.to_owned()),
            file_md5: Some(file_md5.clone()),
            features: Some(member_features(group, &entries)),
            ..Default::default()
        };
        self.storage.push_file(&vrt_path, new, Some(stamp_updated)).await?;

        if check {
            let (_, downloaded) = self
                .storage
                .download(&vrt_id, Some(&work_folder.join("loggedpoint_download.vrt")), true, Some(group), CURRENT)
                .await?;
            let downloaded_md5 = codec::file_md5(&downloaded)?;
            if downloaded_md5 != file_md5 {
                return Err(Error::IntegrityFailure(format!(
                    "uploaded vrt md5 {downloaded_md5} does not match source md5 {file_md5}"
                )));
            }
        }
        Ok(())
    }

    pub async fn restore_by_month(&mut self, year: i32, month: u32, restore_to_origin_table: bool, preserve_id: bool) -> Result<String> {
        let date = Date::from_ymd(year, month, 1).ok_or(Error::InvalidDate)?;
        let group = archive_group(date);
        debug!("begin restoring archived logged points, group={group}");

        let work_folder = WorkFolder::new("restore_loggedpoint")?;
        let (_, folder) = self.storage.download_group(&group, Some(work_folder.path()), true).await?;
        let table = self.restore_file(&folder.join(vrt_id(&group)), restore_to_origin_table, preserve_id)?;
        debug!("end restoring archived logged points, group={group}, imported_table={table}");
        Ok(table)
    }

    pub async fn restore_by_date(&mut self, date: Date, restore_to_origin_table: bool, preserve_id: bool) -> Result<String> {
        let group = archive_group(date);
        let id = archive_id(date);
        debug!("begin restoring archived logged points, group={group}, id={id}");

        let work_folder = WorkFolder::new("restore_loggedpoint")?;
        let filename = work_folder.join(format!("{id}.gpkg"));
        let (_, downloaded) = self.storage.download(&id, Some(&filename), true, Some(&group), CURRENT).await?;
        let table = self.restore_file(&downloaded, restore_to_origin_table, preserve_id)?;
        debug!("end restoring archived logged points, group={group}, id={id}, imported_table={table}");
        Ok(table)
    }

    fn restore_file(&self, path: &Path, restore_to_origin_table: bool, preserve_id: bool) -> Result<String> {
        let mut conn = self.database.connection()?;
        let imported = self.database.import_spatial_data(&mut conn, path, None, None, true)?;
        if !restore_to_origin_table {
            return Ok(imported);
        }

        let created = self.database.update_autocommit(&mut conn, &missing_device_sql(&imported))?;
        match created {
            0 => debug!("all devices referenced from table {imported} exist"),
            created => debug!("created {created} missing devices from table {imported}"),
        }

        let sql = match preserve_id {
            true => restore_with_id_sql(&imported),
            false => restore_sql(&imported),
        };
        let restored = self.database.update_autocommit(&mut conn, &sql)?;
        debug!("restored {restored} logged points from table {imported}");

        // The staging table is expendable, keep the restore result on failure
        if let Err(err) = self.database.execute_ddl(&mut conn, &format!("DROP TABLE \"{imported}\"")) {
            error!("failed to drop the imported table {imported}: {err}");
        }
        Ok(String::from("tracking_loggedpoint"))
    }

    pub async fn delete_all(&mut self) -> Result<()> {
        self.ensure_delete_enabled()?;
        if !confirm("Are you sure you want to delete all loggedpoint archives?(Y/N):") {
            return Ok(());
        }

        let groups = match self.storage.document().await? {
            Document::Grouped(groups) => groups.into_keys().collect(),
            Document::Flat(_) => Vec::new(),
        };
        for group in groups {
            self.storage.delete_resource(None, Some(&group)).await?;
        }
        Ok(())
    }

    pub async fn delete_archive_by_month(&mut self, year: i32, month: u32) -> Result<()> {
        self.ensure_delete_enabled()?;
        if !confirm(&format!("Are you sure you want to delete the loggedpoint archives for the month ({year}/{month})?(Y/N):")) {
            return Ok(());
        }

        let date = Date::from_ymd(year, month, 1).ok_or(Error::InvalidDate)?;
        self.storage.delete_resource(None, Some(&archive_group(date))).await?;
        Ok(())
    }

    /// Deletes one day's archive, then rebuilds the group VRT from the
    /// remaining days, or removes the VRT when the day was the last one.
    pub async fn delete_archive_by_date(&mut self, date: Date) -> Result<()> {
        self.ensure_delete_enabled()?;
        if !confirm(&format!("Are you sure you want to delete the loggedpoint archives for the day ({date})?(Y/N):")) {
            return Ok(());
        }

        let group = archive_group(date);
        let id = archive_id(date);
        let vrt_id = vrt_id(&group);
        self.storage.delete_resource(Some(&id), Some(&group)).await?;

        let entries = match self.storage.document().await?.group(&group) {
            Some(entries) => entries.clone(),
            None => return Ok(()),
        };
        let has_members = entries
            .values()
            .filter_map(|entry| entry.latest())
            .any(|metadata| metadata.resource_id != vrt_id);
        if has_members {
            let work_folder = WorkFolder::new("delete_archive")?;
            self.rebuild_vrt(&group, &work_folder, false).await?;
        } else {
            self.storage.delete_resource(Some(&vrt_id), Some(&group)).await?;
        }
        Ok(())
    }

    fn ensure_delete_enabled(&self) -> Result<()> {
        match config::archive_delete_disabled() {
            true => Err(Error::DeleteDisabled),
            false => Ok(()),
        }
    }
}

/// Union-layer manifest covering every non-VRT entry of the group, sorted
/// ascending by resource id.
fn build_vrt(group: &str, entries: &EntryMap) -> String {
    let vrt_id = vrt_id(group);
    let mut layers: Vec<(&str, &str)> = entries
        .values()
        .filter_map(|entry| entry.latest())
        .filter(|metadata| metadata.resource_id != vrt_id)
        .map(|metadata| (metadata.resource_id.as_str(), metadata.resource_file.as_str()))
        .collect();
    layers.sort();

    let body: Vec<String> = layers
        .iter()
        .map(|(id, file)| {
            format!("        <OGRVRTLayer name=\"{id}\">\n            <SrcDataSource>{file}</SrcDataSource>\n        </OGRVRTLayer>")
        })
        .collect();
    format!(
        "<OGRVRTDataSource>\n    <OGRVRTUnionLayer name=\"{group}\">\n{}\n    </OGRVRTUnionLayer>\n</OGRVRTDataSource>",
        body.join("\n")
    )
}

/// Total feature count across the group's non-VRT entries.
fn member_features(group: &str, entries: &EntryMap) -> i64 {
    let vrt_id = vrt_id(group);
    entries
        .values()
        .filter_map(|entry| entry.latest())
        .filter(|metadata| metadata.resource_id != vrt_id)
        .filter_map(|metadata| metadata.features)
        .sum()
}

/// The first day that is still too fresh to archive.
fn last_continuous_date(today: Date, active_days: i64) -> Date {
    Date::from(today.checked_sub_days(Days::new(active_days.max(0) as u64)).unwrap_or(*today))
}

fn within_working_hours(hour: u32, bounds: (Option<u32>, Option<u32>)) -> bool {
    match bounds {
        (None, None) => false,
        (Some(start), None) => hour >= start,
        (None, Some(end)) => hour <= end,
        (Some(start), Some(end)) => hour >= start && hour <= end,
    }
}

fn stamp_end_archive(metadata: &mut ResourceMetadata) {
    metadata.extra.insert(String::from("end_archive"), timestamp_value());
}

fn stamp_updated(metadata: &mut ResourceMetadata) {
    metadata.extra.insert(String::from("updated"), timestamp_value());
}

fn timestamp_value() -> Value {
    json!({"_type": "datetime", "value": DateTime::now().to_string()})
}

fn confirm(prompt: &str) -> bool {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut buffer = String::new();
    loop {
        print!("{prompt}");
        if stdout.flush().is_err() {
            return false;
        }
        buffer.clear();
        if stdin.read_line(&mut buffer).is_err() {
            return false;
        }
        match buffer.trim().to_uppercase().as_str() {
            "Y" => return true,
            "N" => return false,
            _ => continue,
        }
    }
}

/// Per-invocation scratch directory, removed when dropped.
struct WorkFolder {
    path: PathBuf,
}

impl WorkFolder {
    fn new(prefix: &str) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("{prefix}_{}", std::process::id()));
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn join(&self, file: impl AsRef<Path>) -> PathBuf {
        self.path.join(file)
    }
}

impl Drop for WorkFolder {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.path).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blob::memory_operator;

    fn day_entries(days: &[&str]) -> EntryMap {
        let mut entries = EntryMap::new();
        for (index, day) in days.iter().enumerate() {
            let id = format!("loggedpoint2024-05-{day}");
            let metadata = serde_json::from_value(json!({
                "resource_id": id,
                "resource_file": format!("{id}.gpkg"),
                "resource_path": format!("loggedpoint/data/loggedpoint2024-05/{id}.gpkg"),
                "resource_group": "loggedpoint2024-05",
                "publish_date": {"_type": "datetime", "value": "2024-06-01 01:00:00.000000"},
                "features": index as i64 + 1,
            }))
            .unwrap();
            entries.insert(id, crate::storage::model::ResourceEntry::Single(metadata));
        }
        entries
    }

    #[test]
    fn vrt_lists_days_in_ascending_order() {
        let mut entries = day_entries(&["02", "01"]);
        // A stale VRT entry in the group must not reference itself
        let vrt = serde_json::from_value(json!({
            "resource_id": "loggedpoint2024-05.vrt",
            "resource_file": "loggedpoint2024-05.vrt",
            "resource_path": "loggedpoint/data/loggedpoint2024-05/loggedpoint2024-05.vrt",
            "publish_date": {"_type": "datetime", "value": "2024-06-01 01:00:00.000000"},
        }))
        .unwrap();
        entries.insert(String::from("loggedpoint2024-05.vrt"), crate::storage::model::ResourceEntry::Single(vrt));

        let vrt = build_vrt("loggedpoint2024-05", &entries);
        assert_eq!(
            vrt,
            "<OGRVRTDataSource>\n    \
             <OGRVRTUnionLayer name=\"loggedpoint2024-05\">\n        \
             <OGRVRTLayer name=\"loggedpoint2024-05-01\">\n            \
             <SrcDataSource>loggedpoint2024-05-01.gpkg</SrcDataSource>\n        \
             </OGRVRTLayer>\n        \
             <OGRVRTLayer name=\"loggedpoint2024-05-02\">\n            \
             <SrcDataSource>loggedpoint2024-05-02.gpkg</SrcDataSource>\n        \
             </OGRVRTLayer>\n    \
             </OGRVRTUnionLayer>\n</OGRVRTDataSource>"
        );
        assert!(!vrt.contains("loggedpoint2024-05.vrt"));
    }

    #[test]
    fn vrt_features_sum_over_members_only() {
        let entries = day_entries(&["01", "02", "03"]);
        assert_eq!(member_features("loggedpoint2024-05", &entries), 6);
    }

    #[test]
    fn archive_naming_follows_the_date() {
        let date = Date::from_ymd(2024, 5, 1).unwrap();
        assert_eq!(archive_group(date), "loggedpoint2024-05");
        assert_eq!(archive_id(date), "loggedpoint2024-05-01");
        assert_eq!(vrt_id(&archive_group(date)), "loggedpoint2024-05.vrt");
    }

    #[test]
    fn working_hours_guard_supports_open_bounds() {
        assert!(!within_working_hours(12, (None, None)));
        assert!(within_working_hours(12, (Some(8), Some(17))));
        assert!(!within_working_hours(7, (Some(8), Some(17))));
        assert!(!within_working_hours(18, (Some(8), Some(17))));
        assert!(within_working_hours(23, (Some(8), None)));
        assert!(within_working_hours(3, (None, Some(17))));
        assert!(!within_working_hours(18, (None, Some(17))));
    }

    #[test]
    fn retention_boundary_is_active_days_before_today() {
        let today = Date::from_ymd(2024, 6, 1).unwrap();
        assert_eq!(last_continuous_date(today, 30), Date::from_ymd(2024, 5, 2).unwrap());
        assert_eq!(last_continuous_date(today, 0), today);
    }

    #[tokio::test]
    async fn pushed_group_round_trips_through_vrt_builder() {
        let operator = memory_operator();
        let options = || StorageOptions {
            group_resource: true,
            archive: false,
            ..Default::default()
        };
        let mut storage = ResourceStorage::with_operator("loggedpoint", operator.clone(), options());
        for day in ["01", "02"] {
            let id = format!("loggedpoint2024-05-{day}");
            let new = NewResource {
                resource_id: Some(id.clone()),
                resource_file: Some(format!("{id}.gpkg")),
                resource_group: Some(String::from("loggedpoint2024-05")),
                features: Some(2),
                ..Default::default()
            };
            storage.push_resource(b"gpkg".to_vec(), new, Some(stamp_end_archive)).await.unwrap();
        }

        // Rebuild works off what a fresh client reads back from the store
        let mut fresh = ResourceStorage::with_operator("loggedpoint", operator, options());
        let entries = fresh.group_metadata("loggedpoint2024-05").await.unwrap();
        let vrt = build_vrt("loggedpoint2024-05", &entries);
        let first = vrt.find("loggedpoint2024-05-01").unwrap();
        let second = vrt.find("loggedpoint2024-05-02").unwrap();
        assert!(first < second);
        assert_eq!(member_features("loggedpoint2024-05", &entries), 4);

        let metadata = fresh
            .require_metadata("loggedpoint2024-05-01", Some("loggedpoint2024-05"), CURRENT)
            .await
            .unwrap();
        assert!(metadata.extra.contains_key("end_archive"));
    }
}
