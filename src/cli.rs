use crate::archive::{ArchiveOptions, Archiver};
use crate::error::{Error, Result};
use crate::harvest::{self, HarvestOutcome};
use crate::time::{Date, DateTime};
use chrono::Datelike;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "resource_archive", about = "Archive resource tracking history and harvest scan reports")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Archive the logged points of a month, or of a single day
    Archive {
        year: i32,
        month: u32,
        day: Option<u32>,
        /// Download the archived files to verify they were uploaded intact
        #[arg(long)]
        check: bool,
        /// Delete the archived logged points from the source table
        #[arg(long)]
        delete: bool,
    },
    /// Archive eligible days continuously, oldest first
    #[command(name = "continuous_archive")]
    ContinuousArchive {
        #[arg(long)]
        check: bool,
        #[arg(long)]
        delete: bool,
        /// Maximum number of daily windows to archive in one run
        #[arg(long = "max-archive-days")]
        max_archive_days: Option<u32>,
    },
    /// Restore logged points from the archive
    Restore {
        year: i32,
        month: u32,
        day: Option<u32>,
        /// Keep the original logged point ids when restoring to the origin table
        #[arg(long = "preserve-id")]
        preserve_id: bool,
        /// Restore into tracking_loggedpoint instead of a staging table
        #[arg(long = "restore-to-origin-table")]
        restore_to_origin_table: bool,
    },
    /// Delete archived files from storage
    #[command(name = "delete_archive")]
    DeleteArchive { year: i32, month: u32, day: Option<u32> },
    /// Harvest completed security scans and publish them by host group
    Harvest,
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Archive {
            year,
            month,
            day,
            check,
            delete,
        } => {
            let options = ArchiveOptions {
                check,
                delete_after_archive: delete,
                overwrite: false,
            };
            let mut archiver = Archiver::new()?;
            match validated_day(year, month, day)? {
                Some(date) => archiver.archive_by_date(date, &options).await,
                None => archiver.archive_by_month(year, month, &options).await,
            }
        }
        Command::ContinuousArchive {
            check,
            delete,
            max_archive_days,
        } => {
            let options = ArchiveOptions {
                check,
                delete_after_archive: delete,
                overwrite: false,
            };
            let max_archive_days = max_archive_days.filter(|&max| max > 0);
            Archiver::new()?.continuous_archive(&options, max_archive_days).await
        }
        Command::Restore {
            year,
            month,
            day,
            preserve_id,
            restore_to_origin_table,
        } => {
            let mut archiver = Archiver::new()?;
            let table = match validated_day(year, month, day)? {
                Some(date) => archiver.restore_by_date(date, restore_to_origin_table, preserve_id).await?,
                None => {
                    archiver
                        .restore_by_month(year, month, restore_to_origin_table, preserve_id)
                        .await?
                }
            };
            info!("restored logged points into table {table}");
            Ok(())
        }
        Command::DeleteArchive { year, month, day } => {
            let mut archiver = Archiver::new()?;
            match validated_day(year, month, day)? {
                Some(date) => archiver.delete_archive_by_date(date).await,
                None => archiver.delete_archive_by_month(year, month).await,
            }
        }
        Command::Harvest => {
            match harvest::harvest().await? {
                HarvestOutcome::Published(groups) => info!("published scan results for groups {groups:?}"),
                HarvestOutcome::NoNewScans(Some(since)) => info!("no new scans since {since}"),
                HarvestOutcome::NoNewScans(None) => info!("no new scans"),
            }
            Ok(())
        }
    }
}

/// Validates the date arguments shared by the archive, restore and delete
/// sub-commands. Returns the date when a day was given, `None` for a whole
/// month. Any date not strictly before today is rejected.
fn validated_day(year: i32, month: u32, day: Option<u32>) -> Result<Option<Date>> {
    let today = DateTime::today();
    let current_year = today.year();
    if year < current_year - 10 || year > current_year {
        return Err(Error::InvalidArgument(format!(
            "year must be between {} and {current_year}",
            current_year - 10
        )));
    }
    if !(1..=12).contains(&month) {
        return Err(Error::InvalidArgument(String::from("month must be between 1 and 12")));
    }
    if let Some(day) = day {
        if !(1..=31).contains(&day) {
            return Err(Error::InvalidArgument(String::from("day must be between 1 and 31")));
        }
    }

    let date = Date::from_ymd(year, month, day.unwrap_or(1))
        .ok_or_else(|| Error::InvalidArgument(format!("{year}-{month}-{} is not a calendar date", day.unwrap_or(1))))?;
    if date >= today {
        return Err(Error::InvalidDate);
    }
    Ok(day.map(|_| date))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_arguments_validate_without_a_day() {
        let last_year = DateTime::today().year() - 1;
        assert_eq!(validated_day(last_year, 1, None).unwrap(), None);
    }

    #[test]
    fn day_arguments_resolve_to_a_date() {
        let last_year = DateTime::today().year() - 1;
        let date = validated_day(last_year, 1, Some(15)).unwrap();
        assert_eq!(date, Date::from_ymd(last_year, 1, 15));
    }

    #[test]
    fn out_of_range_components_are_rejected() {
        let year = DateTime::today().year();
        assert!(matches!(validated_day(year - 11, 1, None), Err(Error::InvalidArgument(_))));
        assert!(matches!(validated_day(year + 1, 1, None), Err(Error::InvalidArgument(_))));
        assert!(matches!(validated_day(year - 1, 13, None), Err(Error::InvalidArgument(_))));
        assert!(matches!(validated_day(year - 1, 1, Some(32)), Err(Error::InvalidArgument(_))));
        assert!(matches!(validated_day(year - 1, 2, Some(30)), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn dates_from_today_onwards_are_rejected() {
        let year = DateTime::today().year();
        assert!(matches!(validated_day(year, 12, Some(31)), Err(Error::InvalidDate)));
    }
}
