use chrono_tz::Tz;
use std::sync::LazyLock;

/// Reads an environment variable, loading `.env` on first use.
/// Empty values are treated as unset.
fn var(name: &str) -> Option<String> {
    static DOTENV: LazyLock<()> = LazyLock::new(|| {
        dotenvy::dotenv().ok();
    });
    LazyLock::force(&DOTENV);
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn required(name: &str) -> String {
    var(name).unwrap_or_else(|| {
        eprintln!("Missing required environment variable {name}");
        std::process::exit(1)
    })
}

fn parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = var(name)?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            eprintln!("Environment variable {name} has an invalid value ({value})");
            std::process::exit(1)
        }
    }
}

fn parse_bool(name: &str, default: bool) -> bool {
    match var(name) {
        Some(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

pub fn timezone() -> Tz {
    static TIME_ZONE: LazyLock<Tz> = LazyLock::new(|| {
        let name = var("TIME_ZONE").unwrap_or_else(|| String::from("Australia/Perth"));
        name.parse().unwrap_or_else(|_| {
            eprintln!("Unknown time zone {name}");
            std::process::exit(1)
        })
    });
    *TIME_ZONE
}

pub fn debug() -> bool {
    static DEBUG: LazyLock<bool> = LazyLock::new(|| parse_bool("DEBUG", false));
    *DEBUG
}

pub fn database_url() -> &'static str {
    static DATABASE_URL: LazyLock<String> = LazyLock::new(|| required("RESOURCE_TRACKING_DATABASE_URL"));
    &DATABASE_URL
}

pub fn storage_connection_string() -> &'static str {
    static CONNECTION_STRING: LazyLock<String> =
        LazyLock::new(|| required("RESOURCE_TRACKING_STORAGE_CONNECTION_STRING"));
    &CONNECTION_STRING
}

pub fn storage_container() -> &'static str {
    static CONTAINER: LazyLock<String> = LazyLock::new(|| required("RESOURCE_TRACKING_CONTAINER"));
    &CONTAINER
}

pub fn loggedpoint_resource_name() -> &'static str {
    static RESOURCE_NAME: LazyLock<String> = LazyLock::new(|| required("LOGGEDPOINT_RESOURCE_NAME"));
    &RESOURCE_NAME
}

/// Number of days worth of logged points kept in the database before they
/// become eligible for archival.
pub fn loggedpoint_active_days() -> i64 {
    static ACTIVE_DAYS: LazyLock<i64> = LazyLock::new(|| parse("LOGGEDPOINT_ACTIVE_DAYS").unwrap_or(30));
    *ACTIVE_DAYS
}

/// Gate on all destructive archive operations. Defaults to disabled.
pub fn archive_delete_disabled() -> bool {
    static DELETE_DISABLED: LazyLock<bool> =
        LazyLock::new(|| parse_bool("LOGGEDPOINT_ARCHIVE_DELETE_DISABLED", true));
    *DELETE_DISABLED
}

pub fn working_hours() -> (Option<u32>, Option<u32>) {
    static WORKING_HOURS: LazyLock<(Option<u32>, Option<u32>)> =
        LazyLock::new(|| (parse("START_WORKING_HOUR"), parse("END_WORKING_HOUR")));
    *WORKING_HOURS
}

/// Chunk size hints passed through to the object store client.
pub fn blob_chunk_sizes() -> (Option<usize>, Option<usize>) {
    static CHUNK_SIZES: LazyLock<(Option<usize>, Option<usize>)> =
        LazyLock::new(|| (parse("AZURE_MAX_SINGLE_PUT_SIZE"), parse("AZURE_MAX_SINGLE_GET_SIZE")));
    *CHUNK_SIZES
}

pub fn nessus_base() -> &'static str {
    static NESSUS_BASE: LazyLock<String> = LazyLock::new(|| required("NESSUS_BASE"));
    &NESSUS_BASE
}

pub fn nessus_url() -> &'static str {
    static NESSUS_URL: LazyLock<String> = LazyLock::new(|| required("NESSUS_URL"));
    &NESSUS_URL
}

pub fn nessus_access_key() -> &'static str {
    static ACCESS_KEY: LazyLock<String> = LazyLock::new(|| required("NESSUS_ACCESS_KEY"));
    &ACCESS_KEY
}

pub fn nessus_secret_key() -> &'static str {
    static SECRET_KEY: LazyLock<String> = LazyLock::new(|| required("NESSUS_SECRET_KEY"));
    &SECRET_KEY
}

pub fn nessus_container() -> &'static str {
    static CONTAINER: LazyLock<String> = LazyLock::new(|| required("NESSUS_CONTAINER"));
    &CONTAINER
}

pub fn nessus_connection_string() -> &'static str {
    static CONNECTION_STRING: LazyLock<String> = LazyLock::new(|| required("AZURE_STORAGE_CONNECTION_STRING"));
    &CONNECTION_STRING
}

/// Default tracing filter. `DEBUG=true` raises verbosity for this crate only.
pub fn log_filter() -> String {
    match debug() {
        true => String::from("warn,resource_archive=debug"),
        false => String::from("warn"),
    }
}
