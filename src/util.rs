use std::future::Future;

use tokio::task::JoinHandle;

/// Expands a leading `~` in a path to the user's home directory.
/// Also normalizes path separators for the current OS.
pub fn expand_tilde(path: &str) -> String {
    let result = if path.starts_with("~/") || path == "~" {
        if let Some(home) = dirs::home_dir() {
            let rest = &path[1..];
            home.join(rest.trim_start_matches('/'))
                .to_string_lossy()
                .to_string()
        } else {
            path.to_string()
        }
    } else {
        path.to_string()
    };
    if cfg!(windows) {
        result.replace('/', "\\")
    } else {
        result
    }
}

/// Spawn a task on the current Tokio runtime, if there is one.
///
/// Mutations happen from synchronous call sites; background work (durable
/// writes, retries, auto backups) is best-effort and simply skipped when no
/// runtime is driving us.
pub fn spawn_detached<F>(fut: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.spawn(fut)),
        Err(_) => {
            tracing::debug!("no async runtime, skipping background task");
            None
        }
    }
}

/// Format a Unix timestamp (seconds) as ISO 8601 UTC (e.g. "2025-06-15T10:30:00Z").
/// Pure arithmetic, no date crate.
pub fn format_timestamp(secs: u64) -> String {
    let (year, month, day) = civil_date(secs);
    let s = secs as i64;
    let sec = s % 60;
    let min = (s / 60) % 60;
    let hour = (s / 3600) % 24;
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{min:02}:{sec:02}Z")
}

/// Calendar date of a millisecond timestamp, e.g. "2025-06-15".
pub fn iso_date(millis: u64) -> String {
    let (year, month, day) = civil_date(millis / 1000);
    format!("{year:04}-{month:02}-{day:02}")
}

fn civil_date(secs: u64) -> (i64, i64, i64) {
    let mut days = secs as i64 / 86400;

    let mut year: i64 = 1970;
    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }

    let month_days: [i64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month: i64 = 1;
    for (i, len) in month_days.iter().enumerate() {
        let mut d = *len;
        if i == 1 && is_leap(year) {
            d += 1;
        }
        if days < d {
            break;
        }
        days -= d;
        month += 1;
    }
    (year, month, days + 1)
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}
