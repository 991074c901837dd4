use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};

/// Freshness of a module that has neither files nor messages. Kept apart
/// from 0, which MediaWiki timestamp conversion reads as "now".
pub const NO_TIMESTAMP: i64 = 1;

/// Stat capability used by freshness computation. A missing path must
/// surface as an error whose root cause is `io::ErrorKind::NotFound`.
pub trait FileClock: Send + Sync {
    fn modified_time(&self, path: &Path) -> Result<i64>;
}

/// `FileClock` backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFilesystem;

impl FileClock for LocalFilesystem {
    fn modified_time(&self, path: &Path) -> Result<i64> {
        let modified = fs::metadata(path)
            .and_then(|metadata| metadata.modified())
            .with_context(|| format!("failed to stat {}", path.display()))?;
        system_time_to_unix(modified)
    }
}

/// Latest modification time across `files`, each resolved against `root`.
/// Returns `None` for an empty list. Any missing file fails the whole call.
pub fn max_modified_time<I, S>(clock: &dyn FileClock, root: &Path, files: I) -> Result<Option<i64>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut latest: Option<i64> = None;
    for file in files {
        let path = root.join(file.as_ref());
        let modified = clock.modified_time(&path)?;
        latest = Some(latest.map_or(modified, |current| current.max(modified)));
    }
    Ok(latest)
}

pub fn system_time_to_unix(time: SystemTime) -> Result<i64> {
    let seconds = time
        .duration_since(UNIX_EPOCH)
        .context("timestamp is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}

pub fn unix_now() -> Result<i64> {
    system_time_to_unix(SystemTime::now())
}

/// Parse a 14-digit MediaWiki timestamp (`YYYYMMDDHHMMSS`, UTC).
pub fn parse_mw_timestamp(value: &str) -> Result<i64> {
    let value = value.trim();
    if value.len() != 14 || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        bail!("not a MediaWiki timestamp: {value:?}");
    }
    let field = |range: std::ops::Range<usize>| -> i64 {
        value[range]
            .bytes()
            .fold(0i64, |acc, byte| acc * 10 + i64::from(byte - b'0'))
    };
    let (year, month, day) = (field(0..4), field(4..6), field(6..8));
    let (hour, minute, second) = (field(8..10), field(10..12), field(12..14));
    if !(1..=12).contains(&month)
        || day < 1
        || day > days_in_month(year, month)
        || hour > 23
        || minute > 59
        || second > 59
    {
        bail!("MediaWiki timestamp out of range: {value}");
    }
    Ok(days_from_civil(year, month, day) * 86_400 + hour * 3_600 + minute * 60 + second)
}

/// Format unix seconds as a 14-digit MediaWiki timestamp (UTC).
pub fn to_mw_timestamp(unix: i64) -> String {
    let (year, month, day, hour, minute, second) = civil_parts(unix);
    format!("{year:04}{month:02}{day:02}{hour:02}{minute:02}{second:02}")
}

/// Format unix seconds as ISO 8601 (`YYYY-MM-DDTHH:MM:SSZ`).
pub fn to_iso8601(unix: i64) -> String {
    let (year, month, day, hour, minute, second) = civil_parts(unix);
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}Z")
}

fn civil_parts(unix: i64) -> (i64, i64, i64, i64, i64, i64) {
    let days = unix.div_euclid(86_400);
    let seconds = unix.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    (
        year,
        month,
        day,
        seconds / 3_600,
        (seconds % 3_600) / 60,
        seconds % 60,
    )
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: i64, month: i64) -> i64 {
    match month {
        2 if is_leap_year(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

// Proleptic Gregorian day arithmetic relative to 1970-01-01.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year.div_euclid(400);
    let year_of_era = year - era * 400;
    let shifted_month = if month > 2 { month - 3 } else { month + 9 };
    let day_of_year = (153 * shifted_month + 2) / 5 + day - 1;
    let day_of_era = year_of_era * 365 + year_of_era / 4 - year_of_era / 100 + day_of_year;
    era * 146_097 + day_of_era - 719_468
}

fn civil_from_days(days: i64) -> (i64, i64, i64) {
    let days = days + 719_468;
    let era = days.div_euclid(146_097);
    let day_of_era = days - era * 146_097;
    let year_of_era =
        (day_of_era - day_of_era / 1_460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let shifted_month = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * shifted_month + 2) / 5 + 1;
    let month = if shifted_month < 10 {
        shifted_month + 3
    } else {
        shifted_month - 9
    };
    let year = year_of_era + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};
    use std::io;
    use std::path::Path;
    use std::time::{Duration, UNIX_EPOCH};

    use tempfile::tempdir;

    use super::{
        LocalFilesystem, max_modified_time, parse_mw_timestamp, to_iso8601, to_mw_timestamp,
    };

    fn touch(path: &Path, unix: u64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        let file = File::create(path).expect("create file");
        file.set_modified(UNIX_EPOCH + Duration::from_secs(unix))
            .expect("set mtime");
    }

    #[test]
    fn max_modified_time_takes_latest_file() {
        let temp = tempdir().expect("tempdir");
        touch(&temp.path().join("a.js"), 1_000);
        touch(&temp.path().join("b/c.css"), 3_000);
        touch(&temp.path().join("d.js"), 3_000);

        let latest = max_modified_time(&LocalFilesystem, temp.path(), ["a.js", "b/c.css", "d.js"])
            .expect("max mtime");
        assert_eq!(latest, Some(3_000));
    }

    #[test]
    fn max_modified_time_of_nothing_is_none() {
        let temp = tempdir().expect("tempdir");
        let latest =
            max_modified_time(&LocalFilesystem, temp.path(), Vec::<String>::new()).expect("empty");
        assert_eq!(latest, None);
    }

    #[test]
    fn missing_file_is_an_error() {
        let temp = tempdir().expect("tempdir");
        touch(&temp.path().join("a.js"), 1_000);

        let error = max_modified_time(&LocalFilesystem, temp.path(), ["a.js", "gone.js"])
            .expect_err("must fail");
        assert!(error.to_string().contains("gone.js"));
        let io_error = error
            .root_cause()
            .downcast_ref::<io::Error>()
            .expect("io error root cause");
        assert_eq!(io_error.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn mw_timestamps_convert_both_ways() {
        assert_eq!(parse_mw_timestamp("20100901000000").expect("parse"), 1_283_299_200);
        assert_eq!(parse_mw_timestamp("20110228134509").expect("parse"), 1_298_900_709);
        assert_eq!(parse_mw_timestamp("20000229235959").expect("parse"), 951_868_799);
        assert_eq!(parse_mw_timestamp("19700101000001").expect("parse"), 1);
        assert_eq!(to_mw_timestamp(1_298_900_709), "20110228134509");
        assert_eq!(to_mw_timestamp(951_868_799), "20000229235959");
        assert_eq!(to_iso8601(1_300_000_000), "2011-03-13T07:06:40Z");
    }

    #[test]
    fn malformed_mw_timestamps_are_rejected() {
        assert!(parse_mw_timestamp("2010-09-01").is_err());
        assert!(parse_mw_timestamp("20100230000000").is_err());
        assert!(parse_mw_timestamp("20101301000000").is_err());
        assert!(parse_mw_timestamp("2010090100000x").is_err());
    }
}
