//! Path codec for per-second reading files.
//!
//! A file for the second starting at `2025-01-01T14:30:22Z` lives at
//! `2025/01/Week_1/01/143022.csv` below the storage root. Week-of-month is
//! `(day - 1) / 7 + 1`, so days 1-7 are week 1 and days 29-31 are week 5.
//!
//! [`ReadingPath::parse`] is the only way client-supplied names reach the filesystem;
//! anything that is not exactly this shape (absolute paths, `..`, extra components,
//! inconsistent week) is rejected.

use crate::error::{AppResult, DaqError};
use crate::measurement::truncate_to_second;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};

/// File extension of second files.
pub const EXTENSION: &str = "csv";

/// Location of one second file, relative to the storage root.
///
/// Ordering follows time, which is also the lexical order of the rendered path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadingPath {
    second: DateTime<Utc>,
}

impl ReadingPath {
    /// Path of the file holding the second that contains `ts`.
    pub fn for_second(ts: DateTime<Utc>) -> Self {
        Self {
            second: truncate_to_second(ts),
        }
    }

    /// Parse a relative path such as `2025/01/Week_1/01/143022.csv`.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let invalid = || DaqError::InvalidPath(raw.to_string());
        let parts: Vec<&str> = raw.split('/').collect();
        let [year, month, week, day, file] = parts.as_slice() else {
            return Err(invalid());
        };
        let stem = file
            .strip_suffix(".csv")
            .filter(|s| s.len() == 6 && is_digits(s))
            .ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 || day.len() != 2 {
            return Err(invalid());
        }
        if !(is_digits(year) && is_digits(month) && is_digits(day)) {
            return Err(invalid());
        }
        let week: u32 = week
            .strip_prefix("Week_")
            .filter(|w| w.len() == 1 && is_digits(w))
            .and_then(|w| w.parse().ok())
            .ok_or_else(invalid)?;

        let number = |s: &str| s.parse::<u32>().map_err(|_| invalid());
        let date = NaiveDate::from_ymd_opt(number(*year)? as i32, number(*month)?, number(*day)?)
            .ok_or_else(invalid)?;
        if week_of_month(date.day()) != week {
            return Err(invalid());
        }
        let time = NaiveTime::from_hms_opt(
            number(&stem[0..2])?,
            number(&stem[2..4])?,
            number(&stem[4..6])?,
        )
        .ok_or_else(invalid)?;
        Ok(Self {
            second: Utc.from_utc_datetime(&date.and_time(time)),
        })
    }

    /// Parse a path relative to `root`, e.g. one found while walking the store.
    pub fn from_relative(root: &Path, path: &Path) -> AppResult<Self> {
        let relative = path
            .strip_prefix(root)
            .map_err(|_| DaqError::InvalidPath(path.display().to_string()))?;
        let joined: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Self::parse(&joined.join("/"))
    }

    /// Start of the second this file holds.
    pub fn second(&self) -> DateTime<Utc> {
        self.second
    }

    /// Week-of-month directory number (1..=5).
    pub fn week(&self) -> u32 {
        week_of_month(self.second.day())
    }

    /// `YYYY` directory name.
    pub fn year_dir(&self) -> String {
        format!("{:04}", self.second.year())
    }

    /// `MM` directory name.
    pub fn month_dir(&self) -> String {
        format!("{:02}", self.second.month())
    }

    /// `Week_N` directory name.
    pub fn week_dir(&self) -> String {
        format!("Week_{}", self.week())
    }

    /// `DD` directory name.
    pub fn day_dir(&self) -> String {
        format!("{:02}", self.second.day())
    }

    /// `HHMMSS.csv` file name.
    pub fn file_name(&self) -> String {
        format!(
            "{:02}{:02}{:02}.{EXTENSION}",
            self.second.hour(),
            self.second.minute(),
            self.second.second()
        )
    }

    /// Absolute location below `root`.
    pub fn under(&self, root: &Path) -> PathBuf {
        root.join(self.year_dir())
            .join(self.month_dir())
            .join(self.week_dir())
            .join(self.day_dir())
            .join(self.file_name())
    }
}

impl fmt::Display for ReadingPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.year_dir(),
            self.month_dir(),
            self.week_dir(),
            self.day_dir(),
            self.file_name()
        )
    }
}

impl Serialize for ReadingPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Week-of-month for a 1-based day.
pub fn week_of_month(day: u32) -> u32 {
    (day.max(1) - 1) / 7 + 1
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn renders_hierarchical_path() {
        let path = ReadingPath::for_second(at(2025, 1, 1, 14, 30, 22) + TimeDelta::milliseconds(999));
        assert_eq!(path.to_string(), "2025/01/Week_1/01/143022.csv");
        assert_eq!(
            path.under(Path::new("/data")),
            PathBuf::from("/data/2025/01/Week_1/01/143022.csv")
        );
    }

    #[test]
    fn week_boundaries() {
        assert_eq!(week_of_month(1), 1);
        assert_eq!(week_of_month(7), 1);
        assert_eq!(week_of_month(8), 2);
        assert_eq!(week_of_month(28), 4);
        assert_eq!(week_of_month(29), 5);
        assert_eq!(week_of_month(31), 5);
    }

    #[test]
    fn parse_accepts_rendered_form() {
        let path = ReadingPath::for_second(at(2024, 2, 29, 23, 59, 59));
        assert_eq!(path.to_string(), "2024/02/Week_5/29/235959.csv");
        assert_eq!(ReadingPath::parse(&path.to_string()).unwrap(), path);
    }

    #[test]
    fn parse_rejects_malformed_names() {
        for bad in [
            "",
            "143022.csv",
            "../2025/01/Week_1/01/143022.csv",
            "/2025/01/Week_1/01/143022.csv",
            "2025/01/Week_1/01/../143022.csv",
            "2025/01/Week_2/01/143022.csv",
            "2025/13/Week_1/01/143022.csv",
            "2025/02/Week_5/30/000000.csv",
            "2025/01/Week_1/01/246000.csv",
            "2025/01/Week_1/01/143022.txt",
            "2025/1/Week_1/01/143022.csv",
            "2025/01/Week_1/01/14302.csv",
            "2025/01/Week_1/01/+43022.csv",
        ] {
            assert!(
                matches!(ReadingPath::parse(bad), Err(DaqError::InvalidPath(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn ordering_follows_time() {
        let a = ReadingPath::for_second(at(2025, 1, 7, 23, 59, 59));
        let b = ReadingPath::for_second(at(2025, 1, 8, 0, 0, 0));
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn relative_to_root() {
        let root = Path::new("/srv/readings");
        let file = root.join("2025/03/Week_3/15/080000.csv");
        let path = ReadingPath::from_relative(root, &file).unwrap();
        assert_eq!(path.second(), at(2025, 3, 15, 8, 0, 0));
        assert!(ReadingPath::from_relative(root, Path::new("/elsewhere/x.csv")).is_err());
    }

    #[test]
    fn serializes_as_string() {
        let path = ReadingPath::for_second(at(2025, 1, 1, 0, 0, 0));
        assert_eq!(
            serde_json::to_string(&path).unwrap(),
            "\"2025/01/Week_1/01/000000.csv\""
        );
    }
}
