//! Cache path layout
//!
//! Every cached file lives at
//! `<root>/<model>/<YYYY>/<MM>/<DD>/<HH>00Z/<forecast><ext>` where the date
//! and run hour come from the run's reference time and `<forecast>` is the
//! valid time rendered as `YYYY-MM-DDTHHMM`. The forecast string doubles as
//! the index key, so lexicographic key order is chronological order.
//!
//! Resolution is pure: no filesystem access and no normalization beyond the
//! timestamp rendering. Unparsable timestamps are errors.

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use std::path::{Path, PathBuf};

/// Minute-precision timestamp as published in status documents
const STATUS_TIME_FORMAT: &str = "%Y-%m-%dT%H:%MZ";

/// Index key / file stem format
pub const INDEX_KEY_FORMAT: &str = "%Y-%m-%dT%H%M";

/// Parse a status-document timestamp (`2025-09-11T07:00Z` or RFC 3339)
pub fn parse_status_time(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, STATUS_TIME_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::invalid_timestamp(value, e))
}

/// Parse an index key (`2025-09-11T0700`) back into an instant
pub fn parse_index_key(key: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(key, INDEX_KEY_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::invalid_timestamp(key, e))
}

/// Render an instant as an index key
#[must_use]
pub fn format_index_key(time: DateTime<Utc>) -> String {
    time.format(INDEX_KEY_FORMAT).to_string()
}

/// Index key of a cached file: its file name without extension
#[must_use]
pub fn index_key_for(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(ToString::to_string)
}

/// Resolved location of one forecast file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachePath {
    model_key: String,
    url_suffix: String,
    index_key: String,
}

impl CachePath {
    /// Resolve the cache path for one valid time of one run
    pub fn resolve(
        model_key: &str,
        reference_time: &str,
        valid_time: &str,
        extension: &str,
    ) -> Result<Self> {
        let reference = parse_status_time(reference_time)?;
        let valid = parse_status_time(valid_time)?;

        let index_key = format_index_key(valid);
        let url_suffix = format!(
            "{:04}/{:02}/{:02}/{:02}00Z/{}{}",
            reference.year(),
            reference.month(),
            reference.day(),
            reference.hour(),
            index_key,
            extension
        );

        Ok(Self {
            model_key: model_key.to_string(),
            url_suffix,
            index_key,
        })
    }

    /// Model this file belongs to
    #[must_use]
    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    /// Path relative to the cache root, model directory included
    #[must_use]
    pub fn relative(&self) -> String {
        format!("{}/{}", self.model_key, self.url_suffix)
    }

    /// Path relative to the model's base URL
    #[must_use]
    pub fn url_suffix(&self) -> &str {
        &self.url_suffix
    }

    /// Forecast time string used as the index key
    #[must_use]
    pub fn index_key(&self) -> &str {
        &self.index_key
    }

    /// Remote URL for this file under `base_url`
    #[must_use]
    pub fn source_url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.url_suffix)
    }

    /// Absolute local path under `cache_root`
    #[must_use]
    pub fn local_path(&self, cache_root: &Path) -> PathBuf {
        cache_root.join(&self.model_key).join(&self.url_suffix)
    }
}

/// A relative cache path split back into its segments
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedCachePath {
    pub model_key: String,
    pub year: String,
    pub month: String,
    pub day: String,
    pub run: String,
    pub file_name: String,
    pub index_key: String,
}

impl ParsedCachePath {
    /// Parse `model/YYYY/MM/DD/HH00Z/forecast.ext`
    pub fn parse(relative: &str) -> Result<Self> {
        let trimmed = relative.trim_start_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();
        let [model_key, year, month, day, run, file_name] = segments.as_slice() else {
            return Err(Error::invalid_path(
                relative,
                format!("expected 6 segments, found {}", segments.len()),
            ));
        };

        if model_key.is_empty() || model_key.starts_with('.') {
            return Err(Error::invalid_path(relative, "invalid model segment"));
        }

        let date = match (year.parse::<i32>(), month.parse::<u32>(), day.parse::<u32>()) {
            (Ok(y), Ok(m), Ok(d)) if year.len() == 4 && month.len() == 2 && day.len() == 2 => {
                NaiveDate::from_ymd_opt(y, m, d)
            }
            _ => None,
        };
        if date.is_none() {
            return Err(Error::invalid_path(relative, "invalid date segments"));
        }

        let run_ok = run.len() == 5
            && run.ends_with("00Z")
            && run[..2].parse::<u32>().is_ok_and(|h| h < 24);
        if !run_ok {
            return Err(Error::invalid_path(relative, "invalid run segment"));
        }

        let index_key = index_key_for(Path::new(file_name))
            .ok_or_else(|| Error::invalid_path(relative, "missing file name"))?;
        parse_index_key(&index_key)
            .map_err(|_| Error::invalid_path(relative, "file name is not a forecast time"))?;

        Ok(Self {
            model_key: (*model_key).to_string(),
            year: (*year).to_string(),
            month: (*month).to_string(),
            day: (*day).to_string(),
            run: (*run).to_string(),
            file_name: (*file_name).to_string(),
            index_key,
        })
    }

    /// Path relative to the model's base URL
    #[must_use]
    pub fn url_suffix(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.year, self.month, self.day, self.run, self.file_name
        )
    }

    /// Path relative to the cache root, model directory included
    #[must_use]
    pub fn relative(&self) -> String {
        format!("{}/{}", self.model_key, self.url_suffix())
    }

    /// Whether the file name carries `extension`
    #[must_use]
    pub fn has_extension(&self, extension: &str) -> bool {
        self.file_name.ends_with(extension)
            && self.file_name.len() > extension.len()
    }
}
