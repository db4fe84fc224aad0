use anyhow::{anyhow, bail, Context, Result};
use chrono::{Datelike, NaiveDate};
use log::{debug, info};
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    path::{Path, PathBuf},
    sync::OnceLock,
};

/// Spatial window of a crop, as row/column indices into the source raster grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocationKey {
    pub nij: i64,
    pub wij: i64,
}

/// One per-date, per-window crop listed in the metadata table
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub sample_path: PathBuf,
    pub date: NaiveDate,
    pub year: i32,
    pub doy: u16,
    pub nij: i64,
    pub wij: i64,
    pub il: i64,
    pub jl: i64,
}

impl SampleRecord {
    pub fn location(&self) -> LocationKey {
        LocationKey {
            nij: self.nij,
            wij: self.wij,
        }
    }
}

// Columns are read as text so rows without a sample path can be dropped
// before their other fields are validated.
#[derive(Debug, Deserialize)]
struct RawRow {
    sample_path: Option<String>,
    #[serde(rename = "Date", default)]
    date: String,
    #[serde(rename = "Nij", default)]
    nij: String,
    #[serde(rename = "Wij", default)]
    wij: String,
    #[serde(default)]
    il: String,
    #[serde(default)]
    jl: String,
}

fn date_regex() -> &'static Regex {
    static DATE_RE: OnceLock<Regex> = OnceLock::new();
    DATE_RE.get_or_init(|| {
        Regex::new(r"^(\d{4})-?(\d{2})-?(\d{2})(?:\.0+|[ T].*)?$").expect("date pattern is valid")
    })
}

/// Parse an acquisition date written as `YYYYMMDD` or `YYYY-MM-DD`, with an
/// optional time part. `YYYYMMDD.0` is accepted, as written by dataframe
/// exports of a date column holding nulls.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    let s = s.trim();
    let caps = date_regex()
        .captures(s)
        .ok_or_else(|| anyhow!("Unrecognised date format: {:?}", s))?;

    let year: i32 = caps[1].parse()?;
    let month: u32 = caps[2].parse()?;
    let day: u32 = caps[3].parse()?;

    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| anyhow!("Invalid calendar date: {:?}", s))
}

/// Parse an integer column, accepting integral float notation such as `3.0`
fn parse_index(column: &str, value: &str, line: usize) -> Result<i64> {
    let value = value.trim();
    if let Ok(v) = value.parse::<i64>() {
        return Ok(v);
    }
    match value.parse::<f64>() {
        // i64::MAX as f64 rounds up to 2^63, hence the strict upper bound
        Ok(v) if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 => Ok(v as i64),
        _ => bail!("Line {}: column {} is not an integer: {:?}", line, column, value),
    }
}

/// Load the crop metadata table, dropping rows without a sample path and
/// deriving day-of-year and year from the acquisition date.
///
/// Row order is preserved. Relative sample paths are resolved against the
/// directory containing the table.
pub fn load_sample_table(path: &Path) -> Result<Vec<SampleRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open metadata table {:?}", path))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
    let mut reader = csv::Reader::from_reader(file);

    let mut records = Vec::new();
    let mut dropped = 0usize;

    for (idx, row) in reader.deserialize::<RawRow>().enumerate() {
        // header is line 1
        let line = idx + 2;
        let row = row.with_context(|| format!("Failed to parse line {} of {:?}", line, path))?;

        let sample_path = match row.sample_path.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() && p != "nan" => PathBuf::from(p),
            _ => {
                dropped += 1;
                continue;
            }
        };

        let date = parse_date(&row.date).with_context(|| format!("Line {} of {:?}", line, path))?;

        records.push(SampleRecord {
            sample_path: if sample_path.is_absolute() {
                sample_path
            } else {
                base_dir.join(sample_path)
            },
            date,
            year: date.year(),
            doy: date.ordinal() as u16,
            nij: parse_index("Nij", &row.nij, line)?,
            wij: parse_index("Wij", &row.wij, line)?,
            il: parse_index("il", &row.il, line)?,
            jl: parse_index("jl", &row.jl, line)?,
        });
    }

    info!("Loaded {} samples from {:?}", records.len(), path);
    if dropped > 0 {
        debug!("Dropped {} rows without a sample path", dropped);
    }
    Ok(records)
}

/// Distinct years in ascending order
pub fn years(records: &[SampleRecord]) -> Vec<i32> {
    records
        .iter()
        .map(|r| r.year)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Indices of the records of `year`, grouped by window. Keys are ascending
/// and indices within a group keep table order.
pub fn group_by_location(records: &[SampleRecord], year: i32) -> BTreeMap<LocationKey, Vec<usize>> {
    let mut groups: BTreeMap<LocationKey, Vec<usize>> = BTreeMap::new();
    for (idx, record) in records.iter().enumerate().filter(|(_, r)| r.year == year) {
        groups.entry(record.location()).or_default().push(idx);
    }
    groups
}
