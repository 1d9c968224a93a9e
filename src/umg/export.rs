//! Daily CSV export of readings

use super::client::Reading;
use anyhow::{Context, Result};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

pub const CSV_PREFIX: &str = "umg_readings_";

pub fn daily_file_name(date: chrono::NaiveDate) -> String {
    format!("{}{}.csv", CSV_PREFIX, date.format("%Y-%m-%d"))
}

/// Appends readings to `umg_readings_<date>.csv` inside `dir`
#[derive(Debug, Clone)]
pub struct CsvExporter {
    dir: PathBuf,
}

impl CsvExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Append `reading` to its day's file, writing the header for a new file.
    /// An existing file keeps its own column order; unknown columns are dropped.
    pub fn export(&self, reading: &Reading) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self
            .dir
            .join(daily_file_name(reading.timestamp.date_naive()));

        let existing_header = read_header(&path)?;
        let cells = reading.cells();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        match existing_header {
            Some(header) => {
                let by_name: HashMap<&str, &str> = cells
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                let dropped: Vec<&str> = cells
                    .iter()
                    .map(|(k, _)| k.as_str())
                    .filter(|k| !header.iter().any(|h| h == k))
                    .collect();
                if !dropped.is_empty() {
                    tracing::warn!(
                        "{} has no columns for {:?}; values not exported",
                        path.display(),
                        dropped
                    );
                }
                let row: Vec<&str> = header
                    .iter()
                    .map(|h| by_name.get(h.as_str()).copied().unwrap_or(""))
                    .collect();
                writer.write_record(&row)?;
            }
            None => {
                writer.write_record(cells.iter().map(|(k, _)| k.as_str()))?;
                writer.write_record(cells.iter().map(|(_, v)| v.as_str()))?;
            }
        }
        writer
            .flush()
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

fn read_header(path: &Path) -> Result<Option<Vec<String>>> {
    if !path.exists() || fs::metadata(path)?.len() == 0 {
        return Ok(None);
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let header = reader
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?;
    Ok(Some(header.iter().map(str::to_string).collect()))
}

/// Last row of the newest export file
#[derive(Debug, Clone, PartialEq)]
pub struct LatestReading {
    pub path: PathBuf,
    pub cells: Vec<(String, String)>,
}

impl LatestReading {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(k, _)| k == column)
            .map(|(_, v)| v.as_str())
    }
}

impl Serialize for LatestReading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("file", &self.path.display().to_string())?;
        map.serialize_entry("row", &OrderedCells(&self.cells))?;
        map.end()
    }
}

struct OrderedCells<'a>(&'a [(String, String)]);

impl Serialize for OrderedCells<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Newest `umg_readings_*.csv` in `dir` and its last row
pub fn latest_reading(dir: &Path) -> Result<Option<LatestReading>> {
    let pattern = dir.join(format!("{}*.csv", CSV_PREFIX));
    let pattern = pattern.to_string_lossy();
    let mut files: Vec<PathBuf> = glob::glob(&pattern)
        .with_context(|| format!("Invalid export pattern: {}", pattern))?
        .filter_map(|entry| entry.ok())
        .collect();
    files.sort();

    let Some(latest) = files.pop() else {
        return Ok(None);
    };

    let mut reader = match csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(&latest)
    {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!("Could not open {}: {}", latest.display(), e);
            return Ok(None);
        }
    };
    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut last = None;
    for record in reader.records() {
        match record {
            Ok(record) => last = Some(record),
            Err(e) => tracing::warn!("Skipping unreadable row in {}: {}", latest.display(), e),
        }
    }

    Ok(last.map(|record| LatestReading {
        path: latest.clone(),
        cells: header
            .iter()
            .cloned()
            .zip(record.iter().map(str::to_string))
            .collect(),
    }))
}
