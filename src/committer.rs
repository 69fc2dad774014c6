use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::AppResult;
use crate::normalize::is_blank;
use crate::table::{open_reader, require_columns};

/// One newly-resolved facility, as appended to the delta file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRow {
    #[serde(rename = "CNES")]
    pub facility_id: String,
    #[serde(rename = "Latitude_Nova")]
    pub latitude: String,
    #[serde(rename = "Longitude_Nova")]
    pub longitude: String,
    #[serde(rename = "Endereco_Google", default)]
    pub resolved_address: Option<String>,
    #[serde(rename = "Tipo_Busca", default)]
    pub strategy: Option<String>,
}

/// Buffers delta rows and appends them to disk once `batch_size` accumulate.
pub struct BatchCommitter {
    path: PathBuf,
    delimiter: u8,
    batch_size: usize,
    buffer: Vec<DeltaRow>,
    flushes: usize,
    written: usize,
}

impl BatchCommitter {
    pub fn new(path: impl Into<PathBuf>, delimiter: u8, batch_size: usize) -> Self {
        Self {
            path: path.into(),
            delimiter,
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
            flushes: 0,
            written: 0,
        }
    }

    /// Buffers `row`; returns `true` when this call flushed a full batch.
    pub fn record(&mut self, row: DeltaRow) -> AppResult<bool> {
        self.buffer.push(row);
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Appends whatever is buffered. The header is written only when the
    /// file does not exist yet. On error the buffer is kept for a retry.
    pub fn flush(&mut self) -> AppResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let needs_header = !self.path.exists()
            || std::fs::metadata(&self.path)
                .map(|m| m.len() == 0)
                .unwrap_or(true);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = WriterBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(needs_header)
            .from_writer(file);
        for row in &self.buffer {
            writer.serialize(row)?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;

        self.flushes += 1;
        self.written += self.buffer.len();
        debug!(
            path = %self.path.display(),
            rows = self.buffer.len(),
            flushes = self.flushes,
            "delta batch committed"
        );
        self.buffer.clear();
        Ok(())
    }

    /// Flushes the remainder at the end of a run.
    pub fn finish(&mut self) -> AppResult<()> {
        self.flush()?;
        info!(
            path = %self.path.display(),
            rows = self.written,
            flushes = self.flushes,
            "delta file up to date"
        );
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

const DELTA_REQUIRED_COLUMNS: [&str; 3] = ["CNES", "Latitude_Nova", "Longitude_Nova"];

/// Reads a delta file in order. Duplicate ids are all returned; callers
/// wanting one row per facility keep the last.
pub fn read_delta(path: &Path, delimiter: u8) -> AppResult<Vec<DeltaRow>> {
    let mut reader = open_reader(path, delimiter)?;
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    if headers.is_empty() {
        return Ok(rows);
    }
    require_columns(path, &headers, &DELTA_REQUIRED_COLUMNS)?;
    for row in reader.deserialize::<DeltaRow>() {
        let mut row = row?;
        if is_blank(&row.facility_id) {
            continue;
        }
        row.facility_id = row.facility_id.trim().to_string();
        rows.push(row);
    }
    Ok(rows)
}

/// Facility ids already delivered to the delta file by earlier runs.
pub fn delivered_ids(path: &Path, delimiter: u8) -> AppResult<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    Ok(read_delta(path, delimiter)?
        .into_iter()
        .map(|row| row.facility_id)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use tempfile::tempdir;

    fn row(id: usize) -> DeltaRow {
        DeltaRow {
            facility_id: format!("{id:07}"),
            latitude: "-10.9".into(),
            longitude: "-37.0".into(),
            resolved_address: Some("Aracaju, SE".into()),
            strategy: Some("name+street".into()),
        }
    }

    #[test]
    fn flushes_full_batches_and_the_remainder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("delta.csv");
        let mut committer = BatchCommitter::new(&path, b';', 50);

        let mut flushed_during_run = 0;
        for id in 0..120 {
            if committer.record(row(id)).unwrap() {
                flushed_during_run += 1;
            }
        }
        assert_eq!(flushed_during_run, 2);
        assert_eq!(committer.pending(), 20);
        committer.finish().unwrap();

        assert_eq!(committer.flush_count(), 3);
        let rows = read_delta(&path, b';').unwrap();
        assert_eq!(rows.len(), 120);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("CNES;Latitude_Nova").count(), 1);
    }

    #[test]
    fn appends_to_an_existing_file_without_repeating_the_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("delta.csv");

        let mut first = BatchCommitter::new(&path, b';', 10);
        first.record(row(1)).unwrap();
        first.finish().unwrap();

        let mut second = BatchCommitter::new(&path, b';', 10);
        second.record(row(2)).unwrap();
        second.finish().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert_eq!(
            delivered_ids(&path, b';').unwrap(),
            HashSet::from(["0000001".to_string(), "0000002".to_string()])
        );
    }

    #[test]
    fn delta_with_unknown_headers_lists_found_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("delta.csv");
        std::fs::write(&path, "cnes;lat;lng\n1;-10.9;-37.0\n").unwrap();

        match read_delta(&path, b';').unwrap_err() {
            AppError::MissingColumns { missing, found, .. } => {
                assert_eq!(missing, DELTA_REQUIRED_COLUMNS.map(String::from).to_vec());
                assert_eq!(found, vec!["cnes", "lat", "lng"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            delivered_ids(&path, b';'),
            Err(AppError::MissingColumns { .. })
        ));
    }

    #[test]
    fn finishing_an_empty_run_creates_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("delta.csv");
        let mut committer = BatchCommitter::new(&path, b';', 10);
        committer.finish().unwrap();
        assert_eq!(committer.flush_count(), 0);
        assert!(!path.exists());
    }
}
