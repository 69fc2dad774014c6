use std::collections::HashMap;
use std::path::Path;

use csv::StringRecord;
use serde::Serialize;
use tracing::info;

use crate::committer::read_delta;
use crate::errors::{AppError, AppResult};
use crate::normalize::is_missing_coordinate;
use crate::source::{FACILITY_ID_COLUMN, LATITUDE_COLUMN, LONGITUDE_COLUMN};
use crate::table::{open_reader, require_columns, write_atomic};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub rows: usize,
    pub filled_before: usize,
    pub filled_after: usize,
}

impl MergeReport {
    pub fn increment(&self) -> usize {
        self.filled_after.saturating_sub(self.filled_before)
    }
}

/// Fills blank coordinates of the master dataset from the delta file.
///
/// Rows are matched on the facility id; a coordinate that is already present
/// in the master file is never replaced. Every other column is written back
/// untouched.
pub fn apply_updates(master_path: &Path, delta_path: &Path, delimiter: u8) -> AppResult<MergeReport> {
    if !delta_path.exists() {
        return Err(AppError::MissingInput(delta_path.to_path_buf()));
    }
    let mut updates: HashMap<String, (String, String)> = HashMap::new();
    for row in read_delta(delta_path, delimiter)? {
        updates.insert(row.facility_id, (row.latitude, row.longitude));
    }
    info!(
        master = %master_path.display(),
        delta = %delta_path.display(),
        updates = updates.len(),
        "merging new coordinates"
    );
    let report = fill_missing_coordinates(master_path, &updates, delimiter)?;
    info!(
        before = report.filled_before,
        after = report.filled_after,
        increment = report.increment(),
        "master dataset updated"
    );
    Ok(report)
}

/// Rewrites `master_path` filling each blank latitude or longitude cell from
/// `updates` (facility id to latitude/longitude text). Present cells, extra
/// columns and rows the loader would skip are kept as they are.
pub fn fill_missing_coordinates(
    master_path: &Path,
    updates: &HashMap<String, (String, String)>,
    delimiter: u8,
) -> AppResult<MergeReport> {
    let mut reader = open_reader(master_path, delimiter)?;
    let headers = reader.headers()?.clone();
    let idx = require_columns(
        master_path,
        &headers,
        &[FACILITY_ID_COLUMN, LATITUDE_COLUMN, LONGITUDE_COLUMN],
    )?;
    let (id_idx, lat_idx, lng_idx) = (idx[0], idx[1], idx[2]);
    let rows = reader.records().collect::<Result<Vec<_>, _>>()?;

    let mut report = MergeReport {
        rows: rows.len(),
        filled_before: 0,
        filled_after: 0,
    };
    let mut merged = Vec::with_capacity(rows.len());
    for row in rows {
        let mut fields: Vec<String> = row.iter().map(str::to_string).collect();
        if fields.len() < headers.len() {
            fields.resize(headers.len(), String::new());
        }
        if !is_missing_coordinate(&fields[lat_idx]) {
            report.filled_before += 1;
        }
        if let Some((lat, lng)) = updates.get(fields[id_idx].trim()) {
            if is_missing_coordinate(&fields[lat_idx]) && !is_missing_coordinate(lat) {
                fields[lat_idx] = lat.clone();
            }
            if is_missing_coordinate(&fields[lng_idx]) && !is_missing_coordinate(lng) {
                fields[lng_idx] = lng.clone();
            }
        }
        if !is_missing_coordinate(&fields[lat_idx]) {
            report.filled_after += 1;
        }
        merged.push(StringRecord::from(fields));
    }

    write_atomic(master_path, delimiter, |writer| {
        writer.write_record(&headers)?;
        for row in &merged {
            writer.write_record(row)?;
        }
        Ok(())
    })?;
    Ok(report)
}
