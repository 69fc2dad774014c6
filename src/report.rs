use std::path::Path;

use serde::Serialize;

use crate::errors::AppResult;
use crate::normalize::is_missing_coordinate;
use crate::table::{field, open_reader, require_columns};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendencyReport {
    pub total: usize,
    pub with_coordinates: usize,
    pub missing: usize,
    pub percent_missing: f64,
}

impl PendencyReport {
    pub fn from_latitudes<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut total = 0;
        let mut missing = 0;
        for value in values {
            total += 1;
            if is_missing_coordinate(value) {
                missing += 1;
            }
        }
        let percent_missing = if total == 0 {
            0.0
        } else {
            missing as f64 * 100.0 / total as f64
        };
        Self {
            total,
            with_coordinates: total - missing,
            missing,
            percent_missing,
        }
    }
}

/// Counts rows of `path` whose `latitude_column` is missing.
pub fn pendency_report(path: &Path, delimiter: u8, latitude_column: &str) -> AppResult<PendencyReport> {
    let mut reader = open_reader(path, delimiter)?;
    let headers = reader.headers()?.clone();
    let lat_idx = require_columns(path, &headers, &[latitude_column])?[0];
    let rows = reader.records().collect::<Result<Vec<_>, _>>()?;
    Ok(PendencyReport::from_latitudes(
        rows.iter().map(|row| field(row, Some(lat_idx))),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use tempfile::tempdir;

    #[test]
    fn classifies_blank_tokens_as_missing() {
        let report = PendencyReport::from_latitudes(["", "None", "nan", "0", "-10.9"]);
        assert_eq!(report.total, 5);
        assert_eq!(report.missing, 4);
        assert_eq!(report.with_coordinates, 1);
        assert!((report.percent_missing - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_dataset_reports_zero_percent() {
        let report = PendencyReport::from_latitudes(std::iter::empty());
        assert_eq!(report.total, 0);
        assert_eq!(report.percent_missing, 0.0);
    }

    #[test]
    fn reads_the_latitude_column_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("units.csv");
        std::fs::write(
            &path,
            "CNES;Latitude;Longitude\n1;-10.9;-37.0\n2;;\n3;NULL;\n4;-10,8;-37,1\n",
        )
        .unwrap();

        let report = pendency_report(&path, b';', "Latitude").unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.missing, 2);

        let err = pendency_report(&path, b';', "NU_LATITUDE").unwrap_err();
        match err {
            AppError::MissingColumns { missing, found, .. } => {
                assert_eq!(missing, vec!["NU_LATITUDE".to_string()]);
                assert_eq!(found.len(), 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
