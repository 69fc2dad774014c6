//! Preparation steps that turn raw DataSUS extracts into the processed tables
//! the geocoder reads.

use std::path::Path;

use csv::{ByteRecord, StringRecord};
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::AppResult;
use crate::normalize::{clean, decode_field, is_missing_coordinate, normalize_municipality_code};
use crate::source::{Coordinates, FacilityDataset, FacilityRecord};
use crate::table::{column_index, open_reader, require_columns, write_atomic};

const RAW_FACILITY_ID: &str = "CO_CNES";
const RAW_MUNICIPALITY: &str = "CO_IBGE";
const RAW_NAME: &str = "NO_FANTASIA";
const RAW_LATITUDE: &str = "NU_LATITUDE";
const RAW_LONGITUDE: &str = "NU_LONGITUDE";
const RAW_STREET: &str = "NO_LOGRADOURO";
const RAW_NUMBER: &str = "NU_ENDERECO";
const RAW_DISTRICT: &str = "NO_BAIRRO";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FacilityBuildSummary {
    pub facilities: usize,
    pub with_coordinates: usize,
    pub without_municipality: usize,
}

fn decode_record(record: &ByteRecord) -> StringRecord {
    StringRecord::from(record.iter().map(decode_field).collect::<Vec<_>>())
}

fn raw_field(record: &ByteRecord, idx: Option<usize>) -> String {
    idx.and_then(|i| record.get(i))
        .map(decode_field)
        .unwrap_or_default()
}

/// Builds the facility dimension from the CNES establishment extract.
pub fn build_facility_dimension(
    source_path: &Path,
    output_path: &Path,
    source_delimiter: u8,
    output_delimiter: u8,
) -> AppResult<FacilityBuildSummary> {
    let mut reader = open_reader(source_path, source_delimiter)?;
    let headers = decode_record(reader.byte_headers()?);
    let id_idx = require_columns(source_path, &headers, &[RAW_FACILITY_ID])?[0];
    let mun_idx = column_index(&headers, RAW_MUNICIPALITY);
    let name_idx = column_index(&headers, RAW_NAME);
    let lat_idx = column_index(&headers, RAW_LATITUDE);
    let lng_idx = column_index(&headers, RAW_LONGITUDE);
    let street_idx = column_index(&headers, RAW_STREET);
    let number_idx = column_index(&headers, RAW_NUMBER);
    let district_idx = column_index(&headers, RAW_DISTRICT);

    let mut summary = FacilityBuildSummary::default();
    let mut records = Vec::new();
    for row in reader.byte_records() {
        let row = row?;
        let Some(facility_id) = clean(&raw_field(&row, Some(id_idx))) else {
            continue;
        };
        let municipality_id = normalize_municipality_code(&raw_field(&row, mun_idx));
        if municipality_id.is_none() {
            summary.without_municipality += 1;
        }
        records.push(FacilityRecord {
            facility_id,
            name: clean(&raw_field(&row, name_idx)),
            municipality_id,
            street: clean(&raw_field(&row, street_idx)),
            number: clean(&raw_field(&row, number_idx)),
            district: clean(&raw_field(&row, district_idx)),
            coordinates: Coordinates::parse(&raw_field(&row, lat_idx), &raw_field(&row, lng_idx)),
        });
    }

    let dataset = FacilityDataset::from_records(records);
    summary.facilities = dataset.len();
    summary.with_coordinates = dataset.with_coordinates();
    dataset.save(output_path, output_delimiter)?;
    info!(
        output = %output_path.display(),
        facilities = summary.facilities,
        with_coordinates = summary.with_coordinates,
        without_municipality = summary.without_municipality,
        "facility dimension written"
    );
    Ok(summary)
}

/// Copies the rows of `input` matching `keep` to `output`, re-encoded as UTF-8.
fn copy_matching<F>(
    input: &Path,
    output: &Path,
    delimiter: u8,
    columns: &[&str],
    mut keep: F,
) -> AppResult<usize>
where
    F: FnMut(&[String]) -> bool,
{
    let mut reader = open_reader(input, delimiter)?;
    let headers = decode_record(reader.byte_headers()?);
    let indices = require_columns(input, &headers, columns)?;

    let mut kept = Vec::new();
    for row in reader.byte_records() {
        let row = row?;
        let values: Vec<String> = indices.iter().map(|&i| raw_field(&row, Some(i))).collect();
        if keep(&values) {
            kept.push(decode_record(&row));
        }
    }

    write_atomic(output, delimiter, |writer| {
        writer.write_record(&headers)?;
        for row in &kept {
            writer.write_record(row)?;
        }
        Ok(())
    })?;
    Ok(kept.len())
}

/// Keeps the rows whose `column` equals `value`, e.g. `CO_UF == 28`.
pub fn filter_rows(
    input: &Path,
    output: &Path,
    column: &str,
    value: &str,
    delimiter: u8,
) -> AppResult<usize> {
    let wanted = value.trim();
    let kept = copy_matching(input, output, delimiter, &[column], |values| {
        values[0].trim() == wanted
    })?;
    if kept == 0 {
        warn!(column, value = wanted, "no rows matched the filter");
    } else {
        info!(output = %output.display(), rows = kept, column, value = wanted, "rows filtered");
    }
    Ok(kept)
}

/// Keeps the rows lacking either coordinate.
pub fn extract_missing_geolocation(
    input: &Path,
    output: &Path,
    latitude_column: &str,
    longitude_column: &str,
    delimiter: u8,
) -> AppResult<usize> {
    let kept = copy_matching(
        input,
        output,
        delimiter,
        &[latitude_column, longitude_column],
        |values| values.iter().any(|v| is_missing_coordinate(v)),
    )?;
    info!(output = %output.display(), rows = kept, "rows without geolocation extracted");
    Ok(kept)
}
