use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::normalize::{clean, format_coordinate, normalize_municipality_code, parse_coordinate};
use crate::table::{column_index, field, open_reader, require_columns, write_atomic};

pub const FACILITY_ID_COLUMN: &str = "CNES";
pub const MUNICIPALITY_COLUMN: &str = "ID_Municipio";
pub const NAME_COLUMN: &str = "Nome_Unidade";
pub const LATITUDE_COLUMN: &str = "Latitude";
pub const LONGITUDE_COLUMN: &str = "Longitude";
pub const STREET_COLUMN: &str = "Rua";
pub const NUMBER_COLUMN: &str = "Numero";
pub const DISTRICT_COLUMN: &str = "Bairro";

pub const FACILITY_HEADERS: [&str; 8] = [
    FACILITY_ID_COLUMN,
    MUNICIPALITY_COLUMN,
    NAME_COLUMN,
    LATITUDE_COLUMN,
    LONGITUDE_COLUMN,
    STREET_COLUMN,
    NUMBER_COLUMN,
    DISTRICT_COLUMN,
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// Both halves must parse and be non-zero, otherwise the pair is missing.
    pub fn parse(latitude: &str, longitude: &str) -> Option<Self> {
        Some(Self {
            latitude: parse_coordinate(latitude)?,
            longitude: parse_coordinate(longitude)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FacilityRecord {
    pub facility_id: String,
    pub name: Option<String>,
    pub municipality_id: Option<String>,
    pub street: Option<String>,
    pub number: Option<String>,
    pub district: Option<String>,
    pub coordinates: Option<Coordinates>,
}

impl FacilityRecord {
    pub fn new(facility_id: impl Into<String>) -> Self {
        Self {
            facility_id: facility_id.into(),
            ..Self::default()
        }
    }

    pub fn has_coordinates(&self) -> bool {
        self.coordinates.is_some()
    }

    fn to_row(&self) -> [String; 8] {
        let (lat, lng) = match self.coordinates {
            Some(c) => (format_coordinate(c.latitude), format_coordinate(c.longitude)),
            None => (String::new(), String::new()),
        };
        [
            self.facility_id.clone(),
            self.municipality_id.clone().unwrap_or_default(),
            self.name.clone().unwrap_or_default(),
            lat,
            lng,
            self.street.clone().unwrap_or_default(),
            self.number.clone().unwrap_or_default(),
            self.district.clone().unwrap_or_default(),
        ]
    }
}

/// The authoritative facility table, kept in file order with an id index.
#[derive(Debug, Clone, Default)]
pub struct FacilityDataset {
    records: Vec<FacilityRecord>,
    index: HashMap<String, usize>,
}

impl FacilityDataset {
    pub fn from_records(records: Vec<FacilityRecord>) -> Self {
        let mut dataset = Self::default();
        for record in records {
            dataset.push(record);
        }
        dataset
    }

    pub fn load(path: &Path, delimiter: u8) -> AppResult<Self> {
        let mut reader = open_reader(path, delimiter)?;
        let headers = reader.headers()?.clone();
        let id_idx = require_columns(path, &headers, &[FACILITY_ID_COLUMN])?[0];
        let mun_idx = column_index(&headers, MUNICIPALITY_COLUMN);
        let name_idx = column_index(&headers, NAME_COLUMN);
        let lat_idx = column_index(&headers, LATITUDE_COLUMN);
        let lng_idx = column_index(&headers, LONGITUDE_COLUMN);
        let street_idx = column_index(&headers, STREET_COLUMN);
        let number_idx = column_index(&headers, NUMBER_COLUMN);
        let district_idx = column_index(&headers, DISTRICT_COLUMN);

        let mut dataset = Self::default();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let Some(facility_id) = clean(field(&record, Some(id_idx))) else {
                warn!(line = line + 2, "skipping row without facility id");
                continue;
            };
            dataset.push(FacilityRecord {
                facility_id,
                name: clean(field(&record, name_idx)),
                municipality_id: normalize_municipality_code(field(&record, mun_idx)),
                street: clean(field(&record, street_idx)),
                number: clean(field(&record, number_idx)),
                district: clean(field(&record, district_idx)),
                coordinates: Coordinates::parse(
                    field(&record, lat_idx),
                    field(&record, lng_idx),
                ),
            });
        }
        debug!(path = %path.display(), rows = dataset.len(), "facility dataset loaded");
        Ok(dataset)
    }

    pub fn save(&self, path: &Path, delimiter: u8) -> AppResult<()> {
        write_atomic(path, delimiter, |writer| {
            writer.write_record(FACILITY_HEADERS)?;
            for record in &self.records {
                writer.write_record(record.to_row())?;
            }
            Ok(())
        })
    }

    /// Later duplicates replace earlier rows so the id stays unique.
    fn push(&mut self, record: FacilityRecord) {
        match self.index.get(&record.facility_id) {
            Some(&idx) => {
                warn!(facility_id = %record.facility_id, "duplicate facility id; keeping last row");
                self.records[idx] = record;
            }
            None => {
                self.index
                    .insert(record.facility_id.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    pub fn get(&self, facility_id: &str) -> Option<&FacilityRecord> {
        self.index.get(facility_id).map(|&idx| &self.records[idx])
    }

    pub fn set_coordinates(
        &mut self,
        facility_id: &str,
        coordinates: Coordinates,
    ) -> AppResult<()> {
        let idx = *self
            .index
            .get(facility_id)
            .ok_or_else(|| AppError::Config(format!("unknown facility id {facility_id}")))?;
        self.records[idx].coordinates = Some(coordinates);
        Ok(())
    }

    pub fn records(&self) -> &[FacilityRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &FacilityRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn with_coordinates(&self) -> usize {
        self.records.iter().filter(|r| r.has_coordinates()).count()
    }
}
