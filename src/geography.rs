use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::AppResult;
use crate::normalize::{clean, normalize_municipality_code};
use crate::table::{column_index, field, open_reader, require_columns, write_atomic};

const GEOGRAPHY_HEADERS: [&str; 7] = [
    "ID_Municipio",
    "Municipio",
    "Latitude",
    "Longitude",
    "UF",
    "Estado",
    "Regiao",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Municipality {
    pub name: String,
    pub state: Option<String>,
}

impl Municipality {
    /// `"Aracaju - SE"`, or just the city when the state is unknown.
    pub fn locality(&self) -> String {
        match &self.state {
            Some(state) => format!("{} - {}", self.name, state),
            None => self.name.clone(),
        }
    }
}

/// Municipality code to name/state lookup, backed by the geography dimension.
#[derive(Debug, Clone, Default)]
pub struct GeographyTable {
    municipalities: HashMap<String, Municipality>,
}

impl GeographyTable {
    pub fn load(path: &Path, delimiter: u8) -> AppResult<Self> {
        let mut reader = open_reader(path, delimiter)?;
        let headers = reader.headers()?.clone();
        let idx = require_columns(path, &headers, &["ID_Municipio", "Municipio"])?;
        let uf_idx = column_index(&headers, "UF");

        let mut table = Self::default();
        for record in reader.records() {
            let record = record?;
            let Some(code) = normalize_municipality_code(field(&record, Some(idx[0]))) else {
                continue;
            };
            let Some(name) = clean(field(&record, Some(idx[1]))) else {
                continue;
            };
            let state = clean(field(&record, uf_idx));
            table.insert(code, Municipality { name, state });
        }
        debug!(
            path = %path.display(),
            municipalities = table.len(),
            "geography lookup loaded"
        );
        Ok(table)
    }

    pub fn insert(&mut self, code: impl Into<String>, municipality: Municipality) {
        self.municipalities.insert(code.into(), municipality);
    }

    pub fn get(&self, code: &str) -> Option<&Municipality> {
        let code = normalize_municipality_code(code)?;
        self.municipalities.get(&code)
    }

    pub fn len(&self) -> usize {
        self.municipalities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.municipalities.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GeographyBuildSummary {
    pub municipalities: usize,
    pub without_state: usize,
}

/// Joins the IBGE municipality and state tables into the geography dimension.
///
/// Both inputs are comma-delimited and share `codigo_uf`; the output uses
/// `delimiter` and carries the normalized six-digit `ID_Municipio`.
pub fn build_geography_dimension(
    municipalities_path: &Path,
    states_path: &Path,
    output_path: &Path,
    delimiter: u8,
) -> AppResult<GeographyBuildSummary> {
    let mut states_reader = open_reader(states_path, b',')?;
    let state_headers = states_reader.headers()?.clone();
    let state_idx = require_columns(states_path, &state_headers, &["codigo_uf", "uf", "nome"])?;
    let region_idx = column_index(&state_headers, "regiao");

    let mut states: HashMap<String, (String, String, String)> = HashMap::new();
    for record in states_reader.records() {
        let record = record?;
        let key = field(&record, Some(state_idx[0])).trim().to_string();
        states.insert(
            key,
            (
                field(&record, Some(state_idx[1])).trim().to_string(),
                field(&record, Some(state_idx[2])).trim().to_string(),
                field(&record, region_idx).trim().to_string(),
            ),
        );
    }

    let mut mun_reader = open_reader(municipalities_path, b',')?;
    let mun_headers = mun_reader.headers()?.clone();
    let mun_idx = require_columns(
        municipalities_path,
        &mun_headers,
        &["codigo_ibge", "nome", "codigo_uf"],
    )?;
    let lat_idx = column_index(&mun_headers, "latitude");
    let lng_idx = column_index(&mun_headers, "longitude");

    let mut summary = GeographyBuildSummary {
        municipalities: 0,
        without_state: 0,
    };
    let mut rows = Vec::new();
    for record in mun_reader.records() {
        let record = record?;
        let raw_code = field(&record, Some(mun_idx[0]));
        let Some(code) = normalize_municipality_code(raw_code) else {
            warn!(code = raw_code, "skipping municipality with invalid IBGE code");
            continue;
        };
        let uf_key = field(&record, Some(mun_idx[2])).trim();
        let (uf, state_name, region) = match states.get(uf_key) {
            Some(state) => state.clone(),
            None => {
                summary.without_state += 1;
                Default::default()
            }
        };
        rows.push([
            code,
            field(&record, Some(mun_idx[1])).trim().to_string(),
            field(&record, lat_idx).trim().to_string(),
            field(&record, lng_idx).trim().to_string(),
            uf,
            state_name,
            region,
        ]);
    }
    summary.municipalities = rows.len();

    write_atomic(output_path, delimiter, |writer| {
        writer.write_record(GEOGRAPHY_HEADERS)?;
        for row in &rows {
            writer.write_record(row)?;
        }
        Ok(())
    })?;

    info!(
        output = %output_path.display(),
        municipalities = summary.municipalities,
        without_state = summary.without_state,
        "geography dimension written"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_lookup_and_normalizes_codes_on_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Dim_Geografia.csv");
        std::fs::write(
            &path,
            "ID_Municipio;Municipio;UF\n280030;Aracaju;SE\n5300108;Brasília;DF\n123;;XX\n",
        )
        .unwrap();

        let table = GeographyTable::load(&path, b';').unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("2800308").unwrap().locality(), "Aracaju - SE");
        assert_eq!(table.get("530010").unwrap().name, "Brasília");
        assert!(table.get("000123").is_none());
    }

    #[test]
    fn joins_municipalities_with_states() {
        let dir = tempdir().unwrap();
        let municipalities = dir.path().join("municipios.csv");
        let states = dir.path().join("estados.csv");
        let output = dir.path().join("Dim_Geografia.csv");
        std::fs::write(
            &municipalities,
            "codigo_ibge,nome,latitude,longitude,codigo_uf\n2800308,Aracaju,-10.9091,-37.0677,28\n9999999,Lugar,0,0,99\n",
        )
        .unwrap();
        std::fs::write(
            &states,
            "codigo_uf,uf,nome,latitude,longitude,regiao\n28,SE,Sergipe,-10.57,-37.45,Nordeste\n",
        )
        .unwrap();

        let summary =
            build_geography_dimension(&municipalities, &states, &output, b';').unwrap();
        assert_eq!(summary.municipalities, 2);
        assert_eq!(summary.without_state, 1);

        let written = std::fs::read_to_string(&output).unwrap();
        let mut lines = written.lines();
        assert_eq!(
            lines.next().unwrap(),
            "ID_Municipio;Municipio;Latitude;Longitude;UF;Estado;Regiao"
        );
        assert_eq!(
            lines.next().unwrap(),
            "280030;Aracaju;-10.9091;-37.0677;SE;Sergipe;Nordeste"
        );
    }
}
