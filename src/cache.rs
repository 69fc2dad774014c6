use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::errors::AppResult;
use crate::normalize::{is_blank, is_blank_opt};
use crate::table::{open_reader, require_columns, write_atomic};

/// Memoized outcome of resolving one facility.
///
/// A miss is cached too: it keeps its name but has no coordinates or
/// resolved address, which [`is_complete`] reports as not yet resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(rename = "CNES")]
    pub facility_id: String,
    #[serde(rename = "Nome", default)]
    pub name: Option<String>,
    #[serde(rename = "Lat_Google", default)]
    pub latitude: Option<String>,
    #[serde(rename = "Long_Google", default)]
    pub longitude: Option<String>,
    #[serde(rename = "Endereco_Formatado_Google", default)]
    pub resolved_address: Option<String>,
    #[serde(rename = "Tipo_Busca", default)]
    pub strategy: Option<String>,
}

impl CacheEntry {
    pub fn miss(facility_id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            facility_id: facility_id.into(),
            name,
            latitude: None,
            longitude: None,
            resolved_address: None,
            strategy: None,
        }
    }

    pub fn has_coordinates(&self) -> bool {
        !is_blank_opt(self.latitude.as_deref()) && !is_blank_opt(self.longitude.as_deref())
    }
}

/// Usable cache hit: name, both coordinates and the resolved address are all
/// present and non-blank. Partial entries left by an interrupted run fail this
/// check and get resolved again.
pub fn is_complete(entry: &CacheEntry) -> bool {
    [
        entry.name.as_deref(),
        entry.latitude.as_deref(),
        entry.longitude.as_deref(),
        entry.resolved_address.as_deref(),
    ]
    .into_iter()
    .all(|value| !is_blank_opt(value))
}

/// Disk-backed resolution cache keyed by facility id.
pub struct ResolutionCache {
    path: PathBuf,
    delimiter: u8,
    entries: BTreeMap<String, CacheEntry>,
    touched: BTreeSet<String>,
}

impl ResolutionCache {
    /// Loads the cache file, or starts empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>, delimiter: u8) -> AppResult<Self> {
        let path = path.into();
        let entries = read_entries(&path, delimiter)?;
        info!(path = %path.display(), entries = entries.len(), "resolution cache loaded");
        Ok(Self {
            path,
            delimiter,
            entries,
            touched: BTreeSet::new(),
        })
    }

    pub fn lookup(&self, facility_id: &str) -> Option<&CacheEntry> {
        self.entries.get(facility_id)
    }

    /// The entry for `facility_id` when it is a usable hit.
    pub fn complete_entry(&self, facility_id: &str) -> Option<&CacheEntry> {
        self.lookup(facility_id).filter(|entry| is_complete(entry))
    }

    pub fn upsert(&mut self, entry: CacheEntry) {
        trace!(facility_id = %entry.facility_id, "cache upsert");
        self.touched.insert(entry.facility_id.clone());
        self.entries.insert(entry.facility_id.clone(), entry);
    }

    /// Rewrites the cache file with what is on disk now plus the entries
    /// upserted since the last flush, the latter winning on the same id.
    pub fn flush(&mut self) -> AppResult<()> {
        if self.touched.is_empty() && self.path.exists() {
            return Ok(());
        }
        let mut merged = read_entries(&self.path, self.delimiter)?;
        let on_disk = merged.len();
        for key in &self.touched {
            if let Some(entry) = self.entries.get(key) {
                merged.insert(key.clone(), entry.clone());
            }
        }

        write_atomic(&self.path, self.delimiter, |writer| {
            for entry in merged.values() {
                writer.serialize(entry)?;
            }
            if merged.is_empty() {
                writer.write_record(CACHE_HEADERS)?;
            }
            Ok(())
        })?;
        debug!(
            path = %self.path.display(),
            on_disk,
            written = merged.len(),
            "resolution cache flushed"
        );
        self.entries = merged;
        self.touched.clear();
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

const CACHE_HEADERS: [&str; 6] = [
    "CNES",
    "Nome",
    "Lat_Google",
    "Long_Google",
    "Endereco_Formatado_Google",
    "Tipo_Busca",
];

fn read_entries(path: &Path, delimiter: u8) -> AppResult<BTreeMap<String, CacheEntry>> {
    let mut entries = BTreeMap::new();
    if !path.exists() {
        return Ok(entries);
    }
    let mut reader = open_reader(path, delimiter)?;
    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Ok(entries);
    }
    require_columns(path, &headers, &[CACHE_HEADERS[0]])?;
    for row in reader.deserialize::<CacheEntry>() {
        let mut entry = row?;
        if is_blank(&entry.facility_id) {
            continue;
        }
        entry.facility_id = entry.facility_id.trim().to_string();
        entries.insert(entry.facility_id.clone(), entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn resolved(id: &str, lat: &str) -> CacheEntry {
        CacheEntry {
            facility_id: id.into(),
            name: Some("Posto X".into()),
            latitude: Some(lat.into()),
            longitude: Some("-37.05".into()),
            resolved_address: Some("R. A, Aracaju - SE".into()),
            strategy: Some("name+street".into()),
        }
    }

    #[test]
    fn completeness_requires_every_field() {
        assert!(is_complete(&resolved("1", "-10.9")));

        let mut entry = resolved("1", "");
        assert!(!is_complete(&entry));
        entry.latitude = Some("nan".into());
        assert!(!is_complete(&entry));
        entry.latitude = Some("-10.9".into());
        entry.resolved_address = Some("None".into());
        assert!(!is_complete(&entry));
        entry.resolved_address = Some("R. A".into());
        entry.name = None;
        assert!(!is_complete(&entry));
        assert!(!is_complete(&CacheEntry::miss("2", Some("Posto".into()))));
    }

    #[test]
    fn partial_entry_is_not_a_hit() {
        let dir = tempdir().unwrap();
        let mut cache = ResolutionCache::open(dir.path().join("cache.csv"), b';').unwrap();
        cache.upsert(resolved("1", "  "));
        assert!(cache.lookup("1").is_some());
        assert!(cache.complete_entry("1").is_none());
    }

    #[test]
    fn flush_merges_with_entries_written_by_another_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");

        let mut first = ResolutionCache::open(&path, b';').unwrap();
        first.upsert(resolved("1", "-10.1"));
        first.upsert(resolved("2", "-10.2"));
        first.flush().unwrap();

        let mut second = ResolutionCache::open(&path, b';').unwrap();
        let mut other = ResolutionCache::open(&path, b';').unwrap();
        other.upsert(resolved("3", "-10.3"));
        other.flush().unwrap();

        second.upsert(resolved("2", "-20.2"));
        second.flush().unwrap();

        let reloaded = ResolutionCache::open(&path, b';').unwrap();
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.lookup("1").unwrap().latitude.as_deref(), Some("-10.1"));
        assert_eq!(reloaded.lookup("2").unwrap().latitude.as_deref(), Some("-20.2"));
        assert_eq!(reloaded.lookup("3").unwrap().latitude.as_deref(), Some("-10.3"));
    }

    #[test]
    fn cache_without_id_column_lists_found_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        std::fs::write(&path, "id;lat;lng\n1;-10.9;-37.0\n").unwrap();

        match ResolutionCache::open(&path, b';') {
            Err(crate::errors::AppError::MissingColumns { missing, found, .. }) => {
                assert_eq!(missing, vec!["CNES".to_string()]);
                assert_eq!(found, vec!["id", "lat", "lng"]);
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("cache with unknown columns was accepted"),
        }
    }

    #[test]
    fn misses_round_trip_with_empty_cells() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        let mut cache = ResolutionCache::open(&path, b';').unwrap();
        cache.upsert(CacheEntry::miss("7", Some("Posto".into())));
        cache.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "CNES;Nome;Lat_Google;Long_Google;Endereco_Formatado_Google;Tipo_Busca\n7;Posto;;;;\n"
        );
        let reloaded = ResolutionCache::open(&path, b';').unwrap();
        assert_eq!(reloaded.lookup("7"), Some(&CacheEntry::miss("7", Some("Posto".into()))));
    }
}
