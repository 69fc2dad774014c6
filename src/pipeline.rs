use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::cache::ResolutionCache;
use crate::committer::{delivered_ids, BatchCommitter, DeltaRow};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geography::GeographyTable;
use crate::merge::fill_missing_coordinates;
use crate::normalize::format_coordinate;
use crate::provider::GeocodeClient;
use crate::resolver::{FallbackResolver, ResolutionSource};
use crate::source::FacilityDataset;

#[derive(Debug, Clone)]
pub struct GeocodeProgress {
    pub facility_id: String,
    pub total: usize,
    pub processed: usize,
    pub resolved: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total_facilities: usize,
    pub already_delivered: usize,
    pub pending: usize,
    pub cache_hits: usize,
    pub provider_queries: usize,
    pub resolved: usize,
    pub misses: usize,
    pub unresolvable: usize,
    pub delta_flushes: usize,
    pub delta_rows: usize,
}

/// Loads geography and cache and wires them to the configured provider.
pub fn build_resolver(config: &AppConfig) -> AppResult<FallbackResolver> {
    let geography = GeographyTable::load(&config.geography_path, config.delimiter)?;
    let cache = ResolutionCache::open(&config.cache_path, config.delimiter)?;
    let client = GeocodeClient::from_config(config)?;
    info!(
        provider = client.provider_name(),
        municipalities = geography.len(),
        cached = cache.len(),
        "resolver ready"
    );
    Ok(FallbackResolver::new(
        client,
        cache,
        geography,
        config.country_name.clone(),
    ))
}

/// One geocoding run over the master dataset.
pub struct GeocodePipeline {
    config: AppConfig,
    dataset: FacilityDataset,
    pending: Vec<String>,
    already_delivered: usize,
}

impl GeocodePipeline {
    /// Reads the master dataset and selects the facilities still lacking
    /// coordinates that no earlier run has delivered to the delta file.
    pub fn load(config: &AppConfig) -> AppResult<Self> {
        if !config.input_path.exists() {
            return Err(AppError::MissingInput(config.input_path.clone()));
        }
        let dataset = FacilityDataset::load(&config.input_path, config.delimiter)?;
        let delivered = delivered_ids(&config.output_path, config.delimiter)?;
        Ok(Self::with_dataset(config.clone(), dataset, &delivered))
    }

    pub fn with_dataset(
        config: AppConfig,
        dataset: FacilityDataset,
        delivered: &HashSet<String>,
    ) -> Self {
        let mut already_delivered = 0;
        let mut pending = Vec::new();
        for record in dataset.iter().filter(|r| !r.has_coordinates()) {
            if delivered.contains(&record.facility_id) {
                already_delivered += 1;
            } else {
                pending.push(record.facility_id.clone());
            }
        }
        info!(
            total = dataset.len(),
            with_coordinates = dataset.with_coordinates(),
            already_delivered,
            pending = pending.len(),
            "pending facilities selected"
        );
        Self {
            config,
            dataset,
            pending,
            already_delivered,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn exceeds_cost_threshold(&self) -> bool {
        self.pending.len() > self.config.cost_warning_threshold
    }

    pub fn dataset(&self) -> &FacilityDataset {
        &self.dataset
    }

    pub async fn run(
        &mut self,
        resolver: &mut FallbackResolver,
        observer: Option<Arc<dyn Fn(GeocodeProgress) + Send + Sync>>,
    ) -> AppResult<RunSummary> {
        let mut summary = RunSummary {
            total_facilities: self.dataset.len(),
            already_delivered: self.already_delivered,
            pending: self.pending.len(),
            ..RunSummary::default()
        };
        if self.pending.is_empty() {
            info!("nothing to geocode");
            return Ok(summary);
        }
        if self.exceeds_cost_threshold() {
            warn!(
                pending = self.pending.len(),
                threshold = self.config.cost_warning_threshold,
                provider = resolver.provider_name(),
                "large run; provider quota or billing may apply"
            );
        }

        let mut committer = BatchCommitter::new(
            &self.config.output_path,
            self.config.delimiter,
            self.config.batch_size,
        );
        let pending = std::mem::take(&mut self.pending);
        let total = pending.len();
        let mut found: HashMap<String, (String, String)> = HashMap::new();
        for (processed, facility_id) in pending.iter().enumerate() {
            let Some(record) = self.dataset.get(facility_id).cloned() else {
                continue;
            };
            let resolution = resolver.resolve_facility(&record).await;
            summary.provider_queries += resolution.queries;
            match resolution.source {
                ResolutionSource::Cache => summary.cache_hits += 1,
                ResolutionSource::Miss => summary.misses += 1,
                ResolutionSource::Unresolvable => summary.unresolvable += 1,
                ResolutionSource::Provider => {}
            }

            if let Some(coordinates) = resolution.coordinates() {
                summary.resolved += 1;
                self.dataset.set_coordinates(facility_id, coordinates)?;
                let latitude = format_coordinate(coordinates.latitude);
                let longitude = format_coordinate(coordinates.longitude);
                found.insert(facility_id.clone(), (latitude.clone(), longitude.clone()));
                let flushed = committer.record(DeltaRow {
                    facility_id: facility_id.clone(),
                    latitude,
                    longitude,
                    resolved_address: resolution.entry.resolved_address.clone(),
                    strategy: resolution.entry.strategy.clone(),
                })?;
                if flushed {
                    self.checkpoint(resolver, &found)?;
                }
            }

            if let Some(callback) = &observer {
                callback(GeocodeProgress {
                    facility_id: facility_id.clone(),
                    total,
                    processed: processed + 1,
                    resolved: summary.resolved,
                });
            }
        }

        committer.finish()?;
        self.checkpoint(resolver, &found)?;
        summary.delta_flushes = committer.flush_count();
        summary.delta_rows = committer.written();
        info!(
            resolved = summary.resolved,
            misses = summary.misses,
            unresolvable = summary.unresolvable,
            cache_hits = summary.cache_hits,
            provider_queries = summary.provider_queries,
            "geocoding run finished"
        );
        Ok(summary)
    }

    /// Persists the cache and, with write-through on, fills the blank
    /// coordinate cells of the master file from what this run found.
    fn checkpoint(
        &self,
        resolver: &mut FallbackResolver,
        found: &HashMap<String, (String, String)>,
    ) -> AppResult<()> {
        resolver.cache_mut().flush()?;
        if self.config.write_through && !found.is_empty() {
            fill_missing_coordinates(&self.config.input_path, found, self.config.delimiter)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    use super::*;
    use crate::committer::read_delta;
    use crate::geography::Municipality;
    use crate::provider::{GeocodeProvider, GeocodeResult, RetryPolicy};
    use crate::source::{Coordinates, FacilityRecord};

    /// Resolves everything except queries starting with "Sem".
    struct CountingProvider {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl GeocodeProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn geocode(&self, query: &str) -> AppResult<Option<GeocodeResult>> {
            *self.calls.lock() += 1;
            if query.starts_with("Sem") {
                return Ok(None);
            }
            Ok(Some(GeocodeResult {
                latitude: -10.91,
                longitude: -37.05,
                formatted_address: format!("{query} (ok)"),
            }))
        }
    }

    fn config(dir: &Path) -> AppConfig {
        AppConfig {
            input_path: dir.join("Dim_Unidades_Saude.csv"),
            output_path: dir.join("novas_coordenadas.csv"),
            cache_path: dir.join("cache.csv"),
            geography_path: dir.join("Dim_Geografia.csv"),
            batch_size: 50,
            min_delay_seconds: 0.0,
            ..AppConfig::default()
        }
    }

    fn dataset(count: usize, missing_name_every: Option<usize>) -> FacilityDataset {
        let mut records = vec![{
            let mut located = FacilityRecord::new("9999999");
            located.municipality_id = Some("280030".into());
            located.coordinates = Some(Coordinates {
                latitude: -10.9,
                longitude: -37.1,
            });
            located
        }];
        for i in 0..count {
            let mut record = FacilityRecord::new(format!("{i:07}"));
            record.municipality_id = Some("280030".into());
            let unknown = missing_name_every.is_some_and(|n| i % n == 0);
            record.name = Some(if unknown {
                format!("Sem endereco {i}")
            } else {
                format!("Posto {i}")
            });
            records.push(record);
        }
        FacilityDataset::from_records(records)
    }

    fn resolver(dir: &Path, provider: Arc<CountingProvider>) -> FallbackResolver {
        let mut geography = GeographyTable::default();
        geography.insert(
            "280030",
            Municipality {
                name: "Aracaju".into(),
                state: Some("SE".into()),
            },
        );
        FallbackResolver::new(
            GeocodeClient::new(provider, RetryPolicy::immediate()),
            ResolutionCache::open(dir.join("cache.csv"), b';').unwrap(),
            geography,
            "Brasil",
        )
    }

    fn provider() -> Arc<CountingProvider> {
        Arc::new(CountingProvider {
            calls: Mutex::new(0),
        })
    }

    #[tokio::test]
    async fn checkpoints_every_batch_and_the_remainder() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let provider = provider();
        let mut resolver = resolver(dir.path(), provider.clone());
        let mut pipeline =
            GeocodePipeline::with_dataset(config.clone(), dataset(120, None), &HashSet::new());
        assert_eq!(pipeline.pending(), 120);

        let seen = Arc::new(Mutex::new(0usize));
        let observer_seen = seen.clone();
        let observer: Arc<dyn Fn(GeocodeProgress) + Send + Sync> =
            Arc::new(move |progress: GeocodeProgress| {
                *observer_seen.lock() = progress.processed;
            });
        let summary = pipeline.run(&mut resolver, Some(observer)).await.unwrap();

        assert_eq!(summary.delta_flushes, 3);
        assert_eq!(summary.resolved, 120);
        assert_eq!(summary.delta_rows, 120);
        assert_eq!(*seen.lock(), 120);
        assert_eq!(read_delta(&config.output_path, b';').unwrap().len(), 120);
        assert_eq!(pipeline.dataset().with_coordinates(), 121);
        assert_eq!(
            ResolutionCache::open(&config.cache_path, b';').unwrap().len(),
            120
        );
    }

    #[tokio::test]
    async fn delta_holds_only_successes() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let provider = provider();
        let mut resolver = resolver(dir.path(), provider.clone());
        let mut pipeline =
            GeocodePipeline::with_dataset(config.clone(), dataset(120, Some(10)), &HashSet::new());

        let summary = pipeline.run(&mut resolver, None).await.unwrap();
        assert_eq!(summary.misses, 12);
        assert_eq!(summary.resolved, 108);
        assert_eq!(summary.delta_rows, 108);
        assert_eq!(summary.delta_flushes, 3);
        // Name-only facilities yield a single candidate each.
        assert_eq!(summary.provider_queries, 120);
        assert_eq!(*provider.calls.lock(), 120);
    }

    #[tokio::test]
    async fn resumed_run_skips_delivered_ids_and_uses_the_cache() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let provider = provider();

        {
            let mut resolver = resolver(dir.path(), provider.clone());
            let mut first =
                GeocodePipeline::with_dataset(config.clone(), dataset(30, None), &HashSet::new());
            first.run(&mut resolver, None).await.unwrap();
        }
        assert_eq!(*provider.calls.lock(), 30);

        // The master file was never merged, so the same rows are still blank.
        let delivered = delivered_ids(&config.output_path, b';').unwrap();
        let mut resolver = resolver(dir.path(), provider.clone());
        let mut second =
            GeocodePipeline::with_dataset(config.clone(), dataset(40, None), &delivered);
        assert_eq!(second.pending(), 10);

        let summary = second.run(&mut resolver, None).await.unwrap();
        assert_eq!(summary.already_delivered, 30);
        assert_eq!(summary.resolved, 10);
        assert_eq!(*provider.calls.lock(), 40);
        assert_eq!(read_delta(&config.output_path, b';').unwrap().len(), 40);
    }

    #[tokio::test]
    async fn write_through_rewrites_the_master_dataset() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.write_through = true;
        dataset(5, None)
            .save(&config.input_path, config.delimiter)
            .unwrap();

        let mut pipeline = GeocodePipeline::load(&config).unwrap();
        let mut resolver = resolver(dir.path(), provider());
        pipeline.run(&mut resolver, None).await.unwrap();

        let reloaded = FacilityDataset::load(&config.input_path, b';').unwrap();
        assert_eq!(reloaded.with_coordinates(), 6);
    }

    #[tokio::test]
    async fn write_through_only_fills_blank_cells_and_keeps_the_layout() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.write_through = true;
        std::fs::write(
            &config.input_path,
            "CNES;ID_Municipio;Nome_Unidade;Latitude;Longitude;Rua;Numero;Bairro;Telefone\n\
             1;280030;Posto A;;;;;;7990\n\
             2;280030;Posto B;-10.95;;;;;7998\n\
             3;280030;Posto C;-10.8;-37.1;;;;7999\n\
             ;280030;Sem id;;;;;;7000\n",
        )
        .unwrap();

        let mut pipeline = GeocodePipeline::load(&config).unwrap();
        assert_eq!(pipeline.pending(), 2);
        let mut resolver = resolver(dir.path(), provider());
        pipeline.run(&mut resolver, None).await.unwrap();

        let text = std::fs::read_to_string(&config.input_path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "CNES;ID_Municipio;Nome_Unidade;Latitude;Longitude;Rua;Numero;Bairro;Telefone",
                "1;280030;Posto A;-10.91;-37.05;;;;7990",
                "2;280030;Posto B;-10.95;-37.05;;;;7998",
                "3;280030;Posto C;-10.8;-37.1;;;;7999",
                ";280030;Sem id;;;;;;7000",
            ]
        );
    }

    #[test]
    fn missing_master_dataset_is_fatal() {
        let dir = tempdir().unwrap();
        let err = GeocodePipeline::load(&config(dir.path())).err().unwrap();
        assert!(matches!(err, AppError::MissingInput(_)));
    }

    #[test]
    fn large_runs_cross_the_cost_threshold() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.cost_warning_threshold = 10;
        let pipeline = GeocodePipeline::with_dataset(config, dataset(11, None), &HashSet::new());
        assert!(pipeline.exceeds_cost_threshold());
    }
}
