use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, ResolutionCache};
use crate::candidates::CandidateBuilder;
use crate::geography::GeographyTable;
use crate::normalize::{format_coordinate, parse_coordinate};
use crate::provider::{GeocodeClient, GeocodeOutcome};
use crate::source::{Coordinates, FacilityRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolutionSource {
    Cache,
    Provider,
    Miss,
    Unresolvable,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub entry: CacheEntry,
    pub source: ResolutionSource,
    /// Provider queries issued for this facility.
    pub queries: usize,
}

impl Resolution {
    pub fn coordinates(&self) -> Option<Coordinates> {
        Some(Coordinates {
            latitude: parse_coordinate(self.entry.latitude.as_deref()?)?,
            longitude: parse_coordinate(self.entry.longitude.as_deref()?)?,
        })
    }
}

/// Cache-first, stop-at-first-hit resolution of one facility at a time.
pub struct FallbackResolver {
    client: GeocodeClient,
    cache: ResolutionCache,
    geography: GeographyTable,
    country: String,
}

impl FallbackResolver {
    pub fn new(
        client: GeocodeClient,
        cache: ResolutionCache,
        geography: GeographyTable,
        country: impl Into<String>,
    ) -> Self {
        Self {
            client,
            cache,
            geography,
            country: country.into(),
        }
    }

    pub async fn resolve_facility(&mut self, record: &FacilityRecord) -> Resolution {
        if let Some(entry) = self.cache.complete_entry(&record.facility_id) {
            debug!(facility_id = %record.facility_id, "cache hit");
            return Resolution {
                entry: entry.clone(),
                source: ResolutionSource::Cache,
                queries: 0,
            };
        }
        if self.cache.lookup(&record.facility_id).is_some() {
            debug!(facility_id = %record.facility_id, "incomplete cache entry; resolving again");
        }

        let builder = CandidateBuilder::new(&self.geography, self.country.as_str());
        let Some(candidates) = builder.build(record) else {
            warn!(
                facility_id = %record.facility_id,
                municipality_id = record.municipality_id.as_deref().unwrap_or(""),
                "no usable municipality or address; skipping"
            );
            let entry = CacheEntry::miss(record.facility_id.clone(), record.name.clone());
            self.cache.upsert(entry.clone());
            return Resolution {
                entry,
                source: ResolutionSource::Unresolvable,
                queries: 0,
            };
        };

        let mut queries = 0;
        for candidate in &candidates {
            queries += 1;
            match self.client.resolve(&candidate.query_text).await {
                GeocodeOutcome::Found(result) => {
                    info!(
                        facility_id = %record.facility_id,
                        strategy = %candidate.strategy,
                        address = %result.formatted_address,
                        "resolved"
                    );
                    let entry = CacheEntry {
                        facility_id: record.facility_id.clone(),
                        name: record.name.clone(),
                        latitude: Some(format_coordinate(result.latitude)),
                        longitude: Some(format_coordinate(result.longitude)),
                        resolved_address: Some(result.formatted_address),
                        strategy: Some(candidate.strategy.label().to_string()),
                    };
                    self.cache.upsert(entry.clone());
                    return Resolution {
                        entry,
                        source: ResolutionSource::Provider,
                        queries,
                    };
                }
                GeocodeOutcome::Miss => {
                    debug!(
                        facility_id = %record.facility_id,
                        strategy = %candidate.strategy,
                        "candidate missed"
                    );
                }
                GeocodeOutcome::TransportError(reason) => {
                    warn!(
                        facility_id = %record.facility_id,
                        strategy = %candidate.strategy,
                        %reason,
                        "candidate failed; trying next"
                    );
                }
            }
        }

        warn!(
            facility_id = %record.facility_id,
            attempts = queries,
            "no candidate resolved"
        );
        let entry = CacheEntry::miss(record.facility_id.clone(), record.name.clone());
        self.cache.upsert(entry.clone());
        Resolution {
            entry,
            source: ResolutionSource::Miss,
            queries,
        }
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ResolutionCache {
        &mut self.cache
    }

    pub fn provider_name(&self) -> &'static str {
        self.client.provider_name()
    }
}
