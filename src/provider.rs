use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::{AppConfig, ProviderKind};
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeResult {
    pub latitude: f64,
    pub longitude: f64,
    pub formatted_address: String,
}

/// What one query against the client produced, after retries.
#[derive(Debug, Clone, PartialEq)]
pub enum GeocodeOutcome {
    Found(GeocodeResult),
    Miss,
    TransportError(String),
}

impl GeocodeOutcome {
    pub fn into_result(self) -> Option<GeocodeResult> {
        match self {
            GeocodeOutcome::Found(result) => Some(result),
            GeocodeOutcome::Miss | GeocodeOutcome::TransportError(_) => None,
        }
    }
}

/// One external geocoding service.
///
/// `Ok(None)` means the service answered with no match; `Err` is a transport
/// or status failure the client may retry.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn geocode(&self, query: &str) -> AppResult<Option<GeocodeResult>>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub min_delay: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            min_delay: config.min_delay(),
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
        }
    }

    pub fn immediate() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// Provider wrapper enforcing request spacing and the retry policy. Every
/// failure degrades to a [`GeocodeOutcome`]; nothing here aborts a batch.
pub struct GeocodeClient {
    provider: Arc<dyn GeocodeProvider>,
    policy: RetryPolicy,
    rate_limiter: RateLimiter,
}

impl GeocodeClient {
    pub fn new(provider: Arc<dyn GeocodeProvider>, policy: RetryPolicy) -> Self {
        Self {
            provider,
            rate_limiter: RateLimiter::new(policy.min_delay),
            policy,
        }
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        Ok(Self::new(build_provider(config)?, RetryPolicy::from_config(config)))
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub async fn resolve(&self, query: &str) -> GeocodeOutcome {
        if query.trim().is_empty() {
            return GeocodeOutcome::Miss;
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.rate_limiter.wait().await;
            match self.provider.geocode(query).await {
                Ok(Some(result)) => return GeocodeOutcome::Found(result),
                Ok(None) => {
                    debug!(provider = self.provider.name(), query, "no results");
                    return GeocodeOutcome::Miss;
                }
                Err(err) if attempt <= self.policy.max_retries => {
                    warn!(
                        ?err,
                        attempt,
                        provider = self.provider.name(),
                        "geocode request failed; retrying after {:?}",
                        self.policy.backoff
                    );
                    sleep(self.policy.backoff).await;
                }
                Err(err) => {
                    warn!(
                        %err,
                        attempt,
                        provider = self.provider.name(),
                        query,
                        "geocode request failed; giving up on this query"
                    );
                    return GeocodeOutcome::TransportError(err.to_string());
                }
            }
        }
    }
}

pub fn build_provider(config: &AppConfig) -> AppResult<Arc<dyn GeocodeProvider>> {
    let http = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .user_agent(config.nominatim_user_agent.as_str())
        .build()?;

    match config.provider {
        ProviderKind::Nominatim => Ok(Arc::new(NominatimProvider {
            http,
            endpoint: config.nominatim_url.clone(),
            country_codes: config.region.clone(),
            language: config.language.clone(),
        })),
        ProviderKind::Google => {
            let api_key = config.google_api_key.clone().ok_or_else(|| {
                AppError::Config("GOOGLE_MAPS_API_KEY is required for the google provider".into())
            })?;
            Ok(Arc::new(GoogleGeocodingProvider {
                http,
                endpoint: config.google_geocode_url.clone(),
                api_key,
                region: config.region.clone(),
                language: config.language.clone(),
            }))
        }
    }
}

/// OpenStreetMap Nominatim search endpoint.
pub struct NominatimProvider {
    http: reqwest::Client,
    endpoint: String,
    country_codes: String,
    language: String,
}

#[async_trait]
impl GeocodeProvider for NominatimProvider {
    fn name(&self) -> &'static str {
        "nominatim"
    }

    async fn geocode(&self, query: &str) -> AppResult<Option<GeocodeResult>> {
        #[derive(Deserialize)]
        struct Place {
            lat: String,
            lon: String,
            #[serde(default)]
            display_name: Option<String>,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("q", query),
                ("format", "jsonv2"),
                ("limit", "1"),
                ("countrycodes", self.country_codes.as_str()),
                ("accept-language", self.language.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let places: Vec<Place> = response.json().await?;
        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };
        let latitude = place
            .lat
            .trim()
            .parse::<f64>()
            .map_err(|err| AppError::Provider(format!("invalid latitude {:?}: {err}", place.lat)))?;
        let longitude = place
            .lon
            .trim()
            .parse::<f64>()
            .map_err(|err| AppError::Provider(format!("invalid longitude {:?}: {err}", place.lon)))?;

        Ok(Some(GeocodeResult {
            latitude,
            longitude,
            formatted_address: place.display_name.unwrap_or_else(|| query.to_string()),
        }))
    }
}

/// Google Maps Geocoding API.
pub struct GoogleGeocodingProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
    region: String,
    language: String,
}

#[async_trait]
impl GeocodeProvider for GoogleGeocodingProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn geocode(&self, query: &str) -> AppResult<Option<GeocodeResult>> {
        #[derive(Deserialize)]
        struct Response {
            status: String,
            #[serde(default)]
            results: Vec<ResponseResult>,
            #[serde(default)]
            error_message: Option<String>,
        }

        #[derive(Deserialize)]
        struct ResponseResult {
            #[serde(default)]
            formatted_address: Option<String>,
            geometry: ResponseGeometry,
        }

        #[derive(Deserialize)]
        struct ResponseGeometry {
            location: ResponseLocation,
        }

        #[derive(Deserialize)]
        struct ResponseLocation {
            lat: f64,
            lng: f64,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("address", query),
                ("key", self.api_key.expose_secret()),
                ("region", self.region.as_str()),
                ("language", self.language.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await?;
        match parsed.status.as_str() {
            "OK" => Ok(parsed.results.into_iter().next().map(|result| GeocodeResult {
                latitude: result.geometry.location.lat,
                longitude: result.geometry.location.lng,
                formatted_address: result
                    .formatted_address
                    .unwrap_or_else(|| query.to_string()),
            })),
            "ZERO_RESULTS" => Ok(None),
            status => Err(AppError::Provider(match parsed.error_message {
                Some(message) => format!("{status}: {message}"),
                None => status.to_string(),
            })),
        }
    }
}
