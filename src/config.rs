use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_MIN_DELAY_SECONDS: f64 = 1.0;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_RETRY_BACKOFF_SECONDS: f64 = 2.0;
const DEFAULT_COST_WARNING_THRESHOLD: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Nominatim,
    Google,
}

impl ProviderKind {
    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nominatim" | "osm" | "openstreetmap" => Ok(ProviderKind::Nominatim),
            "google" | "google-maps" | "googlemaps" => Ok(ProviderKind::Google),
            other => Err(AppError::Config(format!("unknown geocoding provider: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Nominatim => "nominatim",
            ProviderKind::Google => "google",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub cache_path: PathBuf,
    pub geography_path: PathBuf,
    pub batch_size: usize,
    pub min_delay_seconds: f64,
    pub max_retries: u32,
    pub retry_backoff_seconds: f64,
    pub request_timeout_secs: u64,
    pub provider: ProviderKind,
    pub google_api_key: Option<SecretString>,
    pub google_geocode_url: String,
    pub nominatim_url: String,
    pub nominatim_user_agent: String,
    pub region: String,
    pub language: String,
    pub country_name: String,
    pub delimiter: u8,
    pub cost_warning_threshold: usize,
    pub write_through: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub input_path: String,
    pub output_path: String,
    pub cache_path: String,
    pub geography_path: String,
    pub batch_size: usize,
    pub min_delay_seconds: f64,
    pub max_retries: u32,
    pub retry_backoff_seconds: f64,
    pub provider: ProviderKind,
    pub region: String,
    pub has_google_api_key: bool,
    pub write_through: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("Dados_Tratados/Dim_Unidades_Saude.csv"),
            output_path: PathBuf::from("novas_coordenadas_google.csv"),
            cache_path: PathBuf::from("cache_google_maps.csv"),
            geography_path: PathBuf::from("Dados_Tratados/Dim_Geografia.csv"),
            batch_size: DEFAULT_BATCH_SIZE,
            min_delay_seconds: DEFAULT_MIN_DELAY_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_seconds: DEFAULT_RETRY_BACKOFF_SECONDS,
            request_timeout_secs: 10,
            provider: ProviderKind::Nominatim,
            google_api_key: None,
            google_geocode_url: "https://maps.googleapis.com/maps/api/geocode/json".into(),
            nominatim_url: "https://nominatim.openstreetmap.org/search".into(),
            nominatim_user_agent: concat!("cnes-geocoder/", env!("CARGO_PKG_VERSION")).into(),
            region: "br".into(),
            language: "pt-BR".into(),
            country_name: "Brasil".into(),
            delimiter: b';',
            cost_warning_threshold: DEFAULT_COST_WARNING_THRESHOLD,
            write_through: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        let provider = match env::var("GEOCODE_PROVIDER") {
            Ok(value) if !value.trim().is_empty() => ProviderKind::parse(&value)?,
            _ => defaults.provider,
        };

        Ok(Self {
            input_path: parse_path("GEOCODE_INPUT_PATH", defaults.input_path),
            output_path: parse_path("GEOCODE_OUTPUT_PATH", defaults.output_path),
            cache_path: parse_path("GEOCODE_CACHE_PATH", defaults.cache_path),
            geography_path: parse_path("GEOGRAPHY_PATH", defaults.geography_path),
            batch_size: parse_usize("GEOCODE_BATCH_SIZE", defaults.batch_size).max(1),
            min_delay_seconds: parse_f64("GEOCODE_MIN_DELAY_SECONDS", defaults.min_delay_seconds),
            max_retries: parse_u32("GEOCODE_MAX_RETRIES", defaults.max_retries),
            retry_backoff_seconds: parse_f64(
                "GEOCODE_RETRY_BACKOFF_SECONDS",
                defaults.retry_backoff_seconds,
            ),
            request_timeout_secs: parse_u64("GEOCODE_TIMEOUT_SECS", defaults.request_timeout_secs)
                .max(1),
            provider,
            google_api_key: env::var("GOOGLE_MAPS_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            google_geocode_url: parse_string("GOOGLE_GEOCODE_URL", defaults.google_geocode_url),
            nominatim_url: parse_string("NOMINATIM_URL", defaults.nominatim_url),
            nominatim_user_agent: parse_string(
                "NOMINATIM_USER_AGENT",
                defaults.nominatim_user_agent,
            ),
            region: parse_string("GEOCODE_REGION", defaults.region),
            language: parse_string("GEOCODE_LANGUAGE", defaults.language),
            country_name: parse_string("GEOCODE_COUNTRY_NAME", defaults.country_name),
            delimiter: parse_delimiter("CSV_DELIMITER", defaults.delimiter),
            cost_warning_threshold: parse_usize(
                "GEOCODE_COST_WARNING_THRESHOLD",
                defaults.cost_warning_threshold,
            ),
            write_through: parse_bool("GEOCODE_WRITE_THROUGH", defaults.write_through),
        })
    }

    pub fn min_delay(&self) -> Duration {
        seconds(self.min_delay_seconds)
    }

    pub fn retry_backoff(&self) -> Duration {
        seconds(self.retry_backoff_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            input_path: self.input_path.to_string_lossy().to_string(),
            output_path: self.output_path.to_string_lossy().to_string(),
            cache_path: self.cache_path.to_string_lossy().to_string(),
            geography_path: self.geography_path.to_string_lossy().to_string(),
            batch_size: self.batch_size,
            min_delay_seconds: self.min_delay_seconds,
            max_retries: self.max_retries,
            retry_backoff_seconds: self.retry_backoff_seconds,
            provider: self.provider,
            region: self.region.clone(),
            has_google_api_key: self.google_api_key.is_some(),
            write_through: self.write_through,
        }
    }
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default)
}

fn parse_string(key: &str, default: String) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

fn parse_path(key: &str, default: PathBuf) -> PathBuf {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or(default)
}

fn parse_delimiter(key: &str, default: u8) -> u8 {
    env::var(key)
        .ok()
        .and_then(|v| match v.as_str() {
            "\\t" | "tab" => Some(b'\t'),
            other if other.len() == 1 => other.bytes().next(),
            _ => None,
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GOOGLE_MAPS_API_KEY", "secret");
        env::set_var("GEOCODE_PROVIDER", "google");
        env::set_var("GEOCODE_BATCH_SIZE", "0");
        env::set_var("GEOCODE_MIN_DELAY_SECONDS", "0.5");
        env::set_var("GEOCODE_CACHE_PATH", "custom-cache.csv");

        let config = AppConfig::from_env().unwrap();
        let public = config.public_profile();

        assert_eq!(public.provider, ProviderKind::Google);
        assert_eq!(public.batch_size, 1);
        assert_eq!(public.cache_path, "custom-cache.csv");
        assert!(public.has_google_api_key);
        assert_eq!(config.min_delay(), Duration::from_millis(500));
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);

        let rendered = serde_json::to_string(&public).unwrap();
        assert!(!rendered.contains("secret\""));
        assert!(rendered.contains("\"provider\":\"google\""));

        for key in [
            "GOOGLE_MAPS_API_KEY",
            "GEOCODE_PROVIDER",
            "GEOCODE_BATCH_SIZE",
            "GEOCODE_MIN_DELAY_SECONDS",
            "GEOCODE_CACHE_PATH",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn rejects_unknown_provider_names() {
        assert!(ProviderKind::parse("bing").is_err());
        assert_eq!(ProviderKind::parse(" OSM ").unwrap(), ProviderKind::Nominatim);
    }
}
