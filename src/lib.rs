pub mod cache;
pub mod candidates;
pub mod committer;
pub mod config;
pub mod errors;
pub mod geography;
pub mod ingest;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod provider;
pub mod report;
pub mod resolver;
pub mod source;
mod table;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::cache::{is_complete, CacheEntry, ResolutionCache};
pub use crate::committer::{BatchCommitter, DeltaRow};
pub use crate::config::{AppConfig, ProviderKind};
pub use crate::errors::{AppError, AppResult};
pub use crate::merge::{apply_updates, MergeReport};
pub use crate::pipeline::{build_resolver, GeocodePipeline, GeocodeProgress, RunSummary};
pub use crate::provider::{GeocodeClient, GeocodeOutcome, GeocodeProvider, GeocodeResult};
pub use crate::resolver::{FallbackResolver, Resolution, ResolutionSource};
pub use crate::source::{FacilityDataset, FacilityRecord};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,cnes_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
