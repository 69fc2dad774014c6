use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use cnes_geocoder::config::AppConfig;
use cnes_geocoder::geography::build_geography_dimension;
use cnes_geocoder::ingest::{build_facility_dimension, extract_missing_geolocation, filter_rows};
use cnes_geocoder::pipeline::{build_resolver, GeocodePipeline, GeocodeProgress};
use cnes_geocoder::report::pendency_report;
use cnes_geocoder::{apply_updates, init_tracing};

/// Geocoding and preparation of CNES health-facility datasets.
#[derive(Parser)]
#[command(name = "cnes-geocoder", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fill missing facility coordinates through the configured provider.
    Geocode {
        /// Skip the confirmation asked for large runs.
        #[arg(long)]
        yes: bool,
    },
    /// Merge the delta file of new coordinates into the master dataset.
    Merge,
    /// Print how many facilities still lack coordinates.
    Report {
        #[arg(long, default_value = "Latitude")]
        lat_column: String,
    },
    /// Build the facility dimension from the raw CNES establishment extract.
    IngestUnits {
        #[arg(long, default_value = "Dados_Auxiliares/tbEstabelecimento.csv")]
        source: PathBuf,
        #[arg(long, default_value_t = ';')]
        source_delimiter: char,
    },
    /// Build the geography dimension from the IBGE municipality and state tables.
    IngestGeography {
        #[arg(long, default_value = "Dados_Auxiliares/municipios.csv")]
        municipalities: PathBuf,
        #[arg(long, default_value = "Dados_Auxiliares/estados.csv")]
        states: PathBuf,
    },
    /// Keep the rows whose column equals a fixed value.
    Filter {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        column: String,
        #[arg(long)]
        value: String,
        #[arg(long, default_value_t = ';')]
        delimiter: char,
    },
    /// Keep the rows lacking latitude or longitude.
    MissingGeo {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "NU_LATITUDE")]
        lat_column: String,
        #[arg(long, default_value = "NU_LONGITUDE")]
        lng_column: String,
        #[arg(long, default_value_t = ';')]
        delimiter: char,
    },
}

fn delimiter_byte(value: char) -> Result<u8> {
    u8::try_from(value).with_context(|| format!("delimiter {value:?} is not a single byte"))
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} [y/N] ");
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "s" | "sim"
    ))
}

async fn geocode(config: &AppConfig, yes: bool) -> Result<()> {
    let mut pipeline = GeocodePipeline::load(config).context("failed to load master dataset")?;
    if pipeline.pending() == 0 {
        println!("Nothing to geocode: every facility has coordinates or is already delivered.");
        return Ok(());
    }
    if pipeline.exceeds_cost_threshold() && !yes {
        let prompt = format!(
            "{} facilities to geocode with {}. Continue?",
            pipeline.pending(),
            config.provider.as_str()
        );
        if !confirm(&prompt)? {
            warn!("run cancelled by operator");
            return Ok(());
        }
    }

    let mut resolver = build_resolver(config).context("failed to prepare resolver")?;
    let bar = ProgressBar::new(pipeline.pending() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} [{elapsed_precise}<{eta_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let observer_bar = bar.clone();
    let observer: Arc<dyn Fn(GeocodeProgress) + Send + Sync> =
        Arc::new(move |progress: GeocodeProgress| {
            observer_bar.set_position(progress.processed as u64);
            observer_bar.set_message(format!("{} resolved", progress.resolved));
        });

    let summary = pipeline.run(&mut resolver, Some(observer)).await?;
    bar.finish_and_clear();

    println!("Facilities pending:   {}", summary.pending);
    println!("Resolved:             {}", summary.resolved);
    println!("  from cache:         {}", summary.cache_hits);
    println!("Misses:               {}", summary.misses);
    println!("Unresolvable:         {}", summary.unresolvable);
    println!("Provider queries:     {}", summary.provider_queries);
    println!(
        "Delta rows written:   {} ({} flushes) -> {}",
        summary.delta_rows,
        summary.delta_flushes,
        config.output_path.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env().context("invalid configuration")?;
    info!(
        profile = %serde_json::to_string(&config.public_profile())?,
        "configuration loaded"
    );

    match cli.command {
        Commands::Geocode { yes } => geocode(&config, yes).await?,
        Commands::Merge => {
            let report = apply_updates(&config.input_path, &config.output_path, config.delimiter)
                .context("merge failed")?;
            println!("Coordinates before merge: {}", report.filled_before);
            println!("Coordinates after merge:  {}", report.filled_after);
            println!("Newly filled:             {}", report.increment());
        }
        Commands::Report { lat_column } => {
            let report = pendency_report(&config.input_path, config.delimiter, &lat_column)?;
            println!("Total facilities:     {}", report.total);
            println!("With coordinates:     {}", report.with_coordinates);
            println!("Without coordinates:  {}", report.missing);
            println!("Percent pending:      {:.2}%", report.percent_missing);
        }
        Commands::IngestUnits {
            source,
            source_delimiter,
        } => {
            let summary = build_facility_dimension(
                &source,
                &config.input_path,
                delimiter_byte(source_delimiter)?,
                config.delimiter,
            )?;
            println!(
                "Facility dimension saved ({} facilities, {} with coordinates) -> {}",
                summary.facilities,
                summary.with_coordinates,
                config.input_path.display()
            );
        }
        Commands::IngestGeography {
            municipalities,
            states,
        } => {
            let summary = build_geography_dimension(
                &municipalities,
                &states,
                &config.geography_path,
                config.delimiter,
            )?;
            println!(
                "Geography dimension saved ({} municipalities) -> {}",
                summary.municipalities,
                config.geography_path.display()
            );
        }
        Commands::Filter {
            input,
            output,
            column,
            value,
            delimiter,
        } => {
            let kept = filter_rows(&input, &output, &column, &value, delimiter_byte(delimiter)?)?;
            println!("{kept} rows with {column} = {value} -> {}", output.display());
        }
        Commands::MissingGeo {
            input,
            output,
            lat_column,
            lng_column,
            delimiter,
        } => {
            let kept = extract_missing_geolocation(
                &input,
                &output,
                &lat_column,
                &lng_column,
                delimiter_byte(delimiter)?,
            )?;
            println!("{kept} rows without geolocation -> {}", output.display());
        }
    }
    Ok(())
}
