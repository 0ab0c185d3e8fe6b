mod config;
mod osm;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;

use geococo::coco::{mapping_path_for, read_dataset, read_mapping, validate};
use geococo::{BuildConfig, DatasetBuilder};

use crate::config::{BuildArgs, Cli, Command, ValidateArgs};

fn build_config(args: &BuildArgs) -> BuildConfig {
    let mut config = BuildConfig {
        min_area: args.min_area,
        default_crs: args.default_crs,
        ..BuildConfig::default()
    };
    if let Some(description) = &args.description {
        config.description = description.clone();
    }
    if let Some(contributor) = &args.contributor {
        config.contributor = contributor.clone();
    }
    if let Some(ts) = args.date_created {
        config.run_timestamp = ts;
    }
    config
}

fn build(args: &BuildArgs) -> Result<()> {
    if !args.images.is_dir() {
        bail!("images folder '{}' does not exist", args.images.display());
    }
    if !args.csv.is_file() {
        bail!("polygon table '{}' does not exist", args.csv.display());
    }

    let config = build_config(args);
    info!("Images folder: {}", args.images.display());
    info!("Polygon table: {}", args.csv.display());
    info!("Output: {}", args.output.display());

    let written = DatasetBuilder::new(config)
        .load_tiles(&args.images)
        .with_context(|| format!("loading tiles from {}", args.images.display()))?
        .load_polygons(&args.csv)
        .with_context(|| format!("loading polygons from {}", args.csv.display()))?
        .assemble()
        .context("assembling annotations")?
        .write(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    info!(
        "Done: {} annotations -> {} (+ {})",
        written.annotations(),
        written.dataset_path().display(),
        written.mapping_path().display()
    );
    Ok(())
}

fn run_build(args: BuildArgs) -> Result<()> {
    match args.threads {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .context("building worker pool")?;
            info!("Using {n} worker threads");
            pool.install(|| build(&args))
        }
        None => build(&args),
    }
}

fn run_validate(args: ValidateArgs) -> Result<()> {
    let dataset = read_dataset(&args.dataset)
        .with_context(|| format!("reading {}", args.dataset.display()))?;

    let mapping_path: Option<PathBuf> = args.mapping.clone().or_else(|| {
        let guess = mapping_path_for(&args.dataset);
        guess.is_file().then_some(guess)
    });
    let mapping = match &mapping_path {
        Some(path) => {
            Some(read_mapping(path).with_context(|| format!("reading {}", path.display()))?)
        }
        None => None,
    };

    let report = validate(&dataset, mapping.as_deref());
    info!("Images: {}", report.images);
    info!("Annotations: {}", report.annotations);
    info!("Categories: {}", report.categories);
    if let (Some(path), Some(n)) = (&mapping_path, report.mapping_records) {
        info!("Mapping records: {n} ({})", path.display());
    }

    if !report.is_valid() {
        for violation in &report.violations {
            warn!("{violation}");
        }
        bail!(
            "{} failed validation with {} violations",
            args.dataset.display(),
            report.violations.len()
        );
    }

    info!("{} is valid", args.dataset.display());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Build(args) => run_build(args),
        Command::Extract(args) => osm::extract(&args),
        Command::Validate(args) => run_validate(args),
    }
}
