use chrono::NaiveDateTime;
use clap::{Args, Parser, Subcommand};
use geococo::Crs;
use std::path::PathBuf;

use crate::osm::GeoBboxDeg;

/// `geo2coco` - turn geo-referenced OSM building footprints into COCO
/// detection annotations for a folder of raster tiles.
#[derive(Parser, Debug)]
#[command(name = "geo2coco", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Project the polygon table into every tile and write the COCO dataset
    /// plus its `_mapping.json` companion.
    Build(BuildArgs),

    /// Pull `building=*` ways out of an OSM .pbf into a polygon table CSV.
    Extract(ExtractArgs),

    /// Check an existing dataset (and mapping) for referential integrity.
    Validate(ValidateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    /// Folder holding the raster tiles (tif/tiff/jpg/jpeg/png).
    #[arg(long, short = 'i')]
    pub images: PathBuf,

    /// Polygon table with `building` and `geometry` (WKT, EPSG:4326) columns.
    #[arg(long, short = 'c')]
    pub csv: PathBuf,

    /// Output path of the COCO JSON; the mapping is written beside it.
    #[arg(long, short = 'o')]
    pub output: PathBuf,

    /// Drop annotations whose clipped area (px²) is at or below this.
    #[arg(long, env = "GEO2COCO_MIN_AREA", default_value_t = 10.0)]
    pub min_area: f64,

    /// CRS for rasters whose header carries none (world-file tiles).
    #[arg(long, default_value = "EPSG:4326")]
    pub default_crs: Crs,

    /// Worker threads for tile loading and assembly (default: all cores).
    #[arg(long, env = "GEO2COCO_THREADS")]
    pub threads: Option<usize>,

    /// `info.description` of the dataset.
    #[arg(long)]
    pub description: Option<String>,

    /// `info.contributor` of the dataset.
    #[arg(long)]
    pub contributor: Option<String>,

    /// Timestamp stamped into the dataset, e.g. `2025-03-01T12:00:00`.
    /// Fix it to get byte-identical output across runs.
    #[arg(long)]
    pub date_created: Option<NaiveDateTime>,
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    /// OSM .pbf extract to read.
    #[arg(long)]
    pub pbf: PathBuf,

    /// Polygon table CSV to write.
    #[arg(long, short = 'o')]
    pub output: PathBuf,

    /// Keep only buildings meeting `minlon,minlat,maxlon,maxlat`.
    #[arg(long)]
    pub bbox: Option<GeoBboxDeg>,

    /// Log a progress line every N elements. Default: 2,000,000
    #[arg(long, default_value_t = 2_000_000)]
    pub log_every: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    /// COCO dataset JSON.
    pub dataset: PathBuf,

    /// Mapping JSON; defaults to `<dataset stem>_mapping.json` when present.
    #[arg(long)]
    pub mapping: Option<PathBuf>,
}
