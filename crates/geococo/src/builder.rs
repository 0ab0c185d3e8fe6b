//! The run driver. One type per stage; every transition consumes the
//! previous stage, so a builder can only be driven forward, once.
//!
//! ```no_run
//! use std::path::Path;
//! use geococo::{BuildConfig, DatasetBuilder};
//!
//! # fn main() -> geococo::Result<()> {
//! let written = DatasetBuilder::new(BuildConfig::default())
//!     .load_tiles(Path::new("tiles"))?
//!     .load_polygons(Path::new("buildings.csv"))?
//!     .assemble()?
//!     .write(Path::new("out/train.json"))?;
//! println!("{}", written.mapping_path().display());
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::assemble::{Assembler, AssemblyContext, TileStats};
use crate::category::CategoryTable;
use crate::coco::{self, Dataset, Image, Info, License, MappingRecord};
use crate::crs::{Crs, ReprojectionCache};
use crate::error::{Error, Result};
use crate::polygons::{load_polygon_table, SourcePolygon};
use crate::tiles::{load_tiles, Tile};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Annotations with clipped area at or below this (px²) are dropped.
    pub min_area: f64,
    /// CRS for rasters whose header does not carry one.
    pub default_crs: Crs,
    pub description: String,
    pub version: String,
    pub contributor: String,
    pub license_name: String,
    pub license_url: String,
    /// Stamped into `info.date_created`, `info.year` and `date_captured`.
    pub run_timestamp: NaiveDateTime,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            min_area: 10.0,
            default_crs: Crs::WGS84,
            description: "Building footprints from OpenStreetMap".to_owned(),
            version: "1.0".to_owned(),
            contributor: String::new(),
            license_name: "Open Database License (ODbL)".to_owned(),
            license_url: "https://opendatacommons.org/licenses/odbl/".to_owned(),
            run_timestamp: Utc::now().naive_utc(),
        }
    }
}

impl BuildConfig {
    fn timestamp(&self) -> String {
        self.run_timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    fn info(&self) -> Info {
        Info {
            description: self.description.clone(),
            version: self.version.clone(),
            year: self.run_timestamp.year(),
            contributor: self.contributor.clone(),
            date_created: self.timestamp(),
        }
    }

    fn license(&self) -> License {
        License {
            id: 1,
            name: self.license_name.clone(),
            url: self.license_url.clone(),
        }
    }
}

pub struct Unloaded;

pub struct TilesLoaded {
    tiles: Vec<Tile>,
}

pub struct PolygonsLoaded {
    tiles: Vec<Tile>,
    polygons: Vec<SourcePolygon>,
    categories: CategoryTable,
}

pub struct Assembled {
    dataset: Dataset,
    mapping: Vec<MappingRecord>,
    stats: TileStats,
}

pub struct Serialized {
    dataset_path: PathBuf,
    mapping_path: PathBuf,
    annotations: usize,
}

pub struct DatasetBuilder<S> {
    config: BuildConfig,
    cache: ReprojectionCache,
    state: S,
}

impl<S> DatasetBuilder<S> {
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    fn advance<T>(self, state: T) -> DatasetBuilder<T> {
        DatasetBuilder {
            config: self.config,
            cache: self.cache,
            state,
        }
    }
}

impl DatasetBuilder<Unloaded> {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            cache: ReprojectionCache::new(),
            state: Unloaded,
        }
    }

    /// Shared transformer cache, for callers that build tiles themselves.
    pub fn reprojection_cache(&self) -> &ReprojectionCache {
        &self.cache
    }

    pub fn load_tiles(self, dir: &Path) -> Result<DatasetBuilder<TilesLoaded>> {
        let set = load_tiles(dir, self.config.default_crs, &self.cache)?;
        if !set.skipped.is_empty() {
            info!("{} raster files skipped", set.skipped.len());
        }
        Ok(self.with_tiles(set.tiles))
    }

    pub fn with_tiles(self, mut tiles: Vec<Tile>) -> DatasetBuilder<TilesLoaded> {
        tiles.sort_by_key(|t| t.id);
        self.advance(TilesLoaded { tiles })
    }
}

impl DatasetBuilder<TilesLoaded> {
    pub fn tiles(&self) -> &[Tile] {
        &self.state.tiles
    }

    pub fn load_polygons(self, path: &Path) -> Result<DatasetBuilder<PolygonsLoaded>> {
        let table = load_polygon_table(path)?;
        Ok(self.with_polygons(table.polygons))
    }

    pub fn with_polygons(self, polygons: Vec<SourcePolygon>) -> DatasetBuilder<PolygonsLoaded> {
        let categories = CategoryTable::from_polygons(&polygons);
        info!(
            "{} categories: {}",
            categories.len(),
            categories
                .categories()
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let DatasetBuilder {
            config,
            cache,
            state: TilesLoaded { tiles },
        } = self;
        DatasetBuilder {
            config,
            cache,
            state: PolygonsLoaded {
                tiles,
                polygons,
                categories,
            },
        }
    }
}

impl DatasetBuilder<PolygonsLoaded> {
    pub fn categories(&self) -> &CategoryTable {
        &self.state.categories
    }

    /// Project, filter and number every annotation, then check the result.
    pub fn assemble(self) -> Result<DatasetBuilder<Assembled>> {
        let PolygonsLoaded {
            tiles,
            polygons,
            categories,
        } = &self.state;

        info!(
            "Assembling {} tiles x {} polygons (min area {})",
            tiles.len(),
            polygons.len(),
            self.config.min_area
        );

        let mut ctx = AssemblyContext::new();
        let stats = Assembler::new(tiles, polygons, categories, self.config.min_area).run(&mut ctx)?;
        let (annotations, mapping) = ctx.into_parts();

        let captured = self.config.timestamp();
        let images = tiles
            .iter()
            .map(|t| Image {
                id: t.id,
                width: t.width,
                height: t.height,
                file_name: t.filename.clone(),
                license: 1,
                date_captured: captured.clone(),
            })
            .collect();

        let dataset = Dataset {
            info: self.config.info(),
            licenses: vec![self.config.license()],
            images,
            annotations,
            categories: categories.categories().to_vec(),
        };

        let report = coco::validate(&dataset, Some(&mapping)).into_result()?;
        info!(
            "Created {} annotations over {} images and {} categories",
            report.annotations, report.images, report.categories
        );

        Ok(self.advance(Assembled {
            dataset,
            mapping,
            stats,
        }))
    }
}

impl DatasetBuilder<Assembled> {
    pub fn dataset(&self) -> &Dataset {
        &self.state.dataset
    }

    pub fn mapping(&self) -> &[MappingRecord] {
        &self.state.mapping
    }

    pub fn stats(&self) -> &TileStats {
        &self.state.stats
    }

    /// Pretty JSON of the dataset and the mapping.
    pub fn to_json(&self) -> std::result::Result<(String, String), serde_json::Error> {
        Ok((
            serde_json::to_string_pretty(&self.state.dataset)?,
            serde_json::to_string_pretty(&self.state.mapping)?,
        ))
    }

    /// Write `output` and `<stem>_mapping.json` beside it. Both documents are
    /// serialized before either file is touched.
    pub fn write(self, output: &Path) -> Result<DatasetBuilder<Serialized>> {
        let mapping_path = coco::mapping_path_for(output);
        let (dataset_json, mapping_json) = self.to_json().map_err(|source| Error::Json {
            path: output.to_path_buf(),
            source,
        })?;

        if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }
        fs::write(output, dataset_json).map_err(|e| Error::io(output, e))?;
        fs::write(&mapping_path, mapping_json).map_err(|e| Error::io(&mapping_path, e))?;

        info!("COCO dataset saved to {}", output.display());
        info!("Mapping saved to {}", mapping_path.display());

        let annotations = self.state.dataset.annotations.len();
        Ok(self.advance(Serialized {
            dataset_path: output.to_path_buf(),
            mapping_path,
            annotations,
        }))
    }

    pub fn into_parts(self) -> (Dataset, Vec<MappingRecord>) {
        (self.state.dataset, self.state.mapping)
    }
}

impl DatasetBuilder<Serialized> {
    pub fn dataset_path(&self) -> &Path {
        &self.state.dataset_path
    }

    pub fn mapping_path(&self) -> &Path {
        &self.state.mapping_path
    }

    pub fn annotations(&self) -> usize {
        self.state.annotations
    }
}
