//! geococo: geo-referenced building polygons -> per-tile COCO annotations.
//!
//! Pipeline, per tile (lowest id first) and per polygon (table order):
//!
//!   coarse    : lon/lat ring meets the tile footprint (R-tree + `geo`)
//!   rasterize : lon/lat -> tile CRS -> pixel (inverse affine, truncation)
//!   fine      : pixel ring's bbox is not entirely outside the tile
//!   clip      : per-axis clamp to [0, width] x [0, height]
//!   threshold : clipped area > min_area
//!   emit      : next annotation id, COCO annotation + mapping record
//!
//! Outputs are `<output>.json` (COCO detection dataset) and
//! `<output stem>_mapping.json` (one record per annotation, tying it back to
//! the tile file name and polygon-table row).
//!
//! Tile CRSs: EPSG:4326 natively, EPSG:3857 inline, and any other EPSG code
//! with a proj4 definition through `proj4rs`.

pub mod affine;
pub mod assemble;
pub mod builder;
pub mod category;
pub mod coco;
pub mod crs;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod polygons;
pub mod projector;
pub mod rasterize;
pub mod tiles;

pub use affine::{Affine, Bounds};
pub use builder::{BuildConfig, DatasetBuilder};
pub use coco::{Dataset, MappingRecord, ValidationReport};
pub use crs::{Crs, Reprojection, ReprojectionCache};
pub use error::{Error, Result};
pub use polygons::SourcePolygon;
pub use projector::{Pixel, Projector};
pub use tiles::Tile;
