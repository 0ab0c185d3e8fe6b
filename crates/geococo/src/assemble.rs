//! Tiles x polygons -> annotations.
//!
//! Tiles are evaluated in parallel; each evaluation only reads shared data
//! and returns its surviving candidates in polygon order. Ids are handed out
//! afterwards, walking tiles by ascending id, so the result does not depend on
//! scheduling.

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::category::CategoryTable;
use crate::coco::{Annotation, MappingRecord};
use crate::error::Result;
use crate::filter::{self, FilterOutcome, PolygonIndex, SpatialFilter};
use crate::metrics;
use crate::polygons::SourcePolygon;
use crate::projector::Pixel;
use crate::rasterize::rasterize;
use crate::tiles::Tile;

/// A (tile, polygon) pair that survived filtering, before id assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub tile_id: u32,
    /// Index into the polygon slice.
    pub source: usize,
    pub ring: Vec<Pixel>,
    pub area: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileStats {
    /// Polygons whose envelope met the tile footprint.
    pub candidates: usize,
    pub coarse_rejected: usize,
    pub outside: usize,
    pub too_small: usize,
    pub errors: usize,
    pub kept: usize,
}

impl TileStats {
    fn merge(&mut self, other: &TileStats) {
        self.candidates += other.candidates;
        self.coarse_rejected += other.coarse_rejected;
        self.outside += other.outside;
        self.too_small += other.too_small;
        self.errors += other.errors;
        self.kept += other.kept;
    }
}

/// Run-scoped id counter and the accumulated output.
#[derive(Debug, Clone)]
pub struct AssemblyContext {
    next_id: u64,
    annotations: Vec<Annotation>,
    mapping: Vec<MappingRecord>,
}

impl Default for AssemblyContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AssemblyContext {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            annotations: Vec::new(),
            mapping: Vec::new(),
        }
    }

    /// Id the next accepted annotation will get.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn mapping(&self) -> &[MappingRecord] {
        &self.mapping
    }

    fn push(
        &mut self,
        tile: &Tile,
        polygon: &SourcePolygon,
        category_id: u32,
        candidate: Candidate,
    ) {
        let id = self.next_id;
        self.next_id += 1;

        // Rings are non-empty after filtering; a zero box only guards the type.
        let bbox = metrics::bbox(&candidate.ring).unwrap_or([0; 4]);

        self.mapping.push(MappingRecord {
            annotation_id: id,
            image_id: tile.id,
            image_filename: tile.filename.clone(),
            polygon_csv_idx: polygon.row,
            category_name: polygon.label.clone(),
            category_id,
            bbox,
            area: candidate.area,
        });

        self.annotations.push(Annotation {
            id,
            image_id: tile.id,
            category_id,
            segmentation: metrics::segmentation(&candidate.ring),
            area: candidate.area,
            bbox,
            iscrowd: 0,
        });
    }

    pub fn into_parts(self) -> (Vec<Annotation>, Vec<MappingRecord>) {
        (self.annotations, self.mapping)
    }
}

pub struct Assembler<'a> {
    tiles: &'a [Tile],
    polygons: &'a [SourcePolygon],
    categories: &'a CategoryTable,
    filter: SpatialFilter,
    index: PolygonIndex,
}

impl<'a> Assembler<'a> {
    pub fn new(
        tiles: &'a [Tile],
        polygons: &'a [SourcePolygon],
        categories: &'a CategoryTable,
        min_area: f64,
    ) -> Self {
        Self {
            tiles,
            polygons,
            categories,
            filter: SpatialFilter::new(min_area),
            index: PolygonIndex::build(polygons),
        }
    }

    /// All surviving candidates for one tile, in polygon order.
    pub fn evaluate_tile(&self, tile: &Tile) -> (Vec<Candidate>, TileStats) {
        let mut stats = TileStats::default();
        let mut out = Vec::new();
        let rect = filter::tile_rect(&tile.geo_bounds);

        for idx in self.index.candidates(&tile.geo_bounds) {
            stats.candidates += 1;
            let polygon = &self.polygons[idx];

            if !filter::intersects_tile(polygon, &rect) {
                stats.coarse_rejected += 1;
                continue;
            }

            let pixel = match rasterize(tile.projector(), tile.id, idx, polygon) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Tile {} ({}): {e}", tile.id, tile.filename);
                    stats.errors += 1;
                    continue;
                }
            };

            match self.filter.apply(&pixel.ring, tile.width, tile.height) {
                FilterOutcome::Kept { ring, area } => {
                    stats.kept += 1;
                    out.push(Candidate {
                        tile_id: tile.id,
                        source: idx,
                        ring,
                        area,
                    });
                }
                FilterOutcome::Outside => stats.outside += 1,
                FilterOutcome::TooSmall { area } => {
                    debug!(
                        "Tile {}: row {} below min area ({area:.1} <= {})",
                        tile.id,
                        polygon.row,
                        self.filter.min_area()
                    );
                    stats.too_small += 1;
                }
            }
        }

        (out, stats)
    }

    /// Evaluate every tile and append the results to `ctx`.
    ///
    /// A category miss aborts the run; nothing is appended past that point.
    pub fn run(&self, ctx: &mut AssemblyContext) -> Result<TileStats> {
        let mut order: Vec<&Tile> = self.tiles.iter().collect();
        order.sort_by_key(|t| t.id);

        let results: Vec<(Vec<Candidate>, TileStats)> =
            order.par_iter().map(|tile| self.evaluate_tile(tile)).collect();

        let mut total = TileStats::default();
        for (tile, (candidates, stats)) in order.iter().zip(results) {
            let before = ctx.next_id();
            for candidate in candidates {
                let polygon = &self.polygons[candidate.source];
                let category_id = self.categories.id_of(&polygon.label)?;
                ctx.push(tile, polygon, category_id, candidate);
            }

            info!(
                "Tile {} {}: {} annotations ({} candidates, {} outside, {} below min area, {} errors)",
                tile.id,
                tile.filename,
                ctx.next_id() - before,
                stats.candidates,
                stats.outside + stats.coarse_rejected,
                stats.too_small,
                stats.errors
            );
            total.merge(&stats);
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::Affine;
    use crate::crs::{Crs, ReprojectionCache};

    fn tile(id: u32, c: f64, cache: &ReprojectionCache) -> Tile {
        Tile::new(
            id,
            format!("tile_{id}.tif"),
            640,
            640,
            Crs::WGS84,
            Affine::new(1.0, 0.0, c, 0.0, -1.0, 640.0),
            cache,
        )
        .unwrap()
    }

    fn house(row: usize) -> SourcePolygon {
        SourcePolygon::new(
            "house",
            vec![(10.0, 630.0), (20.0, 630.0), (20.0, 620.0), (10.0, 620.0)],
            row,
        )
        .unwrap()
    }

    #[test]
    fn single_house_in_single_tile() {
        let cache = ReprojectionCache::new();
        let tiles = vec![tile(1, 0.0, &cache)];
        let polygons = vec![house(0)];
        let categories = CategoryTable::from_polygons(&polygons);

        let mut ctx = AssemblyContext::new();
        Assembler::new(&tiles, &polygons, &categories, 10.0)
            .run(&mut ctx)
            .unwrap();

        let (anns, mapping) = ctx.into_parts();
        assert_eq!(anns.len(), 1);
        assert_eq!(anns[0].id, 1);
        assert_eq!(anns[0].bbox, [10, 10, 10, 10]);
        assert_eq!(anns[0].area, 100.0);
        assert_eq!(mapping[0].category_name, "house");
        assert_eq!(mapping[0].image_filename, "tile_1.tif");
    }

    #[test]
    fn far_polygon_leaves_counter_untouched() {
        let cache = ReprojectionCache::new();
        let tiles = vec![tile(1, 0.0, &cache)];
        let polygons = vec![SourcePolygon::new(
            "house",
            vec![(5000.0, 5000.0), (5010.0, 5000.0), (5010.0, 5010.0)],
            0,
        )
        .unwrap()];
        let categories = CategoryTable::from_polygons(&polygons);

        let mut ctx = AssemblyContext::new();
        let stats = Assembler::new(&tiles, &polygons, &categories, 10.0)
            .run(&mut ctx)
            .unwrap();
        assert_eq!(ctx.next_id(), 1);
        assert!(ctx.annotations().is_empty());
        assert_eq!(stats.candidates, 0);
    }

    #[test]
    fn ids_follow_tile_then_row_order() {
        let cache = ReprojectionCache::new();
        // Given out of order on purpose; both tiles cover x in [0, 640].
        let tiles = vec![tile(2, 0.0, &cache), tile(1, 0.0, &cache)];
        let polygons = vec![house(0), house(5)];
        let categories = CategoryTable::from_polygons(&polygons);

        let mut ctx = AssemblyContext::new();
        Assembler::new(&tiles, &polygons, &categories, 10.0)
            .run(&mut ctx)
            .unwrap();

        let order: Vec<(u64, u32, usize)> = ctx
            .mapping()
            .iter()
            .map(|m| (m.annotation_id, m.image_id, m.polygon_csv_idx))
            .collect();
        assert_eq!(order, vec![(1, 1, 0), (2, 1, 5), (3, 2, 0), (4, 2, 5)]);
    }

    #[test]
    fn category_miss_is_fatal() {
        let cache = ReprojectionCache::new();
        let tiles = vec![tile(1, 0.0, &cache)];
        let polygons = vec![house(0)];
        let categories = CategoryTable::from_labels(["garage"]);

        let mut ctx = AssemblyContext::new();
        let err = Assembler::new(&tiles, &polygons, &categories, 10.0)
            .run(&mut ctx)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn unprojectable_polygon_is_counted_and_skipped() {
        let cache = ReprojectionCache::new();
        // Whole-world Web Mercator tile, 100 km pixels.
        let tiles = vec![Tile::new(
            1,
            "world.tif",
            400,
            400,
            Crs::epsg(3857),
            Affine::new(1e5, 0.0, -2e7, 0.0, -1e5, 2e7),
            &cache,
        )
        .unwrap()];
        let polygons = vec![
            // Reaches past the pole, where Mercator has no y.
            SourcePolygon::new(
                "house",
                vec![(0.0, 80.0), (10.0, 80.0), (10.0, 91.0), (0.0, 91.0)],
                0,
            )
            .unwrap(),
            SourcePolygon::new(
                "house",
                vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)],
                1,
            )
            .unwrap(),
        ];
        let categories = CategoryTable::from_polygons(&polygons);

        let mut ctx = AssemblyContext::new();
        let stats = Assembler::new(&tiles, &polygons, &categories, 10.0)
            .run(&mut ctx)
            .unwrap();

        assert_eq!(stats.errors, 1);
        assert_eq!(stats.kept, 1);
        assert_eq!(ctx.mapping()[0].polygon_csv_idx, 1);
    }
}
