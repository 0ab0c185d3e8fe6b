//! Polygon/tile selection: a coarse lon/lat test, a fine pixel-bounds test,
//! per-axis clamping and the minimum-area threshold.

use geo::{coord, BoundingRect, Intersects, Rect};
use rstar::{RTree, RTreeObject, AABB};

use crate::affine::Bounds;
use crate::metrics;
use crate::polygons::SourcePolygon;
use crate::projector::Pixel;

#[derive(Clone)]
struct PolygonBox {
    idx: u32,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for PolygonBox {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

/// R-tree over polygon envelopes, used to pre-select coarse candidates.
pub struct PolygonIndex {
    tree: RTree<PolygonBox>,
}

impl PolygonIndex {
    pub fn build(polygons: &[SourcePolygon]) -> Self {
        let boxes: Vec<PolygonBox> = polygons
            .iter()
            .enumerate()
            .filter_map(|(idx, polygon)| {
                let rect = polygon.shape().bounding_rect()?;
                Some(PolygonBox {
                    idx: idx as u32,
                    env: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();

        Self {
            tree: RTree::bulk_load(boxes),
        }
    }

    /// Indices of polygons whose envelope meets `bounds`, ascending.
    pub fn candidates(&self, bounds: &Bounds) -> Vec<usize> {
        let query = AABB::from_corners([bounds.left, bounds.bottom], [bounds.right, bounds.top]);
        let mut out: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&query)
            .map(|b| b.idx as usize)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

pub fn tile_rect(bounds: &Bounds) -> Rect<f64> {
    Rect::new(
        coord! { x: bounds.left, y: bounds.bottom },
        coord! { x: bounds.right, y: bounds.top },
    )
}

/// Coarse test: the lon/lat ring meets the tile footprint. Touching counts.
pub fn intersects_tile(polygon: &SourcePolygon, tile: &Rect<f64>) -> bool {
    polygon.shape().intersects(tile)
}

/// Fine test on the unclipped pixel ring: false only when the ring's bounding
/// box lies entirely to one side of the tile.
pub fn within_tile(ring: &[Pixel], width: u32, height: u32) -> bool {
    let Some([x, y, w, h]) = metrics::bbox(ring) else {
        return false;
    };
    let (width, height) = (i64::from(width), i64::from(height));

    !(x + w < 0 || x > width || y + h < 0 || y > height)
}

/// Clamp every vertex into `[0, width] x [0, height]` independently per axis.
/// This is not a polygon/rectangle intersection; vertex count is unchanged.
pub fn clamp_to_tile(ring: &[Pixel], width: u32, height: u32) -> Vec<Pixel> {
    let (width, height) = (i64::from(width), i64::from(height));
    ring.iter()
        .map(|&(x, y)| (x.clamp(0, width), y.clamp(0, height)))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    Kept { ring: Vec<Pixel>, area: f64 },
    Outside,
    TooSmall { area: f64 },
}

/// Fine test, clamp and area threshold for one tile.
#[derive(Debug, Clone, Copy)]
pub struct SpatialFilter {
    min_area: f64,
}

impl SpatialFilter {
    pub fn new(min_area: f64) -> Self {
        Self { min_area }
    }

    pub fn min_area(&self) -> f64 {
        self.min_area
    }

    pub fn apply(&self, ring: &[Pixel], width: u32, height: u32) -> FilterOutcome {
        if !within_tile(ring, width, height) {
            return FilterOutcome::Outside;
        }

        let clipped = clamp_to_tile(ring, width, height);
        let area = metrics::area(&clipped);
        if area > self.min_area {
            FilterOutcome::Kept {
                ring: clipped,
                area,
            }
        } else {
            FilterOutcome::TooSmall { area }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, size: f64, row: usize) -> SourcePolygon {
        SourcePolygon::new(
            "house",
            vec![(x0, y0), (x0 + size, y0), (x0 + size, y0 + size), (x0, y0 + size)],
            row,
        )
        .unwrap()
    }

    #[test]
    fn index_returns_sorted_candidates() {
        let polys = vec![
            square(5.0, 5.0, 1.0, 0),
            square(50.0, 50.0, 1.0, 1),
            square(0.0, 0.0, 1.0, 2),
        ];
        let index = PolygonIndex::build(&polys);
        assert_eq!(index.len(), 3);

        let b = Bounds {
            left: 0.0,
            bottom: 0.0,
            right: 10.0,
            top: 10.0,
        };
        assert_eq!(index.candidates(&b), vec![0, 2]);
    }

    #[test]
    fn coarse_test_counts_touching() {
        let rect = tile_rect(&Bounds {
            left: 0.0,
            bottom: 0.0,
            right: 10.0,
            top: 10.0,
        });
        assert!(intersects_tile(&square(2.0, 2.0, 1.0, 0), &rect));
        assert!(intersects_tile(&square(10.0, 3.0, 1.0, 0), &rect));
        assert!(!intersects_tile(&square(10.5, 3.0, 1.0, 0), &rect));
    }

    #[test]
    fn fine_test_rejects_only_fully_outside() {
        let ring = [(-20, 5), (-5, 5), (-5, 15)];
        assert!(!within_tile(&ring, 640, 640));

        let ring = [(-20, 5), (5, 5), (5, 15)];
        assert!(within_tile(&ring, 640, 640));

        // Edges are inclusive.
        let ring = [(640, 0), (700, 0), (700, 10)];
        assert!(within_tile(&ring, 640, 640));

        let ring = [(10, 641), (20, 641), (20, 700)];
        assert!(!within_tile(&ring, 640, 640));
    }

    #[test]
    fn clamp_is_per_axis() {
        let ring = [(-5, 10), (700, -3), (20, 800)];
        assert_eq!(
            clamp_to_tile(&ring, 640, 640),
            vec![(0, 10), (640, 0), (20, 640)]
        );
    }

    #[test]
    fn clipped_area_never_exceeds_unclipped() {
        let rings: [&[Pixel]; 3] = [
            &[(-10, -10), (20, -10), (20, 20), (-10, 20)],
            &[(600, 600), (700, 600), (700, 700), (600, 700)],
            &[(100, 100), (120, 100), (120, 120), (100, 120)],
        ];
        for ring in rings {
            let clipped = clamp_to_tile(ring, 640, 640);
            assert!(metrics::area(&clipped) <= metrics::area(ring));
        }
    }

    #[test]
    fn threshold_is_strict() {
        let filter = SpatialFilter::new(100.0);
        let exact = [(10, 10), (20, 10), (20, 20), (10, 20)];
        assert_eq!(
            filter.apply(&exact, 640, 640),
            FilterOutcome::TooSmall { area: 100.0 }
        );

        let filter = SpatialFilter::new(10.0);
        assert_eq!(
            filter.apply(&exact, 640, 640),
            FilterOutcome::Kept {
                ring: exact.to_vec(),
                area: 100.0
            }
        );
    }

    #[test]
    fn outside_ring_is_not_measured() {
        let filter = SpatialFilter::new(10.0);
        let far = [(1000, 1000), (1100, 1000), (1100, 1100)];
        assert_eq!(filter.apply(&far, 640, 640), FilterOutcome::Outside);
        assert_eq!(filter.apply(&[], 640, 640), FilterOutcome::Outside);
    }
}
