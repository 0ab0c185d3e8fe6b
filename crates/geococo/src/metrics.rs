//! Area, bounding box and COCO segmentation of a pixel ring.

use crate::projector::Pixel;

/// COCO bbox: `[x_min, y_min, width, height]`.
pub type BBox = [i64; 4];

/// Shoelace area of `ring`, treated as closed (the last vertex connects back
/// to the first). Self-intersecting rings get the signed-area sum, which is
/// not their covered area.
pub fn area(ring: &[Pixel]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }

    let mut twice = 0.0_f64;
    let mut prev = ring[ring.len() - 1];
    for &cur in ring {
        twice += prev.0 as f64 * cur.1 as f64 - cur.0 as f64 * prev.1 as f64;
        prev = cur;
    }

    0.5 * twice.abs()
}

/// Axis-aligned bounding box of `ring`; `None` for an empty ring.
pub fn bbox(ring: &[Pixel]) -> Option<BBox> {
    let (mut xmin, mut ymin, mut xmax, mut ymax) = (i64::MAX, i64::MAX, i64::MIN, i64::MIN);
    for &(x, y) in ring {
        xmin = xmin.min(x);
        xmax = xmax.max(x);
        ymin = ymin.min(y);
        ymax = ymax.max(y);
    }

    (!ring.is_empty()).then_some([xmin, ymin, xmax - xmin, ymax - ymin])
}

/// `[[x1, y1, x2, y2, ...]]`: a single polygon part.
pub fn segmentation(ring: &[Pixel]) -> Vec<Vec<i64>> {
    let mut flat = Vec::with_capacity(ring.len() * 2);
    for &(x, y) in ring {
        flat.push(x);
        flat.push(y);
    }
    vec![flat]
}
