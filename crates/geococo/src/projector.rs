use crate::affine::{Affine, InverseAffine};
use crate::crs::Reprojection;
use crate::error::Result;

/// Integer pixel position `(col, row)`.
pub type Pixel = (i64, i64);

/// Maps lon/lat into one tile's pixel grid.
///
/// Fractional pixel coordinates are truncated toward zero, the same as an
/// integer cast. For every coordinate inside the tile this equals `floor`.
#[derive(Debug, Clone)]
pub struct Projector {
    inverse: InverseAffine,
    reprojection: Reprojection,
}

impl Projector {
    pub fn new(transform: &Affine, reprojection: Reprojection) -> Result<Self> {
        Ok(Self {
            inverse: transform.inverse()?,
            reprojection,
        })
    }

    /// Fractional pixel coordinate of a lon/lat point.
    #[inline]
    pub fn to_pixel_f64(&self, lon: f64, lat: f64) -> (f64, f64) {
        let (x, y) = self.reprojection.apply(lon, lat);
        self.inverse.apply(x, y)
    }

    /// Integer pixel of a lon/lat point, or `None` when the tile CRS cannot
    /// represent it.
    #[inline]
    pub fn to_pixel(&self, lon: f64, lat: f64) -> Option<Pixel> {
        let (col, row) = self.to_pixel_f64(lon, lat);
        if !(col.is_finite() && row.is_finite()) {
            return None;
        }
        // `as` truncates toward zero and saturates far outside the i64 range.
        Some((col.trunc() as i64, row.trunc() as i64))
    }

    pub fn reprojection(&self) -> &Reprojection {
        &self.reprojection
    }
}
