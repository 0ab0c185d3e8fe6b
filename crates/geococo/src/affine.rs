//! Six-coefficient pixel -> CRS affine transform (rasterio / GDAL "Affine" order).
//!
//! ```text
//! x = a * col + b * row + c
//! y = d * col + e * row + f
//! ```
//!
//! For north-up tiles `b == d == 0`, `a` is the pixel width and `e` the
//! (negative) pixel height.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affine {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

/// Geographic (or CRS) extent as rasterio reports it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl Affine {
    pub const fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    /// Build from an ESRI world file (`A D B E C F`, C/F at the centre of the
    /// upper-left pixel).
    pub fn from_world_file(values: [f64; 6]) -> Self {
        let [a, d, b, e, cx, cy] = values;
        Self::new(a, b, cx - 0.5 * a - 0.5 * b, d, e, cy - 0.5 * d - 0.5 * e)
    }

    #[inline]
    pub fn determinant(&self) -> f64 {
        self.a * self.e - self.b * self.d
    }

    pub fn is_north_up(&self) -> bool {
        self.b == 0.0 && self.d == 0.0
    }

    /// Pixel (col, row) -> CRS (x, y).
    #[inline]
    pub fn forward(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.a * col + self.b * row + self.c,
            self.d * col + self.e * row + self.f,
        )
    }

    /// Checked inverse; a singular matrix cannot map points back to pixels.
    pub fn inverse(&self) -> Result<InverseAffine> {
        let det = self.determinant();
        if det == 0.0 || !det.is_finite() {
            return Err(Error::DegenerateTransform { det });
        }

        Ok(InverseAffine {
            fwd: *self,
            inv_det: 1.0 / det,
        })
    }

    /// CRS extent covered by a `width` x `height` raster.
    pub fn bounds(&self, width: u32, height: u32) -> Bounds {
        let (w, h) = (width as f64, height as f64);
        let corners = [
            self.forward(0.0, 0.0),
            self.forward(w, 0.0),
            self.forward(0.0, h),
            self.forward(w, h),
        ];

        let mut out = Bounds {
            left: f64::INFINITY,
            bottom: f64::INFINITY,
            right: f64::NEG_INFINITY,
            top: f64::NEG_INFINITY,
        };
        for (x, y) in corners {
            out.left = out.left.min(x);
            out.right = out.right.max(x);
            out.bottom = out.bottom.min(y);
            out.top = out.top.max(y);
        }
        out
    }
}

/// Precomputed inverse of an [`Affine`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InverseAffine {
    fwd: Affine,
    inv_det: f64,
}

impl InverseAffine {
    /// CRS (x, y) -> fractional pixel (col, row).
    ///
    /// With `b == d == 0` this is exactly `((x - c) / a, (y - f) / e)`.
    #[inline]
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let t = &self.fwd;
        if t.is_north_up() {
            return ((x - t.c) / t.a, (y - t.f) / t.e);
        }

        let dx = x - t.c;
        let dy = y - t.f;
        (
            (t.e * dx - t.b * dy) * self.inv_det,
            (t.a * dy - t.d * dx) * self.inv_det,
        )
    }
}
