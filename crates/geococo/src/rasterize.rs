use crate::error::{Error, Result};
use crate::polygons::SourcePolygon;
use crate::projector::{Pixel, Projector};

/// A source polygon's exterior ring in one tile's pixel space.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelPolygon {
    pub tile_id: u32,
    pub ring: Vec<Pixel>,
    /// Index into the loaded polygon set (not the CSV row).
    pub source: usize,
}

/// Project every vertex of `polygon` in order. The output ring has the same
/// length and closure as the input.
pub fn rasterize(
    projector: &Projector,
    tile_id: u32,
    source: usize,
    polygon: &SourcePolygon,
) -> Result<PixelPolygon> {
    let ring = polygon
        .vertices()
        .map(|(lon, lat)| {
            if !(lon.is_finite() && lat.is_finite()) {
                return Err(Error::NonFiniteCoordinate {
                    row: polygon.row,
                    x: lon,
                    y: lat,
                });
            }
            projector
                .to_pixel(lon, lat)
                .ok_or(Error::NonFiniteCoordinate {
                    row: polygon.row,
                    x: lon,
                    y: lat,
                })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PixelPolygon {
        tile_id,
        ring,
        source,
    })
}
