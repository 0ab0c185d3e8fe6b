//! The building polygon table: CSV with a `building` label column and a
//! `geometry` column holding WKT in EPSG:4326.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use geo::{Geometry, LineString, Polygon};
use log::{debug, info, warn};
use wkt::TryFromWkt;

use crate::error::{Error, Result};

pub const LABEL_COLUMN: &str = "building";
pub const GEOMETRY_COLUMN: &str = "geometry";

/// One building footprint from the polygon table.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePolygon {
    pub label: String,
    /// 0-based data row in the source table (header excluded).
    pub row: usize,
    shape: Polygon<f64>,
}

impl SourcePolygon {
    /// Build from an exterior ring of `(lon, lat)`. The ring is closed if the
    /// caller left it open; fewer than three distinct vertices is rejected.
    pub fn new(label: impl Into<String>, ring: Vec<(f64, f64)>, row: usize) -> Result<Self> {
        if let Some(&(x, y)) = ring.iter().find(|(x, y)| !(x.is_finite() && y.is_finite())) {
            return Err(Error::NonFiniteCoordinate { row, x, y });
        }

        let distinct = distinct_vertices(&ring);
        if distinct < 3 {
            return Err(Error::InvalidGeometry {
                row,
                reason: format!("ring has {distinct} distinct vertices, need at least 3"),
            });
        }

        Ok(Self::from_ring_unchecked(label, ring, row))
    }

    pub(crate) fn from_ring_unchecked(
        label: impl Into<String>,
        ring: Vec<(f64, f64)>,
        row: usize,
    ) -> Self {
        // `Polygon::new` closes the exterior ring.
        Self {
            label: label.into(),
            row,
            shape: Polygon::new(LineString::from(ring), vec![]),
        }
    }

    pub fn shape(&self) -> &Polygon<f64> {
        &self.shape
    }

    /// Exterior ring vertices in order, closing vertex included.
    pub fn vertices(&self) -> impl ExactSizeIterator<Item = (f64, f64)> + '_ {
        self.shape.exterior().0.iter().map(|c| (c.x, c.y))
    }

    pub fn vertex_count(&self) -> usize {
        self.shape.exterior().0.len()
    }
}

fn distinct_vertices(ring: &[(f64, f64)]) -> usize {
    let mut keys: Vec<(u64, u64)> = ring
        .iter()
        .map(|&(x, y)| (x.to_bits(), y.to_bits()))
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys.len()
}

/// Parse one WKT cell into an exterior ring.
///
/// `Ok(None)` marks a row that is simply not usable (empty cell, point, line);
/// holes and multi-part polygons are a schema error.
fn parse_geometry(wkt_str: &str, row: usize) -> Result<Option<Vec<(f64, f64)>>> {
    let trimmed = wkt_str.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let geometry = Geometry::<f64>::try_from_wkt_str(trimmed).map_err(|e| Error::InvalidGeometry {
        row,
        reason: format!("unparsable WKT: {e}"),
    })?;

    let polygon = match geometry {
        Geometry::Polygon(p) => p,
        Geometry::MultiPolygon(mut mp) if mp.0.len() == 1 => mp.0.remove(0),
        Geometry::MultiPolygon(mp) => {
            let rings = mp.0.iter().map(|p| 1 + p.interiors().len()).sum();
            return Err(Error::MultiRing { row, rings });
        }
        _ => {
            debug!("row {row}: skipping non-polygon geometry");
            return Ok(None);
        }
    };

    if !polygon.interiors().is_empty() {
        return Err(Error::MultiRing {
            row,
            rings: 1 + polygon.interiors().len(),
        });
    }

    let (exterior, _) = polygon.into_inner();
    Ok(Some(exterior.0.into_iter().map(|c| (c.x, c.y)).collect()))
}

/// Retained polygons in table order plus how many rows were dropped.
#[derive(Debug, Clone, Default)]
pub struct PolygonTable {
    pub polygons: Vec<SourcePolygon>,
    pub skipped: usize,
}

pub fn load_polygon_table(path: &Path) -> Result<PolygonTable> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    read_polygon_table(file, path)
}

/// Read the table from any reader; `origin` only labels errors and logs.
pub fn read_polygon_table<R: Read>(reader: R, origin: &Path) -> Result<PolygonTable> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(reader);

    let headers = csv
        .headers()
        .map_err(|source| Error::Csv {
            path: origin.to_path_buf(),
            source,
        })?
        .clone();

    let column = |name: &'static str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| Error::MissingColumn {
                path: origin.to_path_buf(),
                column: name,
            })
    };
    let label_col = column(LABEL_COLUMN)?;
    let geometry_col = column(GEOMETRY_COLUMN)?;

    let mut table = PolygonTable::default();

    for (row, record) in csv.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("{}: row {row}: unreadable record: {e}", origin.display());
                table.skipped += 1;
                continue;
            }
        };

        let label = record.get(label_col).unwrap_or("").trim();
        if label.is_empty() {
            debug!("{}: row {row}: empty building label", origin.display());
            table.skipped += 1;
            continue;
        }

        let parsed = parse_geometry(record.get(geometry_col).unwrap_or(""), row)
            .and_then(|ring| ring.map(|ring| SourcePolygon::new(label, ring, row)).transpose());

        match parsed {
            Ok(Some(polygon)) => table.polygons.push(polygon),
            Ok(None) => table.skipped += 1,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("{}: {e}", origin.display());
                table.skipped += 1;
            }
        }
    }

    info!(
        "Loaded {} polygons from {} ({} rows skipped)",
        table.polygons.len(),
        origin.display(),
        table.skipped
    );

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(csv: &str) -> Result<PolygonTable> {
        read_polygon_table(csv.as_bytes(), Path::new("buildings.csv"))
    }

    #[test]
    fn new_closes_open_rings() {
        let p = SourcePolygon::new("house", vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)], 0).unwrap();
        assert_eq!(p.vertex_count(), 4);
        assert_eq!(p.vertices().next(), p.vertices().last());
    }

    #[test]
    fn new_rejects_degenerate_rings() {
        let err = SourcePolygon::new("house", vec![(0.0, 0.0), (1.0, 0.0), (0.0, 0.0)], 3)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidGeometry { row: 3, .. }));
    }

    #[test]
    fn reads_labels_and_rings_in_row_order() {
        let table = read(
            "building,geometry\n\
             house,\"POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))\"\n\
             yes,\"POLYGON((5 5, 6 5, 6 6, 5 5))\"\n",
        )
        .unwrap();

        assert_eq!(table.polygons.len(), 2);
        assert_eq!(table.skipped, 0);
        assert_eq!(table.polygons[0].label, "house");
        assert_eq!(table.polygons[0].vertex_count(), 5);
        assert_eq!(table.polygons[1].label, "yes");
        assert_eq!(table.polygons[1].row, 1);
    }

    #[test]
    fn keeps_source_row_index_across_skipped_rows() {
        let table = read(
            "geometry,building\n\
             ,house\n\
             \"POINT(1 2)\",house\n\
             \"POLYGON((0 0, 1 0, 1 1, 0 0))\",garage\n\
             not wkt,house\n\
             \"POLYGON((0 0, 1 0, 0 0))\",house\n",
        )
        .unwrap();

        assert_eq!(table.polygons.len(), 1);
        assert_eq!(table.polygons[0].row, 2);
        assert_eq!(table.polygons[0].label, "garage");
        assert_eq!(table.skipped, 4);
    }

    #[test]
    fn single_member_multipolygon_is_accepted() {
        let table = read(
            "building,geometry\n\
             school,\"MULTIPOLYGON(((0 0, 2 0, 2 2, 0 2, 0 0)))\"\n",
        )
        .unwrap();
        assert_eq!(table.polygons.len(), 1);
    }

    #[test]
    fn holes_abort_the_load() {
        let err = read(
            "building,geometry\n\
             house,\"POLYGON((0 0, 10 0, 10 10, 0 10, 0 0),(2 2, 3 2, 3 3, 2 2))\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::MultiRing { row: 0, rings: 2 }));
    }

    #[test]
    fn multipart_polygons_abort_the_load() {
        let err = read(
            "building,geometry\n\
             house,\"POLYGON((0 0, 1 0, 1 1, 0 0))\"\n\
             house,\"MULTIPOLYGON(((0 0, 1 0, 1 1, 0 0)),((5 5, 6 5, 6 6, 5 5)))\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::MultiRing { row: 1, rings: 2 }));
    }

    #[test]
    fn missing_column_is_reported() {
        let err = read("building,wkt\nhouse,x\n").unwrap_err();
        assert!(matches!(
            err,
            Error::MissingColumn {
                column: "geometry",
                ..
            }
        ));
    }
}
