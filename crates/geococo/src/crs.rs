//! Coordinate reference systems and the lon/lat -> tile CRS reprojection.
//!
//! The polygon table is always WGS-84 lon/lat (EPSG:4326). A tile either shares
//! that CRS ([`Reprojection::Native`]) or needs a forward map into its own
//! planar CRS ([`Reprojection::Reprojected`]). The choice is made once per tile
//! when it is loaded, never per vertex.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod wgs84 {
    /// Semi-major axis (equatorial radius) in meters.
    pub const A: f64 = 6_378_137.0;
}

/// EPSG code of the polygon table's native CRS.
pub const NATIVE_EPSG: u32 = 4326;

/// A CRS identified by its EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Crs {
    pub epsg: u32,
}

impl Crs {
    pub const WGS84: Crs = Crs { epsg: NATIVE_EPSG };

    pub const fn epsg(epsg: u32) -> Self {
        Self { epsg }
    }

    pub fn is_native(self) -> bool {
        self.epsg == NATIVE_EPSG
    }
}

impl Default for Crs {
    fn default() -> Self {
        Crs::WGS84
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg)
    }
}

impl FromStr for Crs {
    type Err = Error;

    /// Accepts `EPSG:3857`, `epsg:3857`, a bare `3857`, and `CRS:84` / `OGC:CRS84`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();

        if matches!(upper.as_str(), "CRS:84" | "CRS84" | "OGC:CRS84") {
            return Ok(Crs::WGS84);
        }

        let code = upper.strip_prefix("EPSG:").unwrap_or(&upper);
        code.parse::<u32>()
            .map(Crs::epsg)
            .map_err(|_| Error::UnsupportedCrs(trimmed.to_owned()))
    }
}

impl From<Crs> for String {
    fn from(crs: Crs) -> Self {
        crs.to_string()
    }
}

impl TryFrom<String> for Crs {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Map between WGS-84 lon/lat (degrees) and a tile CRS.
///
/// A point outside the target projection's domain maps to NaN; callers check
/// finiteness where it matters.
pub trait Transformer: Send + Sync + fmt::Debug {
    fn forward(&self, lon: f64, lat: f64) -> (f64, f64);

    /// Tile CRS back to lon/lat; used for tile footprints, not per vertex.
    fn inverse(&self, x: f64, y: f64) -> (f64, f64);
}

/// Spherical Web Mercator (EPSG:3857), evaluated inline.
#[derive(Debug, Clone, Copy)]
pub struct WebMercator;

impl Transformer for WebMercator {
    #[inline]
    fn forward(&self, lon: f64, lat: f64) -> (f64, f64) {
        let x = wgs84::A * lon.to_radians();
        let y = wgs84::A * (std::f64::consts::FRAC_PI_4 + lat.to_radians() * 0.5).tan().ln();
        (x, y)
    }

    fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let lon = (x / wgs84::A).to_degrees();
        let lat = (2.0 * (y / wgs84::A).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
        (lon, lat)
    }
}

/// proj4 definition of an EPSG code, from the bundled EPSG registry.
fn proj_definition(crs: Crs) -> Option<&'static str> {
    let code = u16::try_from(crs.epsg).ok()?;
    crs_definitions::from_code(code).map(|def| def.proj4)
}

fn is_geographic(definition: &str) -> bool {
    definition.contains("+proj=longlat") || definition.contains("+proj=latlong")
}

/// Any CRS with a proj4 definition, projected with `proj4rs`.
pub struct ProjTransformer {
    crs: Crs,
    lonlat: Proj,
    target: Proj,
    target_is_geographic: bool,
}

impl fmt::Debug for ProjTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjTransformer")
            .field("crs", &self.crs)
            .field("target_is_geographic", &self.target_is_geographic)
            .finish_non_exhaustive()
    }
}

impl ProjTransformer {
    pub fn new(crs: Crs) -> Result<Self> {
        let parse = |crs: Crs| -> Result<(Proj, bool)> {
            let definition =
                proj_definition(crs).ok_or_else(|| Error::UnsupportedCrs(crs.to_string()))?;
            let proj = Proj::from_proj_string(definition)
                .map_err(|e| Error::UnsupportedCrs(format!("{crs}: {e:?}")))?;
            Ok((proj, is_geographic(definition)))
        };

        let (lonlat, _) = parse(Crs::WGS84)?;
        let (target, target_is_geographic) = parse(crs)?;
        Ok(Self {
            crs,
            lonlat,
            target,
            target_is_geographic,
        })
    }

    fn run(
        &self,
        (src, src_geo): (&Proj, bool),
        (dst, dst_geo): (&Proj, bool),
        x: f64,
        y: f64,
    ) -> (f64, f64) {
        let mut point = if src_geo {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };

        match transform(src, dst, &mut point) {
            Ok(()) if dst_geo => (point.0.to_degrees(), point.1.to_degrees()),
            Ok(()) => (point.0, point.1),
            Err(e) => {
                log::trace!("{}: ({x}, {y}) failed to transform: {e:?}", self.crs);
                (f64::NAN, f64::NAN)
            }
        }
    }
}

impl Transformer for ProjTransformer {
    fn forward(&self, lon: f64, lat: f64) -> (f64, f64) {
        let target = (&self.target, self.target_is_geographic);
        self.run((&self.lonlat, true), target, lon, lat)
    }

    fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let target = (&self.target, self.target_is_geographic);
        self.run(target, (&self.lonlat, true), x, y)
    }
}

/// How a tile's pixels relate to the polygon table's lon/lat.
#[derive(Debug, Clone)]
pub enum Reprojection {
    /// Tile CRS is lon/lat already.
    Native,
    /// Tile CRS differs; vertices go through the shared transformer first.
    Reprojected(Arc<dyn Transformer>),
}

impl Reprojection {
    #[inline]
    pub fn apply(&self, lon: f64, lat: f64) -> (f64, f64) {
        match self {
            Reprojection::Native => (lon, lat),
            Reprojection::Reprojected(t) => t.forward(lon, lat),
        }
    }

    #[inline]
    pub fn unapply(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Reprojection::Native => (x, y),
            Reprojection::Reprojected(t) => t.inverse(x, y),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Reprojection::Native)
    }
}

fn build_transformer(crs: Crs) -> Result<Arc<dyn Transformer>> {
    match crs.epsg {
        3857 | 900_913 => Ok(Arc::new(WebMercator)),
        _ => Ok(Arc::new(ProjTransformer::new(crs)?)),
    }
}

/// Memoizes one transformer per distinct CRS; shared read-only afterwards.
#[derive(Debug, Default)]
pub struct ReprojectionCache {
    cache: RwLock<HashMap<Crs, Arc<dyn Transformer>>>,
}

impl ReprojectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the reprojection for a tile in `crs`.
    pub fn get(&self, crs: Crs) -> Result<Reprojection> {
        if crs.is_native() {
            return Ok(Reprojection::Native);
        }

        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(t) = cache.get(&crs) {
                return Ok(Reprojection::Reprojected(t.clone()));
            }
        }

        let transformer = build_transformer(crs)?;
        log::debug!("built transformer EPSG:{} -> {}", NATIVE_EPSG, crs);

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let shared = cache.entry(crs).or_insert(transformer).clone();
        Ok(Reprojection::Reprojected(shared))
    }

    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn parses_common_spellings() {
        assert_eq!("EPSG:3857".parse::<Crs>().unwrap(), Crs::epsg(3857));
        assert_eq!("epsg:32630".parse::<Crs>().unwrap(), Crs::epsg(32630));
        assert_eq!("4326".parse::<Crs>().unwrap(), Crs::WGS84);
        assert_eq!("OGC:CRS84".parse::<Crs>().unwrap(), Crs::WGS84);
        assert!("EPSG:abc".parse::<Crs>().is_err());
    }

    #[test]
    fn web_mercator_reference_points() {
        let (x, y) = WebMercator.forward(0.0, 0.0);
        assert_abs_diff_eq!(x, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(y, 0.0, epsilon = 1e-9);

        let (x, _) = WebMercator.forward(180.0, 0.0);
        assert_abs_diff_eq!(x, 20_037_508.342_789_244, epsilon = 1e-6);

        let (x, y) = WebMercator.forward(-7.6, 33.57);
        let (lon, lat) = WebMercator.inverse(x, y);
        assert_abs_diff_eq!(lon, -7.6, epsilon = 1e-9);
        assert_abs_diff_eq!(lat, 33.57, epsilon = 1e-9);
    }

    #[test]
    fn utm_central_meridian_and_zone_edge() {
        // Zone 31N is centred on 3°E.
        let tm = ProjTransformer::new(Crs::epsg(32631)).unwrap();
        let (e, n) = tm.forward(3.0, 0.0);
        assert_abs_diff_eq!(e, 500_000.0, epsilon = 1e-3);
        assert_abs_diff_eq!(n, 0.0, epsilon = 1e-3);

        // Greenwich on the equator, a published reference value.
        let (e, n) = tm.forward(0.0, 0.0);
        assert_abs_diff_eq!(e, 166_021.443_1, epsilon = 1e-2);
        assert_abs_diff_eq!(n, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn utm_inverse_round_trips() {
        let tm = ProjTransformer::new(Crs::epsg(32629)).unwrap();
        for &(lon, lat) in &[(-9.0, 33.5), (-7.6, 31.63), (-11.2, 35.0)] {
            let (x, y) = tm.forward(lon, lat);
            let (lon2, lat2) = tm.inverse(x, y);
            assert_abs_diff_eq!(lon2, lon, epsilon = 1e-7);
            assert_abs_diff_eq!(lat2, lat, epsilon = 1e-7);
        }
    }

    #[test]
    fn utm_south_uses_false_northing() {
        let tm = ProjTransformer::new(Crs::epsg(32730)).unwrap();
        let (_, n) = tm.forward(-3.0, -10.0);
        assert!(n > 8_000_000.0 && n < 10_000_000.0);
    }

    #[test]
    fn lambert_conformal_crs_round_trips() {
        // Merchich / Nord Maroc: Lambert conformal conic on Clarke 1880.
        let lcc = ProjTransformer::new(Crs::epsg(26191)).unwrap();
        let (x, y) = lcc.forward(-7.6, 33.57);
        assert!(x > 250_000.0 && x < 350_000.0, "x = {x}");
        assert!(y > 300_000.0 && y < 360_000.0, "y = {y}");

        let (lon, lat) = lcc.inverse(x, y);
        assert_abs_diff_eq!(lon, -7.6, epsilon = 1e-6);
        assert_abs_diff_eq!(lat, 33.57, epsilon = 1e-6);
    }

    #[test]
    fn cache_builds_one_transformer_per_crs() {
        let cache = ReprojectionCache::new();
        assert!(cache.get(Crs::WGS84).unwrap().is_native());
        assert!(cache.is_empty());

        let a = cache.get(Crs::epsg(32629)).unwrap();
        let b = cache.get(Crs::epsg(32629)).unwrap();
        cache.get(Crs::epsg(3857)).unwrap();
        assert_eq!(cache.len(), 2);

        match (a, b) {
            (Reprojection::Reprojected(a), Reprojection::Reprojected(b)) => {
                assert!(Arc::ptr_eq(&a, &b))
            }
            _ => panic!("expected reprojected tiles"),
        }
    }

    #[test]
    fn unknown_crs_is_rejected() {
        let cache = ReprojectionCache::new();
        assert!(matches!(
            cache.get(Crs::epsg(99_999)),
            Err(Error::UnsupportedCrs(_))
        ));
        assert!(cache.is_empty());
    }
}
