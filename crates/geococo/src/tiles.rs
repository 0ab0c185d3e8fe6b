//! Raster tiles: discovery, header/georeference reading, footprints.
//!
//! Only headers are read. GeoTIFFs carry their own transform and CRS in the
//! GeoTIFF tags; any raster may instead come with an ESRI world file
//! (`.tfw`, `.jgw`, `.pgw`, `.wld`, ...), in which case the CRS comes from
//! configuration.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rayon::prelude::*;
use tiff::decoder::Decoder;
use tiff::tags::Tag;
use walkdir::WalkDir;

use crate::affine::{Affine, Bounds};
use crate::crs::{Crs, Reprojection, ReprojectionCache};
use crate::error::{Error, Result};
use crate::projector::Projector;

/// Extensions recognised as raster tiles (compared case-insensitively).
pub const RASTER_EXTENSIONS: [&str; 5] = ["tif", "tiff", "jpg", "jpeg", "png"];

// GeoTIFF tag ids.
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;

// GeoKey ids and values.
const GT_RASTER_TYPE_GEO_KEY: u32 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u32 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u32 = 3072;
const RASTER_PIXEL_IS_POINT: u32 = 2;
const USER_DEFINED: u32 = 32767;

/// Edge samples per side when mapping a reprojected footprint back to lon/lat.
const FOOTPRINT_SAMPLES: u32 = 16;

/// One geo-referenced raster tile.
#[derive(Debug, Clone)]
pub struct Tile {
    pub id: u32,
    pub filename: String,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub crs: Crs,
    pub transform: Affine,
    /// Footprint in lon/lat (EPSG:4326).
    pub geo_bounds: Bounds,
    projector: Projector,
}

impl Tile {
    pub fn new(
        id: u32,
        filename: impl Into<String>,
        width: u32,
        height: u32,
        crs: Crs,
        transform: Affine,
        cache: &ReprojectionCache,
    ) -> Result<Self> {
        let reprojection = cache.get(crs)?;
        let projector = Projector::new(&transform, reprojection)?;
        let geo_bounds = footprint(&transform, projector.reprojection(), width, height);
        let filename = filename.into();

        Ok(Self {
            id,
            path: PathBuf::from(&filename),
            filename,
            width,
            height,
            crs,
            transform,
            geo_bounds,
            projector,
        })
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn projector(&self) -> &Projector {
        &self.projector
    }
}

/// Lon/lat bounds of the tile. For planar CRSs the edges are densified so
/// that curved meridians/parallels are covered.
fn footprint(transform: &Affine, reprojection: &Reprojection, width: u32, height: u32) -> Bounds {
    if reprojection.is_native() {
        return transform.bounds(width, height);
    }

    let (w, h) = (width as f64, height as f64);
    let mut out = Bounds {
        left: f64::INFINITY,
        bottom: f64::INFINITY,
        right: f64::NEG_INFINITY,
        top: f64::NEG_INFINITY,
    };

    for i in 0..=FOOTPRINT_SAMPLES {
        let t = i as f64 / FOOTPRINT_SAMPLES as f64;
        for (col, row) in [(t * w, 0.0), (t * w, h), (0.0, t * h), (w, t * h)] {
            let (x, y) = transform.forward(col, row);
            let (lon, lat) = reprojection.unapply(x, y);
            out.left = out.left.min(lon);
            out.right = out.right.max(lon);
            out.bottom = out.bottom.min(lat);
            out.top = out.top.max(lat);
        }
    }

    out
}

/// Dimensions and georeferencing read from a raster header.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterHeader {
    pub width: u32,
    pub height: u32,
    pub transform: Affine,
    /// `None` when the file does not say (world files never do).
    pub crs: Option<Crs>,
}

fn lower_ext(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn is_raster(path: &Path) -> bool {
    let ext = lower_ext(path);
    RASTER_EXTENSIONS.contains(&ext.as_str())
}

/// Raster files directly inside `dir`, sorted by file name.
pub fn discover_rasters(dir: &Path) -> Result<Vec<PathBuf>> {
    // Surface a missing or unreadable directory instead of an empty run.
    fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;

    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {e}", dir.display());
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_raster(path))
        .collect();

    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths)
}

/// Read width, height, transform and CRS without decoding pixels.
pub fn read_raster_header(path: &Path) -> Result<RasterHeader> {
    let raster_err = |reason: String| Error::Raster {
        path: path.to_path_buf(),
        reason,
    };

    let (width, height, tagged_transform, crs) = match lower_ext(path).as_str() {
        "tif" | "tiff" => read_geotiff(path)?,
        _ => {
            let size = imagesize::size(path).map_err(|e| raster_err(e.to_string()))?;
            let width = u32::try_from(size.width).map_err(|e| raster_err(e.to_string()))?;
            let height = u32::try_from(size.height).map_err(|e| raster_err(e.to_string()))?;
            (width, height, None, None)
        }
    };

    let transform = match tagged_transform {
        Some(t) => t,
        None => match find_world_file(path) {
            Some(world) => {
                debug!("{}: using world file {}", path.display(), world.display());
                read_world_file(&world)?
            }
            None => {
                return Err(Error::NotGeoreferenced {
                    path: path.to_path_buf(),
                })
            }
        },
    };

    Ok(RasterHeader {
        width,
        height,
        transform,
        crs,
    })
}

type GeoTiffHeader = (u32, u32, Option<Affine>, Option<Crs>);

fn read_geotiff(path: &Path) -> Result<GeoTiffHeader> {
    let raster_err = |e: tiff::TiffError| Error::Raster {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(raster_err)?;
    let (width, height) = decoder.dimensions().map_err(raster_err)?;

    let mut f64_tag = |id: u16| -> Result<Option<Vec<f64>>> {
        match decoder.find_tag(Tag::from_u16_exhaustive(id)).map_err(raster_err)? {
            Some(value) => Ok(Some(value.into_f64_vec().map_err(raster_err)?)),
            None => Ok(None),
        }
    };
    let matrix = f64_tag(MODEL_TRANSFORMATION)?;
    let scale = f64_tag(MODEL_PIXEL_SCALE)?;
    let tiepoint = f64_tag(MODEL_TIEPOINT)?;

    let keys = match decoder
        .find_tag(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY))
        .map_err(raster_err)?
    {
        Some(value) => parse_geo_keys(&value.into_u32_vec().map_err(raster_err)?),
        None => GeoKeys::default(),
    };

    let transform = transform_from_tags(matrix.as_deref(), scale.as_deref(), tiepoint.as_deref())
        .map(|t| {
            if keys.pixel_is_point {
                // Tie point refers to the pixel centre; move it to the corner.
                Affine {
                    c: t.c - 0.5 * t.a - 0.5 * t.b,
                    f: t.f - 0.5 * t.d - 0.5 * t.e,
                    ..t
                }
            } else {
                t
            }
        });

    Ok((width, height, transform, keys.crs()))
}

/// Affine from `ModelTransformationTag` (4x4 row-major) or from
/// `ModelPixelScaleTag` + the first `ModelTiepointTag` entry.
pub fn transform_from_tags(
    matrix: Option<&[f64]>,
    scale: Option<&[f64]>,
    tiepoint: Option<&[f64]>,
) -> Option<Affine> {
    if let Some(m) = matrix.filter(|m| m.len() >= 8) {
        return Some(Affine::new(m[0], m[1], m[3], m[4], m[5], m[7]));
    }

    match (scale, tiepoint) {
        (Some(s), Some(tp)) if s.len() >= 2 && tp.len() >= 6 => {
            let (sx, sy) = (s[0], s[1]);
            let (i, j, x, y) = (tp[0], tp[1], tp[3], tp[4]);
            Some(Affine::new(sx, 0.0, x - i * sx, 0.0, -sy, y + j * sy))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeoKeys {
    pub projected: Option<u32>,
    pub geographic: Option<u32>,
    pub pixel_is_point: bool,
}

impl GeoKeys {
    /// Projected CS wins over the geographic CS; user-defined codes are unknown.
    pub fn crs(&self) -> Option<Crs> {
        self.projected
            .or(self.geographic)
            .filter(|&code| code != 0 && code != USER_DEFINED)
            .map(Crs::epsg)
    }
}

/// Parse a GeoKeyDirectory: 4-short header, then `[key, location, count, value]`
/// entries. Only inline (`location == 0`) short values are read.
pub fn parse_geo_keys(dir: &[u32]) -> GeoKeys {
    let mut keys = GeoKeys::default();
    if dir.len() < 4 {
        return keys;
    }

    let count = dir[3] as usize;
    for entry in dir[4..].chunks_exact(4).take(count) {
        let (key, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 {
            continue;
        }

        match key {
            PROJECTED_CS_TYPE_GEO_KEY => keys.projected = Some(value),
            GEOGRAPHIC_TYPE_GEO_KEY => keys.geographic = Some(value),
            GT_RASTER_TYPE_GEO_KEY => keys.pixel_is_point = value == RASTER_PIXEL_IS_POINT,
            _ => {}
        }
    }

    keys
}

/// Sidecar candidates for `tile.jpg`: `tile.jgw`, `tile.jpgw`, `tile.wld`
/// (also upper-case).
fn find_world_file(path: &Path) -> Option<PathBuf> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mut chars = ext.chars();
    let first = chars.next()?;
    let last = chars.last().unwrap_or(first);

    let candidates = [format!("{first}{last}w"), format!("{ext}w"), "wld".to_owned()];
    candidates
        .iter()
        .flat_map(|c| [c.clone(), c.to_ascii_uppercase()])
        .map(|c| path.with_extension(c))
        .find(|p| p.is_file())
}

/// Six numbers: A, D, B, E, C, F.
pub fn read_world_file(path: &Path) -> Result<Affine> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse_world_file(&text).ok_or_else(|| Error::Raster {
        path: path.to_path_buf(),
        reason: "world file must hold six numbers".to_owned(),
    })
}

pub fn parse_world_file(text: &str) -> Option<Affine> {
    let mut values = [0.0_f64; 6];
    let mut tokens = text.split_whitespace();
    for v in values.iter_mut() {
        *v = tokens.next()?.parse().ok()?;
    }
    Some(Affine::from_world_file(values))
}

/// Load one tile; errors are per-tile and never abort the run.
pub fn load_tile(
    id: u32,
    path: &Path,
    default_crs: Crs,
    cache: &ReprojectionCache,
) -> Result<Tile> {
    let header = read_raster_header(path)?;
    let crs = header.crs.unwrap_or_else(|| {
        debug!("{}: no CRS in header, assuming {default_crs}", path.display());
        default_crs
    });

    let filename = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Tile::new(
        id,
        filename,
        header.width,
        header.height,
        crs,
        header.transform,
        cache,
    )?
    .with_path(path))
}

/// Loaded tiles (ascending id) and the files that could not be loaded.
#[derive(Debug, Default)]
pub struct TileSet {
    pub tiles: Vec<Tile>,
    pub skipped: Vec<(PathBuf, String)>,
}

/// Discover and load every tile in `dir`. Ids follow the sorted file list, so
/// a file that fails to load leaves a gap rather than shifting later ids.
pub fn load_tiles(dir: &Path, default_crs: Crs, cache: &ReprojectionCache) -> Result<TileSet> {
    let paths = discover_rasters(dir)?;
    info!("Found {} raster files in {}", paths.len(), dir.display());

    let results: Vec<(PathBuf, Result<Tile>)> = paths
        .into_par_iter()
        .enumerate()
        .map(|(idx, path)| {
            let tile = load_tile(idx as u32 + 1, &path, default_crs, cache);
            (path, tile)
        })
        .collect();

    let mut set = TileSet::default();
    for (path, result) in results {
        match result {
            Ok(tile) => {
                debug!(
                    "Tile {} {}: {}x{} {} bounds=[{:.6}, {:.6}, {:.6}, {:.6}]",
                    tile.id,
                    tile.filename,
                    tile.width,
                    tile.height,
                    tile.crs,
                    tile.geo_bounds.left,
                    tile.geo_bounds.bottom,
                    tile.geo_bounds.right,
                    tile.geo_bounds.top
                );
                set.tiles.push(tile);
            }
            Err(e) => {
                warn!("Error loading image {}: {e}", path.display());
                set.skipped.push((path, e.to_string()));
            }
        }
    }

    info!("Successfully loaded {} tiles", set.tiles.len());
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tiff::encoder::{colortype, TiffEncoder};

    /// 640x640 grey GeoTIFF: 0.5 m pixels, tie point at (630000, 3716000).
    fn write_geotiff(path: &Path, geo_keys: &[u16]) {
        let file = File::create(path).unwrap();
        let mut encoder = TiffEncoder::new(file).unwrap();
        let mut image = encoder.new_image::<colortype::Gray8>(640, 640).unwrap();
        image
            .encoder()
            .write_tag(Tag::Unknown(MODEL_PIXEL_SCALE), &[0.5f64, 0.5, 0.0][..])
            .unwrap();
        image
            .encoder()
            .write_tag(
                Tag::Unknown(MODEL_TIEPOINT),
                &[0.0f64, 0.0, 0.0, 630_000.0, 3_716_000.0, 0.0][..],
            )
            .unwrap();
        image
            .encoder()
            .write_tag(Tag::Unknown(GEO_KEY_DIRECTORY), geo_keys)
            .unwrap();
        image.write_data(&vec![0u8; 640 * 640]).unwrap();
    }

    #[test]
    fn native_tile_bounds_follow_transform() {
        let cache = ReprojectionCache::new();
        let tile = Tile::new(
            1,
            "a.tif",
            640,
            640,
            Crs::WGS84,
            Affine::new(1.0, 0.0, 0.0, 0.0, -1.0, 640.0),
            &cache,
        )
        .unwrap();

        assert_eq!(tile.geo_bounds.left, 0.0);
        assert_eq!(tile.geo_bounds.top, 640.0);
        assert!(tile.projector().reprojection().is_native());
    }

    #[test]
    fn utm_tile_footprint_is_in_degrees() {
        let cache = ReprojectionCache::new();
        // 640 px of 0.5 m around Casablanca in UTM 29N.
        let tile = Tile::new(
            7,
            "casa.tif",
            640,
            640,
            Crs::epsg(32629),
            Affine::new(0.5, 0.0, 630_000.0, 0.0, -0.5, 3_716_000.0),
            &cache,
        )
        .unwrap();

        let b = tile.geo_bounds;
        assert!(b.left > -7.9 && b.right < -7.5, "{b:?}");
        assert!(b.bottom > 33.4 && b.top < 33.7, "{b:?}");
        // 320 m of easting is roughly 0.0034 degrees at this latitude.
        assert_abs_diff_eq!(b.right - b.left, 0.00345, epsilon = 2e-4);
    }

    #[test]
    fn unsupported_crs_fails_the_tile() {
        let cache = ReprojectionCache::new();
        let err = Tile::new(
            1,
            "x.tif",
            10,
            10,
            Crs::epsg(99_999),
            Affine::new(1.0, 0.0, 0.0, 0.0, -1.0, 0.0),
            &cache,
        )
        .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn transform_from_scale_and_tiepoint() {
        let t = transform_from_tags(
            None,
            Some(&[0.5, 0.5, 0.0]),
            Some(&[0.0, 0.0, 0.0, 333_000.0, 3_716_000.0, 0.0]),
        )
        .unwrap();
        assert_eq!(t, Affine::new(0.5, 0.0, 333_000.0, 0.0, -0.5, 3_716_000.0));
    }

    #[test]
    fn transform_matrix_wins() {
        let m = [
            2.0, 0.1, 0.0, 10.0, //
            0.2, -2.0, 0.0, 20.0, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ];
        let t = transform_from_tags(Some(&m), Some(&[1.0, 1.0, 0.0]), None).unwrap();
        assert_eq!(t, Affine::new(2.0, 0.1, 10.0, 0.2, -2.0, 20.0));
        assert!(transform_from_tags(None, Some(&[1.0, 1.0]), None).is_none());
    }

    #[test]
    fn geo_keys_prefer_projected_cs() {
        let dir = [1, 1, 0, 3, 1024, 0, 1, 1, 1025, 0, 1, 1, 3072, 0, 1, 32629];
        let keys = parse_geo_keys(&dir);
        assert_eq!(keys.crs(), Some(Crs::epsg(32629)));
        assert!(!keys.pixel_is_point);

        let dir = [1, 1, 0, 2, 2048, 0, 1, 4326, 1025, 0, 1, 2];
        let keys = parse_geo_keys(&dir);
        assert_eq!(keys.crs(), Some(Crs::WGS84));
        assert!(keys.pixel_is_point);

        let dir = [1, 1, 0, 1, 3072, 0, 1, USER_DEFINED];
        assert_eq!(parse_geo_keys(&dir).crs(), None);
    }

    #[test]
    fn world_file_parsing() {
        let t = parse_world_file("1.0\n0.0\n0.0\n-1.0\n0.5\n639.5\n").unwrap();
        assert_eq!(t, Affine::new(1.0, 0.0, 0.0, 0.0, -1.0, 640.0));
        assert!(parse_world_file("1.0\n0.0\n").is_none());
    }

    #[test]
    fn recognises_raster_extensions() {
        assert!(is_raster(Path::new("a/B.TIF")));
        assert!(is_raster(Path::new("tile_01.jpeg")));
        assert!(!is_raster(Path::new("tile_01.jgw")));
        assert!(!is_raster(Path::new("README")));
    }

    #[test]
    fn lambert_tile_footprint_is_in_degrees() {
        let cache = ReprojectionCache::new();
        // Merchich / Nord Maroc, 0.5 m pixels over Casablanca.
        let tile = Tile::new(
            1,
            "casa.tif",
            640,
            640,
            Crs::epsg(26191),
            Affine::new(0.5, 0.0, 300_000.0, 0.0, -0.5, 330_000.0),
            &cache,
        )
        .unwrap();

        let b = tile.geo_bounds;
        assert!(b.left > -7.8 && b.right < -7.3, "{b:?}");
        assert!(b.bottom > 33.4 && b.top < 33.75, "{b:?}");
        assert!(!tile.projector().reprojection().is_native());
    }

    #[test]
    fn geotiff_tags_drive_transform_and_crs() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("casa.tif");
        write_geotiff(&path, &[1, 1, 0, 2, 1024, 0, 1, 1, 3072, 0, 1, 32629]);

        let cache = ReprojectionCache::new();
        let tile = load_tile(4, &path, Crs::WGS84, &cache).unwrap();
        assert_eq!(tile.id, 4);
        assert_eq!(tile.filename, "casa.tif");
        assert_eq!((tile.width, tile.height), (640, 640));
        assert_eq!(tile.crs, Crs::epsg(32629));
        assert_eq!(
            tile.transform,
            Affine::new(0.5, 0.0, 630_000.0, 0.0, -0.5, 3_716_000.0)
        );

        let b = tile.geo_bounds;
        assert_abs_diff_eq!(b.left, -7.599, epsilon = 0.01);
        assert_abs_diff_eq!(b.top, 33.575, epsilon = 0.01);
    }

    #[test]
    fn geotiff_pixel_is_point_moves_tie_point_to_corner() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("point.tif");
        write_geotiff(
            &path,
            &[1, 1, 0, 3, 1024, 0, 1, 1, 1025, 0, 1, 2, 3072, 0, 1, 32629],
        );

        let header = read_raster_header(&path).unwrap();
        assert_eq!(header.crs, Some(Crs::epsg(32629)));
        assert_eq!(
            header.transform,
            Affine::new(0.5, 0.0, 629_999.75, 0.0, -0.5, 3_716_000.25)
        );
    }
}
