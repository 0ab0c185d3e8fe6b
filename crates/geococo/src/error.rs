use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read raster header of {path}: {reason}")]
    Raster { path: PathBuf, reason: String },

    #[error("{path} carries no georeferencing (no GeoTIFF tags and no world file)")]
    NotGeoreferenced { path: PathBuf },

    #[error("unsupported CRS '{0}' (no proj4 definition for this EPSG code)")]
    UnsupportedCrs(String),

    #[error("degenerate affine transform (determinant {det})")]
    DegenerateTransform { det: f64 },

    #[error("polygon row {row} has invalid geometry: {reason}")]
    InvalidGeometry { row: usize, reason: String },

    #[error("non-finite coordinate ({x}, {y}) in polygon row {row}")]
    NonFiniteCoordinate { row: usize, x: f64, y: f64 },

    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("polygon table {path} is missing required column '{column}'")]
    MissingColumn { path: PathBuf, column: &'static str },

    #[error("polygon row {row} has {rings} rings; only single-ring polygons are supported")]
    MultiRing { row: usize, rings: usize },

    #[error("category '{label}' was not registered in the category scan")]
    UnknownCategory { label: String },

    #[error("dataset integrity violated: {0}")]
    Integrity(String),

    #[error("json error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Fatal errors abort the run; the rest only cost the offending tile or row.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MissingColumn { .. }
                | Error::MultiRing { .. }
                | Error::UnknownCategory { .. }
                | Error::Integrity(_)
                | Error::Json { .. }
        )
    }
}
