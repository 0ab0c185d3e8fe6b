//! COCO detection dataset model, the traceability mapping, and the
//! referential-integrity check run after assembly and by `validate`.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metrics::BBox;

pub const SUPERCATEGORY: &str = "building";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub description: String,
    pub version: String,
    pub year: i32,
    pub contributor: String,
    pub date_created: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct License {
    pub id: u32,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub file_name: String,
    pub license: u32,
    pub date_captured: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: u64,
    pub image_id: u32,
    pub category_id: u32,
    pub segmentation: Vec<Vec<i64>>,
    pub area: f64,
    pub bbox: BBox,
    pub iscrowd: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: u32,
    pub name: String,
    pub supercategory: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub info: Info,
    pub licenses: Vec<License>,
    pub images: Vec<Image>,
    pub annotations: Vec<Annotation>,
    pub categories: Vec<Category>,
}

/// Links one annotation back to the tile and polygon-table row it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub annotation_id: u64,
    pub image_id: u32,
    pub image_filename: String,
    /// 0-based data row of the polygon table as read from disk (header
    /// excluded). Rows skipped at load time do not renumber later rows, so
    /// this is not a position in the filtered, re-indexed table: with a
    /// skipped row 1, the table's third data row is still `2` here, not `1`.
    pub polygon_csv_idx: usize,
    pub category_name: String,
    pub category_id: u32,
    pub bbox: BBox,
    pub area: f64,
}

/// `out/train.json` -> `out/train_mapping.json`.
pub fn mapping_path_for(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!("{stem}_mapping.json"))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_dataset(path: &Path) -> Result<Dataset> {
    read_json(path)
}

pub fn read_mapping(path: &Path) -> Result<Vec<MappingRecord>> {
    read_json(path)
}

/// Counts plus every integrity violation found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub images: usize,
    pub annotations: usize,
    pub categories: usize,
    pub mapping_records: Option<usize>,
    pub violations: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// `Error::Integrity` listing the first few violations.
    pub fn into_result(self) -> Result<Self> {
        if self.is_valid() {
            return Ok(self);
        }

        let mut msg = self
            .violations
            .iter()
            .take(5)
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        if self.violations.len() > 5 {
            msg.push_str(&format!(" (+{} more)", self.violations.len() - 5));
        }
        Err(Error::Integrity(msg))
    }
}

impl Dataset {
    pub fn validate(&self) -> ValidationReport {
        validate(self, None)
    }
}

fn duplicates<I: IntoIterator<Item = u64>>(ids: I) -> Vec<u64> {
    let mut seen = HashSet::new();
    let mut dups: Vec<u64> = ids.into_iter().filter(|id| !seen.insert(*id)).collect();
    dups.sort_unstable();
    dups.dedup();
    dups
}

/// Check ids, references and annotation shapes; with `mapping`, also check
/// that it pairs one-to-one with the annotations.
pub fn validate(dataset: &Dataset, mapping: Option<&[MappingRecord]>) -> ValidationReport {
    let mut report = ValidationReport {
        images: dataset.images.len(),
        annotations: dataset.annotations.len(),
        categories: dataset.categories.len(),
        mapping_records: mapping.map(|m| m.len()),
        violations: Vec::new(),
    };
    let v = &mut report.violations;

    for id in duplicates(dataset.images.iter().map(|i| u64::from(i.id))) {
        v.push(format!("duplicate image id {id}"));
    }
    for id in duplicates(dataset.categories.iter().map(|c| u64::from(c.id))) {
        v.push(format!("duplicate category id {id}"));
    }

    let licenses: HashSet<u32> = dataset.licenses.iter().map(|l| l.id).collect();
    for image in &dataset.images {
        if !licenses.contains(&image.license) {
            v.push(format!("image {} references unknown license {}", image.id, image.license));
        }
    }

    let images: HashMap<u32, &Image> = dataset.images.iter().map(|i| (i.id, i)).collect();
    let categories: HashMap<u32, &Category> =
        dataset.categories.iter().map(|c| (c.id, c)).collect();

    for (pos, ann) in dataset.annotations.iter().enumerate() {
        let expected = pos as u64 + 1;
        if ann.id != expected {
            v.push(format!(
                "annotation ids are not contiguous: position {pos} holds id {}, expected {expected}",
                ann.id
            ));
        }
        if !images.contains_key(&ann.image_id) {
            v.push(format!("annotation {} references unknown image {}", ann.id, ann.image_id));
        }
        if !categories.contains_key(&ann.category_id) {
            v.push(format!(
                "annotation {} references unknown category {}",
                ann.id, ann.category_id
            ));
        }
        if ann.iscrowd != 0 {
            v.push(format!("annotation {} has iscrowd {}", ann.id, ann.iscrowd));
        }
        if ann.bbox[2] < 0 || ann.bbox[3] < 0 {
            v.push(format!("annotation {} has negative bbox extent", ann.id));
        }
        match ann.segmentation.as_slice() {
            [ring] if ring.len() >= 6 && ring.len() % 2 == 0 => {}
            _ => v.push(format!(
                "annotation {} segmentation is not a single ring of at least 3 points",
                ann.id
            )),
        }
    }

    if let Some(mapping) = mapping {
        if mapping.len() != dataset.annotations.len() {
            v.push(format!(
                "mapping has {} records for {} annotations",
                mapping.len(),
                dataset.annotations.len()
            ));
        }

        for (rec, ann) in mapping.iter().zip(&dataset.annotations) {
            let category = categories.get(&rec.category_id);
            let image = images.get(&rec.image_id);
            let consistent = rec.annotation_id == ann.id
                && rec.image_id == ann.image_id
                && rec.category_id == ann.category_id
                && rec.bbox == ann.bbox
                && category.is_some_and(|c| c.name == rec.category_name)
                && image.is_some_and(|i| i.file_name == rec.image_filename);
            if !consistent {
                v.push(format!(
                    "mapping record for annotation {} disagrees with the dataset",
                    rec.annotation_id
                ));
            }
        }
    }

    report
}
