use std::collections::HashMap;

use crate::coco::{Category, SUPERCATEGORY};
use crate::error::{Error, Result};
use crate::polygons::SourcePolygon;

/// Label -> category id, numbered 1.. in first-seen order over the retained
/// polygons. Built once per run and only read afterwards.
#[derive(Debug, Clone, Default)]
pub struct CategoryTable {
    categories: Vec<Category>,
    ids: HashMap<String, u32>,
}

impl CategoryTable {
    pub fn from_polygons(polygons: &[SourcePolygon]) -> Self {
        Self::from_labels(polygons.iter().map(|p| p.label.as_str()))
    }

    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let mut table = Self::default();
        for label in labels {
            if table.ids.contains_key(label) {
                continue;
            }
            let id = table.categories.len() as u32 + 1;
            table.ids.insert(label.to_owned(), id);
            table.categories.push(Category {
                id,
                name: label.to_owned(),
                supercategory: SUPERCATEGORY.to_owned(),
            });
        }
        table
    }

    pub fn id_of(&self, label: &str) -> Result<u32> {
        self.ids
            .get(label)
            .copied()
            .ok_or_else(|| Error::UnknownCategory {
                label: label.to_owned(),
            })
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_seen_order() {
        let table = CategoryTable::from_labels(["yes", "house", "yes", "school", "house"]);
        let names: Vec<_> = table.categories().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["yes", "house", "school"]);
        assert_eq!(table.id_of("yes").unwrap(), 1);
        assert_eq!(table.id_of("school").unwrap(), 3);
        assert!(table.categories().iter().all(|c| c.supercategory == "building"));
    }

    #[test]
    fn unknown_label_is_fatal() {
        let table = CategoryTable::from_labels(["house"]);
        let err = table.id_of("garage").unwrap_err();
        assert!(err.is_fatal());
    }
}
