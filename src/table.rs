use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::insights::Annotation;
use crate::places::PlaceRecord;

/// Cell value for any field the provider did not return.
pub const UNAVAILABLE: &str = "N/A";

pub const PLACE_COLUMNS: [&str; 11] = [
    "place_id",
    "name",
    "rating",
    "review_count",
    "categories",
    "phone",
    "open_now",
    "latitude",
    "longitude",
    "maps_url",
    "photo_references",
];

pub const ANNOTATION_COLUMNS: [&str; 4] = [
    "description",
    "area_commentary",
    "potential_score",
    "annotation_error",
];

/// Uniform row/column view over fetched places. Every row carries one cell
/// per column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl AggregatedTable {
    pub fn from_records(records: &[PlaceRecord]) -> Self {
        Self {
            columns: PLACE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: records.iter().map(record_cells).collect(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(index).map(String::as_str)
    }

    /// Derived copy without the given row indices. Indices past the end are
    /// ignored; kept rows stay in their original order.
    pub fn without_rows(&self, removed: &BTreeSet<usize>) -> Self {
        Self {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .enumerate()
                .filter(|(index, _)| !removed.contains(index))
                .map(|(_, row)| row.clone())
                .collect(),
        }
    }

    /// Appends the annotation columns, pairing annotations with rows by
    /// position. Rows without an annotation get the sentinel.
    pub fn with_annotations(&self, annotations: &[Option<Annotation>]) -> AppResult<Self> {
        if annotations.len() != self.rows.len() {
            return Err(AppError::Input(format!(
                "cannot merge {} annotations onto {} rows",
                annotations.len(),
                self.rows.len()
            )));
        }

        let mut columns = self.columns.clone();
        columns.extend(ANNOTATION_COLUMNS.iter().map(|c| c.to_string()));
        let rows = self
            .rows
            .iter()
            .zip(annotations)
            .map(|(row, annotation)| {
                let mut row = row.clone();
                row.extend(annotation_cells(annotation.as_ref()));
                row
            })
            .collect();
        Ok(Self { columns, rows })
    }

    pub fn to_csv(&self) -> AppResult<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| AppError::Io(err.into_error()))?;
        String::from_utf8(bytes)
            .map_err(|err| AppError::Input(format!("csv output was not UTF-8: {err}")))
    }

    pub fn from_csv(text: &str) -> AppResult<Self> {
        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Self { columns, rows })
    }

    pub fn write_csv(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_csv()?)?;
        Ok(())
    }
}

fn record_cells(record: &PlaceRecord) -> Vec<String> {
    vec![
        record.place_id.clone(),
        text_or_unavailable(record.name.as_deref()),
        display_or_unavailable(record.rating),
        display_or_unavailable(record.review_count),
        joined_or_unavailable(&record.categories, ", "),
        text_or_unavailable(record.phone.as_deref()),
        display_or_unavailable(record.open_now),
        display_or_unavailable(record.location.map(|loc| loc.lat)),
        display_or_unavailable(record.location.map(|loc| loc.lng)),
        text_or_unavailable(record.maps_url.as_deref()),
        joined_or_unavailable(&record.photo_references, "|"),
    ]
}

fn annotation_cells(annotation: Option<&Annotation>) -> Vec<String> {
    match annotation {
        Some(annotation) => vec![
            text_or_unavailable(annotation.description.as_deref()),
            text_or_unavailable(annotation.area_commentary.as_deref()),
            display_or_unavailable(annotation.potential_score),
            text_or_unavailable(annotation.error.as_deref()),
        ],
        None => vec![UNAVAILABLE.to_string(); ANNOTATION_COLUMNS.len()],
    }
}

fn text_or_unavailable(value: Option<&str>) -> String {
    value.unwrap_or(UNAVAILABLE).to_string()
}

fn display_or_unavailable<T: ToString>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| UNAVAILABLE.to_string())
}

fn joined_or_unavailable(values: &[String], separator: &str) -> String {
    if values.is_empty() {
        UNAVAILABLE.to_string()
    } else {
        values.join(separator)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::places::LatLng;

    fn full_record(id: &str) -> PlaceRecord {
        PlaceRecord {
            place_id: id.into(),
            name: Some(format!("Cafe {id}, Downtown")),
            rating: Some(4.5),
            review_count: Some(120),
            categories: vec!["cafe".into(), "food".into()],
            phone: None,
            open_now: Some(true),
            location: Some(LatLng {
                lat: 40.7128,
                lng: -74.006,
            }),
            maps_url: Some("https://maps.google.com/?cid=42".into()),
            photo_references: vec!["ref-a".into(), "ref-b".into()],
        }
    }

    fn five_rows() -> AggregatedTable {
        let records: Vec<_> = ["r0", "r1", "r2", "r3", "r4"]
            .iter()
            .map(|id| PlaceRecord::new(*id))
            .collect();
        AggregatedTable::from_records(&records)
    }

    #[test]
    fn heterogeneous_records_share_one_column_set() {
        let mut no_phone = full_record("a");
        no_phone.phone = None;
        let mut no_rating = full_record("b");
        no_rating.phone = Some("555-0100".into());
        no_rating.rating = None;

        let table = AggregatedTable::from_records(&[no_phone, no_rating]);

        assert_eq!(table.columns().len(), PLACE_COLUMNS.len());
        assert!(table.rows().iter().all(|row| row.len() == PLACE_COLUMNS.len()));
        assert_eq!(table.cell(0, "phone"), Some(UNAVAILABLE));
        assert_eq!(table.cell(1, "phone"), Some("555-0100"));
        assert_eq!(table.cell(1, "rating"), Some(UNAVAILABLE));
        assert_eq!(table.cell(0, "categories"), Some("cafe, food"));
    }

    #[test]
    fn missing_coordinates_render_as_unavailable() {
        let table = AggregatedTable::from_records(&[PlaceRecord::new("bare")]);

        assert_eq!(table.cell(0, "latitude"), Some(UNAVAILABLE));
        assert_eq!(table.cell(0, "longitude"), Some(UNAVAILABLE));
        assert_eq!(table.cell(0, "photo_references"), Some(UNAVAILABLE));
        assert_eq!(table.cell(0, "place_id"), Some("bare"));
    }

    #[test]
    fn removing_rows_preserves_order_and_is_idempotent() {
        let table = five_rows();
        let removed = BTreeSet::from([2]);

        let trimmed = table.without_rows(&removed);
        let again = table.without_rows(&removed);

        let ids: Vec<_> = (0..trimmed.len())
            .map(|i| trimmed.cell(i, "place_id").unwrap())
            .collect();
        assert_eq!(ids, vec!["r0", "r1", "r3", "r4"]);
        assert_eq!(trimmed, again);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn out_of_range_indices_are_ignored() {
        let table = five_rows();
        let trimmed = table.without_rows(&BTreeSet::from([0, 99]));
        assert_eq!(trimmed.len(), 4);
    }

    #[test]
    fn csv_round_trip_keeps_cells() {
        let mut sparse = PlaceRecord::new("sparse");
        sparse.name = Some("Quote \"Bar\"\nSecond line".into());
        let table = AggregatedTable::from_records(&[full_record("x"), sparse]);

        let parsed = AggregatedTable::from_csv(&table.to_csv().unwrap()).unwrap();

        assert_eq!(parsed, table);
        assert_eq!(parsed.cell(0, "rating"), Some("4.5"));
        assert_eq!(parsed.cell(0, "latitude"), Some("40.7128"));
    }

    #[test]
    fn csv_header_names_every_column() {
        let csv = AggregatedTable::from_records(&[]).to_csv().unwrap();
        assert_eq!(csv.trim_end(), PLACE_COLUMNS.join(","));
    }

    #[test]
    fn merges_annotations_by_position() {
        let table = AggregatedTable::from_records(&[full_record("a"), full_record("b")]);
        let annotations = vec![
            Some(Annotation {
                description: Some("Cozy corner cafe".into()),
                area_commentary: Some("Busy street".into()),
                potential_score: Some(8),
                error: None,
            }),
            Some(Annotation::failed("rate limited")),
        ];

        let merged = table.with_annotations(&annotations).unwrap();

        assert_eq!(merged.columns().len(), PLACE_COLUMNS.len() + ANNOTATION_COLUMNS.len());
        assert_eq!(merged.cell(0, "potential_score"), Some("8"));
        assert_eq!(merged.cell(0, "annotation_error"), Some(UNAVAILABLE));
        assert_eq!(merged.cell(1, "description"), Some(UNAVAILABLE));
        assert_eq!(merged.cell(1, "annotation_error"), Some("rate limited"));
    }

    #[test]
    fn rejects_misaligned_annotations() {
        let table = AggregatedTable::from_records(&[full_record("a")]);
        assert!(table.with_annotations(&[None, None]).is_err());
    }

    #[test]
    fn writes_export_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("place_details.csv");
        let table = AggregatedTable::from_records(&[full_record("a")]);

        table.write_csv(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(AggregatedTable::from_csv(&written).unwrap(), table);
    }
}
