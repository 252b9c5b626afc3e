use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::insights::Annotation;
use crate::places::{FetchReport, PlaceRecord, SkippedPlace};
use crate::table::AggregatedTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Stage {
    NotValidated,
    Validated,
    IdsSubmitted,
    DetailsFetched,
    PhotosFetched,
    Annotated,
    Exported,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::NotValidated => "not_validated",
            Stage::Validated => "validated",
            Stage::IdsSubmitted => "ids_submitted",
            Stage::DetailsFetched => "details_fetched",
            Stage::PhotosFetched => "photos_fetched",
            Stage::Annotated => "annotated",
            Stage::Exported => "exported",
        }
    }
}

/// State for one interaction. Fetched records are never mutated; removal,
/// photos and annotations are tracked by the record's original index.
#[derive(Debug)]
pub struct Session {
    stage: Stage,
    place_ids: Vec<String>,
    records: Vec<PlaceRecord>,
    skipped: Vec<SkippedPlace>,
    removed: BTreeSet<usize>,
    photos: BTreeMap<usize, Vec<String>>,
    annotations: BTreeMap<usize, Annotation>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            stage: Stage::NotValidated,
            place_ids: Vec::new(),
            records: Vec::new(),
            skipped: Vec::new(),
            removed: BTreeSet::new(),
            photos: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }
}

impl Session {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn place_ids(&self) -> &[String] {
        &self.place_ids
    }

    pub fn skipped(&self) -> &[SkippedPlace] {
        &self.skipped
    }

    pub fn mark_validated(&mut self) {
        if self.stage == Stage::NotValidated {
            self.stage = Stage::Validated;
        }
    }

    /// Starts a new batch, discarding everything from the previous one.
    pub fn submit_ids(&mut self, place_ids: Vec<String>) -> AppResult<()> {
        if self.stage == Stage::NotValidated {
            return Err(AppError::Session(
                "validate the maps key before submitting place ids".into(),
            ));
        }
        if place_ids.is_empty() {
            return Err(AppError::Input("enter at least one place id".into()));
        }
        self.place_ids = place_ids;
        self.records.clear();
        self.skipped.clear();
        self.removed.clear();
        self.photos.clear();
        self.annotations.clear();
        self.stage = Stage::IdsSubmitted;
        Ok(())
    }

    pub fn store_details(&mut self, report: FetchReport) -> AppResult<()> {
        self.require(Stage::IdsSubmitted, "store place details")?;
        self.records = report.records;
        self.skipped = report.skipped;
        self.stage = Stage::DetailsFetched;
        debug!(records = self.records.len(), "session details stored");
        Ok(())
    }

    /// Replaces the removal selection. Indices are positions in the fetched
    /// table, so applying the same selection again changes nothing.
    pub fn remove_rows(&mut self, indices: &BTreeSet<usize>) -> AppResult<()> {
        self.require_at_least(Stage::DetailsFetched, "remove rows")?;
        self.removed = indices
            .iter()
            .copied()
            .filter(|&index| index < self.records.len())
            .collect();
        Ok(())
    }

    pub fn removed_rows(&self) -> &BTreeSet<usize> {
        &self.removed
    }

    /// Records still in the view, in original order.
    pub fn kept_records(&self) -> Vec<PlaceRecord> {
        self.kept_indices()
            .into_iter()
            .map(|index| self.records[index].clone())
            .collect()
    }

    pub fn all_records(&self) -> &[PlaceRecord] {
        &self.records
    }

    /// Photo URLs for the kept rows, aligned with `kept_records`.
    pub fn store_photos(&mut self, photos: Vec<Vec<String>>) -> AppResult<()> {
        self.require_at_least(Stage::DetailsFetched, "store photos")?;
        let kept = self.kept_indices();
        if photos.len() != kept.len() {
            return Err(AppError::Input(format!(
                "expected photos for {} rows, got {}",
                kept.len(),
                photos.len()
            )));
        }
        for (index, urls) in kept.into_iter().zip(photos) {
            self.photos.insert(index, urls);
        }
        self.stage = self.stage.max(Stage::PhotosFetched);
        Ok(())
    }

    pub fn kept_photos(&self) -> Vec<Vec<String>> {
        self.kept_indices()
            .into_iter()
            .map(|index| self.photos.get(&index).cloned().unwrap_or_default())
            .collect()
    }

    /// Annotations for the kept rows, aligned with `kept_records`.
    pub fn store_annotations(&mut self, annotations: Vec<Annotation>) -> AppResult<()> {
        self.require_at_least(Stage::DetailsFetched, "store annotations")?;
        let kept = self.kept_indices();
        if annotations.len() != kept.len() {
            return Err(AppError::Input(format!(
                "expected annotations for {} rows, got {}",
                kept.len(),
                annotations.len()
            )));
        }
        for (index, annotation) in kept.into_iter().zip(annotations) {
            self.annotations.insert(index, annotation);
        }
        self.stage = self.stage.max(Stage::Annotated);
        Ok(())
    }

    /// Table of kept rows, with annotation columns once any exist.
    pub fn table(&self) -> AppResult<AggregatedTable> {
        let base = AggregatedTable::from_records(&self.records).without_rows(&self.removed);
        if self.annotations.is_empty() {
            return Ok(base);
        }
        let aligned: Vec<Option<Annotation>> = self
            .kept_indices()
            .into_iter()
            .map(|index| self.annotations.get(&index).cloned())
            .collect();
        base.with_annotations(&aligned)
    }

    pub fn mark_exported(&mut self) -> AppResult<()> {
        self.require_at_least(Stage::DetailsFetched, "export")?;
        self.stage = Stage::Exported;
        Ok(())
    }

    fn kept_indices(&self) -> Vec<usize> {
        (0..self.records.len())
            .filter(|index| !self.removed.contains(index))
            .collect()
    }

    fn require(&self, stage: Stage, action: &str) -> AppResult<()> {
        if self.stage != stage {
            return Err(AppError::Session(format!(
                "cannot {action} while {}",
                self.stage.as_str()
            )));
        }
        Ok(())
    }

    fn require_at_least(&self, stage: Stage, action: &str) -> AppResult<()> {
        if self.stage < stage {
            return Err(AppError::Session(format!(
                "cannot {action} while {}",
                self.stage.as_str()
            )));
        }
        Ok(())
    }
}

/// Process-wide sessions keyed by name.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session<T>(&self, key: &str, f: impl FnOnce(&mut Session) -> T) -> T {
        let mut sessions = self.sessions.lock();
        f(sessions.entry(key.to_string()).or_default())
    }

    pub fn reset(&self, key: &str) {
        self.sessions.lock().remove(key);
    }
}
