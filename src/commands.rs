use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::insights::annotate_all;
use crate::map::MapView;
use crate::places::SkippedPlace;
use crate::table::AggregatedTable;
use crate::telemetry::place_hash;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct KeyReport {
    pub maps_valid: bool,
    /// `None` when no LLM key is configured.
    pub llm_valid: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct FetchSummary {
    pub requested: usize,
    pub fetched: usize,
    pub skipped: Vec<SkippedPlace>,
    pub table: AggregatedTable,
}

#[derive(Debug, Serialize)]
pub struct PhotoSummary {
    pub place_id: String,
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AnnotationSummary {
    pub annotated: usize,
    pub failed: usize,
    pub table: AggregatedTable,
}

#[derive(Debug, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub rows: usize,
    pub columns: usize,
}

/// Checks the maps key (and the LLM key when one is configured). A valid maps
/// key moves the session past validation.
pub async fn validate_keys(state: &AppState, session: &str) -> AppResult<KeyReport> {
    let validator = state.key_validator();
    let maps_valid = validator.maps_key_is_valid(&state.maps_key()?).await;
    let llm_valid = match &state.config().openai_api_key {
        Some(key) => Some(validator.llm_key_is_valid(key).await),
        None => None,
    };

    if maps_valid {
        state.sessions().with_session(session, |s| s.mark_validated());
    }
    state.track(
        "keys_validated",
        json!({ "maps_valid": maps_valid, "llm_valid": llm_valid }),
    );
    Ok(KeyReport {
        maps_valid,
        llm_valid,
    })
}

/// Starts a new batch and fetches details for every identifier. The count
/// limit and blank identifiers are checked before any request is made.
pub async fn fetch_places(
    state: &AppState,
    session: &str,
    place_ids: Vec<String>,
) -> AppResult<FetchSummary> {
    let fetcher = state.place_fetcher()?;
    fetcher.check_batch(&place_ids)?;
    let requested = place_ids.len();
    state
        .sessions()
        .with_session(session, |s| s.submit_ids(place_ids.clone()))?;

    let report = fetcher.fetch(&place_ids).await?;
    let fetched = report.records.len();
    let skipped = report.skipped.clone();
    state.track(
        "places_fetched",
        json!({
            "requested": requested,
            "fetched": fetched,
            "skipped": skipped.iter().map(|s| place_hash(&s.place_id)).collect::<Vec<_>>(),
        }),
    );
    info!(requested, fetched, skipped = skipped.len(), "place batch fetched");

    let table = state.sessions().with_session(session, |s| {
        s.store_details(report)?;
        s.table()
    })?;
    Ok(FetchSummary {
        requested,
        fetched,
        skipped,
        table,
    })
}

/// Sets which rows (positions in the fetched table) are left out of the
/// session's view.
pub fn remove_rows(
    state: &AppState,
    session: &str,
    indices: &BTreeSet<usize>,
) -> AppResult<AggregatedTable> {
    state.sessions().with_session(session, |s| {
        s.remove_rows(indices)?;
        s.table()
    })
}

/// Resolves photo URLs for every kept row from the references already fetched.
pub fn resolve_photos(state: &AppState, session: &str) -> AppResult<Vec<PhotoSummary>> {
    let resolver = state.photo_resolver()?;
    state.sessions().with_session(session, |s| {
        let records = s.kept_records();
        let urls: Vec<Vec<String>> = records
            .iter()
            .map(|record| resolver.urls_for_record(record))
            .collect();
        s.store_photos(urls.clone())?;
        state.track(
            "photos_resolved",
            json!({
                "rows": records.len(),
                "photos": urls.iter().map(Vec::len).sum::<usize>(),
            }),
        );
        Ok(records
            .into_iter()
            .zip(urls)
            .map(|(record, urls)| PhotoSummary {
                place_id: record.place_id,
                urls,
            })
            .collect())
    })
}

/// Photos for a single identifier, looked up fresh. Never fails on a missing
/// place; the list is simply empty.
pub async fn place_photos(state: &AppState, place_id: &str) -> AppResult<PhotoSummary> {
    let resolver = state.photo_resolver()?;
    let urls = resolver.urls_for_place(place_id).await;
    state.track(
        "photos_resolved",
        json!({ "rows": 1, "photos": urls.len(), "place": place_hash(place_id) }),
    );
    Ok(PhotoSummary {
        place_id: place_id.to_string(),
        urls,
    })
}

/// Sends each kept row to the LLM in turn and merges the replies onto the
/// table.
pub async fn annotate_places(
    state: &AppState,
    session: &str,
    instruction: &str,
) -> AppResult<AnnotationSummary> {
    if instruction.trim().is_empty() {
        return Err(AppError::Input("the LLM instruction is empty".into()));
    }
    let annotator = state.annotator()?;
    let (records, photos) = state
        .sessions()
        .with_session(session, |s| (s.kept_records(), s.kept_photos()));
    if records.is_empty() {
        return Err(AppError::Session("no places to annotate".into()));
    }

    let delay = Duration::from_millis(state.config().annotation_delay_ms);
    let annotations = annotate_all(&annotator, &records, &photos, instruction, delay).await;
    let failed = annotations.iter().filter(|a| a.is_error()).count();
    let annotated = annotations.len() - failed;
    state.track(
        "annotation_batch",
        json!({ "annotated": annotated, "failed": failed }),
    );

    let table = state.sessions().with_session(session, |s| {
        s.store_annotations(annotations)?;
        s.table()
    })?;
    Ok(AnnotationSummary {
        annotated,
        failed,
        table,
    })
}

/// Writes the current table as CSV. Without an explicit path the configured
/// export file name is used in the working directory.
pub fn export_table(
    state: &AppState,
    session: &str,
    path: Option<&Path>,
) -> AppResult<ExportSummary> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&state.config().export_file_name));
    let table = state.sessions().with_session(session, |s| {
        let table = s.table()?;
        s.mark_exported()?;
        Ok::<_, AppError>(table)
    })?;
    table.write_csv(&path)?;
    state.track(
        "table_exported",
        json!({ "rows": table.len(), "columns": table.columns().len() }),
    );
    Ok(ExportSummary {
        path,
        rows: table.len(),
        columns: table.columns().len(),
    })
}

/// Builds a map of the kept rows and optionally writes it as HTML.
pub fn render_map(state: &AppState, session: &str, path: Option<&Path>) -> AppResult<MapView> {
    let view = state
        .sessions()
        .with_session(session, |s| MapView::from_records(&s.kept_records()));
    if let Some(path) = path {
        view.write_html(path)?;
    }
    Ok(view)
}
