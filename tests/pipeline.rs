use std::collections::BTreeSet;

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{cycle, json_encoded, status_code, Responder};
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;
use tempfile::{tempdir, TempDir};

use place_insight::{
    annotate_places, export_table, fetch_places, place_photos, remove_rows, render_map,
    place_hash, resolve_photos, validate_keys, AggregatedTable, AppConfig, AppError, AppState,
    Stage, PLACE_COLUMNS, UNAVAILABLE,
};

const SESSION: &str = "test";

fn base_url(server: &Server) -> String {
    server.url("/").to_string().trim_end_matches('/').to_string()
}

fn state_for(server: &Server, dir: &TempDir, with_llm: bool) -> AppState {
    let base = base_url(server);
    let config = AppConfig {
        google_maps_api_key: Some(SecretString::from("maps-key".to_string())),
        openai_api_key: with_llm.then(|| SecretString::from("sk-test".to_string())),
        maps_api_base: base.clone(),
        llm_api_base: format!("{base}/v1"),
        places_rate_limit_qps: 100,
        annotation_delay_ms: 0,
        data_dir: dir.path().join("data"),
        ..AppConfig::default()
    };
    AppState::initialize(config).expect("state")
}

fn expect_geocode(server: &Server, status: &str) {
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/maps/api/geocode/json"),
            request::query(url_decoded(contains(("key", "maps-key"))))
        ])
        .respond_with(json_encoded(json!({ "status": status, "results": [] }))),
    );
}

fn expect_details(server: &Server, place_id: &'static str, body: serde_json::Value) {
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/maps/api/place/details/json"),
            request::query(url_decoded(contains(("place_id", place_id))))
        ])
        .respond_with(json_encoded(body)),
    );
}

fn full_place(place_id: &str, name: &str, lat: f64, lng: f64) -> serde_json::Value {
    json!({
        "status": "OK",
        "result": {
            "place_id": place_id,
            "name": name,
            "rating": 4.2,
            "user_ratings_total": 37,
            "types": ["restaurant", "food"],
            "formatted_phone_number": "(212) 555-0199",
            "opening_hours": { "open_now": false },
            "geometry": { "location": { "lat": lat, "lng": lng } },
            "url": format!("https://maps.google.com/?cid={place_id}"),
            "photos": [{ "photo_reference": format!("{place_id}-photo") }]
        }
    })
}

#[tokio::test]
async fn fetch_remove_map_and_export_roundtrip() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    expect_geocode(&server, "OK");
    expect_details(&server, "A", full_place("A", "Alpha Diner", 40.71, -74.0));
    expect_details(
        &server,
        "B",
        json!({ "status": "NOT_FOUND", "error_message": "no such place" }),
    );
    expect_details(
        &server,
        "C",
        json!({ "status": "OK", "result": { "name": "Charlie Kiosk", "types": [] } }),
    );
    expect_details(&server, "D", full_place("D", "Delta Bar", 40.72, -73.99));

    let state = state_for(&server, &dir, false);
    let keys = validate_keys(&state, SESSION).await.unwrap();
    assert!(keys.maps_valid);
    assert_eq!(keys.llm_valid, None);

    let ids = vec!["A".to_string(), "B".into(), "C".into(), "D".into()];
    let fetched = fetch_places(&state, SESSION, ids).await.unwrap();

    assert_eq!(fetched.requested, 4);
    assert_eq!(fetched.fetched, 3);
    assert_eq!(fetched.skipped.len(), 1);
    assert_eq!(fetched.skipped[0].place_id, "B");
    let order: Vec<_> = (0..fetched.table.len())
        .map(|i| fetched.table.cell(i, "place_id").unwrap())
        .collect();
    assert_eq!(order, vec!["A", "C", "D"]);
    assert_eq!(fetched.table.cell(1, "latitude"), Some(UNAVAILABLE));
    assert_eq!(fetched.table.cell(1, "categories"), Some(UNAVAILABLE));
    assert_eq!(fetched.table.cell(0, "open_now"), Some("false"));

    let map = render_map(&state, SESSION, Some(&dir.path().join("map.html"))).unwrap();
    assert_eq!(map.markers.len(), 2);
    assert_eq!(map.markers[0].label, "Alpha Diner");
    assert!(dir.path().join("map.html").exists());

    let trimmed = remove_rows(&state, SESSION, &BTreeSet::from([1])).unwrap();
    assert_eq!(trimmed.len(), 2);
    let again = remove_rows(&state, SESSION, &BTreeSet::from([1])).unwrap();
    assert_eq!(again, trimmed);

    let photos = resolve_photos(&state, SESSION).unwrap();
    assert_eq!(photos.len(), 2);
    assert_eq!(photos[1].place_id, "D");
    assert!(photos[1].urls[0].contains("photoreference=D-photo"));

    let export_path = dir.path().join("out").join("place_details.csv");
    let export = export_table(&state, SESSION, Some(&export_path)).unwrap();
    assert_eq!(export.rows, 2);
    assert_eq!(export.columns, PLACE_COLUMNS.len());

    let written = std::fs::read_to_string(&export_path).unwrap();
    let parsed = AggregatedTable::from_csv(&written).unwrap();
    assert_eq!(parsed, trimmed);
    assert_eq!(
        state.sessions().with_session(SESSION, |s| s.stage()),
        Stage::Exported
    );

    state.shutdown();
    let journal = std::fs::read_to_string(state.telemetry().journal_path()).unwrap();
    assert!(journal.contains("table_exported"));
    assert!(journal.contains(&place_hash("B")));
    assert!(!journal.contains("maps-key"));
}

#[tokio::test]
async fn oversized_batch_makes_no_requests() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    let base = base_url(&server);
    let config = AppConfig {
        google_maps_api_key: Some(SecretString::from("maps-key".to_string())),
        maps_api_base: base,
        max_place_ids: 2,
        data_dir: dir.path().join("data"),
        ..AppConfig::default()
    };
    let state = AppState::initialize(config).unwrap();

    let ids = vec!["A".to_string(), "B".into(), "C".into()];
    let err = fetch_places(&state, SESSION, ids).await.unwrap_err();
    assert!(matches!(err, AppError::TooManyPlaceIds { count: 3, max: 2 }));

    let err = fetch_places(&state, SESSION, vec!["A".into(), " ".into()])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Input(_)));
}

#[tokio::test]
async fn invalid_maps_key_blocks_submission() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    expect_geocode(&server, "REQUEST_DENIED");

    let state = state_for(&server, &dir, false);
    let keys = validate_keys(&state, SESSION).await.unwrap();
    assert!(!keys.maps_valid);

    let err = fetch_places(&state, SESSION, vec!["A".into()])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Session(_)));
}

#[tokio::test]
async fn annotation_failures_are_recorded_per_row() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    expect_geocode(&server, "OK");
    server.expect(
        Expectation::matching(request::method_path("GET", "/v1/models"))
            .respond_with(json_encoded(json!({ "data": [] }))),
    );
    expect_details(&server, "A", full_place("A", "Alpha Diner", 40.71, -74.0));
    expect_details(&server, "D", full_place("D", "Delta Bar", 40.72, -73.99));
    let reply = json!({
        "choices": [{
            "message": {
                "role": "assistant",
                "content": "{\"description\":\"Family diner\",\"area_commentary\":\"Office district\",\"potential_score\":6}"
            }
        }]
    });
    server.expect(
        Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
            .times(2)
            .respond_with(cycle(vec![
                Box::new(json_encoded(reply)) as Box<dyn Responder>,
                Box::new(status_code(429)),
            ])),
    );

    let state = state_for(&server, &dir, true);
    let keys = validate_keys(&state, SESSION).await.unwrap();
    assert_eq!(keys.llm_valid, Some(true));
    fetch_places(&state, SESSION, vec!["A".into(), "D".into()])
        .await
        .unwrap();
    resolve_photos(&state, SESSION).unwrap();

    let summary = annotate_places(&state, SESSION, "Rate this place")
        .await
        .unwrap();

    assert_eq!(summary.annotated, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.table.cell(0, "potential_score"), Some("6"));
    assert_eq!(summary.table.cell(0, "annotation_error"), Some(UNAVAILABLE));
    assert_eq!(summary.table.cell(1, "description"), Some(UNAVAILABLE));
    assert!(summary
        .table
        .cell(1, "annotation_error")
        .unwrap()
        .contains("429"));
}

#[tokio::test]
async fn single_place_photos_tolerate_missing_places() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    expect_details(&server, "A", full_place("A", "Alpha Diner", 40.71, -74.0));
    expect_details(&server, "gone", json!({ "status": "NOT_FOUND" }));

    let state = state_for(&server, &dir, false);

    let found = place_photos(&state, "A").await.unwrap();
    assert_eq!(found.urls.len(), 1);
    assert!(found.urls[0].starts_with(&base_url(&server)));
    assert_eq!(found.urls, place_photos_again(&state).await);

    let missing = place_photos(&state, "gone").await.unwrap();
    assert!(missing.urls.is_empty());
}

async fn place_photos_again(state: &AppState) -> Vec<String> {
    let resolver = state.photo_resolver().unwrap();
    resolver.urls_for_references(&["A-photo".to_string()])
}

#[tokio::test]
async fn downloads_keep_only_successful_photos() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    server.expect(
        Expectation::matching(request::method_path("GET", "/photos/1"))
            .respond_with(status_code(200).body("jpeg-bytes")),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/photos/2"))
            .respond_with(status_code(404)),
    );

    let state = state_for(&server, &dir, false);
    let urls = vec![
        server.url("/photos/1").to_string(),
        server.url("/photos/2").to_string(),
    ];
    let target = dir.path().join("photos");

    let saved = state
        .photo_resolver()
        .unwrap()
        .download_all(&urls, &target)
        .await
        .unwrap();

    assert_eq!(saved, vec![target.join("photo_1.jpg")]);
    assert_eq!(std::fs::read(&saved[0]).unwrap(), b"jpeg-bytes");
    assert!(!target.join("photo_2.jpg").exists());
}
