mod commands;
mod config;
mod credentials;
mod errors;
mod insights;
mod map;
mod photos;
mod places;
mod session;
mod table;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use secrecy::SecretString;
use serde_json::json;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use commands::{
    annotate_places, export_table, fetch_places, place_photos, remove_rows, render_map,
    resolve_photos, validate_keys, AnnotationSummary, ExportSummary, FetchSummary, KeyReport,
    PhotoSummary,
};
pub use config::{AppConfig, PublicAppConfig};
pub use credentials::KeyValidator;
pub use errors::{AppError, AppResult};
pub use insights::{
    annotate, annotate_all, Annotation, InsightModel, OpenAiAnnotator, DEFAULT_INSTRUCTION,
};
pub use map::{MapMarker, MapView};
pub use photos::{photo_url, PhotoResolver};
pub use places::{
    parse_place_ids, FetchReport, HttpPlacesClient, LatLng, PlaceFetcher, PlaceLookup,
    PlaceRecord, SkippedPlace,
};
pub use session::{Session, SessionRegistry, Stage};
pub use table::{AggregatedTable, ANNOTATION_COLUMNS, PLACE_COLUMNS, UNAVAILABLE};
pub use telemetry::{place_hash, TelemetryClient};

const USER_AGENT: &str = concat!("place-insight/", env!("CARGO_PKG_VERSION"));

pub struct AppState {
    config: AppConfig,
    http: reqwest::Client,
    telemetry: TelemetryClient,
    sessions: SessionRegistry,
}

impl AppState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        let telemetry = TelemetryClient::new(&config.data_dir, &config)?;

        if let Err(err) = telemetry.record(
            "app_start",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "has_google_maps_key": config.google_maps_api_key.is_some(),
                "has_openai_key": config.openai_api_key.is_some(),
            }),
        ) {
            warn!(?err, "failed to queue telemetry bootstrap event");
        }

        Ok(Self {
            config,
            http,
            telemetry,
            sessions: SessionRegistry::new(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &TelemetryClient {
        &self.telemetry
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn maps_key(&self) -> AppResult<SecretString> {
        self.config
            .google_maps_api_key
            .clone()
            .ok_or_else(|| AppError::Config("GOOGLE_MAPS_API_KEY is not set".into()))
    }

    pub fn openai_key(&self) -> AppResult<SecretString> {
        self.config
            .openai_api_key
            .clone()
            .ok_or_else(|| AppError::Config("OPENAI_API_KEY is not set".into()))
    }

    pub fn key_validator(&self) -> KeyValidator {
        KeyValidator::new(self.http.clone(), &self.config)
    }

    pub fn place_lookup(&self) -> AppResult<Arc<dyn PlaceLookup>> {
        Ok(Arc::new(HttpPlacesClient::new(
            self.http.clone(),
            &self.config,
            self.maps_key()?,
        )))
    }

    pub fn place_fetcher(&self) -> AppResult<PlaceFetcher> {
        Ok(PlaceFetcher::new(self.place_lookup()?, &self.config))
    }

    pub fn photo_resolver(&self) -> AppResult<PhotoResolver> {
        Ok(PhotoResolver::new(
            self.place_lookup()?,
            self.http.clone(),
            &self.config,
            self.maps_key()?,
        ))
    }

    pub fn annotator(&self) -> AppResult<OpenAiAnnotator> {
        Ok(OpenAiAnnotator::new(
            self.http.clone(),
            &self.config,
            self.openai_key()?,
        ))
    }

    /// Records an event, logging instead of failing the caller.
    pub(crate) fn track(&self, name: &str, payload: serde_json::Value) {
        if let Err(err) = self.telemetry.record(name, payload) {
            warn!(?err, event = name, "failed to record telemetry event");
        }
    }

    pub fn shutdown(&self) {
        if let Err(err) = self.telemetry.flush() {
            warn!(?err, "failed to flush telemetry queue");
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,place_insight=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
