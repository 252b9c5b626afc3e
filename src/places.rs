use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const DETAIL_FIELDS: &str = "place_id,name,rating,user_ratings_total,types,\
formatted_phone_number,international_phone_number,opening_hours,business_status,\
geometry/location,url,photos";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

/// One queried place, flattened out of the provider's nested detail payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceRecord {
    pub place_id: String,
    pub name: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u64>,
    pub categories: Vec<String>,
    pub phone: Option<String>,
    pub open_now: Option<bool>,
    pub location: Option<LatLng>,
    pub maps_url: Option<String>,
    pub photo_references: Vec<String>,
}

impl PlaceRecord {
    pub fn new(place_id: impl Into<String>) -> Self {
        Self {
            place_id: place_id.into(),
            name: None,
            rating: None,
            review_count: None,
            categories: Vec::new(),
            phone: None,
            open_now: None,
            location: None,
            maps_url: None,
            photo_references: Vec::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(crate::table::UNAVAILABLE)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedPlace {
    pub place_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub records: Vec<PlaceRecord>,
    pub skipped: Vec<SkippedPlace>,
}

/// Splits free-form input on commas and newlines. Blank entries are dropped,
/// duplicates are kept.
pub fn parse_place_ids(input: &str) -> Vec<String> {
    input
        .split(|c: char| c == ',' || c == '\n' || c == '\r')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
pub trait PlaceLookup: Send + Sync {
    async fn place_details(&self, place_id: &str) -> AppResult<PlaceRecord>;
}

pub struct PlaceFetcher {
    lookup: Arc<dyn PlaceLookup>,
    rate_limiter: RateLimiter,
    concurrency: usize,
    max_place_ids: usize,
}

impl PlaceFetcher {
    pub fn new(lookup: Arc<dyn PlaceLookup>, config: &AppConfig) -> Self {
        Self::with_limits(
            lookup,
            config.max_place_ids,
            config.places_concurrency,
            config.places_rate_limit_qps,
        )
    }

    pub fn with_limits(
        lookup: Arc<dyn PlaceLookup>,
        max_place_ids: usize,
        concurrency: usize,
        qps: u32,
    ) -> Self {
        Self {
            lookup,
            rate_limiter: RateLimiter::new(qps),
            concurrency: concurrency.max(1),
            max_place_ids: max_place_ids.max(1),
        }
    }

    pub fn max_place_ids(&self) -> usize {
        self.max_place_ids
    }

    /// Rejects a batch that is over the limit or holds a blank identifier.
    pub fn check_batch(&self, place_ids: &[String]) -> AppResult<()> {
        if let Some(position) = place_ids.iter().position(|id| id.trim().is_empty()) {
            return Err(AppError::Input(format!(
                "place id at position {position} is blank"
            )));
        }
        if place_ids.len() > self.max_place_ids {
            return Err(AppError::TooManyPlaceIds {
                count: place_ids.len(),
                max: self.max_place_ids,
            });
        }
        Ok(())
    }

    /// Looks up every identifier with bounded concurrency. Output keeps input
    /// order; failed lookups land in `skipped` instead of `records`.
    pub async fn fetch(&self, place_ids: &[String]) -> AppResult<FetchReport> {
        self.check_batch(place_ids)?;

        let outcomes = stream::iter(place_ids.iter().cloned())
            .map(|place_id| async move {
                self.rate_limiter.wait().await;
                let result = self.lookup.place_details(&place_id).await;
                (place_id, result)
            })
            .buffered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut report = FetchReport::default();
        for (place_id, result) in outcomes {
            match result {
                Ok(mut record) => {
                    if record.place_id.trim().is_empty() {
                        record.place_id = place_id;
                    }
                    report.records.push(record);
                }
                Err(err) => {
                    warn!(%place_id, error = %err, "place lookup failed; skipping");
                    report.skipped.push(SkippedPlace {
                        place_id,
                        reason: err.to_string(),
                    });
                }
            }
        }
        debug!(
            fetched = report.records.len(),
            skipped = report.skipped.len(),
            "place details fetched"
        );
        Ok(report)
    }
}

/// Spaces request starts at least `1 / qps` apart, shared by all in-flight
/// lookups.
struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        let interval_ms = (1000_f64 / f64::from(qps.max(1))).ceil() as u64;
        Self {
            min_interval: Duration::from_millis(interval_ms),
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        let interval = self.min_interval;
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// Place Details client for the Google Maps web service.
pub struct HttpPlacesClient {
    http: reqwest::Client,
    api_base: String,
    api_key: SecretString,
}

impl HttpPlacesClient {
    pub fn new(http: reqwest::Client, config: &AppConfig, api_key: SecretString) -> Self {
        Self {
            http,
            api_base: config.maps_api_base.clone(),
            api_key,
        }
    }

    fn details_url(&self, place_id: &str) -> AppResult<Url> {
        let mut url = Url::parse(&format!("{}/maps/api/place/details/json", self.api_base))
            .map_err(|err| AppError::Config(format!("invalid maps API base URL: {err}")))?;
        url.query_pairs_mut()
            .append_pair("place_id", place_id)
            .append_pair("fields", DETAIL_FIELDS)
            .append_pair("key", self.api_key.expose_secret());
        Ok(url)
    }
}

#[async_trait]
impl PlaceLookup for HttpPlacesClient {
    async fn place_details(&self, place_id: &str) -> AppResult<PlaceRecord> {
        let response = self
            .http
            .get(self.details_url(place_id)?)
            .send()
            .await?
            .error_for_status()?;
        let body: DetailsResponse = response.json().await?;
        body.into_record(place_id)
    }
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    result: Option<DetailsResult>,
}

#[derive(Debug, Default, Deserialize)]
struct DetailsResult {
    place_id: Option<String>,
    name: Option<String>,
    rating: Option<f64>,
    user_ratings_total: Option<u64>,
    #[serde(default)]
    types: Vec<String>,
    formatted_phone_number: Option<String>,
    international_phone_number: Option<String>,
    opening_hours: Option<OpeningHours>,
    business_status: Option<String>,
    geometry: Option<Geometry>,
    url: Option<String>,
    #[serde(default)]
    photos: Vec<PhotoEntry>,
}

#[derive(Debug, Deserialize)]
struct OpeningHours {
    open_now: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: Option<GeometryLocation>,
}

#[derive(Debug, Deserialize)]
struct GeometryLocation {
    lat: Option<f64>,
    lng: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PhotoEntry {
    photo_reference: Option<String>,
}

impl DetailsResponse {
    fn into_record(self, requested_id: &str) -> AppResult<PlaceRecord> {
        if self.status != "OK" {
            let detail = self.error_message.unwrap_or_default();
            return Err(AppError::Provider(
                format!("place details returned {} {detail}", self.status)
                    .trim_end()
                    .to_string(),
            ));
        }
        let result = self
            .result
            .ok_or_else(|| AppError::Provider("place details response missing result".into()))?;
        Ok(result.into_record(requested_id))
    }
}

impl DetailsResult {
    fn into_record(self, requested_id: &str) -> PlaceRecord {
        let open_now = self
            .opening_hours
            .and_then(|hours| hours.open_now)
            .or_else(|| match self.business_status.as_deref() {
                Some("CLOSED_TEMPORARILY" | "CLOSED_PERMANENTLY") => Some(false),
                _ => None,
            });
        let location = self
            .geometry
            .and_then(|geometry| geometry.location)
            .and_then(|loc| match (loc.lat, loc.lng) {
                (Some(lat), Some(lng)) => Some(LatLng { lat, lng }),
                _ => None,
            });

        PlaceRecord {
            place_id: self
                .place_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| requested_id.to_string()),
            name: non_blank(self.name),
            rating: self.rating,
            review_count: self.user_ratings_total,
            categories: self.types,
            phone: non_blank(self.formatted_phone_number)
                .or_else(|| non_blank(self.international_phone_number)),
            open_now,
            location,
            maps_url: non_blank(self.url),
            photo_references: self
                .photos
                .into_iter()
                .filter_map(|photo| non_blank(photo.photo_reference))
                .collect(),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
