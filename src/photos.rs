use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::places::{PlaceLookup, PlaceRecord};

/// Builds the Place Photo URL for one reference. Same inputs, same URL.
pub fn photo_url(
    maps_api_base: &str,
    photo_reference: &str,
    api_key: &SecretString,
    max_width: u32,
) -> AppResult<String> {
    let mut url = Url::parse(&format!("{maps_api_base}/maps/api/place/photo"))
        .map_err(|err| AppError::Config(format!("invalid maps API base URL: {err}")))?;
    url.query_pairs_mut()
        .append_pair("maxwidth", &max_width.to_string())
        .append_pair("photoreference", photo_reference)
        .append_pair("key", api_key.expose_secret());
    Ok(url.to_string())
}

pub struct PhotoResolver {
    lookup: Arc<dyn PlaceLookup>,
    http: reqwest::Client,
    maps_api_base: String,
    api_key: SecretString,
    max_width: u32,
}

impl PhotoResolver {
    pub fn new(
        lookup: Arc<dyn PlaceLookup>,
        http: reqwest::Client,
        config: &AppConfig,
        api_key: SecretString,
    ) -> Self {
        Self {
            lookup,
            http,
            maps_api_base: config.maps_api_base.clone(),
            api_key,
            max_width: config.photo_max_width,
        }
    }

    pub fn urls_for_references(&self, references: &[String]) -> Vec<String> {
        references
            .iter()
            .filter_map(|reference| {
                photo_url(&self.maps_api_base, reference, &self.api_key, self.max_width)
                    .map_err(|err| warn!(error = %err, "skipping photo reference"))
                    .ok()
            })
            .collect()
    }

    /// Reuses the references already on a fetched record.
    pub fn urls_for_record(&self, record: &PlaceRecord) -> Vec<String> {
        self.urls_for_references(&record.photo_references)
    }

    /// Looks the place up again and resolves its photos. A failed lookup is
    /// treated the same as a place without photos.
    pub async fn urls_for_place(&self, place_id: &str) -> Vec<String> {
        match self.lookup.place_details(place_id).await {
            Ok(record) => self.urls_for_record(&record),
            Err(err) => {
                warn!(%place_id, error = %err, "photo lookup failed; reporting no photos");
                Vec::new()
            }
        }
    }

    /// Downloads each URL into `dir` as `photo_{n}.jpg`. Failed downloads are
    /// logged and left out of the returned paths.
    pub async fn download_all(&self, urls: &[String], dir: &Path) -> AppResult<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir).await?;
        let mut saved = Vec::new();
        for (index, url) in urls.iter().enumerate() {
            let path = dir.join(format!("photo_{}.jpg", index + 1));
            match self.download_one(url, &path).await {
                Ok(bytes) => {
                    debug!(path = %path.display(), bytes, "photo saved");
                    saved.push(path);
                }
                Err(err) => warn!(index, error = %err, "photo download failed"),
            }
        }
        Ok(saved)
    }

    async fn download_one(&self, url: &str, path: &Path) -> AppResult<u64> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0_u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(written)
    }
}
