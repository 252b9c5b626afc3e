use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const PROBE_ADDRESS: &str = "New York";

/// Checks credentials with one cheap live request each. Every failure,
/// whatever the cause, reads as "invalid".
pub struct KeyValidator {
    http: reqwest::Client,
    maps_api_base: String,
    llm_api_base: String,
}

#[derive(Deserialize)]
struct GeocodeStatus {
    status: String,
}

impl KeyValidator {
    pub fn new(http: reqwest::Client, config: &AppConfig) -> Self {
        Self {
            http,
            maps_api_base: config.maps_api_base.clone(),
            llm_api_base: config.llm_api_base.clone(),
        }
    }

    pub async fn maps_key_is_valid(&self, api_key: &SecretString) -> bool {
        match self.probe_maps(api_key).await {
            Ok(()) => true,
            Err(err) => {
                debug!(target: "key_validator", error = %err, "maps key rejected");
                false
            }
        }
    }

    pub async fn llm_key_is_valid(&self, api_key: &SecretString) -> bool {
        match self.probe_llm(api_key).await {
            Ok(()) => true,
            Err(err) => {
                debug!(target: "key_validator", error = %err, "llm key rejected");
                false
            }
        }
    }

    async fn probe_maps(&self, api_key: &SecretString) -> AppResult<()> {
        let mut url = Url::parse(&format!("{}/maps/api/geocode/json", self.maps_api_base))
            .map_err(|err| AppError::Config(format!("invalid maps API base URL: {err}")))?;
        url.query_pairs_mut()
            .append_pair("address", PROBE_ADDRESS)
            .append_pair("key", api_key.expose_secret());

        let response = self.http.get(url).send().await?.error_for_status()?;
        let body: GeocodeStatus = response.json().await?;
        match body.status.as_str() {
            "OK" | "ZERO_RESULTS" => Ok(()),
            other => Err(AppError::Provider(format!("geocode returned {other}"))),
        }
    }

    async fn probe_llm(&self, api_key: &SecretString) -> AppResult<()> {
        self.http
            .get(format!("{}/models", self.llm_api_base))
            .bearer_auth(api_key.expose_secret())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_endpoints_read_as_invalid() {
        let config = AppConfig {
            maps_api_base: "http://127.0.0.1:1".into(),
            llm_api_base: "http://127.0.0.1:1/v1".into(),
            ..AppConfig::default()
        };
        let validator = KeyValidator::new(reqwest::Client::new(), &config);
        let key = SecretString::from("anything".to_string());

        assert!(!validator.maps_key_is_valid(&key).await);
        assert!(!validator.llm_key_is_valid(&key).await);
    }

    #[tokio::test]
    async fn malformed_base_url_reads_as_invalid() {
        let config = AppConfig {
            maps_api_base: "not a url".into(),
            ..AppConfig::default()
        };
        let validator = KeyValidator::new(reqwest::Client::new(), &config);
        assert!(
            !validator
                .maps_key_is_valid(&SecretString::from("k".to_string()))
                .await
        );
    }
}
