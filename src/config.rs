use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_MAPS_API_BASE: &str = "https://maps.googleapis.com";
pub const DEFAULT_LLM_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_PLACE_IDS: usize = 20;
pub const DEFAULT_PHOTO_MAX_WIDTH: u32 = 400;
pub const DEFAULT_EXPORT_FILE_NAME: &str = "place_details.csv";
const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub google_maps_api_key: Option<SecretString>,
    pub openai_api_key: Option<SecretString>,
    pub maps_api_base: String,
    pub llm_api_base: String,
    pub llm_model: String,
    pub max_place_ids: usize,
    pub photo_max_width: u32,
    pub places_rate_limit_qps: u32,
    pub places_concurrency: usize,
    pub annotation_delay_ms: u64,
    pub http_timeout_secs: u64,
    pub export_file_name: String,
    pub data_dir: PathBuf,
    pub telemetry_enabled: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub maps_api_base: String,
    pub llm_api_base: String,
    pub llm_model: String,
    pub max_place_ids: usize,
    pub photo_max_width: u32,
    pub places_rate_limit_qps: u32,
    pub places_concurrency: usize,
    pub annotation_delay_ms: u64,
    pub http_timeout_secs: u64,
    pub export_file_name: String,
    pub data_dir: String,
    pub telemetry_enabled: bool,
    pub has_google_maps_key: bool,
    pub has_openai_key: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            google_maps_api_key: None,
            openai_api_key: None,
            maps_api_base: DEFAULT_MAPS_API_BASE.to_string(),
            llm_api_base: DEFAULT_LLM_API_BASE.to_string(),
            llm_model: DEFAULT_LLM_MODEL.to_string(),
            max_place_ids: DEFAULT_MAX_PLACE_IDS,
            photo_max_width: DEFAULT_PHOTO_MAX_WIDTH,
            places_rate_limit_qps: 3,
            places_concurrency: 4,
            annotation_delay_ms: 1_000,
            http_timeout_secs: 10,
            export_file_name: DEFAULT_EXPORT_FILE_NAME.to_string(),
            data_dir: PathBuf::from(".place-insight"),
            telemetry_enabled: true,
            telemetry_batch_size: 10,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            google_maps_api_key: parse_secret("GOOGLE_MAPS_API_KEY"),
            openai_api_key: parse_secret("OPENAI_API_KEY"),
            maps_api_base: parse_base_url("GOOGLE_MAPS_API_BASE", &defaults.maps_api_base),
            llm_api_base: parse_base_url("OPENAI_API_BASE", &defaults.llm_api_base),
            llm_model: env::var("OPENAI_MODEL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.llm_model),
            max_place_ids: parse_usize("MAX_PLACE_IDS", defaults.max_place_ids).max(1),
            photo_max_width: parse_u32("PHOTO_MAX_WIDTH", defaults.photo_max_width).clamp(1, 1600),
            places_rate_limit_qps: parse_u32("PLACES_RATE_LIMIT_QPS", defaults.places_rate_limit_qps)
                .max(1),
            places_concurrency: parse_usize("PLACES_CONCURRENCY", defaults.places_concurrency)
                .max(1),
            annotation_delay_ms: parse_u64("ANNOTATION_DELAY_MS", defaults.annotation_delay_ms),
            http_timeout_secs: parse_u64("HTTP_TIMEOUT_SECS", defaults.http_timeout_secs).max(1),
            export_file_name: env::var("EXPORT_FILE_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.export_file_name),
            data_dir: env::var("PLACE_INSIGHT_DATA_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            telemetry_enabled: parse_bool("TELEMETRY_ENABLED", defaults.telemetry_enabled),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", defaults.telemetry_batch_size)
                .max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                defaults.telemetry_buffer_max_bytes,
            ),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            maps_api_base: self.maps_api_base.clone(),
            llm_api_base: self.llm_api_base.clone(),
            llm_model: self.llm_model.clone(),
            max_place_ids: self.max_place_ids,
            photo_max_width: self.photo_max_width,
            places_rate_limit_qps: self.places_rate_limit_qps,
            places_concurrency: self.places_concurrency,
            annotation_delay_ms: self.annotation_delay_ms,
            http_timeout_secs: self.http_timeout_secs,
            export_file_name: self.export_file_name.clone(),
            data_dir: self.data_dir.to_string_lossy().to_string(),
            telemetry_enabled: self.telemetry_enabled,
            has_google_maps_key: self.google_maps_api_key.is_some(),
            has_openai_key: self.openai_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}

fn parse_base_url(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
        .trim()
        .trim_end_matches('/')
        .to_string()
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GOOGLE_MAPS_API_KEY", "  maps-secret ");
        env::set_var("OPENAI_API_KEY", "");
        env::set_var("GOOGLE_MAPS_API_BASE", "http://localhost:9999/");
        env::set_var("MAX_PLACE_IDS", "10");
        env::set_var("PLACES_CONCURRENCY", "0");
        env::set_var("EXPORT_FILE_NAME", "custom.csv");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(
            config
                .google_maps_api_key
                .as_ref()
                .map(|key| key.expose_secret().to_string()),
            Some("maps-secret".to_string())
        );
        assert!(public.has_google_maps_key);
        assert!(!public.has_openai_key);
        assert_eq!(public.maps_api_base, "http://localhost:9999");
        assert_eq!(public.max_place_ids, 10);
        assert_eq!(public.places_concurrency, 1);
        assert_eq!(public.export_file_name, "custom.csv");

        let rendered = serde_json::to_string(&public).unwrap();
        assert!(!rendered.contains("maps-secret"));
    }

    #[test]
    fn defaults_match_documented_limits() {
        let config = AppConfig::default();
        assert_eq!(config.max_place_ids, DEFAULT_MAX_PLACE_IDS);
        assert_eq!(config.photo_max_width, 400);
        assert_eq!(config.export_file_name, "place_details.csv");
        assert!(config.google_maps_api_key.is_none());
    }
}
