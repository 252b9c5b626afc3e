use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::places::PlaceRecord;

pub const DEFAULT_INSTRUCTION: &str = "You are a location analyst. Using the place data and \
photos provided, describe the place, comment on the surrounding area, and rate its business \
potential from 1 (poor) to 10 (excellent). Respond only with a JSON object containing the keys \
\"description\" (string), \"area_commentary\" (string) and \"potential_score\" (integer 1-10).";

/// LLM commentary for one place. A failed call leaves only `error` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub description: Option<String>,
    pub area_commentary: Option<String>,
    pub potential_score: Option<u8>,
    pub error: Option<String>,
}

impl Annotation {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            description: None,
            area_commentary: None,
            potential_score: None,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Parses the model's JSON reply. At least one of the three fields must be
    /// present and each must have the right type. The score must be an integer
    /// in 1..=10; numeric strings are accepted.
    pub fn from_model_reply(content: &str) -> AppResult<Self> {
        let parsed: Value = serde_json::from_str(content.trim())?;
        let object = parsed
            .as_object()
            .ok_or_else(|| AppError::Provider("model reply is not a JSON object".into()))?;

        let text = |key: &str| -> AppResult<Option<String>> {
            match object.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(v)) => {
                    Ok(Some(v.trim()).filter(|v| !v.is_empty()).map(str::to_string))
                }
                Some(other) => Err(AppError::Provider(format!(
                    "{key} has unexpected type: {other}"
                ))),
            }
        };
        let description = text("description")?;
        let area_commentary = text("area_commentary")?;
        let score = match object.get("potential_score") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(n.as_f64().unwrap_or(f64::NAN)),
            Some(Value::String(s)) => Some(s.trim().parse::<f64>().unwrap_or(f64::NAN)),
            Some(other) => {
                return Err(AppError::Provider(format!(
                    "potential_score has unexpected type: {other}"
                )))
            }
        };
        let potential_score = match score {
            None => None,
            Some(value) if value.fract() == 0.0 && (1.0..=10.0).contains(&value) => {
                Some(value as u8)
            }
            Some(_) => {
                return Err(AppError::Provider(
                    "potential_score must be an integer between 1 and 10".into(),
                ))
            }
        };

        if description.is_none() && area_commentary.is_none() && potential_score.is_none() {
            return Err(AppError::Provider(
                "model reply has no description, area_commentary or potential_score".into(),
            ));
        }

        Ok(Self {
            description,
            area_commentary,
            potential_score,
            error: None,
        })
    }
}

#[async_trait]
pub trait InsightModel: Send + Sync {
    async fn request_annotation(
        &self,
        record: &PlaceRecord,
        photo_urls: &[String],
        instruction: &str,
    ) -> AppResult<Annotation>;
}

/// Annotates one record, folding any failure into an error-tagged annotation.
pub async fn annotate(
    model: &dyn InsightModel,
    record: &PlaceRecord,
    photo_urls: &[String],
    instruction: &str,
) -> Annotation {
    match model.request_annotation(record, photo_urls, instruction).await {
        Ok(annotation) => annotation,
        Err(err) => {
            warn!(place_id = %record.place_id, error = %err, "annotation failed");
            Annotation::failed(err.to_string())
        }
    }
}

/// Annotates records one at a time, pausing `delay` between calls. The output
/// lines up with `records` by position.
pub async fn annotate_all(
    model: &dyn InsightModel,
    records: &[PlaceRecord],
    photo_urls: &[Vec<String>],
    instruction: &str,
    delay: Duration,
) -> Vec<Annotation> {
    let mut annotations = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        if index > 0 && !delay.is_zero() {
            sleep(delay).await;
        }
        let photos = photo_urls.get(index).map(Vec::as_slice).unwrap_or_default();
        annotations.push(annotate(model, record, photos, instruction).await);
    }
    annotations
}

pub struct OpenAiAnnotator {
    http: reqwest::Client,
    api_base: String,
    model: String,
    api_key: SecretString,
}

impl OpenAiAnnotator {
    pub fn new(http: reqwest::Client, config: &AppConfig, api_key: SecretString) -> Self {
        Self {
            http,
            api_base: config.llm_api_base.clone(),
            model: config.llm_model.clone(),
            api_key,
        }
    }

    fn request_body(
        &self,
        record: &PlaceRecord,
        photo_urls: &[String],
        instruction: &str,
    ) -> AppResult<Value> {
        let mut content = vec![json!({
            "type": "text",
            "text": format!("Place data:\n{}", serde_json::to_string_pretty(record)?),
        })];
        content.extend(photo_urls.iter().map(|url| {
            json!({
                "type": "image_url",
                "image_url": { "url": url },
            })
        }));

        Ok(json!({
            "model": self.model,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": instruction },
                { "role": "user", "content": content },
            ],
        }))
    }
}

#[async_trait]
impl InsightModel for OpenAiAnnotator {
    async fn request_annotation(
        &self,
        record: &PlaceRecord,
        photo_urls: &[String],
        instruction: &str,
    ) -> AppResult<Annotation> {
        let body = self.request_body(record, photo_urls, instruction)?;
        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Provider(format!(
                "chat completion failed ({status})"
            )));
        }

        let payload: Value = response.json().await?;
        let content = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Provider("chat completion missing message content".into()))?;
        debug!(place_id = %record.place_id, "annotation reply received");
        Annotation::from_model_reply(content)
    }
}
