use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("http request failed: {0}")]
    Http(reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Input(String),
    #[error("too many place ids: got {count}, at most {max} are allowed")]
    TooManyPlaceIds { count: usize, max: usize },
    #[error("provider error: {0}")]
    Provider(String),
    #[error("invalid session transition: {0}")]
    Session(String),
}

// Request URLs carry the maps key as a query parameter, so they never make it
// into an error message.
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Http(err.without_url())
    }
}
