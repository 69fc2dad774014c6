use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("input file not found: {}", .0.display())]
    MissingInput(PathBuf),
    #[error("{file}: missing column(s) {missing:?}; columns found: {found:?}")]
    MissingColumns {
        file: String,
        missing: Vec<String>,
        found: Vec<String>,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("geocoding provider error: {0}")]
    Provider(String),
    #[error("{0}")]
    Config(String),
}

impl AppError {
    pub fn missing_columns(
        file: impl Into<String>,
        missing: Vec<String>,
        found: &csv::StringRecord,
    ) -> Self {
        AppError::MissingColumns {
            file: file.into(),
            missing,
            found: found.iter().map(str::to_string).collect(),
        }
    }
}

impl From<tempfile::PersistError> for AppError {
    fn from(value: tempfile::PersistError) -> Self {
        AppError::Io(value.error)
    }
}
