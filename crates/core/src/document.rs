//! JSON / YAML documents on disk, chosen by file extension.
//!
//! Programs, fact sets and configuration files all go through here so the
//! CLI accepts either format for every input.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    /// `.yaml` / `.yml` select YAML; everything else is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
            Some(ext) if ext == "yaml" || ext == "yml" => DocumentFormat::Yaml,
            _ => DocumentFormat::Json,
        }
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

pub fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T, DocumentError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| DocumentError::Io { path: path.to_path_buf(), source })?;
    match DocumentFormat::from_path(path) {
        DocumentFormat::Json => serde_json::from_str(&text)
            .map_err(|source| DocumentError::Json { path: path.to_path_buf(), source }),
        DocumentFormat::Yaml => serde_yaml::from_str(&text)
            .map_err(|source| DocumentError::Yaml { path: path.to_path_buf(), source }),
    }
}

pub fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<(), DocumentError> {
    let text = match DocumentFormat::from_path(path) {
        DocumentFormat::Json => serde_json::to_string_pretty(value)
            .map_err(|source| DocumentError::Json { path: path.to_path_buf(), source })?,
        DocumentFormat::Yaml => serde_yaml::to_string(value)
            .map_err(|source| DocumentError::Yaml { path: path.to_path_buf(), source })?,
    };
    std::fs::write(path, text).map_err(|source| DocumentError::Io { path: path.to_path_buf(), source })
}
