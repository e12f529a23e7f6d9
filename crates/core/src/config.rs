//! TOML configuration loading.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::result::Result;

/// Parse a TOML document into `T`.
///
/// # Errors
///
/// Returns `Error::TomlParseFailed` if the document is malformed or does not
/// match the shape of `T`.
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T> {
    toml::from_str(content).map_err(|e| Error::toml_parse_failed(e.to_string()))
}

/// Load a TOML file into `T`.
///
/// # Errors
///
/// Returns `Error::FileNotFound` when the path does not exist,
/// `Error::FileReadFailed` when it cannot be read, and
/// `Error::TomlParseFailed` when its content cannot be parsed.
pub fn load_toml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(Error::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let content =
        std::fs::read_to_string(path).map_err(|e| Error::file_read_failed(path, e.to_string()))?;

    tracing::debug!(path = %path.display(), bytes = content.len(), "Loaded config file");
    parse_toml(&content)
}

/// Render `value` as a pretty TOML document.
///
/// # Errors
///
/// Returns `Error::TomlSerializeFailed` if the value has no TOML
/// representation.
pub fn to_toml_string<T: Serialize>(value: &T) -> Result<String> {
    toml::to_string_pretty(value).map_err(|e| Error::TomlSerializeFailed {
        reason: e.to_string(),
    })
}
