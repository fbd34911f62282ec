//! Secrets built from `.env` files, referenced by `job.secret_env`.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::core::manifest::is_dns1123_name;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("line {line}: expected KEY=VALUE")]
    MissingEquals { line: usize },

    #[error("line {line}: invalid key '{key}'")]
    InvalidKey { line: usize, key: String },

    #[error("no variables found")]
    Empty,

    #[error("invalid secret name '{0}'")]
    InvalidName(String),
}

/// Parse `.env` content into key/value pairs.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is dropped,
/// and a value wrapped in matching single or double quotes is unquoted.
/// Later keys override earlier ones.
pub fn parse_env_file(content: &str) -> Result<BTreeMap<String, String>, SecretError> {
    let mut vars = BTreeMap::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let (key, value) = line
            .split_once('=')
            .ok_or(SecretError::MissingEquals { line: index + 1 })?;
        let key = key.trim();
        if !is_env_key(key) {
            return Err(SecretError::InvalidKey {
                line: index + 1,
                key: key.to_string(),
            });
        }
        vars.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    if vars.is_empty() {
        return Err(SecretError::Empty);
    }
    Ok(vars)
}

pub fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>, SecretError> {
    let content = std::fs::read_to_string(path).map_err(|source| SecretError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_env_file(&content)
}

/// An Opaque Secret holding `vars` as plain `stringData`
pub fn secret_manifest(
    name: &str,
    namespace: &str,
    vars: BTreeMap<String, String>,
) -> Result<Secret, SecretError> {
    if !is_dns1123_name(name) {
        return Err(SecretError::InvalidName(name.to_string()));
    }
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(vars),
        ..Default::default()
    })
}

fn is_env_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
