//! Metadata Parser (component F): `{repo_workdir}/secd.yml`.
//!
//! Parsing policy (spec.md §4.F): a missing file falls back to defaults; a
//! file whose contents aren't valid YAML is an admission-level failure
//! (spec.md §9 Open Question 3 resolves `None` from the original as a hard
//! `ProvisionFailed` rather than an unchecked dereference); YAML that parses
//! but doesn't match the expected shape falls back to defaults with a
//! warning; unknown keys are tolerated.

use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;
use tracing::warn;

use crate::error::{Error, Result};

const DEFAULT_RUNFOR_HOURS: f64 = 3.0;
const DEFAULT_CACHE_MOUNT_PATH: &str = "/cache";

#[derive(Debug, Clone, PartialEq)]
pub struct RunMetadata {
    pub runfor_hours: f64,
    pub gpu: bool,
    pub cache_dir: Option<String>,
    pub mount_path: Option<String>,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            runfor_hours: DEFAULT_RUNFOR_HOURS,
            gpu: false,
            cache_dir: None,
            mount_path: None,
        }
    }
}

impl RunMetadata {
    /// Effective cache mount path: the configured one, or `/cache` when a
    /// cache directory was requested without an explicit mount path.
    pub fn effective_mount_path(&self) -> Option<&str> {
        self.cache_dir.as_ref().map(|_| {
            self.mount_path
                .as_deref()
                .unwrap_or(DEFAULT_CACHE_MOUNT_PATH)
        })
    }
}

/// Loosely-typed view of `secd.yml`, used only to validate shape before
/// committing to the strongly-typed `RunMetadata`.
#[derive(Debug, Deserialize)]
struct RawMetadata {
    runfor: Option<Value>,
    gpu: Option<Value>,
    cache_dir: Option<Value>,
    mount_path: Option<Value>,
}

/// Parse `{repo_workdir}/secd.yml`, merging with defaults for absent keys.
pub fn parse_file(repo_workdir: &str) -> Result<RunMetadata> {
    let path = Path::new(repo_workdir).join("secd.yml");
    if !path.is_file() {
        return Ok(RunMetadata::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    parse_str(&raw, &path.display().to_string())
}

fn parse_str(raw: &str, display_path: &str) -> Result<RunMetadata> {
    let value: Value = serde_yaml::from_str(raw).map_err(|e| {
        Error::ProvisionFailed(format!("invalid metadata file {display_path}: {e}"))
    })?;

    if value.is_null() {
        return Ok(RunMetadata::default());
    }

    let raw: RawMetadata = match serde_yaml::from_value(value) {
        Ok(r) => r,
        Err(_) => {
            warn!("invalid metadata file {display_path}, falling back to defaults");
            return Ok(RunMetadata::default());
        }
    };

    let default = RunMetadata::default();

    let runfor_hours = match raw.runfor {
        None => default.runfor_hours,
        Some(v) => match v.as_f64().or_else(|| v.as_u64().map(|n| n as f64)) {
            Some(n) => n,
            None => {
                warn!("invalid metadata file {display_path}, falling back to defaults");
                return Ok(default);
            }
        },
    };

    let gpu = match raw.gpu {
        None => default.gpu,
        Some(Value::Bool(b)) => b,
        Some(_) => {
            warn!("invalid metadata file {display_path}, falling back to defaults");
            return Ok(default);
        }
    };

    let cache_dir = match raw.cache_dir {
        None => None,
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            warn!("invalid metadata file {display_path}, falling back to defaults");
            return Ok(default);
        }
    };

    let mount_path = match raw.mount_path {
        None => None,
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            warn!("invalid metadata file {display_path}, falling back to defaults");
            return Ok(default);
        }
    };

    Ok(RunMetadata {
        runfor_hours,
        gpu,
        cache_dir,
        mount_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let meta = parse_file(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(meta, RunMetadata::default());
    }

    #[test]
    fn empty_file_yields_defaults() {
        let meta = parse_str("", "secd.yml").unwrap();
        assert_eq!(meta, RunMetadata::default());
    }

    #[test]
    fn parse_absent_and_empty_are_idempotent_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let absent = parse_file(dir.path().to_str().unwrap()).unwrap();
        let empty = parse_str("", "secd.yml").unwrap();
        assert_eq!(absent, RunMetadata::default());
        assert_eq!(empty, RunMetadata::default());
    }

    #[test]
    fn valid_document_merges_with_defaults() {
        let meta = parse_str("gpu: true\n", "secd.yml").unwrap();
        assert_eq!(meta.gpu, true);
        assert_eq!(meta.runfor_hours, DEFAULT_RUNFOR_HOURS);
    }

    #[test]
    fn full_document_overrides_all_fields() {
        let meta = parse_str(
            "runfor: 6\ngpu: true\ncache_dir: models\nmount_path: /models\n",
            "secd.yml",
        )
        .unwrap();
        assert_eq!(meta.runfor_hours, 6.0);
        assert!(meta.gpu);
        assert_eq!(meta.cache_dir.as_deref(), Some("models"));
        assert_eq!(meta.effective_mount_path(), Some("/models"));
    }

    #[test]
    fn cache_dir_without_mount_path_defaults_to_slash_cache() {
        let meta = parse_str("cache_dir: models\n", "secd.yml").unwrap();
        assert_eq!(meta.effective_mount_path(), Some("/cache"));
    }

    #[test]
    fn no_cache_dir_has_no_effective_mount_path() {
        let meta = RunMetadata::default();
        assert_eq!(meta.effective_mount_path(), None);
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let meta = parse_str("gpu: false\nsomething_else: 42\n", "secd.yml").unwrap();
        assert_eq!(meta, RunMetadata::default());
    }

    #[test]
    fn schema_invalid_document_falls_back_to_defaults() {
        let meta = parse_str("runfor: \"a lot\"\n", "secd.yml").unwrap();
        assert_eq!(meta, RunMetadata::default());
    }

    #[test]
    fn unparsable_yaml_is_a_hard_error() {
        let err = parse_str("gpu: [this is not: closed\n", "secd.yml").unwrap_err();
        assert!(matches!(err, Error::ProvisionFailed(_)));
    }
}
