//! Crate-wide error type.
//!
//! Mirrors the error kinds in spec.md §7: `InputRejected` and
//! `VerificationFailed` are surfaced over HTTP by the admission handler;
//! `ResolveFailed` and `ProvisionFailed` abort an in-flight launch;
//! `ConfigError` is fatal at process start.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InputRejected(String),

    #[error("commit signature verification failed: {0}")]
    VerificationFailed(String),

    #[error("could not resolve pushing identity: {0}")]
    ResolveFailed(String),

    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("database error: {0}")]
    DbError(#[from] sqlx::Error),

    #[error("git error: {0}")]
    GitError(#[from] git2::Error),

    #[error("container daemon error: {0}")]
    DockerError(#[from] bollard::errors::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
