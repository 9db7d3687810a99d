//! secd: continuous-build and isolated-execution controller.
//!
//! On a verified source-repository push, materializes a private,
//! time-bounded execution sandbox on Kubernetes and later collects its
//! outputs back into the originating repository.

pub mod admission;
pub mod cluster;
pub mod config;
pub mod credentials;
pub mod error;
pub mod forge;
pub mod idp;
pub mod image;
pub mod metadata;
pub mod model;
pub mod reaper;
pub mod telemetry;

pub use crate::error::{Error, Result};
