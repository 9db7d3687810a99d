//! The `Run` entity (spec.md §3) and the identifiers derived from it.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Opaque 32-character lowercase hex identifier, unique per run.
///
/// Used as the naming key for the namespace, image tag, output branch and
/// working directory — see spec.md §3 invariants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(String);

impl RunId {
    /// Generate a new, never-reused run id (UUID v4 with dashes removed).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Parse a run id out of a derived name, e.g. a namespace `secd-{run_id}`.
    ///
    /// Returns `None` if the candidate isn't 32 lowercase hex characters.
    pub fn parse(candidate: &str) -> Option<Self> {
        if candidate.len() == 32 && candidate.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            Some(Self(candidate.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Namespace name derived from a run id: `secd-{run_id}`.
pub fn namespace_name(run_id: &RunId) -> String {
    format!("secd-{run_id}")
}

/// Strip the `secd-` prefix off a namespace name, yielding the run id.
pub fn run_id_from_namespace(namespace: &str) -> Option<RunId> {
    namespace.strip_prefix("secd-").and_then(RunId::parse)
}

/// Persistent-volume name for a run's output or cache volume.
pub fn pv_name(run_id: &RunId, kind: VolumeKind) -> String {
    format!("secd-{run_id}-{}", kind.as_str())
}

/// Persistent-volume-claim name for a run's output or cache volume.
pub fn pvc_name(run_id: &RunId, kind: VolumeKind) -> String {
    format!("secd-pvc-{run_id}-{}", kind.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    Output,
    Cache,
}

impl VolumeKind {
    fn as_str(self) -> &'static str {
        match self {
            VolumeKind::Output => "output",
            VolumeKind::Cache => "cache",
        }
    }
}

/// An ephemeral, per-run database principal (spec.md §3, §4.C).
#[derive(Debug, Clone)]
pub struct DbPrincipal {
    pub user: String,
    pub password: String,
}

/// A per-user persistent cache mount (spec.md §3).
#[derive(Debug, Clone)]
pub struct CacheSpec {
    pub host_dir: String,
    pub mount_path: String,
}

/// The central entity: one verified push producing one container execution.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: RunId,
    pub user_id: String,
    pub deadline: DateTime<Utc>,
    pub image_ref: String,
    pub repo_workdir: String,
    pub output_subdir: String,
    pub source_url: String,
    pub gpu: bool,
    pub cache_spec: Option<CacheSpec>,
    pub db_principal: DbPrincipal,
}

impl Run {
    pub fn namespace(&self) -> String {
        namespace_name(&self.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_run_ids_are_32_lowercase_hex_chars() {
        let id = RunId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(id.as_str(), id.as_str().to_lowercase());
    }

    #[test]
    fn generated_run_ids_are_pairwise_distinct() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| RunId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn namespace_roundtrips_to_run_id() {
        let id = RunId::generate();
        let ns = namespace_name(&id);
        assert_eq!(ns, format!("secd-{id}"));
        assert_eq!(run_id_from_namespace(&ns), Some(id));
    }

    #[test]
    fn rejects_malformed_run_ids() {
        assert!(RunId::parse("not-hex").is_none());
        assert!(RunId::parse("DEADBEEF00000000000000000000000").is_none());
        assert!(RunId::parse("short").is_none());
    }

    #[test]
    fn volume_and_claim_names_are_derived_consistently() {
        let id = RunId::generate();
        assert_eq!(pv_name(&id, VolumeKind::Output), format!("secd-{id}-output"));
        assert_eq!(pvc_name(&id, VolumeKind::Output), format!("secd-pvc-{id}-output"));
        assert_eq!(pv_name(&id, VolumeKind::Cache), format!("secd-{id}-cache"));
    }
}
