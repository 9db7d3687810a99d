//! Wire types for the subset of the GitLab REST API the forge client uses,
//! and the webhook payload shape admission validates against (spec.md §4.G
//! step 3 / §6).

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Signature {
    pub verification_status: String,
}

impl Signature {
    pub fn is_verified(&self) -> bool {
        self.verification_status == "verified"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub extern_uid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitlabUser {
    #[serde(default)]
    pub identities: Vec<Identity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectRef {
    pub http_url: String,
    pub path_with_namespace: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitRef {
    pub id: String,
}

/// The `POST /v1/hook` request body, after schema validation
/// (spec.md §4.G step 3). Unknown keys are tolerated by `serde`'s default
/// behavior of ignoring fields it doesn't map.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    pub event_name: String,
    pub r#ref: String,
    pub user_id: i64,
    pub project_id: i64,
    pub project: ProjectRef,
    pub commits: Vec<CommitRef>,
}
