//! Forge Client (component A).
//!
//! Wraps the subset of the GitLab REST API and the git plumbing spec.md
//! §4.A names: commit signatures, file presence, identity-provider subject
//! lookup, authenticated clone, and best-effort result publication.

pub mod types;

use std::path::Path;

use git2::{build::RepoBuilder, Cred, IndexAddOption, RemoteCallbacks};
use reqwest::StatusCode;
use tracing::{info, warn};

use crate::config::GitlabSettings;
use crate::error::{Error, Result};
use crate::model::RunId;

use types::{CommitRef, GitlabUser, PushEvent, Signature};

pub use types::ProjectRef;

#[derive(Clone)]
pub struct ForgeClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    clone_username: String,
    clone_password: String,
}

impl ForgeClient {
    pub fn new(settings: &GitlabSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: settings.url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            clone_username: settings.username.clone(),
            clone_password: settings.password.clone(),
        }
    }

    /// `get_signature(project_id, commit_id) -> Signature | NotFound`.
    pub async fn get_signature(&self, project_id: i64, commit_id: &str) -> Result<Option<Signature>> {
        let url = format!(
            "{}/api/v4/projects/{project_id}/repository/commits/{commit_id}/signature",
            self.base_url
        );
        let resp = self
            .http
            .get(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(resp.json::<Signature>().await?)),
            _ => Err(Error::HttpError(resp.error_for_status().unwrap_err())),
        }
    }

    /// `has_file_in_repo(project_id, file_path, ref) -> bool`.
    pub async fn has_file_in_repo(&self, project_id: i64, file_path: &str, r#ref: &str) -> Result<bool> {
        let encoded_path = urlencode_path(file_path);
        let url = format!(
            "{}/api/v4/projects/{project_id}/repository/files/{encoded_path}?ref={ref}",
            self.base_url
        );
        let resp = self
            .http
            .get(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(Error::HttpError(resp.error_for_status().unwrap_err())),
        }
    }

    /// `get_idp_user_id(forge_user_id) -> external_subject | None`.
    ///
    /// Takes the first identity's `extern_uid` (spec.md §9 REDESIGN FLAGS:
    /// "identity mapping assumes the first identity" — the primary-IdP
    /// policy here is literally "first returned identity", made explicit by
    /// this doc comment rather than an unremarked `[0]` index).
    pub async fn get_idp_user_id(&self, gitlab_user_id: i64) -> Result<Option<String>> {
        let url = format!("{}/api/v4/users/{gitlab_user_id}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let user: GitlabUser = resp.json().await?;
                Ok(user.identities.first().and_then(|i| i.extern_uid.clone()))
            }
            _ => Err(Error::HttpError(resp.error_for_status().unwrap_err())),
        }
    }

    /// `clone(https_url, dest_path)`: rewrites the URL with the configured
    /// admin `username:password` and clones into `dest_path`.
    pub fn clone(&self, https_url: &str, dest_path: &str) -> Result<()> {
        let authenticated_url = self.with_credentials(https_url);
        RepoBuilder::new().clone(&authenticated_url, Path::new(dest_path))?;
        Ok(())
    }

    fn with_credentials(&self, https_url: &str) -> String {
        https_url.replacen(
            "https://",
            &format!("https://{}:{}@", self.clone_username, self.clone_password),
            1,
        )
    }

    fn remote_callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        let username = self.clone_username.clone();
        let password = self.clone_password.clone();
        callbacks.credentials(move |_url, _username_from_url, _allowed| {
            Cred::userpass_plaintext(&username, &password)
        });
        callbacks
    }

    /// `push_results(run_id)`: commits the working tree's outputs to a new
    /// branch and pushes it to origin. Each git step is isolated — a
    /// failure only logs a warning — but the working directory is always
    /// removed afterward (spec.md §4.A, Testable Property 6).
    pub fn push_results(&self, repo_workdir: &str, run_id: &RunId) {
        if !Path::new(repo_workdir).exists() {
            return;
        }

        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
        let branch_name = format!("outputs-{timestamp}-{run_id}");

        if let Err(e) = self.checkout_new_branch(repo_workdir, &branch_name) {
            warn!("push_results({run_id}): checkout failed: {e}");
        }
        if let Err(e) = self.stage_all(repo_workdir) {
            warn!("push_results({run_id}): stage failed: {e}");
        }
        let finished_at = chrono::Utc::now().to_rfc3339();
        let message = format!("secd: inserting result of run {run_id} finished at {finished_at}");
        if let Err(e) = self.commit_all(repo_workdir, &message) {
            warn!("push_results({run_id}): commit failed: {e}");
        }
        if let Err(e) = self.push_branch(repo_workdir, &branch_name) {
            warn!("push_results({run_id}): push failed: {e}");
        }

        if let Err(e) = std::fs::remove_dir_all(repo_workdir) {
            warn!("push_results({run_id}): failed to remove working directory: {e}");
        } else {
            info!("push_results({run_id}): removed working directory {repo_workdir}");
        }
    }

    fn checkout_new_branch(&self, repo_workdir: &str, branch_name: &str) -> Result<()> {
        let repo = git2::Repository::open(repo_workdir)?;
        let head_commit = repo.head()?.peel_to_commit()?;
        let branch = repo.branch(branch_name, &head_commit, false)?;
        let branch_ref = branch.into_reference();
        let ref_name = branch_ref.name().ok_or_else(|| {
            git2::Error::from_str("created branch has no valid reference name")
        })?;
        repo.set_head(ref_name)?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
        Ok(())
    }

    fn stage_all(&self, repo_workdir: &str) -> Result<()> {
        let repo = git2::Repository::open(repo_workdir)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        Ok(())
    }

    fn commit_all(&self, repo_workdir: &str, message: &str) -> Result<()> {
        let repo = git2::Repository::open(repo_workdir)?;
        let mut index = repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let signature = git2::Signature::now("secd", "secd@kthcloud.com")?;
        let parent = repo.head()?.peel_to_commit()?;
        repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &[&parent],
        )?;
        Ok(())
    }

    fn push_branch(&self, repo_workdir: &str, branch_name: &str) -> Result<()> {
        let repo = git2::Repository::open(repo_workdir)?;
        let mut remote = repo.find_remote("origin")?;
        let mut options = git2::PushOptions::new();
        options.remote_callbacks(self.remote_callbacks());
        let refspec = format!("refs/heads/{branch_name}:refs/heads/{branch_name}");
        remote.push(&[refspec.as_str()], Some(&mut options))?;
        Ok(())
    }
}

/// Minimal path segment encoding for the GitLab "get raw file" API, which
/// requires `/` in the file path to be percent-encoded.
fn urlencode_path(path: &str) -> String {
    path.replace('/', "%2F")
}

/// Schema-validate and shape-check a raw webhook body (spec.md §4.G step 3).
pub fn parse_push_event(body: &[u8]) -> Result<PushEvent> {
    if body.is_empty() {
        return Err(Error::InputRejected("missing body".to_string()));
    }
    serde_json::from_slice(body).map_err(|e| Error::InputRejected(format!("invalid body: {e}")))
}

pub type Commit = CommitRef;

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> GitlabSettings {
        GitlabSettings {
            url: url.to_string(),
            token: "tok".to_string(),
            username: "svc".to_string(),
            password: "pw".to_string(),
            secret: "hook-secret".to_string(),
        }
    }

    #[tokio::test]
    async fn get_signature_maps_404_to_none() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = ForgeClient::new(&settings(&server.uri()));
        let result = client.get_signature(1, "deadbeef").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn get_signature_returns_verification_status() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(
                serde_json::json!({ "verification_status": "verified" }),
            ))
            .mount(&server)
            .await;

        let client = ForgeClient::new(&settings(&server.uri()));
        let sig = client.get_signature(1, "deadbeef").await.unwrap().unwrap();
        assert!(sig.is_verified());
    }

    #[tokio::test]
    async fn has_file_in_repo_maps_404_to_false() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = ForgeClient::new(&settings(&server.uri()));
        assert!(!client.has_file_in_repo(1, "Dockerfile", "refs/heads/main").await.unwrap());
    }

    #[tokio::test]
    async fn get_idp_user_id_takes_first_identity() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "identities": [
                    { "provider": "keycloak", "extern_uid": "u42" },
                    { "provider": "other", "extern_uid": "u99" },
                ]
            })))
            .mount(&server)
            .await;

        let client = ForgeClient::new(&settings(&server.uri()));
        let subject = client.get_idp_user_id(42).await.unwrap();
        assert_eq!(subject.as_deref(), Some("u42"));
    }

    #[tokio::test]
    async fn get_idp_user_id_none_when_no_identities() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({ "identities": [] })),
            )
            .mount(&server)
            .await;

        let client = ForgeClient::new(&settings(&server.uri()));
        assert!(client.get_idp_user_id(42).await.unwrap().is_none());
    }

    #[test]
    fn parse_push_event_rejects_empty_body() {
        assert!(parse_push_event(b"").is_err());
    }

    #[test]
    fn parse_push_event_rejects_invalid_json() {
        assert!(parse_push_event(b"not json").is_err());
    }

    #[test]
    fn parse_push_event_accepts_unknown_keys() {
        let body = serde_json::json!({
            "event_name": "push",
            "ref": "refs/heads/main",
            "user_id": 1,
            "project_id": 2,
            "project": { "http_url": "https://gitlab.example.com/a/b.git", "path_with_namespace": "a/b" },
            "commits": [{ "id": "deadbeef", "extra_field": "ignored" }],
            "totally_unknown_top_level_key": 123,
        });
        let event = parse_push_event(body.to_string().as_bytes()).unwrap();
        assert_eq!(event.event_name, "push");
        assert_eq!(event.commits.len(), 1);
    }

    /// Sets up a bare "origin" repo plus a working clone with one commit,
    /// exercising `push_results` end to end against real git plumbing.
    fn seed_repo_with_origin() -> (tempfile::TempDir, tempfile::TempDir) {
        let origin_dir = tempfile::tempdir().unwrap();
        git2::Repository::init_bare(origin_dir.path()).unwrap();

        let work_dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::clone(
            origin_dir.path().to_str().unwrap(),
            work_dir.path(),
        )
        .unwrap();

        std::fs::write(work_dir.path().join("README.md"), "hello\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let signature = git2::Signature::now("test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &signature, &signature, "initial", &tree, &[])
            .unwrap();

        (origin_dir, work_dir)
    }

    #[test]
    fn push_results_always_removes_the_working_directory() {
        let (_origin, work_dir) = seed_repo_with_origin();
        let client = ForgeClient::new(&settings("https://gitlab.example.com"));
        let run_id = RunId::generate();

        std::fs::write(work_dir.path().join("outputs.txt"), "result\n").unwrap();
        client.push_results(work_dir.path().to_str().unwrap(), &run_id);

        assert!(!work_dir.path().exists());
    }

    #[test]
    fn push_results_on_missing_directory_is_a_no_op() {
        let client = ForgeClient::new(&settings("https://gitlab.example.com"));
        let run_id = RunId::generate();
        // Should not panic even though the directory was never created.
        client.push_results("/tmp/secd-does-not-exist-xyz", &run_id);
    }
}
