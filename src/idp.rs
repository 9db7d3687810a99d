//! IdP Client (component B): maps an external identity to its Keycloak
//! group membership (spec.md §4.B).

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::KeycloakSettings;
use crate::error::{Error, Result};

const MYSQL_GROUP_PREFIX: &str = "/mysql_";

#[derive(Debug, Clone, Deserialize)]
pub struct Group {
    pub path: String,
}

pub struct IdpClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    realm: String,
    token: RwLock<Option<String>>,
}

impl IdpClient {
    pub fn new(settings: &KeycloakSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: settings.url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            realm: settings.realm.clone(),
            token: RwLock::new(None),
        }
    }

    /// `get_user_groups(external_subject) -> [Group] | None`.
    pub async fn get_user_groups(&self, external_subject: &str) -> Result<Option<Vec<Group>>> {
        let resp = self.get_groups(external_subject).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            // Admin token expired or was never fetched; refresh once and retry.
            *self.token.write().await = None;
            let retried = self.get_groups(external_subject).await?;
            return Self::handle_groups_response(retried).await;
        }
        Self::handle_groups_response(resp).await
    }

    async fn handle_groups_response(resp: reqwest::Response) -> Result<Option<Vec<Group>>> {
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(resp.json::<Vec<Group>>().await?)),
            _ => {
                warn!("keycloak group lookup failed with status {}", resp.status());
                Err(Error::HttpError(resp.error_for_status().unwrap_err()))
            }
        }
    }

    async fn get_groups(&self, external_subject: &str) -> Result<reqwest::Response> {
        let token = self.admin_token().await?;
        let url = format!(
            "{}/admin/realms/{}/users/{external_subject}/groups",
            self.base_url, self.realm
        );
        Ok(self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await?)
    }

    async fn admin_token(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }

        let url = format!(
            "{}/realms/master/protocol/openid-connect/token",
            self.base_url
        );
        let params = [
            ("grant_type", "password"),
            ("client_id", "admin-cli"),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ];
        let resp = self.http.post(&url).form(&params).send().await?;
        let resp = resp.error_for_status()?;

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }
        let token_response: TokenResponse = resp.json().await?;
        *self.token.write().await = Some(token_response.access_token.clone());
        Ok(token_response.access_token)
    }
}

/// Filter groups whose path begins with `/mysql_`, stripping the prefix to
/// yield database role names (spec.md §4.B).
pub fn mysql_roles(groups: &[Group]) -> Vec<String> {
    groups
        .iter()
        .filter_map(|g| g.path.strip_prefix(MYSQL_GROUP_PREFIX).map(str::to_string))
        .collect()
}
