//! Typed HTTP client for the upstream Onstaq service.
//!
//! All engine reads and writes of workspace data go through this adapter.
//! Authentication is a bearer token obtained via `login`; a 401 on any call
//! triggers exactly one re-login and retry before the error surfaces.

pub mod types;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

pub use types::*;

#[derive(Error, Debug)]
pub enum OnstaqError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Upstream rejected the request: {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Upstream authentication failed")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(String),
    #[error("Failed to parse upstream response: {0}")]
    Parse(String),
    #[error("No service credentials configured")]
    NoCredentials,
}

pub type OnstaqResult<T> = Result<T, OnstaqError>;

#[derive(serde::Deserialize)]
struct LoginResponse {
    token: String,
}

/// HTTP client for the Onstaq REST API.
pub struct OnstaqClient {
    base_url: String,
    client: Client,
    credentials: Option<(String, String)>,
    token: RwLock<Option<String>>,
}

impl OnstaqClient {
    pub fn new(base_url: impl Into<String>, email: &str, password: &str) -> Self {
        let base_url = base_url.into();
        let client = Client::builder()
            .user_agent("onstaq-automation/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        let credentials = if email.is_empty() {
            None
        } else {
            Some((email.to_string(), password.to_string()))
        };

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            credentials,
            token: RwLock::new(None),
        }
    }

    /// Inject a token directly instead of logging in (used in tests and when
    /// the deployment provides a long-lived service token).
    pub fn with_token(base_url: impl Into<String>, token: &str) -> Self {
        let mut this = Self::new(base_url, "", "");
        this.token = RwLock::new(Some(token.to_string()));
        this
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Authenticate with the configured service credentials and store the
    /// returned bearer token.
    pub async fn login(&self) -> OnstaqResult<()> {
        let (email, password) = self
            .credentials
            .as_ref()
            .ok_or(OnstaqError::NoCredentials)?;

        let response = self
            .client
            .post(format!("{}/api/auth/login", self.base_url))
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(OnstaqError::Unauthorized);
        }
        let login: LoginResponse = self.parse(response).await?;
        *self.token.write().await = Some(login.token);
        debug!("Authenticated against upstream at {}", self.base_url);
        Ok(())
    }

    /// Validate an arbitrary caller token by forwarding it to `getMe`.
    /// Used by the engine's auth middleware; nothing is cached.
    pub async fn validate_token(&self, token: &str) -> OnstaqResult<User> {
        let response = self
            .client
            .get(format!("{}/api/users/me", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(OnstaqError::Unauthorized);
        }
        self.parse(response).await
    }

    /// The identity behind the engine's own service token.
    pub async fn get_me(&self) -> OnstaqResult<User> {
        self.request(Method::GET, "/api/users/me", None, &[]).await
    }

    // =========================================================================
    // Workspaces / catalogs / attributes
    // =========================================================================

    pub async fn get_workspace(&self, workspace_id: Uuid) -> OnstaqResult<Workspace> {
        self.request(
            Method::GET,
            &format!("/api/workspaces/{}", workspace_id),
            None,
            &[],
        )
        .await
    }

    pub async fn list_catalogs(&self, workspace_id: Uuid) -> OnstaqResult<Vec<Catalog>> {
        self.request(
            Method::GET,
            &format!("/api/workspaces/{}/catalogs", workspace_id),
            None,
            &[],
        )
        .await
    }

    pub async fn create_catalog(
        &self,
        workspace_id: Uuid,
        name: &str,
        options: Option<&Value>,
    ) -> OnstaqResult<Catalog> {
        let mut body = serde_json::json!({ "name": name });
        if let Some(options) = options {
            body["options"] = options.clone();
        }
        self.request(
            Method::POST,
            &format!("/api/workspaces/{}/catalogs", workspace_id),
            Some(&body),
            &[],
        )
        .await
    }

    pub async fn list_attributes(&self, catalog_id: Uuid) -> OnstaqResult<Vec<AttributeDef>> {
        self.request(
            Method::GET,
            &format!("/api/catalogs/{}/attributes", catalog_id),
            None,
            &[],
        )
        .await
    }

    pub async fn create_attribute(
        &self,
        catalog_id: Uuid,
        name: &str,
        attribute_type: &str,
        options: Option<&Value>,
    ) -> OnstaqResult<AttributeDef> {
        let mut body = serde_json::json!({ "name": name, "attributeType": attribute_type });
        if let Some(options) = options {
            body["options"] = options.clone();
        }
        self.request(
            Method::POST,
            &format!("/api/catalogs/{}/attributes", catalog_id),
            Some(&body),
            &[],
        )
        .await
    }

    pub async fn list_workspace_members(
        &self,
        workspace_id: Uuid,
    ) -> OnstaqResult<Vec<WorkspaceMember>> {
        self.request(
            Method::GET,
            &format!("/api/workspaces/{}/members", workspace_id),
            None,
            &[],
        )
        .await
    }

    pub async fn add_workspace_member(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        role: &str,
    ) -> OnstaqResult<WorkspaceMember> {
        self.request(
            Method::POST,
            &format!("/api/workspaces/{}/members", workspace_id),
            Some(&serde_json::json!({ "userId": user_id, "role": role })),
            &[],
        )
        .await
    }

    // =========================================================================
    // Items
    // =========================================================================

    pub async fn list_items(&self, catalog_id: Uuid, params: &ListParams) -> OnstaqResult<ItemPage> {
        self.request(
            Method::GET,
            &format!("/api/catalogs/{}/items", catalog_id),
            None,
            &params.to_query(),
        )
        .await
    }

    pub async fn get_item(&self, item_id: Uuid) -> OnstaqResult<Item> {
        self.request(Method::GET, &format!("/api/items/{}", item_id), None, &[])
            .await
            .map_err(|e| match e {
                OnstaqError::Api { status: 404, .. } => {
                    OnstaqError::NotFound(format!("Item {}", item_id))
                }
                other => other,
            })
    }

    /// Find a single item in a workspace by its human-readable key.
    pub async fn find_item_by_key(
        &self,
        workspace_id: Uuid,
        key: &str,
    ) -> OnstaqResult<Option<Item>> {
        let page: ItemPage = self
            .request(
                Method::GET,
                &format!("/api/workspaces/{}/items", workspace_id),
                None,
                &[("key".to_string(), key.to_string()), ("limit".to_string(), "1".to_string())],
            )
            .await?;
        Ok(page.items.into_iter().next())
    }

    pub async fn create_item(
        &self,
        catalog_id: Uuid,
        attributes: &Value,
    ) -> OnstaqResult<Item> {
        self.request(
            Method::POST,
            &format!("/api/catalogs/{}/items", catalog_id),
            Some(&serde_json::json!({ "attributeValues": attributes })),
            &[],
        )
        .await
    }

    pub async fn update_item(&self, item_id: Uuid, attributes: &Value) -> OnstaqResult<Item> {
        self.request(
            Method::PUT,
            &format!("/api/items/{}", item_id),
            Some(&serde_json::json!({ "attributeValues": attributes })),
            &[],
        )
        .await
    }

    pub async fn delete_item(&self, item_id: Uuid) -> OnstaqResult<()> {
        self.request_empty(Method::DELETE, &format!("/api/items/{}", item_id), None)
            .await
    }

    pub async fn import_items(
        &self,
        catalog_id: Uuid,
        rows: &Value,
        key_column: Option<&str>,
    ) -> OnstaqResult<ImportResult> {
        let mut body = serde_json::json!({ "rows": rows });
        if let Some(key_column) = key_column {
            body["keyColumn"] = Value::String(key_column.to_string());
        }
        self.request(
            Method::POST,
            &format!("/api/catalogs/{}/items/import", catalog_id),
            Some(&body),
            &[],
        )
        .await
    }

    // =========================================================================
    // References / history / comments
    // =========================================================================

    /// Outbound references from an item.
    pub async fn list_references(&self, item_id: Uuid) -> OnstaqResult<Vec<Reference>> {
        self.request(
            Method::GET,
            &format!("/api/items/{}/references", item_id),
            None,
            &[],
        )
        .await
    }

    /// Inbound references pointing at an item.
    pub async fn list_back_references(&self, item_id: Uuid) -> OnstaqResult<Vec<Reference>> {
        self.request(
            Method::GET,
            &format!("/api/items/{}/back-references", item_id),
            None,
            &[],
        )
        .await
    }

    pub async fn create_reference(
        &self,
        from_item_id: Uuid,
        to_item_id: Uuid,
        kind: &str,
        label: Option<&str>,
    ) -> OnstaqResult<Reference> {
        let mut body = serde_json::json!({ "toItemId": to_item_id, "kind": kind });
        if let Some(label) = label {
            body["label"] = Value::String(label.to_string());
        }
        self.request(
            Method::POST,
            &format!("/api/items/{}/references", from_item_id),
            Some(&body),
            &[],
        )
        .await
    }

    pub async fn delete_reference(&self, item_id: Uuid, reference_id: Uuid) -> OnstaqResult<()> {
        self.request_empty(
            Method::DELETE,
            &format!("/api/items/{}/references/{}", item_id, reference_id),
            None,
        )
        .await
    }

    /// History entries for an item, newest first. `since` trims server-side.
    pub async fn list_history(
        &self,
        item_id: Uuid,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> OnstaqResult<Vec<HistoryEntry>> {
        let mut query = Vec::new();
        if let Some(since) = since {
            query.push(("since".to_string(), since.to_rfc3339()));
        }
        self.request(
            Method::GET,
            &format!("/api/items/{}/history", item_id),
            None,
            &query,
        )
        .await
    }

    pub async fn list_comments(
        &self,
        item_id: Uuid,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> OnstaqResult<Vec<Comment>> {
        let mut query = Vec::new();
        if let Some(since) = since {
            query.push(("since".to_string(), since.to_rfc3339()));
        }
        self.request(
            Method::GET,
            &format!("/api/items/{}/comments", item_id),
            None,
            &query,
        )
        .await
    }

    pub async fn add_comment(&self, item_id: Uuid, body: &str) -> OnstaqResult<Comment> {
        self.request(
            Method::POST,
            &format!("/api/items/{}/comments", item_id),
            Some(&serde_json::json!({ "body": body })),
            &[],
        )
        .await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn execute_query(&self, workspace_id: Uuid, query: &str) -> OnstaqResult<QueryResult> {
        self.request(
            Method::POST,
            &format!("/api/workspaces/{}/query", workspace_id),
            Some(&serde_json::json!({ "query": query })),
            &[],
        )
        .await
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(String, String)],
    ) -> OnstaqResult<T> {
        let response = self.send(method.clone(), path, body, query).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            // One re-login, then retry once.
            warn!("Upstream returned 401, re-authenticating");
            self.login().await?;
            let retried = self.send(method, path, body, query).await?;
            return self.parse(retried).await;
        }
        self.parse(response).await
    }

    async fn request_empty(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> OnstaqResult<()> {
        let response = self.send(method.clone(), path, body, &[]).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.login().await?;
            let retried = self.send(method, path, body, &[]).await?;
            return self.check(retried).await;
        }
        self.check(response).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(String, String)],
    ) -> OnstaqResult<reqwest::Response> {
        let mut request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));

        if let Some(token) = self.token.read().await.as_ref() {
            request = request.bearer_auth(token);
        }
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        Ok(request.send().await?)
    }

    async fn parse<T: DeserializeOwned>(&self, response: reqwest::Response) -> OnstaqResult<T> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(OnstaqError::Api {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|e| OnstaqError::Parse(e.to_string()))
    }

    async fn check(&self, response: reqwest::Response) -> OnstaqResult<()> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(OnstaqError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = OnstaqClient::new("http://localhost:8080/", "", "");
        assert_eq!(client.base_url(), "http://localhost:8080");
    }

    #[tokio::test]
    async fn test_login_without_credentials_fails() {
        let client = OnstaqClient::new("http://localhost:8080", "", "");
        assert!(matches!(
            client.login().await,
            Err(OnstaqError::NoCredentials)
        ));
    }
}
