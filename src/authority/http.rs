//! REST client for the identity authority

use super::types::{
    CreateApiKeyRequest, CreatedApiKeyRecord, ErrorBody, ExtendApiKeyRequest, RolesResponse,
    TokenResponse, UserRolesRequest, UserStatusRequest,
};
use super::{AuthorityError, AuthorityResult, IdentityAuthority};
use crate::config::AuthorityConfig;
use crate::keys::ApiKey;
use crate::users::{NewUser, User};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Identity authority reached over HTTP
pub struct HttpAuthority {
    client: Client,
    base_url: Url,
}

impl HttpAuthority {
    /// Create a client rooted at `base_url` (for example `https://host/api/v1`)
    pub fn new(base_url: &str, timeout: Duration, user_agent: &str) -> AuthorityResult<Self> {
        let base_url = Url::parse(base_url).map_err(|e| {
            AuthorityError::InvalidArgument(format!("invalid base URL '{}': {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(AuthorityError::InvalidArgument(format!(
                "'{}' cannot be used as a base URL",
                base_url
            )));
        }

        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| AuthorityError::Network(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    /// Create a client from the `[authority]` config section
    pub fn from_config(config: &AuthorityConfig) -> AuthorityResult<Self> {
        Self::new(config.base_url.as_str(), config.timeout, &config.user_agent)
    }

    /// Base URL every endpoint is resolved against
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Append path segments to the base URL, percent-encoding each one
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str], token: &SecretString) -> RequestBuilder {
        let url = self.endpoint(segments);
        debug!(%method, path = url.path(), "Authority request");
        self.client
            .request(method, url)
            .bearer_auth(token.expose_secret())
    }

    async fn dispatch(request: RequestBuilder) -> AuthorityResult<Response> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> AuthorityResult<T> {
        let response = Self::dispatch(request).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        serde_json::from_slice(&bytes).map_err(|e| AuthorityError::InvalidResponse(e.to_string()))
    }

    async fn send_empty(request: RequestBuilder) -> AuthorityResult<()> {
        Self::dispatch(request).await.map(|_| ())
    }
}

fn transport_error(err: reqwest::Error) -> AuthorityError {
    if err.is_decode() {
        AuthorityError::InvalidResponse(err.to_string())
    } else {
        AuthorityError::Network(err.to_string())
    }
}

/// Map a non-2xx response onto the error taxonomy
fn status_error(status: StatusCode, body: &str) -> AuthorityError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message())
        .unwrap_or_else(|_| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                trimmed.to_string()
            }
        });

    match status {
        StatusCode::UNAUTHORIZED => AuthorityError::Unauthorized,
        StatusCode::FORBIDDEN => AuthorityError::Forbidden(message),
        StatusCode::NOT_FOUND => AuthorityError::NotFound(message),
        StatusCode::CONFLICT => AuthorityError::Conflict(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            AuthorityError::InvalidArgument(message)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            AuthorityError::Network(message)
        }
        other => AuthorityError::Status {
            status: other.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl IdentityAuthority for HttpAuthority {
    async fn exchange_credentials(
        &self,
        username: &str,
        password: &SecretString,
    ) -> AuthorityResult<SecretString> {
        let form = [
            ("username", username),
            ("password", password.expose_secret()),
        ];
        let request = self.client.post(self.endpoint(&["token"])).form(&form);
        let response: TokenResponse = Self::send_json(request).await?;
        Ok(response.access_token)
    }

    async fn logout(&self, token: &SecretString) -> AuthorityResult<()> {
        Self::send_empty(self.request(Method::POST, &["logout"], token)).await
    }

    async fn current_roles(&self, token: &SecretString) -> AuthorityResult<HashSet<String>> {
        let request = self.request(Method::GET, &["users", "me", "roles"], token);
        let response: RolesResponse = Self::send_json(request).await?;
        Ok(response.roles.into_iter().collect())
    }

    async fn create_api_key(
        &self,
        token: &SecretString,
        request: &CreateApiKeyRequest,
    ) -> AuthorityResult<CreatedApiKeyRecord> {
        let builder = self.request(Method::POST, &["api-keys"], token).json(request);
        Self::send_json(builder).await
    }

    async fn list_api_keys(&self, token: &SecretString) -> AuthorityResult<Vec<ApiKey>> {
        Self::send_json(self.request(Method::GET, &["api-keys"], token)).await
    }

    async fn get_api_key(&self, token: &SecretString, id: &str) -> AuthorityResult<ApiKey> {
        Self::send_json(self.request(Method::GET, &["api-keys", id], token)).await
    }

    async fn suspend_api_key(&self, token: &SecretString, id: &str) -> AuthorityResult<()> {
        Self::send_empty(self.request(Method::PUT, &["api-keys", id, "suspend"], token)).await
    }

    async fn resume_api_key(&self, token: &SecretString, id: &str) -> AuthorityResult<()> {
        Self::send_empty(self.request(Method::PUT, &["api-keys", id, "resume"], token)).await
    }

    async fn extend_api_key(
        &self,
        token: &SecretString,
        id: &str,
        days: i64,
    ) -> AuthorityResult<()> {
        let request = self
            .request(Method::PUT, &["api-keys", id, "extend"], token)
            .json(&ExtendApiKeyRequest { days });
        Self::send_empty(request).await
    }

    async fn delete_api_key(&self, token: &SecretString, id: &str) -> AuthorityResult<()> {
        Self::send_empty(self.request(Method::DELETE, &["api-keys", id], token)).await
    }

    async fn list_users(&self, token: &SecretString) -> AuthorityResult<Vec<User>> {
        Self::send_json(self.request(Method::GET, &["users"], token)).await
    }

    async fn create_user(&self, token: &SecretString, user: &NewUser) -> AuthorityResult<User> {
        let mut roles: Vec<&str> = user.roles.iter().map(String::as_str).collect();
        roles.sort_unstable();
        let roles = roles.join(",");
        let is_active = user.is_active.to_string();

        let mut form = vec![
            ("username", user.username.as_str()),
            ("email", user.email.as_str()),
            ("password", user.password.expose_secret()),
            ("is_active", is_active.as_str()),
        ];
        if !roles.is_empty() {
            form.push(("roles", roles.as_str()));
        }

        let request = self.request(Method::POST, &["users"], token).form(&form);
        Self::send_json(request).await
    }

    async fn set_user_status(
        &self,
        token: &SecretString,
        user_id: &str,
        is_active: bool,
    ) -> AuthorityResult<()> {
        let request = self
            .request(Method::PUT, &["users", user_id, "status"], token)
            .json(&UserStatusRequest { is_active });
        Self::send_empty(request).await
    }

    async fn set_user_roles(
        &self,
        token: &SecretString,
        user_id: &str,
        roles: &HashSet<String>,
    ) -> AuthorityResult<()> {
        let mut roles: Vec<String> = roles.iter().cloned().collect();
        roles.sort();
        let request = self
            .request(Method::PUT, &["users", user_id, "roles"], token)
            .json(&UserRolesRequest { roles });
        Self::send_empty(request).await
    }

    async fn reset_password(
        &self,
        token: &SecretString,
        user_id: &str,
        new_password: &SecretString,
    ) -> AuthorityResult<()> {
        let body = serde_json::json!({ "new_password": new_password.expose_secret() });
        let request = self
            .request(Method::PUT, &["users", user_id, "password"], token)
            .json(&body);
        Self::send_empty(request).await
    }

    async fn delete_user(&self, token: &SecretString, user_id: &str) -> AuthorityResult<()> {
        Self::send_empty(self.request(Method::DELETE, &["users", user_id], token)).await
    }
}
