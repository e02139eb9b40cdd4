//! Thin reqwest wrapper: base URL handling, credential injection and the
//! JSON envelope every hub endpoint speaks.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::config::Credential;
use crate::error::HubError;

const API_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    transfer_client: Client,
    base_url: String,
    credential: Credential,
}

impl ApiClient {
    pub fn new(base_url: &str, credential: Credential) -> Result<Self> {
        let user_agent = format!("vmhub/{}", env!("CARGO_PKG_VERSION"));

        let client = Client::builder()
            .user_agent(user_agent.clone())
            .timeout(API_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build API client")?;

        // No overall timeout: transfers of multi-GB chunks legitimately run
        // for a long time.
        let transfer_client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build transfer client")?;

        Ok(Self {
            client,
            transfer_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn transfer_client(&self) -> &Client {
        &self.transfer_client
    }

    pub fn build_url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/v1/{}",
            self.base_url,
            endpoint.trim_start_matches('/')
        )
    }

    pub fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.credential.token {
            return request.header("Authorization", format!("Bearer {token}"));
        }
        if let (Some(username), Some(password)) =
            (&self.credential.username, &self.credential.password)
        {
            let encoded = STANDARD.encode(format!("{username}:{password}"));
            return request.header("Authorization", format!("Basic {encoded}"));
        }
        request
    }

    pub fn get(&self, endpoint: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.get(self.build_url(endpoint)))
    }

    pub fn post(&self, endpoint: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.post(self.build_url(endpoint)))
    }

    pub fn delete(&self, endpoint: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.delete(self.build_url(endpoint)))
    }

    pub fn transfer_get(&self, endpoint: &str) -> reqwest::RequestBuilder {
        self.authorize(self.transfer_client.get(self.build_url(endpoint)))
    }

    pub fn transfer_post(&self, endpoint: &str) -> reqwest::RequestBuilder {
        self.authorize(self.transfer_client.post(self.build_url(endpoint)))
    }

    /// Unwraps the `{msg, data, error, total}` envelope, translating error
    /// statuses into the typed taxonomy so callers can branch on kind.
    pub async fn parse_envelope<T>(&self, response: Response) -> Result<(Option<T>, Option<i64>)>
    where
        T: DeserializeOwned,
    {
        let status = response.status();
        if status.is_success() {
            let envelope: crate::api::models::Envelope<T> = response
                .json()
                .await
                .context("Failed to parse JSON response")?;
            return Ok((envelope.data, envelope.total));
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(body);

        let err = match status {
            StatusCode::UNAUTHORIZED => HubError::Unauthenticated,
            StatusCode::FORBIDDEN => HubError::Forbidden,
            StatusCode::NOT_FOUND => HubError::NotFound(message.clone()),
            StatusCode::CONFLICT => HubError::Conflict,
            _ => HubError::http(status.as_u16(), message.clone()),
        };
        Err(anyhow::Error::new(err).context(format!("server answered {status}: {message}")))
    }

    /// Like `parse_envelope`, for endpoints whose payload the caller ignores.
    pub async fn expect_ok(&self, response: Response) -> Result<()> {
        self.parse_envelope::<serde_json::Value>(response)
            .await
            .map(|_| ())
    }
}
