//! Thin HTTP client for one peer's control API. Signing and verification
//! stay with the caller; this layer only moves bytes and maps failure
//! statuses into `RequestError` so callers can branch on them.

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::debug;

use crate::error::RequestError;
use crate::types::NodeInfoSummary;

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// The peer's mutual-auth response header, when present.
    pub authorization: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Unauthenticated identity lookup, used to independently resolve who
    /// is behind a URL.
    pub async fn node_info(&self) -> Result<NodeInfoSummary, RequestError> {
        let url = format!("{}/control/v0/node_info", self.base_url);
        debug!("fetching node info from {}", url);
        let response = self.http.get(&url).send().await?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(RequestError::Status { status });
        }
        Ok(response.json().await?)
    }

    /// Authenticated POST of a JSON body. Non-2xx statuses come back as
    /// `RequestError::Status` so callers can branch retry behavior.
    pub async fn post(
        &self,
        path: &str,
        body: Vec<u8>,
        authorization: String,
    ) -> Result<ApiResponse, RequestError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, authorization)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let authorization = response
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        if status >= 400 {
            return Err(RequestError::Status { status });
        }
        let body = response.bytes().await?.to_vec();
        Ok(ApiResponse {
            status,
            body,
            authorization,
        })
    }
}
