//! Endpoint resolution: turning `{host, path}` into a signed, time-limited
//! websocket URL accepted by the chat service.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Result type for endpoint resolution
pub type ResolveResult<T> = Result<T, ResolveError>;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("missing host or path")]
    MissingTarget,

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    #[error("resolver request failed: {0}")]
    Request(String),
}

/// API key pair issued by the chat service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

/// Request body of the resolver endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub host: Option<String>,
    pub path: Option<String>,
}

/// Response body of the resolver endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    pub ws_url: String,
}

/// Anything that can produce a connectable URL for `{host, path}`
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self, host: &str, path: &str) -> ResolveResult<String>;
}

/// RFC1123 date as used in the signature (`Fri, 16 Oct 2026 08:30:00 GMT`)
pub fn rfc1123(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Sign `GET {path}` on `host` at `date` and build the websocket URL.
///
/// The canonical string, the authorization layout and the query parameter
/// names are fixed by the service; changing any byte breaks the handshake.
pub fn sign_url(
    credentials: &Credentials,
    host: &str,
    path: &str,
    date: &str,
) -> ResolveResult<String> {
    if host.is_empty() || path.is_empty() {
        return Err(ResolveError::MissingTarget);
    }

    let canonical = format!("host: {}\ndate: {}\nGET {} HTTP/1.1", host, date, path);

    let mut mac = HmacSha256::new_from_slice(credentials.api_secret.as_bytes())
        .map_err(|e| ResolveError::InvalidKey(e.to_string()))?;
    mac.update(canonical.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let authorization_origin = format!(
        "api_key=\"{}\", algorithm=\"hmac-sha256\", headers=\"host date request-line\", signature=\"{}\"",
        credentials.api_key, signature
    );
    let authorization = STANDARD.encode(authorization_origin.as_bytes());

    let url = reqwest::Url::parse_with_params(
        &format!("wss://{}{}", host, path),
        &[
            ("authorization", authorization.as_str()),
            ("date", date),
            ("host", host),
        ],
    )
    .map_err(|e| ResolveError::InvalidUrl(e.to_string()))?;

    Ok(url.to_string())
}

/// Signs URLs in-process with credentials it holds
#[derive(Debug, Clone)]
pub struct LocalSigner {
    credentials: Credentials,
}

impl LocalSigner {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl EndpointResolver for LocalSigner {
    async fn resolve(&self, host: &str, path: &str) -> ResolveResult<String> {
        sign_url(&self.credentials, host, path, &rfc1123(Utc::now()))
    }
}

/// Asks a resolver service (see [`crate::api`]) for a signed URL, keeping
/// the secret off the client
#[derive(Debug, Clone)]
pub struct HttpEndpointResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEndpointResolver {
    /// `endpoint` is the full URL of `POST /api/getWebSocketUrl`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl EndpointResolver for HttpEndpointResolver {
    async fn resolve(&self, host: &str, path: &str) -> ResolveResult<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ResolveRequest {
                host: Some(host.to_string()),
                path: Some(path.to_string()),
            })
            .send()
            .await
            .map_err(|e| ResolveError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ResolveError::Request(format!(
                "resolver returned {}",
                response.status()
            )));
        }

        let body: ResolveResponse = response
            .json()
            .await
            .map_err(|e| ResolveError::Request(e.to_string()))?;
        Ok(body.ws_url)
    }
}
