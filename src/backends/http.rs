//! HTTP transport shared by the backend REST clients
//!
//! The clients build [`HttpRequest`]s and interpret [`HttpResponse`]s; the
//! transport only moves bytes. This keeps authentication and error mapping
//! testable without a live array.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

// =============================================================================
// Client Errors
// =============================================================================

/// Failure reported by a backend client adapter.
///
/// Drivers convert these into [`crate::Error`] before returning to the host.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Not authorized")]
    NotAuthorized,

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Response decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Command {program} failed: {message}")]
    Command { program: String, message: String },

    #[error("Unexpected response: {0}")]
    Unexpected(String),
}

impl ClientError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = extract_message(body);
        match status {
            404 => ClientError::NotFound { message },
            401 | 403 => ClientError::NotAuthorized,
            409 => ClientError::Conflict { message },
            _ => ClientError::Server { status, message },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    pub fn is_not_authorized(&self) -> bool {
        matches!(self, ClientError::NotAuthorized)
    }

    /// Backend-provided message, if any
    pub fn message(&self) -> String {
        match self {
            ClientError::NotFound { message }
            | ClientError::Conflict { message }
            | ClientError::Server { message, .. }
            | ClientError::Command { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Pull the `message` field out of an error body, falling back to the raw text
fn extract_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

// =============================================================================
// Requests / Responses
// =============================================================================

/// HTTP verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// Request handed to a transport
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Raw response returned by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn the response into JSON, classifying failures by status.
    ///
    /// An empty success body decodes as `null`.
    pub fn into_json(self) -> ClientResult<Value> {
        if !self.is_success() {
            return Err(ClientError::from_status(self.status, &self.body));
        }
        if self.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&self.body)?)
    }
}

// =============================================================================
// Transport Port
// =============================================================================

/// Moves a request to the backend and returns its raw response
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> ClientResult<HttpResponse>;
}

/// Configuration for the reqwest transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-request timeout
    pub timeout: Duration,
    /// Verify the backend's TLS certificate
    pub verify_tls: bool,
    /// PEM bundle (certificate followed by private key) for client auth
    pub client_identity_pem: Option<Vec<u8>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            verify_tls: false,
            client_identity_pem: None,
        }
    }
}

/// Transport backed by a reqwest client
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a new transport
    pub fn new(config: &TransportConfig) -> ClientResult<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls);

        if let Some(pem) = &config.client_identity_pem {
            builder = builder.identity(reqwest::Identity::from_pem(pem)?);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> ClientResult<HttpResponse> {
        debug!("{} {}", request.method, request.url);

        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Put => self.client.put(&request.url),
            Method::Delete => self.client.delete(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        debug!("{} {} -> HTTP {}", request.method, request.url, status);

        Ok(HttpResponse { status, body })
    }
}
