//! HTTP and WebSocket endpoints of one Jupyter server.
//!
//! Holds no state beyond configuration. Every request carries the
//! configured auth header; failures are classified but never retried here.

use std::time::Duration;

use log::debug;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Always ends with `/`.
    pub base_url: Url,
    /// Always ends with `/`.
    pub ws_url: Url,
    pub token: Option<String>,
    pub auth_header: String,
    pub timeout: Duration,
}

impl ServerSettings {
    /// Settings for `base_url`, with the WebSocket URL derived from it.
    pub fn new(base_url: Url) -> Result<Self> {
        let base_url = with_trailing_slash(base_url);
        let ws_url = websocket_base(&base_url)?;
        Ok(Self {
            base_url,
            ws_url,
            token: None,
            auth_header: "Authorization".to_string(),
            timeout: Duration::from_secs(30),
        })
    }

    pub fn with_ws_url(mut self, ws_url: Url) -> Result<Self> {
        if !matches!(ws_url.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "WebSocket URL must use ws or wss, got {}",
                ws_url
            )));
        }
        self.ws_url = with_trailing_slash(ws_url);
        Ok(self)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn websocket_base(base_url: &Url) -> Result<Url> {
    let scheme = match base_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(Error::Config(format!(
                "server URL must use http or https, got {}",
                other
            )))
        }
    };
    let mut ws_url = base_url.clone();
    ws_url
        .set_scheme(scheme)
        .map_err(|_| Error::Config(format!("cannot derive WebSocket URL from {}", base_url)))?;
    Ok(ws_url)
}

/// Resolves endpoints and performs authenticated requests.
#[derive(Debug, Clone)]
pub struct ServerConnection {
    settings: ServerSettings,
    client: reqwest::Client,
}

impl ServerConnection {
    pub fn new(settings: ServerSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { settings, client })
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// `path` is relative to the base URL; each segment is percent-encoded.
    pub fn build_url(&self, path: &str) -> Result<Url> {
        append_segments(self.settings.base_url.clone(), path)
    }

    /// WebSocket URL for `path`, with the token as a query parameter.
    pub fn build_ws_url(&self, path: &str) -> Result<Url> {
        let mut url = append_segments(self.settings.ws_url.clone(), path)?;
        if let Some(token) = &self.settings.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    /// Value of the auth header, e.g. `token abc123`.
    pub fn auth_value(&self) -> Option<String> {
        self.settings
            .token
            .as_ref()
            .map(|token| format!("token {}", token))
    }

    /// A request builder with the auth header already attached.
    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match self.auth_value() {
            Some(value) => builder.header(self.settings.auth_header.as_str(), value),
            None => builder,
        }
    }

    /// Send a prepared request. 401/403 become [`Error::Auth`]; transport
    /// failures become [`Error::Network`]. Other statuses are returned as-is.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                Error::Config(e.to_string())
            } else {
                Error::Network(e.to_string())
            }
        })?;
        debug!(
            "[server] {} {}",
            response.status().as_u16(),
            response.url().path()
        );
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Auth {
                status: response.status().as_u16(),
            }),
            _ => Ok(response),
        }
    }

    pub async fn fetch<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<Response> {
        let mut request = self.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(request).await
    }
}

fn append_segments(mut url: Url, path: &str) -> Result<Url> {
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| Error::Config(format!("{} cannot be used as a base URL", path)))?;
        segments.pop_if_empty();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            segments.push(part);
        }
    }
    Ok(url)
}

/// Pass `response` through if its status is one of `expected`, otherwise
/// turn it into [`Error::Server`] using the server's JSON error message.
pub async fn expect_status(response: Response, expected: &[StatusCode]) -> Result<Response> {
    let status = response.status();
    if expected.contains(&status) {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Server {
        status: status.as_u16(),
        message: error_message(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        }),
    })
}

/// Decode a JSON body, classifying bad payloads as protocol errors.
pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Protocol(format!("unexpected response body: {}", e)))
}

// Jupyter servers answer errors with `{"message": ..., "reason": ...}`.
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let message = value.get("message").and_then(|m| m.as_str());
    let reason = value.get("reason").and_then(|r| r.as_str());
    match (message, reason) {
        (Some(message), Some(reason)) if !reason.is_empty() => {
            Some(format!("{} ({})", message, reason))
        }
        (Some(message), _) => Some(message.to_string()),
        (None, Some(reason)) => Some(reason.to_string()),
        (None, None) => None,
    }
}
