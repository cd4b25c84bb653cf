//! REST transport: one request in, a JSON payload or a classified error out.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::ApiConfig;
use crate::error::CacheError;
use crate::fleet::api_types::ApiErrorBody;
use crate::session::SessionProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

/// A request relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: None,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::Get, path)
  }

  pub fn post(path: impl Into<String>) -> Self {
    Self::new(Method::Post, path)
  }

  pub fn put(path: impl Into<String>) -> Self {
    Self::new(Method::Put, path)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::Delete, path)
  }

  pub fn with_query<K: Into<String>>(mut self, pairs: impl IntoIterator<Item = (K, String)>) -> Self {
    self.query.extend(pairs.into_iter().map(|(k, v)| (k.into(), v)));
    self
  }

  pub fn with_json<T: Serialize>(mut self, body: &T) -> Result<Self, CacheError> {
    let body = serde_json::to_value(body).map_err(|e| CacheError::Unknown(format!("cannot encode request: {}", e)))?;
    self.body = Some(body);
    Ok(self)
  }
}

/// Anything that can carry an [`ApiRequest`] to the server.
///
/// Failures must be classified so the query controller can decide on retries:
/// no response at all is [`CacheError::Network`], an error status goes
/// through [`CacheError::from_status`].
#[async_trait]
pub trait Transport: Send + Sync {
  async fn request(&self, request: ApiRequest) -> Result<Value, CacheError>;
}

/// [`Transport`] over HTTPS with bearer authentication.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  session: Arc<dyn SessionProvider>,
}

impl HttpTransport {
  pub fn new(config: &ApiConfig, session: Arc<dyn SessionProvider>) -> Result<Self> {
    // A trailing slash makes `Url::join` append instead of replacing the last segment.
    let base = format!("{}/", config.url.trim_end_matches('/'));
    let base_url = Url::parse(&base).map_err(|e| eyre!("Invalid API url {}: {}", config.url, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      session,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url, CacheError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| CacheError::Unknown(format!("invalid path {}: {}", path, e)))
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn request(&self, request: ApiRequest) -> Result<Value, CacheError> {
    let url = self.endpoint(&request.path)?;
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    };
    debug!(method = %method, path = %request.path, "API request");

    let mut builder = self.client.request(method, url);
    if !request.query.is_empty() {
      builder = builder.query(&request.query);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }
    if let Some(token) = self.session.token() {
      builder = builder.bearer_auth(token);
    }

    let response = builder.send().await.map_err(network_error)?;
    let status = response.status();
    let text = response.text().await.map_err(network_error)?;

    if !status.is_success() {
      if status == reqwest::StatusCode::UNAUTHORIZED {
        self.session.on_unauthorized();
      }
      let err = CacheError::from_status(status.as_u16(), ApiErrorBody::message_from(&text));
      warn!(path = %request.path, status = status.as_u16(), error = %err, "API request failed");
      return Err(err);
    }

    if text.trim().is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| CacheError::Unknown(format!("invalid JSON from {}: {}", request.path, e)))
  }
}

fn network_error(err: reqwest::Error) -> CacheError {
  CacheError::Network(err.to_string())
}
