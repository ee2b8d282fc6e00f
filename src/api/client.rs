//! HTTP transport for the marketplace backend.
//!
//! Attaches session cookies and the anti-forgery token, and owns the
//! refresh-once-then-retry handling of 401 responses.

use futures::future::BoxFuture;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use url::Url;

use super::types::{Body, Created, MultipartBody};
use crate::config::{ApiConfig, Config};
use crate::error::{ApiError, SyncError, SyncResult};
use crate::event::SessionSignal;

/// Refreshes the session after the backend rejected the current credentials.
pub trait SessionRefresher: Send + Sync {
  /// Returns `true` when the session was renewed.
  fn refresh(&self) -> BoxFuture<'_, bool>;
}

/// Refreshes by POSTing to the backend's token refresh endpoint. The new
/// session arrives as cookies, which land in the shared jar.
pub struct HttpRefresher {
  http: reqwest::Client,
  url: Url,
}

impl HttpRefresher {
  pub fn new(http: reqwest::Client, url: Url) -> Self {
    Self { http, url }
  }
}

impl SessionRefresher for HttpRefresher {
  fn refresh(&self) -> BoxFuture<'_, bool> {
    Box::pin(async move {
      match self.http.post(self.url.clone()).json(&Value::Object(Default::default())).send().await {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) => {
          debug!(status = resp.status().as_u16(), "Session refresh rejected");
          false
        }
        Err(e) => {
          warn!("Session refresh failed: {}", e);
          false
        }
      }
    })
  }
}

/// A single call to the backend.
#[derive(Debug, Clone)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Body,
  /// Set on the replay after a session refresh; a second 401 is not refreshed again.
  pub is_retry: bool,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: Body::Empty,
      is_retry: false,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn post(path: impl Into<String>) -> Self {
    Self::new(Method::POST, path)
  }

  pub fn patch(path: impl Into<String>) -> Self {
    Self::new(Method::PATCH, path)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::DELETE, path)
  }

  pub fn query(mut self, query: &[(String, String)]) -> Self {
    self.query.extend_from_slice(query);
    self
  }

  pub fn json(mut self, body: Value) -> Self {
    self.body = Body::Json(body);
    self
  }

  pub fn multipart(mut self, body: MultipartBody) -> Self {
    self.body = Body::Multipart(body);
    self
  }
}

struct Inner {
  http: reqwest::Client,
  jar: Arc<Jar>,
  base_url: Url,
  csrf_cookie: String,
  csrf_header: String,
  csrf_override: RwLock<Option<String>>,
  refresher: Box<dyn SessionRefresher>,
  session_tx: broadcast::Sender<SessionSignal>,
}

/// REST backend client.
///
/// Every call carries the session cookies and the anti-forgery token. A 401 on
/// a first attempt triggers one session refresh and one retry; if the refresh
/// fails the call ends with [`SyncError::SessionExpired`] and
/// [`SessionSignal::Expired`] is published.
#[derive(Clone)]
pub struct ApiClient {
  inner: Arc<Inner>,
}

impl ApiClient {
  pub fn new(config: &ApiConfig) -> SyncResult<Self> {
    let (http, jar, base_url) = Self::build_http(config)?;
    let refresh_url = base_url
      .join(&config.refresh_path)
      .map_err(|e| SyncError::Serialization(format!("Invalid refresh path: {}", e)))?;
    let refresher = HttpRefresher::new(http.clone(), refresh_url);

    Ok(Self::assemble(http, jar, base_url, config, Box::new(refresher)))
  }

  /// Use a custom refresh operation instead of the refresh endpoint.
  pub fn with_refresher(config: &ApiConfig, refresher: Box<dyn SessionRefresher>) -> SyncResult<Self> {
    let (http, jar, base_url) = Self::build_http(config)?;
    Ok(Self::assemble(http, jar, base_url, config, refresher))
  }

  fn build_http(config: &ApiConfig) -> SyncResult<(reqwest::Client, Arc<Jar>, Url)> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| SyncError::Serialization(format!("Invalid base URL {}: {}", config.base_url, e)))?;
    let jar = Arc::new(Jar::default());
    let http = reqwest::Client::builder()
      .cookie_provider(Arc::clone(&jar))
      .timeout(config.timeout())
      .build()
      .map_err(|e| SyncError::Network(format!("Failed to build HTTP client: {}", e)))?;
    Ok((http, jar, base_url))
  }

  fn assemble(
    http: reqwest::Client,
    jar: Arc<Jar>,
    base_url: Url,
    config: &ApiConfig,
    refresher: Box<dyn SessionRefresher>,
  ) -> Self {
    let (session_tx, _rx) = broadcast::channel(8);
    Self {
      inner: Arc::new(Inner {
        http,
        jar,
        base_url,
        csrf_cookie: config.csrf_cookie.clone(),
        csrf_header: config.csrf_header.clone(),
        csrf_override: RwLock::new(Config::csrf_token_override()),
        refresher,
        session_tx,
      }),
    }
  }

  /// Pin the anti-forgery token instead of reading it from the cookie jar.
  pub fn set_csrf_token(&self, token: impl Into<String>) {
    if let Ok(mut guard) = self.inner.csrf_override.write() {
      *guard = Some(token.into());
    }
  }

  /// Signals for the external session component.
  pub fn session_signals(&self) -> broadcast::Receiver<SessionSignal> {
    self.inner.session_tx.subscribe()
  }

  pub fn base_url(&self) -> &Url {
    &self.inner.base_url
  }

  /// `request(method, path, body)`; `Value::Null` for an empty response.
  pub async fn request(&self, method: Method, path: &str, body: Option<Value>) -> SyncResult<Value> {
    let mut req = ApiRequest::new(method, path);
    if let Some(body) = body {
      req = req.json(body);
    }
    self.send(req).await
  }

  /// GET and deserialize.
  pub async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(String, String)]) -> SyncResult<T> {
    let value = self.send(ApiRequest::get(path).query(query)).await?;
    Ok(serde_json::from_value(value)?)
  }

  /// Create a resource, treating 409 as "already exists".
  pub async fn create(&self, req: ApiRequest) -> SyncResult<Created> {
    match self.send(req).await {
      Ok(body) => Ok(Created::New(body)),
      Err(SyncError::Api(e)) if e.status == StatusCode::CONFLICT.as_u16() => {
        debug!(detail = %e.detail, "Resource already exists");
        Ok(Created::AlreadyExists(e.detail))
      }
      Err(e) => Err(e),
    }
  }

  /// Send a request with the refresh-and-retry protocol.
  pub async fn send(&self, req: ApiRequest) -> SyncResult<Value> {
    match self.execute(&req).await {
      Err(SyncError::Api(e)) if e.status == StatusCode::UNAUTHORIZED.as_u16() && !req.is_retry => {
        debug!(path = %req.path, "Unauthorized, refreshing session");
        if self.inner.refresher.refresh().await {
          let retry = ApiRequest {
            is_retry: true,
            ..req
          };
          self.execute(&retry).await
        } else {
          warn!(path = %req.path, "Session refresh failed, session expired");
          let _ = self.inner.session_tx.send(SessionSignal::Expired);
          Err(SyncError::SessionExpired)
        }
      }
      other => other,
    }
  }

  async fn execute(&self, req: &ApiRequest) -> SyncResult<Value> {
    let mut url = self
      .inner
      .base_url
      .join(&req.path)
      .map_err(|e| SyncError::Serialization(format!("Invalid path {}: {}", req.path, e)))?;
    if !req.query.is_empty() {
      url.query_pairs_mut().extend_pairs(req.query.iter());
    }

    let mut builder = self.inner.http.request(req.method.clone(), url.clone());
    if let Some(token) = self.csrf_token(&url) {
      builder = builder.header(self.inner.csrf_header.as_str(), token);
    }
    builder = match &req.body {
      Body::Empty => builder,
      Body::Json(v) => builder.json(v),
      Body::Multipart(m) => builder.multipart(build_form(m)?),
    };

    debug!(method = %req.method, %url, retry = req.is_retry, "Sending request");
    let resp = builder.send().await?;
    let status = resp.status();
    let text = resp.text().await?;

    if !status.is_success() {
      return Err(ApiError::from_body(status.as_u16(), &text).into());
    }
    if text.trim().is_empty() {
      return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
  }

  fn csrf_token(&self, url: &Url) -> Option<String> {
    let pinned = self
      .inner
      .csrf_override
      .read()
      .ok()
      .and_then(|guard| guard.clone());
    if pinned.is_some() {
      return pinned;
    }
    let header = self.inner.jar.cookies(url)?;
    let cookies = header.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
      let (name, value) = pair.trim().split_once('=')?;
      (name == self.inner.csrf_cookie).then(|| value.to_string())
    })
  }
}

fn build_form(body: &MultipartBody) -> SyncResult<Form> {
  let mut form = Form::new();
  for (name, value) in &body.fields {
    form = form.text(name.clone(), value.clone());
  }
  for (field, attachment) in &body.files {
    let part = Part::bytes(attachment.bytes.clone())
      .file_name(attachment.name.clone())
      .mime_str(&attachment.mime)
      .map_err(|e| SyncError::Serialization(format!("Invalid MIME type {}: {}", attachment.mime, e)))?;
    form = form.part(field.clone(), part);
  }
  Ok(form)
}
