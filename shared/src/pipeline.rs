//! Authenticated request pipeline.
//!
//! Every API call goes through [`ApiClient`]: the current bearer token is
//! attached at dispatch time, a `401` triggers at most one coordinated token
//! refresh no matter how many requests hit it, and each request is replayed
//! at most once. When the refresh itself fails the session is signed out and
//! every request waiting on it fails with the same error.

use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ValidatedUrl};
use crate::config::{ClientConfig, ConfigError};
use crate::model::{ApiEnvelope, TokenPair};
use crate::session::{Credentials, Session};
use crate::{AppError, ErrorKind};

pub const REFRESH_PATH: &str = "/auth/refresh-token";
const FALLBACK_MESSAGE: &str = "network request failed";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// No response reached the client.
    #[error("{0}")]
    Transport(HttpError),

    /// `401` that could not be recovered by a refresh.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    /// 2xx transport but a non-zero `code` in the envelope.
    #[error("{message} (code {code})")]
    Application { code: i64, message: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    Request(String),
}

impl ApiError {
    /// The text to show the user: the server's `message`, else the
    /// transport error, else a generic fallback.
    pub fn message(&self) -> String {
        let text = match self {
            ApiError::Transport(e) => e.to_string(),
            ApiError::Unauthorized { message }
            | ApiError::Http { message, .. }
            | ApiError::Application { message, .. } => message.clone(),
            ApiError::Decode(_) | ApiError::Request(_) => String::new(),
        };
        if text.trim().is_empty() {
            FALLBACK_MESSAGE.to_string()
        } else {
            text
        }
    }

    pub fn api_code(&self) -> Option<i64> {
        match self {
            ApiError::Application { code, .. } => Some(*code),
            ApiError::Http { code, .. } => *code,
            _ => None,
        }
    }

    /// True for errors the backend produced deliberately, as opposed to
    /// transport or decoding failures.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ApiError::Application { .. } | ApiError::Http { .. })
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }
}

impl From<ApiError> for AppError {
    fn from(e: ApiError) -> Self {
        let message = e.message();
        match e {
            ApiError::Transport(inner) => AppError::from(inner),
            ApiError::Unauthorized { .. } => AppError::new(ErrorKind::Authentication, message),
            ApiError::Http { status, code, .. } => {
                let err = AppError::from_http_status(status, Some(&message));
                match code {
                    Some(code) => err.with_context("api_code", code.to_string()),
                    None => err,
                }
            }
            ApiError::Application { code, .. } => {
                AppError::new(ErrorKind::from_api_code(code), message)
                    .with_context("api_code", code.to_string())
            }
            ApiError::Decode(detail) => {
                AppError::new(ErrorKind::Deserialization, message).with_internal(detail)
            }
            ApiError::Request(detail) => {
                AppError::new(ErrorKind::Internal, message).with_internal(detail)
            }
        }
    }
}

/// A request relative to the API root, before credentials are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    method: HttpMethod,
    path: String,
    query: Vec<(String, String)>,
    body: Option<RequestBody>,
}

#[derive(Debug, Clone, PartialEq)]
enum RequestBody {
    Json(serde_json::Value),
    Raw { content_type: String, bytes: Vec<u8> },
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    #[must_use]
    pub fn query_opt<V: ToString>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.query(key, value),
            None => self,
        }
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ApiError> {
        if !self.method.has_request_body() {
            return Err(ApiError::Request(format!(
                "{} requests cannot have a body",
                self.method
            )));
        }
        let value = serde_json::to_value(body).map_err(|e| ApiError::Request(e.to_string()))?;
        self.body = Some(RequestBody::Json(value));
        Ok(self)
    }

    /// A `multipart/form-data` body holding one file under `field`.
    pub fn multipart_file(
        mut self,
        field: &str,
        file_name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<Self, ApiError> {
        if !self.method.has_request_body() {
            return Err(ApiError::Request(format!(
                "{} requests cannot have a body",
                self.method
            )));
        }
        let unsafe_char = |c: char| c == '"' || c == '\\' || c.is_control();
        if [field, file_name, content_type]
            .iter()
            .any(|v| v.is_empty() || v.chars().any(unsafe_char))
        {
            return Err(ApiError::Request(
                "multipart field, file name and content type must be plain text".into(),
            ));
        }

        let boundary = format!("skyrent-{}", uuid::Uuid::new_v4().simple());
        let mut body = Vec::with_capacity(bytes.len() + 256);
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        self.body = Some(RequestBody::Raw {
            content_type: format!("multipart/form-data; boundary={boundary}"),
            bytes: body,
        });
        Ok(self)
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn body(&self) -> Option<&serde_json::Value> {
        match &self.body {
            Some(RequestBody::Json(value)) => Some(value),
            _ => None,
        }
    }
}

/// Checks a server- or user-supplied value before it is spliced into a path.
pub(crate) fn path_segment(value: &str) -> Result<&str, ApiError> {
    if value.is_empty()
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ApiError::Request(format!("invalid path segment '{value}'")));
    }
    Ok(value)
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

type RefreshOutcome = Result<Credentials, ApiError>;

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

/// What a request that saw a `401` should do next.
enum Recovery {
    /// The token was already replaced; replay with this one.
    Ready(Credentials),
    /// Another request is refreshing; wait for its outcome.
    Wait(oneshot::Receiver<RefreshOutcome>),
    /// This request performs the refresh.
    Lead(Credentials),
    NoRefreshToken,
    SignedOut,
}

pub struct ApiClient {
    config: ClientConfig,
    transport: Arc<dyn HttpTransport>,
    session: Session,
    refresh: Mutex<RefreshState>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("api_base_url", &self.config.api_base_url)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn HttpTransport>,
        session: Session,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            session,
            refresh: Mutex::new(RefreshState::default()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Sends `request` and returns the envelope's `data`, which must be present.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn send<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        self.send_optional(request)
            .await?
            .ok_or_else(|| ApiError::Decode("response envelope has no data".into()))
    }

    pub async fn send_optional<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<Option<T>, ApiError> {
        let response = self.execute(&request).await?;
        Self::decode(&response)
    }

    /// For action endpoints whose `data` is irrelevant or absent.
    pub async fn send_unit(&self, request: ApiRequest) -> Result<(), ApiError> {
        self.send_optional::<serde_json::Value>(request).await?;
        Ok(())
    }

    async fn execute(&self, request: &ApiRequest) -> Result<HttpResponse, ApiError> {
        let credentials = self.session.credentials();
        let response = self.dispatch(request, credentials.as_ref()).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        let Some(used) = credentials else {
            self.session.sign_out().await;
            return Err(Self::status_error(&response));
        };

        let fresh = self.recover(&used, &response).await?;
        debug!(generation = fresh.generation, "Replaying request with refreshed credentials");
        let replay = self.dispatch(request, Some(&fresh)).await?;
        if replay.is_unauthorized() {
            // Already replayed once; no second refresh for the same request.
            return Err(Self::status_error(&replay));
        }
        Ok(replay)
    }

    async fn recover(
        &self,
        used: &Credentials,
        rejected: &HttpResponse,
    ) -> Result<Credentials, ApiError> {
        // Checked under the refresh lock: a leader installs new credentials
        // before it clears `in_flight`, so a finished refresh is always seen.
        let recovery = {
            let mut state = self.lock_refresh();
            match self.session.credentials() {
                None => Recovery::SignedOut,
                Some(current) if current.generation != used.generation => {
                    Recovery::Ready(current)
                }
                Some(_) if state.in_flight => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push(tx);
                    Recovery::Wait(rx)
                }
                Some(current) if !current.has_refresh_token() => Recovery::NoRefreshToken,
                Some(current) => {
                    state.in_flight = true;
                    Recovery::Lead(current)
                }
            }
        };

        match recovery {
            Recovery::Ready(current) => Ok(current),
            Recovery::SignedOut => Err(Self::status_error(rejected)),
            Recovery::NoRefreshToken => {
                warn!("Unauthorized without a refresh token; signing out");
                self.session.sign_out().await;
                Err(Self::status_error(rejected))
            }
            Recovery::Wait(rx) => {
                debug!("Waiting on in-flight credential refresh");
                rx.await.unwrap_or_else(|_| {
                    Err(ApiError::Unauthorized {
                        message: "credential refresh was interrupted".into(),
                    })
                })
            }
            Recovery::Lead(current) => {
                let flight = RefreshFlight {
                    client: self,
                    done: false,
                };
                let outcome = self.refresh_credentials(&current).await;
                if let Err(e) = &outcome {
                    warn!(error = %e, "Credential refresh failed; signing out");
                    self.session.sign_out().await;
                }
                flight.finish(&outcome);
                outcome
            }
        }
    }

    /// Calls the refresh endpoint directly: no bearer, no recursion.
    async fn refresh_credentials(&self, current: &Credentials) -> RefreshOutcome {
        info!(generation = current.generation, "Refreshing credentials");
        let body = serde_json::json!({
            "refresh_token": current.refresh_token().expose_secret(),
        });
        let request = ApiRequest::post(REFRESH_PATH).json(&body)?;
        let response = self.dispatch(&request, None).await?;
        let pair: TokenPair = Self::decode(&response)?
            .ok_or_else(|| ApiError::Decode("refresh response has no token pair".into()))?;
        if pair.access_token.is_empty() {
            return Err(ApiError::Decode("refresh returned an empty access token".into()));
        }

        match self.session.replace_tokens(current.generation, pair).await {
            Some(fresh) => Ok(fresh),
            None => self.session.credentials().ok_or_else(|| ApiError::Unauthorized {
                message: "signed out during credential refresh".into(),
            }),
        }
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        credentials: Option<&Credentials>,
    ) -> Result<HttpResponse, ApiError> {
        let http = self.build_http(request, credentials)?;
        debug!(
            method = %http.method(),
            path = %request.path,
            request_id = %http.request_id(),
            authenticated = credentials.is_some(),
            "Dispatching request"
        );
        self.transport
            .execute(http)
            .await
            .map_err(ApiError::Transport)
    }

    fn build_http(
        &self,
        request: &ApiRequest,
        credentials: Option<&Credentials>,
    ) -> Result<HttpRequest, ApiError> {
        let mut url = self
            .config
            .api_url(&request.path)
            .map_err(|e| ApiError::Request(e.to_string()))?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, value);
            }
        }

        let url = ValidatedUrl::from_url(url).map_err(|e| ApiError::Request(e.to_string()))?;
        let mut http = HttpRequest::new(request.method, url)
            .with_timeout(self.config.request_timeout())
            .and_then(|r| r.with_header("Accept", "application/json"))
            .map_err(|e| ApiError::Request(e.to_string()))?;
        if let Some(credentials) = credentials {
            http = http
                .with_header("Authorization", credentials.bearer())
                .map_err(|e| ApiError::Request(e.to_string()))?;
        }
        http = match &request.body {
            Some(RequestBody::Json(body)) => http.with_json(body),
            Some(RequestBody::Raw {
                content_type,
                bytes,
            }) => http
                .with_header("Content-Type", content_type.as_str())
                .and_then(|r| r.with_body(bytes.clone())),
            None => Ok(http),
        }
        .map_err(|e| ApiError::Request(e.to_string()))?;
        Ok(http)
    }

    fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<Option<T>, ApiError> {
        if !response.is_success() {
            return Err(Self::status_error(response));
        }
        let envelope: ApiEnvelope<T> = response
            .json()
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        if !envelope.is_success() {
            return Err(ApiError::Application {
                code: envelope.code,
                message: envelope.message,
            });
        }
        Ok(envelope.data)
    }

    fn status_error(response: &HttpResponse) -> ApiError {
        let body: ErrorBody = response.json().unwrap_or_default();
        let status = response.status();
        if status == 401 {
            let message = if body.message.is_empty() {
                "unauthorized".to_string()
            } else {
                body.message
            };
            return ApiError::Unauthorized { message };
        }
        let message = if body.message.is_empty() {
            format!("Request failed with status code {status}")
        } else {
            body.message
        };
        ApiError::Http {
            status,
            code: body.code,
            message,
        }
    }

    fn lock_refresh(&self) -> MutexGuard<'_, RefreshState> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the in-flight flag and answers every waiter, whether the leading
/// request finishes normally or is dropped mid-refresh.
struct RefreshFlight<'a> {
    client: &'a ApiClient,
    done: bool,
}

impl RefreshFlight<'_> {
    fn finish(mut self, outcome: &RefreshOutcome) {
        self.release(outcome);
    }

    fn release(&mut self, outcome: &RefreshOutcome) {
        if self.done {
            return;
        }
        self.done = true;
        let waiters = {
            let mut state = self.client.lock_refresh();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        if !waiters.is_empty() {
            debug!(waiters = waiters.len(), "Releasing requests queued behind refresh");
        }
        for waiter in waiters {
            // A waiter whose request was dropped no longer listens.
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for RefreshFlight<'_> {
    fn drop(&mut self) {
        self.release(&Err(ApiError::Unauthorized {
            message: "credential refresh was interrupted".into(),
        }));
    }
}
