// lib.rs - Marketplace client core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod app;
pub mod auth;
pub mod capabilities;
pub mod catalog;
pub mod config;
pub mod event;
pub mod location;
pub mod market;
pub mod model;
pub mod money;
pub mod orders;
pub mod payment;
pub mod pipeline;
pub mod realtime;
pub mod session;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use app::Core;
pub use auth::AuthService;
pub use capabilities::Capabilities;
pub use config::{ClientConfig, ConfigError};
pub use event::ServerEvent;
pub use model::{Order, OrderId, OrderStatus, TokenPair, User, UserId};
pub use money::Money;
pub use orders::{allowed_actions, OrderAction, OrderController, Role, TransitionError};
pub use payment::{PaymentError, PaymentFlow};
pub use pipeline::{ApiClient, ApiError, ApiRequest};
pub use realtime::{ConnectionState, RealtimeChannel, RealtimeError};
pub use session::{Credentials, Session, SessionState};

pub const DEFAULT_API_BASE_URL: &str = "https://api.wurenji.com/api/v1";
pub const DEFAULT_WS_BASE_URL: &str = "wss://api.wurenji.com/ws";
pub const PAYMENT_POLL_ATTEMPTS: u32 = 10;
pub const PAYMENT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;
pub const MAX_REASON_LENGTH: usize = 500;
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Application codes carried in the response envelope.
pub mod api_code {
    pub const SUCCESS: i64 = 0;
    pub const PARAM_ERROR: i64 = 1001;
    pub const UNAUTHORIZED: i64 = 1002;
    pub const FORBIDDEN: i64 = 1003;
    pub const NOT_FOUND: i64 = 1004;
    pub const ALREADY_EXISTS: i64 = 1005;
    pub const SERVER_ERROR: i64 = 2001;
    pub const DB_ERROR: i64 = 2002;
    pub const PAYMENT_ERROR: i64 = 3002;
    pub const VERIFY_CODE_ERROR: i64 = 4001;
    pub const ORDER_ERROR: i64 = 5001;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    Application,
    Payment,
    Storage,
    Serialization,
    Deserialization,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Application => "APPLICATION_ERROR",
            Self::Payment => "PAYMENT_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::Conflict | Self::Storage | Self::Payment => {
                ErrorSeverity::Transient
            }

            Self::Serialization | Self::Deserialization | Self::Internal | Self::InvalidState => {
                ErrorSeverity::Fatal
            }

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::Application
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    /// Retryable by the user. Nothing in this crate retries automatically.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::Storage | Self::Payment
        )
    }

    #[must_use]
    pub const fn from_api_code(code: i64) -> Self {
        match code {
            api_code::PARAM_ERROR | api_code::VERIFY_CODE_ERROR | api_code::ALREADY_EXISTS => {
                Self::Validation
            }
            api_code::UNAUTHORIZED => Self::Authentication,
            api_code::FORBIDDEN => Self::Authorization,
            api_code::NOT_FOUND => Self::NotFound,
            api_code::SERVER_ERROR | api_code::DB_ERROR => Self::Internal,
            api_code::PAYMENT_ERROR => Self::Payment,
            _ => Self::Application,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => {
                "Your session has expired. Please sign in again.".into()
            }
            ErrorKind::Authorization => {
                "You don't have permission to perform this action.".into()
            }
            ErrorKind::Validation | ErrorKind::Application | ErrorKind::Payment => {
                self.message.clone()
            }
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Conflict => {
                "This order's status changed. Please refresh and try again.".into()
            }
            ErrorKind::Storage => {
                "Unable to save data locally. Please free up some storage space.".into()
            }
            ErrorKind::Serialization | ErrorKind::Deserialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::InvalidState => {
                "The app is in an invalid state. Please restart the app.".into()
            }
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, message: Option<&str>) -> Self {
        let kind = match status {
            400 | 422 => ErrorKind::Validation,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Authorization,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            408 | 504 => ErrorKind::Timeout,
            500..=599 => ErrorKind::Internal,
            _ => ErrorKind::Unknown,
        };

        let message = message
            .filter(|m| !m.is_empty())
            .map_or_else(|| format!("HTTP error: {status}"), str::to_string);

        Self::new(kind, message).with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<money::MoneyError> for AppError {
    fn from(e: money::MoneyError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::new(ErrorKind::InvalidState, e.to_string())
    }
}

impl From<capabilities::HttpError> for AppError {
    fn from(e: capabilities::HttpError) -> Self {
        use capabilities::HttpError;
        let kind = match &e {
            HttpError::Timeout { .. } => ErrorKind::Timeout,
            HttpError::ConnectionError { .. } => ErrorKind::Network,
            HttpError::SerializationError { .. } => ErrorKind::Serialization,
            HttpError::InvalidResponse { .. } => ErrorKind::Deserialization,
            HttpError::InvalidUrl { .. }
            | HttpError::InvalidHeader { .. }
            | HttpError::TooManyHeaders { .. }
            | HttpError::BodyTooLarge { .. }
            | HttpError::InvalidRequest { .. } => ErrorKind::Internal,
        };
        let mut err = AppError::new(kind, e.to_string());
        if let Some(request_id) = e.request_id() {
            err = err.with_context("request_id", request_id);
        }
        err
    }
}

impl From<capabilities::KvError> for AppError {
    fn from(e: capabilities::KvError) -> Self {
        use capabilities::KvError;
        let kind = match &e {
            KvError::Serialization { .. } => ErrorKind::Serialization,
            KvError::InvalidKey { .. } => ErrorKind::Internal,
            KvError::ValueTooLarge { .. } | KvError::Storage { .. } => ErrorKind::Storage,
        };
        let severity = if e.is_retryable() {
            ErrorSeverity::Transient
        } else {
            kind.default_severity()
        };
        AppError::new(kind, e.to_string()).with_severity(severity)
    }
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
