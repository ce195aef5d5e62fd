//! Host-supplied capabilities.
//!
//! The shared core never opens sockets or files on its own; the shell hands
//! it implementations of these traits at startup.

pub mod http;
pub mod kv;
pub mod socket;

pub use self::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult,
    HttpTransport, ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS,
};
#[cfg(feature = "native-http")]
pub use self::http::ReqwestTransport;

pub use self::kv::{KeyNamespace, KvError, KvKey, KvStore, MemoryKvStore, StorageErrorCode, TypedKv};
#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKvStore;

pub use self::socket::{SocketConnection, SocketConnector, SocketError};

use std::sync::Arc;

/// The set of capabilities a host provides to the core.
#[derive(Clone)]
pub struct Capabilities {
    pub http: Arc<dyn HttpTransport>,
    pub kv: Arc<dyn KvStore>,
    pub socket: Option<Arc<dyn SocketConnector>>,
}

impl Capabilities {
    pub fn new(http: Arc<dyn HttpTransport>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            http,
            kv,
            socket: None,
        }
    }

    pub fn with_socket(mut self, socket: Arc<dyn SocketConnector>) -> Self {
        self.socket = Some(socket);
        self
    }
}
