use async_trait::async_trait;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SocketError {
    #[error("failed to connect to {host}: {message}")]
    Connect { host: String, message: String },

    #[error("socket is not connected")]
    NotConnected,

    #[error("socket I/O error: {message}")]
    Io { message: String },
}

/// WebSocket capability supplied by the host shell.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn SocketConnection>, SocketError>;
}

/// One open connection. Text frames only; the backend speaks JSON.
#[async_trait]
pub trait SocketConnection: Send {
    async fn send(&mut self, text: String) -> Result<(), SocketError>;

    /// Next inbound text frame, or `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<String, SocketError>>;

    async fn close(&mut self);
}
