//! WebSocket supervisor.
//!
//! Connects with the current access token as a `token` query parameter,
//! decodes frames into [`ServerEvent`]s for subscribers, reconnects with
//! capped exponential backoff, and stops for good when the session signs
//! out. Running out of reconnect attempts is reported as
//! [`ConnectionState::Exhausted`] rather than going quiet; calling
//! [`RealtimeChannel::connect`] again starts over.

use secrecy::ExposeSecret;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::capabilities::{SocketConnection, SocketConnector, SocketError};
use crate::config::{ClientConfig, ConfigError};
use crate::event::{encode_frame, EventKind, ServerEvent};
use crate::session::Session;
use crate::{AppError, ErrorKind, EVENT_CHANNEL_CAPACITY};

const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting `delay_ms` before reconnect attempt `attempt`.
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Every reconnect attempt failed; nothing more happens until
    /// [`RealtimeChannel::connect`] is called again.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    #[error("not signed in")]
    NotSignedIn,

    #[error("real-time channel is not connected")]
    NotConnected,

    #[error("outbound queue is full")]
    QueueFull,

    #[error("failed to encode frame: {0}")]
    Encode(String),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<RealtimeError> for AppError {
    fn from(e: RealtimeError) -> Self {
        let kind = match &e {
            RealtimeError::NotSignedIn => ErrorKind::Authentication,
            RealtimeError::NotConnected | RealtimeError::QueueFull | RealtimeError::Socket(_) => {
                ErrorKind::Network
            }
            RealtimeError::Encode(_) => ErrorKind::Serialization,
            RealtimeError::Config(_) => ErrorKind::InvalidState,
        };
        AppError::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_ms: crate::RECONNECT_BASE_DELAY_MS,
            max_ms: crate::RECONNECT_MAX_DELAY_MS,
            max_attempts: crate::RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            base_ms: config.reconnect_base_ms,
            max_ms: config.reconnect_max_ms,
            max_attempts: config.reconnect_max_attempts,
        }
    }

    /// Delay before reconnect `attempt` (1-based): `base * 2^attempt`,
    /// capped at `max`. `None` once the attempts are used up.
    /// With the defaults: 2, 4, 8, 16 and 30 seconds.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u64.saturating_pow(attempt);
        Some(Duration::from_millis(
            self.base_ms.saturating_mul(factor).min(self.max_ms),
        ))
    }
}

/// Receives only the event kinds it was created for.
pub struct FilteredEvents {
    rx: broadcast::Receiver<ServerEvent>,
    kinds: HashSet<EventKind>,
}

impl FilteredEvents {
    /// Next matching event; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.kinds.contains(&event.kind()) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

enum Stop {
    Shutdown,
    SignedOut,
    Dropped,
}

struct Inner {
    connector: Arc<dyn SocketConnector>,
    session: Session,
    ws_url: Url,
    policy: ReconnectPolicy,
    events: broadcast::Sender<ServerEvent>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("ws_url", &self.inner.ws_url.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RealtimeChannel {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        session: Session,
        config: &ClientConfig,
    ) -> Result<Self, RealtimeError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            inner: Arc::new(Inner {
                connector,
                session,
                ws_url: config.ws_url()?,
                policy: ReconnectPolicy::from_config(config),
                events,
                state,
                outbound: Mutex::new(None),
                running: Mutex::new(None),
            }),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_to(&self, kinds: impl IntoIterator<Item = EventKind>) -> FilteredEvents {
        FilteredEvents {
            rx: self.inner.events.subscribe(),
            kinds: kinds.into_iter().collect(),
        }
    }

    /// Starts the supervisor if it is not already running.
    #[instrument(skip(self))]
    pub fn connect(&self) -> Result<(), RealtimeError> {
        if !self.inner.session.is_authenticated() {
            return Err(RealtimeError::NotSignedIn);
        }
        let mut running = lock(&self.inner.running);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("Realtime supervisor already running");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        *lock(&self.inner.outbound) = Some(out_tx);
        let handle = tokio::spawn(supervise(self.inner.clone(), out_rx, shutdown_rx));
        *running = Some(Running {
            shutdown: shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stops the supervisor and closes the socket.
    pub async fn disconnect(&self) {
        let running = lock(&self.inner.running).take();
        lock(&self.inner.outbound).take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(e) = running.handle.await {
                warn!(error = %e, "Realtime supervisor ended abnormally");
            }
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    /// Queues an outbound `{type, data}` frame. Only accepted while connected.
    pub fn send(&self, kind: &str, data: &serde_json::Value) -> Result<(), RealtimeError> {
        if self.state() != ConnectionState::Connected {
            return Err(RealtimeError::NotConnected);
        }
        let frame = encode_frame(kind, data).map_err(|e| RealtimeError::Encode(e.to_string()))?;
        let outbound = lock(&self.inner.outbound);
        let sender = outbound.as_ref().ok_or(RealtimeError::NotConnected)?;
        sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RealtimeError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RealtimeError::NotConnected,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn supervise(
    inner: Arc<Inner>,
    mut outbound: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut session_rx = inner.session.subscribe();
    let mut failures: u32 = 0;

    loop {
        let Some(credentials) = inner.session.credentials() else {
            inner.state.send_replace(ConnectionState::Disconnected);
            return;
        };

        inner.state.send_replace(ConnectionState::Connecting);
        let mut url = inner.ws_url.clone();
        url.query_pairs_mut()
            .append_pair("token", credentials.access_token().expose_secret());

        match inner.connector.connect(&url).await {
            Ok(mut connection) => {
                failures = 0;
                inner.state.send_replace(ConnectionState::Connected);
                info!(host = inner.ws_url.host_str().unwrap_or_default(), "Realtime connected");

                let stop = pump(
                    &inner,
                    connection.as_mut(),
                    &mut outbound,
                    &mut session_rx,
                    &mut shutdown,
                )
                .await;
                connection.close().await;
                match stop {
                    Stop::Shutdown => {
                        info!("Realtime disconnected");
                        inner.state.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                    Stop::SignedOut => {
                        info!("Session ended; realtime disconnected");
                        inner.state.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                    Stop::Dropped => warn!("Realtime connection dropped"),
                }
            }
            Err(e) => warn!(error = %e, "Realtime connect failed"),
        }

        failures += 1;
        let Some(delay) = inner.policy.delay(failures) else {
            let attempts = failures - 1;
            warn!(attempts, "Realtime reconnect attempts exhausted; giving up");
            inner
                .state
                .send_replace(ConnectionState::Exhausted { attempts });
            return;
        };

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        debug!(attempt = failures, delay_ms, "Scheduling realtime reconnect");
        inner.state.send_replace(ConnectionState::Reconnecting {
            attempt: failures,
            delay_ms,
        });

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => break,
                _ = shutdown.changed() => {
                    inner.state.send_replace(ConnectionState::Disconnected);
                    return;
                }
                changed = session_rx.changed() => {
                    if changed.is_err() || !session_rx.borrow().is_authenticated() {
                        inner.state.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                }
            }
        }
    }
}

async fn pump(
    inner: &Inner,
    connection: &mut dyn SocketConnection,
    outbound: &mut mpsc::Receiver<String>,
    session_rx: &mut watch::Receiver<crate::session::SessionState>,
    shutdown: &mut watch::Receiver<bool>,
) -> Stop {
    loop {
        tokio::select! {
            frame = connection.recv() => match frame {
                Some(Ok(text)) => dispatch(inner, &text),
                Some(Err(e)) => {
                    warn!(error = %e, "Realtime receive failed");
                    return Stop::Dropped;
                }
                None => return Stop::Dropped,
            },
            Some(text) = outbound.recv() => {
                if let Err(e) = connection.send(text).await {
                    warn!(error = %e, "Realtime send failed");
                    return Stop::Dropped;
                }
            }
            _ = shutdown.changed() => return Stop::Shutdown,
            changed = session_rx.changed() => {
                if changed.is_err() || !session_rx.borrow().is_authenticated() {
                    return Stop::SignedOut;
                }
            }
        }
    }
}

fn dispatch(inner: &Inner, frame: &str) {
    match ServerEvent::parse(frame) {
        Ok(event) => {
            debug!(kind = %event.kind(), "Realtime event");
            // No subscribers is not an error.
            let _ = inner.events.send(event);
        }
        Err(e) => warn!(error = %e, "Dropping undecodable realtime frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.delay(n).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![2_000, 4_000, 8_000, 16_000, 30_000]);
        assert_eq!(policy.delay(6), None);
        assert_eq!(policy.delay(0), None);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = ReconnectPolicy {
            base_ms: 1_000,
            max_ms: 30_000,
            max_attempts: 10,
        };
        assert_eq!(policy.delay(4), Some(Duration::from_millis(16_000)));
        assert_eq!(policy.delay(5), Some(Duration::from_millis(30_000)));
        assert_eq!(policy.delay(10), Some(Duration::from_millis(30_000)));
    }

    #[test]
    fn test_errors_map_to_kinds() {
        assert_eq!(
            AppError::from(RealtimeError::NotSignedIn).kind,
            ErrorKind::Authentication
        );
        assert_eq!(
            AppError::from(RealtimeError::NotConnected).kind,
            ErrorKind::Network
        );
    }
}
