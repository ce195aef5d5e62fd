#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

use shared::capabilities::{
    HttpError, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport, SocketConnection,
    SocketConnector, SocketError,
};
use shared::model::{TokenPair, User};
use shared::{ApiClient, ClientConfig, Session};

pub const API_ROOT: &str = "http://api.test/api/v1";
pub const WS_ROOT: &str = "ws://api.test/ws";

pub const OWNER: i64 = 7;
pub const RENTER: i64 = 8;
pub const STRANGER: i64 = 9;

pub fn config() -> ClientConfig {
    ClientConfig {
        api_base_url: API_ROOT.into(),
        ws_base_url: WS_ROOT.into(),
        ..ClientConfig::default()
    }
}

// --- HTTP ---

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    /// Parsed when the body is JSON.
    pub body: Option<Value>,
    pub raw_body: Option<Vec<u8>>,
}

impl Recorded {
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

type Handler = Arc<dyn Fn(&Recorded) -> HttpResult + Send + Sync>;

struct Route {
    handler: Handler,
    delay: Option<Duration>,
}

/// In-memory backend. Routes are keyed by method and path relative to the
/// API root; anything unrouted answers 404.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<(HttpMethod, String), Route>>,
    log: Mutex<Vec<Recorded>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(
        &self,
        method: HttpMethod,
        path: &str,
        handler: impl Fn(&Recorded) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.route(method, path, None, move |r| Ok(handler(r)));
    }

    /// Like [`ScriptedTransport::on`], but the answer arrives after `delay`.
    pub fn on_delayed(
        &self,
        method: HttpMethod,
        path: &str,
        delay: Duration,
        handler: impl Fn(&Recorded) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.route(method, path, Some(delay), move |r| Ok(handler(r)));
    }

    pub fn on_error(&self, method: HttpMethod, path: &str, error: HttpError) {
        self.route(method, path, None, move |_| Err(error.clone()));
    }

    fn route(
        &self,
        method: HttpMethod,
        path: &str,
        delay: Option<Duration>,
        handler: impl Fn(&Recorded) -> HttpResult + Send + Sync + 'static,
    ) {
        self.routes.lock().unwrap().insert(
            (method, path.to_string()),
            Route {
                handler: Arc::new(handler),
                delay,
            },
        );
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, method: HttpMethod, path: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    pub fn total(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn refresh_calls(&self) -> usize {
        self.count(HttpMethod::Post, "/auth/refresh-token")
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let url = Url::parse(request.url().as_str()).unwrap();
        let path = url
            .path()
            .strip_prefix("/api/v1")
            .unwrap_or(url.path())
            .to_string();
        let recorded = Recorded {
            method: request.method(),
            path,
            query: url.query_pairs().into_owned().collect(),
            authorization: request.header("Authorization").map(str::to_string),
            content_type: request.header("Content-Type").map(str::to_string),
            body: request.body().and_then(|b| serde_json::from_slice(b).ok()),
            raw_body: request.body().map(<[u8]>::to_vec),
        };
        self.log.lock().unwrap().push(recorded.clone());

        let (handler, delay) = {
            let routes = self.routes.lock().unwrap();
            match routes.get(&(recorded.method, recorded.path.clone())) {
                Some(route) => (route.handler.clone(), route.delay),
                None => {
                    return Ok(HttpResponse::json_body(
                        404,
                        &json!({"code": 1004, "message": "not found"}),
                        request.request_id(),
                    ))
                }
            }
        };
        let result = handler(&recorded);
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        result
    }
}

pub fn ok(data: Value) -> HttpResponse {
    HttpResponse::json_body(
        200,
        &json!({"code": 0, "message": "success", "data": data, "timestamp": 1_700_000_000}),
        "test",
    )
}

pub fn ok_empty() -> HttpResponse {
    HttpResponse::json_body(
        200,
        &json!({"code": 0, "message": "success", "timestamp": 1_700_000_000}),
        "test",
    )
}

pub fn app_error(code: i64, message: &str) -> HttpResponse {
    HttpResponse::json_body(
        200,
        &json!({"code": code, "message": message, "data": null, "timestamp": 1_700_000_000}),
        "test",
    )
}

pub fn unauthorized() -> HttpResponse {
    HttpResponse::json_body(401, &json!({"code": 1002, "message": "token expired"}), "test")
}

pub fn bearer(tag: &str) -> String {
    format!("Bearer access-{tag}")
}

pub fn tokens(tag: &str) -> TokenPair {
    TokenPair {
        access_token: format!("access-{tag}"),
        refresh_token: format!("refresh-{tag}"),
        expires_in: 7200,
    }
}

pub fn tokens_json(tag: &str) -> Value {
    json!({
        "access_token": format!("access-{tag}"),
        "refresh_token": format!("refresh-{tag}"),
        "expires_in": 7200
    })
}

// --- Fixtures ---

pub fn user(id: i64) -> User {
    serde_json::from_value(user_json(id)).unwrap()
}

pub fn user_json(id: i64) -> Value {
    let user_type = if id == OWNER { "drone_owner" } else { "renter" };
    json!({
        "id": id,
        "phone": format!("1380000{id:04}"),
        "nickname": format!("user-{id}"),
        "user_type": user_type,
        "id_verified": "verified",
        "credit_score": 100,
        "status": "active"
    })
}

pub fn order_json(id: i64, status: &str) -> Value {
    json!({
        "id": id,
        "order_no": format!("ORD{id:08}"),
        "order_type": "rental",
        "drone_id": 3,
        "owner_id": OWNER,
        "renter_id": RENTER,
        "title": "Aerial survey",
        "service_type": "rental",
        "total_amount": 29900,
        "platform_commission_rate": 10.0,
        "platform_commission": 2990,
        "owner_amount": 26910,
        "deposit_amount": 5000,
        "status": status
    })
}

pub fn order(id: i64, status: &str) -> shared::Order {
    serde_json::from_value(order_json(id, status)).unwrap()
}

/// A client whose session is signed in as `user_id` with tokens tagged `tag`.
pub async fn signed_in(
    transport: &Arc<ScriptedTransport>,
    user_id: i64,
    tag: &str,
) -> (Arc<ApiClient>, Session) {
    let session = Session::new();
    session.sign_in(user(user_id), tokens(tag)).await;
    let client = ApiClient::new(config(), transport.clone(), session.clone()).unwrap();
    (Arc::new(client), session)
}

// --- Sockets ---

struct MockConnection {
    inbound: mpsc::UnboundedReceiver<Result<String, SocketError>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SocketConnection for MockConnection {
    async fn send(&mut self, text: String) -> Result<(), SocketError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, SocketError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// The server end of one accepted connection.
pub struct ServerHandle {
    inbound: Option<mpsc::UnboundedSender<Result<String, SocketError>>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl ServerHandle {
    pub fn push(&self, frame: &str) {
        if let Some(tx) = &self.inbound {
            tx.send(Ok(frame.to_string())).unwrap();
        }
    }

    /// Ends the stream as if the peer went away.
    pub fn hang_up(&mut self) {
        self.inbound.take();
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Hands out queued connections in order; once the queue is empty every
/// attempt is refused.
#[derive(Default)]
pub struct MockConnector {
    queue: Mutex<VecDeque<MockConnection>>,
    urls: Mutex<Vec<String>>,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn accept_next(&self) -> ServerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        self.queue.lock().unwrap().push_back(MockConnection {
            inbound: rx,
            sent: sent.clone(),
            closed: closed.clone(),
        });
        ServerHandle {
            inbound: Some(tx),
            sent,
            closed,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SocketConnector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn SocketConnection>, SocketError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        match self.queue.lock().unwrap().pop_front() {
            Some(connection) => Ok(Box::new(connection)),
            None => Err(SocketError::Connect {
                host: url.host_str().unwrap_or_default().to_string(),
                message: "connection refused".into(),
            }),
        }
    }
}
