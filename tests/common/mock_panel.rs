//! Stateful mock of the panel management API.
//!
//! Keeps inbounds and their clients in memory, hands out session cookies on
//! login and answers with an HTML login page when the cookie is missing or
//! expired, the way the real panel does.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Response, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "hunter2";
/// Web base path the panel is served under.
pub const BASE_PATH: &str = "/xui";

const REALITY_STREAM: &str = r#"{
    "network": "tcp",
    "security": "reality",
    "realitySettings": {
        "serverNames": ["www.example.com"],
        "shortIds": ["ab12"],
        "settings": {"publicKey": "live-pbk", "fingerprint": "firefox"}
    }
}"#;

#[derive(Debug, Clone)]
struct MockInbound {
    id: u32,
    port: u16,
    clients: Vec<Value>,
    stream_settings: String,
}

impl MockInbound {
    fn to_json(&self) -> Value {
        let stats: Vec<Value> = self
            .clients
            .iter()
            .map(|c| json!({"email": c["email"], "up": 1024, "down": 4096}))
            .collect();
        json!({
            "id": self.id,
            "port": self.port,
            "protocol": "vless",
            "settings": json!({"clients": self.clients, "decryption": "none"}).to_string(),
            "streamSettings": self.stream_settings,
            "clientStats": stats,
        })
    }
}

#[derive(Default)]
struct PanelState {
    inbounds: Mutex<Vec<MockInbound>>,
    sessions: Mutex<HashSet<String>>,
    /// Statuses returned instead of handling the next API requests.
    injected: Mutex<VecDeque<StatusCode>>,
    logins: AtomicU32,
    api_calls: AtomicU32,
}

/// Mock panel bound to a random local port.
pub struct MockPanel {
    pub addr: SocketAddr,
    state: Arc<PanelState>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl MockPanel {
    /// Start a panel with one reality inbound (id 1, port 443).
    pub async fn start() -> Self {
        let state = Arc::new(PanelState::default());
        state.inbounds.lock().push(MockInbound {
            id: 1,
            port: 443,
            clients: Vec::new(),
            stream_settings: REALITY_STREAM.to_string(),
        });

        let api = Router::new()
            .route("/login", post(login))
            .route("/panel/api/inbounds/list", get(list))
            .route("/panel/api/inbounds/get/{id}", get(get_inbound))
            .route("/panel/api/inbounds/addClient", post(add_client))
            .route(
                "/panel/api/inbounds/{id}/delClient/{client}",
                post(del_client),
            )
            .route(
                "/panel/api/inbounds/updateClient/{client}",
                post(update_client),
            );
        let app = Router::new().nest(BASE_PATH, api).with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock panel");
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            state,
            shutdown: shutdown_tx,
        }
    }

    /// Panel URL including the web base path.
    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, BASE_PATH)
    }

    /// Number of successful logins so far.
    pub fn logins(&self) -> u32 {
        self.state.logins.load(Ordering::SeqCst)
    }

    /// Number of API requests (not counting logins).
    pub fn api_calls(&self) -> u32 {
        self.state.api_calls.load(Ordering::SeqCst)
    }

    /// Forget every session cookie, as a panel restart would.
    pub fn expire_sessions(&self) {
        self.state.sessions.lock().clear();
    }

    /// Answer the next API request with `status` instead of handling it.
    pub fn inject_status(&self, status: StatusCode) {
        self.state.injected.lock().push_back(status);
    }

    /// Replace the stream settings of inbound `id`.
    pub fn set_stream_settings(&self, id: u32, stream_settings: Value) {
        if let Some(inbound) = self.state.inbounds.lock().iter_mut().find(|i| i.id == id) {
            inbound.stream_settings = stream_settings.to_string();
        }
    }

    /// Place a client directly, bypassing the API.
    pub fn seed_client(&self, inbound: u32, identity: &str, email: &str, expiry_ms: i64) {
        if let Some(target) = self
            .state
            .inbounds
            .lock()
            .iter_mut()
            .find(|i| i.id == inbound)
        {
            target.clients.push(json!({
                "id": identity,
                "email": email,
                "limitIp": 2,
                "totalGB": 0,
                "expiryTime": expiry_ms,
                "enable": true,
                "flow": "xtls-rprx-vision",
            }));
        }
    }

    /// All clients on all inbounds.
    pub fn clients(&self) -> Vec<Value> {
        self.state
            .inbounds
            .lock()
            .iter()
            .flat_map(|i| i.clients.clone())
            .collect()
    }

    pub fn client_by_email(&self, email: &str) -> Option<Value> {
        self.clients().into_iter().find(|c| c["email"] == email)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for MockPanel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn json_reply(value: Value) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .body(Body::from(value.to_string()))
        .unwrap()
}

fn login_page() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from("<html><body>Login</body></html>"))
        .unwrap()
}

/// Gatekeeper shared by every API handler.
fn admit(state: &PanelState, headers: &HeaderMap) -> Result<(), Response<Body>> {
    state.api_calls.fetch_add(1, Ordering::SeqCst);

    if let Some(status) = state.injected.lock().pop_front() {
        return Err(Response::builder()
            .status(status)
            .body(Body::from("injected"))
            .unwrap());
    }

    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let sessions = state.sessions.lock();
    let known = cookie
        .split(';')
        .map(str::trim)
        .any(|pair| sessions.contains(pair));
    if known {
        Ok(())
    } else {
        Err(login_page())
    }
}

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

async fn login(
    State(state): State<Arc<PanelState>>,
    Json(body): Json<LoginBody>,
) -> Response<Body> {
    if body.username != USERNAME || body.password != PASSWORD {
        return json_reply(json!({"success": false, "msg": "Wrong username or password"}));
    }

    let n = state.logins.fetch_add(1, Ordering::SeqCst) + 1;
    let pair = format!("3x-ui=session-{}", n);
    state.sessions.lock().insert(pair.clone());

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::SET_COOKIE, format!("{}; Path=/; HttpOnly", pair))
        .body(Body::from(
            json!({"success": true, "msg": "Login successful"}).to_string(),
        ))
        .unwrap()
}

async fn list(State(state): State<Arc<PanelState>>, headers: HeaderMap) -> Response<Body> {
    if let Err(page) = admit(&state, &headers) {
        return page;
    }
    let inbounds: Vec<Value> = state
        .inbounds
        .lock()
        .iter()
        .map(MockInbound::to_json)
        .collect();
    json_reply(json!({"success": true, "msg": "", "obj": inbounds}))
}

async fn get_inbound(
    State(state): State<Arc<PanelState>>,
    Path(id): Path<u32>,
    headers: HeaderMap,
) -> Response<Body> {
    if let Err(page) = admit(&state, &headers) {
        return page;
    }
    match state.inbounds.lock().iter().find(|i| i.id == id) {
        Some(inbound) => json_reply(json!({"success": true, "msg": "", "obj": inbound.to_json()})),
        None => json_reply(json!({"success": false, "msg": "inbound not found", "obj": null})),
    }
}

#[derive(Deserialize)]
struct ClientsBody {
    id: u32,
    settings: String,
}

fn decode_clients(settings: &str) -> Vec<Value> {
    serde_json::from_str::<Value>(settings)
        .ok()
        .and_then(|v| v.get("clients").and_then(Value::as_array).cloned())
        .unwrap_or_default()
}

async fn add_client(
    State(state): State<Arc<PanelState>>,
    headers: HeaderMap,
    Json(body): Json<ClientsBody>,
) -> Response<Body> {
    if let Err(page) = admit(&state, &headers) {
        return page;
    }

    let mut inbounds = state.inbounds.lock();
    for client in decode_clients(&body.settings) {
        let email = client["email"].as_str().unwrap_or_default().to_string();
        let taken = inbounds
            .iter()
            .flat_map(|i| i.clients.iter())
            .any(|c| c["email"] == email.as_str());
        if taken {
            return json_reply(
                json!({"success": false, "msg": format!("Duplicate email: {}", email)}),
            );
        }
        match inbounds.iter_mut().find(|i| i.id == body.id) {
            Some(inbound) => inbound.clients.push(client),
            None => return json_reply(json!({"success": false, "msg": "inbound not found"})),
        }
    }
    json_reply(json!({"success": true, "msg": "Inbound client(s) have been added."}))
}

async fn del_client(
    State(state): State<Arc<PanelState>>,
    Path((id, client)): Path<(u32, String)>,
    headers: HeaderMap,
) -> Response<Body> {
    if let Err(page) = admit(&state, &headers) {
        return page;
    }

    let mut inbounds = state.inbounds.lock();
    let Some(inbound) = inbounds.iter_mut().find(|i| i.id == id) else {
        return json_reply(json!({"success": false, "msg": "inbound not found"}));
    };
    let before = inbound.clients.len();
    inbound.clients.retain(|c| c["id"] != client.as_str());
    if inbound.clients.len() == before {
        return json_reply(json!({"success": false, "msg": "client not found"}));
    }
    json_reply(json!({"success": true, "msg": "Inbound client has been deleted."}))
}

async fn update_client(
    State(state): State<Arc<PanelState>>,
    Path(client): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ClientsBody>,
) -> Response<Body> {
    if let Err(page) = admit(&state, &headers) {
        return page;
    }

    let Some(update) = decode_clients(&body.settings).into_iter().next() else {
        return json_reply(json!({"success": false, "msg": "no client"}));
    };
    let mut inbounds = state.inbounds.lock();
    let Some(inbound) = inbounds.iter_mut().find(|i| i.id == body.id) else {
        return json_reply(json!({"success": false, "msg": "inbound not found"}));
    };
    match inbound
        .clients
        .iter_mut()
        .find(|c| c["id"] == client.as_str())
    {
        Some(existing) => {
            *existing = update;
            json_reply(json!({"success": true, "msg": "Inbound client has been updated."}))
        }
        None => json_reply(json!({"success": false, "msg": "client not found"})),
    }
}
