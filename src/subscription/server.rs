use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use uuid::Uuid;

use super::aggregator::{Aggregator, Subscription};
use super::error::SubscriptionError;
use super::shutdown::{ConnectionCounter, ShutdownManager};
use crate::backend::{BackendSelector, Placement};
use crate::config::ServerConfig;
use crate::orchestrator::Orchestrator;

/// Header carrying traffic and expiry figures to client software.
pub const USERINFO_HEADER: &str = "subscription-userinfo";
/// Header telling client software how often to refresh, in hours.
pub const UPDATE_INTERVAL_HEADER: &str = "profile-update-interval";

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    update_interval_hours: u32,
    started: Instant,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    /// Enabled backends.
    pub backends: usize,
    pub uptime_secs: u64,
}

/// Routes of the subscription surface.
pub fn build_router(orchestrator: Arc<Orchestrator>, update_interval_hours: u32) -> Router {
    let state = AppState {
        orchestrator,
        update_interval_hours,
        started: Instant::now(),
    };

    Router::new()
        .route("/health", get(health))
        .route("/subscription/{identity}", get(subscription))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    let backends = state
        .orchestrator
        .registry()
        .select(&BackendSelector::All, Placement::Existing)
        .len();

    Json(HealthStatus {
        status: "healthy".to_string(),
        service: "keyfleet".to_string(),
        backends,
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

async fn subscription(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    headers: HeaderMap,
) -> Result<Response, SubscriptionError> {
    let identity =
        Uuid::parse_str(raw.trim()).map_err(|_| SubscriptionError::InvalidIdentity(raw.clone()))?;

    let subscription = Aggregator::new(&state.orchestrator)
        .for_customer(identity)
        .await;
    if subscription.is_empty() {
        tracing::info!(identity = %identity, "Subscription requested for unknown identity");
        return Err(SubscriptionError::NotFound(identity));
    }

    tracing::info!(
        identity = %identity,
        descriptors = subscription.descriptors.len(),
        browser = is_browser(&headers),
        "Serving subscription"
    );

    if is_browser(&headers) {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(render_page(identity, &subscription)))?);
    }

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(
            UPDATE_INTERVAL_HEADER,
            state.update_interval_hours.to_string(),
        );
    if let Some(usage) = &subscription.usage {
        builder = builder.header(USERINFO_HEADER, usage.header_value());
    }
    Ok(builder.body(Body::from(subscription.encoded()))?)
}

/// A person opening the link, as opposed to client software fetching it.
fn is_browser(headers: &HeaderMap) -> bool {
    let text = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    };
    text(header::ACCEPT).contains("text/html") && text(header::USER_AGENT).contains("Mozilla")
}

fn render_page(identity: Uuid, subscription: &Subscription) -> String {
    let mut rows = String::new();
    if let Some(usage) = &subscription.usage {
        let used = (usage.upload + usage.download) as f64 / BYTES_PER_GIB;
        let quota = if usage.total == 0 {
            "unlimited".to_string()
        } else {
            format!("{:.2} GiB", usage.total as f64 / BYTES_PER_GIB)
        };
        let expires = if usage.expire == 0 {
            "never".to_string()
        } else {
            chrono::DateTime::from_timestamp(usage.expire, 0)
                .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| usage.expire.to_string())
        };
        rows.push_str(&format!(
            "<tr><th>Traffic used</th><td>{:.2} GiB</td></tr>\n\
             <tr><th>Quota</th><td>{}</td></tr>\n\
             <tr><th>Expires</th><td>{}</td></tr>\n",
            used, quota, expires
        ));
    }

    let links: String = subscription
        .descriptors
        .iter()
        .map(|d| format!("<li><code>{}</code></li>\n", escape_html(d)))
        .collect();

    format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Subscription</title></head>\n\
         <body>\n<h1>Subscription {}</h1>\n<table>\n{}</table>\n<ul>\n{}</ul>\n</body>\n</html>\n",
        identity, rows, links
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// The subscription HTTP server.
pub struct SubscriptionServer {
    addr: SocketAddr,
    /// Bound at construction so the port is held until `run`.
    listener: TcpListener,
    router: Router,
    shutdown: Arc<ShutdownManager>,
}

impl SubscriptionServer {
    /// Bind `config.bind_addr` and prepare the routes.
    pub async fn bind(
        orchestrator: Arc<Orchestrator>,
        config: &ServerConfig,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let bind_addr: SocketAddr = config
            .bind_addr
            .parse()
            .map_err(|e| format!("Invalid bind address '{}': {}", config.bind_addr, e))?;

        let listener = TcpListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Subscription server bound");

        Ok(Self {
            addr,
            listener,
            router: build_router(orchestrator, config.update_interval_hours),
            shutdown: Arc::new(ShutdownManager::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Serve until a shutdown signal, then give in-flight requests time to
    /// finish their backend calls.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!(addr = %self.addr, "Starting subscription server");

        let make_service =
            ConnectionCounter::new(self.router.into_make_service(), self.shutdown.clone());

        let shutdown = self.shutdown.clone();
        axum::serve(self.listener, make_service)
            .with_graceful_shutdown(async move {
                if let Err(e) = shutdown.wait_for_shutdown().await {
                    tracing::error!(error = %e, "Failed to install signal handler");
                }
            })
            .into_future()
            .await?;

        self.shutdown
            .wait_for_connections(Duration::from_secs(30))
            .await;
        tracing::info!("Subscription server stopped");
        Ok(())
    }
}

#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<ShutdownManager>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.shutdown.signal_shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }
}
