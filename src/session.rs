//! Per-backend session cache for the panel transport.
//!
//! A session is created lazily by a login exchange and reused until it is
//! invalidated or outlives the configured TTL. The cache lock is never held
//! across a network call, so two concurrent callers may both log in after an
//! invalidation; the last one to finish wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::header::SET_COOKIE;
use reqwest::Client;
use serde::Deserialize;

use crate::config::{PanelConfig, SecureString};
use crate::executor::ExecutorError;

/// Authentication state for one backend.
#[derive(Debug, Clone)]
pub struct Session {
    /// Panel base URL without a trailing slash.
    pub base_url: String,
    /// Value for the `Cookie` request header.
    cookie: SecureString,
    pub logged_in: bool,
    established: Instant,
}

impl Session {
    /// Value to send in the `Cookie` header.
    pub fn cookie_header(&self) -> &str {
        self.cookie.expose()
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.logged_in && self.established.elapsed() < ttl
    }
}

#[derive(Deserialize)]
struct LoginReply {
    success: bool,
    #[serde(default)]
    msg: String,
}

/// Cache of panel sessions keyed by backend name.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
    request_timeout: Duration,
    logins: AtomicU64,
}

impl SessionManager {
    pub fn new(ttl: Duration, request_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
            request_timeout,
            logins: AtomicU64::new(0),
        }
    }

    /// Return the cached session, logging in first when there is none.
    ///
    /// Performs exactly one login attempt; retrying is the caller's job.
    pub async fn acquire(
        &self,
        client: &Client,
        backend: &str,
        panel: &PanelConfig,
    ) -> Result<Session, ExecutorError> {
        if let Some(session) = self.cached(backend) {
            return Ok(session);
        }

        let session = self.login(client, backend, panel).await?;
        self.sessions
            .lock()
            .insert(backend.to_string(), session.clone());
        Ok(session)
    }

    /// Mark the backend's session as logged out. Idempotent.
    pub fn invalidate(&self, backend: &str) {
        if let Some(session) = self.sessions.lock().get_mut(backend) {
            if session.logged_in {
                tracing::debug!(backend = %backend, "Session invalidated");
            }
            session.logged_in = false;
        }
    }

    /// Drop every cached session.
    pub fn invalidate_all(&self) {
        self.sessions.lock().clear();
    }

    pub fn is_logged_in(&self, backend: &str) -> bool {
        self.cached(backend).is_some()
    }

    /// Number of login exchanges performed since creation.
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    fn cached(&self, backend: &str) -> Option<Session> {
        self.sessions
            .lock()
            .get(backend)
            .filter(|s| s.is_fresh(self.ttl))
            .cloned()
    }

    async fn login(
        &self,
        client: &Client,
        backend: &str,
        panel: &PanelConfig,
    ) -> Result<Session, ExecutorError> {
        let base_url = panel.url.trim_end_matches('/').to_string();
        self.logins.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(backend = %backend, "Logging in to panel");

        let auth_failure = |reason: String| ExecutorError::AuthenticationFailure {
            backend: backend.to_string(),
            reason,
        };

        let response = client
            .post(format!("{}/login", base_url))
            .timeout(self.request_timeout)
            .json(&serde_json::json!({
                "username": panel.username,
                "password": panel.password.expose(),
            }))
            .send()
            .await
            .map_err(|e| transport_error(backend, &e, self.request_timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(auth_failure(format!(
                "login returned HTTP {}",
                status.as_u16()
            )));
        }

        let cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .collect::<Vec<_>>()
            .join("; ");

        let reply: LoginReply = response
            .json()
            .await
            .map_err(|_| auth_failure("login reply is not JSON".to_string()))?;

        if !reply.success {
            let reason = if reply.msg.is_empty() {
                "credentials refused".to_string()
            } else {
                reply.msg
            };
            return Err(auth_failure(reason));
        }
        if cookie.is_empty() {
            return Err(auth_failure("login set no session cookie".to_string()));
        }

        tracing::info!(backend = %backend, "Logged in to panel");
        Ok(Session {
            base_url,
            cookie: SecureString::new(cookie),
            logged_in: true,
            established: Instant::now(),
        })
    }
}

/// Map a reqwest failure onto the shared taxonomy.
pub(crate) fn transport_error(
    backend: &str,
    err: &reqwest::Error,
    timeout: Duration,
) -> ExecutorError {
    if err.is_timeout() {
        ExecutorError::Timeout {
            backend: backend.to_string(),
            seconds: timeout.as_secs(),
        }
    } else {
        ExecutorError::Unreachable {
            backend: backend.to_string(),
            reason: err.to_string(),
        }
    }
}
