use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::signal;
use tokio::sync::Notify;
use tower::Service;

/// Tracks shutdown requests and open connections of the subscription server.
pub struct ShutdownManager {
    shutdown: AtomicBool,
    active_connections: AtomicUsize,
    notify: Notify,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            active_connections: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Resolves on Ctrl-C, SIGTERM or [`signal_shutdown`](Self::signal_shutdown).
    pub async fn wait_for_shutdown(&self) -> std::io::Result<()> {
        // Register before checking the flag so a concurrent signal is not lost.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_shutting_down() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            tokio::select! {
                _ = signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
                _ = notified => {},
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = signal::ctrl_c() => {},
                _ = notified => {},
            }
        }

        self.shutdown.store(true, Ordering::SeqCst);
        tracing::info!("Shutting down gracefully...");
        Ok(())
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    fn increment_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    /// Let in-flight subscription requests finish their backend calls.
    pub async fn wait_for_connections(&self, timeout: Duration) {
        tracing::info!(
            active = self.active_connections(),
            "Waiting for active connections..."
        );

        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if self.active_connections() == 0 {
                tracing::info!("Server stopped");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tracing::warn!(
            remaining = self.active_connections(),
            "Forced shutdown after timeout"
        );
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Make-service wrapper counting live connections in a [`ShutdownManager`].
pub(crate) struct ConnectionCounter<M> {
    inner: M,
    shutdown: Arc<ShutdownManager>,
}

impl<M> ConnectionCounter<M> {
    pub(crate) fn new(inner: M, shutdown: Arc<ShutdownManager>) -> Self {
        Self { inner, shutdown }
    }
}

impl<M: Clone> Clone for ConnectionCounter<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<M, T> Service<T> for ConnectionCounter<M>
where
    M: Service<T> + Send,
    M::Future: Send + 'static,
    M::Response: Send + 'static,
{
    type Response = ConnectionGuard<M::Response>;
    type Error = M::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, target: T) -> Self::Future {
        let shutdown = self.shutdown.clone();
        shutdown.increment_connections();
        let fut = self.inner.call(target);

        Box::pin(async move {
            match fut.await {
                Ok(service) => Ok(ConnectionGuard {
                    inner: service,
                    shutdown,
                }),
                Err(err) => {
                    shutdown.decrement_connections();
                    Err(err)
                }
            }
        })
    }
}

/// Per-connection service; releases its slot when dropped.
pub(crate) struct ConnectionGuard<S> {
    inner: S,
    shutdown: Arc<ShutdownManager>,
}

impl<S: Clone> Clone for ConnectionGuard<S> {
    fn clone(&self) -> Self {
        self.shutdown.increment_connections();
        Self {
            inner: self.inner.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S> Drop for ConnectionGuard<S> {
    fn drop(&mut self) {
        self.shutdown.decrement_connections();
    }
}

impl<S, Req> Service<Req> for ConnectionGuard<S>
where
    S: Service<Req>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.inner.call(req)
    }
}
