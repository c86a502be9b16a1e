//! HTTP server for the admission service.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::router;
use crate::error::{Result, TollgateError};
use crate::ratelimit::RateLimiterBackend;

/// HTTP server exposing the admission service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    limiter: Arc<dyn RateLimiterBackend>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, limiter: Arc<dyn RateLimiterBackend>) -> Self {
        Self { addr, limiter }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the server. Runs until the process is stopped.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server, shutting down gracefully once `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TollgateError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP admission service");

        let app = router(self.limiter);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{RateLimitPolicy, RateLimiter};
    use crate::store::MemoryCounterStore;
    use std::time::Duration;

    fn limiter() -> Arc<dyn RateLimiterBackend> {
        Arc::new(RateLimiter::new(
            Arc::new(RateLimitPolicy::canonical()),
            Arc::new(MemoryCounterStore::new()),
        ))
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let server = HttpServer::new(addr, limiter());
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn test_server_stops_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, limiter());

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.serve_with_shutdown(async {}),
        )
        .await
        .expect("server should shut down");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_failure_is_io_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let result = HttpServer::new(addr, limiter()).serve().await;
        assert!(matches!(result, Err(TollgateError::Io(_))));
    }
}
