pub mod handlers;

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use forwarder_core::{ExitReason, ForwardError, HealthEndpoint, Shutdown};

pub use handlers::{ApiState, StatusResponse};

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::handle_healthz))
        .route("/status", get(handlers::handle_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Health check listener. Serves until [`HealthEndpoint::close`]; a serve
/// failure before that requests a fatal shutdown.
pub struct HealthServer {
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HealthServer {
    pub async fn bind(
        host: &str,
        port: u16,
        state: ApiState,
        shutdown: Shutdown,
    ) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "health check listening");

        let (stop, stopped) = oneshot::channel::<()>();
        let app = router(state);
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stopped.await;
                })
                .await;
            if let Err(e) = served {
                shutdown.trigger(ExitReason::fatal(format!("health check server failed: {e}")));
            }
        });

        Ok(Self {
            local_addr,
            stop: Some(stop),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl HealthEndpoint for HealthServer {
    async fn close(&mut self) -> Result<(), ForwardError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| ForwardError::Close(format!("health check server: {e}")))?;
        }
        tracing::info!(local_addr = %self.local_addr, "health check closed");
        Ok(())
    }
}

impl Drop for HealthServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
