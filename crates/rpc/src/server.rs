//! Server harness: exposes a local service's methods as `POST /<method>` routes.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use kite_core::{KiteConfig, KiteError, KiteResult, ServiceDescription};
use metrics::counter;
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{Invoke, RpcError};

/// Router with one POST route per declared method.
///
/// Refuses to build when `local` does not implement exactly the declared method set, so the
/// routes served always match what remote proxies of the same description will call.
pub fn router(desc: &ServiceDescription, local: Arc<dyn Invoke>) -> KiteResult<Router> {
    if desc.methods() != local.methods() {
        return Err(KiteError::MethodSetMismatch {
            service: desc.name().unwrap_or(desc.kind()).to_string(),
            declared: desc.methods().to_vec(),
            implemented: local.methods().to_vec(),
        });
    }
    let mut app = Router::new();
    for method in desc.methods().iter() {
        let svc = local.clone();
        let name = method.to_string();
        app = app.route(
            &format!("/{}", method),
            post(move |body: Bytes| {
                let svc = svc.clone();
                let name = name.clone();
                async move { handle(svc, name, body).await }
            }),
        );
    }
    Ok(app.layer(CatchPanicLayer::new()).layer(TraceLayer::new_for_http()))
}

async fn handle(svc: Arc<dyn Invoke>, method: String, body: Bytes) -> Response {
    counter!("rpc_requests", 1u64);
    let arg = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(v) => v,
            Err(e) => return RpcError::BadArgument(e.to_string()).into_response(),
        }
    };
    match svc.invoke(&method, arg).await {
        Ok(v) => (StatusCode::OK, Json(v)).into_response(),
        Err(e) => {
            counter!("rpc_handler_errors", 1u64);
            warn!(method = %method, error = %e, "method failed");
            e.into_response()
        }
    }
}

/// A bound, not yet serving, harness.
pub struct Harness {
    listener: TcpListener,
    app: Router,
    service: String,
}

impl Harness {
    /// Resolve env, build the local instance and bind the listener.
    ///
    /// The instance is always built from an unnamed copy of `desc`: the harness serves the
    /// local method bodies, never proxies back to itself.
    pub async fn bind<F>(desc: &ServiceDescription, build_local: F, cfg: &KiteConfig) -> KiteResult<Self>
    where
        F: FnOnce(&ServiceDescription) -> KiteResult<Arc<dyn Invoke>>,
    {
        let service = desc.name().unwrap_or(desc.kind()).to_string();
        let mut local = desc.local();
        let resolved = local.resolve_env(|k| std::env::var(k).ok());
        info!(service = %service, declared = local.env().len(), resolved, "env resolved");
        let instance = build_local(&local)?;
        let app = router(&local, instance)?;
        let listener = TcpListener::bind(cfg.listen_addr)
            .await
            .map_err(|source| KiteError::Bind { addr: cfg.listen_addr.to_string(), source })?;
        Ok(Self { listener, app, service })
    }

    pub fn local_addr(&self) -> KiteResult<SocketAddr> { self.listener.local_addr().map_err(KiteError::Server) }

    /// Serve until `shutdown` resolves.
    pub async fn run_until<S>(self, shutdown: S) -> KiteResult<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(service = %self.service, addr = %addr, "service ready");
        axum::serve(self.listener, self.app).with_graceful_shutdown(shutdown).await.map_err(KiteError::Server)?;
        info!(service = %self.service, "service stopped");
        Ok(())
    }
}

/// Run the harness for `desc` until Ctrl-C. A failed bind is returned, not swallowed.
pub async fn serve<F>(desc: &ServiceDescription, build_local: F, cfg: &KiteConfig) -> KiteResult<()>
where
    F: FnOnce(&ServiceDescription) -> KiteResult<Arc<dyn Invoke>>,
{
    Harness::bind(desc, build_local, cfg).await?.run_until(shutdown_on(tokio::signal::ctrl_c())).await
}

/// Resolves when `signal` fires. A signal that cannot be installed never resolves, so the
/// harness keeps serving instead of stopping at once.
async fn shutdown_on<S>(signal: S)
where
    S: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => info!("Ctrl-C received; shutting down"),
        Err(e) => {
            warn!(error = %e, "failed to listen for Ctrl-C; serving until killed");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_fires_on_signal() {
        let done = tokio::time::timeout(Duration::from_millis(200), shutdown_on(async { Ok(()) })).await;
        assert!(done.is_ok());
    }

    #[tokio::test]
    async fn failed_signal_install_keeps_serving() {
        let failed = async { Err(std::io::Error::new(std::io::ErrorKind::Other, "no signal handler")) };
        let done = tokio::time::timeout(Duration::from_millis(50), shutdown_on(failed)).await;
        assert!(done.is_err(), "shutdown must stay pending when the signal cannot be installed");
    }
}
