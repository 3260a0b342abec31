//! Kite remote invocation.
//!
//! Every service exposes its declared methods through [`Invoke`]. A local implementation runs
//! the method bodies in-process; [`RemoteServiceProxy`] forwards the same calls over HTTP to the
//! deployed service, and the [`server`] harness exposes a local implementation as `POST /<method>`.
//! Which one a caller talks to is chosen explicitly through [`ServiceHandle`].

#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kite_core::{KiteResult, MethodSet, ServiceDescription};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod proxy;
pub mod server;

pub use proxy::{ProxyFactory, RemoteServiceProxy};
pub use server::{router, serve, Harness};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("remote returned {status}: {body}")]
    Remote { status: u16, body: Value },
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("{message}")]
    Handler { message: String, details: Option<Value> },
    #[error("config: {0}")]
    Config(String),
}

impl RpcError {
    pub fn handler(message: impl Into<String>) -> Self { RpcError::Handler { message: message.into(), details: None } }

    pub fn handler_with(message: impl Into<String>, details: Value) -> Self {
        RpcError::Handler { message: message.into(), details: Some(details) }
    }

    /// Decoded error body when the remote side answered with an [`ErrorResponse`].
    pub fn remote_error(&self) -> Option<ErrorResponse> {
        match self {
            RpcError::Remote { body, .. } => serde_json::from_value(body.clone()).ok(),
            _ => None,
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            RpcError::BadArgument(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            RpcError::UnknownMethod(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            RpcError::Handler { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "HANDLER_ERROR"),
            RpcError::Transport(_) | RpcError::Remote { .. } => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
            RpcError::Decode(_) | RpcError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

/// Error response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let details = match &self {
            RpcError::Handler { details, .. } => details.clone(),
            RpcError::Remote { body, .. } => Some(body.clone()),
            _ => None,
        };
        let body = ErrorResponse { error: self.to_string(), code: code.to_string(), details };
        (status, Json(body)).into_response()
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

/// The method-set contract shared by local implementations and remote proxies.
#[async_trait::async_trait]
pub trait Invoke: Send + Sync {
    /// Exactly the methods this service answers to.
    fn methods(&self) -> &MethodSet;

    /// Invoke `method` with its single JSON argument.
    async fn invoke(&self, method: &str, arg: Value) -> RpcResult<Value>;
}

/// Typed call through any [`Invoke`].
pub async fn call<A, R>(svc: &dyn Invoke, method: &str, arg: &A) -> RpcResult<R>
where
    A: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let arg = serde_json::to_value(arg)?;
    let out = svc.invoke(method, arg).await?;
    Ok(serde_json::from_value(out)?)
}

/// Decode a method argument inside a local implementation.
pub fn decode_arg<T: DeserializeOwned>(arg: Value) -> RpcResult<T> {
    serde_json::from_value(arg).map_err(|e| RpcError::BadArgument(e.to_string()))
}

/// Encode a method result inside a local implementation.
pub fn encode_reply<T: Serialize>(reply: &T) -> RpcResult<Value> { Ok(serde_json::to_value(reply)?) }

/// A dependency as seen by the code that calls it: in-process or behind HTTP.
#[derive(Clone)]
pub enum ServiceHandle {
    Local(Arc<dyn Invoke>),
    Remote(Arc<RemoteServiceProxy>),
}

impl ServiceHandle {
    /// Remote when the description is named and a factory is available, otherwise the
    /// local instance produced by `local`.
    pub fn connect<F>(desc: &ServiceDescription, factory: Option<&ProxyFactory>, local: F) -> KiteResult<Self>
    where
        F: FnOnce() -> Arc<dyn Invoke>,
    {
        match (desc.name(), factory) {
            (Some(_), Some(f)) => Ok(ServiceHandle::Remote(Arc::new(f.proxy(desc)?))),
            _ => Ok(ServiceHandle::Local(local())),
        }
    }

    pub fn is_remote(&self) -> bool { matches!(self, ServiceHandle::Remote(_)) }

    fn inner(&self) -> &dyn Invoke {
        match self {
            ServiceHandle::Local(l) => l.as_ref(),
            ServiceHandle::Remote(r) => r.as_ref() as &dyn Invoke,
        }
    }
}

#[async_trait::async_trait]
impl Invoke for ServiceHandle {
    fn methods(&self) -> &MethodSet { self.inner().methods() }

    async fn invoke(&self, method: &str, arg: Value) -> RpcResult<Value> { self.inner().invoke(method, arg).await }
}
