//! Remote proxies: the same method set as a local service, forwarded over HTTP.

use std::time::Instant;

use kite_core::{KiteConfig, KiteResult, MethodSet, ServiceDescription};
use metrics::{counter, histogram};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{Invoke, RpcError, RpcResult};

/// Builds [`RemoteServiceProxy`] values sharing one HTTP client.
#[derive(Debug, Clone)]
pub struct ProxyFactory {
    client: Client,
    scheme: String,
    ingress_domain: Option<String>,
}

impl ProxyFactory {
    /// New factory whose client enforces the configured request timeout.
    pub fn new(cfg: &KiteConfig) -> RpcResult<Self> {
        let client = Client::builder().timeout(cfg.rpc_timeout).build()?;
        Ok(Self::with_client(client, cfg))
    }

    pub fn with_client(client: Client, cfg: &KiteConfig) -> Self {
        Self { client, scheme: cfg.rpc_scheme.clone(), ingress_domain: cfg.ingress_domain.clone() }
    }

    /// Proxy exposing exactly `desc.methods()`; the description must be named.
    pub fn proxy(&self, desc: &ServiceDescription) -> KiteResult<RemoteServiceProxy> {
        let service = desc.require_name()?.to_string();
        Ok(RemoteServiceProxy {
            client: self.client.clone(),
            scheme: self.scheme.clone(),
            ingress_domain: self.ingress_domain.clone(),
            service,
            methods: desc.methods().clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RemoteServiceProxy {
    client: Client,
    scheme: String,
    ingress_domain: Option<String>,
    service: String,
    methods: MethodSet,
}

impl RemoteServiceProxy {
    pub fn service(&self) -> &str { &self.service }

    /// `<scheme>://<service>.<ingress_domain>/<method>`
    pub fn endpoint(&self, method: &str) -> RpcResult<String> {
        let domain = self
            .ingress_domain
            .as_deref()
            .ok_or_else(|| RpcError::Config(format!("{} is not set", kite_core::config::ENV_INGRESS_DOMAIN)))?;
        Ok(format!("{}://{}.{}/{}", self.scheme, self.service, domain, method))
    }

    async fn post(&self, url: &str, arg: &Value) -> RpcResult<Value> {
        let response = self.client.post(url).json(arg).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if status.is_success() {
            if bytes.is_empty() { return Ok(Value::Null); }
            return Ok(serde_json::from_slice(&bytes)?);
        }
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        Err(RpcError::Remote { status: status.as_u16(), body })
    }
}

#[async_trait::async_trait]
impl Invoke for RemoteServiceProxy {
    fn methods(&self) -> &MethodSet { &self.methods }

    async fn invoke(&self, method: &str, arg: Value) -> RpcResult<Value> {
        if !self.methods.contains(method) {
            return Err(RpcError::UnknownMethod(format!("{}.{}", self.service, method)));
        }
        let url = self.endpoint(method)?;
        let t0 = Instant::now();
        counter!("rpc_calls", 1u64);
        debug!(service = %self.service, method, url = %url, "remote call");
        let res = self.post(&url, &arg).await;
        histogram!("rpc_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &res {
            counter!("rpc_errors", 1u64);
            warn!(service = %self.service, method, error = %e, "remote call failed");
        }
        res
    }
}
