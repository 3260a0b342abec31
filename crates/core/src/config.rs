//! Runtime configuration sourced from environment variables.
//!
//! Everything the emitter, proxy factory and server harness would otherwise look up
//! process-wide is read once here and passed in explicitly.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

use crate::{KiteError, KiteResult, SERVICE_PORT};

pub const ENV_INGRESS_DOMAIN: &str = "CLUSTER_INGRESS_SUBDOMAIN";
pub const ENV_REGISTRY: &str = "REGISTRY";
pub const ENV_TEMPLATE_DIR: &str = "KITE_TEMPLATE_DIR";
pub const ENV_RPC_TIMEOUT_SECS: &str = "KITE_RPC_TIMEOUT_SECS";
pub const ENV_RPC_SCHEME: &str = "KITE_RPC_SCHEME";
pub const ENV_LISTEN_ADDR: &str = "KITE_LISTEN_ADDR";

const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KiteConfig {
    /// Base hostname suffix; services are reached at `<name>.<ingress_domain>`.
    pub ingress_domain: Option<String>,
    /// Optional image repository prefix.
    pub registry: Option<String>,
    /// Prefix prepended to every artifact name.
    pub template_dir: String,
    pub rpc_timeout: Duration,
    /// `https` unless overridden for plain-text clusters.
    pub rpc_scheme: String,
    pub listen_addr: SocketAddr,
}

impl Default for KiteConfig {
    fn default() -> Self {
        Self {
            ingress_domain: None,
            registry: None,
            template_dir: String::new(),
            rpc_timeout: Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS),
            rpc_scheme: "https".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], SERVICE_PORT)),
        }
    }
}

impl KiteConfig {
    pub fn from_env() -> KiteResult<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> KiteResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = Self::default();
        cfg.ingress_domain = get(ENV_INGRESS_DOMAIN).map(|d| d.trim_start_matches('.').to_string());
        cfg.registry = get(ENV_REGISTRY);
        if let Some(dir) = get(ENV_TEMPLATE_DIR) { cfg.template_dir = dir; }
        if let Some(secs) = get(ENV_RPC_TIMEOUT_SECS) {
            let secs = secs
                .parse::<u64>()
                .map_err(|_| KiteError::Config(format!("{} must be a whole number of seconds, got {:?}", ENV_RPC_TIMEOUT_SECS, secs)))?;
            cfg.rpc_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(scheme) = get(ENV_RPC_SCHEME) {
            let scheme = scheme.to_ascii_lowercase();
            if scheme != "http" && scheme != "https" {
                return Err(KiteError::Config(format!("{} must be http or https, got {:?}", ENV_RPC_SCHEME, scheme)));
            }
            cfg.rpc_scheme = scheme;
        }
        if let Some(addr) = get(ENV_LISTEN_ADDR) {
            cfg.listen_addr = addr
                .parse()
                .map_err(|_| KiteError::Config(format!("invalid {}; expected host:port, got {:?}", ENV_LISTEN_ADDR, addr)))?;
            if !cfg.listens_on_service_port() {
                warn!(
                    addr = %cfg.listen_addr,
                    service_port = SERVICE_PORT,
                    "{} moves the harness off the port generated manifests route to", ENV_LISTEN_ADDR
                );
            }
        }
        Ok(cfg)
    }

    /// Whether the harness binds the port that emitted Deployments, Services and Knative
    /// revisions send traffic to.
    pub fn listens_on_service_port(&self) -> bool { self.listen_addr.port() == SERVICE_PORT }

    pub fn ingress_domain(&self) -> KiteResult<&str> {
        self.ingress_domain
            .as_deref()
            .ok_or_else(|| KiteError::Config(format!("{} is not set", ENV_INGRESS_DOMAIN)))
    }
}
