//! Kite core types: service descriptions, label generation and the shared error taxonomy.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub mod config;

pub use config::KiteConfig;

/// TCP port every service listens on. Manifests route to it and the server harness binds it.
pub const SERVICE_PORT: u16 = 8080;

/// Label key used both on generated resources and in their selectors.
pub const LABEL_KEY: &str = "app";

/// Prefix prepended to the lower-cased service kind when deriving an image name.
pub const IMAGE_PREFIX: &str = "kite-";

#[derive(Debug, thiserror::Error)]
pub enum KiteError {
    #[error("invalid service description: {0}")]
    InvalidServiceDescription(String),
    #[error("unsupported target: {0} (expected kubernetes or knative)")]
    UnsupportedTarget(String),
    #[error("service name {0:?} is used by more than one service in the same graph")]
    DuplicateServiceName(String),
    #[error("service of kind {0} has no name; a name is required here")]
    MissingName(String),
    #[error("method set mismatch for {service}: declared {declared:?}, implemented {implemented:?}")]
    MethodSetMismatch { service: String, declared: Vec<String>, implemented: Vec<String> },
    #[error("config: {0}")]
    Config(String),
    #[error("yaml: {0}")]
    Yaml(String),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, #[source] source: std::io::Error },
    #[error("server: {0}")]
    Server(#[source] std::io::Error),
}

pub type KiteResult<T> = Result<T, KiteError>;

/// Value source for one declared environment variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "from", rename_all = "camelCase")]
pub enum EnvValue {
    Literal { value: String },
    Secret { name: String, key: String },
    ConfigMap { name: String, key: String },
}

impl EnvValue {
    pub fn literal(value: impl Into<String>) -> Self { EnvValue::Literal { value: value.into() } }

    pub fn secret(name: impl Into<String>, key: impl Into<String>) -> Self {
        EnvValue::Secret { name: name.into(), key: key.into() }
    }

    pub fn config_map(name: impl Into<String>, key: impl Into<String>) -> Self {
        EnvValue::ConfigMap { name: name.into(), key: key.into() }
    }

    /// Literal value, if this entry carries one.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            EnvValue::Literal { value } => Some(value),
            _ => None,
        }
    }
}

/// Sorted, duplicate-free set of invocable method names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MethodSet(BTreeSet<String>);

impl MethodSet {
    pub fn new() -> Self { Self::default() }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn insert(&mut self, name: impl Into<String>) -> bool { self.0.insert(name.into()) }
    pub fn contains(&self, name: &str) -> bool { self.0.contains(name) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &str> { self.0.iter().map(String::as_str) }
    pub fn to_vec(&self) -> Vec<String> { self.0.iter().cloned().collect() }
}

impl<'a> FromIterator<&'a str> for MethodSet {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self { Self::from_names(iter) }
}

/// In-memory declaration of one deployable service.
///
/// Dependencies are held behind `Arc`: pointer identity is what makes two references
/// "the same instance" during manifest traversal. `BTreeMap` keeps traversal and env
/// output in sorted key order.
#[derive(Debug, Clone)]
pub struct ServiceDescription {
    kind: String,
    name: Option<String>,
    dependencies: BTreeMap<String, Arc<ServiceDescription>>,
    env: BTreeMap<String, EnvValue>,
    methods: MethodSet,
}

impl ServiceDescription {
    pub fn builder(kind: impl Into<String>) -> ServiceDescriptionBuilder {
        ServiceDescriptionBuilder {
            kind: kind.into(),
            name: None,
            dependencies: BTreeMap::new(),
            env: BTreeMap::new(),
            methods: MethodSet::new(),
        }
    }

    pub fn kind(&self) -> &str { &self.kind }
    pub fn name(&self) -> Option<&str> { self.name.as_deref() }
    pub fn dependencies(&self) -> &BTreeMap<String, Arc<ServiceDescription>> { &self.dependencies }
    pub fn dependency(&self, key: &str) -> Option<&Arc<ServiceDescription>> { self.dependencies.get(key) }
    pub fn env(&self) -> &BTreeMap<String, EnvValue> { &self.env }
    pub fn methods(&self) -> &MethodSet { &self.methods }

    /// Name, or `MissingName` when the description is local-only.
    pub fn require_name(&self) -> KiteResult<&str> {
        self.name.as_deref().ok_or_else(|| KiteError::MissingName(self.kind.clone()))
    }

    /// Copy of this description without a name, i.e. describing a purely local instance.
    pub fn local(&self) -> ServiceDescription {
        ServiceDescription { name: None, ..self.clone() }
    }

    /// Container image derived from the kind, optionally under a registry prefix.
    pub fn image(&self, registry: Option<&str>) -> String {
        let base = format!("{}{}", IMAGE_PREFIX, self.kind.to_lowercase());
        match registry.map(|r| r.trim_end_matches('/')).filter(|r| !r.is_empty()) {
            Some(r) => format!("{}/{}", r, base),
            None => base,
        }
    }

    /// Overwrite declared env values with the identically-named variables `lookup` knows about.
    /// Returns how many entries were overwritten.
    pub fn resolve_env<F>(&mut self, lookup: F) -> usize
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved = 0usize;
        for (key, value) in self.env.iter_mut() {
            match lookup(key) {
                Some(v) => {
                    *value = EnvValue::Literal { value: v };
                    resolved += 1;
                }
                None => match value {
                    EnvValue::Literal { .. } => debug!(env = %key, "env not set; keeping declared value"),
                    EnvValue::Secret { name, .. } | EnvValue::ConfigMap { name, .. } => {
                        warn!(env = %key, source = %name, "env reference not resolved from process environment")
                    }
                },
            }
        }
        resolved
    }
}

pub struct ServiceDescriptionBuilder {
    kind: String,
    name: Option<String>,
    dependencies: BTreeMap<String, Arc<ServiceDescription>>,
    env: BTreeMap<String, EnvValue>,
    methods: MethodSet,
}

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));
static ENV_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));
static METHOD_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));

impl ServiceDescriptionBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self { self.name = Some(name.into()); self }

    pub fn env(mut self, key: impl Into<String>, value: EnvValue) -> Self {
        self.env.insert(key.into(), value);
        self
    }

    pub fn method(mut self, name: impl Into<String>) -> Self { self.methods.insert(name); self }

    pub fn methods(mut self, methods: &MethodSet) -> Self {
        for m in methods.iter() { self.methods.insert(m); }
        self
    }

    pub fn dependency(mut self, key: impl Into<String>, dep: Arc<ServiceDescription>) -> Self {
        self.dependencies.insert(key.into(), dep);
        self
    }

    pub fn build(self) -> KiteResult<ServiceDescription> {
        let invalid = |msg: String| Err(KiteError::InvalidServiceDescription(msg));
        if self.kind.trim().is_empty() {
            return invalid("kind must not be empty".into());
        }
        if let Some(name) = &self.name {
            if name.len() > 63 || !DNS_LABEL.is_match(name) {
                return invalid(format!("name {:?} is not a DNS-1123 label", name));
            }
        }
        if let Some(bad) = self.env.keys().find(|k| !ENV_NAME.is_match(k)) {
            return invalid(format!("env name {:?} is not a valid variable name", bad));
        }
        if self.methods.is_empty() {
            return invalid(format!("{} declares no methods", self.kind));
        }
        if let Some(bad) = self.methods.iter().find(|m| !METHOD_NAME.is_match(m)) {
            return invalid(format!("method name {:?} cannot be used as a route", bad));
        }
        Ok(ServiceDescription {
            kind: self.kind,
            name: self.name,
            dependencies: self.dependencies,
            env: self.env,
            methods: self.methods,
        })
    }
}

/// Labels attached to a service's resources and used verbatim by their selectors.
pub fn labels(desc: &ServiceDescription) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert(LABEL_KEY.to_string(), desc.name().unwrap_or_default().to_string());
    out
}

pub mod prelude {
    pub use super::{labels, EnvValue, KiteConfig, KiteError, KiteResult, MethodSet, ServiceDescription, SERVICE_PORT};
}
