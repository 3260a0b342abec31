//! Kite manifest emitter: turns a service description graph into named YAML artifacts.
//!
//! Dependencies are emitted before their dependents, in sorted dependency-key order, and
//! each distinct instance exactly once, so identical input always yields identical output.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapKeySelector, Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, SecretKeySelector,
    Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kite_core::{labels, EnvValue, KiteConfig, KiteError, KiteResult, ServiceDescription, SERVICE_PORT};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const KNATIVE_API_VERSION: &str = "serving.knative.dev/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Container orchestration: a Deployment plus a ClusterIP Service per service.
    Kubernetes,
    /// Request-driven serverless: one Knative Service per service.
    Knative,
}

impl Target {
    pub const ALL: [Target; 2] = [Target::Kubernetes, Target::Knative];

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Kubernetes => "kubernetes",
            Target::Knative => "knative",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Target {
    type Err = KiteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(Target::Kubernetes),
            "knative" | "serverless" => Ok(Target::Knative),
            _ => Err(KiteError::UnsupportedTarget(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmitOptions {
    /// Prepended verbatim to every artifact name.
    pub template_dir: String,
    pub registry: Option<String>,
}

impl EmitOptions {
    pub fn from_config(cfg: &KiteConfig) -> Self {
        Self { template_dir: cfg.template_dir.clone(), registry: cfg.registry.clone() }
    }
}

/// One named block of YAML describing a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub yaml: String,
}

/// Emit the artifacts for `desc` and everything it depends on.
pub fn emit(desc: &ServiceDescription, target: Target, opts: &EmitOptions) -> KiteResult<Vec<Artifact>> {
    let mut walk = Walk { target, opts, seen: HashMap::new(), out: Vec::new() };
    walk.visit(desc)?;
    counter!("manifest_artifacts_emitted", walk.out.len() as u64);
    Ok(walk.out)
}

/// Emit for several targets in order, concatenating the results.
pub fn emit_all(desc: &ServiceDescription, targets: &[Target], opts: &EmitOptions) -> KiteResult<Vec<Artifact>> {
    let mut out = Vec::new();
    for t in targets {
        out.extend(emit(desc, *t, opts)?);
    }
    Ok(out)
}

struct Walk<'a> {
    target: Target,
    opts: &'a EmitOptions,
    /// name -> instance that claimed it in this pass
    seen: HashMap<String, *const ServiceDescription>,
    out: Vec<Artifact>,
}

impl Walk<'_> {
    fn visit(&mut self, desc: &ServiceDescription) -> KiteResult<()> {
        let name = desc.name().ok_or_else(|| {
            KiteError::InvalidServiceDescription(format!("{} has no name; manifests need a named service", desc.kind()))
        })?;
        match self.seen.get(name) {
            Some(prev) if std::ptr::eq(*prev, desc) => return Ok(()),
            Some(_) => return Err(KiteError::DuplicateServiceName(name.to_string())),
            None => {
                self.seen.insert(name.to_string(), desc as *const ServiceDescription);
            }
        }
        for dep in desc.dependencies().values() {
            self.visit(dep)?;
        }
        for artifact in render(desc, name, self.target, self.opts)? {
            debug!(artifact = %artifact.name, target = %self.target, "manifest emitted");
            self.out.push(artifact);
        }
        Ok(())
    }
}

fn render(desc: &ServiceDescription, name: &str, target: Target, opts: &EmitOptions) -> KiteResult<Vec<Artifact>> {
    let svc_name = format!("{}{}-svc", opts.template_dir, name);
    match target {
        Target::Kubernetes => Ok(vec![
            Artifact { name: format!("{}{}-deployment", opts.template_dir, name), yaml: to_yaml(&deployment(desc, name, opts))? },
            Artifact { name: svc_name, yaml: to_yaml(&cluster_service(desc, name))? },
        ]),
        Target::Knative => Ok(vec![Artifact { name: svc_name, yaml: to_yaml(&knative_service(desc, name, opts))? }]),
    }
}

fn to_yaml<T: Serialize>(v: &T) -> KiteResult<String> {
    serde_yaml::to_string(v).map_err(|e| KiteError::Yaml(e.to_string()))
}

fn meta(desc: &ServiceDescription, name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.to_string()), labels: Some(labels(desc)), ..Default::default() }
}

/// Flatten declared env into container entries, sorted by variable name.
pub fn env_vars(desc: &ServiceDescription) -> Vec<EnvVar> {
    desc.env()
        .iter()
        .map(|(key, value)| match value {
            EnvValue::Literal { value } => EnvVar { name: key.clone(), value: Some(value.clone()), value_from: None },
            EnvValue::Secret { name, key: secret_key } => EnvVar {
                name: key.clone(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector { name: Some(name.clone()), key: secret_key.clone(), optional: None }),
                    ..Default::default()
                }),
            },
            EnvValue::ConfigMap { name, key: cm_key } => EnvVar {
                name: key.clone(),
                value: None,
                value_from: Some(EnvVarSource {
                    config_map_key_ref: Some(ConfigMapKeySelector { name: Some(name.clone()), key: cm_key.clone(), optional: None }),
                    ..Default::default()
                }),
            },
        })
        .collect()
}

fn container(desc: &ServiceDescription, name: &str, opts: &EmitOptions) -> Container {
    let env = env_vars(desc);
    Container {
        name: name.to_string(),
        image: Some(desc.image(opts.registry.as_deref())),
        ports: Some(vec![ContainerPort { container_port: i32::from(SERVICE_PORT), ..Default::default() }]),
        env: if env.is_empty() { None } else { Some(env) },
        ..Default::default()
    }
}

fn deployment(desc: &ServiceDescription, name: &str, opts: &EmitOptions) -> Deployment {
    Deployment {
        metadata: meta(desc, name),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(labels(desc)), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels(desc)), ..Default::default() }),
                spec: Some(PodSpec { containers: vec![container(desc, name, opts)], ..Default::default() }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn cluster_service(desc: &ServiceDescription, name: &str) -> Service {
    Service {
        metadata: meta(desc, name),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels(desc)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: i32::from(SERVICE_PORT),
                target_port: Some(IntOrString::Int(i32::from(SERVICE_PORT))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// Knative types are not part of k8s-openapi; only the fields we emit are modelled.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KnativeService {
    api_version: &'static str,
    kind: &'static str,
    metadata: ObjectMeta,
    spec: KnativeServiceSpec,
}

#[derive(Debug, Serialize)]
struct KnativeServiceSpec {
    template: RevisionTemplate,
}

#[derive(Debug, Serialize)]
struct RevisionTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<ObjectMeta>,
    spec: RevisionSpec,
}

#[derive(Debug, Serialize)]
struct RevisionSpec {
    containers: Vec<Container>,
}

fn knative_service(desc: &ServiceDescription, name: &str, opts: &EmitOptions) -> KnativeService {
    KnativeService {
        api_version: KNATIVE_API_VERSION,
        kind: "Service",
        metadata: meta(desc, name),
        spec: KnativeServiceSpec {
            template: RevisionTemplate {
                metadata: Some(ObjectMeta { labels: Some(labels(desc)), ..Default::default() }),
                spec: RevisionSpec { containers: vec![container(desc, name, opts)] },
            },
        },
    }
}
