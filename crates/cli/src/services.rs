//! Sample service graph: a `greeter` that depends on an `echo`.

use std::sync::Arc;

use kite_core::{EnvValue, KiteResult, MethodSet, ServiceDescription};
use kite_rpc::{call, decode_arg, encode_reply, Invoke, ProxyFactory, RpcError, RpcResult, ServiceHandle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const ECHO_METHODS: [&str; 2] = ["ping", "reverse"];
pub const GREETER_METHODS: [&str; 1] = ["greet"];

pub struct Graph {
    pub echo: Arc<ServiceDescription>,
    pub greeter: Arc<ServiceDescription>,
}

impl Graph {
    /// Named graph for manifests and live deployment.
    pub fn deployed() -> KiteResult<Self> { Self::build(true) }

    /// Unnamed graph running every service in-process.
    pub fn in_process() -> KiteResult<Self> { Self::build(false) }

    fn build(named: bool) -> KiteResult<Self> {
        let mut echo = ServiceDescription::builder("Echo")
            .env("ECHO_PREFIX", EnvValue::secret("echo-config", "prefix"))
            .methods(&MethodSet::from_names(ECHO_METHODS));
        if named { echo = echo.name("echo"); }
        let echo = Arc::new(echo.build()?);

        let mut greeter = ServiceDescription::builder("Greeter")
            .env("GREETING", EnvValue::literal("Hello"))
            .methods(&MethodSet::from_names(GREETER_METHODS))
            .dependency("echo", echo.clone());
        if named { greeter = greeter.name("greeter"); }
        Ok(Self { echo, greeter: Arc::new(greeter.build()?) })
    }

    pub fn get(&self, service: &str) -> Option<&Arc<ServiceDescription>> {
        match service {
            "echo" => Some(&self.echo),
            "greeter" => Some(&self.greeter),
            _ => None,
        }
    }

    /// Local instance of `service`, reaching its dependencies through `factory` when given.
    pub fn local(&self, desc: &ServiceDescription, factory: Option<&ProxyFactory>) -> KiteResult<Arc<dyn Invoke>> {
        match desc.kind() {
            "Greeter" => {
                let echo_desc = desc.dependency("echo").cloned().unwrap_or_else(|| self.echo.clone());
                let echo = ServiceHandle::connect(&echo_desc, factory, || Arc::new(Echo::new(&echo_desc)) as Arc<dyn Invoke>)?;
                Ok(Arc::new(Greeter::new(desc, echo)))
            }
            _ => Ok(Arc::new(Echo::new(desc))),
        }
    }
}

fn literal_env(desc: &ServiceDescription, key: &str) -> String {
    desc.env().get(key).and_then(EnvValue::as_literal).unwrap_or_default().to_string()
}

pub struct Echo {
    methods: MethodSet,
    prefix: String,
}

impl Echo {
    pub fn new(desc: &ServiceDescription) -> Self {
        Self { methods: MethodSet::from_names(ECHO_METHODS), prefix: literal_env(desc, "ECHO_PREFIX") }
    }
}

#[async_trait::async_trait]
impl Invoke for Echo {
    fn methods(&self) -> &MethodSet { &self.methods }

    async fn invoke(&self, method: &str, arg: Value) -> RpcResult<Value> {
        match method {
            "ping" => Ok(serde_json::json!({ "pong": arg })),
            "reverse" => {
                let s: String = decode_arg(arg)?;
                encode_reply(&format!("{}{}", self.prefix, s.chars().rev().collect::<String>()))
            }
            other => Err(RpcError::UnknownMethod(format!("echo.{}", other))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GreetRequest {
    name: String,
}

#[derive(Debug, Serialize)]
struct GreetReply {
    message: String,
    mirrored: String,
}

pub struct Greeter {
    methods: MethodSet,
    greeting: String,
    echo: ServiceHandle,
}

impl Greeter {
    pub fn new(desc: &ServiceDescription, echo: ServiceHandle) -> Self {
        Self { methods: MethodSet::from_names(GREETER_METHODS), greeting: literal_env(desc, "GREETING"), echo }
    }
}

#[async_trait::async_trait]
impl Invoke for Greeter {
    fn methods(&self) -> &MethodSet { &self.methods }

    async fn invoke(&self, method: &str, arg: Value) -> RpcResult<Value> {
        match method {
            "greet" => {
                let req: GreetRequest = decode_arg(arg)?;
                if req.name.trim().is_empty() {
                    return Err(RpcError::handler("name must not be empty"));
                }
                debug!(remote = self.echo.is_remote(), "calling echo.reverse");
                let mirrored: String = call(&self.echo, "reverse", &req.name).await?;
                encode_reply(&GreetReply { message: format!("{}, {}!", self.greeting, req.name), mirrored })
            }
            other => Err(RpcError::UnknownMethod(format!("greeter.{}", other))),
        }
    }
}
