#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use kite_core::{EnvValue, KiteConfig, KiteError, MethodSet, ServiceDescription};
use kite_rpc::{call, router, ErrorResponse, Harness, Invoke, ProxyFactory, RpcError, RpcResult, ServiceHandle};
use serde_json::{json, Value};
use tower::ServiceExt;

const METHODS: [&str; 4] = ["echo", "fail", "ping", "slow"];

struct Echo {
    methods: MethodSet,
    prefix: String,
}

impl Echo {
    fn new(prefix: &str) -> Self { Self { methods: MethodSet::from_names(METHODS), prefix: prefix.to_string() } }
}

#[async_trait::async_trait]
impl Invoke for Echo {
    fn methods(&self) -> &MethodSet { &self.methods }

    async fn invoke(&self, method: &str, arg: Value) -> RpcResult<Value> {
        match method {
            "ping" => Ok(json!({ "pong": arg, "prefix": self.prefix })),
            "echo" => Ok(arg),
            "fail" => Err(RpcError::handler_with("boom", json!({ "arg": arg }))),
            "slow" => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(arg)
            }
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}

fn desc() -> ServiceDescription {
    ServiceDescription::builder("Echo")
        .name("echo")
        .env("KITE_TEST_ECHO_PREFIX", EnvValue::literal("declared"))
        .methods(&MethodSet::from_names(METHODS))
        .build()
        .unwrap()
}

fn app() -> axum::Router { router(&desc(), Arc::new(Echo::new(">"))).unwrap() }

async fn post(app: axum::Router, uri: &str, body: &str) -> (StatusCode, Vec<u8>) {
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

#[tokio::test]
async fn post_returns_what_the_local_method_computes() {
    let (status, body) = post(app(), "/ping", r#"{"n":1}"#).await;
    assert_eq!(status, StatusCode::OK);
    let got: Value = serde_json::from_slice(&body).unwrap();
    let expected = Echo::new(">").invoke("ping", json!({"n": 1})).await.unwrap();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn empty_body_is_a_null_argument() {
    let (status, body) = post(app(), "/echo", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), Value::Null);
}

#[tokio::test]
async fn handler_failure_is_a_500_with_error_body() {
    let (status, body) = post(app(), "/fail", r#"{"n":2}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(err.code, "HANDLER_ERROR");
    assert_eq!(err.error, "boom");
    assert_eq!(err.details, Some(json!({"arg": {"n": 2}})));
}

#[tokio::test]
async fn malformed_json_is_a_400() {
    let (status, body) = post(app(), "/ping", "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(err.code, "BAD_REQUEST");
}

#[tokio::test]
async fn undeclared_route_is_a_404() {
    let (status, _) = post(app(), "/shutdown", "{}").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn only_post_is_routed() {
    let resp = app().oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[test]
fn router_refuses_mismatched_method_sets() {
    let narrow = ServiceDescription::builder("Echo").name("echo").method("ping").build().unwrap();
    let err = router(&narrow, Arc::new(Echo::new(""))).unwrap_err();
    match err {
        KiteError::MethodSetMismatch { service, declared, implemented } => {
            assert_eq!(service, "echo");
            assert_eq!(declared, vec!["ping".to_string()]);
            assert_eq!(implemented.len(), METHODS.len());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn harness_resolves_env_and_builds_an_unnamed_instance() {
    std::env::set_var("KITE_TEST_ECHO_PREFIX", "from-env");
    let cfg = KiteConfig { listen_addr: "127.0.0.1:0".parse().unwrap(), ..KiteConfig::default() };
    let mut seen = None;
    let harness = Harness::bind(
        &desc(),
        |local| {
            seen = Some((local.name().map(str::to_string), local.env()["KITE_TEST_ECHO_PREFIX"].clone()));
            Ok(Arc::new(Echo::new("")) as Arc<dyn Invoke>)
        },
        &cfg,
    )
    .await
    .unwrap();
    assert_ne!(harness.local_addr().unwrap().port(), 0);
    let (name, prefix) = seen.unwrap();
    assert_eq!(name, None);
    assert_eq!(prefix, EnvValue::literal("from-env"));
}

#[tokio::test]
async fn bind_failure_is_reported() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cfg = KiteConfig { listen_addr: taken.local_addr().unwrap(), ..KiteConfig::default() };
    let err = Harness::bind(&desc(), |_| Ok(Arc::new(Echo::new("")) as Arc<dyn Invoke>), &cfg).await.err().unwrap();
    assert!(matches!(err, KiteError::Bind { .. }), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn proxy_round_trips_through_a_live_harness() {
    let cfg = KiteConfig { listen_addr: "127.0.0.1:0".parse().unwrap(), ..KiteConfig::default() };
    let harness = Harness::bind(&desc(), |_| Ok(Arc::new(Echo::new(">")) as Arc<dyn Invoke>), &cfg).await.unwrap();
    let addr = harness.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(harness.run_until(async move {
        let _ = stop_rx.await;
    }));

    // Route <name>.kite.test to the harness instead of DNS.
    let client = reqwest::Client::builder().resolve("echo.kite.test", addr).build().unwrap();
    let remote_cfg = KiteConfig {
        ingress_domain: Some(format!("kite.test:{}", addr.port())),
        rpc_scheme: "http".to_string(),
        ..KiteConfig::default()
    };
    let factory = ProxyFactory::with_client(client, &remote_cfg);
    let proxy = factory.proxy(&desc()).unwrap();
    assert_eq!(proxy.methods(), desc().methods());

    let got = proxy.invoke("ping", json!({"n": 1})).await.unwrap();
    assert_eq!(got, Echo::new(">").invoke("ping", json!({"n": 1})).await.unwrap());

    for v in [Value::Null, json!(1), json!("s"), json!([1, 2.5, "x"]), json!({"a": {"b": [true, null]}})] {
        let back: Value = call(&proxy, "echo", &v).await.unwrap();
        assert_eq!(back, v);
    }

    let err = proxy.invoke("fail", json!(3)).await.unwrap_err();
    match &err {
        RpcError::Remote { status, .. } => assert_eq!(*status, 500),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.remote_error().unwrap().code, "HANDLER_ERROR");

    drop(proxy);
    drop(factory);
    let _ = stop_tx.send(());
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn unnamed_handle_stays_local() {
    let factory = ProxyFactory::new(&KiteConfig::default()).unwrap();
    let local_desc = desc().local();
    let handle = ServiceHandle::connect(&local_desc, Some(&factory), || Arc::new(Echo::new("~")) as Arc<dyn Invoke>).unwrap();
    assert!(!handle.is_remote());
    // No ingress domain is configured, so any network attempt would fail.
    let got = handle.invoke("ping", json!({"n": 1})).await.unwrap();
    assert_eq!(got, json!({"pong": {"n": 1}, "prefix": "~"}));

    let named = ServiceHandle::connect(&desc(), Some(&factory), || Arc::new(Echo::new("~")) as Arc<dyn Invoke>).unwrap();
    assert!(named.is_remote());
    assert_eq!(named.methods(), desc().methods());
    let without_factory = ServiceHandle::connect(&desc(), None, || Arc::new(Echo::new("~")) as Arc<dyn Invoke>).unwrap();
    assert!(!without_factory.is_remote());
}

fn factory_for(addr: SocketAddr, timeout: Duration) -> ProxyFactory {
    let client = reqwest::Client::builder().timeout(timeout).resolve("echo.kite.test", addr).build().unwrap();
    let cfg = KiteConfig {
        ingress_domain: Some(format!("kite.test:{}", addr.port())),
        rpc_scheme: "http".to_string(),
        ..KiteConfig::default()
    };
    ProxyFactory::with_client(client, &cfg)
}

#[tokio::test]
async fn unreachable_service_is_a_transport_error() {
    let addr = {
        let gone = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        gone.local_addr().unwrap()
    };
    let proxy = factory_for(addr, Duration::from_secs(5)).proxy(&desc()).unwrap();
    let err = proxy.invoke("ping", json!(1)).await.unwrap_err();
    match &err {
        RpcError::Transport(e) => assert!(!e.is_timeout(), "{e}"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.remote_error().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_method_hits_the_client_timeout() {
    let cfg = KiteConfig { listen_addr: "127.0.0.1:0".parse().unwrap(), ..KiteConfig::default() };
    let harness = Harness::bind(&desc(), |_| Ok(Arc::new(Echo::new("")) as Arc<dyn Invoke>), &cfg).await.unwrap();
    let addr = harness.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(harness.run_until(async move {
        let _ = stop_rx.await;
    }));

    let factory = factory_for(addr, Duration::from_millis(100));
    let proxy = factory.proxy(&desc()).unwrap();
    // The deadline is per request; a fast method on the same proxy still succeeds.
    assert_eq!(proxy.invoke("echo", json!(7)).await.unwrap(), json!(7));
    let err = proxy.invoke("slow", json!(1)).await.unwrap_err();
    match &err {
        RpcError::Transport(e) => assert!(e.is_timeout(), "{e}"),
        other => panic!("unexpected error: {other}"),
    }

    drop(proxy);
    drop(factory);
    let _ = stop_tx.send(());
    server.await.unwrap().unwrap();
}
