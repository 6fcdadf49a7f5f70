use std::collections::HashMap;
use std::net::SocketAddr;

use axum::Json;
use axum::Router;
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use serde_json::json;

use super::*;

async fn bind() -> (tokio::net::TcpListener, SocketAddr) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn serve(listener: tokio::net::TcpListener, app: Router) {
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

fn config(central: SocketAddr) -> ClientConfig {
    let mut config = ClientConfig::new("secret key");
    config.central_origin = central.to_string();
    config.discovery_scheme = "http".into();
    config.fallback_host = "fallback.test".into();
    config.discovery_timeout = Duration::from_millis(200);
    config
}

/// Central and compute-unit routes on one server; the proxy hop points back
/// at the same address.
fn discovery_app(addr: SocketAddr, public_host: Value) -> Router {
    Router::new()
        .route(
            "/v3/proxy",
            get(move |headers: HeaderMap, Query(query): Query<HashMap<String, String>>| async move {
                let authorized = headers.get("authorization").and_then(|v| v.to_str().ok())
                    == Some("Basic c2VjcmV0IGtleTo=");
                if !authorized || query.get("key").map(String::as_str) != Some("secret key") {
                    return (StatusCode::UNAUTHORIZED, Json(json!(null)));
                }
                (StatusCode::OK, Json(json!(addr.to_string())))
            }),
        )
        .route(
            "/v3/computeunit",
            get(move |Query(query): Query<HashMap<String, String>>| {
                let public_host = public_host.clone();
                async move {
                    if query.get("key").map(String::as_str) != Some("secret key") {
                        return (StatusCode::BAD_REQUEST, Json(json!({})));
                    }
                    (StatusCode::OK, Json(public_host))
                }
            }),
        )
}

#[tokio::test]
async fn explicit_host_skips_discovery() {
    let resolver = EndpointResolver::new(&ClientConfig::new("k")).unwrap();
    let endpoint = resolver.resolve(Some("ws.example.test")).await;
    assert_eq!(endpoint, Endpoint { host: "ws.example.test".into(), source: EndpointSource::Explicit });
}

#[tokio::test]
async fn two_hops_resolve_public_host() {
    let (listener, addr) = bind().await;
    serve(listener, discovery_app(addr, json!({"httpPublicHost": "cu-7.example.test"})));

    let resolver = EndpointResolver::new(&config(addr)).unwrap();
    let endpoint = resolver.resolve(None).await;

    assert_eq!(endpoint, Endpoint { host: "cu-7.example.test".into(), source: EndpointSource::Discovered });
}

#[tokio::test]
async fn missing_public_host_falls_back() {
    let (listener, addr) = bind().await;
    serve(listener, discovery_app(addr, json!({"somethingElse": true})));

    let endpoint = EndpointResolver::new(&config(addr)).unwrap().resolve(None).await;

    assert_eq!(endpoint.host, "fallback.test");
    let EndpointSource::Fallback { reason } = endpoint.source else {
        panic!("expected fallback");
    };
    assert!(reason.contains("httpPublicHost"), "{reason}");
}

#[tokio::test]
async fn non_200_from_central_falls_back() {
    let (listener, addr) = bind().await;
    serve(
        listener,
        Router::new().route("/v3/proxy", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") })),
    );

    let endpoint = EndpointResolver::new(&config(addr)).unwrap().resolve(None).await;

    assert_eq!(endpoint.host, "fallback.test");
    assert!(matches!(endpoint.source, EndpointSource::Fallback { ref reason } if reason.contains("non HTTP 200")));
}

#[tokio::test]
async fn first_hop_timeout_falls_back_without_second_hop() {
    let (listener, addr) = bind().await;
    let second_hop_hit = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let hit = std::sync::Arc::clone(&second_hop_hit);
    serve(
        listener,
        Router::new()
            .route(
                "/v3/proxy",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Json(json!("never.used"))
                }),
            )
            .route(
                "/v3/computeunit",
                get(move || {
                    hit.store(true, std::sync::atomic::Ordering::SeqCst);
                    async { Json(json!({"httpPublicHost": "nope"})) }
                }),
            ),
    );

    let started = std::time::Instant::now();
    let endpoint = EndpointResolver::new(&config(addr)).unwrap().resolve(None).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(endpoint.host, "fallback.test");
    assert!(matches!(endpoint.source, EndpointSource::Fallback { ref reason } if reason.starts_with("response timeout")));
    assert!(!second_hop_hit.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn unreachable_central_falls_back() {
    let (listener, addr) = bind().await;
    drop(listener);

    let endpoint = EndpointResolver::new(&config(addr)).unwrap().resolve(None).await;

    assert_eq!(endpoint.host, "fallback.test");
    assert!(matches!(endpoint.source, EndpointSource::Fallback { .. }));
}

#[tokio::test]
async fn discover_surfaces_the_hop_error() {
    let (listener, addr) = bind().await;
    serve(listener, Router::new().route("/v3/proxy", get(|| async { Json(json!(42)) })));

    let err = EndpointResolver::new(&config(addr)).unwrap().discover().await.unwrap_err();
    assert!(matches!(err, DiscoveryError::MissingField { field: "proxyHost", .. }));
}
