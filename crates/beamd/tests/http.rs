mod common;

use common::{start_server_with_config, test_config};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[tokio::test]
async fn healthz_answers_plaintext_ok() {
    let (addr, _state) = start_server_with_config(test_config()).await;

    let response = reqwest::get(format!("http://{addr}/healthz"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn root_document_is_never_cached() {
    let (addr, _state) = start_server_with_config(test_config()).await;

    let response = reqwest::get(format!("http://{addr}/")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "no-store"
    );
}

#[tokio::test]
async fn config_exposes_ws_path_and_ice_servers() {
    let mut config = test_config();
    config.ice_servers = serde_json::json!([{"urls": "stun:stun.example.com:3478"}]);
    let (addr, _state) = start_server_with_config(config).await;

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/config"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["wsPath"], "/ws");
    assert_eq!(body["iceServers"][0]["urls"], "stun:stun.example.com:3478");
}

#[tokio::test]
async fn config_rate_limit_returns_429() {
    let mut config = test_config();
    config.config_max = 2;
    let (addr, _state) = start_server_with_config(config).await;

    for _ in 0..2 {
        let response = reqwest::get(format!("http://{addr}/config")).await.unwrap();
        assert_eq!(response.status(), 200);
    }
    let response = reqwest::get(format!("http://{addr}/config")).await.unwrap();
    assert_eq!(response.status(), 429);

    // The static limiter is independent of the config limiter.
    let response = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn metrics_is_masked_when_disabled() {
    let (addr, _state) = start_server_with_config(test_config()).await;

    let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn metrics_token_gates_access() {
    let mut config = test_config();
    config.metrics_enabled = true;
    config.metrics_token = Some("sekrit".to_string());
    let (addr, _state) = start_server_with_config(config).await;

    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(response.headers().get("www-authenticate").unwrap(), "Bearer");

    let response = client
        .get(format!("http://{addr}/metrics"))
        .header("authorization", "Bearer wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn hsts_header_is_emitted_when_enabled() {
    let mut config = test_config();
    config.hsts = true;
    config.hsts_max_age = 63_072_000;
    let (addr, _state) = start_server_with_config(config).await;

    let response = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(
        response.headers().get("strict-transport-security").unwrap(),
        "max-age=63072000"
    );
}

fn scratch_asset_dir() -> std::path::PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("beamd-assets-{}-{unique}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[tokio::test]
async fn static_assets_carry_the_caching_contract() {
    let dir = scratch_asset_dir();
    std::fs::write(dir.join("app.js"), b"console.log('beam');").unwrap();

    let mut config = test_config();
    config.static_dir = Some(dir.clone());
    let (addr, _state) = start_server_with_config(config).await;

    let response = reqwest::get(format!("http://{addr}/app.js")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "public, max-age=86400"
    );
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/javascript"
    );
    assert!(response.headers().get("last-modified").is_some());
    let etag = response
        .headers()
        .get("etag")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(etag.starts_with('"') && etag.ends_with('"'));
    assert_eq!(response.text().await.unwrap(), "console.log('beam');");

    // A matching validator short-circuits to 304.
    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/app.js"))
        .header("if-none-match", &etag)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 304);

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn static_requests_outside_the_root_are_rejected() {
    let dir = scratch_asset_dir();
    std::fs::write(dir.join("app.js"), b"x").unwrap();

    let mut config = test_config();
    config.static_dir = Some(dir.clone());
    let (addr, _state) = start_server_with_config(config).await;

    let client = reqwest::Client::new();
    for path in ["/..%2fsecret", "/.hidden", "/a//b"] {
        let response = client
            .get(format!("http://{addr}{path}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404, "{path} should be refused");
    }

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn static_rate_limit_is_separate_from_config() {
    let dir = scratch_asset_dir();
    std::fs::write(dir.join("app.js"), b"x").unwrap();

    let mut config = test_config();
    config.static_dir = Some(dir.clone());
    config.static_max = 1;
    let (addr, _state) = start_server_with_config(config).await;

    let first = reqwest::get(format!("http://{addr}/app.js")).await.unwrap();
    assert_eq!(first.status(), 200);
    let second = reqwest::get(format!("http://{addr}/app.js")).await.unwrap();
    assert_eq!(second.status(), 429);

    // /config has its own budget.
    let response = reqwest::get(format!("http://{addr}/config")).await.unwrap();
    assert_eq!(response.status(), 200);

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn unknown_paths_return_404() {
    let (addr, _state) = start_server_with_config(test_config()).await;

    let response = reqwest::get(format!("http://{addr}/nope")).await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn metrics_renders_exposition_when_enabled() {
    let mut config = test_config();
    config.metrics_enabled = true;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut state = beamd::ServerState::new(config);
    state.prometheus = Some(beamd::metrics::install_recorder().unwrap());
    let state = std::sync::Arc::new(state);
    tokio::spawn(beamd::run(listener, state));
    tokio::time::sleep(Duration::from_millis(50)).await;

    beamd::metrics::counters::signals_total("offer");

    let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("ws_signals_total"));
}
