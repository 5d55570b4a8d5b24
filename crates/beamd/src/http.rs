use crate::server::ServerState;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// Root document served when no static directory is configured.
const INDEX_HTML: &str = include_str!("../static/index.html");

/// Cache lifetime for on-disk assets.
const ASSET_MAX_AGE: &str = "public, max-age=86400";

/// Builds the HTTP surface, including the WebSocket route at the
/// configured signaling path.
pub fn router(state: Arc<ServerState>) -> Router {
    let ws_path = state.config.ws_path.clone();
    let hsts = state.config.hsts.then(|| {
        HeaderValue::try_from(format!("max-age={}", state.config.hsts_max_age)).ok()
    });

    let mut router = Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route("/config", get(runtime_config))
        .route("/metrics", get(metrics))
        .route(&ws_path, get(crate::connection::ws_handler))
        .fallback(static_asset)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if let Some(Some(value)) = hsts {
        router = router.layer(SetResponseHeaderLayer::overriding(
            header::STRICT_TRANSPORT_SECURITY,
            value,
        ));
    }
    router
}

/// Resolves the client IP, preferring forwarded-for headers set by a
/// trusted proxy over the socket address.
pub(crate) fn client_ip(headers: &HeaderMap, peer_addr: SocketAddr) -> IpAddr {
    headers
        .get("cf-connecting-ip")
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip())
}

/// `GET /` — the root document is never cached.
async fn index(State(state): State<Arc<ServerState>>) -> Response {
    let body = match &state.config.static_dir {
        Some(dir) => tokio::fs::read_to_string(dir.join("index.html"))
            .await
            .unwrap_or_else(|_| INDEX_HTML.to_string()),
        None => INDEX_HTML.to_string(),
    };
    ([(header::CACHE_CONTROL, "no-store")], Html(body)).into_response()
}

/// `GET /healthz`.
async fn healthz() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct RuntimeConfig<'a> {
    #[serde(rename = "wsPath")]
    ws_path: &'a str,
    #[serde(rename = "iceServers")]
    ice_servers: &'a Value,
}

/// `GET /config` — the signaling path and ICE servers clients depend on.
async fn runtime_config(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, peer_addr);
    if !state.config_limiter.check(ip) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    Json(RuntimeConfig {
        ws_path: &state.config.ws_path,
        ice_servers: &state.config.ice_servers,
    })
    .into_response()
}

/// `GET /metrics` — absent unless enabled; bearer-gated when a token is
/// configured. 404 masks the endpoint's presence.
async fn metrics(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if !state.config.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    if let Some(expected) = &state.config.metrics_token {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
            )
                .into_response();
        }
    }

    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Fallback handler: cacheable static assets from the configured
/// directory, with strong ETags and conditional-request support.
async fn static_asset(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::NOT_FOUND.into_response();
    }

    let ip = client_ip(&headers, peer_addr);
    if !state.static_limiter.check(ip) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let Some(dir) = &state.config.static_dir else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(relative) = sanitize_path(uri.path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let path = dir.join(&relative);
    let Ok(body) = tokio::fs::read(&path).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let modified = tokio::fs::metadata(&path)
        .await
        .ok()
        .and_then(|m| m.modified().ok());

    let etag = format!("\"{}\"", hex::encode(Sha256::digest(&body)));

    if not_modified(&headers, &etag, modified) {
        return (
            StatusCode::NOT_MODIFIED,
            [(header::ETAG, etag), (header::CACHE_CONTROL, ASSET_MAX_AGE.to_string())],
        )
            .into_response();
    }

    let mut response_headers = vec![
        (header::CACHE_CONTROL, ASSET_MAX_AGE.to_string()),
        (header::ETAG, etag),
        (header::CONTENT_TYPE, content_type(&relative).to_string()),
    ];
    if let Some(modified) = modified {
        response_headers.push((header::LAST_MODIFIED, httpdate::fmt_http_date(modified)));
    }

    let mut response = (StatusCode::OK, body).into_response();
    for (name, value) in response_headers {
        if let Ok(value) = HeaderValue::try_from(value) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

/// Evaluates `If-None-Match` (preferred) and `If-Modified-Since`.
fn not_modified(headers: &HeaderMap, etag: &str, modified: Option<SystemTime>) -> bool {
    if let Some(candidates) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        return candidates.split(',').any(|c| c.trim() == etag);
    }
    if let (Some(since), Some(modified)) = (
        headers
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok()),
        modified,
    ) {
        // HTTP dates have whole-second precision.
        if let Ok(age) = modified.duration_since(since) {
            return age.as_secs() == 0;
        }
        return true;
    }
    false
}

/// Normalizes a request path into a safe relative path, rejecting
/// traversal and hidden files.
fn sanitize_path(path: &str) -> Option<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let mut clean = PathBuf::new();
    for component in trimmed.split('/') {
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.starts_with('.')
            || component.contains('\\')
        {
            return None;
        }
        clean.push(component);
    }
    Some(clean)
}

/// Content type by extension; assets this relay serves are a small,
/// known set.
fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        Some("webmanifest") => "application/manifest+json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_cf_header() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", "203.0.113.9".parse().unwrap());
        headers.insert("x-forwarded-for", "198.51.100.1".parse().unwrap());
        let addr: SocketAddr = "10.0.0.1:1234".parse().unwrap();
        assert_eq!(
            client_ip(&headers, addr),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn client_ip_takes_first_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "198.51.100.1, 203.0.113.9".parse().unwrap(),
        );
        let addr: SocketAddr = "10.0.0.1:1234".parse().unwrap();
        assert_eq!(
            client_ip(&headers, addr),
            "198.51.100.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn client_ip_falls_back_to_socket_address() {
        let addr: SocketAddr = "10.0.0.1:1234".parse().unwrap();
        assert_eq!(
            client_ip(&HeaderMap::new(), addr),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn sanitize_accepts_plain_assets() {
        assert_eq!(
            sanitize_path("/app.js"),
            Some(PathBuf::from("app.js"))
        );
        assert_eq!(
            sanitize_path("/assets/logo.svg"),
            Some(PathBuf::from("assets/logo.svg"))
        );
    }

    #[test]
    fn sanitize_rejects_traversal() {
        assert_eq!(sanitize_path("/../etc/passwd"), None);
        assert_eq!(sanitize_path("/a/../../b"), None);
        assert_eq!(sanitize_path("/a//b"), None);
        assert_eq!(sanitize_path("/.hidden"), None);
        assert_eq!(sanitize_path("/"), None);
        assert_eq!(sanitize_path("/a\\b"), None);
    }

    #[test]
    fn content_types_cover_the_asset_set() {
        assert_eq!(
            content_type(&PathBuf::from("app.js")),
            "text/javascript"
        );
        assert_eq!(
            content_type(&PathBuf::from("style.css")),
            "text/css"
        );
        assert_eq!(
            content_type(&PathBuf::from("unknown.bin")),
            "application/octet-stream"
        );
    }

    #[test]
    fn etag_match_short_circuits_modified_check() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, "\"abc\"".parse().unwrap());
        assert!(not_modified(&headers, "\"abc\"", None));
        assert!(!not_modified(&headers, "\"def\"", None));
    }

    #[test]
    fn modified_since_honors_second_precision() {
        let now = SystemTime::now();
        let formatted = httpdate::fmt_http_date(now);
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_MODIFIED_SINCE, formatted.parse().unwrap());
        assert!(not_modified(&headers, "\"x\"", Some(now)));
    }
}
