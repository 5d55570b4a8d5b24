use clap::Parser;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Paths owned by the HTTP surface; the signaling path may not shadow them.
const RESERVED_PATHS: &[&str] = &["/", "/healthz", "/config", "/metrics"];

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "beamd")]
#[command(about = "beam signaling relay server")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on for HTTP and WebSocket traffic.
    #[arg(long, default_value = "0.0.0.0:8080", env = "BEAMD_LISTEN")]
    pub listen: SocketAddr,
    /// URL path accepting WebSocket upgrades.
    #[arg(long, default_value = "/ws", env = "BEAMD_WS_PATH")]
    pub ws_path: String,
    /// Comma-separated exact-origin allowlist. Mandatory in production.
    #[arg(long, env = "BEAMD_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,
    /// Production mode. Requires an origin allowlist.
    #[arg(long, env = "BEAMD_PRODUCTION")]
    pub production: bool,
    /// ICE server list as a JSON array, passed verbatim to clients.
    #[arg(long, default_value = "[]", env = "BEAMD_ICE_SERVERS")]
    pub ice_servers: String,
    /// Maximum total concurrent connections.
    #[arg(long, default_value_t = 65_536, env = "BEAMD_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value_t = 16, env = "BEAMD_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Expose the /metrics endpoint.
    #[arg(long, env = "BEAMD_METRICS_ENABLED")]
    pub metrics_enabled: bool,
    /// Bearer token required by /metrics when set.
    #[arg(long, env = "BEAMD_METRICS_TOKEN")]
    pub metrics_token: Option<String>,
    /// Token bucket refill rate, tokens per second per connection.
    #[arg(long, default_value_t = 10.0, env = "BEAMD_MSG_RATE")]
    pub msg_rate: f64,
    /// Token bucket capacity (burst) per connection.
    #[arg(long, default_value_t = 30, env = "BEAMD_MSG_BURST")]
    pub msg_burst: u32,
    /// HTTP rate-limit window in seconds.
    #[arg(long, default_value_t = 60, env = "BEAMD_HTTP_WINDOW")]
    pub http_window: u64,
    /// Maximum static asset requests per window per IP.
    #[arg(long, default_value_t = 300, env = "BEAMD_STATIC_MAX")]
    pub static_max: u32,
    /// Maximum /config requests per window per IP.
    #[arg(long, default_value_t = 60, env = "BEAMD_CONFIG_MAX")]
    pub config_max: u32,
    /// Optional directory of static assets.
    #[arg(long, env = "BEAMD_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,
    /// Redis URL. Enables the cross-instance bus.
    #[arg(long, env = "BEAMD_REDIS_URL")]
    pub redis_url: Option<String>,
    /// Key and channel prefix on the bus.
    #[arg(long, default_value = "beam:", env = "BEAMD_REDIS_PREFIX")]
    pub redis_prefix: String,
    /// Instance identity on the bus. Random when omitted.
    #[arg(long, env = "BEAMD_NODE_ID")]
    pub node_id: Option<String>,
    /// Connection idle window in seconds.
    #[arg(long, default_value_t = 60, env = "BEAMD_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Heartbeat sweep period in seconds.
    #[arg(long, default_value_t = 30, env = "BEAMD_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Log severity filter.
    #[arg(long, default_value = "info", env = "BEAMD_LOG_LEVEL")]
    pub log_level: String,
    /// Emit Strict-Transport-Security on every response.
    #[arg(long, env = "BEAMD_HSTS")]
    pub hsts: bool,
    /// HSTS max-age in seconds.
    #[arg(long, default_value_t = 31_536_000, env = "BEAMD_HSTS_MAX_AGE")]
    pub hsts_max_age: u64,
}

/// Frozen runtime configuration derived from [`Args`].
///
/// Built once at startup; every component reads this record and nothing
/// reads the environment afterwards.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// URL path accepting WebSocket upgrades.
    pub ws_path: String,
    /// Exact-origin allowlist; empty means host matching applies.
    pub allowed_origins: Vec<String>,
    /// Production mode.
    pub production: bool,
    /// Parsed ICE server list served via /config.
    pub ice_servers: Value,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Expose the /metrics endpoint.
    pub metrics_enabled: bool,
    /// Bearer token required by /metrics when set.
    pub metrics_token: Option<String>,
    /// Token bucket refill rate, tokens per second.
    pub msg_rate: f64,
    /// Token bucket capacity.
    pub msg_burst: u32,
    /// HTTP rate-limit window in seconds.
    pub http_window: u64,
    /// Static asset requests per window per IP.
    pub static_max: u32,
    /// /config requests per window per IP.
    pub config_max: u32,
    /// Optional directory of static assets.
    pub static_dir: Option<PathBuf>,
    /// Redis URL; `Some` enables the cross-instance bus.
    pub redis_url: Option<String>,
    /// Key and channel prefix on the bus.
    pub redis_prefix: String,
    /// Instance identity on the bus.
    pub node_id: String,
    /// Connection idle window in seconds.
    pub idle_timeout: u64,
    /// Heartbeat sweep period in seconds.
    pub ping_interval: u64,
    /// Log severity filter.
    pub log_level: String,
    /// Emit Strict-Transport-Security on every response.
    pub hsts: bool,
    /// HSTS max-age in seconds.
    pub hsts_max_age: u64,
}

impl ServerConfig {
    /// Converts parsed arguments into a runtime configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the malformed option when the ICE server
    /// list is not valid JSON.
    pub fn from_args(args: Args) -> Result<Self, String> {
        let ice_servers: Value = serde_json::from_str(&args.ice_servers)
            .map_err(|e| format!("ice_servers is not valid JSON: {e}"))?;

        let allowed_origins: Vec<String> = args
            .allowed_origins
            .iter()
            .map(|o| o.trim().trim_end_matches('/').to_string())
            .filter(|o| !o.is_empty())
            .collect();

        let node_id = args
            .node_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(beam_common::code::mint);

        Ok(Self {
            listen: args.listen,
            ws_path: args.ws_path,
            allowed_origins,
            production: args.production,
            ice_servers,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            metrics_enabled: args.metrics_enabled,
            metrics_token: args.metrics_token,
            msg_rate: args.msg_rate,
            msg_burst: args.msg_burst,
            http_window: args.http_window,
            static_max: args.static_max,
            config_max: args.config_max,
            static_dir: args.static_dir,
            redis_url: args.redis_url,
            redis_prefix: args.redis_prefix,
            node_id,
            idle_timeout: args.idle_timeout,
            ping_interval: args.ping_interval,
            log_level: args.log_level,
            hsts: args.hsts,
            hsts_max_age: args.hsts_max_age,
        })
    }

    /// Validates the configuration values are within acceptable bounds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if !self.ws_path.starts_with('/') {
            return Err("ws_path must start with '/'".to_string());
        }
        if RESERVED_PATHS.contains(&self.ws_path.as_str()) {
            return Err(format!("ws_path may not shadow {}", self.ws_path));
        }

        if self.production && self.allowed_origins.is_empty() {
            return Err("production mode requires allowed_origins".to_string());
        }

        if !self.ice_servers.is_array() {
            return Err("ice_servers must be a JSON array".to_string());
        }

        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        // A refill rate of zero is legal (pure burst budget); the capacity
        // is what must be positive.
        if !self.msg_rate.is_finite() || self.msg_rate < 0.0 {
            return Err("msg_rate must be a non-negative number".to_string());
        }
        if self.msg_burst == 0 {
            return Err("msg_burst must be greater than 0".to_string());
        }

        if self.http_window == 0 {
            return Err("http_window must be greater than 0".to_string());
        }
        if self.static_max == 0 {
            return Err("static_max must be greater than 0".to_string());
        }
        if self.config_max == 0 {
            return Err("config_max must be greater than 0".to_string());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err("idle_timeout exceeds reasonable limit (86400 seconds)".to_string());
        }
        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3_600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.redis_prefix.is_empty() {
            return Err("redis_prefix must not be empty".to_string());
        }

        if self.hsts && self.hsts_max_age == 0 {
            return Err("hsts_max_age must be greater than 0 when hsts is enabled".to_string());
        }

        Ok(())
    }
}

/// A permissive configuration for unit tests.
#[cfg(test)]
pub(crate) fn test_config() -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:8080".parse().unwrap(),
        ws_path: "/ws".to_string(),
        allowed_origins: vec![],
        production: false,
        ice_servers: serde_json::json!([]),
        max_conns: 1000,
        max_conns_ip: 16,
        msg_rate: 10.0,
        msg_burst: 30,
        metrics_enabled: false,
        metrics_token: None,
        http_window: 60,
        static_max: 300,
        config_max: 60,
        static_dir: None,
        redis_url: None,
        redis_prefix: "beam:".to_string(),
        node_id: "node-test".to_string(),
        idle_timeout: 60,
        ping_interval: 30,
        log_level: "info".to_string(),
        hsts: false,
        hsts_max_age: 31_536_000,
    }
}
