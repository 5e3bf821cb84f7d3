use std::time::Duration;

use serde::Deserialize;

/// Top-level server configuration, loaded from `studyroom.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Origins allowed by CORS. Empty means any origin.
    pub allowed_origins: Vec<String>,
    pub limits: LimitsConfig,
    pub rooms: RoomsConfig,
    pub history: HistoryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            allowed_origins: Vec::new(),
            limits: LimitsConfig::default(),
            rooms: RoomsConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

/// Infrastructure limits (connection caps, buffer sizes, rate limits).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_ws_connections: usize,
    /// Maximum concurrent WebSocket connections per IP address.
    pub max_ws_per_ip: usize,
    pub max_sse_subscribers: usize,
    /// Inbound command rate per connection (token bucket refill).
    pub ws_rate_limit_per_sec: f64,
    /// Outbound queue depth per connection. Slow clients drop frames past this.
    pub connection_message_buffer: usize,
    /// API endpoint rate limit: max burst tokens per IP.
    pub api_rate_limit_burst: usize,
    /// API endpoint rate limit: token refill rate (requests per second) per IP.
    pub api_rate_limit_per_sec: f64,
    pub request_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ws_connections: 500,
            max_ws_per_ip: 10,
            max_sse_subscribers: 100,
            ws_rate_limit_per_sec: 20.0,
            connection_message_buffer: 256,
            api_rate_limit_burst: 20,
            api_rate_limit_per_sec: 2.0, // ~120 req/min
            request_timeout_secs: 10,
        }
    }
}

/// Room lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoomsConfig {
    /// Roster cap per room. 0 means unbounded.
    pub max_participants: usize,
    pub idle_timeout_secs: u64,
    pub idle_check_interval_secs: u64,
    /// How long an ended room stays readable before eviction.
    pub ended_room_ttl_secs: u64,
    /// Minimum gap between progress snapshots for one participant.
    pub progress_broadcast_interval_ms: u64,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            max_participants: 16,
            idle_timeout_secs: 1800,
            idle_check_interval_secs: 30,
            ended_room_ttl_secs: 300,
            progress_broadcast_interval_ms: 1000,
        }
    }
}

impl RoomsConfig {
    pub fn capacity(&self) -> Option<usize> {
        (self.max_participants > 0).then_some(self.max_participants)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs)
    }

    pub fn ended_room_ttl(&self) -> Duration {
        Duration::from_secs(self.ended_room_ttl_secs)
    }

    pub fn progress_broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.progress_broadcast_interval_ms)
    }
}

/// Match history persistence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// JSON-lines file for durable match records. `None` keeps history in
    /// memory only.
    pub path: Option<String>,
    /// Records kept in memory for the read API.
    pub max_in_memory: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub broadcast_capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_in_memory: 1000,
            retry_attempts: 5,
            retry_base_delay_ms: 200,
            broadcast_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Validate configuration. Logs every problem, then exits if there
    /// were any.
    pub fn validate(&self) {
        let problems = self.problems();
        for problem in &problems {
            tracing::error!("{problem}");
        }
        if !problems.is_empty() {
            std::process::exit(1);
        }

        if self.rooms.max_participants == 0 {
            tracing::warn!("rooms.max_participants is 0: rosters are unbounded");
        }
        if self.history.path.is_none() {
            tracing::warn!("history.path not set: match records are kept in memory only");
        }
    }

    /// Invalid numeric settings, as human-readable messages.
    pub fn problems(&self) -> Vec<&'static str> {
        let mut problems = Vec::new();
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            problems.push("listen_addr is not a valid socket address");
        }
        if self.limits.max_ws_connections == 0 {
            problems.push("limits.max_ws_connections must be > 0");
        }
        if self.limits.max_ws_per_ip == 0 {
            problems.push("limits.max_ws_per_ip must be > 0");
        }
        if self.limits.max_sse_subscribers == 0 {
            problems.push("limits.max_sse_subscribers must be > 0");
        }
        if self.limits.ws_rate_limit_per_sec <= 0.0 {
            problems.push("limits.ws_rate_limit_per_sec must be > 0");
        }
        if self.limits.connection_message_buffer == 0 {
            problems.push("limits.connection_message_buffer must be > 0");
        }
        if self.limits.api_rate_limit_burst == 0 {
            problems.push("limits.api_rate_limit_burst must be > 0");
        }
        if self.limits.request_timeout_secs == 0 {
            problems.push("limits.request_timeout_secs must be > 0");
        }
        if self.rooms.idle_timeout_secs == 0 {
            problems.push("rooms.idle_timeout_secs must be > 0");
        }
        if self.rooms.idle_check_interval_secs == 0 {
            problems.push("rooms.idle_check_interval_secs must be > 0");
        }
        if self.history.max_in_memory == 0 {
            problems.push("history.max_in_memory must be > 0");
        }
        if self.history.retry_attempts == 0 {
            problems.push("history.retry_attempts must be > 0");
        }
        if self.history.broadcast_capacity == 0 {
            problems.push("history.broadcast_capacity must be > 0");
        }
        problems
    }

    /// Load config from `studyroom.toml` (or `STUDYROOM_CONFIG`) if it
    /// exists, then apply env var overrides.
    pub fn load() -> Self {
        let path =
            std::env::var("STUDYROOM_CONFIG").unwrap_or_else(|_| "studyroom.toml".to_string());
        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "Loaded configuration");
                    cfg
                },
                Err(e) => {
                    tracing::warn!(path = %path, "Failed to parse config: {e}, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!(path = %path, "No config file found, using defaults");
                ServerConfig::default()
            },
        };

        if let Ok(addr) = std::env::var("STUDYROOM_LISTEN_ADDR")
            && !addr.is_empty()
        {
            config.listen_addr = addr;
        }
        if let Ok(path) = std::env::var("STUDYROOM_HISTORY_PATH")
            && !path.is_empty()
        {
            config.history.path = Some(path);
        }
        if let Ok(val) = std::env::var("STUDYROOM_MAX_PARTICIPANTS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.rooms.max_participants = n;
        }
        if let Ok(val) = std::env::var("STUDYROOM_IDLE_TIMEOUT_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.rooms.idle_timeout_secs = n;
        }
        if let Ok(val) = std::env::var("STUDYROOM_MAX_WS_CONNECTIONS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.limits.max_ws_connections = n;
        }
        if let Ok(val) = std::env::var("STUDYROOM_WS_RATE_LIMIT")
            && let Ok(n) = val.parse::<f64>()
        {
            config.limits.ws_rate_limit_per_sec = n;
        }

        config
    }
}
