//! Application configuration loaded from environment.

use std::net::SocketAddr;
use std::time::Duration;

/// Application configuration loaded from `.env` and environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g. `0.0.0.0:4000`).
    pub server_addr: SocketAddr,
    /// Secret used to sign session tokens handed to the browser.
    pub session_secret: String,
    /// Key required in `x-app-key` by the HTTP broadcast endpoint.
    pub app_key: String,
    /// Redis URL. When set, pub/sub fans out through Redis instead of in-process.
    pub redis_url: Option<String>,
    /// Close a socket that sends nothing (not even a heartbeat) for this long.
    pub heartbeat_timeout: Duration,
    /// Log level: `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment. Call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let server_addr = std::env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:4000".to_string());
        let server_addr: SocketAddr = server_addr
            .parse()
            .map_err(|_| ConfigLoadError::InvalidServerAddr)?;

        let session_secret = std::env::var("SESSION_SECRET")
            .unwrap_or_else(|_| "liveview_session_secret_change_in_production".to_string());
        let app_key = std::env::var("APP_KEY").unwrap_or_else(|_| "liveview_key".to_string());
        let redis_url = std::env::var("REDIS_URL").ok().filter(|u| !u.is_empty());

        let heartbeat_timeout = match std::env::var("HEARTBEAT_TIMEOUT_SECS") {
            Ok(raw) => raw
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigLoadError::InvalidHeartbeatTimeout(raw))?,
            Err(_) => Duration::from_secs(60),
        };
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            server_addr,
            session_secret,
            app_key,
            redis_url,
            heartbeat_timeout,
            log_level,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Invalid SERVER_ADDR")]
    InvalidServerAddr,

    #[error("Invalid HEARTBEAT_TIMEOUT_SECS: {0}")]
    InvalidHeartbeatTimeout(String),
}
