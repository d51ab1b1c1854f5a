//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// CRM server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    // =========================================================================
    // Server
    // =========================================================================
    /// REST + WebSocket bind address
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Allowed CORS origins
    #[serde(default = "default_cors_origins")]
    pub cors_allowed_origins: Vec<String>,

    /// Enable debug mode (log raw webhook payloads)
    #[serde(default)]
    pub debug_mode: bool,

    // =========================================================================
    // Storage
    // =========================================================================
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Fernet key used to encrypt secret columns
    pub encryption_key: String,

    /// Directory for uploaded and downloaded media
    #[serde(default = "default_media_root")]
    pub media_root: PathBuf,

    /// URL prefix media files are served under
    #[serde(default = "default_media_url")]
    pub media_url: String,

    /// Public origin used to build media links Meta can download
    pub public_base_url: Option<String>,

    // =========================================================================
    // Meta Graph API
    // =========================================================================
    /// Graph API root, including version
    #[serde(default = "default_graph_api_base")]
    pub graph_api_base: String,

    /// App secret for `X-Hub-Signature-256` verification (optional)
    pub meta_app_secret: Option<String>,

    // =========================================================================
    // Task queue
    // =========================================================================
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_task_max_retries")]
    pub task_max_retries: u32,

    #[serde(default = "default_task_retry_delay")]
    pub task_retry_delay_secs: u64,

    #[serde(default = "default_task_time_limit")]
    pub task_time_limit_secs: u64,

    // =========================================================================
    // Auth
    // =========================================================================
    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: i64,

    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: i64,
}

fn default_http_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://127.0.0.1:5173".to_string(),
        "https://open-wa-crm.vercel.app".to_string(),
    ]
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/crm.sqlite3")
}

fn default_media_root() -> PathBuf {
    PathBuf::from("media")
}

fn default_media_url() -> String {
    "/media/".to_string()
}

fn default_graph_api_base() -> String {
    "https://graph.facebook.com/v18.0".to_string()
}

fn default_worker_count() -> usize {
    4
}

fn default_task_max_retries() -> u32 {
    3
}

fn default_task_retry_delay() -> u64 {
    60
}

fn default_task_time_limit() -> u64 {
    30 * 60
}

fn default_access_ttl() -> i64 {
    60 * 60
}

fn default_refresh_ttl() -> i64 {
    7 * 24 * 60 * 60
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl CrmConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let encryption_key =
            std::env::var("ENCRYPTION_KEY").context("ENCRYPTION_KEY is required")?;

        Ok(Self {
            http_addr: std::env::var("HTTP_ADDR").unwrap_or_else(|_| default_http_addr()),
            cors_allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                .ok()
                .map(|s| {
                    s.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_else(default_cors_origins),
            debug_mode: std::env::var("DEBUG_MODE").is_ok(),

            database_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_database_path()),
            encryption_key,
            media_root: std::env::var("MEDIA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_media_root()),
            media_url: std::env::var("MEDIA_URL").unwrap_or_else(|_| default_media_url()),
            public_base_url: std::env::var("PUBLIC_BASE_URL").ok(),

            graph_api_base: std::env::var("GRAPH_API_BASE")
                .unwrap_or_else(|_| default_graph_api_base()),
            meta_app_secret: std::env::var("META_APP_SECRET").ok().filter(|s| !s.is_empty()),

            worker_count: env_parse("WORKER_COUNT").unwrap_or_else(default_worker_count),
            task_max_retries: env_parse("TASK_MAX_RETRIES")
                .unwrap_or_else(default_task_max_retries),
            task_retry_delay_secs: env_parse("TASK_RETRY_DELAY_SECS")
                .unwrap_or_else(default_task_retry_delay),
            task_time_limit_secs: env_parse("TASK_TIME_LIMIT_SECS")
                .unwrap_or_else(default_task_time_limit),

            access_token_ttl_secs: env_parse("ACCESS_TOKEN_TTL_SECS")
                .unwrap_or_else(default_access_ttl),
            refresh_token_ttl_secs: env_parse("REFRESH_TOKEN_TTL_SECS")
                .unwrap_or_else(default_refresh_ttl),
        })
    }

    /// Configuration with defaults for everything but the encryption key
    pub fn with_encryption_key(encryption_key: impl Into<String>) -> Self {
        Self {
            http_addr: default_http_addr(),
            cors_allowed_origins: default_cors_origins(),
            debug_mode: false,
            database_path: default_database_path(),
            encryption_key: encryption_key.into(),
            media_root: default_media_root(),
            media_url: default_media_url(),
            public_base_url: None,
            graph_api_base: default_graph_api_base(),
            meta_app_secret: None,
            worker_count: default_worker_count(),
            task_max_retries: default_task_max_retries(),
            task_retry_delay_secs: default_task_retry_delay(),
            task_time_limit_secs: default_task_time_limit(),
            access_token_ttl_secs: default_access_ttl(),
            refresh_token_ttl_secs: default_refresh_ttl(),
        }
    }

    pub fn task_retry_delay(&self) -> Duration {
        Duration::from_secs(self.task_retry_delay_secs)
    }

    pub fn task_time_limit(&self) -> Duration {
        Duration::from_secs(self.task_time_limit_secs)
    }

    /// Turn a served media URL into an absolute link when a public origin is configured
    pub fn absolute_media_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        match &self.public_base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                url.trim_start_matches('/')
            ),
            None => url.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_media_url() {
        let mut config = CrmConfig::with_encryption_key("k");
        assert_eq!(
            config.absolute_media_url("/media/whatsapp/a.jpg"),
            "/media/whatsapp/a.jpg"
        );

        config.public_base_url = Some("https://crm.example.com/".to_string());
        assert_eq!(
            config.absolute_media_url("/media/whatsapp/a.jpg"),
            "https://crm.example.com/media/whatsapp/a.jpg"
        );
        assert_eq!(
            config.absolute_media_url("https://cdn.example.com/x.png"),
            "https://cdn.example.com/x.png"
        );
    }

    #[test]
    fn test_defaults() {
        let config = CrmConfig::with_encryption_key("k");
        assert_eq!(config.task_max_retries, 3);
        assert_eq!(config.task_retry_delay(), Duration::from_secs(60));
        assert_eq!(config.task_time_limit(), Duration::from_secs(1800));
        assert_eq!(config.cors_allowed_origins.len(), 3);
    }
}
