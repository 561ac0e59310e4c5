use std::env;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// Base URL used to build shareable room links (e.g., https://cowrite.example)
    pub app_base_url: String,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
    /// Maximum members per room, online or offline seats (default: 8)
    pub room_capacity: usize,
    /// Chat messages retained per room (default: 100)
    pub history_limit: usize,
    /// Seconds of inactivity with nobody online before a room is destroyed (default: 1800)
    pub idle_expiry_secs: u64,
    /// Seconds between idle-room eviction scans (default: 60)
    pub eviction_interval_secs: u64,
    /// Chat messages allowed per user per rate window (default: 10)
    pub chat_rate_limit: usize,
    /// Chat rate window in seconds (default: 10)
    pub chat_rate_window_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3030".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let app_base_url =
            env::var("APP_BASE_URL").unwrap_or_else(|_| "http://localhost:5173".to_string());

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173,http://localhost:5174".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let room_capacity = env::var("ROOM_CAPACITY")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .unwrap_or(8);

        let history_limit = env::var("CHAT_HISTORY_LIMIT")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .unwrap_or(100);

        let idle_expiry_secs = env::var("ROOM_IDLE_EXPIRY_SECS")
            .unwrap_or_else(|_| "1800".to_string())
            .parse()
            .unwrap_or(1800);

        let eviction_interval_secs = env::var("EVICTION_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let chat_rate_limit = env::var("CHAT_RATE_LIMIT")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let chat_rate_window_secs = env::var("CHAT_RATE_WINDOW_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        Ok(Config {
            host,
            port,
            app_base_url,
            cors_origins,
            room_capacity,
            history_limit,
            idle_expiry_secs,
            eviction_interval_secs,
            chat_rate_limit,
            chat_rate_window_secs,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            app_base_url: "http://localhost:5173".to_string(),
            cors_origins: Vec::new(),
            room_capacity: 8,
            history_limit: 100,
            idle_expiry_secs: 1800,
            eviction_interval_secs: 60,
            chat_rate_limit: 10,
            chat_rate_window_secs: 10,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
        }
    }
}

impl std::error::Error for ConfigError {}
