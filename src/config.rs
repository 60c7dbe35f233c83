use std::env;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub twitch: TwitchConfig,
    pub eventsub: EventSubConfig,
    pub gate: GateConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin of the soundboard UI, when it is served from somewhere other
    /// than the control API itself. Read from `ALLOWED_ORIGIN`.
    pub allowed_origin: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub topic_config_path: PathBuf,
    pub mappings_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwitchConfig {
    pub helix_url: String,
    pub eventsub_ws_url: String,
    pub irc_addr: String,
    /// Optional credentials used to auto-connect at start-up.
    pub access_token: Option<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventSubConfig {
    pub follower_poll_interval_seconds: u64,
    /// Delay before the single confirmatory re-list after an ambiguous create.
    pub create_confirm_delay_ms: u64,
    pub subscription_page_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    pub sub_tier_cache_ttl_seconds: u64,
    pub badge_ttl_seconds: u64,
    /// When true a `follower` requirement is also met by subscribers, VIPs
    /// and moderators.
    pub follower_accepts_elevated: bool,
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: env::var("PORT")
                    .unwrap_or_else(|_| defaults.server.port.to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                allowed_origin: env_non_empty("ALLOWED_ORIGIN"),
            },
            storage: StorageConfig {
                topic_config_path: env::var("TOPIC_CONFIG_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.topic_config_path),
                mappings_path: env::var("MAPPINGS_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.mappings_path),
            },
            twitch: TwitchConfig {
                helix_url: env::var("TWITCH_HELIX_URL").unwrap_or(defaults.twitch.helix_url),
                eventsub_ws_url: env::var("TWITCH_EVENTSUB_WS_URL")
                    .unwrap_or(defaults.twitch.eventsub_ws_url),
                irc_addr: env::var("TWITCH_IRC_ADDR").unwrap_or(defaults.twitch.irc_addr),
                access_token: env_non_empty("TWITCH_ACCESS_TOKEN"),
                client_id: env_non_empty("TWITCH_CLIENT_ID"),
                username: env_non_empty("TWITCH_USERNAME"),
            },
            eventsub: EventSubConfig {
                follower_poll_interval_seconds: env::var("FOLLOWER_POLL_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .map_err(|_| {
                        ConfigError::InvalidValue("FOLLOWER_POLL_INTERVAL_SECONDS".to_string())
                    })?,
                create_confirm_delay_ms: env::var("CREATE_CONFIRM_DELAY_MS")
                    .unwrap_or_else(|_| "1500".to_string())
                    .parse()
                    .unwrap_or(1500),
                subscription_page_size: env::var("SUBSCRIPTION_PAGE_SIZE")
                    .unwrap_or_else(|_| "100".to_string())
                    .parse::<u32>()
                    .map(|n| n.clamp(1, 100))
                    .unwrap_or(100),
            },
            gate: GateConfig {
                sub_tier_cache_ttl_seconds: env::var("SUB_TIER_CACHE_TTL_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
                badge_ttl_seconds: env::var("BADGE_TTL_SECONDS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .unwrap_or(3600),
                follower_accepts_elevated: env_flag("FOLLOWER_ACCEPTS_ELEVATED", true),
            },
        })
    }

    /// Credentials supplied through the environment, if all three are present.
    pub fn startup_credentials(&self) -> Option<(String, String, String)> {
        match (
            &self.twitch.username,
            &self.twitch.access_token,
            &self.twitch.client_id,
        ) {
            (Some(user), Some(token), Some(client_id)) => {
                Some((user.clone(), token.clone(), client_id.clone()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8787,
                allowed_origin: None,
            },
            storage: StorageConfig {
                topic_config_path: PathBuf::from("data/tc_config.json"),
                mappings_path: PathBuf::from("data/event_mappings.json"),
            },
            twitch: TwitchConfig {
                helix_url: "https://api.twitch.tv/helix".to_string(),
                eventsub_ws_url: "wss://eventsub.wss.twitch.tv/ws".to_string(),
                irc_addr: "irc.chat.twitch.tv:6697".to_string(),
                access_token: None,
                client_id: None,
                username: None,
            },
            eventsub: EventSubConfig {
                follower_poll_interval_seconds: 30,
                create_confirm_delay_ms: 1500,
                subscription_page_size: 100,
            },
            gate: GateConfig {
                sub_tier_cache_ttl_seconds: 60,
                badge_ttl_seconds: 3600,
                follower_accepts_elevated: true,
            },
        }
    }
}
