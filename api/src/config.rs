use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: String,
    /// HS256 secret shared with the authentication service
    pub jwt_secret: String,
    /// How often expired guard entries and drafts are purged
    pub cleanup_interval: Duration,
    pub hub: HubConfig,
}

/// Settings consumed by the delivery core.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Lifetime of fast-path duplicate detection entries
    pub idempotency_ttl: Duration,
    pub draft_ttl: Duration,
    /// Outbound events buffered per connection before it is considered dead
    pub connection_queue_capacity: usize,
    /// Maximum message text size in bytes
    pub max_message_len: usize,
    pub history_max_limit: i64,
    /// Upper bound on unread messages pushed when a connection opens
    pub redelivery_limit: i64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(300),
            draft_ttl: Duration::from_secs(86400),
            connection_queue_capacity: 256,
            max_message_len: 4000,
            history_max_limit: 100,
            redelivery_limit: 200,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!("invalid value for {key}: {v:?}, using default");
            default
        }),
        Err(_) => default,
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = HubConfig::default();
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:murmur.db?mode=rwc".into()),
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_else(|_| "dev-secret".into()),
            cleanup_interval: Duration::from_secs(env_parse("CLEANUP_INTERVAL_SECS", 60)),
            hub: HubConfig {
                idempotency_ttl: Duration::from_secs(env_parse(
                    "IDEMPOTENCY_TTL_SECS",
                    defaults.idempotency_ttl.as_secs(),
                )),
                draft_ttl: Duration::from_secs(env_parse(
                    "DRAFT_TTL_SECS",
                    defaults.draft_ttl.as_secs(),
                )),
                connection_queue_capacity: env_parse(
                    "CONNECTION_QUEUE_CAPACITY",
                    defaults.connection_queue_capacity,
                )
                .max(1),
                max_message_len: env_parse("MAX_MESSAGE_LEN", defaults.max_message_len),
                history_max_limit: env_parse("HISTORY_MAX_LIMIT", defaults.history_max_limit)
                    .max(1),
                redelivery_limit: env_parse("REDELIVERY_LIMIT", defaults.redelivery_limit),
            },
        }
    }
}
