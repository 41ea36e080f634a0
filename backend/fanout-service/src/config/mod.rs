use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub redis: RedisConfig,
    pub fanout: FanoutConfig,
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Stream the post service publishes fan-out jobs to.
    pub stream: String,
    /// Consumer group name on the fan-out stream.
    pub group: String,
    /// Consumer name (instance ID) within the group.
    pub consumer_name: String,
    /// Concurrent store operations per chunk during fan-out.
    pub chunk_size: usize,
    /// Messages fetched per stream read.
    pub batch_size: usize,
    /// Attempts before a message is dead-lettered.
    pub max_attempts: u32,
    /// Exponential backoff base, seconds.
    pub retry_base_secs: u64,
    /// Backoff ceiling, seconds.
    pub retry_max_secs: u64,
    /// Idle time after which an unacked delivery is reclaimed.
    pub visibility_timeout_secs: u64,
    /// Followers fetched per graph-store page.
    pub follower_page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Entries retained per timeline; oldest beyond this are evicted.
    pub capacity: usize,
    /// Deletion tombstone retention, seconds.
    pub tombstone_ttl_secs: u64,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    var_or(key, default)
        .parse::<T>()
        .map_err(|e| AppError::Config(format!("{}: {}", key, e)))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            app: AppConfig {
                env: var_or("APP_ENV", "development"),
                port: parse_var("APP_PORT", "8000")?,
            },
            redis: RedisConfig {
                url: var_or("REDIS_URL", "redis://localhost:6379"),
            },
            fanout: FanoutConfig {
                stream: var_or("FANOUT_STREAM", event_schema::streams::FANOUT_EVENTS),
                group: var_or("FANOUT_GROUP", event_schema::streams::FANOUT_GROUP),
                consumer_name: var_or(
                    "FANOUT_CONSUMER_NAME",
                    &format!("instance-{}", uuid::Uuid::new_v4()),
                ),
                chunk_size: parse_var("FANOUT_CHUNK_SIZE", "5")?,
                batch_size: parse_var("FANOUT_BATCH_SIZE", "16")?,
                max_attempts: parse_var("FANOUT_MAX_ATTEMPTS", "8")?,
                retry_base_secs: parse_var("RETRY_BASE_SECS", "30")?,
                retry_max_secs: parse_var("RETRY_MAX_SECS", "3600")?,
                visibility_timeout_secs: parse_var("VISIBILITY_TIMEOUT_SECS", "60")?,
                follower_page_size: parse_var("FOLLOWER_PAGE_SIZE", "500")?,
            },
            feed: FeedConfig {
                capacity: parse_var("FEED_CAPACITY", "800")?,
                tombstone_ttl_secs: parse_var("TOMBSTONE_TTL_SECS", "86400")?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.fanout.chunk_size, 5);
        assert_eq!(config.fanout.retry_base_secs, 30);
        assert_eq!(config.fanout.retry_max_secs, 3600);
        assert_eq!(config.feed.capacity, 800);
        assert!(config.fanout.consumer_name.starts_with("instance-"));
    }
}
