// Runtime configuration
// Credentials come from the process environment (optionally seeded from .env),
// tunables come from the command line.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::proxy::{self, ProxyConfig};

pub const ENV_CONSUMER_KEY: &str = "CONSUMER_KEY";
pub const ENV_CONSUMER_SECRET: &str = "CONSUMER_SECRET";
pub const ENV_ACCESS_TOKEN: &str = "ACCESS_TOKEN";
pub const ENV_ACCESS_TOKEN_SECRET: &str = "ACCESS_TOKEN_SECRET";
pub const ENV_BEARER_TOKEN: &str = "BEARER_TOKEN";
pub const ENV_OAUTH2_CLIENT_ID: &str = "OAUTH2_CLIENT_ID";
pub const ENV_OAUTH2_CLIENT_SECRET: &str = "OAUTH2_CLIENT_SECRET";

pub const ENV_REDDIT_CLIENT_ID: &str = "CLIENT_ID";
pub const ENV_REDDIT_CLIENT_SECRET: &str = "CLIENT_SECRET";
pub const ENV_REDDIT_USER_AGENT: &str = "USER_AGENT";
pub const ENV_REDDIT_USERNAME: &str = "USERNAME";
pub const ENV_REDDIT_PASSWORD: &str = "PASSWORD";

pub const DEFAULT_USER_AGENT: &str = concat!("subrelay/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_SUBREDDITS: [&str; 2] = ["Overwatch", "Overwatch_Memes"];

/// Reddit caps listing requests at 100 items
pub const MAX_LISTING_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing X credentials: {}", .0.join(", "))]
    MissingTwitterCredentials(Vec<&'static str>),
    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// OAuth 1.0a user-context credentials for the X API
#[derive(Clone, PartialEq, Eq)]
pub struct TwitterCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_token_secret: String,
}

impl fmt::Debug for TwitterCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitterCredentials")
            .field("consumer_key", &redact(&self.consumer_key))
            .field("consumer_secret", &"***")
            .field("access_token", &redact(&self.access_token))
            .field("access_token_secret", &"***")
            .finish()
    }
}

/// App-only OAuth 2.0 material. Never used for signing, only reported by `check`.
#[derive(Clone, Default)]
pub struct OAuth2AppCredentials {
    pub bearer_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl fmt::Debug for OAuth2AppCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2AppCredentials")
            .field("bearer_token", &self.bearer_token.is_some())
            .field("client_id", &self.client_id.is_some())
            .field("client_secret", &self.client_secret.is_some())
            .finish()
    }
}

/// Reddit "script" app credentials for the password grant
#[derive(Clone, PartialEq, Eq)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RedditCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedditCredentials")
            .field("client_id", &redact(&self.client_id))
            .field("client_secret", &"***")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RedditConfig {
    pub user_agent: String,
    /// `None` falls back to the public, unauthenticated JSON listings
    pub credentials: Option<RedditCredentials>,
}

/// Everything read from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub twitter: Option<TwitterCredentials>,
    pub twitter_missing: Vec<&'static str>,
    pub oauth2: OAuth2AppCredentials,
    pub reddit: RedditConfig,
    pub proxies: Vec<ProxyConfig>,
}

impl Config {
    /// Read configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    /// Empty values count as unset (CI injects unset secrets as "").
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let twitter_keys = [
            ENV_CONSUMER_KEY,
            ENV_CONSUMER_SECRET,
            ENV_ACCESS_TOKEN,
            ENV_ACCESS_TOKEN_SECRET,
        ];
        let twitter_missing: Vec<&'static str> = twitter_keys
            .iter()
            .copied()
            .filter(|key| get(key).is_none())
            .collect();

        let twitter = if twitter_missing.is_empty() {
            Some(TwitterCredentials {
                consumer_key: get(ENV_CONSUMER_KEY).unwrap_or_default(),
                consumer_secret: get(ENV_CONSUMER_SECRET).unwrap_or_default(),
                access_token: get(ENV_ACCESS_TOKEN).unwrap_or_default(),
                access_token_secret: get(ENV_ACCESS_TOKEN_SECRET).unwrap_or_default(),
            })
        } else {
            None
        };

        let oauth2 = OAuth2AppCredentials {
            bearer_token: get(ENV_BEARER_TOKEN),
            client_id: get(ENV_OAUTH2_CLIENT_ID),
            client_secret: get(ENV_OAUTH2_CLIENT_SECRET),
        };

        let reddit_credentials = match (
            get(ENV_REDDIT_CLIENT_ID),
            get(ENV_REDDIT_CLIENT_SECRET),
            get(ENV_REDDIT_USERNAME),
            get(ENV_REDDIT_PASSWORD),
        ) {
            (Some(client_id), Some(client_secret), Some(username), Some(password)) => {
                Some(RedditCredentials {
                    client_id,
                    client_secret,
                    username,
                    password,
                })
            }
            _ => None,
        };

        let reddit = RedditConfig {
            user_agent: get(ENV_REDDIT_USER_AGENT)
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            credentials: reddit_credentials,
        };

        let proxies = proxy::proxies_from_lookup(&get);

        Config {
            twitter,
            twitter_missing,
            oauth2,
            reddit,
            proxies,
        }
    }

    /// Credentials needed to publish; errors with the list of unset variables
    pub fn require_twitter(&self) -> ConfigResult<&TwitterCredentials> {
        self.twitter
            .as_ref()
            .ok_or_else(|| ConfigError::MissingTwitterCredentials(self.twitter_missing.clone()))
    }
}

/// Load a `.env` file from the working directory if there is one. A missing
/// file is `Ok(None)`; an unreadable one is returned for the caller to log
/// once logging is up.
pub fn load_dotenv() -> Result<Option<PathBuf>, dotenvy::Error> {
    dotenv_outcome(dotenvy::dotenv())
}

fn dotenv_outcome(
    result: Result<PathBuf, dotenvy::Error>,
) -> Result<Option<PathBuf>, dotenvy::Error> {
    match result {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Tunables for a relay cycle
#[derive(Debug, Clone)]
pub struct Settings {
    pub subreddits: Vec<String>,
    pub listing_limit: u32,
    pub work_dir: PathBuf,
    /// Remaining-calls threshold under which we wait for the window reset
    pub rate_limit_buffer: i64,
    pub max_rate_limit_wait: Duration,
    pub max_pending_attempts: u32,
}

impl Settings {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Settings {
            subreddits: DEFAULT_SUBREDDITS.iter().map(|s| s.to_string()).collect(),
            listing_limit: 50,
            work_dir: work_dir.into(),
            rate_limit_buffer: 10,
            max_rate_limit_wait: Duration::from_secs(300),
            max_pending_attempts: 3,
        }
    }

    /// Reject settings that would make a cycle meaningless
    pub fn validate(&self) -> ConfigResult<()> {
        if self.subreddits.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::InvalidSetting {
                name: "subreddits",
                reason: "at least one subreddit is required".to_string(),
            });
        }
        if self.max_pending_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "max_pending_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Reddit serves at most 100 posts per listing page
pub fn clamp_listing_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_LISTING_LIMIT)
}

/// Default scratch directory for downloaded media
pub fn default_work_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("subrelay")
        .join("media")
}

fn redact(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    format!("{}***", visible)
}
