// X (Twitter) publishing
// OAuth 1.0a user-context client for media upload and tweet creation

pub mod client;
pub mod oauth1;
pub mod rate_limit;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

pub use client::{TwitterClient, TwitterEndpoints, MEDIA_UPLOAD_ENDPOINT, TWEET_ENDPOINT};
pub use oauth1::OAuth1Signer;

#[derive(Debug, Error)]
pub enum TwitterError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("X API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to sign request: {0}")]
    Signing(String),

    #[error("Media upload failed: {0}")]
    Upload(String),
}

impl TwitterError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TwitterError::RateLimited { .. })
    }
}

/// Where relayed posts end up
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns the media id to attach to a tweet
    async fn upload_image(&self, path: &Path) -> Result<String, TwitterError>;

    async fn upload_video(&self, path: &Path) -> Result<String, TwitterError>;

    /// Returns the new tweet's id
    async fn create_tweet(&self, text: &str, media_ids: &[String]) -> Result<String, TwitterError>;
}
