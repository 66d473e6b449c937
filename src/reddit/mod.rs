// Reddit content source
// Hot listings, post extraction and the source abstraction the relay consumes

pub mod client;
pub mod extract;
pub mod models;

use async_trait::async_trait;
use thiserror::Error;

use crate::proxy::ProxyError;
use crate::state::QueuedPost;

pub use client::{RedditClient, RedditEndpoints};
pub use extract::{extract_listing, extract_post};

#[derive(Debug, Error)]
pub enum RedditError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Reddit returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Reddit authentication failed: {0}")]
    Auth(String),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),
}

/// Where relay candidates come from
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Non-stickied posts of the subreddit's hot listing, in listing order
    async fn fetch_hot(&self, subreddit: &str, limit: u32) -> Result<Vec<QueuedPost>, RedditError>;
}
