// Relay pipeline module
// One cycle: retry or select a post, fetch media, publish, record the result

pub mod relay;
pub mod trace;

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::media::MediaError;
use crate::reddit::RedditError;
use crate::state::DbError;
use crate::twitter::TwitterError;

pub use relay::Relay;
pub use trace::{read_trace_file, TraceBuilder, TraceEntry, TraceError, TraceStatus, TraceWriter};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Reddit error: {0}")]
    Reddit(#[from] RedditError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("X API error: {0}")]
    Twitter(#[from] TwitterError),

    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),

    #[error("No publisher configured")]
    NoPublisher,

    #[error("Failed to publish post {post_id} (attempt {attempts}): {source}")]
    Publish {
        post_id: String,
        attempts: u32,
        #[source]
        source: Box<RelayError>,
    },

    #[error("Relay cycle timed out after {0:?}")]
    Timeout(Duration),
}

/// What a single relay cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Posted { post_id: String, tweet_id: String },
    Retried { post_id: String, tweet_id: String },
    DryRun { post_id: String, text: String },
    NothingToPost,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Posted { post_id, tweet_id } => {
                write!(f, "Posted {} as tweet {}", post_id, tweet_id)
            }
            RunOutcome::Retried { post_id, tweet_id } => {
                write!(f, "Retried {} as tweet {}", post_id, tweet_id)
            }
            RunOutcome::DryRun { post_id, .. } => write!(f, "Dry run selected {}", post_id),
            RunOutcome::NothingToPost => write!(f, "Nothing new to post"),
        }
    }
}

/// Drive `cycle` to completion, failing with `RelayError::Timeout` once
/// `limit` has elapsed. The cycle future is dropped on expiry.
pub async fn with_deadline<T, F>(limit: Duration, cycle: F) -> Result<T, RelayError>
where
    F: Future<Output = Result<T, RelayError>>,
{
    tokio::time::timeout(limit, cycle)
        .await
        .map_err(|_| RelayError::Timeout(limit))?
}
