// Data models for the relay queue
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Gallery posts carry at most this many images into a tweet
pub const MAX_IMAGES: usize = 4;

/// One Reddit post as stored inside a batch's `posts_json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedPost {
    pub id: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub url: String,
    /// Preview image of single-image posts
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub s_img: Option<String>,
    /// Gallery images, in gallery order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub m_img: Vec<String>,
    /// DASH video stream without audio
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub video: Option<String>,
}

// Older batches store "no media" as an empty string
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

impl QueuedPost {
    /// Image URLs to attach when there is no video
    pub fn image_urls(&self) -> Vec<String> {
        match &self.s_img {
            Some(img) => vec![img.clone()],
            None => self.m_img.iter().take(MAX_IMAGES).cloned().collect(),
        }
    }

    pub fn has_media(&self) -> bool {
        self.video.is_some() || self.s_img.is_some() || !self.m_img.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: i64,
    pub subreddit: String,
    pub total: i64,
    pub remaining: i64,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub batches_count: i64,
    pub available_posts: i64,
    pub posted_total: i64,
    pub pending_total: i64,
    pub batches: Vec<BatchSummary>,
}

/// A composed post whose publishing failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPost {
    pub post_id: String,
    pub content: String,
    pub img_paths: Vec<String>,
    pub video_path: Option<String>,
    pub attempts: u32,
    pub last_attempt: DateTime<Utc>,
}

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339 as well as SQLite's `CURRENT_TIMESTAMP` format
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
