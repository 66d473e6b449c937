// Reddit listing JSON
// Only the fields the relay reads; everything else is ignored by serde

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct Listing {
    pub data: ListingData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingData {
    #[serde(default)]
    pub children: Vec<Thing>,
    #[serde(default)]
    pub after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thing {
    #[serde(default)]
    pub kind: String,
    pub data: RedditPost,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedditPost {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub stickied: bool,
    #[serde(default)]
    pub preview: Option<Preview>,
    #[serde(default)]
    pub gallery_data: Option<GalleryData>,
    #[serde(default)]
    pub media_metadata: Option<HashMap<String, MediaMetadata>>,
    #[serde(default)]
    pub media: Option<Media>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Preview {
    #[serde(default)]
    pub images: Vec<PreviewImage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewImage {
    pub source: ImageSource,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSource {
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GalleryData {
    #[serde(default)]
    pub items: Vec<GalleryItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GalleryItem {
    pub media_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaMetadata {
    /// Full-size source; animated items carry `gif`/`mp4` instead of `u`
    #[serde(default)]
    pub s: Option<MediaSource>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaSource {
    #[serde(default)]
    pub u: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Media {
    #[serde(default)]
    pub reddit_video: Option<RedditVideo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditVideo {
    pub fallback_url: String,
}

/// Token endpoint reply. Bad credentials still come back as HTTP 200 with `error` set.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
