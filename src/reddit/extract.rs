// Post extraction
// Turns listing entries into queue entries with their media URLs

use super::models::{Listing, RedditPost};
use crate::state::{QueuedPost, MAX_IMAGES};

pub const REDDIT_BASE_URL: &str = "https://www.reddit.com";

/// Reddit escapes `&` in media URLs unless `raw_json=1` was requested
fn unescape_html(url: &str) -> String {
    url.replace("&amp;", "&")
}

/// Build a queue entry from a listing post. Stickied posts are skipped.
pub fn extract_post(post: &RedditPost, subreddit: &str) -> Option<QueuedPost> {
    if post.stickied {
        return None;
    }

    let s_img = post
        .preview
        .as_ref()
        .and_then(|preview| preview.images.first())
        .map(|image| unescape_html(&image.source.url));

    let mut m_img = Vec::new();
    if let (Some(gallery), Some(metadata)) = (&post.gallery_data, &post.media_metadata) {
        for item in &gallery.items {
            let url = metadata
                .get(&item.media_id)
                .and_then(|meta| meta.s.as_ref())
                .and_then(|source| source.u.as_deref());

            if let Some(url) = url {
                m_img.push(unescape_html(url));
                if m_img.len() >= MAX_IMAGES {
                    break;
                }
            }
        }
    }

    let video = post
        .media
        .as_ref()
        .and_then(|media| media.reddit_video.as_ref())
        .map(|video| unescape_html(&video.fallback_url));

    let subreddit = if post.subreddit.is_empty() {
        subreddit.to_string()
    } else {
        post.subreddit.clone()
    };

    Some(QueuedPost {
        id: post.id.clone(),
        subreddit,
        title: post.title.clone(),
        content: post.selftext.clone(),
        url: format!("{}{}", REDDIT_BASE_URL, post.permalink),
        s_img,
        m_img,
        video,
    })
}

/// Every non-stickied post of a listing, in listing order
pub fn extract_listing(listing: &Listing, subreddit: &str) -> Vec<QueuedPost> {
    listing
        .data
        .children
        .iter()
        .filter_map(|thing| extract_post(&thing.data, subreddit))
        .collect()
}
