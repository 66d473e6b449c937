// Tweet composition
// Title/body text plus the Reddit permalink, trimmed to fit a tweet

/// Characters available for text and link, leaving room for the "..." marker
pub const TWEET_BUDGET: usize = 277;
pub const TWEET_MAX_CHARS: usize = 280;

const ELLIPSIS: &str = "...";

/// Text of a post: title and body on separate lines, or just the title
pub fn post_text(title: &str, content: &str) -> String {
    if content.trim().is_empty() {
        title.to_string()
    } else {
        format!("{}\n{}", title, content)
    }
}

fn take_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Final tweet body. The link is kept whole and the text is cut to make
/// room for it. Returns `None` when there is nothing to post.
pub fn compose_tweet(text: &str, url: &str) -> Option<String> {
    let text_len = text.chars().count();
    let url_len = url.chars().count();

    match (text.is_empty(), url.is_empty()) {
        (false, false) => {
            if text_len + url_len >= TWEET_BUDGET {
                // Room for the newline too, so the result is at most 280
                let keep = TWEET_BUDGET.saturating_sub(url_len + 1);
                Some(format!("{}{}\n{}", take_chars(text, keep), ELLIPSIS, url))
            } else {
                Some(format!("{}\n{}", text, url))
            }
        }
        (false, true) => Some(take_chars(text, TWEET_BUDGET).to_string()),
        (true, false) => Some(url.to_string()),
        (true, true) => None,
    }
}
