// Relay cycle
// Pending retries first, then the queued batches, refilling from Reddit when
// the queue runs dry. A post is marked seen only after its tweet exists.

use rand::seq::SliceRandom;
use serde_json::json;
use std::time::Duration;

use super::trace::{TraceBuilder, TraceEntry, TraceWriter};
use super::{with_deadline, RelayError, RunOutcome};
use crate::compose::{compose_tweet, post_text};
use crate::config::Settings;
use crate::media::{MediaFetcher, PreparedMedia};
use crate::reddit::ContentSource;
use crate::state::{
    add_json_batch, drop_exhausted_pending, filter_new_posts, get_next_unposted_post,
    mark_post_as_seen, next_pending, peek_next_unposted_post, remove_pending, upsert_pending,
    DbConnection,
};
use crate::twitter::Publisher;

/// A post ready to publish: final text plus remote media URLs
struct Candidate {
    post_id: String,
    text: String,
    images: Vec<String>,
    video: Option<String>,
}

pub struct Relay<S, P> {
    db: DbConnection,
    source: S,
    publisher: Option<P>,
    media: MediaFetcher,
    settings: Settings,
    trace: Option<TraceWriter>,
}

impl<S: ContentSource, P: Publisher> Relay<S, P> {
    /// `publisher` may be `None` for dry runs and fetch-only use
    pub fn new(
        db: DbConnection,
        source: S,
        publisher: Option<P>,
        media: MediaFetcher,
        settings: Settings,
    ) -> Self {
        Relay {
            db,
            source,
            publisher,
            media,
            settings,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: TraceWriter) -> Self {
        self.trace = Some(trace);
        self
    }

    fn trace(&self, entry: TraceEntry) {
        if let Some(writer) = &self.trace {
            if let Err(e) = writer.write(entry) {
                log::warn!("Failed to write trace to {}: {}", writer.path().display(), e);
            }
        }
    }

    /// One relay cycle. A dry run composes the next tweet without
    /// consuming the queue or publishing anything.
    pub async fn run_once(&self, dry_run: bool) -> Result<RunOutcome, RelayError> {
        let label = if dry_run { "Dry run" } else { "Relay run" };
        self.trace(TraceBuilder::stage("run").started(label));

        let result = if dry_run {
            self.preview().await
        } else {
            self.relay().await
        };

        match &result {
            Ok(outcome) => self.trace(TraceBuilder::stage("run").ok(outcome.to_string())),
            Err(e) => self.trace(TraceBuilder::stage("run").failed(e.to_string())),
        }
        result
    }

    /// `run_once` bounded by `limit`
    pub async fn run_with_timeout(
        &self,
        dry_run: bool,
        limit: Duration,
    ) -> Result<RunOutcome, RelayError> {
        with_deadline(limit, self.run_once(dry_run)).await
    }

    async fn relay(&self) -> Result<RunOutcome, RelayError> {
        let publisher = self.publisher.as_ref().ok_or(RelayError::NoPublisher)?;
        let max_attempts = self.settings.max_pending_attempts;

        let dropped = drop_exhausted_pending(&self.db, max_attempts)?;
        if !dropped.is_empty() {
            self.trace(
                TraceBuilder::stage("retry")
                    .skipped(format!("Gave up on {} post(s)", dropped.len()))
                    .with_data(json!({ "post_ids": dropped })),
            );
        }

        if let Some(pending) = next_pending(&self.db, max_attempts)? {
            log::info!(
                "Retrying post {} (attempt {} of {})",
                pending.post_id,
                pending.attempts + 1,
                max_attempts
            );
            let candidate = Candidate {
                post_id: pending.post_id,
                text: pending.content,
                images: pending.img_paths,
                video: pending.video_path,
            };
            let tweet_id = self.publish_candidate(publisher, &candidate).await?;
            return Ok(RunOutcome::Retried {
                post_id: candidate.post_id,
                tweet_id,
            });
        }

        let next = match get_next_unposted_post(&self.db)? {
            Some(next) => Some(next),
            None => {
                self.refill().await?;
                get_next_unposted_post(&self.db)?
            }
        };
        let Some((batch_id, post)) = next else {
            log::info!("No new posts to relay");
            return Ok(RunOutcome::NothingToPost);
        };
        log::info!("Selected post {} from batch {}", post.id, batch_id);

        let Some(text) = compose_tweet(&post_text(&post.title, &post.content), &post.url) else {
            log::error!("Post {} has neither text nor link, skipping", post.id);
            mark_post_as_seen(&self.db, &post.id)?;
            return Ok(RunOutcome::NothingToPost);
        };

        let candidate = Candidate {
            post_id: post.id.clone(),
            text,
            images: post.image_urls(),
            video: post.video.clone(),
        };
        log::info!("Content: {}", candidate.text);
        log::info!("Image Paths: {:?}", candidate.images);
        log::info!("Video Path: {}", candidate.video.as_deref().unwrap_or(""));

        let tweet_id = self.publish_candidate(publisher, &candidate).await?;
        Ok(RunOutcome::Posted {
            post_id: candidate.post_id,
            tweet_id,
        })
    }

    async fn preview(&self) -> Result<RunOutcome, RelayError> {
        let next = match peek_next_unposted_post(&self.db)? {
            Some(next) => Some(next),
            None => {
                self.refill().await?;
                peek_next_unposted_post(&self.db)?
            }
        };
        let Some((_, post)) = next else {
            log::info!("[dry run] No new posts to relay");
            return Ok(RunOutcome::NothingToPost);
        };

        let Some(text) = compose_tweet(&post_text(&post.title, &post.content), &post.url) else {
            return Ok(RunOutcome::NothingToPost);
        };
        log::info!("[dry run] Would post {}: {}", post.id, text);
        if let Some(video) = &post.video {
            log::info!("[dry run] With video {}", video);
        } else {
            for image in post.image_urls() {
                log::info!("[dry run] With image {}", image);
            }
        }

        Ok(RunOutcome::DryRun {
            post_id: post.id,
            text,
        })
    }

    /// Publish and record the result: seen on success, pending on failure
    async fn publish_candidate(
        &self,
        publisher: &P,
        candidate: &Candidate,
    ) -> Result<String, RelayError> {
        match self.publish(publisher, candidate).await {
            Ok(tweet_id) => {
                mark_post_as_seen(&self.db, &candidate.post_id)?;
                remove_pending(&self.db, &candidate.post_id)?;
                self.trace(
                    TraceBuilder::stage("publish")
                        .ok("Tweet posted")
                        .with_data(json!({ "post_id": candidate.post_id, "tweet_id": tweet_id })),
                );
                Ok(tweet_id)
            }
            Err(source) => {
                let attempts = upsert_pending(
                    &self.db,
                    &candidate.post_id,
                    &candidate.text,
                    &candidate.images,
                    candidate.video.as_deref(),
                )?;
                self.trace(
                    TraceBuilder::stage("publish")
                        .failed(source.to_string())
                        .with_data(json!({ "post_id": candidate.post_id, "attempts": attempts })),
                );
                Err(RelayError::Publish {
                    post_id: candidate.post_id.clone(),
                    attempts,
                    source: Box::new(source),
                })
            }
        }
    }

    async fn publish(&self, publisher: &P, candidate: &Candidate) -> Result<String, RelayError> {
        let prepared = self
            .media
            .prepare(candidate.video.as_deref(), &candidate.images)
            .await?;
        self.trace(
            TraceBuilder::stage("media")
                .ok("Media prepared")
                .with_data(json!({ "files": prepared.paths().len() })),
        );

        let result = upload_and_tweet(publisher, &candidate.text, &prepared).await;
        prepared.cleanup();
        result
    }

    /// Fetch the configured subreddits in random order and store the first
    /// listing that has anything new. Returns the stored batch id.
    pub async fn refill(&self) -> Result<Option<i64>, RelayError> {
        let mut subreddits = self.settings.subreddits.clone();
        subreddits.shuffle(&mut rand::thread_rng());
        self.refill_from(&subreddits).await
    }

    /// Like `refill`, in the given order. Fails only when every fetch failed.
    pub async fn refill_from(&self, subreddits: &[String]) -> Result<Option<i64>, RelayError> {
        let mut last_error = None;
        let mut fetched_any = false;

        for subreddit in subreddits {
            let posts = match self
                .source
                .fetch_hot(subreddit, self.settings.listing_limit)
                .await
            {
                Ok(posts) => posts,
                Err(e) => {
                    log::error!("Failed to fetch r/{}: {}", subreddit, e);
                    self.trace(
                        TraceBuilder::stage("fetch").failed(format!("r/{}: {}", subreddit, e)),
                    );
                    last_error = Some(e);
                    continue;
                }
            };
            fetched_any = true;

            let fetched = posts.len();
            let fresh = filter_new_posts(&self.db, posts)?;
            if fresh.is_empty() {
                log::info!("No new posts in r/{} ({} fetched)", subreddit, fetched);
                self.trace(
                    TraceBuilder::stage("fetch").skipped(format!("r/{}: nothing new", subreddit)),
                );
                continue;
            }

            let batch_id = add_json_batch(&self.db, &fresh, subreddit)?;
            log::info!(
                "Queued {} new post(s) from r/{} as batch {}",
                fresh.len(),
                subreddit,
                batch_id
            );
            self.trace(
                TraceBuilder::stage("fetch")
                    .ok(format!("r/{}", subreddit))
                    .with_data(json!({
                        "batch_id": batch_id,
                        "fetched": fetched,
                        "queued": fresh.len()
                    })),
            );
            return Ok(Some(batch_id));
        }

        match last_error {
            Some(e) if !fetched_any => Err(e.into()),
            _ => Ok(None),
        }
    }
}

/// Upload whatever media is ready, then tweet. A single failed upload is
/// skipped unless it is a rate limit.
async fn upload_and_tweet<P: Publisher>(
    publisher: &P,
    text: &str,
    prepared: &PreparedMedia,
) -> Result<String, RelayError> {
    let mut media_ids = Vec::new();

    match prepared {
        PreparedMedia::None => {}
        PreparedMedia::Video(path) => match publisher.upload_video(path).await {
            Ok(id) => media_ids.push(id),
            Err(e) if e.is_rate_limited() => return Err(e.into()),
            Err(e) => log::error!("Failed to upload video {}: {}", path.display(), e),
        },
        PreparedMedia::Images(paths) => {
            for path in paths {
                match publisher.upload_image(path).await {
                    Ok(id) => media_ids.push(id),
                    Err(e) if e.is_rate_limited() => return Err(e.into()),
                    Err(e) => log::error!("Failed to upload image {}: {}", path.display(), e),
                }
            }
        }
    }

    Ok(publisher.create_tweet(text, &media_ids).await?)
}
