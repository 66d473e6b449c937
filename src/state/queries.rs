// Queue, dedup and retry queries
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::db::{DbConnection, DbResult};
use super::models::{
    format_timestamp, parse_timestamp, BatchSummary, PendingPost, QueueStats, QueuedPost,
};

/// Stored listings kept at once; adding another evicts the oldest
pub const MAX_JSON_BATCHES: i64 = 2;

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp: {}", raw).into(),
        )
    })
}

fn is_seen(conn: &Connection, post_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM seen_posts WHERE post_id = ?1",
        [post_id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

fn is_pending(conn: &Connection, post_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM pending_posts WHERE post_id = ?1",
        [post_id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

// ==================== BATCH QUERIES ====================

/// Store a fetched listing. Evicts the oldest batches first so that at most
/// `MAX_JSON_BATCHES` remain afterwards. Returns the new batch id.
pub fn add_json_batch(db: &DbConnection, posts: &[QueuedPost], subreddit: &str) -> DbResult<i64> {
    let posts_json = serde_json::to_string(posts)?;
    let total = posts.len() as i64;

    let mut conn = db.lock();
    let tx = conn.transaction()?;

    let count: i64 = tx.query_row("SELECT COUNT(*) FROM json_batches", [], |row| row.get(0))?;
    if count >= MAX_JSON_BATCHES {
        let old_batches: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT batch_id FROM json_batches
                 ORDER BY fetched_at ASC, batch_id ASC
                 LIMIT ?1",
            )?;
            let ids = stmt
                .query_map([count - MAX_JSON_BATCHES + 1], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        for old_id in old_batches {
            tx.execute("DELETE FROM json_batches WHERE batch_id = ?1", [old_id])?;
            log::info!(
                "Old batch #{} removed (keeping at most {})",
                old_id,
                MAX_JSON_BATCHES
            );
        }
    }

    tx.execute(
        "INSERT INTO json_batches (subreddit, fetched_at, posts_json, total_posts, remaining_posts)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            subreddit,
            format_timestamp(&Utc::now()),
            posts_json,
            total,
            total
        ],
    )?;
    let batch_id = tx.last_insert_rowid();
    tx.commit()?;

    log::info!(
        "New batch #{} added: {} posts from r/{}",
        batch_id,
        total,
        subreddit
    );
    Ok(batch_id)
}

struct BatchRow {
    batch_id: i64,
    subreddit: String,
    posts_json: String,
    total: i64,
}

fn load_batches(conn: &Connection) -> DbResult<Vec<BatchRow>> {
    let mut stmt = conn.prepare(
        "SELECT batch_id, subreddit, posts_json, total_posts
         FROM json_batches
         ORDER BY fetched_at ASC, batch_id ASC",
    )?;

    let batches = stmt
        .query_map([], |row| {
            Ok(BatchRow {
                batch_id: row.get(0)?,
                subreddit: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                posts_json: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                total: row.get::<_, Option<i64>>(3)?.unwrap_or_default(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(batches)
}

fn delete_batch(conn: &Connection, batch_id: i64) -> DbResult<()> {
    conn.execute("DELETE FROM json_batches WHERE batch_id = ?1", [batch_id])?;
    Ok(())
}

fn find_next_unposted(conn: &Connection, consume: bool) -> DbResult<Option<(i64, QueuedPost)>> {
    let batches = load_batches(conn)?;

    if batches.is_empty() {
        log::warn!("No stored batches available");
        return Ok(None);
    }

    log::info!("Checking {} stored batch(es)...", batches.len());

    for batch in batches {
        let posts: Vec<QueuedPost> = match serde_json::from_str(&batch.posts_json) {
            Ok(posts) => posts,
            Err(e) => {
                log::error!("Batch #{} is unreadable ({}), discarding it", batch.batch_id, e);
                if consume {
                    delete_batch(conn, batch.batch_id)?;
                }
                continue;
            }
        };

        let mut unposted = Vec::new();
        for post in posts {
            if !is_seen(conn, &post.id)? && !is_pending(conn, &post.id)? {
                unposted.push(post);
            }
        }

        log::info!(
            "Batch #{} (r/{}): {}/{} posts unposted",
            batch.batch_id,
            batch.subreddit,
            unposted.len(),
            batch.total
        );

        let mut unposted = unposted.into_iter();
        let Some(post) = unposted.next() else {
            log::warn!("Batch #{} has no new posts", batch.batch_id);
            if consume {
                delete_batch(conn, batch.batch_id)?;
                log::info!("Batch #{} removed (nothing new)", batch.batch_id);
            }
            continue;
        };

        let remaining = unposted.len() as i64;
        if consume {
            if remaining == 0 {
                delete_batch(conn, batch.batch_id)?;
                log::info!("Batch #{} exhausted and removed", batch.batch_id);
            } else {
                conn.execute(
                    "UPDATE json_batches SET remaining_posts = ?1 WHERE batch_id = ?2",
                    params![remaining, batch.batch_id],
                )?;
            }
        }

        let title: String = post.title.chars().take(50).collect();
        log::info!("New post found in batch #{}: {}", batch.batch_id, title);
        return Ok(Some((batch.batch_id, post)));
    }

    log::warn!("No new post in any stored batch");
    Ok(None)
}

/// Take the first post that is neither seen nor pending, scanning batches
/// oldest first. Batches with nothing left are deleted along the way.
pub fn get_next_unposted_post(db: &DbConnection) -> DbResult<Option<(i64, QueuedPost)>> {
    let mut conn = db.lock();
    let tx = conn.transaction()?;
    let next = find_next_unposted(&tx, true)?;
    tx.commit()?;
    Ok(next)
}

/// Same selection as `get_next_unposted_post` without touching the queue
pub fn peek_next_unposted_post(db: &DbConnection) -> DbResult<Option<(i64, QueuedPost)>> {
    let conn = db.lock();
    find_next_unposted(&conn, false)
}

/// Remove every stored batch; seen and pending posts are kept
pub fn clear_all_batches(db: &DbConnection) -> DbResult<usize> {
    let conn = db.lock();
    let removed = conn.execute("DELETE FROM json_batches", [])?;
    log::info!("All batches removed ({})", removed);
    Ok(removed)
}

pub fn get_queue_stats(db: &DbConnection) -> DbResult<QueueStats> {
    let conn = db.lock();

    let batches_count: i64 =
        conn.query_row("SELECT COUNT(*) FROM json_batches", [], |row| row.get(0))?;
    let available_posts: i64 = conn.query_row(
        "SELECT COALESCE(SUM(remaining_posts), 0) FROM json_batches",
        [],
        |row| row.get(0),
    )?;
    let posted_total: i64 =
        conn.query_row("SELECT COUNT(*) FROM seen_posts", [], |row| row.get(0))?;
    let pending_total: i64 =
        conn.query_row("SELECT COUNT(*) FROM pending_posts", [], |row| row.get(0))?;

    let mut stmt = conn.prepare(
        "SELECT batch_id, subreddit, total_posts, remaining_posts, fetched_at
         FROM json_batches
         ORDER BY fetched_at ASC, batch_id ASC",
    )?;
    let batches = stmt
        .query_map([], |row| {
            Ok(BatchSummary {
                batch_id: row.get(0)?,
                subreddit: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                total: row.get::<_, Option<i64>>(2)?.unwrap_or_default(),
                remaining: row.get::<_, Option<i64>>(3)?.unwrap_or_default(),
                fetched_at: timestamp_column(row, 4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(QueueStats {
        batches_count,
        available_posts,
        posted_total,
        pending_total,
        batches,
    })
}

// ==================== SEEN QUERIES ====================

pub fn is_post_seen(db: &DbConnection, post_id: &str) -> DbResult<bool> {
    let conn = db.lock();
    Ok(is_seen(&conn, post_id)?)
}

/// Posts that are neither seen nor waiting for a retry, order preserved
pub fn filter_new_posts(db: &DbConnection, posts: Vec<QueuedPost>) -> DbResult<Vec<QueuedPost>> {
    let conn = db.lock();
    let mut fresh = Vec::with_capacity(posts.len());
    for post in posts {
        if !is_seen(&conn, &post.id)? && !is_pending(&conn, &post.id)? {
            fresh.push(post);
        }
    }
    Ok(fresh)
}

/// Returns false when the post was already marked
pub fn mark_post_as_seen(db: &DbConnection, post_id: &str) -> DbResult<bool> {
    let conn = db.lock();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO seen_posts (post_id, posted_at) VALUES (?1, ?2)",
        params![post_id, format_timestamp(&Utc::now())],
    )?;
    Ok(inserted > 0)
}

/// Bulk insert; returns how many ids were new
pub fn mark_posts_as_seen(db: &DbConnection, post_ids: &[String]) -> DbResult<usize> {
    let mut conn = db.lock();
    let tx = conn.transaction()?;
    let now = format_timestamp(&Utc::now());

    let mut inserted = 0;
    {
        let mut stmt =
            tx.prepare("INSERT OR IGNORE INTO seen_posts (post_id, posted_at) VALUES (?1, ?2)")?;
        for post_id in post_ids {
            inserted += stmt.execute(params![post_id, now])?;
        }
    }
    tx.commit()?;

    Ok(inserted)
}

/// All seen ids, oldest first
pub fn list_seen_ids(db: &DbConnection) -> DbResult<Vec<String>> {
    let conn = db.lock();
    let mut stmt =
        conn.prepare("SELECT post_id FROM seen_posts ORDER BY posted_at ASC, post_id ASC")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

// ==================== PENDING QUERIES ====================

/// Record a failed publish. Returns the attempt count after this failure.
pub fn upsert_pending(
    db: &DbConnection,
    post_id: &str,
    content: &str,
    img_paths: &[String],
    video_path: Option<&str>,
) -> DbResult<u32> {
    let img_json = serde_json::to_string(img_paths)?;
    let conn = db.lock();

    conn.execute(
        "INSERT INTO pending_posts (post_id, content, img_paths, video_path, attempts, last_attempt)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)
         ON CONFLICT(post_id) DO UPDATE SET
            content = excluded.content,
            img_paths = excluded.img_paths,
            video_path = excluded.video_path,
            attempts = pending_posts.attempts + 1,
            last_attempt = excluded.last_attempt",
        params![
            post_id,
            content,
            img_json,
            video_path,
            format_timestamp(&Utc::now())
        ],
    )?;

    let attempts: u32 = conn.query_row(
        "SELECT attempts FROM pending_posts WHERE post_id = ?1",
        [post_id],
        |row| row.get(0),
    )?;
    Ok(attempts)
}

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingPost> {
    let img_json: Option<String> = row.get(2)?;
    let img_paths = match img_json {
        Some(raw) if !raw.is_empty() => serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
        })?,
        _ => Vec::new(),
    };

    Ok(PendingPost {
        post_id: row.get(0)?,
        content: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        img_paths,
        video_path: row.get::<_, Option<String>>(3)?.filter(|v| !v.is_empty()),
        attempts: row.get::<_, Option<u32>>(4)?.unwrap_or_default(),
        last_attempt: timestamp_column(row, 5)?,
    })
}

/// Least recently attempted pending post still under `max_attempts`
pub fn next_pending(db: &DbConnection, max_attempts: u32) -> DbResult<Option<PendingPost>> {
    let conn = db.lock();
    let pending = conn
        .query_row(
            "SELECT post_id, content, img_paths, video_path, attempts, last_attempt
             FROM pending_posts
             WHERE attempts < ?1
             ORDER BY last_attempt ASC
             LIMIT 1",
            [max_attempts],
            pending_from_row,
        )
        .optional()?;
    Ok(pending)
}

pub fn remove_pending(db: &DbConnection, post_id: &str) -> DbResult<bool> {
    let conn = db.lock();
    let removed = conn.execute("DELETE FROM pending_posts WHERE post_id = ?1", [post_id])?;
    Ok(removed > 0)
}

/// Give up on posts that failed `max_attempts` times: they are marked seen so
/// no later listing brings them back. Returns the dropped ids.
pub fn drop_exhausted_pending(db: &DbConnection, max_attempts: u32) -> DbResult<Vec<String>> {
    let mut conn = db.lock();
    let tx = conn.transaction()?;

    let exhausted: Vec<String> = {
        let mut stmt =
            tx.prepare("SELECT post_id FROM pending_posts WHERE attempts >= ?1 ORDER BY post_id")?;
        let ids = stmt
            .query_map([max_attempts], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };

    let now = format_timestamp(&Utc::now());
    for post_id in &exhausted {
        tx.execute(
            "INSERT OR IGNORE INTO seen_posts (post_id, posted_at) VALUES (?1, ?2)",
            params![post_id, now],
        )?;
        tx.execute("DELETE FROM pending_posts WHERE post_id = ?1", [post_id])?;
        log::warn!("Giving up on post {} after {} attempts", post_id, max_attempts);
    }

    tx.commit()?;
    Ok(exhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::db::open_in_memory;

    fn post(id: &str) -> QueuedPost {
        QueuedPost {
            id: id.to_string(),
            subreddit: "Overwatch".to_string(),
            title: format!("Post {}", id),
            content: String::new(),
            url: format!("https://www.reddit.com/r/Overwatch/comments/{}/", id),
            s_img: None,
            m_img: Vec::new(),
            video: None,
        }
    }

    fn posts(ids: &[&str]) -> Vec<QueuedPost> {
        ids.iter().map(|id| post(id)).collect()
    }

    #[test]
    fn test_batch_fifo_cap() {
        let db = open_in_memory().unwrap();

        let first = add_json_batch(&db, &posts(&["a"]), "Overwatch").unwrap();
        let second = add_json_batch(&db, &posts(&["b"]), "Overwatch_Memes").unwrap();
        let third = add_json_batch(&db, &posts(&["c"]), "Overwatch").unwrap();

        let stats = get_queue_stats(&db).unwrap();
        assert_eq!(stats.batches_count, 2);
        let ids: Vec<i64> = stats.batches.iter().map(|b| b.batch_id).collect();
        assert_eq!(ids, vec![second, third]);
        assert!(!ids.contains(&first));
    }

    #[test]
    fn test_filter_new_posts() {
        let db = open_in_memory().unwrap();
        mark_post_as_seen(&db, "a").unwrap();
        upsert_pending(&db, "c", "text", &[], None).unwrap();

        let fresh = filter_new_posts(&db, posts(&["a", "b", "c", "d"])).unwrap();
        let ids: Vec<&str> = fresh.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d"]);
    }

    #[test]
    fn test_next_unposted_skips_seen() {
        let db = open_in_memory().unwrap();
        add_json_batch(&db, &posts(&["a", "b", "c"]), "Overwatch").unwrap();
        mark_post_as_seen(&db, "a").unwrap();

        let (_, next) = get_next_unposted_post(&db).unwrap().unwrap();
        assert_eq!(next.id, "b");

        let stats = get_queue_stats(&db).unwrap();
        assert_eq!(stats.available_posts, 1);
    }

    #[test]
    fn test_oldest_batch_first() {
        let db = open_in_memory().unwrap();
        let older = add_json_batch(&db, &posts(&["old"]), "Overwatch").unwrap();
        add_json_batch(&db, &posts(&["new"]), "Overwatch").unwrap();

        let (batch_id, next) = get_next_unposted_post(&db).unwrap().unwrap();
        assert_eq!(batch_id, older);
        assert_eq!(next.id, "old");
    }

    #[test]
    fn test_exhausted_batch_removed() {
        let db = open_in_memory().unwrap();
        add_json_batch(&db, &posts(&["only"]), "Overwatch").unwrap();

        let (_, next) = get_next_unposted_post(&db).unwrap().unwrap();
        assert_eq!(next.id, "only");
        assert_eq!(get_queue_stats(&db).unwrap().batches_count, 0);
    }

    #[test]
    fn test_fully_seen_batches_are_dropped() {
        let db = open_in_memory().unwrap();
        add_json_batch(&db, &posts(&["a", "b"]), "Overwatch").unwrap();
        add_json_batch(&db, &posts(&["c"]), "Overwatch_Memes").unwrap();
        mark_posts_as_seen(&db, &["a".to_string(), "b".to_string()]).unwrap();

        let (_, next) = get_next_unposted_post(&db).unwrap().unwrap();
        assert_eq!(next.id, "c");
        assert_eq!(get_queue_stats(&db).unwrap().batches_count, 0);

        assert!(get_next_unposted_post(&db).unwrap().is_none());
    }

    #[test]
    fn test_peek_does_not_consume() {
        let db = open_in_memory().unwrap();
        add_json_batch(&db, &posts(&["a"]), "Overwatch").unwrap();

        let (_, peeked) = peek_next_unposted_post(&db).unwrap().unwrap();
        assert_eq!(peeked.id, "a");
        assert_eq!(get_queue_stats(&db).unwrap().batches_count, 1);
    }

    #[test]
    fn test_pending_posts_not_reselected() {
        let db = open_in_memory().unwrap();
        add_json_batch(&db, &posts(&["a", "b"]), "Overwatch").unwrap();
        upsert_pending(&db, "a", "text", &[], None).unwrap();

        let (_, next) = get_next_unposted_post(&db).unwrap().unwrap();
        assert_eq!(next.id, "b");
    }

    #[test]
    fn test_corrupt_batch_discarded() {
        let db = open_in_memory().unwrap();
        {
            let conn = db.lock();
            conn.execute(
                "INSERT INTO json_batches
                     (subreddit, fetched_at, posts_json, total_posts, remaining_posts)
                 VALUES ('Overwatch', '2020-01-01 00:00:00', 'not json', 1, 1)",
                [],
            )
            .unwrap();
        }
        add_json_batch(&db, &posts(&["ok"]), "Overwatch").unwrap();

        let (_, next) = get_next_unposted_post(&db).unwrap().unwrap();
        assert_eq!(next.id, "ok");
        assert_eq!(get_queue_stats(&db).unwrap().batches_count, 0);
    }

    #[test]
    fn test_mark_seen_idempotent() {
        let db = open_in_memory().unwrap();

        assert!(mark_post_as_seen(&db, "x").unwrap());
        assert!(!mark_post_as_seen(&db, "x").unwrap());
        assert!(is_post_seen(&db, "x").unwrap());
        assert!(!is_post_seen(&db, "y").unwrap());
        assert_eq!(get_queue_stats(&db).unwrap().posted_total, 1);
    }

    #[test]
    fn test_clear_all_batches() {
        let db = open_in_memory().unwrap();
        add_json_batch(&db, &posts(&["a"]), "Overwatch").unwrap();
        add_json_batch(&db, &posts(&["b"]), "Overwatch").unwrap();
        mark_post_as_seen(&db, "z").unwrap();

        assert_eq!(clear_all_batches(&db).unwrap(), 2);
        let stats = get_queue_stats(&db).unwrap();
        assert_eq!(stats.batches_count, 0);
        assert_eq!(stats.posted_total, 1);
    }

    #[test]
    fn test_pending_attempts_increment() {
        let db = open_in_memory().unwrap();
        let imgs = vec!["https://i.redd.it/a.jpg".to_string()];

        assert_eq!(upsert_pending(&db, "p1", "hello", &imgs, None).unwrap(), 1);
        assert_eq!(upsert_pending(&db, "p1", "hello", &imgs, None).unwrap(), 2);

        let pending = next_pending(&db, 3).unwrap().unwrap();
        assert_eq!(pending.post_id, "p1");
        assert_eq!(pending.attempts, 2);
        assert_eq!(pending.img_paths, imgs);
        assert!(pending.video_path.is_none());

        assert!(next_pending(&db, 2).unwrap().is_none());
    }

    #[test]
    fn test_drop_exhausted_pending_marks_seen() {
        let db = open_in_memory().unwrap();
        for _ in 0..3 {
            upsert_pending(&db, "bad", "text", &[], Some("https://v.redd.it/x/DASH_720.mp4"))
                .unwrap();
        }
        upsert_pending(&db, "retry", "text", &[], None).unwrap();

        let dropped = drop_exhausted_pending(&db, 3).unwrap();
        assert_eq!(dropped, vec!["bad".to_string()]);
        assert!(is_post_seen(&db, "bad").unwrap());
        assert!(!is_post_seen(&db, "retry").unwrap());
        assert_eq!(get_queue_stats(&db).unwrap().pending_total, 1);
    }

    #[test]
    fn test_remove_pending() {
        let db = open_in_memory().unwrap();
        upsert_pending(&db, "p", "text", &[], None).unwrap();

        assert!(remove_pending(&db, "p").unwrap());
        assert!(!remove_pending(&db, "p").unwrap());
    }

    #[test]
    fn test_list_seen_ids() {
        let db = open_in_memory().unwrap();
        let added = mark_posts_as_seen(&db, &["b".to_string(), "a".to_string(), "a".to_string()])
            .unwrap();

        assert_eq!(added, 2);
        assert_eq!(list_seen_ids(&db).unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
