// State management module
// SQLite-backed batch queue, seen set and retry list, plus the flat seen log

pub mod db;
pub mod models;
pub mod queries;
pub mod storage;

pub use db::{init_db, open_in_memory, DbConnection, DbError, DbResult};
pub use models::{BatchSummary, PendingPost, QueueStats, QueuedPost, MAX_IMAGES};
pub use queries::{
    add_json_batch, clear_all_batches, drop_exhausted_pending, filter_new_posts,
    get_next_unposted_post, get_queue_stats, is_post_seen, list_seen_ids, mark_post_as_seen,
    mark_posts_as_seen, next_pending, peek_next_unposted_post, remove_pending, upsert_pending,
    MAX_JSON_BATCHES,
};
pub use storage::{export_seen_file, import_seen_file};
