// Flat-file seen log
// One post id per line, the seen_posts.txt format older deployments kept state in
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use thiserror::Error;

use super::db::{DbConnection, DbResult};
use super::queries::{list_seen_ids, mark_posts_as_seen};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Read post ids from a seen log. A missing file is an empty log.
pub fn read_seen_file(path: &Path) -> StorageResult<Vec<String>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(path)(e)),
    };

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Replace the seen log with `ids`, via a sibling temp file and rename
pub fn write_seen_file(path: &Path, ids: &[String]) -> StorageResult<()> {
    let tmp_path = path.with_extension("tmp");

    {
        let mut file = fs::File::create(&tmp_path).map_err(io_error(&tmp_path))?;
        file.write_all(ids.join("\n").as_bytes())
            .map_err(io_error(&tmp_path))?;
        if !ids.is_empty() {
            file.write_all(b"\n").map_err(io_error(&tmp_path))?;
        }
        file.flush().map_err(io_error(&tmp_path))?;
    }

    fs::rename(&tmp_path, path).map_err(io_error(path))?;
    Ok(())
}

/// Merge a seen log into the database; returns how many ids were new
pub fn import_seen_file(db: &DbConnection, path: &Path) -> DbResult<usize> {
    let ids = read_seen_file(path)?;
    let added = mark_posts_as_seen(db, &ids)?;
    log::info!(
        "Imported {} of {} ids from {}",
        added,
        ids.len(),
        path.display()
    );
    Ok(added)
}

/// Write every seen id to a flat log; returns the number written
pub fn export_seen_file(db: &DbConnection, path: &Path) -> DbResult<usize> {
    let ids = list_seen_ids(db)?;
    write_seen_file(path, &ids)?;
    log::info!("Exported {} ids to {}", ids.len(), path.display());
    Ok(ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::db::open_in_memory;
    use crate::state::queries::is_post_seen;
    use tempfile::TempDir;

    #[test]
    fn test_missing_seen_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let ids = read_seen_file(&temp_dir.path().join("seen_posts.txt")).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_read_skips_blank_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("seen_posts.txt");
        fs::write(&path, "abc\n\n  def  \n\n").unwrap();

        assert_eq!(read_seen_file(&path).unwrap(), vec!["abc", "def"]);
    }

    #[test]
    fn test_import_then_export() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("seen_posts.txt");
        let output = temp_dir.path().join("export.txt");
        fs::write(&input, "abc\ndef\nabc\n").unwrap();

        let db = open_in_memory().unwrap();
        assert_eq!(import_seen_file(&db, &input).unwrap(), 2);
        assert!(is_post_seen(&db, "def").unwrap());

        assert_eq!(export_seen_file(&db, &output).unwrap(), 2);
        let mut exported = read_seen_file(&output).unwrap();
        exported.sort();
        assert_eq!(exported, vec!["abc", "def"]);
        assert!(!output.with_extension("tmp").exists());
    }
}
