//! Key file listings
//!
//! NearForm servers return a JSON array of `{id, path}`. The Google
//! reference server returns `v1/index.txt`, one export per line:
//!
//! ```text
//! v1/1597846020-1597846080-00001.zip
//! v1/1597847700-1597847760-00001.zip
//! ```
//!
//! For Google listings an export is new when its start time is at or after
//! the stored `since` index; its id is the end time.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFile {
    pub id: i64,
    pub path: String,
}

/// `start-end-batch` from an export path, without directory or extension
fn parse_export_name(entry: &str) -> Option<(i64, i64)> {
    let file_name = entry.rsplit('/').next()?;
    let stem = file_name.strip_suffix(".zip").unwrap_or(file_name);

    let mut parts = stem.split('-');
    let start = parts.next()?.parse().ok()?;
    let end = parts.next()?.parse().ok()?;
    Some((start, end))
}

/// Pick the exports to process from a Google `index.txt`
///
/// On the first run (`since <= 0`) the newest `limit` exports are taken,
/// afterwards the oldest `limit` new ones, so a backlog drains in order.
pub fn select_google_files(index: &str, since: i64, limit: usize) -> Vec<KeyFile> {
    let files: Vec<KeyFile> = index
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (start, end) = parse_export_name(line)?;
            if start >= since {
                Some(KeyFile {
                    id: end,
                    path: line.to_string(),
                })
            } else {
                log::debug!("Skipping already processed export {}", line);
                None
            }
        })
        .collect();

    if since <= 0 {
        let skip = files.len().saturating_sub(limit);
        files.into_iter().skip(skip).collect()
    } else {
        files.into_iter().take(limit).collect()
    }
}

/// Highest file id in a batch, or `since` when nothing is newer
pub fn next_since(files: &[KeyFile], since: i64) -> i64 {
    files.iter().map(|f| f.id).fold(since, i64::max)
}

/// Local file name for a downloaded export
pub fn local_file_name(file: &KeyFile) -> String {
    format!("diagnosis_keys_{}.zip", file.id)
}
