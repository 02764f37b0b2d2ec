//! Persistence of corrected feeds and per-snapshot statistics.
//!
//! Supports pretty-printing, atomic feed writes, and CSV append.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::gtfs_rt::FeedMessage;
use crate::parser::encode_feed;
use crate::stats::ReconcileStats;
use csv::WriterBuilder;
use std::fs::{self, OpenOptions};
use std::path::Path;

/// Logs reconcile statistics as pretty-printed JSON.
pub fn print_json(stats: &ReconcileStats) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(stats)?);
    Ok(())
}

/// Writes the encoded feed to `path` through a sibling temp file, so readers
/// never see a partial feed.
pub fn write_feed(path: &str, feed: &FeedMessage) -> Result<()> {
    let bytes = encode_feed(feed);
    let tmp = format!("{path}.tmp");
    fs::write(&tmp, &bytes).with_context(|| format!("writing {tmp}"))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming {tmp} to {path}"))?;
    debug!(path, bytes = bytes.len(), "Wrote corrected feed");
    Ok(())
}

/// Appends a [`ReconcileStats`] record as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record(path: &str, stats: &ReconcileStats) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, "Appending CSV record");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(stats)?;
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{FeedEntity, FeedHeader};
    use crate::parser::parse_feed;
    use std::env;

    fn temp_path(name: &str) -> String {
        format!("{}/{}", env::temp_dir().display(), name)
    }

    #[test]
    fn test_print_json_does_not_panic() {
        let stats = ReconcileStats::default();
        print_json(&stats).unwrap();
    }

    #[test]
    fn test_write_feed_replaces_file() {
        let path = temp_path("gtfs_rt_matcher_test_feed.pb");
        fs::write(&path, b"stale").unwrap();

        let feed = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "1.0".to_string(),
                timestamp: Some(1710953000),
                ..Default::default()
            },
            entity: vec![FeedEntity {
                id: "000001".to_string(),
                ..Default::default()
            }],
        };
        write_feed(&path, &feed).unwrap();

        let parsed = parse_feed(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed, feed);
        assert!(!Path::new(&format!("{path}.tmp")).exists());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_append_record_writes_header_once() {
        let path = temp_path("gtfs_rt_matcher_test_header.csv");
        let _ = fs::remove_file(&path);

        let stats = ReconcileStats::default();
        append_record(&path, &stats).unwrap();
        append_record(&path, &stats).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        // Header line should appear exactly once
        let header_count = content.lines().filter(|l| l.contains("timestamp")).count();
        assert_eq!(header_count, 1);
        assert_eq!(content.lines().count(), 3);

        fs::remove_file(&path).unwrap();
    }
}
