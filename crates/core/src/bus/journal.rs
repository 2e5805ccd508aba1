//! # Message Journal
//!
//! Append-only audit trail for published messages: one JSON object per
//! line, one file per calendar day, never rewritten in place. Partition
//! files are human-inspectable with nothing more than `grep`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::message::Message;

const PARTITION_PREFIX: &str = "messages_";
const PARTITION_SUFFIX: &str = ".jsonl";

/// Date-partitioned JSONL store under a single directory.
pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    /// Open a journal rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create journal directory: {:?}", dir))?;
        Ok(Self { dir })
    }

    /// The journal's storage directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn partition_path(&self, timestamp: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!(
            "{}{}{}",
            PARTITION_PREFIX,
            timestamp.format("%Y%m%d"),
            PARTITION_SUFFIX
        ))
    }

    /// Append one message to the partition for its calendar day.
    pub async fn append(&self, message: &Message) -> Result<()> {
        let line = serde_json::to_string(message).context("Failed to serialize message")?;
        let path = self.partition_path(message.timestamp);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open partition: {:?}", path))?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    /// Read every partition back, returning the parsed messages and the
    /// number of malformed lines skipped.
    ///
    /// Partitions are visited in directory order, not date order; callers
    /// that need chronology must re-sort by timestamp.
    pub async fn load_all(&self) -> Result<(Vec<Message>, usize)> {
        let mut messages = Vec::new();
        let mut skipped = 0;

        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read journal directory: {:?}", self.dir))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !name.starts_with(PARTITION_PREFIX) || !name.ends_with(PARTITION_SUFFIX) {
                continue;
            }
            let content = fs::read_to_string(entry.path())
                .await
                .with_context(|| format!("Failed to read partition: {:?}", entry.path()))?;
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(line) {
                    Ok(message) => messages.push(message),
                    Err(e) => {
                        skipped += 1;
                        tracing::warn!("skipping malformed record in {}: {}", name, e);
                    }
                }
            }
        }

        Ok((messages, skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_append_and_load_field_for_field() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path()).await.unwrap();

        let sent = Message::new("Dev", MessageKind::Query, "which storage engine?")
            .to("Arch")
            .with_meta("attempt", 1.into());
        journal.append(&sent).await.unwrap();

        let (loaded, skipped) = journal.load_all().await.unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(loaded, vec![sent]);
    }

    #[tokio::test]
    async fn test_partition_named_by_calendar_day() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path()).await.unwrap();

        let message = Message::new("Dev", MessageKind::Status, "x");
        let day = message.timestamp.format("%Y%m%d").to_string();
        journal.append(&message).await.unwrap();

        let expected = dir.path().join(format!("messages_{}.jsonl", day));
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn test_within_partition_order_is_write_order() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path()).await.unwrap();

        for i in 0..3 {
            journal
                .append(&Message::new("Dev", MessageKind::Status, format!("m{}", i)))
                .await
                .unwrap();
        }

        let (loaded, _) = journal.load_all().await.unwrap();
        let payloads: Vec<_> = loaded.iter().map(|m| m.payload.as_str()).collect();
        assert_eq!(payloads, vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped_individually() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path()).await.unwrap();

        let good = Message::new("Dev", MessageKind::Status, "kept");
        journal.append(&good).await.unwrap();

        let partition = journal.partition_path(good.timestamp);
        let mut content = std::fs::read_to_string(&partition).unwrap();
        content.push_str("{not json at all\n");
        content.push_str("\n");
        std::fs::write(&partition, content).unwrap();

        let (loaded, skipped) = journal.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].payload, "kept");
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn test_unrelated_files_ignored() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a partition").unwrap();

        let (loaded, skipped) = journal.load_all().await.unwrap();
        assert!(loaded.is_empty());
        assert_eq!(skipped, 0);
    }
}
