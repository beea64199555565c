//! Durable session state: sequence counters and sent-message blobs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

/// Persistence contract for one session.
///
/// Both counters start at 1 and are contiguous until [`reset`]. Every saved
/// outbound message stays retrievable by its sender sequence number until
/// the next reset. Counter reads are served from memory; mutations may
/// touch the durable medium and fail.
///
/// [`reset`]: MessageStore::reset
#[async_trait]
pub trait MessageStore: Send + 'static {
    fn next_sender_msg_seq_num(&self) -> u32;
    fn next_target_msg_seq_num(&self) -> u32;
    async fn set_next_sender_msg_seq_num(&mut self, seq: u32) -> Result<(), StoreError>;
    async fn set_next_target_msg_seq_num(&mut self, seq: u32) -> Result<(), StoreError>;
    async fn incr_next_sender_msg_seq_num(&mut self) -> Result<(), StoreError>;
    async fn incr_next_target_msg_seq_num(&mut self) -> Result<(), StoreError>;

    /// Instant the current sequence-number epoch began.
    fn creation_time(&self) -> DateTime<Utc>;

    /// Persist an outbound message under its sender sequence number.
    async fn save_message(&mut self, seq: u32, payload: &[u8]) -> Result<(), StoreError>;

    /// Saved messages with `begin <= seq <= end`, ascending. Gaps are the
    /// caller's problem — admin messages are never saved.
    async fn messages_in_range(&self, begin: u32, end: u32)
        -> Result<Vec<(u32, Bytes)>, StoreError>;

    /// Counters back to 1, saved messages dropped, creation time now.
    async fn reset(&mut self) -> Result<(), StoreError>;

    /// Reload counters from the durable medium without resetting.
    async fn refresh(&mut self) -> Result<(), StoreError>;

    async fn close(&mut self) -> Result<(), StoreError>;
}

/// Volatile store. `refresh` is a no-op because memory is the medium.
#[derive(Debug)]
pub struct MemoryMessageStore {
    next_sender: u32,
    next_target: u32,
    creation_time: DateTime<Utc>,
    messages: BTreeMap<u32, Bytes>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self {
            next_sender: 1,
            next_target: 1,
            creation_time: Utc::now(),
            messages: BTreeMap::new(),
        }
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    fn next_sender_msg_seq_num(&self) -> u32 {
        self.next_sender
    }

    fn next_target_msg_seq_num(&self) -> u32 {
        self.next_target
    }

    async fn set_next_sender_msg_seq_num(&mut self, seq: u32) -> Result<(), StoreError> {
        self.next_sender = seq;
        Ok(())
    }

    async fn set_next_target_msg_seq_num(&mut self, seq: u32) -> Result<(), StoreError> {
        self.next_target = seq;
        Ok(())
    }

    async fn incr_next_sender_msg_seq_num(&mut self) -> Result<(), StoreError> {
        self.next_sender += 1;
        Ok(())
    }

    async fn incr_next_target_msg_seq_num(&mut self) -> Result<(), StoreError> {
        self.next_target += 1;
        Ok(())
    }

    fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    async fn save_message(&mut self, seq: u32, payload: &[u8]) -> Result<(), StoreError> {
        self.messages.insert(seq, Bytes::copy_from_slice(payload));
        Ok(())
    }

    async fn messages_in_range(
        &self,
        begin: u32,
        end: u32,
    ) -> Result<Vec<(u32, Bytes)>, StoreError> {
        Ok(self
            .messages
            .range(begin..=end)
            .map(|(seq, payload)| (*seq, payload.clone()))
            .collect())
    }

    async fn reset(&mut self) -> Result<(), StoreError> {
        self.next_sender = 1;
        self.next_target = 1;
        self.creation_time = Utc::now();
        self.messages.clear();
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CounterRecord {
    next_sender: u32,
    next_target: u32,
    creation_time: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalRecord {
    seq: u32,
    payload_b64: String,
}

/// File-backed store: a JSON counter record, an append-only JSONL message
/// journal with base64 payloads, and a `seq offset` index file for ranged
/// retrieval.
pub struct FileMessageStore {
    base_dir: PathBuf,
    stem: String,
    next_sender: u32,
    next_target: u32,
    creation_time: DateTime<Utc>,
}

impl FileMessageStore {
    /// Open (or create) the store files under `base_dir` for a session
    /// file stem, restoring persisted counters.
    pub async fn open(
        base_dir: impl Into<PathBuf>,
        stem: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        let stem = stem.into();
        fs::create_dir_all(&base_dir).await?;

        let mut store = Self {
            base_dir,
            stem,
            next_sender: 1,
            next_target: 1,
            creation_time: Utc::now(),
        };
        if fs::try_exists(store.counters_path()).await? {
            store.refresh().await?;
        } else {
            store.write_counters().await?;
        }
        Ok(store)
    }

    fn counters_path(&self) -> PathBuf {
        self.base_dir.join(format!("{}.state.json", self.stem))
    }

    fn journal_path(&self) -> PathBuf {
        self.base_dir.join(format!("{}.journal.jsonl", self.stem))
    }

    fn index_path(&self) -> PathBuf {
        self.base_dir.join(format!("{}.idx", self.stem))
    }

    async fn write_counters(&self) -> Result<(), StoreError> {
        let record = CounterRecord {
            next_sender: self.next_sender,
            next_target: self.next_target,
            creation_time: self.creation_time,
        };
        fs::write(self.counters_path(), serde_json::to_vec(&record)?).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    fn next_sender_msg_seq_num(&self) -> u32 {
        self.next_sender
    }

    fn next_target_msg_seq_num(&self) -> u32 {
        self.next_target
    }

    async fn set_next_sender_msg_seq_num(&mut self, seq: u32) -> Result<(), StoreError> {
        self.next_sender = seq;
        self.write_counters().await
    }

    async fn set_next_target_msg_seq_num(&mut self, seq: u32) -> Result<(), StoreError> {
        self.next_target = seq;
        self.write_counters().await
    }

    async fn incr_next_sender_msg_seq_num(&mut self) -> Result<(), StoreError> {
        self.next_sender += 1;
        self.write_counters().await
    }

    async fn incr_next_target_msg_seq_num(&mut self) -> Result<(), StoreError> {
        self.next_target += 1;
        self.write_counters().await
    }

    fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    async fn save_message(&mut self, seq: u32, payload: &[u8]) -> Result<(), StoreError> {
        let offset = match fs::metadata(self.journal_path()).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let record = JournalRecord {
            seq,
            payload_b64: general_purpose::STANDARD.encode(payload),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())
            .await?;
        journal.write_all(&line).await?;
        journal.flush().await?;

        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.index_path())
            .await?;
        index
            .write_all(format!("{seq} {offset}\n").as_bytes())
            .await?;
        index.flush().await?;
        Ok(())
    }

    async fn messages_in_range(
        &self,
        begin: u32,
        end: u32,
    ) -> Result<Vec<(u32, Bytes)>, StoreError> {
        let index = match fs::read_to_string(self.index_path()).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut offsets: Vec<(u32, u64)> = Vec::new();
        for line in index.lines() {
            let mut parts = line.split_whitespace();
            let seq = parts.next().and_then(|s| s.parse::<u32>().ok());
            let offset = parts.next().and_then(|s| s.parse::<u64>().ok());
            if let (Some(seq), Some(offset)) = (seq, offset) {
                if seq >= begin && seq <= end {
                    offsets.push((seq, offset));
                }
            }
        }
        offsets.sort_by_key(|(seq, _)| *seq);

        let journal = fs::read(self.journal_path()).await?;
        let mut out: Vec<(u32, Bytes)> = Vec::with_capacity(offsets.len());
        for (seq, offset) in offsets {
            let rest = journal.get(offset as usize..).unwrap_or_default();
            let line_end = memchr::memchr(b'\n', rest).unwrap_or(rest.len());
            let record: JournalRecord = serde_json::from_slice(&rest[..line_end])?;
            let payload = general_purpose::STANDARD
                .decode(&record.payload_b64)
                .map_err(|e| {
                    StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                })?;
            out.push((seq, Bytes::from(payload)));
        }
        Ok(out)
    }

    async fn reset(&mut self) -> Result<(), StoreError> {
        self.next_sender = 1;
        self.next_target = 1;
        self.creation_time = Utc::now();
        fs::write(self.journal_path(), b"").await?;
        fs::write(self.index_path(), b"").await?;
        self.write_counters().await
    }

    async fn refresh(&mut self) -> Result<(), StoreError> {
        let raw = fs::read(self.counters_path()).await?;
        let record: CounterRecord = serde_json::from_slice(&raw)?;
        self.next_sender = record.next_sender;
        self.next_target = record.next_target;
        self.creation_time = record.creation_time;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_counters_and_ranges() {
        let mut store = MemoryMessageStore::new();
        assert_eq!(store.next_sender_msg_seq_num(), 1);
        assert_eq!(store.next_target_msg_seq_num(), 1);

        store.incr_next_sender_msg_seq_num().await.unwrap();
        store.save_message(1, b"one").await.unwrap();
        store.incr_next_sender_msg_seq_num().await.unwrap();
        store.save_message(2, b"two").await.unwrap();
        store.save_message(4, b"four").await.unwrap();

        let range = store.messages_in_range(1, 4).await.unwrap();
        let seqs: Vec<u32> = range.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![1, 2, 4]);

        store.reset().await.unwrap();
        assert_eq!(store.next_sender_msg_seq_num(), 1);
        assert!(store.messages_in_range(1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = FileMessageStore::open(dir.path(), "FIX.4.2_ISLD_TW")
                .await
                .unwrap();
            store.set_next_sender_msg_seq_num(7).await.unwrap();
            store.incr_next_target_msg_seq_num().await.unwrap();
            store.save_message(5, b"8=FIX.4.2\x01...").await.unwrap();
            store.save_message(6, b"second").await.unwrap();
        }

        let store = FileMessageStore::open(dir.path(), "FIX.4.2_ISLD_TW")
            .await
            .unwrap();
        assert_eq!(store.next_sender_msg_seq_num(), 7);
        assert_eq!(store.next_target_msg_seq_num(), 2);

        let range = store.messages_in_range(5, 6).await.unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].1.as_ref(), b"8=FIX.4.2\x01...");
        assert_eq!(range[1].1.as_ref(), b"second");
    }

    #[tokio::test]
    async fn file_store_reset_clears_journal() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileMessageStore::open(dir.path(), "s").await.unwrap();
        store.save_message(1, b"payload").await.unwrap();
        store.set_next_sender_msg_seq_num(2).await.unwrap();

        store.reset().await.unwrap();
        assert_eq!(store.next_sender_msg_seq_num(), 1);
        assert!(store.messages_in_range(1, 100).await.unwrap().is_empty());
    }
}
