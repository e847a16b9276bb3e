//! Transaction audit store
//!
//! Every consumed message gets one [`TransactionRecord`]. Records are inserted with a
//! null status, updated as delivery attempts resolve, and never deleted. The store also
//! keeps the committed read position per partition so a restarted consumer resumes
//! after the last message that reached a terminal disposition.

use crate::model::{AccountAction, AccountEvent, BusCoordinates};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    /// No record with this id
    #[error("transaction record {0} not found")]
    NotFound(u64),

    /// The store cannot currently serve requests
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("journal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The journal holds something that cannot be replayed
    #[error("journal corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// Durable audit row for one consumed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: u64,
    pub first_name: String,
    pub last_name: String,
    pub account_number: String,
    pub account_action: AccountAction,
    pub kafka_topic: String,
    pub kafka_partition: i32,
    pub kafka_offset: i64,
    pub event_enqueued_time: Option<DateTime<Utc>>,
    pub producer_ts: Option<DateTime<Utc>>,
    pub status: Option<i32>,
    pub response_message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn coordinates(&self) -> BusCoordinates {
        BusCoordinates {
            topic: self.kafka_topic.clone(),
            partition: self.kafka_partition,
            offset: self.kafka_offset,
        }
    }
}

/// Input for [`TransactionStore::insert`]
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub event: AccountEvent,
    pub coordinates: BusCoordinates,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

impl NewTransaction {
    fn into_record(self, id: u64, created_at: DateTime<Utc>) -> TransactionRecord {
        TransactionRecord {
            id,
            first_name: self.event.first_name,
            last_name: self.event.last_name,
            account_number: self.event.account_number,
            account_action: self.event.account_action,
            kafka_topic: self.coordinates.topic,
            kafka_partition: self.coordinates.partition,
            kafka_offset: self.coordinates.offset,
            event_enqueued_time: self.enqueued_at,
            producer_ts: self.event.producer_ts,
            status: None,
            response_message: None,
            received_at: self.received_at,
            processed_at: None,
            created_at,
        }
    }
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persists a new record with a null status and assigns its id
    async fn insert(&self, new: NewTransaction) -> Result<TransactionRecord, StorageError>;

    /// Sets status, message and processing time on an existing record
    async fn update_status(
        &self,
        id: u64,
        status: i32,
        message: Option<String>,
        processed_at: DateTime<Utc>,
    ) -> Result<TransactionRecord, StorageError>;

    async fn get(&self, id: u64) -> Result<Option<TransactionRecord>, StorageError>;

    /// Records that everything before `next_offset` on the partition is finished
    async fn commit(
        &self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), StorageError>;

    /// Next offset to read on the partition, if anything was ever committed
    async fn committed_offset(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>, StorageError>;

    /// Records whose status equals `status`; `None` selects records still awaiting an outcome
    async fn find_by_status(
        &self,
        status: Option<i32>,
    ) -> Result<Vec<TransactionRecord>, StorageError>;

    async fn count(&self) -> Result<usize, StorageError>;
}

/// Shared table used by both store implementations
#[derive(Debug, Default)]
struct Table {
    records: BTreeMap<u64, TransactionRecord>,
    committed: HashMap<(String, i32), i64>,
    next_id: u64,
}

impl Table {
    fn insert(&mut self, new: NewTransaction, created_at: DateTime<Utc>) -> TransactionRecord {
        self.next_id += 1;
        let record = new.into_record(self.next_id, created_at);
        self.records.insert(record.id, record.clone());
        record
    }

    fn restore(&mut self, record: TransactionRecord) {
        self.next_id = self.next_id.max(record.id);
        self.records.insert(record.id, record);
    }

    fn update(
        &mut self,
        id: u64,
        status: i32,
        message: Option<String>,
        processed_at: DateTime<Utc>,
    ) -> Result<TransactionRecord, StorageError> {
        let record = self.records.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        record.status = Some(status);
        record.response_message = message;
        record.processed_at = Some(processed_at);
        Ok(record.clone())
    }

    fn commit(&mut self, topic: &str, partition: i32, next_offset: i64) {
        let entry = self
            .committed
            .entry((topic.to_string(), partition))
            .or_insert(next_offset);
        *entry = (*entry).max(next_offset);
    }

    fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.committed.get(&(topic.to_string(), partition)).copied()
    }

    fn find_by_status(&self, status: Option<i32>) -> Vec<TransactionRecord> {
        self.records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Unavailable("store lock poisoned".to_string())
}

/// Volatile store for tests and for runs without a journal
#[derive(Debug, Default)]
pub struct InMemoryStore {
    table: Mutex<Table>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn insert(&self, new: NewTransaction) -> Result<TransactionRecord, StorageError> {
        let mut table = self.table.lock().map_err(poisoned)?;
        Ok(table.insert(new, Utc::now()))
    }

    async fn update_status(
        &self,
        id: u64,
        status: i32,
        message: Option<String>,
        processed_at: DateTime<Utc>,
    ) -> Result<TransactionRecord, StorageError> {
        let mut table = self.table.lock().map_err(poisoned)?;
        table.update(id, status, message, processed_at)
    }

    async fn get(&self, id: u64) -> Result<Option<TransactionRecord>, StorageError> {
        let table = self.table.lock().map_err(poisoned)?;
        Ok(table.records.get(&id).cloned())
    }

    async fn commit(
        &self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), StorageError> {
        let mut table = self.table.lock().map_err(poisoned)?;
        table.commit(topic, partition, next_offset);
        Ok(())
    }

    async fn committed_offset(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>, StorageError> {
        let table = self.table.lock().map_err(poisoned)?;
        Ok(table.committed(topic, partition))
    }

    async fn find_by_status(
        &self,
        status: Option<i32>,
    ) -> Result<Vec<TransactionRecord>, StorageError> {
        let table = self.table.lock().map_err(poisoned)?;
        Ok(table.find_by_status(status))
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let table = self.table.lock().map_err(poisoned)?;
        Ok(table.records.len())
    }
}

/// One line of the journal
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum JournalEntry {
    Insert {
        record: TransactionRecord,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        id: u64,
        status: i32,
        message: Option<String>,
        processed_at: DateTime<Utc>,
    },
    Commit {
        topic: String,
        partition: i32,
        next: i64,
    },
}

struct Journal {
    table: Table,
    file: File,
}

impl Journal {
    fn append(&mut self, entry: &JournalEntry) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(entry).map_err(|e| StorageError::Corrupt {
            line: 0,
            reason: format!("failed to encode journal entry: {}", e),
        })?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Result of replaying a journal file
struct Replayed {
    table: Table,
    /// Byte length of the journal up to the end of the last decodable line
    valid_len: u64,
    /// The last decodable line was written without its newline
    unterminated: bool,
}

/// Store backed by an append-only JSON-lines journal
///
/// The whole journal is replayed into memory on open; every mutation is appended and
/// flushed before it is applied. A torn final line (a crash mid-write) is dropped with a
/// warning and cut from the file, any other undecodable line fails the open. Appends run
/// on the blocking pool.
pub struct JournalStore {
    path: PathBuf,
    inner: Arc<Mutex<Journal>>,
}

impl JournalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let replayed = Self::replay(&path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() > replayed.valid_len {
            file.set_len(replayed.valid_len)?;
        }
        if replayed.unterminated {
            file.write_all(b"\n")?;
            file.flush()?;
        }

        info!(
            "Opened transaction journal {} ({} records)",
            path.display(),
            replayed.table.records.len()
        );
        Ok(Self {
            path,
            inner: Arc::new(Mutex::new(Journal {
                table: replayed.table,
                file,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path) -> Result<Replayed, StorageError> {
        let mut replayed = Replayed {
            table: Table::default(),
            valid_len: 0,
            unterminated: false,
        };
        if !path.exists() {
            return Ok(replayed);
        }

        let mut reader = BufReader::new(File::open(path)?);
        let mut raw = Vec::new();
        let mut offset: u64 = 0;
        let mut line_no = 0;
        loop {
            raw.clear();
            let read = reader.read_until(b'\n', &mut raw)?;
            if read == 0 {
                break;
            }
            line_no += 1;
            let terminated = raw.last() == Some(&b'\n');
            let line_end = offset + read as u64;
            offset = line_end;

            let text = String::from_utf8_lossy(&raw);
            if text.trim().is_empty() {
                replayed.valid_len = line_end;
                continue;
            }
            let at_end = reader.fill_buf()?.is_empty();
            let entry: JournalEntry = match serde_json::from_str(text.trim_end()) {
                Ok(entry) => entry,
                Err(e) if at_end => {
                    warn!(
                        "Dropping torn trailing journal line {} in {}: {}",
                        line_no,
                        path.display(),
                        e
                    );
                    break;
                }
                Err(e) => {
                    return Err(StorageError::Corrupt {
                        line: line_no,
                        reason: e.to_string(),
                    })
                }
            };

            match entry {
                JournalEntry::Insert { record } => replayed.table.restore(record),
                JournalEntry::Update {
                    id,
                    status,
                    message,
                    processed_at,
                } => {
                    replayed
                        .table
                        .update(id, status, message, processed_at)
                        .map_err(|e| StorageError::Corrupt {
                            line: line_no,
                            reason: e.to_string(),
                        })?;
                }
                JournalEntry::Commit {
                    topic,
                    partition,
                    next,
                } => replayed.table.commit(&topic, partition, next),
            }
            replayed.valid_len = line_end;
            replayed.unterminated = !terminated;
        }
        Ok(replayed)
    }

    /// Runs a journal mutation on the blocking pool
    async fn mutate<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Journal) -> Result<T, StorageError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut journal = inner.lock().map_err(poisoned)?;
            f(&mut *journal)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("journal writer failed: {}", e)))?
    }
}

#[async_trait]
impl TransactionStore for JournalStore {
    async fn insert(&self, new: NewTransaction) -> Result<TransactionRecord, StorageError> {
        self.mutate(move |journal| {
            let record = new.into_record(journal.table.next_id + 1, Utc::now());
            journal.append(&JournalEntry::Insert {
                record: record.clone(),
            })?;
            journal.table.restore(record.clone());
            Ok(record)
        })
        .await
    }

    async fn update_status(
        &self,
        id: u64,
        status: i32,
        message: Option<String>,
        processed_at: DateTime<Utc>,
    ) -> Result<TransactionRecord, StorageError> {
        self.mutate(move |journal| {
            if !journal.table.records.contains_key(&id) {
                return Err(StorageError::NotFound(id));
            }
            journal.append(&JournalEntry::Update {
                id,
                status,
                message: message.clone(),
                processed_at,
            })?;
            journal.table.update(id, status, message, processed_at)
        })
        .await
    }

    async fn get(&self, id: u64) -> Result<Option<TransactionRecord>, StorageError> {
        let journal = self.inner.lock().map_err(poisoned)?;
        Ok(journal.table.records.get(&id).cloned())
    }

    async fn commit(
        &self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), StorageError> {
        let topic = topic.to_string();
        self.mutate(move |journal| {
            journal.append(&JournalEntry::Commit {
                topic: topic.clone(),
                partition,
                next: next_offset,
            })?;
            journal.table.commit(&topic, partition, next_offset);
            Ok(())
        })
        .await
    }

    async fn committed_offset(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>, StorageError> {
        let journal = self.inner.lock().map_err(poisoned)?;
        Ok(journal.table.committed(topic, partition))
    }

    async fn find_by_status(
        &self,
        status: Option<i32>,
    ) -> Result<Vec<TransactionRecord>, StorageError> {
        let journal = self.inner.lock().map_err(poisoned)?;
        Ok(journal.table.find_by_status(status))
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let journal = self.inner.lock().map_err(poisoned)?;
        Ok(journal.table.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_transaction(offset: i64) -> NewTransaction {
        NewTransaction {
            event: AccountEvent {
                first_name: "Linda".into(),
                last_name: "Walker".into(),
                account_number: "ACC-00C0FFEE".into(),
                account_action: AccountAction::Suspend,
                producer_ts: Some(Utc::now()),
            },
            coordinates: BusCoordinates {
                topic: "accounts".into(),
                partition: 0,
                offset,
            },
            enqueued_at: None,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_insert_starts_with_null_status() {
        let store = InMemoryStore::new();
        let record = store.insert(new_transaction(5)).await.unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(record.status, None);
        assert_eq!(record.response_message, None);
        assert_eq!(record.processed_at, None);
        assert_eq!(record.kafka_offset, 5);
        assert_eq!(record.account_action, AccountAction::Suspend);
    }

    #[tokio::test]
    async fn test_in_memory_update_and_lookup() {
        let store = InMemoryStore::new();
        let record = store.insert(new_transaction(0)).await.unwrap();
        let now = Utc::now();
        store
            .update_status(record.id, 200, Some("ok".into()), now)
            .await
            .unwrap();
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Some(200));
        assert_eq!(stored.response_message.as_deref(), Some("ok"));
        assert_eq!(stored.processed_at, Some(now));
    }

    #[tokio::test]
    async fn test_update_missing_record_fails() {
        let store = InMemoryStore::new();
        let err = store
            .update_status(99, 200, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(99)));
    }

    #[tokio::test]
    async fn test_commit_only_moves_forward() {
        let store = InMemoryStore::new();
        assert_eq!(store.committed_offset("accounts", 0).await.unwrap(), None);
        store.commit("accounts", 0, 10).await.unwrap();
        store.commit("accounts", 0, 4).await.unwrap();
        assert_eq!(store.committed_offset("accounts", 0).await.unwrap(), Some(10));
        assert_eq!(store.committed_offset("accounts", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_find_by_status() {
        let store = InMemoryStore::new();
        let a = store.insert(new_transaction(0)).await.unwrap();
        let _b = store.insert(new_transaction(1)).await.unwrap();
        store
            .update_status(a.id, -1, Some("Pending retry: x".into()), Utc::now())
            .await
            .unwrap();
        assert_eq!(store.find_by_status(Some(-1)).await.unwrap().len(), 1);
        assert_eq!(store.find_by_status(None).await.unwrap().len(), 1);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.jsonl");

        let id = {
            let store = JournalStore::open(&path).unwrap();
            let record = store.insert(new_transaction(7)).await.unwrap();
            store
                .update_status(record.id, 404, Some("missing".into()), Utc::now())
                .await
                .unwrap();
            store.commit("accounts", 0, 8).await.unwrap();
            record.id
        };

        let reopened = JournalStore::open(&path).unwrap();
        let record = reopened.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, Some(404));
        assert_eq!(record.response_message.as_deref(), Some("missing"));
        assert_eq!(
            reopened.committed_offset("accounts", 0).await.unwrap(),
            Some(8)
        );

        let next = reopened.insert(new_transaction(8)).await.unwrap();
        assert_eq!(next.id, id + 1);
    }

    #[tokio::test]
    async fn test_journal_drops_torn_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.jsonl");
        {
            let store = JournalStore::open(&path).unwrap();
            store.insert(new_transaction(0)).await.unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"update\",\"id\":1,\"sta").unwrap();

        let store = JournalStore::open(&path).unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get(1).await.unwrap().unwrap().status, None);
    }

    #[tokio::test]
    async fn test_journal_writes_after_torn_tail_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.jsonl");
        {
            let store = JournalStore::open(&path).unwrap();
            store.insert(new_transaction(0)).await.unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"update\",\"id\":1,\"sta").unwrap();
        drop(file);

        let second = {
            let store = JournalStore::open(&path).unwrap();
            store.insert(new_transaction(1)).await.unwrap()
        };
        assert_eq!(second.id, 2);

        let third = {
            let store = JournalStore::open(&path).unwrap();
            assert_eq!(store.count().await.unwrap(), 2);
            store.insert(new_transaction(2)).await.unwrap()
        };
        assert_eq!(third.id, 3);

        let store = JournalStore::open(&path).unwrap();
        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(store.get(2).await.unwrap().unwrap().kafka_offset, 1);
        assert_eq!(store.get(3).await.unwrap().unwrap().kafka_offset, 2);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("\"sta{"));
    }

    #[tokio::test]
    async fn test_journal_terminates_unterminated_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.jsonl");
        std::fs::write(
            &path,
            "{\"op\":\"commit\",\"topic\":\"accounts\",\"partition\":0,\"next\":4}",
        )
        .unwrap();

        {
            let store = JournalStore::open(&path).unwrap();
            assert_eq!(store.committed_offset("accounts", 0).await.unwrap(), Some(4));
            store.commit("accounts", 0, 5).await.unwrap();
        }

        let store = JournalStore::open(&path).unwrap();
        assert_eq!(store.committed_offset("accounts", 0).await.unwrap(), Some(5));
    }

    #[test]
    fn test_journal_rejects_corruption_before_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.jsonl");
        std::fs::write(
            &path,
            "garbage\n{\"op\":\"commit\",\"topic\":\"accounts\",\"partition\":0,\"next\":1}\n",
        )
        .unwrap();
        match JournalStore::open(&path) {
            Err(StorageError::Corrupt { line, .. }) => assert_eq!(line, 1),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("corrupt journal opened"),
        }
    }
}
