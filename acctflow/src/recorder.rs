//! Audit trail writers
//!
//! [`IngestRecorder`] creates the record for a message before any downstream work
//! starts; [`OutcomeRecorder`] writes each resolved attempt onto that record. Storage
//! failures are logged and returned to the caller, never swallowed.

use crate::model::{AccountEvent, BusCoordinates};
use crate::store::{NewTransaction, StorageError, TransactionRecord, TransactionStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error};

/// Status written while a message is waiting out a retry backoff
pub const PENDING_RETRY_STATUS: i32 = -1;

/// Status written when the downstream call failed in an unclassified way
pub const UNEXPECTED_ERROR_STATUS: i32 = -2;

pub const PENDING_RETRY_PREFIX: &str = "Pending retry: ";
pub const UNEXPECTED_PREFIX: &str = "Unexpected: ";

/// Persists the pre-processing record for every received message
#[derive(Clone)]
pub struct IngestRecorder {
    store: Arc<dyn TransactionStore>,
}

impl IngestRecorder {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self { store }
    }

    /// Creates the audit record with a null status
    ///
    /// # Returns
    /// * `Ok(TransactionRecord)` - The stored record with its assigned id
    /// * `Err(StorageError)` - The store rejected the write; the message must not be processed
    pub async fn record_receipt(
        &self,
        event: &AccountEvent,
        coordinates: &BusCoordinates,
        enqueued_at: Option<DateTime<Utc>>,
    ) -> Result<TransactionRecord, StorageError> {
        let new = NewTransaction {
            event: event.clone(),
            coordinates: coordinates.clone(),
            enqueued_at,
            received_at: Utc::now(),
        };
        match self.store.insert(new).await {
            Ok(record) => {
                debug!(
                    "Saved incoming message as transaction {} ({}, account {})",
                    record.id,
                    coordinates,
                    event.masked_account_number()
                );
                Ok(record)
            }
            Err(e) => {
                error!("Failed to save incoming message at {}: {}", coordinates, e);
                Err(e)
            }
        }
    }
}

/// Writes attempt outcomes onto existing audit records
#[derive(Clone)]
pub struct OutcomeRecorder {
    store: Arc<dyn TransactionStore>,
}

impl OutcomeRecorder {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self { store }
    }

    /// Updates status, message and processing time of record `id`
    pub async fn record_outcome(
        &self,
        id: u64,
        status: i32,
        message: Option<String>,
    ) -> Result<TransactionRecord, StorageError> {
        match self
            .store
            .update_status(id, status, message, Utc::now())
            .await
        {
            Ok(record) => {
                debug!("Transaction {} updated with status {}", id, status);
                Ok(record)
            }
            Err(e) => {
                error!(
                    "Failed to update transaction {} with status {}: {}",
                    id, status, e
                );
                Err(e)
            }
        }
    }

    /// Downstream success, or a client error status
    pub async fn record_response(
        &self,
        id: u64,
        status: u16,
        message: Option<String>,
    ) -> Result<TransactionRecord, StorageError> {
        self.record_outcome(id, i32::from(status), message).await
    }

    pub async fn record_pending_retry(
        &self,
        id: u64,
        reason: &str,
    ) -> Result<TransactionRecord, StorageError> {
        self.record_outcome(
            id,
            PENDING_RETRY_STATUS,
            Some(format!("{}{}", PENDING_RETRY_PREFIX, reason)),
        )
        .await
    }

    pub async fn record_unexpected(
        &self,
        id: u64,
        reason: &str,
    ) -> Result<TransactionRecord, StorageError> {
        self.record_outcome(
            id,
            UNEXPECTED_ERROR_STATUS,
            Some(format!("{}{}", UNEXPECTED_PREFIX, reason)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AccountAction;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;

    fn event() -> AccountEvent {
        AccountEvent {
            first_name: "Karen".into(),
            last_name: "Moore".into(),
            account_number: "ACC-DEADBEEF".into(),
            account_action: AccountAction::Activate,
            producer_ts: None,
        }
    }

    fn coordinates() -> BusCoordinates {
        BusCoordinates {
            topic: "accounts".into(),
            partition: 0,
            offset: 3,
        }
    }

    /// Store that refuses every operation
    struct DownStore;

    #[async_trait]
    impl TransactionStore for DownStore {
        async fn insert(&self, _: NewTransaction) -> Result<TransactionRecord, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn update_status(
            &self,
            _: u64,
            _: i32,
            _: Option<String>,
            _: DateTime<Utc>,
        ) -> Result<TransactionRecord, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn get(&self, _: u64) -> Result<Option<TransactionRecord>, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn commit(&self, _: &str, _: i32, _: i64) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn committed_offset(&self, _: &str, _: i32) -> Result<Option<i64>, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn find_by_status(
            &self,
            _: Option<i32>,
        ) -> Result<Vec<TransactionRecord>, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn count(&self) -> Result<usize, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_receipt_then_outcome() {
        let store = Arc::new(InMemoryStore::new());
        let ingest = IngestRecorder::new(store.clone());
        let outcomes = OutcomeRecorder::new(store.clone());

        let record = ingest
            .record_receipt(&event(), &coordinates(), None)
            .await
            .unwrap();
        assert_eq!(record.status, None);

        outcomes
            .record_response(record.id, 200, Some("Task completed".into()))
            .await
            .unwrap();
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Some(200));
        assert_eq!(stored.response_message.as_deref(), Some("Task completed"));
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_sentinel_messages() {
        let store = Arc::new(InMemoryStore::new());
        let ingest = IngestRecorder::new(store.clone());
        let outcomes = OutcomeRecorder::new(store.clone());
        let record = ingest
            .record_receipt(&event(), &coordinates(), None)
            .await
            .unwrap();

        let pending = outcomes
            .record_pending_retry(record.id, "HTTP error 503: busy")
            .await
            .unwrap();
        assert_eq!(pending.status, Some(PENDING_RETRY_STATUS));
        assert_eq!(
            pending.response_message.as_deref(),
            Some("Pending retry: HTTP error 503: busy")
        );

        let unexpected = outcomes
            .record_unexpected(record.id, "bad body")
            .await
            .unwrap();
        assert_eq!(unexpected.status, Some(UNEXPECTED_ERROR_STATUS));
        assert_eq!(
            unexpected.response_message.as_deref(),
            Some("Unexpected: bad body")
        );
    }

    #[tokio::test]
    async fn test_storage_errors_propagate() {
        let store: Arc<dyn TransactionStore> = Arc::new(DownStore);
        let ingest = IngestRecorder::new(store.clone());
        let outcomes = OutcomeRecorder::new(store);

        assert!(matches!(
            ingest.record_receipt(&event(), &coordinates(), None).await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(matches!(
            outcomes.record_response(1, 200, None).await,
            Err(StorageError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_outcome_for_unknown_record() {
        let outcomes = OutcomeRecorder::new(Arc::new(InMemoryStore::new()));
        assert!(matches!(
            outcomes.record_response(42, 200, None).await,
            Err(StorageError::NotFound(42))
        ));
    }
}
