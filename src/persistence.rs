//! Exception persistence contract
//!
//! The runtime only needs two operations from storage: record an exception
//! against a message and mark a message for retry. Schema and storage engine
//! belong to the implementor.

use crate::error::{StepFault, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

/// Which side of the exchange an exception belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionTarget {
    Inbound,
    Outbound,
}

/// Follow-up required after an exception
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionDisposition {
    /// Partner must be told (error signal / notification)
    NotifyPartner,
    NoFollowUp,
}

impl ExceptionDisposition {
    pub fn from_notify_flag(notify: bool) -> Self {
        if notify {
            ExceptionDisposition::NotifyPartner
        } else {
            ExceptionDisposition::NoFollowUp
        }
    }
}

/// One persisted exception
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub id: Uuid,
    pub target: ExceptionTarget,
    pub correlation_id: String,
    /// Step or phase that raised the fault
    pub source: String,
    pub kind: String,
    pub message: String,
    pub disposition: ExceptionDisposition,
    pub recorded_at: DateTime<Utc>,
}

impl ExceptionRecord {
    pub fn from_fault(
        target: ExceptionTarget,
        correlation_id: impl Into<String>,
        source: impl Into<String>,
        fault: &StepFault,
        disposition: ExceptionDisposition,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            correlation_id: correlation_id.into(),
            source: source.into(),
            kind: fault.kind().to_string(),
            message: fault.sanitized_message(),
            disposition,
            recorded_at: Utc::now(),
        }
    }
}

/// Storage collaborator for exception bookkeeping
#[async_trait]
pub trait ExceptionStore: Send + Sync {
    async fn record_exception(&self, record: ExceptionRecord) -> Result<(), StoreError>;

    async fn mark_for_retry(&self, correlation_id: &str) -> Result<(), StoreError>;
}

/// Process-local store, used by the binary and tests
#[derive(Debug, Default)]
pub struct InMemoryExceptionStore {
    records: Mutex<Vec<ExceptionRecord>>,
    retries: Mutex<HashSet<String>>,
}

impl InMemoryExceptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExceptionRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn records_for(&self, correlation_id: &str) -> Vec<ExceptionRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.correlation_id == correlation_id)
            .collect()
    }

    pub fn is_marked_for_retry(&self, correlation_id: &str) -> bool {
        self.retries
            .lock()
            .map(|retries| retries.contains(correlation_id))
            .unwrap_or(false)
    }

    /// Take every id marked for retry, clearing the marks
    pub fn take_retries(&self) -> Vec<String> {
        match self.retries.lock() {
            Ok(mut retries) => retries.drain().collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl ExceptionStore for InMemoryExceptionStore {
    async fn record_exception(&self, record: ExceptionRecord) -> Result<(), StoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::Unavailable("exception records lock poisoned".to_string()))?;
        records.push(record);
        Ok(())
    }

    async fn mark_for_retry(&self, correlation_id: &str) -> Result<(), StoreError> {
        let mut retries = self
            .retries
            .lock()
            .map_err(|_| StoreError::Unavailable("retry marks lock poisoned".to_string()))?;
        retries.insert(correlation_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_records_and_retries() {
        let store = InMemoryExceptionStore::new();
        let fault = StepFault::step_failed("deliver", "partner offline");

        store
            .record_exception(ExceptionRecord::from_fault(
                ExceptionTarget::Outbound,
                "msg-1",
                "deliver",
                &fault,
                ExceptionDisposition::NoFollowUp,
            ))
            .await
            .unwrap();
        store.mark_for_retry("msg-1").await.unwrap();

        let records = store.records_for("msg-1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "step_failed");
        assert_eq!(records[0].target, ExceptionTarget::Outbound);
        assert!(store.is_marked_for_retry("msg-1"));

        assert_eq!(store.take_retries(), vec!["msg-1".to_string()]);
        assert!(!store.is_marked_for_retry("msg-1"));
    }

    #[test]
    fn test_disposition_from_flag() {
        assert_eq!(
            ExceptionDisposition::from_notify_flag(true),
            ExceptionDisposition::NotifyPartner
        );
        assert_eq!(
            ExceptionDisposition::from_notify_flag(false),
            ExceptionDisposition::NoFollowUp
        );
    }
}
