// ==============================================================================
// testing.rs - In-memory Collaborator Fakes
// ==============================================================================
// Description: Test doubles for LabResultStore, ObjectStore and TextExtractor
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::extraction::{ExtractedText, ExtractionError, TextExtractor};
use crate::models::{BiomarkerCandidate, LabResult, ProcessingStatus};
use crate::repository::{claim_allowed, ClaimOutcome, LabResultStore, StoreError};
use crate::storage::{ObjectStore, StorageError, StoredObject};

/// Store step at which [`InMemoryLabStore`] simulates a concurrent delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeStep {
    RecordText,
    ReplaceBiomarkers,
    Complete,
}

struct Record {
    lab: LabResult,
    biomarkers: Vec<BiomarkerCandidate>,
}

/// Lab result store with the same conditional semantics as the Postgres one
#[derive(Default)]
pub struct InMemoryLabStore {
    records: Mutex<HashMap<Uuid, Record>>,
    history: Mutex<Vec<(Uuid, ProcessingStatus)>>,
    delete_during: Mutex<Option<FakeStep>>,
}

impl InMemoryLabStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, status: ProcessingStatus, attempt: u32, storage_key: &str) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let lab = LabResult {
            id,
            user_id: "user-1".to_string(),
            system_id: "system-1".to_string(),
            file_name: "report.txt".to_string(),
            storage_key: storage_key.to_string(),
            file_url: None,
            raw_text: None,
            processing_status: status,
            ingestion_attempt: attempt,
            created_at: now,
            updated_at: now,
        };
        self.records.lock().unwrap().insert(
            id,
            Record {
                lab,
                biomarkers: Vec::new(),
            },
        );
        id
    }

    pub fn insert_pending(&self, storage_key: &str) -> Uuid {
        self.insert(ProcessingStatus::Pending, 0, storage_key)
    }

    pub fn set_biomarkers(&self, id: Uuid, biomarkers: Vec<BiomarkerCandidate>) {
        if let Some(record) = self.records.lock().unwrap().get_mut(&id) {
            record.biomarkers = biomarkers;
        }
    }

    pub fn get(&self, id: Uuid) -> Option<LabResult> {
        self.records.lock().unwrap().get(&id).map(|r| r.lab.clone())
    }

    pub fn status(&self, id: Uuid) -> Option<ProcessingStatus> {
        self.get(id).map(|lab| lab.processing_status)
    }

    pub fn biomarkers(&self, id: Uuid) -> Vec<BiomarkerCandidate> {
        self.records
            .lock()
            .unwrap()
            .get(&id)
            .map(|r| r.biomarkers.clone())
            .unwrap_or_default()
    }

    /// Every status a record was moved to, in order
    pub fn history(&self, id: Uuid) -> Vec<ProcessingStatus> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(rid, _)| *rid == id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn remove(&self, id: Uuid) {
        self.records.lock().unwrap().remove(&id);
    }

    /// Delete the record right before `step` runs
    pub fn delete_during(&self, step: FakeStep) {
        *self.delete_during.lock().unwrap() = Some(step);
    }

    fn maybe_delete(&self, id: Uuid, step: FakeStep) {
        if *self.delete_during.lock().unwrap() == Some(step) {
            self.remove(id);
        }
    }

    fn set_status(&self, record: &mut Record, status: ProcessingStatus) {
        record.lab.processing_status = status;
        record.lab.updated_at = Utc::now();
        self.history.lock().unwrap().push((record.lab.id, status));
    }

    fn transition(
        &self,
        id: Uuid,
        expected: ProcessingStatus,
        next: ProcessingStatus,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.lab.processing_status != expected {
            return Err(StoreError::StaleState {
                id,
                expected,
                found: record.lab.processing_status,
            });
        }
        self.set_status(record, next);
        Ok(())
    }
}

#[async_trait]
impl LabResultStore for InMemoryLabStore {
    async fn claim(&self, id: Uuid, attempt: u32) -> Result<ClaimOutcome, StoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let previous = record.lab.processing_status;

        if claim_allowed(previous, record.lab.ingestion_attempt, attempt) {
            record.lab.ingestion_attempt = attempt;
            self.set_status(record, ProcessingStatus::Processing);
            Ok(ClaimOutcome::Claimed { previous })
        } else if previous.is_terminal() {
            Ok(ClaimOutcome::AlreadyTerminal(previous))
        } else {
            Ok(ClaimOutcome::Superseded {
                current_attempt: record.lab.ingestion_attempt,
            })
        }
    }

    async fn record_extracted_text(&self, id: Uuid, raw_text: &str) -> Result<(), StoreError> {
        self.maybe_delete(id, FakeStep::RecordText);
        self.transition(id, ProcessingStatus::Processing, ProcessingStatus::Parsing)?;
        if let Some(record) = self.records.lock().unwrap().get_mut(&id) {
            record.lab.raw_text = Some(raw_text.to_string());
        }
        Ok(())
    }

    async fn replace_biomarkers(
        &self,
        id: Uuid,
        candidates: &[BiomarkerCandidate],
    ) -> Result<usize, StoreError> {
        self.maybe_delete(id, FakeStep::ReplaceBiomarkers);
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.lab.processing_status != ProcessingStatus::Parsing {
            return Err(StoreError::StaleState {
                id,
                expected: ProcessingStatus::Parsing,
                found: record.lab.processing_status,
            });
        }
        record.biomarkers = candidates.to_vec();
        Ok(candidates.len())
    }

    async fn mark_completed(&self, id: Uuid) -> Result<(), StoreError> {
        self.maybe_delete(id, FakeStep::Complete);
        self.transition(id, ProcessingStatus::Parsing, ProcessingStatus::Completed)
    }

    async fn mark_failed(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.lab.processing_status.is_terminal() {
            return Ok(false);
        }
        self.set_status(record, ProcessingStatus::Failed);
        Ok(true)
    }
}

/// Object store backed by a map, with switches to inject failures
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_put: AtomicBool,
    pub fail_fetch: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(key: &str, bytes: &[u8]) -> Self {
        let store = Self::new();
        store
            .objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        store
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bytes: Vec<u8>, key: &str) -> Result<StoredObject, StorageError> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("put disabled".to_string()));
        }
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(StoredObject {
            key: key.to_string(),
            url: format!("memory://{}", key),
        })
    }

    async fn read_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        if !self.contains(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(format!("memory://{}?ttl={}", key, ttl.as_secs()))
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("fetch disabled".to_string()));
        }
        let key = url
            .strip_prefix("memory://")
            .and_then(|rest| rest.split('?').next())
            .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("delete disabled".to_string()));
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

enum Behavior {
    Text(String),
    Fail,
    Delay(Duration, String),
}

/// Extractor returning canned text, an error, or text after a delay
pub struct FakeExtractor {
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
}

impl FakeExtractor {
    fn with(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::with(Behavior::Text(text.to_string()))
    }

    pub fn failing() -> Self {
        Self::with(Behavior::Fail)
    }

    pub fn slow(delay: Duration, text: &str) -> Self {
        Self::with(Behavior::Delay(delay, text.to_string()))
    }

    pub fn set_text(&self, text: &str) {
        *self.behavior.lock().unwrap() = Behavior::Text(text.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextExtractor for FakeExtractor {
    async fn extract(&self, _bytes: &[u8]) -> Result<ExtractedText, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        // Decide under the lock, sleep outside it
        let (delay, result) = match &*self.behavior.lock().unwrap() {
            Behavior::Text(text) => (None, Ok(text.clone())),
            Behavior::Fail => (
                None,
                Err(ExtractionError::Service {
                    status: 503,
                    body: "ocr unavailable".to_string(),
                }),
            ),
            Behavior::Delay(delay, text) => (Some(*delay), Ok(text.clone())),
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result.map(ExtractedText::from_text)
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
