//! In-memory gateways and fixtures for unit tests.

use crate::analysis_invoker::{AnalysisError, AnalysisInvoker, MockVisionCapability};
use crate::batch_coordinator::UploadedImage;
use crate::blob_gateway::BlobGateway;
use crate::error::{ServiceError, ServiceResult};
use crate::record_store::{
    expiry_cutoff, validate_listing, validate_transition, AnalysisRecord, NewRecord, RecordState,
    RecordStore, User,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BLOB_BASE_URL: &str = "https://blobs.test";

/// Image fixture with a jpeg mime type
pub fn image(filename: &str, bytes: &[u8]) -> UploadedImage {
    UploadedImage {
        bytes: Bytes::copy_from_slice(bytes),
        mime_type: "image/jpeg".to_string(),
        filename: filename.to_string(),
    }
}

/// Invoker whose vision capability fails for images whose bytes are `broken`
/// and otherwise reports the image size
pub fn scripted_invoker() -> Arc<AnalysisInvoker> {
    let mut vision = MockVisionCapability::new();
    vision.expect_describe().returning(|image, _, _| {
        if image == b"broken" {
            Err(AnalysisError::Upstream {
                status: 500,
                body: "model unavailable".to_string(),
            })
        } else {
            Ok(format!("assessment of {} bytes", image.len()))
        }
    });
    Arc::new(AnalysisInvoker::new(Arc::new(vision), Duration::from_secs(5)))
}

#[derive(Default)]
struct StoreState {
    users: HashMap<String, User>,
    records: BTreeMap<i64, AnalysisRecord>,
    next_id: i64,
}

/// [`RecordStore`] over a mutex-guarded map, with failure injection
#[derive(Default)]
pub struct MemoryRecordStore {
    state: Mutex<StoreState>,
    fail_saves: AtomicBool,
    failing_deletes: Mutex<HashSet<i64>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make `delete` fail whenever it is asked to remove `id`
    pub fn fail_delete_of(&self, id: i64) {
        self.failing_deletes.lock().unwrap().insert(id);
    }

    /// Raw record regardless of owner or state
    pub fn record(&self, id: i64) -> Option<AnalysisRecord> {
        self.state.lock().unwrap().records.get(&id).cloned()
    }

    /// All stored records in id order
    pub fn records(&self) -> Vec<AnalysisRecord> {
        self.state.lock().unwrap().records.values().cloned().collect()
    }

    pub fn user(&self, id: &str) -> Option<User> {
        self.state.lock().unwrap().users.get(id).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.state.lock().unwrap().users.len()
    }

    /// Pretend a trashed record was deleted at `deleted_at`
    pub fn backdate_trash(&self, id: i64, deleted_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.get_mut(&id) {
            assert_eq!(record.state, RecordState::Trash, "record {id} is not trashed");
            record.deleted_at = Some(deleted_at);
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert_user(&self, id: &str, email: &str) -> ServiceResult<User> {
        let mut state = self.state.lock().unwrap();
        let user = state
            .users
            .entry(id.to_string())
            .and_modify(|u| u.email = email.to_string())
            .or_insert_with(|| User {
                id: id.to_string(),
                email: email.to_string(),
                created_at: Utc::now(),
            });
        Ok(user.clone())
    }

    async fn find_user(&self, id: &str) -> ServiceResult<Option<User>> {
        Ok(self.state.lock().unwrap().users.get(id).cloned())
    }

    async fn save(&self, record: NewRecord) -> ServiceResult<AnalysisRecord> {
        record.validate()?;
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(ServiceError::Persistence(sqlx::Error::PoolTimedOut));
        }

        let mut state = self.state.lock().unwrap();
        if !state.users.contains_key(&record.user_id) {
            return Err(ServiceError::Persistence(sqlx::Error::Protocol(format!(
                "owner {} does not exist",
                record.user_id
            ))));
        }

        state.next_id += 1;
        let saved = AnalysisRecord {
            id: state.next_id,
            user_id: record.user_id,
            image_url: record.image_url,
            analysis_text: record.analysis_text,
            metadata: record.metadata,
            batch_no: record.batch_no,
            state: RecordState::Active,
            deleted_at: None,
            created_at: Utc::now(),
        };
        state.records.insert(saved.id, saved.clone());
        Ok(saved)
    }

    async fn list(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
        state: RecordState,
    ) -> ServiceResult<Vec<AnalysisRecord>> {
        validate_listing(limit, offset, state)?;

        let mut matching: Vec<AnalysisRecord> = self
            .state
            .lock()
            .unwrap()
            .records
            .values()
            .filter(|r| r.user_id == user_id && r.state == state)
            .cloned()
            .collect();
        matching.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        Ok(matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn get_by_id(
        &self,
        id: i64,
        user_id: &str,
        include_trash: bool,
    ) -> ServiceResult<Option<AnalysisRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .records
            .get(&id)
            .filter(|r| r.user_id == user_id)
            .filter(|r| include_trash || r.state == RecordState::Active)
            .cloned())
    }

    async fn list_by_ids(
        &self,
        ids: &[i64],
        user_id: &str,
        state: RecordState,
    ) -> ServiceResult<Vec<AnalysisRecord>> {
        let store = self.state.lock().unwrap();
        Ok(ids
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|id| store.records.get(id))
            .filter(|r| r.user_id == user_id && r.state == state)
            .cloned()
            .collect())
    }

    async fn set_state(
        &self,
        ids: &[i64],
        user_id: &str,
        state: RecordState,
        deleted_at: Option<DateTime<Utc>>,
    ) -> ServiceResult<u64> {
        let prior = validate_transition(state, deleted_at)?;

        let mut store = self.state.lock().unwrap();
        let mut changed = 0;
        for id in ids.iter().collect::<HashSet<_>>() {
            if let Some(record) = store.records.get_mut(id) {
                if record.user_id == user_id && record.state == prior {
                    record.state = state;
                    record.deleted_at = deleted_at;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn delete(&self, ids: &[i64], user_id: &str) -> ServiceResult<u64> {
        if ids
            .iter()
            .any(|id| self.failing_deletes.lock().unwrap().contains(id))
        {
            return Err(ServiceError::Persistence(sqlx::Error::PoolTimedOut));
        }

        let mut store = self.state.lock().unwrap();
        let mut removed = 0;
        for id in ids.iter().collect::<HashSet<_>>() {
            let owned = store
                .records
                .get(id)
                .is_some_and(|r| r.user_id == user_id);
            if owned {
                store.records.remove(id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn find_expired_trash(
        &self,
        retention_window: Duration,
    ) -> ServiceResult<Vec<AnalysisRecord>> {
        let cutoff = expiry_cutoff(Utc::now(), retention_window)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .records
            .values()
            .filter(|r| r.state == RecordState::Trash)
            .filter(|r| r.deleted_at.is_some_and(|at| at <= cutoff))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> ServiceResult<()> {
        Ok(())
    }
}

/// [`BlobGateway`] keeping objects in memory, with failure injection
#[derive(Default)]
pub struct MemoryBlobGateway {
    objects: Mutex<HashMap<String, Bytes>>,
    removed: Mutex<Vec<String>>,
    fail_puts: AtomicBool,
    fail_removes: AtomicBool,
}

impl MemoryBlobGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Keys successfully removed, in call order
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    fn key_for(url_or_key: &str) -> &str {
        url_or_key
            .strip_prefix(BLOB_BASE_URL)
            .map(|k| k.trim_start_matches('/'))
            .unwrap_or(url_or_key)
    }
}

#[async_trait]
impl BlobGateway for MemoryBlobGateway {
    async fn put(&self, key: &str, bytes: Bytes, _content_type: &str) -> ServiceResult<String> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(ServiceError::storage("bucket unavailable"));
        }
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(format!("{BLOB_BASE_URL}/{key}"))
    }

    async fn remove(&self, url_or_key: &str) -> ServiceResult<()> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(ServiceError::storage("bucket unavailable"));
        }
        let key = Self::key_for(url_or_key).to_string();
        self.objects.lock().unwrap().remove(&key);
        self.removed.lock().unwrap().push(key);
        Ok(())
    }
}
