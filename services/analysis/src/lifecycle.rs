//! Soft-delete, restore and purge transitions over analysis records.

use crate::blob_gateway::BlobGateway;
use crate::error::{ServiceError, ServiceResult};
use crate::record_store::{AnalysisRecord, RecordState, RecordStore};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Executes record state transitions on behalf of their owner.
///
/// Every operation takes a batch of ids, ignores ids the caller does not own
/// or that are not in the required prior state, and reports how many records
/// actually changed.
pub struct LifecycleManager {
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobGateway>,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn RecordStore>, blobs: Arc<dyn BlobGateway>) -> Self {
        Self { store, blobs }
    }

    /// Move active records to the trash
    #[instrument(skip(self, ids), fields(id_count = ids.len()))]
    pub async fn soft_delete(&self, ids: &[i64], user_id: &str) -> ServiceResult<u64> {
        let ids = normalize_ids(ids)?;
        let count = self
            .store
            .set_state(&ids, user_id, RecordState::Trash, Some(Utc::now()))
            .await?;

        metrics::counter!("analysis.records.trashed").increment(count);
        info!(count, "Records moved to trash");
        Ok(count)
    }

    /// Bring trashed records back
    #[instrument(skip(self, ids), fields(id_count = ids.len()))]
    pub async fn restore(&self, ids: &[i64], user_id: &str) -> ServiceResult<u64> {
        let ids = normalize_ids(ids)?;
        let count = self
            .store
            .set_state(&ids, user_id, RecordState::Active, None)
            .await?;

        metrics::counter!("analysis.records.restored").increment(count);
        info!(count, "Records restored");
        Ok(count)
    }

    /// Permanently remove trashed records and their photos
    #[instrument(skip(self, ids), fields(id_count = ids.len()))]
    pub async fn purge(&self, ids: &[i64], user_id: &str) -> ServiceResult<u64> {
        let ids = normalize_ids(ids)?;
        let records = self
            .store
            .list_by_ids(&ids, user_id, RecordState::Trash)
            .await?;

        Ok(self.purge_records(records).await)
    }

    /// Remove each record's photo (best effort), then the record itself.
    ///
    /// Records are handled independently; a failure is logged and the next
    /// record proceeds. Returns how many records were removed from the store.
    pub(crate) async fn purge_records(&self, records: Vec<AnalysisRecord>) -> u64 {
        let mut purged = 0;

        for record in records {
            if let Err(e) = self.blobs.remove(record.blob_reference()).await {
                metrics::counter!("analysis.blobs.remove_failed").increment(1);
                warn!(
                    record_id = record.id,
                    blob = %record.blob_reference(),
                    error = %e,
                    "Failed to remove photo, deleting record anyway"
                );
            }

            match self.store.delete(&[record.id], &record.user_id).await {
                Ok(count) => purged += count,
                Err(e) => {
                    error!(record_id = record.id, error = %e, "Failed to delete record");
                }
            }
        }

        metrics::counter!("analysis.records.purged").increment(purged);
        info!(purged, "Records purged");
        purged
    }
}

/// Reject an empty id list and drop duplicates
fn normalize_ids(ids: &[i64]) -> ServiceResult<Vec<i64>> {
    if ids.is_empty() {
        return Err(ServiceError::validation("ids must not be empty"));
    }
    Ok(ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect())
}
