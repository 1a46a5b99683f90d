use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use groupsync_core::ids::*;
use groupsync_core::time::unix_now;
use groupsync_core::{CloudFileName, CloudStorage, ResolverRegistry};
use groupsync_storage::{
    DeferredChangeRecord, DeferredStatus, DeferredUploadRepo, SqliteStore, StorageError, StoreTx, TxMode,
};
use tracing::{debug, info, info_span, warn};

use crate::error::SyncError;
use crate::metrics::Metrics;

/// Result of draining one group's queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupMerge {
    /// (file, new version) for every file advanced.
    pub files: Vec<(FileId, u32)>,
    pub changes_merged: usize,
    /// Changes dropped because their file was deleted first.
    pub changes_discarded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    Merged(GroupMerge),
    Failed { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub groups: Vec<(SharingGroupId, GroupOutcome)>,
}

impl PassReport {
    pub fn outcome(&self, sharing_group_id: SharingGroupId) -> Option<&GroupOutcome> {
        self.groups.iter().find(|(g, _)| *g == sharing_group_id).map(|(_, o)| o)
    }

    pub fn failures(&self) -> usize {
        self.groups
            .iter()
            .filter(|(_, o)| matches!(o, GroupOutcome::Failed { .. }))
            .count()
    }

    pub fn changes_merged(&self) -> usize {
        self.groups
            .iter()
            .map(|(_, o)| match o {
                GroupOutcome::Merged(m) => m.changes_merged,
                GroupOutcome::Failed { .. } => 0,
            })
            .sum()
    }
}

/// Drains the deferred change queue. Each group is merged under its own
/// lock and transaction; a failure rolls back that group alone and leaves
/// its changes queued for the next pass.
#[derive(Clone)]
pub struct Uploader {
    store: SqliteStore,
    cloud_storage: Arc<dyn CloudStorage>,
    resolvers: Arc<ResolverRegistry>,
    metrics: Arc<Metrics>,
    retention_secs: u64,
}

const DEFAULT_RETENTION_SECS: u64 = 60 * 60 * 24;

impl Uploader {
    pub fn new(
        store: SqliteStore,
        cloud_storage: Arc<dyn CloudStorage>,
        resolvers: Arc<ResolverRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            cloud_storage,
            resolvers,
            metrics,
            retention_secs: DEFAULT_RETENTION_SECS,
        }
    }

    /// How long completed changes stay queryable.
    pub fn with_retention(mut self, retention_secs: u64) -> Self {
        self.retention_secs = retention_secs;
        self
    }

    pub fn run_pass(&self) -> Result<PassReport, SyncError> {
        let groups = {
            let conn = self.store.connect()?;
            let repo = DeferredUploadRepo::new(&conn);
            let cutoff = unix_now()?.saturating_sub(self.retention_secs as i64);
            let pruned = repo.prune_completed(cutoff)?;
            if pruned > 0 {
                debug!(pruned, "pruned completed changes");
            }
            repo.groups_with_pending()?
        };

        let mut report = PassReport::default();
        for sharing_group_id in groups {
            let outcome = match self.merge_group(sharing_group_id) {
                Ok(merge) => GroupOutcome::Merged(merge),
                Err(e) => {
                    if matches!(e, SyncError::Resolver(_)) {
                        self.metrics.resolver_failed();
                    }
                    warn!(%sharing_group_id, error = %e, "group merge failed; changes stay queued");
                    GroupOutcome::Failed { reason: e.to_string() }
                }
            };
            report.groups.push((sharing_group_id, outcome));
        }
        if !report.groups.is_empty() {
            info!(
                groups = report.groups.len(),
                failures = report.failures(),
                changes = report.changes_merged(),
                "uploader pass finished"
            );
        }
        Ok(report)
    }

    /// Merges every pending change of one group and commits.
    pub fn merge_group(&self, sharing_group_id: SharingGroupId) -> Result<GroupMerge, SyncError> {
        let span = info_span!("merge_group", %sharing_group_id);
        let _guard = span.enter();

        let mut conn = self.store.connect()?;
        let tx = StoreTx::begin(&mut conn, TxMode::Immediate)?;
        tx.group_locks().acquire(sharing_group_id)?;

        let mut superseded = Vec::new();
        match self.merge_pending(&tx, sharing_group_id, &mut superseded) {
            Ok(merge) => {
                tx.commit()?;
                for object in &superseded {
                    if let Err(e) = self.cloud_storage.delete(object) {
                        warn!(%object, error = %e, "failed to delete superseded version");
                    }
                }
                self.metrics.changes_merged(merge.changes_merged as u64);
                Ok(merge)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    fn merge_pending(
        &self,
        tx: &StoreTx<'_>,
        sharing_group_id: SharingGroupId,
        superseded: &mut Vec<CloudFileName>,
    ) -> Result<GroupMerge, SyncError> {
        let pending = tx.deferred_uploads().pending_for_group(sharing_group_id)?;
        let mut by_file: BTreeMap<FileId, Vec<DeferredChangeRecord>> = BTreeMap::new();
        for change in pending {
            by_file.entry(change.file_id).or_default().push(change);
        }

        let now = unix_now()?;
        let mut merge = GroupMerge::default();
        for (file_id, changes) in by_file {
            let ids: Vec<DeferredUploadId> = changes.iter().filter_map(|c| c.deferred_upload_id).collect();
            let entry = tx
                .file_index()
                .lookup(sharing_group_id, file_id)?
                .ok_or_else(|| StorageError::NotFound(format!("catalog entry for {file_id}")))?;
            if entry.deleted {
                debug!(%file_id, changes = ids.len(), "discarding changes to deleted file");
                merge.changes_discarded += tx.deferred_uploads().complete(&ids, DeferredStatus::Discarded, now)?;
                continue;
            }

            let resolver_name = entry
                .change_resolver_name
                .as_deref()
                .unwrap_or(changes[0].change_resolver_name.as_str());
            let resolver = self.resolvers.resolver(resolver_name)?;

            let current_name = CloudFileName::new(entry.owner_user_id, entry.device_id, file_id, entry.file_version);
            let current = self.cloud_storage.download(&current_name)?;
            let payloads: Vec<&[u8]> = changes.iter().map(|c| c.payload.as_slice()).collect();
            let merged = resolver.merge(&current, &payloads)?;

            let next_name = current_name.next_version();
            let checksum = self.cloud_storage.upload(&next_name, &entry.mime_type, &merged)?;
            let new_version =
                tx.file_index()
                    .bump_version(file_id, entry.owner_user_id, merged.len() as u64, checksum, now)?;
            if new_version != next_name.file_version {
                return Err(SyncError::Transaction(format!(
                    "{file_id} advanced to {new_version}, expected {}",
                    next_name.file_version
                )));
            }

            let consumed = tx.deferred_uploads().complete(&ids, DeferredStatus::Processed, now)?;
            debug!(%file_id, new_version, consumed, resolver = resolver_name, "file merged");
            merge.files.push((file_id, new_version));
            merge.changes_merged += consumed;
            superseded.push(current_name);
        }
        Ok(merge)
    }
}

/// Runs `Uploader::run_pass` on a background thread at a fixed interval.
/// Stopping waits for a pass in progress to finish but never starts another.
pub struct PeriodicUploader {
    stop_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
    passes: Arc<AtomicU64>,
}

impl PeriodicUploader {
    pub fn spawn(uploader: Uploader, interval: Duration) -> Result<Self, SyncError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let passes = Arc::new(AtomicU64::new(0));
        let counter = passes.clone();
        let handle = thread::Builder::new()
            .name("groupsync-uploader".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            if let Err(e) = uploader.run_pass() {
                                warn!(error = %e, "uploader pass failed");
                            }
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("uploader stopped");
            })
            .map_err(|e| SyncError::Transaction(format!("failed to start uploader thread: {e}")))?;
        Ok(Self {
            stop_tx,
            handle: Some(handle),
            passes,
        })
    }

    /// Passes completed so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("uploader thread panicked");
        }
    }
}

impl Drop for PeriodicUploader {
    fn drop(&mut self) {
        self.shutdown();
    }
}
