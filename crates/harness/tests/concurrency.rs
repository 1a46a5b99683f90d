use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use groupsync_core::ids::*;
use groupsync_core::{ChangeResolver, CoreError, ResolverRegistry};
use groupsync_engine::{DoneUploads, GroupOutcome, PeriodicUploader, SyncError, UploadFile};
use groupsync_harness::{TestConfig, TestDeployment, TestDevice};
use groupsync_storage::{MasterVersionUpdate, StoreTx, TxMode};

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// One device per writer, each with a v0 upload staged at master version 0.
fn staged_writers(
    deployment: &TestDeployment,
    writers: usize,
) -> Result<(Vec<TestDevice>, SharingGroupId), Box<dyn std::error::Error>> {
    let (first, group) = deployment.user_with_group("alice")?;
    let mut devices = vec![first.clone()];
    while devices.len() < writers {
        devices.push(first.sibling());
    }
    for device in &devices {
        device.upload_new(group, FileId::new(), None, b"payload")?;
    }
    Ok((devices, group))
}

// ============================================================================
// Master version serialization (2 tests)
// ============================================================================

#[test]
fn concurrent_batches_at_same_version_admit_one() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (devices, group) = staged_writers(&deployment, 4)?;

    let handles: Vec<_> = devices
        .into_iter()
        .map(|device| {
            thread::spawn(move || {
                device.call(&DoneUploads {
                    sharing_group_id: group,
                    master_version: 0,
                })
            })
        })
        .collect();

    let mut committed = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.join().map_err(|_| "writer panicked")? {
            Ok(done) => {
                assert_eq!(done.master_version, 1);
                committed += 1;
            }
            Err(SyncError::MasterVersionConflict { current }) => {
                assert_eq!(current, 1);
                conflicts += 1;
            }
            Err(other) => return Err(other.into()),
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(conflicts, 3);
    assert_eq!(deployment.counts()?.file_index, 1);
    assert_eq!(deployment.counts()?.uploads, 3);
    Ok(())
}

#[test]
fn retrying_writers_advance_version_once_each() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (devices, group) = staged_writers(&deployment, 4)?;

    let handles: Vec<_> = devices
        .into_iter()
        .map(|device| {
            thread::spawn(move || -> Result<u64, SyncError> {
                loop {
                    match device.done_uploads(group) {
                        Ok(done) => return Ok(done.master_version),
                        Err(SyncError::MasterVersionConflict { .. }) => continue,
                        Err(other) => return Err(other),
                    }
                }
            })
        })
        .collect();

    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.join().map_err(|_| "writer panicked")??);
    }
    versions.sort_unstable();
    assert_eq!(versions, vec![1, 2, 3, 4]);

    let any = deployment.device("alice");
    assert_eq!(any.master_version(group)?, 4);
    assert_eq!(deployment.counts()?.file_index, 4);
    assert_eq!(deployment.server.metrics().snapshot().batches_finalized, 4);
    Ok(())
}

// ============================================================================
// Group lock (1 test)
// ============================================================================

#[test]
fn group_lock_holder_blocks_second_transaction() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (_device, group) = deployment.user_with_group("alice")?;
    let store = deployment.server.store().clone();

    let (locked_tx, locked_rx) = mpsc::channel();
    let holder_store = store.clone();
    let holder = thread::spawn(move || -> Result<(), SyncError> {
        let mut conn = holder_store.connect()?;
        let tx = StoreTx::begin(&mut conn, TxMode::Immediate)?;
        tx.group_locks().acquire(group)?;
        assert!(matches!(
            tx.master_versions().compare_and_increment(group, 0)?,
            MasterVersionUpdate::Incremented { new_version: 1 }
        ));
        let _ = locked_tx.send(());
        thread::sleep(Duration::from_millis(200));
        tx.commit()?;
        Ok(())
    });

    locked_rx.recv_timeout(Duration::from_secs(5))?;
    let started = Instant::now();
    let mut conn = store.connect()?;
    let tx = StoreTx::begin(&mut conn, TxMode::Immediate)?;
    tx.group_locks().acquire(group)?;
    assert!(started.elapsed() >= Duration::from_millis(100));
    // The waiter sees the holder's committed increment.
    assert_eq!(tx.master_versions().get(group)?, 1);
    tx.commit()?;

    holder.join().map_err(|_| "lock holder panicked")??;
    Ok(())
}

// ============================================================================
// Uploader isolation and scheduling (2 tests)
// ============================================================================

#[derive(Debug, Default)]
struct AlwaysFails;

impl ChangeResolver for AlwaysFails {
    fn name(&self) -> &str {
        "AlwaysFails"
    }

    fn merge(&self, _current: &[u8], _changes: &[&[u8]]) -> Result<Vec<u8>, CoreError> {
        Err(CoreError::Resolver {
            resolver: "AlwaysFails".into(),
            reason: "refuses every change".into(),
        })
    }
}

#[test]
fn failing_resolver_only_holds_back_its_group() -> TestResult {
    let mut resolvers = ResolverRegistry::with_builtins();
    resolvers.register_type::<AlwaysFails>()?;
    let deployment = TestDeployment::with_resolvers(TestConfig::default(), resolvers)?;

    let (alice, broken_group) = deployment.user_with_group("alice")?;
    let broken_file = FileId::new();
    alice.call(&UploadFile {
        sharing_group_id: broken_group,
        file_id: broken_file,
        file_group_id: None,
        mime_type: "text/plain".into(),
        app_meta_data: None,
        file_version: 0,
        change_resolver_name: Some("AlwaysFails".into()),
        master_version: 0,
        content: b"base".to_vec(),
    })?;
    alice.done_uploads(broken_group)?;
    alice.upload_change(broken_group, broken_file, 1, b"x")?;
    alice.done_uploads(broken_group)?;

    let (bob, good_group) = deployment.user_with_group("bob")?;
    let good_file = FileId::new();
    bob.upload_new(good_group, good_file, None, b"base")?;
    bob.done_uploads(good_group)?;
    bob.upload_change(good_group, good_file, 1, b"+")?;
    bob.done_uploads(good_group)?;

    let report = deployment.server.uploader().run_pass()?;
    assert_eq!(report.failures(), 1);
    assert!(matches!(report.outcome(broken_group), Some(GroupOutcome::Failed { .. })));
    assert!(matches!(report.outcome(good_group), Some(GroupOutcome::Merged(_))));

    // The broken group's change is still queued; its file never moved.
    assert_eq!(deployment.counts()?.deferred_uploads, 1);
    assert_eq!(alice.file_index(broken_group)?.files[0].file_version, 0);
    assert_eq!(bob.file_index(good_group)?.files[0].file_version, 1);
    assert_eq!(deployment.server.metrics().snapshot().resolver_failures, 1);

    // A later pass retries and fails the same way.
    assert_eq!(deployment.server.uploader().run_pass()?.failures(), 1);
    Ok(())
}

#[test]
fn periodic_uploader_drains_queue_and_stops() -> TestResult {
    let deployment = TestDeployment::new()?;
    let (device, group) = deployment.user_with_group("alice")?;
    let file = FileId::new();
    device.upload_new(group, file, None, b"Hello")?;
    device.done_uploads(group)?;
    device.upload_change(group, file, 1, b", World")?;
    device.done_uploads(group)?;

    let periodic = PeriodicUploader::spawn(deployment.server.uploader(), Duration::from_millis(20))?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while deployment.counts()?.deferred_uploads > 0 {
        if Instant::now() > deadline {
            return Err("queue not drained".into());
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(periodic.passes() >= 1);
    periodic.stop();

    assert_eq!(device.file_index(group)?.files[0].file_version, 1);
    assert_eq!(deployment.server.metrics().snapshot().deferred_changes_merged, 1);
    Ok(())
}
