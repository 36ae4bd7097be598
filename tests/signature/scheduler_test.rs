//! Signature scheduler tests: caching, deduplication, pool bounds and
//! invalidation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use execgate::signature::scheduler::{SchedulerSettings, SignatureScheduler};
use execgate::signature::{CodeSignatureStatus, SignatureOracle};
use execgate::types::{BinaryHash, HashType, Verdict};

use crate::support::{self, MockOracle};

fn hash() -> BinaryHash {
    BinaryHash {
        hash_type: HashType::TruncatedSha256,
        hex: support::signed_cdhash_hex(),
    }
}

fn settings() -> SchedulerSettings {
    SchedulerSettings {
        size_ceiling: 10_485_760,
        primary_workers: 1,
        secondary_workers: 1,
    }
}

fn scheduler(oracle: &Arc<MockOracle>) -> Arc<SignatureScheduler> {
    SignatureScheduler::new(Arc::clone(oracle) as Arc<dyn SignatureOracle>, settings())
}

fn binary(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    support::touch(&path);
    path
}

#[tokio::test]
async fn empty_hash_is_not_signed_without_a_check() {
    let oracle = MockOracle::returning(CodeSignatureStatus::Valid);
    let scheduler = scheduler(&oracle);

    let verdict = scheduler
        .check_signature_for(Path::new("/nonexistent/tool"), &BinaryHash::empty())
        .await;

    assert_eq!(verdict, Some(Verdict::NotSigned));
    assert_eq!(oracle.calls(), 0);
    assert_eq!(scheduler.cached_count(), 0);
}

#[tokio::test]
async fn verdicts_are_cached_per_path() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = binary(tmp.path(), "tool");
    let oracle = MockOracle::returning(CodeSignatureStatus::Valid);
    let scheduler = scheduler(&oracle);

    assert_eq!(
        scheduler.check_signature_for(&path, &hash()).await,
        Some(Verdict::Valid)
    );
    assert_eq!(
        scheduler.check_signature_for(&path, &hash()).await,
        Some(Verdict::Valid)
    );

    assert_eq!(oracle.calls(), 1);
    assert_eq!(scheduler.cached_verdict(&path), Some(Verdict::Valid));
}

#[tokio::test]
async fn invalid_verdicts_are_cached_too() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = binary(tmp.path(), "tool");
    let oracle = MockOracle::returning(CodeSignatureStatus::Invalid);
    let scheduler = scheduler(&oracle);

    assert_eq!(
        scheduler.check_signature_for(&path, &hash()).await,
        Some(Verdict::Invalid)
    );
    assert_eq!(scheduler.cached_verdict(&path), Some(Verdict::Invalid));
}

#[tokio::test]
async fn failed_checks_are_not_cached() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = binary(tmp.path(), "tool");
    let oracle = MockOracle::returning(CodeSignatureStatus::IoError);
    let scheduler = scheduler(&oracle);

    assert_eq!(
        scheduler.check_signature_for(&path, &hash()).await,
        Some(Verdict::Failed)
    );
    assert_eq!(scheduler.cached_verdict(&path), None);

    scheduler.check_signature_for(&path, &hash()).await;
    assert_eq!(oracle.calls(), 2);
}

#[tokio::test]
async fn missing_binary_fails_without_a_check() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let oracle = MockOracle::returning(CodeSignatureStatus::Valid);
    let scheduler = scheduler(&oracle);

    let verdict = scheduler
        .check_signature_for(&tmp.path().join("gone"), &hash())
        .await;

    assert_eq!(verdict, Some(Verdict::Failed));
    assert_eq!(oracle.calls(), 0);
}

#[tokio::test]
async fn concurrent_requests_share_one_check() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = binary(tmp.path(), "tool");
    let oracle = MockOracle::gated(CodeSignatureStatus::Valid);
    let scheduler = scheduler(&oracle);

    let (hash_a, hash_b) = (hash(), hash());
    let (a, b, ()) = tokio::join!(
        scheduler.check_signature_for(&path, &hash_a),
        scheduler.check_signature_for(&path, &hash_b),
        async {
            support::wait_for(|| oracle.calls() == 1).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            oracle.release(1);
        }
    );

    assert_eq!(a, Some(Verdict::Valid));
    assert_eq!(b, Some(Verdict::Valid));
    assert_eq!(oracle.calls(), 1);
    assert_eq!(scheduler.in_flight_count(), 0);
}

#[tokio::test]
async fn pool_bounds_concurrent_checks() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let first = binary(tmp.path(), "first");
    let second = binary(tmp.path(), "second");
    let oracle = MockOracle::gated(CodeSignatureStatus::Valid);
    let scheduler = scheduler(&oracle);

    let s1 = Arc::clone(&scheduler);
    let a = tokio::spawn(async move { s1.check_signature_for(&first, &hash()).await });
    let s2 = Arc::clone(&scheduler);
    let b = tokio::spawn(async move { s2.check_signature_for(&second, &hash()).await });

    support::wait_for(|| scheduler.in_flight_count() == 2 && oracle.calls() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(oracle.calls(), 1, "a single-worker pool runs one check");

    oracle.release(2);
    assert_eq!(a.await.expect("task"), Some(Verdict::Valid));
    assert_eq!(b.await.expect("task"), Some(Verdict::Valid));
    assert_eq!(oracle.calls(), 2);
}

#[tokio::test]
async fn invalidation_cancels_in_flight_check() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = binary(tmp.path(), "tool");
    let oracle = MockOracle::gated(CodeSignatureStatus::Valid);
    let scheduler = scheduler(&oracle);

    let task_scheduler = Arc::clone(&scheduler);
    let task_path = path.clone();
    let pending =
        tokio::spawn(async move { task_scheduler.check_signature_for(&task_path, &hash()).await });
    support::wait_for(|| oracle.calls() == 1).await;

    scheduler.invalidate_cache_for(&path);

    assert_eq!(pending.await.expect("task"), None);
    assert_eq!(scheduler.in_flight_count(), 0);

    // The canceled check never lands in the cache; a new request re-checks.
    oracle.release(1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(scheduler.cached_verdict(&path), None);

    oracle.release(1);
    assert_eq!(
        scheduler.check_signature_for(&path, &hash()).await,
        Some(Verdict::Valid)
    );
    assert_eq!(oracle.calls(), 2);
}

#[tokio::test]
async fn invalidation_covers_bundles_and_directories() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let bundle = tmp.path().join("Foo.app");
    std::fs::create_dir_all(bundle.join("Contents/MacOS")).expect("create bundle");
    let tool = binary(tmp.path(), "bin/tool");
    let sibling = binary(tmp.path(), "other/tool");
    let oracle = MockOracle::returning(CodeSignatureStatus::Valid);
    let scheduler = scheduler(&oracle);

    for path in [&bundle, &tool, &sibling] {
        scheduler.check_signature_for(path, &hash()).await;
    }
    assert_eq!(scheduler.cached_count(), 3);

    // A write inside the bundle drops the bundle's verdict.
    scheduler.invalidate_cache_for(&bundle.join("Contents/MacOS/Foo"));
    assert_eq!(scheduler.cached_verdict(&bundle), None);

    // A directory change drops every descendant.
    scheduler.invalidate_cache_for(&tmp.path().join("bin"));
    assert_eq!(scheduler.cached_verdict(&tool), None);
    assert_eq!(scheduler.cached_verdict(&sibling), Some(Verdict::Valid));

    scheduler.invalidate_cache();
    assert_eq!(scheduler.cached_count(), 0);
}

/// Never finishes a bundle check; files verify immediately.
#[derive(Default)]
struct StalledBundleOracle {
    bundle_checks: std::sync::atomic::AtomicUsize,
}

#[async_trait::async_trait]
impl SignatureOracle for StalledBundleOracle {
    async fn check(&self, path: &Path) -> CodeSignatureStatus {
        if path.is_dir() {
            self.bundle_checks
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        CodeSignatureStatus::Valid
    }
}

#[cfg(unix)]
#[tokio::test]
async fn stalled_bundle_scan_does_not_block_primary_checks() {
    use execgate::signature::scheduler::{route, FileInfo, QueueKind};

    let system_binary = Path::new("/bin/sh");
    let metadata = std::fs::metadata(system_binary).expect("system shell should exist");
    assert_eq!(
        route(&FileInfo::from_metadata(&metadata), settings().size_ceiling),
        QueueKind::Primary,
        "/bin/sh should be a small root-owned file"
    );

    let tmp = tempfile::tempdir().expect("should create temp dir");
    let bundle = tmp.path().join("Slow.app");
    std::fs::create_dir_all(&bundle).expect("create bundle dir");

    let oracle = Arc::new(StalledBundleOracle::default());
    let scheduler = SignatureScheduler::new(
        Arc::clone(&oracle) as Arc<dyn SignatureOracle>,
        settings(),
    );

    let bundle_check = {
        let scheduler = Arc::clone(&scheduler);
        let bundle = bundle.clone();
        tokio::spawn(async move { scheduler.check_signature_for(&bundle, &hash()).await })
    };
    support::wait_for(|| {
        oracle
            .bundle_checks
            .load(std::sync::atomic::Ordering::SeqCst)
            == 1
    })
    .await;

    let verdict = tokio::time::timeout(
        Duration::from_secs(2),
        scheduler.check_signature_for(system_binary, &hash()),
    )
    .await
    .expect("primary check should not wait behind the bundle scan");
    assert_eq!(verdict, Some(Verdict::Valid));
    assert!(!bundle_check.is_finished());
    assert_eq!(scheduler.in_flight_count(), 1);

    bundle_check.abort();
}
