//! Two-machine scenarios for the remote-backed directory.
//!
//! Each "machine" is a `BlobDirectory` with its own cache; machines share
//! one remote store, either a `MemoryBlobStore` behind an `Arc` or an
//! `FsBlobStore` rooted in a temp dir.

use std::sync::Arc;
use std::time::Duration;

use blobdir_core::blob::{META_CACHED_COMPRESSION, META_CACHED_LENGTH};
use blobdir_core::{
    BlobDirectory, BlobStore, DirectoryConfig, DirectoryError, DirectoryOptions, LocalCache,
    LockStrategy, MemoryBlobStore, MemoryCache,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Shared test setup
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Machine {
    dir: BlobDirectory,
    cache: Arc<MemoryCache>,
}

fn machine(store: &Arc<MemoryBlobStore>, options: DirectoryOptions) -> Machine {
    let cache = Arc::new(MemoryCache::new());
    let dir = BlobDirectory::new(store.clone(), cache.clone(), options);
    Machine { dir, cache }
}

fn index_options() -> DirectoryOptions {
    DirectoryOptions::default().with_root_folder("myindex")
}

async fn write(dir: &BlobDirectory, name: &str, data: &[u8]) {
    let mut out = dir.create_output(name).await.unwrap();
    out.write(data).await.unwrap();
    out.close().await.unwrap();
}

async fn read(dir: &BlobDirectory, name: &str) -> Vec<u8> {
    dir.open_input(name).await.unwrap().read_all().await.unwrap()
}

fn postings(len: usize) -> Vec<u8> {
    b"doc:17 freq:3 pos:4,9,12 "
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

// ============================================================================
// Round trips
// ============================================================================

#[tokio::test]
async fn test_round_trip_through_cache_and_remote() {
    init_tracing();
    for compress in [false, true] {
        let store = Arc::new(MemoryBlobStore::new("indexes"));
        let options = index_options().with_compression(compress);
        let writer = machine(&store, options.clone());

        let files = [
            ("_0.cfs", postings(40_000)),
            ("_0.tis", postings(3_000)),
            ("_0.del", vec![0xAA; 17]),
            ("segments_1", b"commit".to_vec()),
        ];
        for (name, data) in &files {
            write(&writer.dir, name, data).await;
        }

        // Served from the writer's cache.
        for (name, data) in &files {
            assert_eq!(&read(&writer.dir, name).await, data, "{name} compress={compress}");
        }

        // Evicted locally: re-pulled from the remote.
        writer.cache.delete("_0.cfs").await.unwrap();
        assert_eq!(read(&writer.dir, "_0.cfs").await, files[0].1);

        // A second machine with an empty cache.
        let reader = machine(&store, options);
        for (name, data) in &files {
            assert_eq!(&read(&reader.dir, name).await, data, "{name} compress={compress}");
            assert_eq!(reader.dir.length(name).await.unwrap(), data.len() as u64);
        }
    }
}

#[tokio::test]
async fn test_compression_is_transparent() {
    let store = Arc::new(MemoryBlobStore::new("indexes"));
    let m = machine(&store, index_options().with_compression(true));
    let data = postings(64 * 1024);
    write(&m.dir, "_3.frq", &data).await;
    write(&m.dir, "segments_1", b"x").await;

    let props = store.get_properties("myindex/_3.frq").await.unwrap();
    assert!(props.length < data.len() as u64);
    assert_eq!(props.metadata[META_CACHED_LENGTH], data.len().to_string());
    assert_eq!(props.metadata[META_CACHED_COMPRESSION], "deflate");
    assert_eq!(m.dir.length("_3.frq").await.unwrap(), data.len() as u64);

    let other = machine(&store, index_options().with_compression(true));
    assert_eq!(other.dir.length("_3.frq").await.unwrap(), data.len() as u64);
    assert_eq!(read(&other.dir, "_3.frq").await, data);
    assert_eq!(other.cache.length("_3.frq").await.unwrap(), data.len() as u64);
}

// ============================================================================
// The concrete segments_1 scenario
// ============================================================================

#[tokio::test]
async fn test_segments_file_visible_to_second_instance() {
    let store = Arc::new(MemoryBlobStore::new("indexes"));
    let first = machine(&store, DirectoryOptions::default().with_root_folder("myindex/"));
    write(&first.dir, "segments_1", b"ABCDEFGH").await;

    assert!(first.dir.exists("segments_1").await.unwrap());
    assert_eq!(first.dir.length("segments_1").await.unwrap(), 8);
    let props = store.get_properties("myindex/segments_1").await.unwrap();
    assert_eq!(props.metadata[META_CACHED_LENGTH], "8");

    let second = machine(&store, DirectoryOptions::default().with_root_folder("myindex/"));
    assert_eq!(read(&second.dir, "segments_1").await, b"ABCDEFGH");

    // Absent everywhere: a plain NotFound.
    let err = second.dir.open_input("segments_2").await.unwrap_err();
    assert!(matches!(err, DirectoryError::NotFound(ref n) if n == "segments_2"));
    assert!(second.dir.length("segments_2").await.unwrap_err().is_not_found());
    assert!(second.dir.last_modified("segments_2").await.unwrap_err().is_not_found());
    assert!(!second.dir.exists("segments_2").await.unwrap());
}

// ============================================================================
// Staleness
// ============================================================================

#[tokio::test]
async fn test_stale_cache_defers_to_remote_until_resynced() {
    let store = Arc::new(MemoryBlobStore::new("indexes"));
    let writer = machine(&store, index_options());
    write(&writer.dir, "_0.cfs", b"seg0").await;
    write(&writer.dir, "segments_1", b"gen1").await;

    let reader = machine(&store, index_options());
    read(&reader.dir, "_0.cfs").await;
    read(&reader.dir, "segments_1").await;
    assert!(reader.dir.refresh().await);
    assert_eq!(reader.dir.generations(), (1, 1));
    assert_eq!(reader.dir.list().await.unwrap(), vec!["_0.cfs", "segments_1"]);

    // The writer commits a new generation.
    write(&writer.dir, "_1.cfs", b"seg1").await;
    write(&writer.dir, "segments_2", b"gen2").await;
    writer.dir.delete("segments_1").await.unwrap();

    assert!(!reader.dir.refresh().await);
    assert_eq!(reader.dir.generations(), (1, 2));
    assert_eq!(
        reader.dir.list().await.unwrap(),
        vec!["_0.cfs", "_1.cfs", "segments_2"]
    );
    assert!(reader.dir.exists("segments_2").await.unwrap());
    assert_eq!(reader.dir.length("_1.cfs").await.unwrap(), 4);

    // A file the writer removed is gone, even though the reader still caches it.
    writer.dir.delete("_0.cfs").await.unwrap();
    assert!(reader.cache.exists("_0.cfs").await.unwrap());
    assert!(!reader.dir.refresh().await);
    assert!(!reader.dir.exists("_0.cfs").await.unwrap());

    // Pulling the new commit point brings the generations back together.
    assert_eq!(read(&reader.dir, "segments_2").await, b"gen2");
    assert!(reader.dir.refresh().await);
    assert_eq!(reader.dir.generations(), (2, 2));
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_delete_tolerates_missing_remote() {
    let store = Arc::new(MemoryBlobStore::new("indexes"));
    let m = machine(&store, index_options());
    write(&m.dir, "_0.cfs", b"abc").await;
    store.delete_blob("myindex/_0.cfs").await.unwrap();

    m.dir.delete("_0.cfs").await.unwrap();
    assert!(!m.cache.exists("_0.cfs").await.unwrap());
    // Again, with nothing left anywhere.
    m.dir.delete("_0.cfs").await.unwrap();
}

#[tokio::test]
async fn test_delete_of_open_file_keeps_remote_copy() {
    let store = Arc::new(MemoryBlobStore::new("indexes"));
    let m = machine(&store, index_options());
    write(&m.dir, "_0.cfs", b"abc").await;
    write(&m.dir, "segments_1", b"x").await;

    let input = m.dir.open_input("_0.cfs").await.unwrap();
    let err = m.dir.delete("_0.cfs").await.unwrap_err();
    assert!(matches!(err, DirectoryError::InUse(_)));
    assert!(store.blob_exists("myindex/_0.cfs").await.unwrap());
    assert!(m.dir.exists("_0.cfs").await.unwrap());

    drop(input);
    m.dir.delete("_0.cfs").await.unwrap();
    assert!(!store.blob_exists("myindex/_0.cfs").await.unwrap());
    assert!(!m.dir.exists("_0.cfs").await.unwrap());
}

#[tokio::test]
async fn test_remote_delete_failure_is_not_fatal() {
    let store = Arc::new(MemoryBlobStore::new("indexes"));
    let m = machine(&store, index_options());
    write(&m.dir, "_0.cfs", b"abc").await;

    store.set_offline(true);
    m.dir.delete("_0.cfs").await.unwrap();
    assert!(!m.cache.exists("_0.cfs").await.unwrap());
}

// ============================================================================
// Locks
// ============================================================================

async fn assert_mutual_exclusion(strategy: LockStrategy) {
    let store = Arc::new(MemoryBlobStore::new("indexes"));
    let a = machine(&store, index_options().with_lock_strategy(strategy));
    let b = machine(&store, index_options().with_lock_strategy(strategy));
    let lock_a = a.dir.make_lock("write.lock");
    let lock_b = b.dir.make_lock("write.lock");
    assert_eq!(lock_a.name(), lock_b.name());

    let (got_a, got_b) = tokio::join!(lock_a.obtain(), lock_b.obtain());
    let (got_a, got_b) = (got_a.unwrap(), got_b.unwrap());
    assert!(got_a ^ got_b, "{strategy:?}: exactly one machine wins");

    let (winner, loser) = if got_a { (&lock_a, &lock_b) } else { (&lock_b, &lock_a) };
    assert!(loser.is_locked().await.unwrap());
    assert!(!loser.obtain().await.unwrap());

    winner.release().await.unwrap();
    assert!(!loser.is_locked().await.unwrap());
    assert!(loser.obtain().await.unwrap());
    assert!(!winner.obtain().await.unwrap());
    loser.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_marker_lock_mutual_exclusion() {
    assert_mutual_exclusion(LockStrategy::Marker).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lease_lock_mutual_exclusion() {
    assert_mutual_exclusion(LockStrategy::Lease).await;
}

#[tokio::test]
async fn test_clear_lock_breaks_foreign_lease() {
    let store = Arc::new(MemoryBlobStore::new("indexes"));
    let options = index_options().with_lock_strategy(LockStrategy::Lease);
    let a = machine(&store, options.clone());
    let b = machine(&store, options);

    let lock_a = a.dir.make_lock("write.lock");
    assert!(lock_a.obtain().await.unwrap());

    b.dir.clear_lock("write.lock").await.unwrap();
    let lock_b = b.dir.make_lock("write.lock");
    assert!(lock_b.obtain().await.unwrap());
    // The old holder finds its lease gone.
    assert!(matches!(
        lock_a.release().await.unwrap_err(),
        DirectoryError::LockReleaseFailed(_)
    ));
}

// ============================================================================
// Read-only replicas
// ============================================================================

#[tokio::test]
async fn test_read_only_discards_writes_and_never_locks() {
    let store = Arc::new(MemoryBlobStore::new("indexes"));
    let writer = machine(&store, index_options());
    write(&writer.dir, "segments_1", b"gen1").await;

    let replica = machine(&store, index_options().read_only());
    let mut out = replica.dir.create_output("x").await.unwrap();
    out.write(&[7u8; 100]).await.unwrap();
    assert_eq!(out.close().await.unwrap(), 100);
    assert_eq!(store.blob_names(), vec!["myindex/segments_1"]);
    assert!(!replica.cache.exists("x").await.unwrap());

    let lock = replica.dir.make_lock("write.lock");
    assert!(lock.obtain().await.unwrap());
    assert!(!lock.is_locked().await.unwrap());
    assert!(lock.obtain().await.unwrap());
    assert!(!lock.is_locked().await.unwrap());

    replica.dir.delete("segments_1").await.unwrap();
    assert!(store.blob_exists("myindex/segments_1").await.unwrap());
    assert_eq!(read(&replica.dir, "segments_1").await, b"gen1");
}

// ============================================================================
// Disk-backed machines
// ============================================================================

fn disk_config(tmp: &TempDir, cache: &str) -> DirectoryConfig {
    DirectoryConfig {
        connection: format!("file://{}", tmp.path().join("remote").display()),
        container: "indexes".into(),
        root_folder: "myindex".into(),
        compress_blobs: true,
        cache_root: Some(tmp.path().join(cache)),
        remote_timeout_secs: 5,
        ..DirectoryConfig::default()
    }
}

#[tokio::test]
async fn test_disk_store_and_cache_end_to_end() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let a = BlobDirectory::open(&disk_config(&tmp, "cache-a")).await.unwrap();
    let b = BlobDirectory::open(&disk_config(&tmp, "cache-b")).await.unwrap();

    let data = postings(20_000);
    write(&a, "_0.cfs", &data).await;
    write(&a, "segments_1", b"gen1").await;

    assert_eq!(read(&b, "_0.cfs").await, data);
    assert_eq!(b.length("_0.cfs").await.unwrap(), data.len() as u64);
    assert!(tmp.path().join("cache-b").join("_0.cfs").exists());

    // The pulled copy carries the writer's logical timestamp.
    assert_eq!(
        a.last_modified("_0.cfs").await.unwrap(),
        b.cache().last_modified("_0.cfs").await.unwrap()
    );

    let input = b.open_input("_0.cfs").await.unwrap();
    let clone = input.try_clone().await.unwrap();
    drop(input);
    assert!(matches!(
        b.delete("_0.cfs").await.unwrap_err(),
        DirectoryError::InUse(_)
    ));
    assert_eq!(clone.read_at(0, 8).await.unwrap(), &data[..8]);
    drop(clone);
    b.delete("_0.cfs").await.unwrap();
    assert!(!a.store().blob_exists("myindex/_0.cfs").await.unwrap());
}

#[tokio::test]
async fn test_manifests_across_machines() {
    let tmp = TempDir::new().unwrap();
    let a = BlobDirectory::open(&disk_config(&tmp, "cache-a")).await.unwrap();
    write(&a, "_0.cfs", b"seg0").await;
    write(&a, "segments_1", b"gen1").await;
    let first = a.commit_manifest().await.unwrap();

    let b = BlobDirectory::open(&disk_config(&tmp, "cache-b")).await.unwrap();
    let latest = b.manifests().latest().await.unwrap().unwrap();
    assert_eq!(latest.id, first.id);
    assert_eq!(
        latest.file_names().collect::<Vec<_>>(),
        vec!["_0.cfs", "segments_1"]
    );
    assert!(!b.list().await.unwrap().iter().any(|n| n.ends_with(".manifest")));
}

#[tokio::test(start_paused = true)]
async fn test_lock_wait_times_out() {
    let store = Arc::new(MemoryBlobStore::new("indexes"));
    let a = machine(&store, index_options());
    let b = machine(&store, index_options());
    let held = a.dir.make_lock("write.lock");
    assert!(held.obtain().await.unwrap());

    let waiting = b.dir.make_lock("write.lock");
    let err = blobdir_core::obtain_with_timeout(
        waiting.as_ref(),
        Duration::from_secs(3),
        Duration::from_millis(500),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, DirectoryError::LockTimeout(_)));
}
