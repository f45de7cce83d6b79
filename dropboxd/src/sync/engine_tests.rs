use super::*;
use crate::sync::index::Freshness;
use crate::sync::queue::OperationKind;
use serde_json::json;
use sqlx::SqlitePool;
use std::path::Path;
use std::time::{Duration as StdDuration, UNIX_EPOCH};
use tempfile::{TempDir, tempdir};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const DEST: &str = "Box";

async fn make_store() -> StateStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = StateStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn config(server: &MockServer, root: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(root, DEST);
    config.filter = PathFilter::new("", Platform::Other);
    config.api_url = server.uri();
    config.content_url = server.uri();
    config.http_timeout = Duration::from_secs(5);
    config.upload_retry = Duration::from_secs(30);
    config.sync_retry = Duration::from_secs(300);
    config
}

fn engine(server: &MockServer, root: &Path, store: StateStore) -> SyncEngine {
    SyncEngine::new(config(server, root), store, TokenProvider::from_token("test-token"))
}

fn write_file(root: &Path, relative: &str, contents: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, contents).unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(UNIX_EPOCH + StdDuration::from_secs(1_600_000_000))
        .unwrap();
}

fn local_tree(files: &[&str]) -> TempDir {
    let dir = tempdir().unwrap();
    for name in files {
        write_file(dir.path(), name, name.as_bytes());
    }
    dir
}

fn key(relative: &str) -> String {
    crate::sync::paths::remote_key(DEST, relative)
}

async fn mount_missing_destination(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/2/files/list_folder"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error_summary": "path/not_found/.",
            "error": {".tag": "path", "path": {".tag": "not_found"}},
        })))
        .mount(server)
        .await;
}

async fn mount_upload_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/2/files/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "uploaded",
            "path_lower": "/box/uploaded",
            "path_display": "/Box/uploaded",
        })))
        .mount(server)
        .await;
}

async fn mount_delete_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/2/files/delete_v2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": {".tag": "file", "name": "x", "path_lower": "/box/x"},
        })))
        .mount(server)
        .await;
}

fn api_arg(request: &Request) -> serde_json::Value {
    let header = request
        .headers
        .get("Dropbox-API-Arg")
        .and_then(|value| value.to_str().ok())
        .unwrap();
    serde_json::from_str(header).unwrap()
}

fn arg_mode_is(mode: &'static str) -> impl Fn(&Request) -> bool + Send + Sync {
    move |request: &Request| {
        request
            .headers
            .get("Dropbox-API-Arg")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| serde_json::from_str::<serde_json::Value>(value).ok())
            .is_some_and(|arg| arg["mode"] == mode)
    }
}

/// Remote paths and modes of the uploads the server received, in order.
async fn uploads(server: &MockServer) -> Vec<(String, String)> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == "/2/files/upload")
        .map(|request| {
            let arg = api_arg(request);
            (
                arg["path"].as_str().unwrap().to_string(),
                arg["mode"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

async fn seed(store: &StateStore, index: FileIndex, queue: UploadQueue, meta: SyncMeta) {
    store.save(&index, &queue, &meta).await.unwrap();
}

fn queue_of(add: &[&str], update: &[&str], delete: &[&str]) -> UploadQueue {
    let owned = |items: &[&str]| items.iter().map(|item| item.to_string()).collect();
    UploadQueue {
        add: owned(add),
        update: owned(update),
        delete: owned(delete),
    }
}

fn ready_meta() -> SyncMeta {
    SyncMeta {
        phase: SyncPhase::QueueReady,
        last_queue_built_at: Some(now_unix()),
        ..SyncMeta::default()
    }
}

async fn drain(engine: &SyncEngine) -> usize {
    let mut steps = 0;
    loop {
        let tick = engine.upload_step().await;
        match tick.outcome {
            TickOutcome::Stepped { .. } => {
                assert_eq!(tick.schedule.upload, TimerChange::Arm(UPLOAD_STEP_DELAY));
                steps += 1;
            }
            TickOutcome::Finished => return steps,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}

#[tokio::test]
async fn sync_reseeds_index_and_queues_new_files() {
    let server = MockServer::start().await;
    let dir = local_tree(&["a.txt", "b.txt"]);
    let a_hash = crate::sync::hasher::hash_file(&dir.path().join("a.txt")).unwrap();
    Mock::given(method("POST"))
        .and(path("/2/files/list_folder"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                {".tag": "file", "name": "a.txt", "path_lower": "/box/a.txt", "content_hash": a_hash},
                {".tag": "file", "name": "old.txt", "path_lower": "/box/old.txt", "content_hash": "ff"},
            ],
            "cursor": "c",
            "has_more": false,
        })))
        .mount(&server)
        .await;

    let store = make_store().await;
    let engine = engine(&server, dir.path(), store.clone());
    let tick = engine.sync().await;

    assert!(matches!(tick.outcome, TickOutcome::QueueBuilt { pending: 2 }));
    assert_eq!(tick.schedule.upload, TimerChange::Arm(UPLOAD_START_DELAY));
    assert_eq!(tick.schedule.resync, TimerChange::Arm(MIN_RESYNC_INTERVAL));

    let queue = store.load_queue().await.unwrap();
    assert_eq!(queue, queue_of(&["b.txt"], &[], &["/box/old.txt"]));
    let index = store.load_index().await.unwrap();
    assert_eq!(
        index.get(&key("a.txt")),
        Some(&Freshness::LocalMtime(1_600_000_000))
    );
    let meta = store.load_meta().await.unwrap();
    assert_eq!(meta.phase, SyncPhase::QueueReady);
    assert_eq!(meta.backup_size, 10);
}

#[tokio::test]
async fn sync_then_drain_uploads_everything() {
    let server = MockServer::start().await;
    mount_missing_destination(&server).await;
    mount_upload_ok(&server).await;
    let dir = local_tree(&["a.txt", "docs/b.txt"]);

    let store = make_store().await;
    let engine = engine(&server, dir.path(), store.clone());
    assert!(matches!(
        engine.sync().await.outcome,
        TickOutcome::QueueBuilt { pending: 2 }
    ));

    assert_eq!(drain(&engine).await, 2);

    assert_eq!(
        uploads(&server).await,
        vec![
            ("/Box/a.txt".to_string(), "add".to_string()),
            ("/Box/docs/b.txt".to_string(), "add".to_string()),
        ]
    );
    let index = store.load_index().await.unwrap();
    assert_eq!(index.len(), 2);
    assert!(index.contains(&key("docs/b.txt")));
    let meta = store.load_meta().await.unwrap();
    assert_eq!(meta.phase, SyncPhase::Idle);
    assert!(meta.last_finished_at.is_some());

    let request = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|request| request.url.path() == "/2/files/upload")
        .unwrap();
    assert_eq!(request.body, b"a.txt");
}

#[tokio::test]
async fn drain_resumes_from_persisted_state() {
    let server = MockServer::start().await;
    mount_missing_destination(&server).await;
    mount_upload_ok(&server).await;
    let names = ["1.txt", "2.txt", "3.txt", "4.txt", "5.txt"];
    let dir = local_tree(&names);
    let store = make_store().await;

    {
        let engine = engine(&server, dir.path(), store.clone());
        engine.sync().await;
        for _ in 0..2 {
            assert!(matches!(
                engine.upload_step().await.outcome,
                TickOutcome::Stepped { .. }
            ));
        }
    }

    // A fresh engine over the same database picks up where the first stopped.
    let restarted = engine(&server, dir.path(), store.clone());
    assert_eq!(restarted.status().await.unwrap().pending_add, 3);
    assert_eq!(drain(&restarted).await, 3);

    let uploaded: Vec<String> = uploads(&server).await.into_iter().map(|(p, _)| p).collect();
    assert_eq!(
        uploaded,
        names.iter().map(|n| format!("/Box/{n}")).collect::<Vec<_>>()
    );
    let index = store.load_index().await.unwrap();
    let expected: FileIndex = names
        .iter()
        .map(|name| (key(name), Freshness::LocalMtime(1_600_000_000)))
        .collect();
    assert_eq!(index, expected);
}

#[tokio::test]
async fn drain_runs_adds_then_updates_then_deletes() {
    let server = MockServer::start().await;
    mount_upload_ok(&server).await;
    mount_delete_ok(&server).await;
    let dir = local_tree(&["new.txt", "changed.txt"]);
    let store = make_store().await;
    let index: FileIndex = [
        (key("changed.txt"), Freshness::LocalMtime(1)),
        (key("gone.txt"), Freshness::LocalMtime(1)),
    ]
    .into_iter()
    .collect();
    seed(
        &store,
        index,
        queue_of(&["new.txt"], &["changed.txt"], &["/box/gone.txt"]),
        ready_meta(),
    )
    .await;

    let engine = engine(&server, dir.path(), store.clone());
    let mut kinds = Vec::new();
    loop {
        match engine.upload_step().await.outcome {
            TickOutcome::Stepped { operation, .. } => kinds.push(operation.kind),
            TickOutcome::Finished => break,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(
        kinds,
        vec![OperationKind::Add, OperationKind::Update, OperationKind::Delete]
    );
    assert_eq!(
        uploads(&server).await,
        vec![
            ("/Box/new.txt".to_string(), "add".to_string()),
            ("/Box/changed.txt".to_string(), "overwrite".to_string()),
        ]
    );
    let index = store.load_index().await.unwrap();
    assert!(!index.contains("/box/gone.txt"));
    assert_eq!(
        index.get(&key("changed.txt")),
        Some(&Freshness::LocalMtime(1_600_000_000))
    );
}

#[tokio::test]
async fn add_conflict_is_reissued_as_overwrite() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/2/files/upload"))
        .and(arg_mode_is("add"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error_summary": "path/conflict/file/..",
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/files/upload"))
        .and(arg_mode_is("overwrite"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "a.txt",
            "path_lower": "/box/a.txt",
        })))
        .expect(1)
        .mount(&server)
        .await;
    let dir = local_tree(&["a.txt"]);
    let store = make_store().await;
    seed(&store, FileIndex::new(), queue_of(&["a.txt"], &[], &[]), ready_meta()).await;

    let engine = engine(&server, dir.path(), store.clone());
    assert!(matches!(
        engine.upload_step().await.outcome,
        TickOutcome::Stepped { remaining: 0, .. }
    ));
    assert!(store.load_index().await.unwrap().contains(&key("a.txt")));
}

#[tokio::test]
async fn delete_of_missing_remote_file_counts_as_done() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/2/files/delete_v2"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error_summary": "path_lookup/not_found/..",
        })))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let store = make_store().await;
    let index: FileIndex = [(key("gone.txt"), Freshness::LocalMtime(1))]
        .into_iter()
        .collect();
    seed(&store, index, queue_of(&[], &[], &["/box/gone.txt"]), ready_meta()).await;

    let engine = engine(&server, dir.path(), store.clone());
    engine.upload_step().await;

    assert!(store.load_index().await.unwrap().is_empty());
    assert!(store.load_queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn vanished_local_file_is_dropped_from_queue() {
    let server = MockServer::start().await;
    mount_upload_ok(&server).await;
    let dir = local_tree(&["kept.txt"]);
    let store = make_store().await;
    seed(
        &store,
        FileIndex::new(),
        queue_of(&["vanished.txt", "kept.txt"], &[], &[]),
        ready_meta(),
    )
    .await;

    let engine = engine(&server, dir.path(), store.clone());
    assert_eq!(drain(&engine).await, 2);

    assert_eq!(uploads(&server).await.len(), 1);
    let index = store.load_index().await.unwrap();
    assert!(!index.contains(&key("vanished.txt")));
    assert!(index.contains(&key("kept.txt")));
}

#[tokio::test]
async fn transient_failure_leaves_state_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/2/files/upload"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;
    let dir = local_tree(&["a.txt"]);
    let store = make_store().await;
    seed(&store, FileIndex::new(), queue_of(&["a.txt"], &[], &[]), ready_meta()).await;
    let before = store.load_meta().await.unwrap();

    let engine = engine(&server, dir.path(), store.clone());
    let tick = engine.upload_step().await;

    assert!(matches!(tick.outcome, TickOutcome::Failed(EngineError::Api(_))));
    assert_eq!(tick.schedule.upload, TimerChange::Arm(Duration::from_secs(30)));
    assert_eq!(
        store.load_queue().await.unwrap(),
        queue_of(&["a.txt"], &[], &[])
    );
    assert!(store.load_index().await.unwrap().is_empty());
    assert_eq!(store.load_meta().await.unwrap(), before);
}

#[tokio::test]
async fn rate_limit_waits_for_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/2/files/upload"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "120")
                .set_body_json(json!({"error_summary": "too_many_requests/.."})),
        )
        .mount(&server)
        .await;
    let dir = local_tree(&["a.txt"]);
    let store = make_store().await;
    seed(&store, FileIndex::new(), queue_of(&["a.txt"], &[], &[]), ready_meta()).await;

    let engine = engine(&server, dir.path(), store);
    let tick = engine.upload_step().await;

    assert_eq!(tick.schedule.upload, TimerChange::Arm(Duration::from_secs(120)));
}

async fn mount_upload_error(server: &MockServer, summary: &str) {
    Mock::given(method("POST"))
        .and(path("/2/files/upload"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error_summary": summary,
            "error": {".tag": "path"},
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn quota_error_keeps_queue_and_does_not_finish() {
    let server = MockServer::start().await;
    mount_upload_error(&server, "path/insufficient_space/..").await;
    let dir = local_tree(&["a.txt", "b.txt"]);
    let store = make_store().await;
    seed(
        &store,
        FileIndex::new(),
        queue_of(&["a.txt", "b.txt"], &[], &[]),
        ready_meta(),
    )
    .await;
    let before = store.load_meta().await.unwrap();

    let engine = engine(&server, dir.path(), store.clone());
    for _ in 0..3 {
        let tick = engine.upload_step().await;
        assert!(matches!(tick.outcome, TickOutcome::Failed(EngineError::Api(_))));
        assert_eq!(tick.schedule.upload, TimerChange::Arm(Duration::from_secs(30)));
    }

    assert_eq!(
        store.load_queue().await.unwrap(),
        queue_of(&["a.txt", "b.txt"], &[], &[])
    );
    assert!(store.load_index().await.unwrap().is_empty());
    assert_eq!(store.load_meta().await.unwrap(), before);
    let status = engine.status().await.unwrap();
    assert_eq!(status.pending_add, 2);
    assert!(status.last_finished_at.is_none());
}

#[tokio::test]
async fn write_throttling_is_not_a_per_file_drop() {
    let server = MockServer::start().await;
    mount_upload_error(&server, "too_many_write_operations/..").await;
    let dir = local_tree(&["a.txt"]);
    let store = make_store().await;
    seed(&store, FileIndex::new(), queue_of(&["a.txt"], &[], &[]), ready_meta()).await;

    let engine = engine(&server, dir.path(), store.clone());
    let tick = engine.upload_step().await;

    assert!(matches!(tick.outcome, TickOutcome::Failed(_)));
    assert_eq!(
        store.load_queue().await.unwrap(),
        queue_of(&["a.txt"], &[], &[])
    );
}

#[tokio::test]
async fn refused_path_is_dropped_and_counted() {
    let server = MockServer::start().await;
    mount_upload_error(&server, "path/disallowed_name/").await;
    let dir = local_tree(&["a.txt"]);
    let store = make_store().await;
    seed(&store, FileIndex::new(), queue_of(&["a.txt"], &[], &[]), ready_meta()).await;

    let engine = engine(&server, dir.path(), store.clone());
    let tick = engine.upload_step().await;
    assert!(matches!(
        tick.outcome,
        TickOutcome::Stepped { remaining: 0, .. }
    ));
    assert!(!store.load_index().await.unwrap().contains(&key("a.txt")));
    assert_eq!(store.load_meta().await.unwrap().rejected_files, 1);

    let tick = engine.upload_step().await;
    assert!(matches!(tick.outcome, TickOutcome::Finished));
    let status = engine.status().await.unwrap();
    assert_eq!(status.rejected_files, 1);
    assert!(status.to_string().contains("Rejected by Dropbox: 1"));
}

#[tokio::test]
async fn missing_credential_skips_every_entry_point() {
    let server = MockServer::start().await;
    let dir = local_tree(&["a.txt"]);
    let store = make_store().await;
    let engine = SyncEngine::new(
        config(&server, dir.path()),
        store.clone(),
        TokenProvider::default(),
    );

    let tick = engine.sync().await;
    assert!(matches!(
        tick.outcome,
        TickOutcome::Skipped(SkipReason::MissingCredential)
    ));
    assert_eq!(tick.schedule.sync, TimerChange::Arm(Duration::from_secs(300)));

    seed(&store, FileIndex::new(), queue_of(&["a.txt"], &[], &[]), ready_meta()).await;
    assert!(matches!(
        engine.upload_step().await.outcome,
        TickOutcome::Skipped(SkipReason::MissingCredential)
    ));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn resync_waits_for_a_running_drain() {
    let server = MockServer::start().await;
    let dir = local_tree(&["a.txt", "b.txt"]);
    let store = make_store().await;
    let meta = SyncMeta {
        last_step_at: Some(now_unix() - 60),
        ..ready_meta()
    };
    seed(&store, FileIndex::new(), queue_of(&["a.txt"], &[], &[]), meta).await;

    let engine = engine(&server, dir.path(), store.clone());
    let tick = engine.resync().await;

    assert!(matches!(
        tick.outcome,
        TickOutcome::Skipped(SkipReason::DrainInProgress)
    ));
    assert_eq!(tick.schedule.resync, TimerChange::Arm(MIN_RESYNC_INTERVAL));
    assert_eq!(
        store.load_queue().await.unwrap(),
        queue_of(&["a.txt"], &[], &[])
    );
}

#[tokio::test]
async fn resync_rebuilds_a_stuck_drain() {
    let server = MockServer::start().await;
    let dir = local_tree(&["a.txt", "b.txt"]);
    let store = make_store().await;
    let stuck = now_unix() - 16 * 60;
    let meta = SyncMeta {
        last_queue_built_at: Some(stuck),
        last_step_at: Some(stuck),
        ..ready_meta()
    };
    seed(&store, FileIndex::new(), queue_of(&["a.txt"], &[], &[]), meta).await;

    let engine = engine(&server, dir.path(), store.clone());
    let tick = engine.resync().await;

    assert!(matches!(tick.outcome, TickOutcome::QueueBuilt { pending: 2 }));
    assert_eq!(
        store.load_queue().await.unwrap(),
        queue_of(&["a.txt", "b.txt"], &[], &[])
    );
    // No remote listing for a resync.
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn resync_diffs_against_persisted_index() {
    let server = MockServer::start().await;
    let dir = local_tree(&["a.txt", "b.txt"]);
    let store = make_store().await;
    let index: FileIndex = [
        (key("a.txt"), Freshness::LocalMtime(1_600_000_000)),
        (key("b.txt"), Freshness::LocalMtime(1_600_000_000)),
    ]
    .into_iter()
    .collect();
    let meta = SyncMeta {
        phase: SyncPhase::Idle,
        last_queue_built_at: Some(now_unix() - 3_600),
        ..SyncMeta::default()
    };
    seed(&store, index, UploadQueue::default(), meta).await;

    let engine = engine(&server, dir.path(), store.clone());
    let tick = engine.resync().await;
    assert!(matches!(tick.outcome, TickOutcome::Finished));
    assert_eq!(tick.schedule.upload, TimerChange::Disarm);
    assert!(store.load_meta().await.unwrap().last_finished_at.is_some());

    std::fs::remove_file(dir.path().join("b.txt")).unwrap();
    let tick = engine.resync().await;
    assert!(matches!(tick.outcome, TickOutcome::QueueBuilt { pending: 1 }));
    assert_eq!(
        store.load_queue().await.unwrap(),
        queue_of(&[], &[], &["/box/b.txt"])
    );
}

#[tokio::test]
async fn first_resync_falls_back_to_full_sync() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/2/files/list_folder"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [],
            "cursor": "c",
            "has_more": false,
        })))
        .expect(1)
        .mount(&server)
        .await;
    let dir = local_tree(&["a.txt"]);
    let store = make_store().await;

    let engine = engine(&server, dir.path(), store.clone());
    let tick = engine.resync().await;

    assert!(matches!(tick.outcome, TickOutcome::QueueBuilt { pending: 1 }));
}

#[tokio::test]
async fn oversized_state_is_sticky_until_a_full_sync_succeeds() {
    let server = MockServer::start().await;
    mount_missing_destination(&server).await;
    let dir = tempdir().unwrap();
    for i in 0..200u64 {
        // Scattered names so the queue does not compress away.
        let name = format!("f{:016x}.txt", i.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        write_file(dir.path(), &name, b"x");
    }
    let store = make_store().await;
    let previous_index: FileIndex = [(key("seed.txt"), Freshness::LocalMtime(7))]
        .into_iter()
        .collect();
    seed(&store, previous_index.clone(), UploadQueue::default(), SyncMeta::default()).await;

    let small = engine(&server, dir.path(), store.clone().with_limit(256));
    let tick = small.sync().await;

    assert!(matches!(tick.outcome, TickOutcome::Failed(ref err) if err.is_state_too_large()));
    assert_eq!(tick.schedule.sync, TimerChange::Keep);
    assert_eq!(store.load_index().await.unwrap(), previous_index);
    assert!(store.load_meta().await.unwrap().sticky_error.is_some());

    assert!(matches!(
        small.upload_step().await.outcome,
        TickOutcome::Skipped(SkipReason::StickyError)
    ));
    assert!(matches!(
        small.resync().await.outcome,
        TickOutcome::Skipped(SkipReason::StickyError)
    ));

    // With room for the state the next full sync clears the error.
    let roomy = engine(&server, dir.path(), store.clone());
    assert!(matches!(
        roomy.sync().await.outcome,
        TickOutcome::QueueBuilt { pending: 200 }
    ));
    assert!(store.load_meta().await.unwrap().sticky_error.is_none());
}

#[tokio::test]
async fn slow_listing_hits_the_time_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/2/files/list_folder"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"entries": [], "cursor": "c", "has_more": false}))
                .set_delay(StdDuration::from_secs(2)),
        )
        .mount(&server)
        .await;
    let dir = local_tree(&["a.txt"]);
    let store = make_store().await;
    let mut config = config(&server, dir.path());
    config.time_limit = Duration::from_millis(200);
    let engine = SyncEngine::new(config, store.clone(), TokenProvider::from_token("t"));

    let tick = engine.sync().await;

    assert!(matches!(tick.outcome, TickOutcome::Failed(EngineError::TimeLimit(_))));
    assert_eq!(tick.schedule.sync, TimerChange::Arm(Duration::from_secs(300)));
    assert!(store.load_queue().await.unwrap().is_empty());
    assert_eq!(store.load_meta().await.unwrap(), SyncMeta::default());
}

#[tokio::test]
async fn sync_and_drain_completes_in_one_call() {
    let server = MockServer::start().await;
    mount_missing_destination(&server).await;
    mount_upload_ok(&server).await;
    let dir = local_tree(&["a.txt", "b.txt", "c.txt"]);
    let store = make_store().await;

    let engine = engine(&server, dir.path(), store.clone());
    assert_eq!(engine.sync_and_drain().await.unwrap(), 3);
    assert_eq!(engine.status().await.unwrap().pending(), 0);
    assert_eq!(engine.status().await.unwrap().indexed_files, 3);
}

#[tokio::test]
async fn reset_forgets_state() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let store = make_store().await;
    seed(
        &store,
        [(key("a.txt"), Freshness::LocalMtime(1))].into_iter().collect(),
        queue_of(&["b.txt"], &[], &[]),
        ready_meta(),
    )
    .await;

    let engine = engine(&server, dir.path(), store);
    let status = engine.status().await.unwrap();
    assert_eq!(status.pending_add, 1);
    assert_eq!(status.indexed_files, 1);

    engine.reset().await.unwrap();

    let status = engine.status().await.unwrap();
    assert_eq!(status.pending(), 0);
    assert_eq!(status.indexed_files, 0);
    assert_eq!(status.phase, SyncPhase::Idle);
}

#[tokio::test]
async fn account_summary_reads_owner_and_quota() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/2/users/get_current_account"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "account_id": "dbid:1",
            "name": {"display_name": "Jo Doe"},
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/users/get_space_usage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "used": 1024,
            "allocation": {".tag": "individual", "allocated": 2048},
        })))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();

    let engine = engine(&server, dir.path(), make_store().await);
    let summary = engine.account_summary().await.unwrap();

    assert_eq!(
        summary,
        AccountSummary {
            display_name: "Jo Doe".into(),
            used: 1024,
            allocated: 2048,
        }
    );
}

#[test]
fn resync_interval_has_a_floor() {
    let mut config = EngineConfig::new("/tmp", DEST);
    config.resync_interval = Duration::from_secs(60);
    assert_eq!(config.resync_interval(), MIN_RESYNC_INTERVAL);
    config.resync_interval = Duration::from_secs(3 * 3600);
    assert_eq!(config.resync_interval(), Duration::from_secs(3 * 3600));
}
