//! End-to-end engine tests against the in-memory mock store: the facade,
//! pools, cache, and open-file table working together.

#[path = "../support/mock.rs"]
mod mock;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use objfs::fs::Engine;
use objfs::http::hook::RequestHook;
use objfs::http::request::{HttpRequest, Method};
use objfs::pool::ExecutorFactory;
use objfs::services::S3Hook;
use objfs::store::ObjectKind;

use mock::{FailureKind, MockStore};

fn engine_for(store: &MockStore) -> Engine {
    let config = store.config();
    let hook: Arc<dyn RequestHook> = Arc::new(S3Hook::new(&config));
    let factory: ExecutorFactory = {
        let store = store.clone();
        let config = config.clone();
        let hook = hook.clone();
        Arc::new(move || {
            Ok(HttpRequest::with_transport(
                store.transport(),
                &config,
                Some(hook.clone()),
            ))
        })
    };
    Engine::with_factory(&config, hook, factory)
}

#[test]
fn create_write_release_then_getattr() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.create("/a", 0o644).unwrap();
    let fh = engine.open("/a").unwrap();
    assert_eq!(engine.write(fh, 0, b"hello").unwrap(), 5);
    engine.release(fh).unwrap();

    let attr = engine.getattr("/a").unwrap();
    assert_eq!(attr.size, 5);
    assert_eq!(attr.mode, 0o644);
    assert_eq!(attr.kind, ObjectKind::File);
    assert_eq!(store.body("a").unwrap(), b"hello");

    engine.shutdown();
}

#[test]
fn flush_retries_once_through_the_hook_on_500() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.create("/a", 0o644).unwrap();
    let fh = engine.open("/a").unwrap();
    engine.write(fh, 0, b"retry me").unwrap();

    let puts_before = store.count("PUT a");
    store.fail_next(Some(Method::Put), FailureKind::Status(500));
    engine.release(fh).unwrap();

    assert_eq!(store.count("PUT a"), puts_before + 2, "one failed, one retried");
    assert_eq!(store.body("a").unwrap(), b"retry me");

    engine.shutdown();
}

#[test]
fn mkdir_readdir_create_readdir() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.mkdir("/d", 0o755).unwrap();
    assert!(engine.readdir("/d").unwrap().is_empty());

    engine.create("/d/f", 0o644).unwrap();
    let entries = engine.readdir("/d").unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["f"]);

    engine.shutdown();
}

#[test]
fn concurrent_handles_last_flush_wins_and_both_release_cleanly() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.create("/a", 0o644).unwrap();
    let first = engine.open("/a").unwrap();
    let second = engine.open("/a").unwrap();
    assert_ne!(first, second);

    engine.write(first, 0, b"alpha").unwrap();
    engine.write(second, 0, b"beta!").unwrap();

    let engine_a = engine.clone();
    let engine_b = engine.clone();
    let ja = thread::spawn(move || engine_a.release(first));
    let jb = thread::spawn(move || engine_b.release(second));
    ja.join().unwrap().unwrap();
    jb.join().unwrap().unwrap();

    let body = store.body("a").unwrap();
    assert!(
        body == b"alpha" || body == b"beta!",
        "final object is the body of whichever flushed last"
    );
    assert_eq!(engine.open_handle_count(), 0);

    engine.shutdown();
}

#[test]
fn unlink_beats_the_cache_ttl() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.create("/a", 0o644).unwrap();
    engine.getattr("/a").unwrap();

    engine.unlink("/a").unwrap();
    assert_eq!(engine.getattr("/a").unwrap_err(), libc::ENOENT);
    assert!(!store.contains("a"));

    engine.shutdown();
}

#[test]
fn shutdown_rejects_subsequent_operations_with_eshutdown() {
    let store = MockStore::new("bkt");
    store.insert_file("a", b"x", "text/plain");
    let engine = engine_for(&store);

    engine.getattr("/a").unwrap();
    engine.shutdown();

    assert_eq!(engine.getattr("/a").unwrap_err(), libc::ESHUTDOWN);
    assert_eq!(engine.create("/b", 0o644).unwrap_err(), libc::ESHUTDOWN);
}

#[test]
fn open_write_close_open_read_round_trips() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.create("/notes.txt", 0o600).unwrap();
    let fh = engine.open("/notes.txt").unwrap();
    engine.write(fh, 0, b"first line\n").unwrap();
    engine.write(fh, 11, b"second line\n").unwrap();
    engine.release(fh).unwrap();

    let fh = engine.open("/notes.txt").unwrap();
    let bytes = engine.read(fh, 0, 1024).unwrap();
    assert_eq!(bytes, b"first line\nsecond line\n");
    let tail = engine.read(fh, 11, 1024).unwrap();
    assert_eq!(tail, b"second line\n");
    engine.release(fh).unwrap();

    engine.shutdown();
}

#[test]
fn getattr_on_missing_path_is_enoent() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    assert_eq!(engine.getattr("/nope").unwrap_err(), libc::ENOENT);

    engine.shutdown();
}

#[test]
fn zero_length_objects_round_trip() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.create("/empty", 0o644).unwrap();
    let fh = engine.open("/empty").unwrap();
    assert!(engine.read(fh, 0, 1024).unwrap().is_empty());
    engine.release(fh).unwrap();

    assert_eq!(engine.getattr("/empty").unwrap().size, 0);
    assert_eq!(store.body("empty").unwrap(), b"");

    engine.shutdown();
}

#[test]
fn rename_file_copies_then_deletes() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.create("/old.txt", 0o644).unwrap();
    let fh = engine.open("/old.txt").unwrap();
    engine.write(fh, 0, b"contents").unwrap();
    engine.release(fh).unwrap();

    engine.rename("/old.txt", "/new.txt").unwrap();

    assert_eq!(engine.getattr("/old.txt").unwrap_err(), libc::ENOENT);
    assert_eq!(engine.getattr("/new.txt").unwrap().size, 8);
    assert_eq!(store.body("new.txt").unwrap(), b"contents");
    assert!(!store.contains("old.txt"));

    engine.shutdown();
}

#[test]
fn rename_replaces_an_existing_file_target() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    store.insert_file("src", b"source", "text/plain");
    store.insert_file("dst", b"target", "text/plain");

    engine.rename("/src", "/dst").unwrap();
    assert_eq!(store.body("dst").unwrap(), b"source");
    assert!(!store.contains("src"));

    engine.shutdown();
}

#[test]
fn rename_directory_moves_the_whole_subtree() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.mkdir("/d", 0o755).unwrap();
    engine.create("/d/a", 0o644).unwrap();
    engine.mkdir("/d/sub", 0o755).unwrap();
    engine.create("/d/sub/b", 0o644).unwrap();

    engine.rename("/d", "/e").unwrap();

    let keys = store.keys();
    assert!(keys.contains(&"e/".to_string()));
    assert!(keys.contains(&"e/a".to_string()));
    assert!(keys.contains(&"e/sub/".to_string()));
    assert!(keys.contains(&"e/sub/b".to_string()));
    assert!(!keys.iter().any(|k| k.starts_with("d/") || k == "d"));

    assert_eq!(engine.getattr("/d/a").unwrap_err(), libc::ENOENT);
    assert_eq!(engine.getattr("/e/sub/b").unwrap().kind, ObjectKind::File);

    engine.shutdown();
}

#[test]
fn rmdir_refuses_non_empty_directories() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.mkdir("/d", 0o755).unwrap();
    engine.create("/d/f", 0o644).unwrap();

    assert_eq!(engine.rmdir("/d").unwrap_err(), libc::ENOTEMPTY);

    engine.unlink("/d/f").unwrap();
    engine.rmdir("/d").unwrap();
    assert_eq!(engine.getattr("/d").unwrap_err(), libc::ENOENT);

    engine.shutdown();
}

#[test]
fn truncate_shrinks_and_extends() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.create("/t", 0o644).unwrap();
    let fh = engine.open("/t").unwrap();
    engine.write(fh, 0, b"123456").unwrap();
    engine.release(fh).unwrap();

    engine.truncate("/t", 3).unwrap();
    assert_eq!(store.body("t").unwrap(), b"123");
    assert_eq!(engine.getattr("/t").unwrap().size, 3);

    engine.truncate("/t", 6).unwrap();
    assert_eq!(store.body("t").unwrap(), b"123\0\0\0");

    engine.shutdown();
}

#[test]
fn symlink_readlink_round_trips() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.symlink("../target/file", "/link").unwrap();
    let attr = engine.getattr("/link").unwrap();
    assert_eq!(attr.kind, ObjectKind::Symlink);
    assert_eq!(engine.readlink("/link").unwrap(), "../target/file");

    // readlink on a regular file is EINVAL.
    engine.create("/plain", 0o644).unwrap();
    assert_eq!(engine.readlink("/plain").unwrap_err(), libc::EINVAL);

    engine.shutdown();
}

#[test]
fn chmod_and_chown_rewrite_metadata_in_place() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.create("/m", 0o644).unwrap();
    engine.chmod("/m", 0o600).unwrap();
    assert_eq!(engine.getattr("/m").unwrap().mode, 0o600);

    engine.chown("/m", Some(1234), Some(5678)).unwrap();
    let attr = engine.getattr("/m").unwrap();
    assert_eq!(attr.uid, 1234);
    assert_eq!(attr.gid, 5678);
    // mode survives the ownership commit.
    assert_eq!(attr.mode, 0o600);

    engine.shutdown();
}

#[test]
fn xattrs_map_onto_user_metadata() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);

    engine.create("/x", 0o644).unwrap();

    engine.setxattr("/x", "user.color", b"blue").unwrap();
    assert_eq!(engine.getxattr("/x", "user.color").unwrap(), b"blue");

    let names = engine.listxattr("/x").unwrap();
    assert_eq!(names, vec!["user.color".to_string()]);

    // Engine-reserved keys are protected.
    assert_eq!(
        engine.setxattr("/x", "objfs-mode", b"4095").unwrap_err(),
        libc::EPERM
    );
    assert_eq!(engine.removexattr("/x", "objfs-uid").unwrap_err(), libc::EPERM);

    engine.removexattr("/x", "user.color").unwrap();
    assert_eq!(
        engine.getxattr("/x", "user.color").unwrap_err(),
        libc::ENODATA
    );
    assert_eq!(
        engine.removexattr("/x", "user.color").unwrap_err(),
        libc::ENODATA
    );

    engine.shutdown();
}

#[test]
fn probe_reports_auth_failures_and_reachability() {
    let store = MockStore::new("bkt");
    let engine = engine_for(&store);
    engine.probe().unwrap();
    engine.shutdown();

    let store = MockStore::new("bkt");
    let engine = engine_for(&store);
    // 403 twice: the hook does not retry client errors, but a scripted 403
    // only fires once and the probe must see it.
    store.fail_next(None, FailureKind::Status(403));
    assert_eq!(engine.probe().unwrap_err(), libc::EACCES);
    engine.shutdown();
}

#[test]
fn readdir_prefills_descriptors_in_the_background() {
    let store = MockStore::new("bkt");
    store.insert_dir("d/");
    store.insert_file("d/f", b"data", "text/plain");
    let engine = engine_for(&store);

    engine.readdir("/d").unwrap();

    // The background pool HEADs each listed entry; give it a moment.
    let deadline = Instant::now() + Duration::from_secs(2);
    while store.count("HEAD d/f") == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(
        store.count("HEAD d/f") >= 1,
        "prefill should HEAD listed children"
    );

    // A getattr right after readdir is served from the warmed cache.
    let heads = store.count("HEAD d/f");
    engine.getattr("/d/f").unwrap();
    assert_eq!(store.count("HEAD d/f"), heads);

    engine.shutdown();
}

#[test]
fn paginated_listings_walk_every_page() {
    let store = MockStore::new("bkt");
    store.set_page_size(3);
    store.insert_dir("d/");
    for i in 0..10 {
        store.insert_file(&format!("d/file{i:02}"), b"x", "text/plain");
    }
    let engine = engine_for(&store);

    let entries = engine.readdir("/d").unwrap();
    assert_eq!(entries.len(), 10);
    assert_eq!(entries.first().unwrap().name, "file00");
    assert_eq!(entries.last().unwrap().name, "file09");

    engine.shutdown();
}
