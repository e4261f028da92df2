//! Unit tests for the object metadata cache: TTL, invalidation, insert
//! publication, and single-flight coalescing.

#[path = "../support/mock.rs"]
mod mock;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use objfs::http::request::HttpRequest;
use objfs::store::{Hint, Object, ObjectCache, ObjectKind, StoreContext};

use mock::MockStore;

fn executor(store: &MockStore) -> HttpRequest {
    HttpRequest::with_transport(store.transport(), &store.config(), None)
}

fn context(store: &MockStore) -> Arc<StoreContext> {
    StoreContext::new(&store.config())
}

fn cache(ttl_s: u64) -> ObjectCache {
    ObjectCache::new(Duration::from_secs(ttl_s))
}

#[test]
fn get_memoizes_within_ttl() -> objfs::Result<()> {
    let store = MockStore::new("bkt");
    store.insert_file("a", b"hello", "text/plain");
    let ctx = context(&store);
    let cache = cache(120);
    let mut req = executor(&store);

    let first = cache.get(&mut req, &ctx, "a", Hint::None)?;
    assert_eq!(first.kind(), ObjectKind::File);
    assert_eq!(first.size(), 5);

    let second = cache.get(&mut req, &ctx, "a", Hint::None)?;
    assert_eq!(second.etag(), first.etag());

    // One resolution pass: the dir variant missed, the file variant hit.
    assert_eq!(store.count("HEAD a/"), 1);
    assert_eq!(store.count("HEAD a"), 1);
    Ok(())
}

#[test]
fn zero_ttl_always_refetches() -> objfs::Result<()> {
    let store = MockStore::new("bkt");
    store.insert_file("a", b"x", "text/plain");
    let ctx = context(&store);
    let cache = cache(0);
    let mut req = executor(&store);

    cache.get(&mut req, &ctx, "a", Hint::IsFile)?;
    cache.get(&mut req, &ctx, "a", Hint::IsFile)?;
    assert_eq!(store.count("HEAD a"), 2);
    Ok(())
}

#[test]
fn invalidate_forces_fresh_head() -> objfs::Result<()> {
    let store = MockStore::new("bkt");
    store.insert_file("a", b"x", "text/plain");
    let ctx = context(&store);
    let cache = cache(120);
    let mut req = executor(&store);

    cache.get(&mut req, &ctx, "a", Hint::IsFile)?;
    assert!(cache.contains_fresh("a"));
    cache.invalidate("a");
    assert!(!cache.contains_fresh("a"));
    cache.get(&mut req, &ctx, "a", Hint::IsFile)?;
    assert_eq!(store.count("HEAD a"), 2);
    Ok(())
}

#[test]
fn insert_publishes_without_head() -> objfs::Result<()> {
    let store = MockStore::new("bkt");
    let ctx = context(&store);
    let cache = cache(120);
    let mut req = executor(&store);

    let mut object = Object::for_new(&ctx, "fresh", ObjectKind::File, 0o644);
    object.set_etag("etag-published");
    cache.insert(object);

    let got = cache.get(&mut req, &ctx, "fresh", Hint::IsFile)?;
    assert_eq!(got.etag(), "etag-published");
    assert_eq!(store.count("HEAD fresh"), 0);
    Ok(())
}

#[test]
fn missing_path_yields_enoent_after_both_variants() {
    let store = MockStore::new("bkt");
    let ctx = context(&store);
    let cache = cache(120);
    let mut req = executor(&store);

    let err = cache
        .get(&mut req, &ctx, "ghost", Hint::None)
        .expect_err("missing object must fail");
    assert_eq!(objfs::errno_of(&err), libc::ENOENT);
    assert_eq!(store.count("HEAD ghost/"), 1);
    assert_eq!(store.count("HEAD ghost"), 1);
}

#[test]
fn file_hint_skips_directory_variant() -> objfs::Result<()> {
    let store = MockStore::new("bkt");
    store.insert_file("a", b"x", "text/plain");
    let ctx = context(&store);
    let cache = cache(120);
    let mut req = executor(&store);

    cache.get(&mut req, &ctx, "a", Hint::IsFile)?;
    assert_eq!(store.count("HEAD a/"), 0);
    Ok(())
}

#[test]
fn directory_resolution_prefers_trailing_slash() -> objfs::Result<()> {
    let store = MockStore::new("bkt");
    store.insert_dir("d/");
    let ctx = context(&store);
    let cache = cache(120);
    let mut req = executor(&store);

    let object = cache.get(&mut req, &ctx, "d", Hint::None)?;
    assert_eq!(object.kind(), ObjectKind::Directory);
    assert_eq!(store.count("HEAD d/"), 1);
    assert_eq!(store.count("HEAD d"), 0);
    Ok(())
}

#[test]
fn concurrent_cold_lookups_share_one_flight() -> objfs::Result<()> {
    let store = MockStore::new("bkt");
    store.insert_file("cold", b"payload", "text/plain");
    let ctx = context(&store);
    let cache = Arc::new(cache(120));

    let mut joins = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let ctx = ctx.clone();
        let cache = cache.clone();
        joins.push(thread::spawn(move || {
            let mut req = executor(&store);
            cache
                .get(&mut req, &ctx, "cold", Hint::None)
                .map(|o| o.etag().to_string())
        }));
    }

    let mut etags = Vec::new();
    for join in joins {
        etags.push(join.join().unwrap().expect("lookup should succeed"));
    }
    etags.dedup();
    assert_eq!(etags.len(), 1, "all waiters observe the same descriptor");

    // Exactly one fetch flight hit the remote.
    assert_eq!(store.count("HEAD cold/"), 1);
    assert_eq!(store.count("HEAD cold"), 1);
    Ok(())
}

#[test]
fn waiters_see_the_shared_error() {
    let store = MockStore::new("bkt");
    let ctx = context(&store);
    let cache = Arc::new(cache(120));

    let mut joins = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let ctx = ctx.clone();
        let cache = cache.clone();
        joins.push(thread::spawn(move || {
            let mut req = executor(&store);
            cache
                .get(&mut req, &ctx, "ghost", Hint::IsFile)
                .map(drop)
                .map_err(|err| objfs::errno_of(&err))
        }));
    }
    for join in joins {
        assert_eq!(join.join().unwrap().unwrap_err(), libc::ENOENT);
    }
    assert_eq!(store.count("HEAD ghost"), 1);

    // The failed flight leaves no entry behind.
    assert!(!cache.contains_fresh("ghost"));
}

#[test]
fn metadata_headers_round_trip_into_descriptor() -> objfs::Result<()> {
    let store = MockStore::new("bkt");
    let ctx = context(&store);
    let cache = cache(120);

    // Store an object the way a flush would: reserved keys plus user
    // metadata.
    {
        let mut req = executor(&store);
        let mut object = Object::for_new(&ctx, "meta.txt", ObjectKind::File, 0o600);
        object.set_user_meta("origin", "unit-test");
        req.init(objfs::http::Method::Put)?;
        req.set_url(&ctx.object_url("meta.txt"), "");
        object.apply_write_headers(&mut req);
        req.set_input_buffer(b"body".to_vec())?;
        req.run()?;
        assert_eq!(req.response_code(), 200);
    }

    let mut req = executor(&store);
    let got = cache.get(&mut req, &ctx, "meta.txt", Hint::IsFile)?;
    assert_eq!(got.mode(), 0o600);
    assert_eq!(got.user_meta("origin"), Some("unit-test"));
    assert_eq!(got.user_meta("ORIGIN"), Some("unit-test"));
    Ok(())
}
