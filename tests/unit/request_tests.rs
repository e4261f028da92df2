//! Unit tests for the request executor: retry policy, deadline handling,
//! cancellation, and hook callbacks, all against scripted transports.

#[path = "../support/mock.rs"]
mod mock;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use objfs::config::Config;
use objfs::http::hook::{ListPage, RequestHook};
use objfs::http::request::{
    HttpRequest, Method, Transport, TransportError, TransportRequest, TransportResponse,
};
use objfs::Error;

use mock::{FailureKind, MockStore};

/// Transport that replays a scripted sequence of outcomes.
struct ScriptTransport {
    script: Mutex<Vec<Result<TransportResponse, TransportError>>>,
    attempts: AtomicU32,
}

impl ScriptTransport {
    fn new(script: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            attempts: AtomicU32::new(0),
        })
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptTransport {
    fn perform(
        &self,
        _req: &TransportRequest<'_>,
    ) -> Result<TransportResponse, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock();
        assert!(!script.is_empty(), "transport called more often than scripted");
        script.remove(0)
    }
}

fn ok_response(status: u16) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status,
        headers: vec![("ETag".to_string(), "\"e1\"".to_string())],
        body: Vec::new(),
    })
}

fn retryable() -> Result<TransportResponse, TransportError> {
    Err(TransportError::Retryable("connection reset".to_string()))
}

fn test_config(retries: u32) -> Config {
    Config {
        endpoint: "http://mock".to_string(),
        bucket: "bkt".to_string(),
        max_transfer_retries: retries,
        ..Config::default()
    }
}

struct CountingHook {
    pre_runs: AtomicU32,
    retry_once_on_5xx: bool,
}

impl CountingHook {
    fn new(retry_once_on_5xx: bool) -> Arc<Self> {
        Arc::new(Self {
            pre_runs: AtomicU32::new(0),
            retry_once_on_5xx,
        })
    }
}

impl RequestHook for CountingHook {
    fn pre_run(&self, req: &mut HttpRequest, attempt: u32) -> objfs::Result<()> {
        self.pre_runs.fetch_add(1, Ordering::SeqCst);
        // A fresh signature would go here; use a header to prove the hook
        // ran per attempt.
        req.set_header("x-attempt", &attempt.to_string());
        Ok(())
    }

    fn should_retry(&self, req: &HttpRequest, attempt: u32) -> bool {
        self.retry_once_on_5xx && req.response_code() >= 500 && attempt == 0
    }

    fn list_query(&self, _prefix: &str, _marker: Option<&str>, _delimited: bool) -> String {
        String::new()
    }

    fn parse_list(&self, _body: &[u8]) -> objfs::Result<ListPage> {
        Ok(ListPage::default())
    }
}

#[test]
fn transport_failures_retry_until_success() -> objfs::Result<()> {
    let transport = ScriptTransport::new(vec![retryable(), retryable(), ok_response(200)]);
    let mut req = HttpRequest::with_transport(transport.clone(), &test_config(3), None);

    req.init(Method::Get)?;
    req.set_url("http://mock/bkt/key", "");
    req.run()?;

    assert_eq!(req.response_code(), 200);
    assert_eq!(transport.attempts(), 3);
    Ok(())
}

#[test]
fn retries_never_exceed_max_transfer_retries() {
    let transport = ScriptTransport::new(vec![retryable(), retryable(), retryable(), ok_response(200)]);
    let mut req = HttpRequest::with_transport(transport.clone(), &test_config(3), None);

    req.init(Method::Get).unwrap();
    req.set_url("http://mock/bkt/key", "");
    let err = req.run().expect_err("exhausted retries must fail");

    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Aborted(_))));
    assert_eq!(transport.attempts(), 3);
}

#[test]
fn http_error_statuses_still_return_success() -> objfs::Result<()> {
    for status in [404u16, 403, 500] {
        let transport = ScriptTransport::new(vec![ok_response(status)]);
        let mut req = HttpRequest::with_transport(transport, &test_config(3), None);
        req.init(Method::Head)?;
        req.set_url("http://mock/bkt/key", "");
        req.run()?;
        assert_eq!(req.response_code(), status);
    }
    Ok(())
}

#[test]
fn hook_pre_run_fires_on_every_attempt() -> objfs::Result<()> {
    let transport = ScriptTransport::new(vec![retryable(), ok_response(200)]);
    let hook = CountingHook::new(false);
    let mut req =
        HttpRequest::with_transport(transport, &test_config(3), Some(hook.clone()));

    req.init(Method::Get)?;
    req.set_url("http://mock/bkt/key", "");
    req.run()?;

    assert_eq!(hook.pre_runs.load(Ordering::SeqCst), 2);
    assert_eq!(req.request_header("x-attempt"), Some("1"));
    Ok(())
}

#[test]
fn hook_should_retry_drives_one_more_attempt() -> objfs::Result<()> {
    let transport = ScriptTransport::new(vec![ok_response(500), ok_response(200)]);
    let hook = CountingHook::new(true);
    let mut req =
        HttpRequest::with_transport(transport.clone(), &test_config(3), Some(hook));

    req.init(Method::Put)?;
    req.set_url("http://mock/bkt/key", "");
    req.set_input_buffer(b"body".to_vec())?;
    req.run()?;

    assert_eq!(req.response_code(), 200);
    assert_eq!(transport.attempts(), 2);
    Ok(())
}

#[test]
fn deadline_expiry_poisons_the_executor() {
    let transport = ScriptTransport::new(vec![Err(TransportError::TimedOut)]);
    let mut req = HttpRequest::with_transport(transport, &test_config(3), None);

    req.init(Method::Get).unwrap();
    req.set_url("http://mock/bkt/key", "");
    let err = req.run().expect_err("timeout must fail");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::TimedOut)));
    assert!(req.is_canceled());

    let err = req.init(Method::Get).expect_err("canceled executor must reject init");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Canceled)));
}

#[test]
fn zero_deadline_times_out_before_any_attempt() {
    let transport = ScriptTransport::new(vec![ok_response(200)]);
    let mut req = HttpRequest::with_transport(transport.clone(), &test_config(3), None);

    req.init(Method::Get).unwrap();
    req.set_url("http://mock/bkt/key", "");
    let err = req
        .run_with_timeout(Duration::ZERO)
        .expect_err("expired deadline must fail");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::TimedOut)));
    assert_eq!(transport.attempts(), 0);
    assert!(req.is_canceled());
}

#[test]
fn input_buffer_is_rejected_for_bodyless_methods() {
    let transport = ScriptTransport::new(vec![]);
    let mut req = HttpRequest::with_transport(transport, &test_config(3), None);

    req.init(Method::Get).unwrap();
    let err = req
        .set_input_buffer(b"nope".to_vec())
        .expect_err("GET with body is a programmer error");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidArgument(_))
    ));

    // Empty input stays legal for any method.
    req.set_input_buffer(Vec::new()).unwrap();
}

#[test]
fn request_headers_preserve_insertion_order_and_replace() -> objfs::Result<()> {
    let transport = ScriptTransport::new(vec![]);
    let mut req = HttpRequest::with_transport(transport, &test_config(3), None);

    req.init(Method::Put)?;
    req.set_header("Content-Type", "text/plain");
    req.set_header("x-amz-meta-alpha", "1");
    req.set_header("content-type", "application/json");

    let names: Vec<&str> = req.request_headers().iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["Content-Type", "x-amz-meta-alpha"]);
    assert_eq!(req.request_header("CONTENT-TYPE"), Some("application/json"));
    Ok(())
}

#[test]
fn init_clears_per_transaction_state() -> objfs::Result<()> {
    let store = MockStore::new("bkt");
    store.insert_file("key", b"hello", "text/plain");
    let mut req = HttpRequest::with_transport(store.transport(), &store.config(), None);

    req.init(Method::Get)?;
    req.set_url("http://mock/bkt/key", "");
    req.run()?;
    assert_eq!(req.response_code(), 200);
    assert_eq!(req.output_bytes(), b"hello");
    assert!(req.response_headers().get("ETag").is_some());

    req.init(Method::Head)?;
    assert_eq!(req.response_code(), 0);
    assert!(req.output_bytes().is_empty());
    assert!(req.response_headers().is_empty());
    assert!(req.request_headers().is_empty());
    Ok(())
}

#[test]
fn scripted_store_failure_is_consumed_once() -> objfs::Result<()> {
    let store = MockStore::new("bkt");
    store.insert_file("key", b"hello", "text/plain");
    store.fail_next(Some(Method::Get), FailureKind::Transport);
    let mut req = HttpRequest::with_transport(store.transport(), &store.config(), None);

    req.init(Method::Get)?;
    req.set_url("http://mock/bkt/key", "");
    req.run()?;

    assert_eq!(req.response_code(), 200);
    assert_eq!(store.count("GET key"), 2);
    Ok(())
}
