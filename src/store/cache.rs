//! Object metadata cache: memoizes HEAD results with a TTL, coalesces
//! concurrent fetches of the same cold path into a single flight, and drops
//! entries when mutations make them stale.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::http::request::HttpRequest;
use crate::store::object::{Hint, Object};
use crate::store::StoreContext;
use crate::{errno_of, Error, Result};

/// A fetch in progress. Waiters block on `done`; the fetcher publishes the
/// outcome exactly once and wakes everyone.
struct Flight {
    outcome: Mutex<Option<std::result::Result<Arc<Object>, i32>>>,
    done: Condvar,
}

impl Flight {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    fn wait(&self, path: &str) -> Result<Arc<Object>> {
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            self.done.wait(&mut outcome);
        }
        match outcome.as_ref() {
            Some(Ok(object)) => Ok(object.clone()),
            Some(Err(errno)) => Err(Error::from_errno(*errno, path).into()),
            None => Err(Error::from_errno(libc::EIO, path).into()),
        }
    }

    fn resolve(&self, result: std::result::Result<Arc<Object>, i32>) {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(result);
            self.done.notify_all();
        }
    }
}

enum Slot {
    Ready {
        object: Arc<Object>,
        fetched_at: Instant,
    },
    Pending(Arc<Flight>),
}

enum Plan {
    Hit(Arc<Object>),
    Wait(Arc<Flight>),
    Fetch(Arc<Flight>),
}

pub struct ObjectCache {
    entries: Mutex<HashMap<String, Slot>>,
    ttl: Duration,
}

impl ObjectCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Return a fresh-enough descriptor, issuing a HEAD through `req` if the
    /// entry is absent or expired. Concurrent calls for the same cold path
    /// share one flight.
    pub fn get(
        &self,
        req: &mut HttpRequest,
        ctx: &StoreContext,
        path: &str,
        hint: Hint,
    ) -> Result<Arc<Object>> {
        let plan = {
            let mut entries = self.entries.lock();
            match entries.get(path) {
                Some(Slot::Ready { object, fetched_at }) if fetched_at.elapsed() < self.ttl => {
                    Plan::Hit(object.clone())
                }
                Some(Slot::Pending(flight)) => Plan::Wait(flight.clone()),
                _ => {
                    let flight = Flight::new();
                    entries.insert(path.to_string(), Slot::Pending(flight.clone()));
                    Plan::Fetch(flight)
                }
            }
        };

        match plan {
            Plan::Hit(object) => Ok(object),
            Plan::Wait(flight) => flight.wait(path),
            Plan::Fetch(flight) => {
                let outcome = Object::fetch(req, ctx, path, hint);
                let shared = match &outcome {
                    Ok(object) => Ok(Arc::new(object.clone())),
                    Err(err) => Err(errno_of(err)),
                };

                {
                    let mut entries = self.entries.lock();
                    // Only touch the slot if it is still our flight; a
                    // concurrent invalidate or insert takes precedence.
                    let ours = matches!(
                        entries.get(path),
                        Some(Slot::Pending(current)) if Arc::ptr_eq(current, &flight)
                    );
                    if ours {
                        match &shared {
                            Ok(object) => {
                                entries.insert(
                                    path.to_string(),
                                    Slot::Ready {
                                        object: object.clone(),
                                        fetched_at: Instant::now(),
                                    },
                                );
                            }
                            Err(_) => {
                                entries.remove(path);
                            }
                        }
                    }
                }

                flight.resolve(shared);
                outcome.map(Arc::new)
            }
        }
    }

    /// Best-effort warm-up; errors are dropped.
    pub fn prefill(&self, req: &mut HttpRequest, ctx: &StoreContext, path: &str, hint: Hint) {
        if let Err(err) = self.get(req, ctx, path, hint) {
            debug!(path, error = %err, "prefill miss");
        }
    }

    /// Publish a descriptor directly, e.g. after a PUT returned the fresh
    /// etag; skips the HEAD round-trip.
    pub fn insert(&self, object: Object) {
        let mut entries = self.entries.lock();
        entries.insert(
            object.path().to_string(),
            Slot::Ready {
                object: Arc::new(object),
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drop an entry. Mutations call this before reporting success so the
    /// next lookup cannot observe pre-mutation state.
    pub fn invalidate(&self, path: &str) {
        self.entries.lock().remove(path);
    }

    /// Whether a fresh descriptor is cached (pending flights don't count).
    pub fn contains_fresh(&self, path: &str) -> bool {
        matches!(
            self.entries.lock().get(path),
            Some(Slot::Ready { fetched_at, .. }) if fetched_at.elapsed() < self.ttl
        )
    }
}
