//! Request coalescing for idempotent lookups.
//!
//! Identical concurrent requests share one in-flight computation: the first
//! arrival becomes the producer, later arrivals subscribe to its broadcast
//! and receive the same value. The mapping is keyed by a SHA-256
//! fingerprint of the request's identifying fields and is cleaned up as
//! soon as the result is published -- arrivals after publication start a
//! fresh computation. No TTL; result caching belongs to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

/// Fingerprint a request: SHA-256 hex over method ∥ url ∥ body.
/// An absent body contributes nothing to the digest.
pub fn fingerprint(method: &str, url: &str, body: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(url.as_bytes());
    if let Some(body) = body {
        hasher.update(body);
    }
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Deduplicates identical concurrent in-flight computations.
pub struct CoalescingCache<T> {
    inflight: Mutex<HashMap<String, broadcast::Sender<T>>>,
}

impl<T> Default for CoalescingCache<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CoalescingCache<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `produce` exactly once per active fingerprint and hand its value
    /// to every concurrent caller with the same key.
    ///
    /// The key is removed from the map before the value is broadcast, so a
    /// subscriber either observed the in-flight entry (and will receive the
    /// send) or finds no entry and becomes a fresh producer.
    pub async fn coalesce<F, Fut>(&self, key: &str, produce: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            let existing = {
                let mut inflight = self.inflight.lock().expect("coalesce lock poisoned");
                match inflight.get(key) {
                    Some(tx) => Some(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        inflight.insert(key.to_string(), tx);
                        None
                    }
                }
            };

            match existing {
                Some(mut rx) => match rx.recv().await {
                    Ok(value) => return value,
                    // The producer was dropped without publishing (its
                    // caller went away). Loop and take over production.
                    Err(_) => continue,
                },
                None => {
                    // If this future is dropped mid-computation the guard
                    // removes the entry, waking waiters to take over.
                    let mut guard = CleanupGuard {
                        inflight: &self.inflight,
                        key,
                        armed: true,
                    };
                    let value = produce().await;
                    let tx = {
                        let mut inflight =
                            self.inflight.lock().expect("coalesce lock poisoned");
                        inflight.remove(key)
                    };
                    guard.armed = false;
                    if let Some(tx) = tx {
                        let _ = tx.send(value.clone());
                    }
                    return value;
                }
            }
        }
    }

    /// Number of in-flight computations (tests and introspection).
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().expect("coalesce lock poisoned").len()
    }
}

struct CleanupGuard<'a, T> {
    inflight: &'a Mutex<HashMap<String, broadcast::Sender<T>>>,
    key: &'a str,
    armed: bool,
}

impl<T> Drop for CleanupGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut inflight) = self.inflight.lock() {
                inflight.remove(self.key);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
