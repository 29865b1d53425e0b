//! Content-addressed result cache with single-flight execution.
//!
//! Every operation result is keyed by a [`Fingerprint`], a SHA-256 over the
//! source checksum, the operation kind and the canonical parameter string.
//! Two jobs that ask for the same thing on the same bytes share one
//! computation and one stored result.
//!
//! # Design
//!
//! ## Single flight
//!
//! The first caller for a fingerprint registers a [`Flight`] and computes
//! outside any lock. Callers arriving while it runs find the flight and
//! block on its condvar; when the leader finishes, all of them receive the
//! same `Arc` (or the same error). Failures are handed to the waiters but
//! never stored, so the next caller recomputes.
//!
//! A panic inside the computation is caught and turned into
//! [`ProcessingError::Internal`]. Waiters are always released.
//!
//! ## Storage and eviction
//!
//! Resolved entries live behind an `RwLock`. A hit takes only the shared
//! read lock; last-access ticks and reference counts are atomics. Inserts
//! take the write lock and evict least-recently-used entries until the total
//! weight fits `capacity_bytes`. Computations still in flight are not in the
//! resolved map at all, so they can't be evicted. A single result heavier
//! than the whole capacity is returned but not stored.
//!
//! Lock order is `flights` then `resolved`.

use crate::error::ProcessingError;
use crate::types::OperationKind;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, trace};

/// SHA-256 hash of a byte buffer, returned as a hex string.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Cache key for one (source, operation, parameters) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn derive(source_checksum: &str, kind: OperationKind, canonical_params: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_checksum.as_bytes());
        hasher.update(b"\0");
        hasher.update(kind.discriminant().as_bytes());
        hasher.update(b"\0");
        hasher.update(canonical_params.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Byte weight a value contributes toward the cache capacity.
pub trait Weighted {
    fn weight(&self) -> usize;
}

pub type Outcome<V> = Result<Arc<V>, ProcessingError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A computation in progress. Waiters park on `done` until `outcome` is set.
struct Flight<V> {
    outcome: Mutex<Option<Outcome<V>>>,
    done: Condvar,
}

impl<V> Flight<V> {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn resolve(&self, outcome: Outcome<V>) {
        *lock(&self.outcome) = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> Outcome<V> {
        let mut guard = lock(&self.outcome);
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            guard = self
                .done
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// A resolved cache entry.
struct CacheEntry<V> {
    value: Arc<V>,
    size: usize,
    last_access: AtomicU64,
    /// Times this entry has been handed out.
    references: AtomicU64,
}

enum Role<V> {
    Leader(Arc<Flight<V>>),
    Waiter(Arc<Flight<V>>),
}

pub struct ResultCache<V> {
    resolved: RwLock<HashMap<Fingerprint, CacheEntry<V>>>,
    flights: Mutex<HashMap<Fingerprint, Arc<Flight<V>>>>,
    capacity_bytes: usize,
    total_bytes: AtomicUsize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Weighted> ResultCache<V> {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            resolved: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            capacity_bytes,
            total_bytes: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Return the cached result for `fp`, or run `compute` exactly once
    /// across all concurrent callers and share its outcome.
    pub fn get_or_compute<F>(&self, fp: &Fingerprint, compute: F) -> Outcome<V>
    where
        F: FnOnce() -> Result<V, ProcessingError>,
    {
        if let Some(value) = self.lookup(fp) {
            return Ok(value);
        }

        let role = {
            let mut flights = lock(&self.flights);
            // Resolved between our first look and taking the lock.
            if let Some(value) = self.lookup(fp) {
                return Ok(value);
            }
            match flights.get(fp) {
                Some(flight) => Role::Waiter(Arc::clone(flight)),
                None => {
                    let flight = Arc::new(Flight::new());
                    flights.insert(fp.clone(), Arc::clone(&flight));
                    Role::Leader(flight)
                }
            }
        };

        match role {
            Role::Waiter(flight) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                trace!(fingerprint = %fp, "joining in-flight computation");
                flight.wait()
            }
            Role::Leader(flight) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let outcome = match panic::catch_unwind(AssertUnwindSafe(compute)) {
                    Ok(Ok(value)) => Ok(Arc::new(value)),
                    Ok(Err(err)) => Err(err),
                    Err(payload) => Err(ProcessingError::Internal(panic_message(&*payload))),
                };
                {
                    let mut flights = lock(&self.flights);
                    if let Ok(value) = &outcome {
                        self.insert(fp, Arc::clone(value));
                    }
                    flights.remove(fp);
                }
                flight.resolve(outcome.clone());
                outcome
            }
        }
    }

    fn lookup(&self, fp: &Fingerprint) -> Option<Arc<V>> {
        let resolved = self.resolved.read().unwrap_or_else(PoisonError::into_inner);
        let entry = resolved.get(fp)?;
        entry
            .last_access
            .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        entry.references.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(&entry.value))
    }

    fn insert(&self, fp: &Fingerprint, value: Arc<V>) {
        let size = value.weight();
        if size > self.capacity_bytes {
            debug!(fingerprint = %fp, size, "result larger than cache capacity, not stored");
            return;
        }
        let mut resolved = self.resolved.write().unwrap_or_else(PoisonError::into_inner);
        let mut total = self.total_bytes.load(Ordering::Relaxed);
        while total + size > self.capacity_bytes {
            let Some(victim) = resolved
                .iter()
                .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(evicted) = resolved.remove(&victim) {
                total -= evicted.size;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %victim, size = evicted.size, "evicted");
            }
        }
        let entry = CacheEntry {
            value,
            size,
            last_access: AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed)),
            references: AtomicU64::new(1),
        };
        if let Some(previous) = resolved.insert(fp.clone(), entry) {
            total -= previous.size;
        }
        self.total_bytes.store(total + size, Ordering::Relaxed);
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(fp)
    }

    /// How many times the entry for `fp` has been handed out, if resolved.
    pub fn references(&self, fp: &Fingerprint) -> Option<u64> {
        self.resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fp)
            .map(|e| e.references.load(Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("operation panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("operation panicked: {s}")
    } else {
        "operation panicked".to_string()
    }
}

/// Summary of cache activity since the engine started.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn total(&self) -> u64 {
        self.hits + self.misses + self.coalesced
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hits > 0 || self.coalesced > 0 {
            write!(
                f,
                "{} cached, {} shared, {} computed ({} total)",
                self.hits,
                self.coalesced,
                self.misses,
                self.total()
            )?;
        } else {
            write!(f, "{} computed", self.misses)?;
        }
        if self.evictions > 0 {
            write!(f, ", {} evicted", self.evictions)?;
        }
        Ok(())
    }
}
