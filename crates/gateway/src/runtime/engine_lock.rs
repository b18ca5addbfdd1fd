//! Per-key FIFO mutex guarding one engine session at a time.
//!
//! A `Run` acquires the lock for its session's engine key before calling
//! `Engine::start`, so two runs can never drive the same underlying engine
//! session concurrently. Waiters are granted in FIFO order. A lock whose
//! holder never released it (crash, forgotten guard) is reclaimed once it's
//! older than `max_lock_age_ms`. Disabling the lock in config makes
//! `acquire` grant immediately and `release` a no-op — useful for engines
//! that are safe to drive concurrently.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use aw_domain::error::{Error, Result};
use aw_domain::trace::TraceEvent;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct KeyState {
    held: bool,
    generation: u64,
    acquired_at: Option<Instant>,
    waiters: VecDeque<Waiter>,
}

pub struct EngineLock {
    enabled: bool,
    max_lock_age: Duration,
    state: Mutex<HashMap<String, KeyState>>,
    next_waiter_id: AtomicU64,
}

impl EngineLock {
    pub fn new(enabled: bool, max_lock_age_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            enabled,
            max_lock_age: Duration::from_millis(max_lock_age_ms),
            state: Mutex::new(HashMap::new()),
            next_waiter_id: AtomicU64::new(0),
        })
    }

    /// Acquire the lock for `key`, waiting up to `timeout` in FIFO order.
    /// Returns [`Error::LockTimeout`] if the deadline passes first.
    pub async fn acquire(self: &Arc<Self>, key: &str, timeout: Duration) -> Result<LockGuard> {
        if !self.enabled {
            return Ok(LockGuard {
                lock: None,
                key: key.to_owned(),
                generation: 0,
                released: AtomicBool::new(false),
            });
        }

        let wait_start = Instant::now();
        let rx = {
            let mut state = self.state.lock();
            let entry = state.entry(key.to_owned()).or_default();

            if !entry.held {
                return self.grant_locked(entry, key, Instant::now());
            }

            if let Some(acquired_at) = entry.acquired_at {
                if acquired_at.elapsed() >= self.max_lock_age {
                    let held_ms = acquired_at.elapsed().as_millis() as u64;
                    TraceEvent::LockStaleReaped { key: key.to_owned(), held_ms }.emit();

                    if entry.waiters.is_empty() {
                        return self.grant_locked(entry, key, Instant::now());
                    }

                    // Others are already queued ahead of this caller: the
                    // reclaimed slot goes to the FIFO head, not to whoever
                    // merely happened to notice the holder was stale. Wake
                    // the head and fall through to enqueue this caller like
                    // any other waiter.
                    entry.generation += 1;
                    entry.acquired_at = Some(Instant::now());
                    if let Some(next) = entry.waiters.pop_front() {
                        let _ = next.tx.send(());
                    }
                }
            }

            let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            entry.waiters.push_back(Waiter { id: waiter_id, tx });
            (waiter_id, rx)
        };

        let (waiter_id, rx) = rx;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                let waited_ms = wait_start.elapsed().as_millis() as u64;
                TraceEvent::LockAcquired { key: key.to_owned(), waited_ms }.emit();
                let generation = self.state.lock().get(key).map(|e| e.generation).unwrap_or(0);
                Ok(LockGuard {
                    lock: Some(self.clone()),
                    key: key.to_owned(),
                    generation,
                    released: AtomicBool::new(false),
                })
            }
            _ => {
                let mut state = self.state.lock();
                if let Some(entry) = state.get_mut(key) {
                    entry.waiters.retain(|w| w.id != waiter_id);
                }
                let waited_ms = wait_start.elapsed().as_millis() as u64;
                TraceEvent::LockTimedOut { key: key.to_owned(), waited_ms }.emit();
                Err(Error::LockTimeout { key: key.to_owned() })
            }
        }
    }

    fn grant_locked(self: &Arc<Self>, entry: &mut KeyState, key: &str, acquired_at: Instant) -> Result<LockGuard> {
        entry.held = true;
        entry.generation += 1;
        entry.acquired_at = Some(acquired_at);
        let generation = entry.generation;
        TraceEvent::LockAcquired { key: key.to_owned(), waited_ms: 0 }.emit();
        Ok(LockGuard {
            lock: Some(self.clone()),
            key: key.to_owned(),
            generation,
            released: AtomicBool::new(false),
        })
    }

    /// Release `key` if `generation` still matches the current holder.
    /// A stale generation (already released, already reaped, or a
    /// non-owner calling release) is silently ignored.
    fn release(&self, key: &str, generation: u64) {
        let mut state = self.state.lock();
        let Some(entry) = state.get_mut(key) else { return };
        if !entry.held || entry.generation != generation {
            return;
        }

        if let Some(next) = entry.waiters.pop_front() {
            entry.generation += 1;
            entry.acquired_at = Some(Instant::now());
            let _ = next.tx.send(());
        } else {
            entry.held = false;
            entry.acquired_at = None;
        }
    }
}

/// RAII handle returned by [`EngineLock::acquire`]. Releases on drop if
/// [`LockGuard::release`] wasn't already called explicitly.
pub struct LockGuard {
    lock: Option<Arc<EngineLock>>,
    key: String,
    generation: u64,
    released: AtomicBool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release explicitly. Idempotent: a second call (or the eventual
    /// `Drop`) is a no-op.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(lock) = &self.lock {
            lock.release(&self.key, self.generation);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}
