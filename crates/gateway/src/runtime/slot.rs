//! Bounded run-concurrency admission control.
//!
//! `SlotAllocator` is the part of the scheduler that decides *whether* a run
//! may start right now, independent of *which* thread it belongs to — that
//! routing concern lives in [`crate::runtime::scheduler::Scheduler`]. Kept
//! as its own type so `ThreadWorker` tasks can hold a slot handle without
//! needing a back-reference to the whole scheduler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use aw_domain::trace::TraceEvent;

struct SlotWaiter {
    id: u64,
    tx: oneshot::Sender<()>,
    queued_at: Instant,
}

struct Inner {
    in_flight: u32,
    waitq: VecDeque<SlotWaiter>,
    completed_today: u64,
    today: NaiveDate,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct AdmissionCounts {
    pub active: u32,
    pub queued: u32,
    pub completed_today: u64,
}

pub struct SlotAllocator {
    max: u32,
    stale_threshold: Duration,
    state: Mutex<Inner>,
    next_waiter_id: AtomicU64,
}

impl SlotAllocator {
    pub fn new(max: u32, stale_threshold_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            max,
            stale_threshold: Duration::from_millis(stale_threshold_ms),
            state: Mutex::new(Inner {
                in_flight: 0,
                waitq: VecDeque::new(),
                completed_today: 0,
                today: Utc::now().date_naive(),
            }),
            next_waiter_id: AtomicU64::new(0),
        })
    }

    /// Grant a slot for `thread_key`, blocking in FIFO order if the
    /// concurrency cap is already reached. Abandoned waiters (no one ever
    /// polls the future again past `stale_threshold`) are garbage-collected
    /// the next time the queue is touched.
    pub async fn request_slot(self: &Arc<Self>, thread_key: &str) -> SlotHandle {
        let rx = {
            let mut state = self.state.lock();
            self.gc_stale_locked(&mut state);

            if state.in_flight < self.max {
                state.in_flight += 1;
                TraceEvent::SlotGranted { thread_key: thread_key.to_owned(), in_flight: state.in_flight }.emit();
                return SlotHandle { allocator: self.clone(), thread_key: thread_key.to_owned() };
            }

            let id = self.next_waiter_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            state.waitq.push_back(SlotWaiter { id, tx, queued_at: Instant::now() });
            rx
        };

        // The sender side is only ever dropped after a successful send from
        // `release`, so a recv error here is unreachable in practice; treat
        // it as "granted" defensively rather than panicking.
        let _ = rx.await;
        let in_flight = {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.max(1);
            state.in_flight
        };
        TraceEvent::SlotGranted { thread_key: thread_key.to_owned(), in_flight }.emit();
        SlotHandle { allocator: self.clone(), thread_key: thread_key.to_owned() }
    }

    fn gc_stale_locked(&self, state: &mut Inner) {
        let stale = self.stale_threshold;
        state.waitq.retain(|w| w.queued_at.elapsed() < stale || w.tx.is_closed());
    }

    fn release(&self, thread_key: &str) {
        let mut state = self.state.lock();
        self.gc_stale_locked(&mut state);

        if let Some(next) = state.waitq.pop_front() {
            // Ownership transfers directly to the waiter without touching
            // `in_flight` — the waiter's own wakeup path bumps it.
            let _ = next.tx.send(());
        } else {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        TraceEvent::SlotReleased { thread_key: thread_key.to_owned(), in_flight: state.in_flight }.emit();
    }

    pub fn record_completion(&self) {
        let mut state = self.state.lock();
        self.roll_day_locked(&mut state);
        state.completed_today += 1;
    }

    fn roll_day_locked(&self, state: &mut Inner) {
        let today = Utc::now().date_naive();
        if today != state.today {
            state.today = today;
            state.completed_today = 0;
        }
    }

    pub fn counts(&self) -> AdmissionCounts {
        let mut state = self.state.lock();
        self.roll_day_locked(&mut state);
        AdmissionCounts {
            active: state.in_flight,
            queued: state.waitq.len() as u32,
            completed_today: state.completed_today,
        }
    }
}

/// Held by whoever is occupying a concurrency slot. Releasing happens via
/// `Drop` (or an explicit `drop(handle)`), so a panicking run can never
/// leak a slot.
pub struct SlotHandle {
    allocator: Arc<SlotAllocator>,
    thread_key: String,
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        self.allocator.release(&self.thread_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_slot_serializes_requests() {
        let alloc = SlotAllocator::new(1, 30_000);
        let h1 = alloc.request_slot("t1").await;
        assert_eq!(alloc.counts().active, 1);

        let alloc2 = alloc.clone();
        let waiter = tokio::spawn(async move { alloc2.request_slot("t1").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(alloc.counts().queued, 1);

        drop(h1);
        let _h2 = waiter.await.unwrap();
        assert_eq!(alloc.counts().active, 1);
    }

    #[tokio::test]
    async fn distinct_threads_run_concurrently_under_capacity() {
        let alloc = SlotAllocator::new(2, 30_000);
        let _h1 = alloc.request_slot("t1").await;
        let _h2 = alloc.request_slot("t2").await;
        assert_eq!(alloc.counts().active, 2);
    }

    #[test]
    fn completed_today_increments() {
        let alloc = SlotAllocator::new(2, 30_000);
        alloc.record_completion();
        alloc.record_completion();
        assert_eq!(alloc.counts().completed_today, 2);
    }
}
