//! Timer manager: an ordered multiset of one-shot and recurring timers with
//! millisecond resolution.
//!
//! The reactor's idle loop bounds its kernel waits by [TimerQueue::next_timeout]
//! and drains due callbacks with [TimerQueue::take_expired]. Entries are keyed
//! by `(deadline, serial)` so timers sharing a deadline fire in insertion
//! order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use static_assertions::assert_impl_all;

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// A wall-clock jump backwards beyond this treats every timer as due.
const ROLLBACK_THRESHOLD_MS: u64 = 60 * 60 * 1000;

static TIMER_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Wall clock in milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
}

struct TimerEntry {
    serial: u64,
    recurring: bool,
    interval: AtomicU64,
    deadline: AtomicU64,
    callback: Mutex<Option<TimerCallback>>,
}

impl TimerEntry {
    fn key(&self) -> (u64, u64) {
        (self.deadline.load(Ordering::Relaxed), self.serial)
    }
}

/// Handle to a registered timer, shared with the owning queue.
pub struct Timer {
    entry: Arc<TimerEntry>,
    queue: Weak<TimerQueue>,
}

assert_impl_all!(Timer: Send, Sync);

struct Inner {
    timers: BTreeMap<(u64, u64), Arc<TimerEntry>>,
    previous_now: u64,
    tickled: bool,
}

pub(crate) struct TimerQueue {
    waker: Option<Arc<mio::Waker>>,
    inner: Mutex<Inner>,
}

impl TimerQueue {
    pub fn new(waker: Option<Arc<mio::Waker>>) -> Arc<TimerQueue> {
        Self::new_at(now_ms(), waker)
    }

    fn new_at(now: u64, waker: Option<Arc<mio::Waker>>) -> Arc<TimerQueue> {
        Arc::new(TimerQueue {
            waker,
            inner: Mutex::new(Inner { timers: BTreeMap::new(), previous_now: now, tickled: false }),
        })
    }

    /// Registers `cb` to fire `ms` from now, recurring with that period if
    /// asked to.
    pub fn add_timer(self: &Arc<Self>, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        self.add_timer_at(now_ms().saturating_add(ms), ms, cb, recurring)
    }

    /// Registers `cb` behind `cond`: at fire time the callback is skipped if
    /// the condition is no longer resolvable.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        ms: u64,
        cb: TimerCallback,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer {
        let cb: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb()
            }
        });
        self.add_timer(ms, cb, recurring)
    }

    fn add_timer_at(self: &Arc<Self>, deadline: u64, interval: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let entry = Arc::new(TimerEntry {
            serial: TIMER_SERIAL.fetch_add(1, Ordering::Relaxed),
            recurring,
            interval: AtomicU64::new(interval),
            deadline: AtomicU64::new(deadline),
            callback: Mutex::new(Some(cb)),
        });
        let timer = Timer { entry: entry.clone(), queue: Arc::downgrade(self) };
        let mut inner = self.inner.lock().unwrap();
        let at_front = Self::insert(&mut inner, entry);
        drop(inner);
        if at_front {
            self.wake();
        }
        timer
    }

    /// Returns whether the entry landed at the front with no wakeup pending
    /// yet, arming the debounce if so.
    fn insert(inner: &mut Inner, entry: Arc<TimerEntry>) -> bool {
        let key = entry.key();
        inner.timers.insert(key, entry);
        let at_front = inner.timers.keys().next() == Some(&key) && !inner.tickled;
        if at_front {
            inner.tickled = true;
        }
        at_front
    }

    fn wake(&self) {
        if let Some(waker) = &self.waker {
            if let Err(err) = waker.wake() {
                log::error!("timer wakeup failed: {}", err);
            }
        }
    }

    /// Milliseconds until the earliest deadline: 0 if one is already due,
    /// `u64::MAX` if the queue is empty. Clears the front-insert debounce.
    pub fn next_timeout(&self) -> u64 {
        self.next_timeout_at(now_ms())
    }

    fn next_timeout_at(&self, now: u64) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.tickled = false;
        match inner.timers.keys().next() {
            None => u64::MAX,
            Some((deadline, _)) => deadline.saturating_sub(now),
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.inner.lock().unwrap().timers.is_empty()
    }

    /// Drains the callbacks of every due timer, re-arming recurring ones.
    pub fn take_expired(&self) -> Vec<TimerCallback> {
        self.take_expired_at(now_ms())
    }

    fn take_expired_at(&self, now: u64) -> Vec<TimerCallback> {
        let mut inner = self.inner.lock().unwrap();
        if inner.timers.is_empty() {
            return Vec::new();
        }
        let rollover = Self::detect_rollover(&mut inner, now);
        if rollover {
            log::error!("clock jumped backwards, expiring all {} timers", inner.timers.len());
        } else if inner.timers.keys().next().is_some_and(|(deadline, _)| *deadline > now) {
            return Vec::new();
        }
        let expired: Vec<(u64, u64)> = match rollover {
            true => inner.timers.keys().copied().collect(),
            false => inner.timers.range(..=(now, u64::MAX)).map(|(key, _)| *key).collect(),
        };
        let mut callbacks = Vec::with_capacity(expired.len());
        let mut recurring = Vec::new();
        for key in expired {
            let entry = inner.timers.remove(&key).expect("expired timer vanished");
            if entry.recurring {
                if let Some(cb) = entry.callback.lock().unwrap().clone() {
                    callbacks.push(cb);
                }
                let interval = entry.interval.load(Ordering::Relaxed);
                entry.deadline.store(now.saturating_add(interval), Ordering::Relaxed);
                recurring.push(entry);
            } else if let Some(cb) = entry.callback.lock().unwrap().take() {
                callbacks.push(cb);
            }
        }
        for entry in recurring {
            inner.timers.insert(entry.key(), entry);
        }
        callbacks
    }

    fn detect_rollover(inner: &mut Inner, now: u64) -> bool {
        let rollover = now < inner.previous_now && now < inner.previous_now.saturating_sub(ROLLBACK_THRESHOLD_MS);
        inner.previous_now = now;
        rollover
    }

    /// Cancels every pending timer.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let timers = std::mem::take(&mut inner.timers);
        for entry in timers.into_values() {
            entry.callback.lock().unwrap().take();
        }
    }
}

impl Timer {
    /// Removes the timer if still pending so its callback never runs.
    ///
    /// Returns false when the timer already fired, was drained for dispatch,
    /// or was cancelled before.
    pub fn cancel(&self) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let mut inner = queue.inner.lock().unwrap();
        let mut callback = self.entry.callback.lock().unwrap();
        if callback.is_none() {
            return false;
        }
        *callback = None;
        drop(callback);
        inner.timers.remove(&self.entry.key()).is_some()
    }

    /// Re-arms the timer at now + interval.
    pub fn refresh(&self) -> bool {
        self.refresh_at(now_ms())
    }

    fn refresh_at(&self, now: u64) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let mut inner = queue.inner.lock().unwrap();
        if self.entry.callback.lock().unwrap().is_none() {
            return false;
        }
        if inner.timers.remove(&self.entry.key()).is_none() {
            return false;
        }
        let interval = self.entry.interval.load(Ordering::Relaxed);
        self.entry.deadline.store(now.saturating_add(interval), Ordering::Relaxed);
        inner.timers.insert(self.entry.key(), self.entry.clone());
        true
    }

    /// Changes the period. `from_now` anchors the new deadline at the current
    /// time, otherwise at the previous start.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        self.reset_at(ms, from_now, now_ms())
    }

    fn reset_at(&self, ms: u64, from_now: bool, now: u64) -> bool {
        if ms == self.entry.interval.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let mut inner = queue.inner.lock().unwrap();
        if self.entry.callback.lock().unwrap().is_none() {
            return false;
        }
        let old_deadline = self.entry.deadline.load(Ordering::Relaxed);
        if inner.timers.remove(&self.entry.key()).is_none() {
            return false;
        }
        let old_interval = self.entry.interval.load(Ordering::Relaxed);
        let start = match from_now {
            true => now,
            false => old_deadline.saturating_sub(old_interval),
        };
        self.entry.interval.store(ms, Ordering::Relaxed);
        self.entry.deadline.store(start.saturating_add(ms), Ordering::Relaxed);
        let at_front = TimerQueue::insert(&mut inner, self.entry.clone());
        drop(inner);
        if at_front {
            queue.wake();
        }
        true
    }
}
