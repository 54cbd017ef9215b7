//! Readiness reactor fused with the scheduler.
//!
//! Each worker's idle fiber waits in the kernel bounded by the earliest timer
//! deadline. Readiness on a registered fd moves the parked waiter (a fiber or
//! a callback) back into the ready queue; timers drain through the same path.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use static_assertions::assert_impl_all;

use crate::fiber::{Fiber, FiberState};
use crate::scheduler::{self, Scheduler, Task};
use crate::timer::{Timer, TimerQueue};

const WAKER_TOKEN: Token = Token(usize::MAX);
/// Ceiling on a single kernel wait so stop conditions are re-checked.
const MAX_TIMEOUT_MS: u64 = 3000;
const MAX_EVENTS: usize = 256;

/// Readiness interest on a file descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
}

fn interest_of(event: Event) -> Interest {
    match event {
        Event::Read => Interest::READABLE,
        Event::Write => Interest::WRITABLE,
    }
}

struct Handler {
    scheduler: Weak<Scheduler>,
    task: Task,
}

#[derive(Default)]
struct Slots {
    read: Option<Handler>,
    write: Option<Handler>,
}

impl Slots {
    fn slot_mut(&mut self, event: Event) -> &mut Option<Handler> {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Kernel interest mirroring the occupied slots.
    fn interests(&self) -> Option<Interest> {
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

struct FdContext {
    fd: RawFd,
    slots: Mutex<Slots>,
}

/// Scheduler extended with a readiness reactor and a timer manager.
///
/// Workers start in [IoManager::new]; call [IoManager::stop] to cancel
/// outstanding waits, drain queued work and join the pool. Dropping without
/// stopping first leaves the workers parked.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    registry: Registry,
    waker: Arc<Waker>,
    poll: Mutex<(Poll, Events)>,
    park: Mutex<()>,
    unpark: Condvar,
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    pending_events: AtomicUsize,
    timers: Arc<TimerQueue>,
    stopped: AtomicBool,
}

assert_impl_all!(IoManager: Send, Sync);

impl IoManager {
    /// Builds the reactor and starts its workers.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> io::Result<Arc<IoManager>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let scheduler = Scheduler::new(threads, use_caller, name);
        let io = Arc::new(IoManager {
            scheduler: scheduler.clone(),
            registry,
            waker: waker.clone(),
            poll: Mutex::new((poll, Events::with_capacity(MAX_EVENTS))),
            park: Mutex::new(()),
            unpark: Condvar::new(),
            fd_contexts: RwLock::new(Vec::new()),
            pending_events: AtomicUsize::new(0),
            timers: TimerQueue::new(Some(waker)),
            stopped: AtomicBool::new(false),
        });
        io.grow_contexts(32);
        scheduler.set_reactor(Arc::downgrade(&io));
        scheduler.start();
        Ok(io)
    }

    /// Returns the manager whose worker is running the calling thread.
    pub fn current() -> Option<Arc<IoManager>> {
        Scheduler::current().and_then(|scheduler| scheduler.reactor())
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// See [Scheduler::schedule].
    pub fn schedule(&self, task: impl Into<Task>, thread: Option<usize>) {
        self.scheduler.schedule(task, thread)
    }

    /// See [Scheduler::schedule_all].
    pub fn schedule_all<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        self.scheduler.schedule_all(tasks)
    }

    /// Number of registered event waiters.
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// Registers interest in `event` on `fd`.
    ///
    /// With a callback, the callback is scheduled on readiness. Without one,
    /// the calling fiber is the waiter: pair this with [Fiber::yield_hold]
    /// and the fiber resumes when the fd is ready or the event is cancelled.
    ///
    /// Each (fd, event) admits one waiter at a time; re-registering an
    /// occupied slot is a contract violation and panics.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<Box<dyn FnOnce() + Send>>) -> io::Result<()> {
        let fd_ctx = self.context_or_grow(fd);
        let mut slots = fd_ctx.slots.lock().unwrap();
        assert!(slots.slot_mut(event).is_none(), "fd {} already has a {:?} waiter", fd, event);
        let task = match cb {
            Some(f) => Task::Call(f),
            None => {
                let fiber = Fiber::current();
                assert_eq!(fiber.state(), FiberState::Exec, "fd {} waiter fiber not executing", fd);
                assert!(!fiber.is_thread_main(), "fd {} waiter must be a scheduled fiber", fd);
                Task::Fiber(fiber)
            },
        };
        let previous = slots.interests();
        let desired = previous.map_or_else(|| interest_of(event), |i| i.add(interest_of(event)));
        if let Err(err) = self.update_registration(fd, Some(desired), previous) {
            log::error!("fd {} register {:?} failed: {}", fd, event, err);
            return Err(err);
        }
        let scheduler = match Scheduler::current() {
            Some(scheduler) => Arc::downgrade(&scheduler),
            None => Arc::downgrade(&self.scheduler),
        };
        *slots.slot_mut(event) = Some(Handler { scheduler, task });
        self.pending_events.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Withdraws interest in `event` on `fd` without firing the waiter.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(fd_ctx) = self.context(fd) else {
            return false;
        };
        let mut slots = fd_ctx.slots.lock().unwrap();
        let previous = slots.interests();
        let Some(handler) = slots.slot_mut(event).take() else {
            return false;
        };
        if let Err(err) = self.update_registration(fd, slots.interests(), previous) {
            log::error!("fd {} deregister {:?} failed: {}", fd, event, err);
            *slots.slot_mut(event) = Some(handler);
            return false;
        }
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Withdraws interest in `event` on `fd` and fires the waiter as if the
    /// fd were ready. This is how timeouts and closes wake blocked fibers.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(fd_ctx) = self.context(fd) else {
            return false;
        };
        let mut slots = fd_ctx.slots.lock().unwrap();
        let previous = slots.interests();
        let Some(handler) = slots.slot_mut(event).take() else {
            return false;
        };
        if let Err(err) = self.update_registration(fd, slots.interests(), previous) {
            log::error!("fd {} deregister {:?} failed: {}", fd, event, err);
        }
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        drop(slots);
        self.fire(handler);
        true
    }

    /// Fires and withdraws both waiters of `fd`, if any.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(fd_ctx) = self.context(fd) else {
            return false;
        };
        let mut slots = fd_ctx.slots.lock().unwrap();
        if slots.read.is_none() && slots.write.is_none() {
            return false;
        }
        let previous = slots.interests();
        let read = slots.read.take();
        let write = slots.write.take();
        if let Err(err) = self.update_registration(fd, None, previous) {
            log::error!("fd {} deregister failed: {}", fd, err);
        }
        drop(slots);
        for handler in read.into_iter().chain(write) {
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
            self.fire(handler);
        }
        true
    }

    /// Registers a timer; the callback is scheduled onto this manager's
    /// workers when it fires.
    pub fn add_timer(&self, ms: u64, cb: impl Fn() + Send + Sync + 'static, recurring: bool) -> Timer {
        self.timers.add_timer(ms, Arc::new(cb), recurring)
    }

    /// Registers a timer whose callback is skipped if `cond` is gone by fire
    /// time. Lets waiters clean up after their owner without an explicit
    /// cancel.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.timers.add_condition_timer(ms, Arc::new(cb), cond, recurring)
    }

    /// Cancels outstanding event waits and timers, drains queued work and
    /// joins the workers. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_outstanding();
        if self.timers.has_timer() {
            log::debug!("{}: discarding pending timers", self.scheduler.name());
        }
        self.timers.clear();
        self.scheduler.stop();
    }

    fn cancel_outstanding(&self) {
        let contexts: Vec<Arc<FdContext>> = self.fd_contexts.read().unwrap().to_vec();
        for fd_ctx in contexts {
            self.cancel_all(fd_ctx.fd);
        }
    }

    pub(crate) fn tickle(&self) {
        if self.scheduler.idle_workers() == 0 {
            return;
        }
        let _guard = self.park.lock().unwrap();
        self.unpark.notify_all();
        if let Err(err) = self.waker.wake() {
            log::error!("{}: wakeup failed: {}", self.scheduler.name(), err);
        }
    }

    /// Body of each worker's idle fiber.
    pub(crate) fn idle(&self) {
        log::debug!("{}: idle", self.scheduler.name());
        loop {
            let next_timeout = self.timers.next_timeout();
            if next_timeout == u64::MAX
                && self.pending_events.load(Ordering::SeqCst) == 0
                && self.scheduler.check_stopping()
            {
                log::debug!("{}: idle exiting", self.scheduler.name());
                break;
            }
            self.wait(next_timeout);
            Fiber::yield_hold();
        }
    }

    /// One bounded kernel wait. A single worker owns the poll; the rest park
    /// on the condvar with the same bound so timer deadlines are honored
    /// even while the poller is busy.
    fn wait(&self, next_timeout: u64) {
        let timeout = Duration::from_millis(next_timeout.min(MAX_TIMEOUT_MS));
        if let Ok(mut guard) = self.poll.try_lock() {
            let (poll, events) = &mut *guard;
            loop {
                match poll.poll(events, Some(timeout)) {
                    Ok(()) => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        log::error!("{}: poll failed: {}", self.scheduler.name(), err);
                        break;
                    },
                }
            }
            self.dispatch_timers();
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.dispatch_event(event);
            }
        } else {
            let guard = self.park.lock().unwrap();
            // re-check under the park lock: a tickle between the queue scan
            // and this point must not be lost
            if !self.scheduler.has_runnable(scheduler::current_worker()) && !self.scheduler.stopping_flag() {
                let _ = self.unpark.wait_timeout(guard, timeout).unwrap();
            }
            self.dispatch_timers();
        }
    }

    fn dispatch_timers(&self) {
        let expired = self.timers.take_expired();
        if expired.is_empty() {
            return;
        }
        log::debug!("{}: {} timers expired", self.scheduler.name(), expired.len());
        self.scheduler.schedule_all(expired.into_iter().map(|cb| Task::call(move || cb())));
    }

    fn dispatch_event(&self, event: &mio::event::Event) {
        let fd = event.token().0 as RawFd;
        let Some(fd_ctx) = self.context(fd) else {
            return;
        };
        let mut slots = fd_ctx.slots.lock().unwrap();
        let read_ready = event.is_readable() || event.is_error() || event.is_read_closed();
        let write_ready = event.is_writable() || event.is_error() || event.is_write_closed();
        let fire_read = read_ready && slots.read.is_some();
        let fire_write = write_ready && slots.write.is_some();
        if !fire_read && !fire_write {
            // fired or cancelled concurrently
            return;
        }
        let previous = slots.interests();
        let read = match fire_read {
            true => slots.read.take(),
            false => None,
        };
        let write = match fire_write {
            true => slots.write.take(),
            false => None,
        };
        if let Err(err) = self.update_registration(fd, slots.interests(), previous) {
            log::error!("fd {} re-register failed: {}", fd, err);
        }
        drop(slots);
        for handler in read.into_iter().chain(write) {
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
            self.fire(handler);
        }
    }

    fn fire(&self, handler: Handler) {
        match handler.scheduler.upgrade() {
            Some(scheduler) => scheduler.schedule(handler.task, None),
            None => log::debug!("dropping waiter of a stopped scheduler"),
        }
    }

    fn update_registration(&self, fd: RawFd, desired: Option<Interest>, previous: Option<Interest>) -> io::Result<()> {
        let mut source = SourceFd(&fd);
        match (previous.is_some(), desired) {
            (false, Some(interests)) => self.registry.register(&mut source, Token(fd as usize), interests),
            (true, Some(interests)) => self.registry.reregister(&mut source, Token(fd as usize), interests),
            (true, None) => self.registry.deregister(&mut source),
            (false, None) => Ok(()),
        }
    }

    fn context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let contexts = self.fd_contexts.read().unwrap();
        contexts.get(fd as usize).cloned()
    }

    fn context_or_grow(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "invalid fd {}", fd);
        loop {
            if let Some(fd_ctx) = self.context(fd) {
                return fd_ctx;
            }
            let wanted = {
                let contexts = self.fd_contexts.read().unwrap();
                (fd as usize + 1).max(contexts.len() + contexts.len() / 2)
            };
            self.grow_contexts(wanted);
        }
    }

    fn grow_contexts(&self, size: usize) {
        let mut contexts = self.fd_contexts.write().unwrap();
        while contexts.len() < size {
            let fd = contexts.len() as RawFd;
            contexts.push(Arc::new(FdContext { fd, slots: Mutex::new(Slots::default()) }));
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Suspends the calling fiber for at least `timeout`.
///
/// Must run inside a fiber scheduled on an [IoManager]; a zero timeout
/// degenerates to [Fiber::yield_ready].
pub fn sleep(timeout: Duration) {
    let ms = timeout.as_millis() as u64;
    if ms == 0 {
        Fiber::yield_ready();
        return;
    }
    let io = IoManager::current().expect("no io manager serving this thread");
    let fiber = Fiber::current();
    assert!(!fiber.is_thread_main(), "sleep outside a scheduled fiber");
    let scheduler = Arc::downgrade(io.scheduler());
    io.add_timer(
        ms,
        move || {
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.schedule(fiber.clone(), None);
            }
        },
        false,
    );
    Fiber::yield_hold();
}
