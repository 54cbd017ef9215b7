//! M:N fiber scheduler: a fixed pool of worker threads dispatching an
//! unordered ready queue of fibers and callbacks.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;

use ignore_result::Ignore;
use static_assertions::assert_impl_all;

use crate::fiber::{self, Fiber, FiberState, StackSize};
use crate::io::IoManager;

thread_local! {
    static SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };
    static WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

struct Scope;

impl Scope {
    fn enter(scheduler: &Arc<Scheduler>, worker: usize) -> Scope {
        SCHEDULER.with(|cell| {
            let mut slot = cell.borrow_mut();
            assert!(slot.is_none(), "scheduler already bound to this thread");
            *slot = Some(Arc::downgrade(scheduler));
        });
        WORKER.with(|cell| cell.set(Some(worker)));
        Scope
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        SCHEDULER.with(|cell| {
            cell.borrow_mut().take().expect("scheduler not bound to this thread");
        });
        WORKER.with(|cell| cell.set(None));
    }
}

/// Returns the worker index the calling thread dispatches for, if any.
pub fn current_worker() -> Option<usize> {
    WORKER.with(|cell| cell.get())
}

/// Unit of scheduling: a fiber to resume, or a callback to run on a lazily
/// reused per-worker fiber.
pub enum Task {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

impl Task {
    /// Wraps a callback as a schedulable task.
    pub fn call(f: impl FnOnce() + Send + 'static) -> Task {
        Task::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Task {
        Task::Fiber(fiber)
    }
}

struct Entry {
    task: Task,
    thread: Option<usize>,
}

/// Multiplexes fibers over a fixed pool of worker threads.
///
/// With `use_caller`, the constructing thread joins the pool: one thread slot
/// is consumed and the caller's share of dispatching runs inside
/// [Scheduler::stop] on a dedicated root fiber.
pub struct Scheduler {
    name: String,
    thread_count: usize,
    use_caller: bool,
    caller_thread: Option<thread::ThreadId>,
    queue: Mutex<VecDeque<Entry>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    root: Mutex<Option<Arc<Fiber>>>,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    reactor: OnceLock<Weak<IoManager>>,
}

assert_impl_all!(Scheduler: Send, Sync);

impl Scheduler {
    /// Constructs a stopped scheduler; call [Scheduler::start] to spawn its
    /// workers.
    ///
    /// `threads` counts the caller thread when `use_caller` is set and must
    /// be at least one.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        assert!(threads >= 1, "scheduler needs at least one thread");
        let (thread_count, caller_thread) = match use_caller {
            true => (threads - 1, Some(thread::current().id())),
            false => (threads, None),
        };
        Arc::new(Scheduler {
            name: name.into(),
            thread_count,
            use_caller,
            caller_thread,
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            root: Mutex::new(None),
            active_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            reactor: OnceLock::new(),
        })
    }

    /// Returns the scheduler owning the calling thread.
    pub fn current() -> Option<Arc<Scheduler>> {
        SCHEDULER.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of pool workers, excluding an attached caller thread.
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub(crate) fn set_reactor(&self, reactor: Weak<IoManager>) {
        if self.reactor.set(reactor).is_err() {
            panic!("{}: reactor already bound", self.name);
        }
    }

    pub(crate) fn reactor(&self) -> Option<Arc<IoManager>> {
        self.reactor.get().and_then(Weak::upgrade)
    }

    /// Spawns the worker threads. No-op if already started.
    pub fn start(self: &Arc<Self>) {
        if !self.stopping.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut threads = self.threads.lock().unwrap();
        assert!(threads.is_empty(), "{}: workers already spawned", self.name);
        for i in 0..self.thread_count {
            let scheduler = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || scheduler.serve(i))
                .expect("failed to spawn scheduler worker");
            threads.push(handle);
        }
    }

    /// Enqueues a task, optionally pinned to one worker, waking an idle
    /// worker when the queue was empty.
    pub fn schedule(&self, task: impl Into<Task>, thread: Option<usize>) {
        if let Some(t) = thread {
            assert!(t < self.thread_count + self.use_caller as usize, "{}: no worker {}", self.name, t);
        }
        let need_tickle = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(Entry { task: task.into(), thread });
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Enqueues a batch of unpinned tasks with at most one wakeup.
    pub fn schedule_all<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let need_tickle = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.extend(tasks.into_iter().map(|task| Entry { task, thread: None }));
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Re-schedules the current fiber pinned to `thread` and yields, moving
    /// execution to that worker.
    ///
    /// Must be called from a fiber some scheduler is dispatching; calling it
    /// off any scheduler thread is a contract violation and panics.
    pub fn switch_to(self: &Arc<Self>, thread: Option<usize>) {
        let current = Scheduler::current();
        assert!(current.is_some(), "{}: switch_to outside a scheduler thread", self.name);
        if let Some(current) = current {
            if Arc::ptr_eq(&current, self) && (thread.is_none() || thread == current_worker()) {
                return;
            }
        }
        self.schedule(Fiber::current(), thread);
        Fiber::yield_hold();
    }

    /// Stops the scheduler: drains queued work, runs the caller's dispatch
    /// share if a caller thread is attached, and joins all workers.
    pub fn stop(self: &Arc<Self>) {
        self.auto_stop.store(true, Ordering::SeqCst);
        if self.use_caller && self.thread_count == 0 {
            let root_state = self.root.lock().unwrap().as_ref().map(|root| root.state());
            if matches!(root_state, None | Some(FiberState::Init) | Some(FiberState::Term)) {
                self.stopping.store(true, Ordering::SeqCst);
                if self.check_stopping() {
                    log::info!("{}: stopped", self.name);
                    return;
                }
            }
        }
        if self.use_caller {
            let caller = self.caller_thread.expect("caller thread unset");
            assert_eq!(thread::current().id(), caller, "{}: stop must run on the caller thread", self.name);
        }
        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.thread_count {
            self.tickle();
        }
        if self.use_caller {
            self.tickle();
            if !self.check_stopping() {
                self.run_caller();
            }
        }
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for thread in threads {
            thread.join().ignore();
        }
        log::info!("{}: stopped", self.name);
    }

    pub(crate) fn tickle(&self) {
        match self.reactor() {
            Some(io) => io.tickle(),
            None => log::trace!("{}: tickle", self.name),
        }
    }

    pub(crate) fn check_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active_count.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn stopping_flag(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn idle_workers(&self) -> usize {
        self.idle_count.load(Ordering::SeqCst)
    }

    pub(crate) fn has_runnable(&self, worker: Option<usize>) -> bool {
        let queue = self.queue.lock().unwrap();
        queue.iter().any(|entry| entry.thread.is_none() || entry.thread == worker)
    }

    fn serve(self: Arc<Self>, worker: usize) {
        let _scope = Scope::enter(&self, worker);
        let main = fiber::main_fiber();
        fiber::set_scheduling(&main);
        self.dispatch(worker);
        fiber::clear_scheduling();
    }

    fn run_caller(self: &Arc<Self>) {
        let worker = self.thread_count;
        let _scope = Scope::enter(self, worker);
        fiber::main_fiber();
        let scheduler = self.clone();
        let root = Fiber::new(move || scheduler.dispatch(worker), StackSize::default(), true);
        *self.root.lock().unwrap() = Some(root.clone());
        fiber::set_scheduling(&root);
        root.call();
        fiber::clear_scheduling();
    }

    fn dispatch(self: &Arc<Self>, worker: usize) {
        log::debug!("{}: worker {} dispatching", self.name, worker);
        let scheduler = self.clone();
        let idle_fiber = Fiber::new(move || scheduler.idle(), StackSize::default(), false);
        let mut cb_fiber: Option<Arc<Fiber>> = None;
        loop {
            let mut tickle_me = false;
            let mut entry = None;
            {
                let mut queue = self.queue.lock().unwrap();
                let mut index = 0;
                while index < queue.len() {
                    let candidate = &queue[index];
                    if candidate.thread.is_some_and(|t| t != worker) {
                        // pinned elsewhere, its worker needs a wakeup
                        tickle_me = true;
                        index += 1;
                        continue;
                    }
                    if let Task::Fiber(fiber) = &candidate.task {
                        if fiber.state() == FiberState::Exec {
                            index += 1;
                            continue;
                        }
                    }
                    entry = queue.remove(index);
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me |= !queue.is_empty();
            }
            if tickle_me {
                self.tickle();
            }
            match entry.map(|e| e.task) {
                Some(Task::Fiber(fiber)) => {
                    if !matches!(fiber.state(), FiberState::Term | FiberState::Except) {
                        fiber.swap_in();
                        match fiber.state() {
                            FiberState::Ready => self.schedule(fiber, None),
                            FiberState::Term | FiberState::Except => {},
                            // suspended through an event or timer slot which
                            // keeps its own reference
                            _ => fiber.set_state(FiberState::Hold),
                        }
                    }
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                },
                Some(Task::Call(f)) => {
                    let fiber = match cb_fiber.take() {
                        None => Fiber::with_boxed(f, StackSize::default(), false),
                        Some(fiber) => {
                            fiber.reset_boxed(f);
                            fiber
                        },
                    };
                    fiber.swap_in();
                    match fiber.state() {
                        FiberState::Ready => self.schedule(fiber, None),
                        FiberState::Term | FiberState::Except => cb_fiber = Some(fiber),
                        _ => fiber.set_state(FiberState::Hold),
                    }
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                },
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        log::debug!("{}: worker {} idle fiber terminated", self.name, worker);
                        break;
                    }
                    self.idle_count.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.swap_in();
                    self.idle_count.fetch_sub(1, Ordering::SeqCst);
                    if !matches!(idle_fiber.state(), FiberState::Term | FiberState::Except) {
                        idle_fiber.set_state(FiberState::Hold);
                    }
                },
            }
        }
    }

    fn idle(&self) {
        match self.reactor() {
            Some(io) => io.idle(),
            None => {
                log::debug!("{}: idle", self.name);
                while !self.check_stopping() {
                    Fiber::yield_hold();
                }
            },
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug_assert!(self.stopping.load(Ordering::SeqCst), "{}: dropped while running", self.name);
    }
}
