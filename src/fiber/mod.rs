//! Stackful fibers with explicit symmetric switching.
//!
//! A fiber runs on its own mmap'd stack and suspends only at explicit
//! switch points. Each thread keeps three single-writer slots: the fiber
//! currently executing, the thread's implicit main fiber, and the scheduling
//! fiber that dispatch loops swap against.

mod context;
pub(crate) mod stack;

use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use static_assertions::assert_impl_all;

use self::context::Context;
pub use self::stack::StackSize;

thread_local! {
    static CURRENT: Cell<Option<NonNull<Fiber>>> = const { Cell::new(None) };
    static SCHEDULING: Cell<Option<NonNull<Fiber>>> = const { Cell::new(None) };
    static MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

static FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [Fiber].
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FiberState {
    /// Constructed or reset, never switched in.
    Init,
    /// Suspended and runnable; the scheduler should re-queue it.
    Ready,
    /// Running on some thread.
    Exec,
    /// Suspended until an external party re-schedules it.
    Hold,
    /// Entry returned.
    Term,
    /// Entry panicked.
    Except,
}

/// A stackful coroutine.
///
/// Fibers are handed around behind [Arc]: the ready queue, event handler
/// slots and timer callbacks all keep their own reference while the fiber is
/// suspended.
pub struct Fiber {
    id: u64,
    use_caller: bool,
    thread_main: bool,
    state: AtomicU8,
    context: UnsafeCell<Box<Context>>,
    entry: UnsafeCell<Option<Box<dyn FnOnce()>>>,
}

// Safety: a fiber is only ever touched by the thread that is executing or
// switching it; suspension hands the Arc across threads at a quiescent point.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

assert_impl_all!(Fiber: Send, Sync);

fn clone_arc(ptr: NonNull<Fiber>) -> Arc<Fiber> {
    let raw = ptr.as_ptr() as *const Fiber;
    // Safety: every fiber published to the thread-local slots is Arc-backed
    // and kept alive by its owner for the duration of the switch.
    unsafe {
        Arc::increment_strong_count(raw);
        Arc::from_raw(raw)
    }
}

fn panic_message<'a>(err: &'a Box<dyn Any + Send + 'static>) -> &'a str {
    if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else {
        ".."
    }
}

/// Returns this thread's main fiber, creating it on first use.
pub(crate) fn main_fiber() -> Arc<Fiber> {
    MAIN.with(|cell| {
        let mut slot = cell.borrow_mut();
        if let Some(fiber) = slot.as_ref() {
            return fiber.clone();
        }
        let fiber = Arc::new(Fiber {
            id: FIBER_ID.fetch_add(1, Ordering::Relaxed),
            use_caller: false,
            thread_main: true,
            state: AtomicU8::new(FiberState::Exec.into()),
            context: UnsafeCell::new(Box::new(Context::empty())),
            entry: UnsafeCell::new(None),
        });
        CURRENT.with(|current| {
            if current.get().is_none() {
                current.set(Some(NonNull::from(fiber.as_ref())));
            }
        });
        *slot = Some(fiber.clone());
        fiber
    })
}

pub(crate) fn set_scheduling(fiber: &Arc<Fiber>) {
    SCHEDULING.with(|cell| cell.set(Some(NonNull::from(fiber.as_ref()))));
}

pub(crate) fn clear_scheduling() {
    SCHEDULING.with(|cell| cell.set(None));
}

fn scheduling() -> NonNull<Fiber> {
    SCHEDULING.with(|cell| cell.get()).expect("no scheduling fiber on this thread")
}

impl Fiber {
    /// Constructs a fiber primed to run `f` on its first swap-in.
    ///
    /// A `use_caller` fiber swaps against the thread's main fiber instead of
    /// the scheduling fiber; the scheduler uses this for the dispatch fiber
    /// it hosts on the caller thread.
    pub fn new(f: impl FnOnce() + Send + 'static, stack_size: StackSize, use_caller: bool) -> Arc<Fiber> {
        Self::with_boxed(Box::new(f), stack_size, use_caller)
    }

    pub(crate) fn with_boxed(f: Box<dyn FnOnce() + Send>, stack_size: StackSize, use_caller: bool) -> Arc<Fiber> {
        let f: Box<dyn FnOnce()> = f;
        let fiber = Arc::new(Fiber {
            id: FIBER_ID.fetch_add(1, Ordering::Relaxed),
            use_caller,
            thread_main: false,
            state: AtomicU8::new(FiberState::Init.into()),
            context: UnsafeCell::new(Box::new(Context::empty())),
            entry: UnsafeCell::new(Some(f)),
        });
        let arg = Arc::as_ptr(&fiber) as *mut libc::c_void;
        let context = Context::new(Self::fiber_main, arg, stack_size);
        // Safety: not yet shared, sole owner.
        unsafe { *fiber.context.get() = context };
        fiber
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::try_from(self.state.load(Ordering::Acquire)).expect("invalid fiber state")
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state.into(), Ordering::Release);
    }

    pub(crate) fn is_thread_main(&self) -> bool {
        self.thread_main
    }

    /// Returns the fiber executing on this thread, or the thread's main
    /// fiber if none is.
    pub fn current() -> Arc<Fiber> {
        match CURRENT.with(|cell| cell.get()) {
            Some(ptr) => clone_arc(ptr),
            None => main_fiber(),
        }
    }

    /// Rebinds this fiber to a new entry, reusing its stack.
    ///
    /// Only fibers that never ran or already completed can be rebound.
    pub fn reset(&self, f: impl FnOnce() + Send + 'static) {
        self.reset_boxed(Box::new(f))
    }

    pub(crate) fn reset_boxed(&self, f: Box<dyn FnOnce() + Send>) {
        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Term | FiberState::Except),
            "reset fiber {} in state {:?}",
            self.id,
            state
        );
        assert!(!self.thread_main, "reset thread main fiber");
        let f: Box<dyn FnOnce()> = f;
        // Safety: the fiber is not executing in any of the admitted states.
        unsafe {
            *self.entry.get() = Some(f);
            let arg = self as *const Fiber as *mut libc::c_void;
            (*self.context.get()).prime(Self::fiber_main, arg);
        }
        self.set_state(FiberState::Init);
    }

    /// Switches execution from the scheduling fiber into this fiber.
    pub fn swap_in(&self) {
        let sched = scheduling();
        // Safety: the scheduling fiber outlives its dispatch loop, and the
        // thread switching away from it is the only one touching it.
        unsafe { self.switch_from(sched.as_ref()) };
    }

    /// Switches execution from this fiber back to the scheduling fiber.
    ///
    /// The fiber state is left as pre-assigned by the caller; the dispatch
    /// loop demotes a plain `Exec` to `Hold` after regaining control.
    pub fn swap_out(&self) {
        let sched = scheduling();
        unsafe { sched.as_ref().switch_back_from(self) };
    }

    /// Switches execution from the thread's main fiber into this fiber.
    pub fn call(&self) {
        let main = main_fiber();
        unsafe { self.switch_from(&main) };
    }

    /// Switches execution from this fiber back to the thread's main fiber.
    pub fn back(&self) {
        let main = main_fiber();
        unsafe { main.switch_back_from(self) };
    }

    /// Suspends the running fiber in `Hold`. Some other party is expected to
    /// hold a reference and re-schedule it.
    pub fn yield_hold() {
        let fiber = Fiber::current();
        fiber.set_state(FiberState::Hold);
        fiber.swap_out();
    }

    /// Suspends the running fiber in `Ready` so the dispatch loop re-queues
    /// it.
    pub fn yield_ready() {
        let fiber = Fiber::current();
        fiber.set_state(FiberState::Ready);
        fiber.swap_out();
    }

    /// Safety: `self` and `from` are distinct fibers owned by this thread
    /// for the duration of the switch.
    unsafe fn switch_from(&self, from: &Fiber) {
        debug_assert!(!std::ptr::eq(self, from), "fiber {} switching into itself", self.id);
        CURRENT.with(|cell| cell.set(Some(NonNull::from(self))));
        self.set_state(FiberState::Exec);
        let context = &*self.context.get();
        let backup = &mut *from.context.get();
        context.switch(backup);
    }

    /// Safety: as [Fiber::switch_from]; resuming side keeps whatever state it
    /// already has.
    unsafe fn switch_back_from(&self, from: &Fiber) {
        CURRENT.with(|cell| cell.set(Some(NonNull::from(self))));
        let context = &*self.context.get();
        let backup = &mut *from.context.get();
        context.switch(backup);
    }

    extern "C" fn fiber_main(arg: *mut libc::c_void) {
        // Safety: `arg` is the Arc-backed fiber; a reference is held by
        // whoever swapped us in.
        let fiber = unsafe { &*(arg as *const Fiber) };
        fiber.invoke();
        if fiber.use_caller {
            fiber.back();
        } else {
            fiber.swap_out();
        }
        unreachable!("terminated fiber {} resumed", fiber.id);
    }

    fn invoke(&self) {
        // Safety: only the executing thread touches the entry slot.
        let entry = unsafe { &mut *self.entry.get() }.take().expect("fiber entry missing");
        match panic::catch_unwind(AssertUnwindSafe(entry)) {
            Ok(()) => self.set_state(FiberState::Term),
            Err(err) => {
                log::error!("fiber {} panicked: {}", self.id, panic_message(&err));
                self.set_state(FiberState::Except);
            },
        }
    }
}
