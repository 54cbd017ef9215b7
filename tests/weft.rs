use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use weft::fiber::{Fiber, StackSize};
use weft::io::{self, Event, IoManager};
use weft::scheduler::{current_worker, Scheduler, Task};

struct Pipe {
    read: RawFd,
    write: RawFd,
}

impl Pipe {
    fn new() -> Pipe {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        Pipe { read: fds[0], write: fds[1] }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < Duration::from_secs(5), "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn yield_round_trip() {
    let scheduler = Scheduler::new(2, false, "round-trip");
    scheduler.start();
    let log = Arc::new(Mutex::new(Vec::new()));
    let shared = log.clone();
    let fiber = Fiber::new(
        move || {
            shared.lock().unwrap().push("A");
            Fiber::yield_hold();
            shared.lock().unwrap().push("B");
        },
        StackSize::default(),
        false,
    );
    scheduler.schedule(fiber.clone(), None);
    wait_until("first leg", || log.lock().unwrap().len() == 1);
    // let the fiber finish parking before resuming it from outside
    std::thread::sleep(Duration::from_millis(20));
    scheduler.schedule(fiber, None);
    scheduler.stop();
    assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
}

#[test]
fn pipe_wakeup_after_sleep() {
    let io_manager = IoManager::new(2, false, "pipe-wakeup").unwrap();
    let pipe = Pipe::new();
    let start = Instant::now();
    let woke = Arc::new(Mutex::new(None));

    let shared = woke.clone();
    let read_fd = pipe.read;
    io_manager
        .add_event(
            read_fd,
            Event::Read,
            Some(Box::new(move || {
                let mut buf = [0u8; 1];
                let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
                assert_eq!(n, 1);
                *shared.lock().unwrap() = Some(start.elapsed());
            })),
        )
        .unwrap();

    let write_fd = pipe.write;
    io_manager.schedule(
        Task::call(move || {
            io::sleep(Duration::from_millis(50));
            let n = unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };
            assert_eq!(n, 1);
        }),
        None,
    );

    wait_until("pipe readiness", || woke.lock().unwrap().is_some());
    io_manager.stop();
    let elapsed = woke.lock().unwrap().unwrap();
    assert!(elapsed >= Duration::from_millis(50), "woke after {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(500), "woke after {:?}", elapsed);
}

#[test]
fn fiber_waiter_resumes_on_readiness() {
    let io_manager = IoManager::new(2, false, "fiber-waiter").unwrap();
    let pipe = Pipe::new();
    let got = Arc::new(AtomicUsize::new(0));

    let shared = got.clone();
    let read_fd = pipe.read;
    let manager = io_manager.clone();
    io_manager.schedule(
        Task::call(move || {
            manager.add_event(read_fd, Event::Read, None).unwrap();
            Fiber::yield_hold();
            // resumed by readiness
            let mut buf = [0u8; 1];
            let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
            assert_eq!(n, 1);
            shared.store(buf[0] as usize, Ordering::SeqCst);
        }),
        None,
    );

    std::thread::sleep(Duration::from_millis(30));
    let n = unsafe { libc::write(pipe.write, b"z".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1);
    wait_until("fiber resumption", || got.load(Ordering::SeqCst) != 0);
    io_manager.stop();
    assert_eq!(got.load(Ordering::SeqCst), b'z' as usize);
}

#[test]
fn timer_cancel_race() {
    let io_manager = IoManager::new(2, false, "cancel-race").unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let timers: Vec<_> = (0..100)
        .map(|i| {
            let counter = counter.clone();
            let delay = 10 + (i as u64 * 90) / 100;
            io_manager.add_timer(
                delay,
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                false,
            )
        })
        .collect();
    let cancelled = timers.iter().step_by(2).filter(|timer| timer.cancel()).count();
    wait_until("survivors to fire", || counter.load(Ordering::SeqCst) == 100 - cancelled);
    std::thread::sleep(Duration::from_millis(150));
    io_manager.stop();
    // cancelled callbacks never fire
    assert_eq!(counter.load(Ordering::SeqCst), 100 - cancelled);
    assert!(cancelled >= 45, "only {} cancels won the race", cancelled);
}

#[test]
fn cancelled_timer_never_fires() {
    let io_manager = IoManager::new(1, false, "cancel-timer").unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let shared = counter.clone();
    let timer = io_manager.add_timer(
        100,
        move || {
            shared.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    assert!(timer.cancel());
    std::thread::sleep(Duration::from_millis(200));
    io_manager.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn recurring_timer_fires_periodically() {
    let io_manager = IoManager::new(2, false, "recurring").unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let shared = counter.clone();
    let timer = io_manager.add_timer(
        10,
        move || {
            shared.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );
    std::thread::sleep(Duration::from_millis(105));
    timer.cancel();
    let fired = counter.load(Ordering::SeqCst);
    assert!((5..=13).contains(&fired), "fired {} times in 105ms", fired);
    std::thread::sleep(Duration::from_millis(50));
    io_manager.stop();
    assert!(counter.load(Ordering::SeqCst) <= fired + 1);
}

#[test]
fn pinned_tasks_run_on_their_worker() {
    let scheduler = Scheduler::new(4, false, "pinning");
    scheduler.start();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..20 {
        let seen = seen.clone();
        scheduler.schedule(
            Task::call(move || {
                seen.lock().unwrap().push((current_worker().unwrap(), std::thread::current().id()));
            }),
            Some(2),
        );
    }
    scheduler.stop();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 20);
    let thread = seen[0].1;
    assert!(seen.iter().all(|(worker, tid)| *worker == 2 && *tid == thread));
}

#[test]
fn stop_with_inflight_io_returns_promptly() {
    let io_manager = IoManager::new(2, false, "inflight").unwrap();
    let pipe = Pipe::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let shared = counter.clone();
    io_manager
        .add_event(
            pipe.read,
            Event::Read,
            Some(Box::new(move || {
                shared.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    // the pipe never becomes readable
    std::thread::sleep(Duration::from_millis(50));
    let start = Instant::now();
    io_manager.stop();
    assert!(start.elapsed() <= Duration::from_millis(500), "stop took {:?}", start.elapsed());
    // the cancelled waiter was woken, not dropped
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn io_manager_with_caller_thread() {
    let io_manager = IoManager::new(2, true, "caller-io").unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let shared = counter.clone();
    io_manager.schedule(
        Task::call(move || {
            io::sleep(Duration::from_millis(10));
            shared.fetch_add(1, Ordering::SeqCst);
        }),
        None,
    );
    wait_until("pool worker progress", || counter.load(Ordering::SeqCst) == 1);
    io_manager.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn switch_to_moves_fiber_between_workers() {
    let scheduler = Scheduler::new(3, false, "switch");
    scheduler.start();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let shared = seen.clone();
    let target = scheduler.clone();
    scheduler.schedule(
        Task::call(move || {
            shared.lock().unwrap().push(current_worker().unwrap());
            target.switch_to(Some(1));
            shared.lock().unwrap().push(current_worker().unwrap());
        }),
        Some(0),
    );
    scheduler.stop();
    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec![0, 1]);
}
