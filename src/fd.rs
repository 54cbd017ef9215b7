//! Per-fd metadata consulted by blocking-call wrappers: socketness,
//! nonblocking flags and read/write timeouts.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

/// Direction a timeout applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// No timeout configured.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Tracked state of one descriptor.
///
/// Sockets are switched to nonblocking on first sight so wrapped calls can
/// turn `EAGAIN` into an event wait; `user_nonblock` records whether the
/// application asked for nonblocking itself, in which case wrappers stay out
/// of the way.
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut stat) } == 0 && stat.st_mode & libc::S_IFMT == libc::S_IFSOCK;
        let ctx = FdCtx {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        };
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            ctx.sys_nonblock.store(true, Ordering::Relaxed);
        }
        ctx
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_sys_nonblock(&self, nonblock: bool) {
        self.sys_nonblock.store(nonblock, Ordering::Relaxed);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::Relaxed);
    }

    /// Timeout in milliseconds for the given direction, [NO_TIMEOUT] if none.
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout.load(Ordering::Relaxed),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.store(ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout.store(ms, Ordering::Relaxed),
        }
    }
}

/// Growable registry of [FdCtx] entries indexed by fd number.
pub struct FdManager {
    fds: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager { fds: RwLock::new(vec![None; 64]) }
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let fds = self.fds.read().unwrap();
        fds.get(fd as usize).and_then(Clone::clone)
    }

    pub fn get_or_create(&self, fd: RawFd) -> Arc<FdCtx> {
        assert!(fd >= 0, "invalid fd {}", fd);
        if let Some(ctx) = self.get(fd) {
            return ctx;
        }
        let mut fds = self.fds.write().unwrap();
        let wanted = (fd as usize + 1).max(fds.len() + fds.len() / 2);
        if fds.len() < wanted {
            fds.resize(wanted, None);
        }
        let slot = &mut fds[fd as usize];
        match slot {
            Some(ctx) => ctx.clone(),
            None => {
                let ctx = Arc::new(FdCtx::new(fd));
                *slot = Some(ctx.clone());
                ctx
            },
        }
    }

    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut fds = self.fds.write().unwrap();
        if let Some(slot) = fds.get_mut(fd as usize) {
            slot.take();
        }
    }
}

lazy_static! {
    static ref FD_MANAGER: FdManager = FdManager::new();
}

/// Process-wide fd metadata registry.
pub fn fd_manager() -> &'static FdManager {
    &FD_MANAGER
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct Fds([RawFd; 2]);

    impl Drop for Fds {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.0[0]);
                libc::close(self.0[1]);
            }
        }
    }

    fn pipe() -> Fds {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        Fds(fds)
    }

    fn socketpair() -> Fds {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) }, 0);
        Fds(fds)
    }

    #[test]
    fn pipe_is_not_socket() {
        let manager = FdManager::new();
        let fds = pipe();
        let ctx = manager.get_or_create(fds.0[0]);
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());
    }

    #[test]
    fn socket_forced_nonblocking() {
        let manager = FdManager::new();
        let fds = socketpair();
        let ctx = manager.get_or_create(fds.0[0]);
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        let flags = unsafe { libc::fcntl(fds.0[0], libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);
    }

    #[test]
    fn timeouts_default_unset() {
        let manager = FdManager::new();
        let fds = pipe();
        let ctx = manager.get_or_create(fds.0[0]);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);
        ctx.set_timeout(TimeoutKind::Recv, 1500);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 1500);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);
    }

    #[test]
    fn del_forgets_entry() {
        let manager = FdManager::new();
        let fds = pipe();
        let fd = fds.0[0];
        let created = manager.get_or_create(fd);
        assert!(manager.get(fd).is_some());
        manager.del(fd);
        assert!(manager.get(fd).is_none());
        // a fresh entry is a different context
        let recreated = manager.get_or_create(fd);
        assert!(!Arc::ptr_eq(&created, &recreated));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let manager = FdManager::new();
        let fds = pipe();
        let high = 320 as RawFd;
        assert!(unsafe { libc::dup2(fds.0[0], high) } >= 0);
        let ctx = manager.get_or_create(high);
        assert_eq!(ctx.fd(), high);
        assert!(manager.get(high).is_some());
        unsafe { libc::close(high) };
    }
}
