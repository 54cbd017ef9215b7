use std::io::Error;
use std::ptr;
use std::sync::OnceLock;

const DEFAULT_STACK_SIZE: usize = 128 * 1024;

fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let rc = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(rc > 0, "sysconf(_SC_PAGESIZE) returns {}", rc);
        rc as usize
    })
}

fn configured_default() -> usize {
    static CONFIGURED: OnceLock<usize> = OnceLock::new();
    *CONFIGURED.get_or_init(|| {
        std::env::var("WEFT_STACK_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|bytes| *bytes > 0)
            .unwrap_or(DEFAULT_STACK_SIZE)
    })
}

fn align_up(bytes: usize, page: usize) -> usize {
    (bytes + page - 1) / page * page
}

/// Stack sizing for a new fiber.
///
/// Defaults to 128KiB, overridable through the `WEFT_STACK_SIZE` environment
/// variable. Whatever is requested gets rounded up to whole pages and floored
/// at the signal-stack minimum.
#[derive(Copy, Clone, Debug, Default)]
pub struct StackSize {
    sizing: Sizing,
}

#[derive(Copy, Clone, Debug, Default)]
enum Sizing {
    #[default]
    Default,
    Exact(usize),
    Extra(usize),
}

impl StackSize {
    /// Requests exactly `size` bytes.
    pub fn with_size(size: usize) -> StackSize {
        StackSize { sizing: Sizing::Exact(size.max(1)) }
    }

    /// Requests `extra` bytes on top of the configured default.
    pub fn with_extra_size(extra: usize) -> StackSize {
        StackSize { sizing: Sizing::Extra(extra) }
    }

    fn resolve(&self, page: usize) -> usize {
        let bytes = match self.sizing {
            Sizing::Default => configured_default(),
            Sizing::Exact(bytes) => bytes,
            Sizing::Extra(extra) => configured_default().saturating_add(extra),
        };
        align_up(bytes.max(libc::MINSIGSTKSZ), page)
    }
}

/// One fiber stack: an anonymous mapping whose lowest page is made
/// inaccessible so an overflow faults instead of corrupting the neighbor.
pub(crate) struct Stack {
    mapping: *mut u8,
    total: usize,
}

impl Stack {
    pub fn alloc(size: StackSize) -> Stack {
        let page = page_size();
        let usable = size.resolve(page);
        let total = usable + page;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK;
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let mapping = unsafe { libc::mmap(ptr::null_mut(), total, prot, flags, -1, 0) };
        if mapping == libc::MAP_FAILED {
            panic!("mmap of {} stack bytes failed: {}", total, Error::last_os_error());
        }
        if unsafe { libc::mprotect(mapping, page, libc::PROT_NONE) } != 0 {
            panic!("stack guard mprotect failed: {}", Error::last_os_error());
        }
        Stack { mapping: mapping as *mut u8, total }
    }

    /// Lowest usable address, just above the guard page.
    pub fn base(&self) -> *mut u8 {
        unsafe { self.mapping.add(page_size()) }
    }

    pub fn size(&self) -> usize {
        self.total - page_size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if self.mapping.is_null() {
            return;
        }
        if unsafe { libc::munmap(self.mapping as *mut libc::c_void, self.total) } != 0 {
            panic!("stack munmap failed: {}", Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let n = page_size();
        assert_ne!(n, 0);
        assert_eq!(n & (n - 1), 0);
    }

    #[test]
    fn sizes_resolve_page_aligned() {
        let page = page_size();
        let requests = [
            StackSize::default(),
            StackSize::with_size(1),
            StackSize::with_size(64 * 1024 + 5),
            StackSize::with_extra_size(3),
        ];
        for request in requests {
            let resolved = request.resolve(page);
            assert!(resolved > 0);
            assert_eq!(resolved % page, 0);
        }
    }

    #[test]
    fn exact_size_rounds_up_to_next_page() {
        let page = page_size();
        assert_eq!(StackSize::with_size(page + 1).resolve(page), 2 * page);
    }

    #[test]
    fn extra_grows_the_default() {
        let page = page_size();
        let default = StackSize::default().resolve(page);
        assert!(StackSize::with_extra_size(page).resolve(page) > default);
    }

    #[test]
    fn stack_is_writable_over_its_whole_size() {
        let stack = Stack::alloc(StackSize::with_size(16 * 1024));
        assert!(stack.size() >= 16 * 1024);
        unsafe {
            stack.base().write(0xa5);
            stack.base().add(stack.size() - 1).write(0xa5);
            assert_eq!(stack.base().read(), 0xa5);
        }
    }

    #[test]
    fn zeroed_stack_drops_cleanly() {
        drop::<Stack>(unsafe { std::mem::zeroed() });
    }
}
