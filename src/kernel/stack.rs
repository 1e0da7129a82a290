//! Thread stacks backed by anonymous memory mappings.
//!
//! Each stack is a private mapping with one `PROT_NONE` guard page at its low end so an
//! overflow faults instead of silently running into a neighbouring allocation. Mapping and
//! unmapping go straight to the kernel, which keeps stack release safe on the scheduler's
//! signal path.

use core::ptr::NonNull;
use std::io;

pub const DEFAULT_PAGE_SIZE: usize = 4096;

pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

/// Round `bytes` up to a whole number of pages.
pub fn round_to_pages(bytes: usize, page: usize) -> usize {
    bytes.div_ceil(page).max(1) * page
}

#[derive(Debug)]
pub struct Stack {
    base: NonNull<u8>,
    /// Whole mapping, guard page included.
    mapped: usize,
    guard: usize,
}

impl Stack {
    /// Map a stack with at least `usable` bytes above its guard page.
    pub fn new(usable: usize) -> io::Result<Self> {
        let page = page_size();
        let usable = round_to_pages(usable, page);
        let mapped = usable + page;

        // SAFETY: anonymous private mapping with no address hint.
        let raw = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(raw.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let stack = Self {
            base,
            mapped,
            guard: page,
        };

        // SAFETY: the first page lies inside the mapping created above.
        if unsafe { libc::mprotect(raw, page, libc::PROT_NONE) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(stack)
    }

    /// Exclusive upper end of the stack; stacks grow down from here.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: one-past-the-end of the mapping.
        unsafe { self.base.as_ptr().add(self.mapped) }
    }

    /// Lowest usable address, just above the guard page.
    pub fn bottom(&self) -> *mut u8 {
        // SAFETY: the guard page is inside the mapping.
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    pub fn usable_size(&self) -> usize {
        self.mapped - self.guard
    }

    pub fn contains(&self, addr: usize) -> bool {
        let low = self.bottom() as usize;
        addr >= low && addr < self.top() as usize
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: unmaps exactly the region mapped in `Stack::new`. Nothing can be running on
        // it: the scheduler defers the release of the running thread's stack.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.mapped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_pages() {
        assert_eq!(round_to_pages(1, 4096), 4096);
        assert_eq!(round_to_pages(4096, 4096), 4096);
        assert_eq!(round_to_pages(4097, 4096), 8192);
        assert_eq!(round_to_pages(0, 4096), 4096);
    }

    #[test]
    fn stack_is_writable_and_aligned() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert!(stack.usable_size() >= 64 * 1024);
        assert_eq!(stack.top() as usize % 16, 0);
        assert!(stack.contains(stack.top() as usize - 1));
        assert!(!stack.contains(stack.top() as usize));
        assert!(!stack.contains(stack.bottom() as usize - 1));

        unsafe {
            let last = stack.top().sub(1);
            last.write(0xA5);
            assert_eq!(last.read(), 0xA5);
            stack.bottom().write(0x5A);
            assert_eq!(stack.bottom().read(), 0x5A);
        }
    }
}
