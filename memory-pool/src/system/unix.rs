// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::memory::Memory;

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_STACK: libc::c_int = libc::MAP_STACK;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_STACK: libc::c_int = 0;

/// Maps `size` bytes of private, zero-filled memory.
pub unsafe fn allocate(size: usize) -> io::Result<Memory> {
    const PROT: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;
    const TYPE: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON | MAP_STACK;

    let ptr = libc::mmap(std::ptr::null_mut(), size, PROT, TYPE, -1, 0);
    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(Memory::init(
            (ptr as usize + size) as *mut c_void,
            ptr as *mut c_void,
            false,
        ))
    }
}

pub unsafe fn deallocate(ptr: *mut c_void, size: usize) {
    libc::munmap(ptr, size);
}

/// Turns the lowest page of `memory` into an inaccessible guard page.
///
/// The returned `Memory` no longer includes the guard page.
pub unsafe fn protect(memory: &Memory) -> io::Result<Memory> {
    let page_size = page_size();
    debug_assert!(memory.len() % page_size == 0 && memory.len() != 0);

    if libc::mprotect(memory.bottom(), page_size, libc::PROT_NONE) == 0 {
        let bottom = (memory.bottom() as usize + page_size) as *mut c_void;
        Ok(Memory::init(memory.top(), bottom, true))
    } else {
        Err(io::Error::last_os_error())
    }
}

pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    let mut ret = PAGE_SIZE.load(Ordering::Relaxed);
    if ret == 0 {
        ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        PAGE_SIZE.store(ret, Ordering::Relaxed);
    }
    ret
}

pub fn min_size() -> usize {
    // Each fiber needs room for the switch frame, the trampoline and the
    // panic machinery, which alone eats several KiB.
    (libc::SIGSTKSZ as usize).max(page_size() * 4)
}

/// Largest stack we are willing to map, including the guard page when `protected`.
pub fn max_size(protected: bool) -> usize {
    static MAX_SIZE: AtomicUsize = AtomicUsize::new(0);

    let mut ret = MAX_SIZE.load(Ordering::Relaxed);
    if ret == 0 {
        let mut limit = std::mem::MaybeUninit::<libc::rlimit>::uninit();
        let limit_ret = unsafe { libc::getrlimit(libc::RLIMIT_STACK, limit.as_mut_ptr()) };
        ret = if limit_ret == 0 {
            let limit = unsafe { limit.assume_init() };
            if limit.rlim_max == libc::RLIM_INFINITY || limit.rlim_max as u128 > usize::MAX as u128
            {
                1024 * 1024 * 1024
            } else {
                limit.rlim_max as usize
            }
        } else {
            1024 * 1024 * 1024
        };
        MAX_SIZE.store(ret, Ordering::Relaxed);
    }
    if protected {
        ret - page_size()
    } else {
        ret
    }
}
