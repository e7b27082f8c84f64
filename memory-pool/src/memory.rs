// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::os::raw::c_void;
use std::sync::Arc;

use thiserror::Error;

use crate::system;

/// Error type returned by stack allocation methods.
#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    /// Contains the maximum amount of memory allowed to be allocated as stack space.
    #[error("requested more than max size of {0} bytes for a stack")]
    ExceedsMaximumSize(usize),

    /// A stack was handed back to a pool that serves a different size.
    #[error("stack of {actual} bytes returned to a pool of {expected} byte stacks")]
    SizeMismatch { expected: usize, actual: usize },

    /// Returned if some kind of I/O error happens during allocation.
    #[error(transparent)]
    IoError(Arc<io::Error>),
}

impl From<io::Error> for MemoryError {
    fn from(e: io::Error) -> Self {
        MemoryError::IoError(Arc::new(e))
    }
}

/// An owned, page-aligned region used as a fiber call stack.
///
/// The stack grows from `top()` down towards `bottom()`. A protected stack has
/// one inaccessible guard page right below `bottom()`, so running off the end
/// faults instead of scribbling over the neighbouring mapping. The mapping is
/// released when the `Memory` is dropped.
#[derive(Debug, Eq, PartialEq)]
pub struct Memory {
    top: *mut c_void,
    bottom: *mut c_void,
    protected: bool,
}

unsafe impl Send for Memory {}

impl Memory {
    /// Allocates a new stack of **at least** `size` bytes + one additional guard page.
    ///
    /// `size` is rounded up to a multiple of the size of a memory page and
    /// does not include the size of the guard page itself.
    pub fn new(size: usize) -> Result<Memory, MemoryError> {
        Memory::allocate(size, true)
    }

    pub(crate) fn allocate(mut size: usize, protected: bool) -> Result<Memory, MemoryError> {
        let page_size = system::page_size();
        let min_stack_size = system::min_size();
        let max_stack_size = system::max_size(false);
        let add_shift = if protected { 1 } else { 0 };
        let add = page_size << add_shift;
        if size < min_stack_size {
            size = min_stack_size;
        }
        size = (size - 1) & !(page_size - 1);
        if let Some(size) = size.checked_add(add) {
            if size <= max_stack_size {
                let mut ret = unsafe { system::allocate(size) };
                if protected {
                    if let Ok(stack) = ret {
                        ret = match unsafe { system::protect(&stack) } {
                            Ok(guarded) => {
                                // the guarded view now owns the whole mapping
                                std::mem::forget(stack);
                                Ok(guarded)
                            }
                            Err(e) => Err(e),
                        };
                    }
                }
                return ret.map_err(MemoryError::from);
            }
        }
        Err(MemoryError::ExceedsMaximumSize(max_stack_size - add))
    }

    /// Takes ownership of the mapping between `bottom` and `top`.
    ///
    /// It is unsafe because it is your reponsibility to make sure that `top` and `bottom` are valid
    /// addresses of one mapping, with a guard page right below `bottom` when `protected`.
    #[inline]
    pub(crate) unsafe fn init(top: *mut c_void, bottom: *mut c_void, protected: bool) -> Memory {
        debug_assert!(top >= bottom);
        Memory {
            top,
            bottom,
            protected,
        }
    }

    /// Returns the top of the stack from which on it grows downwards towards bottom().
    #[inline]
    pub fn top(&self) -> *mut c_void {
        self.top
    }

    /// Returns the bottom of the stack and thus it's end.
    #[inline]
    pub fn bottom(&self) -> *mut c_void {
        self.bottom
    }

    #[inline]
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Returns the size of the stack between top() and bottom().
    #[inline]
    pub fn len(&self) -> usize {
        self.top as usize - self.bottom as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `addr` lies inside the usable part of this stack.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom as usize && addr <= self.top as usize
    }

    /// Bytes between `bottom()` and `addr`, i.e. how much stack is still free
    /// when `addr` is the current stack pointer. Zero when `addr` is outside.
    #[inline]
    pub fn remaining(&self, addr: usize) -> usize {
        if self.contains(addr) {
            addr - self.bottom as usize
        } else {
            0
        }
    }

    /// Returns the minimal stack size allowed by the current platform.
    #[inline]
    pub fn min_size() -> usize {
        system::min_size()
    }

    /// Returns the maximum stack size allowed by the current platform.
    #[inline]
    pub fn max_size(&self) -> usize {
        system::max_size(self.protected)
    }

    /// Returns a implementation defined default stack size.
    ///
    /// This value can vary greatly between platforms, but is usually only a couple
    /// memory pages in size and enough for most use-cases with little recursion.
    #[inline]
    pub fn default_size() -> usize {
        system::default_size(true)
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        let mut ptr = self.bottom();
        let mut size = self.len();
        if self.protected {
            let page_size = system::page_size();
            ptr = (self.bottom() as usize - page_size) as *mut c_void;
            size = self.len() + page_size;
        }
        unsafe {
            system::deallocate(ptr, size);
        }
    }
}
