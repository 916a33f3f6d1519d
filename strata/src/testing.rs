//! Arena helpers shared by the unit tests

extern crate alloc;

use core::alloc::Layout;
use core::ptr::NonNull;

/// Alignment of every test arena, so that layouts are deterministic
pub const ARENA_ALIGN: usize = 64;

/// A zeroed, over-aligned byte buffer released on drop
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuffer {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, ARENA_ALIGN).unwrap();
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        Self {
            ptr: NonNull::new(ptr).expect("test arena allocation failed"),
            layout,
        }
    }

    pub const fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr().addr()
    }

    pub const fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
