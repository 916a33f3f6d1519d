#![allow(dead_code)]

extern crate alloc;

use core::alloc::Layout;
use core::ptr::NonNull;

/// A zeroed, 64-byte aligned arena released on drop
pub struct Arena {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 64).unwrap();
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        Self {
            ptr: NonNull::new(ptr).expect("arena allocation failed"),
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

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Deterministic LCG so that stress tests are reproducible
pub struct Lcg(u32);

impl Lcg {
    pub const fn new(seed: u32) -> Self {
        Self(seed)
    }

    pub fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1_103_515_245).wrapping_add(12345);
        self.0
    }

    pub fn below(&mut self, bound: usize) -> usize {
        // Low bits of an LCG cycle quickly
        usize::try_from(self.next() >> 16).unwrap() % bound
    }
}
