//! Volatile storage for registers and packet memory words
//!
//! The RAL macros only need `read` and `write`; field access is layered on
//! top by the register modules.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T: Copy> VCell<T> {
    /// Reads the value; the peripheral may have changed it since the last read
    pub fn read(&self) -> T {
        // Safety: the cell is only ever accessed through volatile operations.
        unsafe { self.0.get().read_volatile() }
    }

    pub fn write(&self, value: T) {
        // Safety: see read.
        unsafe { self.0.get().write_volatile(value) }
    }
}

// The peripheral is the only other party touching these words, and the
// engine's `&mut self` methods serialize Rust-side access.
unsafe impl<T: Send> Sync for VCell<T> {}
