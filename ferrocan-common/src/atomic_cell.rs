//! A cell type providing atomic load/store via critical_section
//!
//! Crossbeam's AtomicCell is unavailable on targets without CAS (e.g.
//! thumbv6m), so this wraps a `Cell` in a critical-section Mutex instead.

use core::cell::Cell;
use critical_section::Mutex;

#[derive(Debug)]
pub struct AtomicCell<T: Copy> {
    inner: Mutex<Cell<T>>,
}

impl<T: Default + Copy + Send> Default for AtomicCell<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Cell::new(T::default())),
        }
    }
}

impl<T: Send + Copy> AtomicCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Cell::new(value)),
        }
    }

    pub fn load(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).get())
    }

    pub fn store(&self, value: T) {
        critical_section::with(|cs| self.inner.borrow(cs).set(value));
    }
}

impl<T: Send + Copy + Default> AtomicCell<T> {
    /// Replace the stored value with its default and return it
    pub fn take(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).take())
    }
}
