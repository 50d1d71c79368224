//! Test-only helpers: a deterministic slab-backed code memory and a hex
//! dump of emitted bytes.

use crate::buffer::{CodeMemory, CODEPAGE};

/// A `CodeMemory` that hands out consecutive page-sized chunks of one
/// word-aligned slab. Nothing is ever executable; protection and flush
/// requests are recorded for assertions.
pub(crate) struct SlabMemory {
    slab: Box<[u64]>,
    used: usize,
    prot_log: Vec<(&'static str, *mut u8)>,
    flushes: Vec<(*const u8, *const u8)>,
}

impl SlabMemory {
    pub fn new() -> Self {
        Self::with_capacity(16 * CODEPAGE)
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            slab: vec![0u64; bytes / 8].into_boxed_slice(),
            used: 0,
            prot_log: Vec::new(),
            flushes: Vec::new(),
        }
    }

    pub fn protection_log(&self) -> Vec<(&'static str, *mut u8)> {
        self.prot_log.clone()
    }

    pub fn flushes(&self) -> &[(*const u8, *const u8)] {
        &self.flushes
    }
}

impl CodeMemory for SlabMemory {
    fn allocate(&mut self, size: usize) -> *mut u8 {
        let size = (size + CODEPAGE - 1) & !(CODEPAGE - 1);
        if self.used + size > self.slab.len() * 8 {
            return core::ptr::null_mut();
        }
        let p = unsafe { (self.slab.as_mut_ptr() as *mut u8).add(self.used) };
        self.used += size;
        p
    }

    fn protect_writable(&mut self, base: *mut u8, _len: usize) {
        self.prot_log.push(("rw", base));
    }

    fn protect_executable(&mut self, base: *mut u8, _len: usize) {
        self.prot_log.push(("rx", base));
    }

    fn flush_icache(&mut self, start: *const u8, end: *const u8) {
        self.flushes.push((start, end));
    }
}

/// Render the bytes in `[start, end)` as uppercase hex in memory order.
pub(crate) fn hexify(start: *const u8, end: *const u8) -> String {
    let len = end as usize - start as usize;
    let bytes = unsafe { core::slice::from_raw_parts(start, len) };
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}
