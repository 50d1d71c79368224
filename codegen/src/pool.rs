//! The per-procedure literal pool.
//!
//! The pool collects the 32-bit constants a procedure needs that cannot be
//! encoded as immediates. Interning the same value twice returns the same
//! offset, so each distinct constant occupies exactly one slot. The pool is
//! written out at the end of the procedure, after the final return, and the
//! prologue's pool-header load makes it reachable through the dedicated
//! base register.

use crate::fatal;

/// Capacity of a procedure's literal pool, in 32-bit words.
pub const MAX_LITERALS: usize = 256;

/// An ordered, deduplicated table of 32-bit constants.
#[derive(Clone, Default)]
pub struct LiteralPool {
    words: Vec<u32>,
}

impl LiteralPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Insert a constant into the pool, returning its byte offset from the
    /// pool base. Inserting a value already present returns the existing
    /// offset.
    pub fn intern(&mut self, value: u32) -> u32 {
        for (i, &w) in self.words.iter().enumerate() {
            if w == value {
                return 4 * i as u32;
            }
        }
        if self.words.len() >= MAX_LITERALS {
            fatal!("too many literals in procedure (max {})", MAX_LITERALS);
        }
        self.words.push(value);
        4 * (self.words.len() as u32 - 1)
    }

    /// The constant stored at a given byte offset.
    pub fn value(&self, offset: u32) -> u32 {
        self.words[offset as usize / 4]
    }

    /// Number of constants in the pool.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Is the pool empty?
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Combined size of the pool contents in bytes.
    pub fn byte_size(&self) -> usize {
        4 * self.words.len()
    }

    /// The pool contents in insertion order.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Empty the pool for the next procedure.
    pub fn clear(&mut self) {
        self.words.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty() {
        let pool = LiteralPool::new();
        assert_eq!(pool.len(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn insert() {
        let mut pool = LiteralPool::new();
        assert_eq!(pool.intern(7), 0);
        assert_eq!(pool.intern(0xdead_beef), 4);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.byte_size(), 8);
    }

    #[test]
    fn insert_duplicate() {
        let mut pool = LiteralPool::new();
        let a = pool.intern(42);
        pool.intern(43);
        let b = pool.intern(42);
        assert_eq!(a, b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn intern_is_idempotent_over_contents() {
        let mut pool = LiteralPool::new();
        for v in [5u32, 0xffff_ffff, 0, 5, 12] {
            pool.intern(v);
        }
        for k in 0..pool.len() {
            let off = 4 * k as u32;
            assert_eq!(pool.intern(pool.value(off)), off);
        }
    }

    #[test]
    fn clear() {
        let mut pool = LiteralPool::new();
        pool.intern(1);
        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.intern(2), 0);
    }

    #[test]
    #[should_panic(expected = "too many literals")]
    fn overflow_is_fatal() {
        let mut pool = LiteralPool::new();
        for v in 0..=MAX_LITERALS as u32 {
            pool.intern(v);
        }
    }
}
