//! The code buffer: page-sized regions of target memory that machine code
//! is written into directly.
//!
//! The buffer writes through raw pointers without bounds checking; callers
//! guarantee headroom with [`CodeBuffer::has_room`] before emitting (the
//! assembler does this once per virtual instruction, with a fixed safety
//! margin that covers the longest lowering). When a buffer fills up, the
//! assembler seals it with a branch to a freshly allocated page, so a
//! procedure's code appears contiguous to the executing CPU even when it
//! spans several buffers.
//!
//! Pages come from a [`CodeMemory`] provider, which also applies protection
//! transitions and instruction-cache maintenance. The provider for real use
//! lives in the `jolt-jit` crate; tests substitute plain read-write memory.

use crate::fatal;
use crate::settings::ProtectMode;
use core::ptr;

/// Size of each code buffer.
pub const CODEPAGE: usize = 4096;

/// Safety margin kept free at the end of a buffer. Emitting one virtual
/// instruction may produce several machine words; the margin bounds them.
pub const MARGIN: usize = 32;

/// Minimum space guaranteed at the beginning of a procedure, so a prologue
/// never straddles a buffer switch.
pub const MIN_PROC_SPACE: usize = 128;

/// A provider of target code memory.
///
/// `allocate` hands out page-aligned blocks that are at least readable and
/// writable; whether they are born executable depends on the protection
/// mode the provider was configured with. Implementations should place
/// successive blocks near each other so that inter-buffer branches stay
/// within the 24-bit PC-relative range.
pub trait CodeMemory {
    /// Allocate at least `size` bytes of page-aligned memory, rounded up to
    /// whole pages. Returns a null pointer on failure.
    fn allocate(&mut self, size: usize) -> *mut u8;

    /// Make a page readable and writable.
    fn protect_writable(&mut self, base: *mut u8, len: usize);

    /// Make a page readable and executable.
    fn protect_executable(&mut self, base: *mut u8, len: usize);

    /// Synchronize the instruction cache with the data cache over a written
    /// range, on hosts whose caches are not coherent.
    fn flush_icache(&mut self, start: *const u8, end: *const u8);
}

/// A chain of code buffers with a current emission position.
pub struct CodeBuffer<M: CodeMemory> {
    mem: M,
    protect: ProtectMode,
    /// Base of the current buffer; null before the first allocation.
    base: *mut u8,
    /// End of the usable window of the current buffer. Trailing data
    /// reservations move this down.
    limit: *mut u8,
    /// Current emission position.
    pc: *mut u8,
    /// Whether the current page has been handed off as executable.
    sealed: bool,
    /// Pages written since the last seal.
    dirty: Vec<*mut u8>,
    /// Start of the fragment being written.
    frag_start: *mut u8,
    /// Completed (start, end) fragments of the open procedure.
    frags: Vec<(*const u8, *const u8)>,
}

impl<M: CodeMemory> CodeBuffer<M> {
    /// Create a buffer chain backed by `mem`. No memory is allocated until
    /// the first headroom request.
    pub fn new(mem: M, protect: ProtectMode) -> Self {
        Self {
            mem,
            protect,
            base: ptr::null_mut(),
            limit: ptr::null_mut(),
            pc: ptr::null_mut(),
            sealed: false,
            dirty: Vec::new(),
            frag_start: ptr::null_mut(),
            frags: Vec::new(),
        }
    }

    /// The current emission address.
    pub fn pc(&self) -> *mut u8 {
        self.pc
    }

    /// Base address of the current buffer, or null before the first
    /// allocation.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Has a buffer been allocated yet?
    pub fn is_active(&self) -> bool {
        !self.base.is_null()
    }

    /// Direct access to the memory provider.
    pub fn mem_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    /// Can `n` more bytes be written while preserving the safety margin?
    pub fn has_room(&self, n: usize) -> bool {
        !self.base.is_null() && (self.limit as usize - self.pc as usize) >= n + MARGIN
    }

    /// Allocate a fresh buffer page, without switching to it. The caller
    /// seals the old buffer with a chaining branch first.
    pub fn alloc_page(&mut self) -> *mut u8 {
        let p = self.mem.allocate(CODEPAGE);
        if p.is_null() {
            fatal!("out of code memory");
        }
        p
    }

    /// Switch emission to a freshly allocated page.
    pub fn switch_to(&mut self, page: *mut u8) {
        if self.is_active() {
            self.close_fragment();
        }
        self.base = page;
        self.limit = unsafe { page.add(CODEPAGE) };
        self.pc = page;
        self.frag_start = page;
        self.sealed = false;
        self.dirty.push(page);
    }

    /// Reopen the current page for writing after a previous seal, ahead of
    /// emitting more code into its tail.
    pub fn reopen(&mut self) {
        if !self.is_active() || !self.sealed {
            return;
        }
        if self.protect == ProtectMode::WriteXorExecute {
            self.mem.protect_writable(self.base, CODEPAGE);
        }
        self.sealed = false;
        self.dirty.push(self.base);
    }

    /// Hand every page written since the last seal over for execution.
    pub fn seal(&mut self) {
        if self.protect == ProtectMode::WriteXorExecute {
            for &page in &self.dirty {
                self.mem.protect_executable(page, CODEPAGE);
            }
        }
        self.dirty.clear();
        if self.is_active() {
            self.sealed = true;
        }
    }

    /// Contribute a byte to the object code.
    pub fn put1(&mut self, x: u8) {
        unsafe {
            *self.pc = x;
            self.pc = self.pc.add(1);
        }
    }

    /// Contribute a whole little-endian word.
    pub fn put4(&mut self, x: u32) {
        unsafe {
            ptr::copy_nonoverlapping(x.to_le_bytes().as_ptr(), self.pc, 4);
            self.pc = self.pc.add(4);
        }
    }

    /// Contribute a 64-bit little-endian quantity.
    pub fn put8(&mut self, x: u64) {
        unsafe {
            ptr::copy_nonoverlapping(x.to_le_bytes().as_ptr(), self.pc, 8);
            self.pc = self.pc.add(8);
        }
    }

    /// Reserve `n` bytes of `align`-aligned space at the top of the current
    /// buffer window, shrinking the window. The caller must have ensured
    /// `n + align` bytes of headroom.
    pub fn carve(&mut self, n: usize, align: usize) -> *mut u8 {
        assert!(align.is_power_of_two());
        let top = (self.limit as usize - n) & !(align - 1);
        debug_assert!(top >= self.pc as usize);
        self.limit = top as *mut u8;
        self.limit
    }

    /// Begin fragment tracking for a new procedure.
    pub fn start_fragments(&mut self) {
        self.frags.clear();
        self.frag_start = self.pc;
    }

    /// Close the fragment written so far and start a new one.
    pub fn close_fragment(&mut self) {
        if self.frag_start != self.pc {
            self.frags.push((self.frag_start, self.pc));
        }
        self.frag_start = self.pc;
    }

    /// The completed fragments of the open procedure.
    pub fn fragments(&self) -> &[(*const u8, *const u8)] {
        &self.frags
    }

    /// Flush the instruction cache over every completed fragment.
    pub fn flush(&mut self) {
        for &(start, end) in &self.frags {
            self.mem.flush_icache(start, end);
        }
    }
}

/// Read the little-endian word at `p`.
pub(crate) unsafe fn read_word(p: *const u8) -> u32 {
    let mut bytes = [0u8; 4];
    ptr::copy_nonoverlapping(p, bytes.as_mut_ptr(), 4);
    u32::from_le_bytes(bytes)
}

/// Overwrite the little-endian word at `p`.
pub(crate) unsafe fn write_word(p: *mut u8, x: u32) {
    ptr::copy_nonoverlapping(x.to_le_bytes().as_ptr(), p, 4);
}

/// Patch the 24-bit PC-relative displacement of the branch instruction at
/// `site` to reach `target`. The displacement is measured from the branch
/// address plus 8 (the ARM pipeline PC offset) and must be word-aligned and
/// within the signed 24-bit range.
pub(crate) fn patch_branch24(site: *mut u8, target: *const u8) {
    let off = target as i64 - site as i64 - 8;
    if off & 0x3 != 0 {
        fatal!("misaligned branch target {:p} from {:p}", target, site);
    }
    let off = off >> 2;
    if !(-0x0080_0000..0x0080_0000).contains(&off) {
        fatal!("branch offset out of range: {} words", off);
    }
    unsafe {
        let word = read_word(site);
        write_word(site, (word & 0xff00_0000) | (off as u32 & 0x00ff_ffff));
    }
}
