//! Executable memory for generated code.
//!
//! Pages come from anonymous private `mmap`, with each allocation hinted to
//! land right after the previous one so that branches between successive
//! buffers stay within the 24-bit PC-relative range. On 64-bit hosts every
//! allocation must land below 2 GiB, because generated code addresses its
//! own pages through 32-bit registers; `MAP_32BIT` enforces this where it
//! exists, a low placement hint approximates it elsewhere, and an
//! out-of-range allocation is fatal either way.

use jolt_codegen::buffer::CodeMemory;
use jolt_codegen::{fatal, ProtectMode};

use libc::{c_void, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};
use log::{debug, warn};
use std::io::Error;
use std::ptr;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const MAP_FLAGS: libc::c_int = MAP_PRIVATE | MAP_ANON | libc::MAP_32BIT;
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
const MAP_FLAGS: libc::c_int = MAP_PRIVATE | MAP_ANON;

fn initial_hint() -> *mut u8 {
    if cfg!(target_pointer_width = "64") && !cfg!(all(target_os = "linux", target_arch = "x86_64"))
    {
        // No MAP_32BIT on this host; start the advisory placement low.
        0x4000_0000 as *mut u8
    } else {
        ptr::null_mut()
    }
}

/// The system-memory provider backing a JIT assembler.
pub struct JitMemory {
    protect: ProtectMode,
    hint: *mut u8,
    page_size: usize,
}

impl JitMemory {
    /// Create a provider. In [`ProtectMode::ReadWriteExecute`] pages are
    /// mapped RWX up front; in [`ProtectMode::WriteXorExecute`] they are
    /// mapped RW and flipped by the protection callbacks.
    pub fn new(protect: ProtectMode) -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        Self {
            protect,
            hint: initial_hint(),
            page_size,
        }
    }

    fn mprotect(&self, base: *mut u8, len: usize, prot: libc::c_int) {
        let r = unsafe { libc::mprotect(base as *mut c_void, len, prot) };
        if r != 0 {
            fatal!("mprotect failed: {}", Error::last_os_error());
        }
    }
}

impl CodeMemory for JitMemory {
    fn allocate(&mut self, size: usize) -> *mut u8 {
        let size = (size + self.page_size - 1) & !(self.page_size - 1);
        let prot = match self.protect {
            ProtectMode::ReadWriteExecute => PROT_READ | PROT_WRITE | PROT_EXEC,
            ProtectMode::WriteXorExecute => PROT_READ | PROT_WRITE,
        };
        let p = unsafe { libc::mmap(self.hint as *mut c_void, size, prot, MAP_FLAGS, -1, 0) };
        if p == MAP_FAILED {
            warn!("mmap of {} bytes failed: {}", size, Error::last_os_error());
            return ptr::null_mut();
        }
        let p = p as *mut u8;
        #[cfg(target_pointer_width = "64")]
        if (p as usize) >> 31 != 0 {
            fatal!("inaccessible code memory allocated at {:p}", p);
        }
        debug!("allocated {} code bytes at {:p}", size, p);
        self.hint = unsafe { p.add(size) };
        p
    }

    fn protect_writable(&mut self, base: *mut u8, len: usize) {
        self.mprotect(base, len, PROT_READ | PROT_WRITE);
    }

    fn protect_executable(&mut self, base: *mut u8, len: usize) {
        self.mprotect(base, len, PROT_READ | PROT_EXEC);
    }

    fn flush_icache(&mut self, start: *const u8, end: *const u8) {
        flush(start, end);
    }
}

#[cfg(target_arch = "arm")]
fn flush(start: *const u8, end: *const u8) {
    extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    unsafe {
        __clear_cache(start as *mut libc::c_char, end as *mut libc::c_char);
    }
}

/// Instruction and data caches are coherent here; only ARM needs the sweep.
#[cfg(not(target_arch = "arm"))]
fn flush(_start: *const u8, _end: *const u8) {}
