//! A ready-to-run JIT assembler backed by executable system memory.
//!
//! This crate wires the `jolt-codegen` generator to pages obtained from the
//! operating system. The usual entry point is [`JitBuilder`]:
//!
//! ```ignore
//! use jolt_jit::{inst::*, JitBuilder};
//!
//! let mut jit = JitBuilder::new().finish();
//! let entry = jit.begin("add1", 1);
//! jit.emit(Inst::GetArg { rd: vreg(0), index: 0 });
//! jit.emit(Inst::AluRRImm { op: AluOp::Add, rd: vreg(0), rn: vreg(0), imm: 1 });
//! jit.emit(Inst::Mov { rd: ret_reg(), rm: vreg(0) });
//! jit.emit(Inst::Ret);
//! jit.end();
//! // `entry` is now callable as extern "C" fn(i32) -> i32 on the target.
//! ```
//!
//! Generated code targets ARMv7 with VFP; building and inspecting it works
//! on any host, executing it only on the target.

pub use jolt_codegen::{code_addr, inst, Assembler, Label, ProtectMode, Settings};

pub mod memory;
pub use crate::memory::JitMemory;

/// An assembler emitting into executable system memory.
pub type Jit = Assembler<JitMemory>;

/// Builds a [`Jit`] from settings.
#[derive(Default)]
pub struct JitBuilder {
    settings: Settings,
}

impl JitBuilder {
    /// Start from the default settings: silent, write-xor-execute pages.
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
        }
    }

    /// Set the diagnostic level (0..=5).
    pub fn debug(mut self, level: u8) -> Self {
        self.settings.debug = level;
        self
    }

    /// Set the page-protection discipline.
    pub fn protect(mut self, mode: ProtectMode) -> Self {
        self.settings.protect = mode;
        self
    }

    /// Build the assembler.
    pub fn finish(self) -> Jit {
        Assembler::new(JitMemory::new(self.settings.protect), self.settings)
    }
}

/// Map a native function pointer to a 32-bit address callable from
/// generated code, for use as a [`CallDest::Addr`](inst::CallDest::Addr).
///
/// On 32-bit targets this is the identity. On 64-bit hosts a native
/// function sits outside the 32-bit code space and would need a trampoline,
/// which is the concern of an external collaborator; without one the call
/// is fatal.
pub fn wrap(f: *const u8) -> i32 {
    code_addr(f)
}
