//! Generator configuration.

/// Memory-protection discipline for code pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtectMode {
    /// Pages are readable, writable and executable for their whole
    /// lifetime. No transitions ever happen.
    ReadWriteExecute,
    /// Pages are writable or executable, never both. Pages are mapped
    /// read-write, and every page written during a procedure is flipped to
    /// read-execute when the procedure is finished (and back to read-write
    /// if emission later resumes on its tail).
    WriteXorExecute,
}

/// Settings controlling the assembler.
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    /// Diagnostic verbosity, 0..=5. At 0 the generator is silent on stderr
    /// (disassembly is still available through `log` at trace level); at 1
    /// virtual instructions are echoed; at 2 the lowered machine
    /// instructions are disassembled; at 5 each finished procedure is also
    /// dumped raw to `<name>.vmdump`.
    pub debug: u8,
    /// Protection discipline for code pages.
    pub protect: ProtectMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: 0,
            protect: ProtectMode::WriteXorExecute,
        }
    }
}
