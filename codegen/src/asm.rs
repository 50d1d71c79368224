//! The assembler: procedure lifecycle, labels, and framing.
//!
//! An [`Assembler`] bundles all generator state (the emission position, the
//! open procedure, the label table, the literal pool and the argument
//! counter) into one aggregate, so independent assemblers can coexist, one
//! per thread or one per test.

use crate::buffer::{patch_branch24, write_word, CodeBuffer, CodeMemory, MIN_PROC_SPACE};
use crate::fatal;
use crate::inst::emit::{ops, reg_bit, reg_range};
use crate::inst::{fp_reg, ip_reg, lp_reg, lr_reg, pc_reg, sp_reg, Inst};
use crate::pool::LiteralPool;
use crate::settings::Settings;

use core::fmt;
use core::ptr;
use log::{trace, warn};
use smallvec::SmallVec;

/// Convert a pointer into the 32-bit address space of generated code, for
/// use as a [`CallDest::Addr`](crate::inst::CallDest::Addr) or
/// [`Ldkw`](crate::inst::Inst::Ldkw) operand. Fatal if the pointer does not
/// fit; the code-memory allocator guarantees its own pages always do.
pub fn code_addr(p: *const u8) -> i32 {
    let a = p as usize;
    if a as u32 as usize != a {
        fatal!("address {:p} does not fit in 32 bits", p);
    }
    a as u32 as i32
}

/// A label: a forward-referenceable position in the emitted code.
///
/// Labels are allocated with [`Assembler::new_label`], branched to from any
/// number of sites, and bound to the current position with
/// [`Assembler::bind`]. Every label referenced by a branch must be bound
/// before [`Assembler::end`]; no label survives the procedure it was
/// created in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(u32);

impl Label {
    /// The index of this label in the procedure's label table.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// The kind of patch a pending branch site needs. ARM32 branches all carry
/// their displacement in the low 24 bits.
#[derive(Clone, Copy, Debug)]
pub(crate) enum LabelUse {
    Branch24,
}

#[derive(Default)]
struct LabelData {
    addr: Option<*mut u8>,
    pending: SmallVec<[(*mut u8, LabelUse); 4]>,
}

struct Procedure {
    name: String,
    pool_loc: *mut u8,
}

/// The code generator.
///
/// At most one procedure is open at a time between [`begin`](Self::begin)
/// and [`end`](Self::end); virtual instructions are emitted into it with
/// [`emit`](Self::emit). The address returned by `begin` becomes callable
/// once `end` has emitted the literal pool, resolved all labels, flushed
/// caches and applied the protection transition.
pub struct Assembler<M: CodeMemory> {
    pub(crate) buf: CodeBuffer<M>,
    pub(crate) settings: Settings,
    pub(crate) pool: LiteralPool,
    pub(crate) argp: u8,
    labels: Vec<LabelData>,
    open: Option<Procedure>,
    proc_beg: *mut u8,
}

impl<M: CodeMemory> Assembler<M> {
    /// Create an assembler emitting through `mem`.
    pub fn new(mem: M, settings: Settings) -> Self {
        Self {
            buf: CodeBuffer::new(mem, settings.protect),
            settings,
            pool: LiteralPool::new(),
            argp: 0,
            labels: Vec::new(),
            open: None,
            proc_beg: ptr::null_mut(),
        }
    }

    /// The current emission address.
    pub fn pc(&self) -> *mut u8 {
        self.buf.pc()
    }

    /// The generator settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Change the diagnostic level (0..=5) for subsequent emission.
    pub fn set_debug(&mut self, level: u8) {
        self.settings.debug = level;
    }

    /// Begin a procedure taking `nargs` register arguments, returning its
    /// entry address. The entry is not callable until [`end`](Self::end).
    pub fn begin(&mut self, name: &str, nargs: u32) -> *const u8 {
        self.begin_with_locals(name, nargs, 0)
    }

    /// Like [`begin`](Self::begin), with space for `locals` bytes of
    /// procedure-local stack. The parameter is validated and reserved for
    /// frame layouts that consume it; the frame emitted for this target
    /// does not allocate local stack space.
    pub fn begin_with_locals(&mut self, name: &str, nargs: u32, locals: u32) -> *const u8 {
        if let Some(open) = &self.open {
            fatal!("begin {:?}: procedure {:?} is still open", name, open.name);
        }
        if nargs > 4 {
            fatal!("begin {:?}: too many arguments ({})", name, nargs);
        }
        if locals % 4 != 0 {
            fatal!("begin {:?}: locals size {} is not a word multiple", name, locals);
        }
        trace!(target: "jolt::vcode", "begin {:?} nargs={}", name, nargs);

        self.buf.reopen();
        self.space(MIN_PROC_SPACE);
        self.buf.start_fragments();
        self.pool.clear();
        self.argp = 0;
        self.proc_beg = self.buf.pc();

        // The pool header: one word, back-patched at `end` with the
        // absolute address of the literal pool.
        let pool_loc = self.buf.pc();
        self.buf.put4(0);

        let entry = self.buf.pc();
        self.move_reg(ip_reg(), sp_reg());
        self.ldstm(
            ops::STMFDW,
            sp_reg(),
            reg_range(4, 10) | reg_bit(fp_reg()) | reg_bit(ip_reg()) | reg_bit(lr_reg()),
        );
        self.move_reg(fp_reg(), sp_reg());

        // Load the pool base into LP from the header slot.
        let disp = pool_loc as i64 - (self.buf.pc() as i64 + 8);
        self.load_store(ops::LDR, lp_reg(), pc_reg(), disp as i32);

        self.open = Some(Procedure {
            name: name.to_string(),
            pool_loc,
        });
        entry as *const u8
    }

    /// Finish the open procedure: emit the literal pool, back-patch the
    /// pool header, check that every label is resolved, flush the
    /// instruction cache over everything written, and hand the pages over
    /// for execution.
    pub fn end(&mut self) {
        let proc = match self.open.take() {
            Some(p) => p,
            None => fatal!("end without an open procedure"),
        };

        // Emit the literal pool and point the header at it.
        self.space(self.pool.byte_size());
        unsafe { write_word(proc.pool_loc, self.buf.pc() as usize as u32) };
        for i in 0..self.pool.len() {
            let w = self.pool.words()[i];
            self.buf.put4(w);
        }

        for (i, lab) in self.labels.iter().enumerate() {
            if !lab.pending.is_empty() {
                fatal!(
                    "end {:?}: label L{} has {} unresolved branch(es)",
                    proc.name,
                    i,
                    lab.pending.len()
                );
            }
        }
        self.labels.clear();
        self.buf.close_fragment();

        if self.settings.debug >= 5 {
            self.dump(&proc.name);
        }
        self.buf.flush();
        self.buf.seal();
        self.pool.clear();
        self.argp = 0;
        trace!(target: "jolt::vcode", "end {:?} ({} bytes)", proc.name, self.proc_size());
    }

    /// Allocate a fresh unbound label.
    pub fn new_label(&mut self) -> Label {
        let i = self.labels.len() as u32;
        self.labels.push(LabelData::default());
        Label(i)
    }

    /// Bind `label` to the current emission position, patching every branch
    /// already waiting on it. A label may be bound once.
    pub fn bind(&mut self, label: Label) {
        if label.index() >= self.labels.len() {
            fatal!("bind of unknown label {}", label);
        }
        let target = self.buf.pc();
        let data = &mut self.labels[label.index()];
        if data.addr.is_some() {
            fatal!("label {} bound twice", label);
        }
        data.addr = Some(target);
        for (site, kind) in data.pending.drain(..) {
            match kind {
                LabelUse::Branch24 => patch_branch24(site, target),
            }
        }
        self.dis(|| format!("{}:", label));
    }

    /// Record that the branch at `site` targets `label`: patch immediately
    /// if the label is bound, otherwise queue the site on the label.
    pub(crate) fn use_label(&mut self, site: *mut u8, label: Label) {
        if label.index() >= self.labels.len() {
            fatal!("branch to unknown label {}", label);
        }
        let data = &mut self.labels[label.index()];
        match data.addr {
            Some(target) => patch_branch24(site, target),
            None => data.pending.push((site, LabelUse::Branch24)),
        }
    }

    /// Emit one virtual instruction.
    pub fn emit(&mut self, inst: Inst) {
        trace!(target: "jolt::vcode", "gen {:?}", inst);
        if self.settings.debug >= 1 {
            eprintln!("--- {:?}", inst);
        }
        self.space(0);
        self.emit_inst(inst);
    }

    /// Ensure headroom for `n` more bytes, chaining to a new buffer when
    /// the current one is too full.
    pub(crate) fn space(&mut self, n: usize) {
        if self.buf.has_room(n) {
            return;
        }
        let page = self.buf.alloc_page();
        if self.buf.is_active() {
            self.chain_to(page);
        }
        self.buf.switch_to(page);
    }

    /// Allocate `size` bytes of memory compatible with the code heap, for
    /// client use (e.g. data reachable from generated code).
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let p = self.buf.mem_mut().allocate(size);
        if p.is_null() {
            fatal!("out of memory allocating {} bytes", size);
        }
        p
    }

    /// Reserve `n` bytes of `align`-aligned data space at the top of the
    /// current buffer window.
    pub fn alloc_data(&mut self, n: usize, align: usize) -> *mut u8 {
        self.space(n + align);
        self.buf.carve(n, align)
    }

    /// Size in bytes of the procedure being emitted (or, after `end`, of
    /// the last one, including its literal pool).
    pub fn proc_size(&self) -> usize {
        if self.proc_beg.is_null() {
            return 0;
        }
        self.buf.pc() as usize - self.proc_beg as usize
    }

    /// Emit a disassembly line for one machine instruction. The line is
    /// only formatted when someone is listening.
    pub(crate) fn dis<F: FnOnce() -> String>(&self, line: F) {
        let trace_on = log::log_enabled!(target: "jolt::disasm", log::Level::Trace);
        if self.settings.debug >= 2 || trace_on {
            let line = line();
            if trace_on {
                trace!(target: "jolt::disasm", "{}", line);
            }
            if self.settings.debug >= 2 {
                eprintln!("\t{}", line);
            }
        }
    }

    /// Write the raw bytes of the finished procedure to `<name>.vmdump`.
    /// Only single-buffer procedures can be dumped; the fragments of a
    /// chained procedure are not contiguous.
    fn dump(&self, name: &str) {
        let frags = self.buf.fragments();
        if frags.len() != 1 {
            warn!("not dumping {}: procedure spans {} buffers", name, frags.len());
            return;
        }
        let (start, end) = frags[0];
        let bytes = unsafe { core::slice::from_raw_parts(start, end as usize - start as usize) };
        let path = format!("{}.vmdump", name);
        if let Err(e) = std::fs::write(&path, bytes) {
            warn!("cannot write {}: {}", path, e);
        }
    }
}
