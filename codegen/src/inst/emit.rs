//! 32-bit ARM ISA: binary code emission.
//!
//! The machine instruction layout, per the ARM architecture reference
//! manual:
//!
//! ```text
//!     [31..28] Condition
//!     [27..20] Opcode
//!     [19..16] Rn or third opcode
//!     [15..12] Rd
//!     [11..8]  Rs or coprocessor number
//!     [7..4]   Second opcode
//!     [3..0]   Rm
//! ```
//!
//! Every emitter contributes exactly one 32-bit word; the lowering of a
//! virtual instruction strings together however many it needs. Emitters
//! take already-validated register numbers and immediates and do not
//! re-range-check them.

use crate::asm::{Assembler, Label};
use crate::buffer::{patch_branch24, CodeMemory};
use crate::fatal;
use crate::inst::{
    arg_reg, fits_imm8, fp_reg, ip_reg, lp_reg, pc_reg, sp_reg, AluOp, CallDest, Cond, FpuOp,
    Inst, MemOp, Reg, UnaryOp,
};

/// A machine opcode: base encoding bits plus the mnemonic for the
/// disassembly log. The mnemonic is always present; release builds simply
/// never format it.
#[derive(Clone, Copy)]
pub(crate) struct MachOp {
    pub mnem: &'static str,
    pub bits: u32,
}

impl MachOp {
    pub(crate) const fn new(mnem: &'static str, bits: u32) -> Self {
        Self { mnem, bits }
    }

    /// This opcode with an extra encoding bit set (e.g. the U bit).
    pub(crate) const fn with(self, bit: u32) -> Self {
        Self {
            mnem: self.mnem,
            bits: self.bits | bit,
        }
    }
}

// Encoding bits shared by several instruction shapes.
const IMMED: u32 = 0x20 << 20; // immediate operand form
const RSHIFT: u32 = 1 << 4; // shift amount in Rs
pub(crate) const UBIT: u32 = 0x08 << 20; // add the offset
const DBIT: u32 = 0x04 << 20; // odd FP register (upper half of a pair)
const RRBIT: u32 = 0x20 << 20; // register-offset load/store
const IBIT: u32 = 0x04 << 20; // immediate form of extra load/store

pub(crate) mod ops {
    //! The machine opcodes used by the lowerings.

    use super::MachOp;
    use crate::inst::Cond;

    // ALU primary opcodes; CMP/CMN include the S bit.
    const ALU_AND: u32 = 0;
    const ALU_EOR: u32 = 2;
    const ALU_SUB: u32 = 4;
    const ALU_RSB: u32 = 6;
    const ALU_ADD: u32 = 8;
    const ALU_CMP: u32 = 21;
    const ALU_CMN: u32 = 23;
    const ALU_ORR: u32 = 24;
    const ALU_MOV: u32 = 26;
    const ALU_MVN: u32 = 30;

    // Coprocessor numbers for VFP.
    const CP_SGL: u32 = 10;
    const CP_DBL: u32 = 11;

    const fn opcode(cond: Cond, op: u32, op2: u32, op3: u32, cp: u32) -> u32 {
        (cond as u32) << 28 | op << 20 | op2 << 4 | op3 << 16 | cp << 8
    }

    // Ordinary operations with 1, 2, 3 opcode fields.
    const fn opn(x: u32) -> u32 {
        opcode(Cond::Al, x, 0, 0, 0)
    }
    const fn opn2(x: u32, y: u32) -> u32 {
        opcode(Cond::Al, x, y, 0, 0)
    }
    const fn opn3(x: u32, y: u32, z: u32) -> u32 {
        opcode(Cond::Al, x, y, z, 0)
    }

    // Conditional version of `opn`.
    const fn opnc(cond: Cond, x: u32) -> u32 {
        opcode(cond, x, 0, 0, 0)
    }

    // Floating point operations.
    const fn opf(x: u32, cp: u32) -> u32 {
        opcode(Cond::Al, x, 0, 0, cp)
    }
    const fn opf2(x: u32, y: u32, cp: u32) -> u32 {
        opcode(Cond::Al, x, y, 0, cp)
    }
    const fn opf3(x: u32, y: u32, z: u32, cp: u32) -> u32 {
        opcode(Cond::Al, x, y, z, cp)
    }

    pub(crate) const ADD: MachOp = MachOp::new("add", opn(ALU_ADD));
    pub(crate) const AND: MachOp = MachOp::new("and", opn(ALU_AND));
    pub(crate) const ASR: MachOp = MachOp::new("asr", opn2(ALU_MOV, 0x4));
    pub(crate) const B: MachOp = MachOp::new("b", opnc(Cond::Al, 0xa0));
    pub(crate) const BEQ: MachOp = MachOp::new("beq", opnc(Cond::Eq, 0xa0));
    pub(crate) const BGE: MachOp = MachOp::new("bge", opnc(Cond::Ge, 0xa0));
    pub(crate) const BGT: MachOp = MachOp::new("bgt", opnc(Cond::Gt, 0xa0));
    pub(crate) const BHI: MachOp = MachOp::new("bhi", opnc(Cond::Hi, 0xa0));
    pub(crate) const BHS: MachOp = MachOp::new("bhs", opnc(Cond::Hs, 0xa0));
    pub(crate) const BLE: MachOp = MachOp::new("ble", opnc(Cond::Le, 0xa0));
    pub(crate) const BLO: MachOp = MachOp::new("blo", opnc(Cond::Lo, 0xa0));
    pub(crate) const BLS: MachOp = MachOp::new("bls", opnc(Cond::Ls, 0xa0));
    pub(crate) const BLT: MachOp = MachOp::new("blt", opnc(Cond::Lt, 0xa0));
    pub(crate) const BNE: MachOp = MachOp::new("bne", opnc(Cond::Ne, 0xa0));
    pub(crate) const BLX: MachOp = MachOp::new("blx", opn2(0x12, 0x3));
    pub(crate) const BX: MachOp = MachOp::new("bx", opn2(0x12, 0x1));
    pub(crate) const CMN: MachOp = MachOp::new("cmn", opn(ALU_CMN));
    pub(crate) const CMP: MachOp = MachOp::new("cmp", opn(ALU_CMP));
    pub(crate) const EOR: MachOp = MachOp::new("eor", opn(ALU_EOR));
    pub(crate) const FADDD: MachOp = MachOp::new("faddd", opf2(0xe3, 0x0, CP_DBL));
    pub(crate) const FADDS: MachOp = MachOp::new("fadds", opf2(0xe3, 0x0, CP_SGL));
    pub(crate) const FCMPD: MachOp = MachOp::new("fcmpd", opf3(0xeb, 0x4, 0x4, CP_DBL));
    pub(crate) const FCMPS: MachOp = MachOp::new("fcmps", opf3(0xeb, 0x4, 0x4, CP_SGL));
    pub(crate) const FCVTDS: MachOp = MachOp::new("fcvtds", opf3(0xeb, 0xc, 0x7, CP_SGL));
    pub(crate) const FCVTSD: MachOp = MachOp::new("fcvtsd", opf3(0xeb, 0xc, 0x7, CP_DBL));
    pub(crate) const FDIVD: MachOp = MachOp::new("fdivd", opf(0xe8, CP_DBL));
    pub(crate) const FDIVS: MachOp = MachOp::new("fdivs", opf(0xe8, CP_SGL));
    pub(crate) const FLDS: MachOp = MachOp::new("flds", opf(0xd1, CP_SGL));
    pub(crate) const FMOVD: MachOp = MachOp::new("fmovd", opf3(0xeb, 0x4, 0, CP_DBL));
    pub(crate) const FMRS: MachOp = MachOp::new("fmrs", opf2(0xe1, 0x1, CP_SGL));
    pub(crate) const FMSR: MachOp = MachOp::new("fmsr", opf2(0xe0, 0x1, CP_SGL));
    pub(crate) const FMSTAT: MachOp = MachOp::new("fmstat", opf3(0xef, 0x1, 0x1, CP_SGL));
    pub(crate) const FMULD: MachOp = MachOp::new("fmuld", opf(0xe2, CP_DBL));
    pub(crate) const FMULS: MachOp = MachOp::new("fmuls", opf(0xe2, CP_SGL));
    pub(crate) const FNEGD: MachOp = MachOp::new("fnegd", opf3(0xeb, 0x4, 0x1, CP_DBL));
    pub(crate) const FNEGS: MachOp = MachOp::new("fnegs", opf3(0xeb, 0x4, 0x1, CP_SGL));
    pub(crate) const FSITOD: MachOp = MachOp::new("fsitod", opf3(0xeb, 0xc, 0x8, CP_DBL));
    pub(crate) const FSITOS: MachOp = MachOp::new("fsitos", opf3(0xeb, 0xc, 0x8, CP_SGL));
    pub(crate) const FSTS: MachOp = MachOp::new("fsts", opf(0xd0, CP_SGL));
    pub(crate) const FSUBD: MachOp = MachOp::new("fsubd", opf2(0xe3, 0x4, CP_DBL));
    pub(crate) const FSUBS: MachOp = MachOp::new("fsubs", opf2(0xe3, 0x4, CP_SGL));
    pub(crate) const LDMFD: MachOp = MachOp::new("ldmfd", opn(0x89));
    pub(crate) const LDR: MachOp = MachOp::new("ldr", opn(0x51));
    pub(crate) const LDRB: MachOp = MachOp::new("ldrb", opn(0x55));
    pub(crate) const LDRH: MachOp = MachOp::new("ldrh", opn2(0x11, 0xb));
    pub(crate) const LDSB: MachOp = MachOp::new("ldsb", opn2(0x11, 0xd));
    pub(crate) const LDSH: MachOp = MachOp::new("ldsh", opn2(0x11, 0xf));
    pub(crate) const LSL: MachOp = MachOp::new("lsl", opn2(ALU_MOV, 0x0));
    pub(crate) const LSR: MachOp = MachOp::new("lsr", opn2(ALU_MOV, 0x2));
    pub(crate) const MOV: MachOp = MachOp::new("mov", opn(ALU_MOV));
    pub(crate) const MOVEQ: MachOp = MachOp::new("moveq", opnc(Cond::Eq, ALU_MOV));
    pub(crate) const MOVGE: MachOp = MachOp::new("movge", opnc(Cond::Ge, ALU_MOV));
    pub(crate) const MOVGT: MachOp = MachOp::new("movgt", opnc(Cond::Gt, ALU_MOV));
    pub(crate) const MOVHI: MachOp = MachOp::new("movhi", opnc(Cond::Hi, ALU_MOV));
    pub(crate) const MOVHS: MachOp = MachOp::new("movhs", opnc(Cond::Hs, ALU_MOV));
    pub(crate) const MOVLE: MachOp = MachOp::new("movle", opnc(Cond::Le, ALU_MOV));
    pub(crate) const MOVLO: MachOp = MachOp::new("movlo", opnc(Cond::Lo, ALU_MOV));
    pub(crate) const MOVLS: MachOp = MachOp::new("movls", opnc(Cond::Ls, ALU_MOV));
    pub(crate) const MOVLT: MachOp = MachOp::new("movlt", opnc(Cond::Lt, ALU_MOV));
    pub(crate) const MOVNE: MachOp = MachOp::new("movne", opnc(Cond::Ne, ALU_MOV));
    pub(crate) const MUL: MachOp = MachOp::new("mul", opn2(0x00, 0x9));
    pub(crate) const MVN: MachOp = MachOp::new("mvn", opn(ALU_MVN));
    pub(crate) const ORR: MachOp = MachOp::new("orr", opn(ALU_ORR));
    pub(crate) const ROR: MachOp = MachOp::new("ror", opn2(ALU_MOV, 0x6));
    pub(crate) const RSB: MachOp = MachOp::new("rsb", opn(ALU_RSB));
    pub(crate) const STMFDW: MachOp = MachOp::new("stmfd!", opn(0x92));
    pub(crate) const STR: MachOp = MachOp::new("str", opn(0x50));
    pub(crate) const STRB: MachOp = MachOp::new("strb", opn(0x54));
    pub(crate) const STRH: MachOp = MachOp::new("strh", opn2(0x10, 0xb));
    pub(crate) const SUB: MachOp = MachOp::new("sub", opn(ALU_SUB));
    pub(crate) const SXTH: MachOp = MachOp::new("sxth", opn3(0x6b, 0x7, 0xf));
    pub(crate) const UXTB: MachOp = MachOp::new("uxtb", opn3(0x6e, 0x7, 0xf));
}

//=============================================================================
// Word building

fn instr(op: u32, rd: u32, rn: u32, low: u32) -> u32 {
    op | rn << 16 | rd << 12 | low
}

fn instr4(op: u32, rd: u32, rn: u32, rm: u32, rs: u32) -> u32 {
    instr(op, rd, rn, rm | rs << 8)
}

fn rbits(r: Reg) -> u32 {
    (r.num() & 0xf) as u32
}

fn immed(imm: i32) -> u32 {
    (imm as u32) & 0xff
}

fn imm12(imm: i32) -> u32 {
    (imm as u32) & 0xfff
}

fn shift_amt(c: i32) -> u32 {
    ((c as u32) & 0x1f) << 7
}

// Split an 8-bit offset into the halves an extra load/store wants.
fn offx(n: i32) -> u32 {
    let n = n as u32;
    ((n & 0xf0) << 4) | (n & 0xf)
}

/// The bit for `r` in a multi-register transfer bitmap.
pub(crate) fn reg_bit(r: Reg) -> u32 {
    1 << r.num()
}

/// The bits for registers `lo..=hi` in a multi-register transfer bitmap.
pub(crate) fn reg_range(lo: u8, hi: u8) -> u32 {
    (!0u32 << lo) & !(!0u32 << (hi + 1)) & 0xffff
}

fn fmt_addr(rn: Reg, off: i32, op: MachOp) -> String {
    if off == 0 {
        format!("[{}]", rn)
    } else if op.bits & UBIT != 0 {
        format!("[{}, #{}]", rn, off)
    } else {
        format!("[{}, #-{}]", rn, off)
    }
}

fn mov_cc(cond: Cond) -> MachOp {
    match cond {
        Cond::Eq => ops::MOVEQ,
        Cond::Ne => ops::MOVNE,
        Cond::Ge => ops::MOVGE,
        Cond::Gt => ops::MOVGT,
        Cond::Le => ops::MOVLE,
        Cond::Lt => ops::MOVLT,
        Cond::Hs => ops::MOVHS,
        Cond::Hi => ops::MOVHI,
        Cond::Ls => ops::MOVLS,
        Cond::Lo => ops::MOVLO,
        _ => fatal!("no conditional move for {:?}", cond),
    }
}

fn b_cc(cond: Cond) -> MachOp {
    match cond {
        Cond::Eq => ops::BEQ,
        Cond::Ne => ops::BNE,
        Cond::Ge => ops::BGE,
        Cond::Gt => ops::BGT,
        Cond::Le => ops::BLE,
        Cond::Lt => ops::BLT,
        Cond::Hs => ops::BHS,
        Cond::Hi => ops::BHI,
        Cond::Ls => ops::BLS,
        Cond::Lo => ops::BLO,
        _ => fatal!("no conditional branch for {:?}", cond),
    }
}

/// Do the operands of `inst` respect register class discipline?
fn class_ok(inst: &Inst) -> bool {
    let int = |r: Reg| !r.is_float() && !r.is_none();
    let flt = |r: Reg| r.is_float();
    let base = |r: Reg| !r.is_float();
    let data = |kind: MemOp, r: Reg| match kind {
        MemOp::Word => !r.is_none(),
        MemOp::HalfS | MemOp::HalfU | MemOp::ByteS | MemOp::ByteU => int(r),
        MemOp::Dbl => flt(r),
    };
    match *inst {
        Inst::Ret | Inst::Jump { .. } | Inst::Prep { .. } | Inst::Mov { .. } => true,
        Inst::JumpInd { rm } => int(rm),
        Inst::Call {
            dest: CallDest::Reg(r),
        } => int(r),
        Inst::Call { .. } => true,
        Inst::Arg { rn } => int(rn),
        Inst::GetArg { rd, .. } => int(rd),
        Inst::MovImm { rd, .. } => int(rd),
        Inst::Ldkw { rd, .. } => !rd.is_none(),
        Inst::ZeroF { rd } | Inst::ZeroD { rd } => flt(rd),
        Inst::Unary { op, rd, rm } => match op {
            UnaryOp::Neg | UnaryOp::Not | UnaryOp::ConvIC | UnaryOp::ConvIS => int(rd) && int(rm),
            UnaryOp::NegF | UnaryOp::NegD | UnaryOp::ConvFD | UnaryOp::ConvDF => {
                flt(rd) && flt(rm)
            }
            UnaryOp::ConvIF | UnaryOp::ConvID => flt(rd) && int(rm),
        },
        Inst::AluRRR { rd, rn, rm, .. } => int(rd) && int(rn) && int(rm),
        Inst::AluRRImm { rd, rn, .. } => int(rd) && int(rn),
        Inst::FpuRRR { rd, rn, rm, .. } => flt(rd) && flt(rn) && flt(rm),
        Inst::Cmp { rd, rn, rm, .. } => int(rd) && int(rn) && int(rm),
        Inst::CmpImm { rd, rn, .. } => int(rd) && int(rn),
        Inst::CmpF { rd, rn, rm, .. } | Inst::CmpD { rd, rn, rm, .. } => {
            int(rd) && flt(rn) && flt(rm)
        }
        Inst::CondBr { rn, rm, .. } => int(rn) && int(rm),
        Inst::CondBrImm { rn, .. } => int(rn),
        Inst::CondBrF { rn, rm, .. } | Inst::CondBrD { rn, rm, .. } => flt(rn) && flt(rm),
        Inst::Load {
            kind, rd, base: b, ..
        } => base(b) && data(kind, rd),
        Inst::Store {
            kind, rs, base: b, ..
        } => base(b) && data(kind, rs),
    }
}

//=============================================================================
// One-word emitters

impl<M: CodeMemory> Assembler<M> {
    fn word(&mut self, w: u32) {
        self.buf.put4(w);
    }

    // rd := rn op rm
    fn op_rrr(&mut self, op: MachOp, rd: Reg, rn: Reg, rm: Reg) {
        self.dis(|| format!("{} {}, {}, {}", op.mnem, rd, rn, rm));
        self.word(instr(op.bits, rbits(rd), rbits(rn), rbits(rm)));
    }

    // Multiply rn := rm * rs
    fn op_mul(&mut self, op: MachOp, rn: Reg, rm: Reg, rs: Reg) {
        self.dis(|| format!("{} {}, {}, {}", op.mnem, rn, rm, rs));
        self.word(instr4(op.bits, 0, rbits(rn), rbits(rm), rbits(rs)));
    }

    // rd := rn op imm with 8-bit immediate
    fn op_rri(&mut self, op: MachOp, rd: Reg, rn: Reg, imm: i32) {
        self.dis(|| format!("{} {}, {}, #{}", op.mnem, rd, rn, imm));
        self.word(instr(op.bits | IMMED, rbits(rd), rbits(rn), immed(imm)));
    }

    // rd := rm shift rs
    fn shift_r(&mut self, op: MachOp, rd: Reg, rm: Reg, rs: Reg) {
        self.dis(|| format!("mov {}, {}, {} {}", rd, rm, op.mnem, rs));
        self.word(instr4(op.bits | RSHIFT, rbits(rd), 0, rbits(rm), rbits(rs)));
    }

    // rd := rm shift c
    fn shift_i(&mut self, op: MachOp, rd: Reg, rm: Reg, c: i32) {
        self.dis(|| format!("mov {}, {}, {} #{}", rd, rm, op.mnem, c));
        self.word(instr(op.bits, rbits(rd), 0, rbits(rm) | shift_amt(c)));
    }

    // rd := op rm
    fn op_rr(&mut self, op: MachOp, rd: Reg, rm: Reg) {
        self.dis(|| format!("{} {}, {}", op.mnem, rd, rm));
        self.word(instr(op.bits, rbits(rd), 0, rbits(rm)));
    }

    fn cmp_r(&mut self, op: MachOp, rn: Reg, rm: Reg) {
        self.dis(|| format!("{} {}, {}", op.mnem, rn, rm));
        self.word(instr(op.bits, 0, rbits(rn), rbits(rm)));
    }

    fn cmp_i(&mut self, op: MachOp, rn: Reg, imm: i32) {
        self.dis(|| format!("{} {}, #{}", op.mnem, rn, imm));
        self.word(instr(op.bits | IMMED, 0, rbits(rn), immed(imm)));
    }

    fn op_ri(&mut self, op: MachOp, rd: Reg, imm: i32) {
        self.dis(|| format!("{} {}, #{}", op.mnem, rd, imm));
        self.word(instr(op.bits | IMMED, rbits(rd), 0, immed(imm)));
    }

    // rd :=: mem[rn +/- off] -- the opcode carries the U bit for addition
    fn ldst_ri(&mut self, op: MachOp, rd: Reg, rn: Reg, off: i32) {
        self.dis(|| format!("{} {}, {}", op.mnem, rd, fmt_addr(rn, off, op)));
        self.word(instr(op.bits, rbits(rd), rbits(rn), imm12(off)));
    }

    // rd :=: mem[rn + rm]
    fn ldst_rr(&mut self, op: MachOp, rd: Reg, rn: Reg, rm: Reg) {
        self.dis(|| format!("{} {}, [{}, {}]", op.mnem, rd, rn, rm));
        self.word(instr(op.bits | RRBIT | UBIT, rbits(rd), rbits(rn), rbits(rm)));
    }

    // Indexed halfword / signed-byte forms with the split 8-bit offset.
    fn ldstx_ri(&mut self, op: MachOp, rd: Reg, rn: Reg, off: i32) {
        self.dis(|| format!("{} {}, {}", op.mnem, rd, fmt_addr(rn, off, op)));
        self.word(instr(op.bits | IBIT, rbits(rd), rbits(rn), offx(off)));
    }

    fn ldstx_rr(&mut self, op: MachOp, rd: Reg, rn: Reg, rm: Reg) {
        self.dis(|| format!("{} {}, [{}, {}]", op.mnem, rd, rn, rm));
        self.word(instr(op.bits | UBIT, rbits(rd), rbits(rn), rbits(rm)));
    }

    // VFP load/store with a word offset; DBIT selects the odd register of
    // the pair.
    fn ldst_f(&mut self, op: MachOp, rd: Reg, rn: Reg, woff: i32) {
        self.dis(|| {
            let reg = if op.bits & DBIT != 0 {
                format!("s{}", 2 * rd.num() + 1)
            } else {
                rd.to_string()
            };
            format!("{} {}, {}", op.mnem, reg, fmt_addr(rn, woff * 4, op))
        });
        self.word(instr(op.bits, rbits(rd), rbits(rn), immed(woff)));
    }

    // Save and restore
    pub(crate) fn ldstm(&mut self, op: MachOp, rn: Reg, bits: u32) {
        self.dis(|| format!("{} {}, #{:#x}", op.mnem, rn, bits));
        self.word(instr(op.bits, 0, rbits(rn), bits & 0xffff));
    }

    fn branch_i(&mut self, op: MachOp, dest: i32) {
        self.dis(|| format!("{} {}", op.mnem, dest));
        self.word(instr(op.bits, 0, 0, (dest as u32) & 0x00ff_ffff));
    }

    fn jump_r(&mut self, op: MachOp, rm: Reg) {
        self.dis(|| format!("{} {}", op.mnem, rm));
        self.word(instr4(op.bits, 0xf, 0xf, rbits(rm), 0xf));
    }

    // Copy the VFP status flags into the integer condition register.
    fn fmstat(&mut self) {
        self.dis(|| ops::FMSTAT.mnem.to_string());
        self.word(instr(ops::FMSTAT.bits, 0xf, 0, 0));
    }

    // fd := bits of rs
    fn fmsr(&mut self, fd: Reg, rs: Reg) {
        self.dis(|| format!("{} {}, {}", ops::FMSR.mnem, fd, rs));
        self.word(instr(ops::FMSR.bits, rbits(rs), rbits(fd), 0));
    }

    // rd := bits of fs
    fn fmrs(&mut self, rd: Reg, fs: Reg) {
        self.dis(|| format!("{} {}, {}", ops::FMRS.mnem, rd, fs));
        self.word(instr(ops::FMRS.bits, rbits(rd), rbits(fs), 0));
    }
}

//=============================================================================
// Lowering

impl<M: CodeMemory> Assembler<M> {
    /// Move a small immediate, or the complement of one, into `rd`;
    /// anything else comes from the literal pool.
    pub(crate) fn move_imm(&mut self, rd: Reg, imm: i32) {
        if fits_imm8(imm) {
            self.op_ri(ops::MOV, rd, imm);
        } else if fits_imm8(!imm) {
            self.op_ri(ops::MVN, rd, !imm);
        } else {
            self.load_reg(rd, imm);
        }
    }

    /// Materialize `imm` in the scratch register.
    fn const_reg(&mut self, imm: i32) -> Reg {
        self.move_imm(ip_reg(), imm);
        ip_reg()
    }

    fn compare_imm(&mut self, rn: Reg, imm: i32) {
        if fits_imm8(imm) {
            self.cmp_i(ops::CMP, rn, imm);
        } else if imm < 0 && imm > -256 {
            self.cmp_i(ops::CMN, rn, -imm);
        } else {
            let rm = self.const_reg(imm);
            self.cmp_r(ops::CMP, rn, rm);
        }
    }

    /// `rd := rn op imm`, rewriting to the dual opcode with a negated
    /// immediate when that fits and a dual exists (ADD/SUB).
    fn arith_imm(&mut self, op: MachOp, dual: Option<MachOp>, rd: Reg, rn: Reg, imm: i32) {
        if fits_imm8(imm) {
            self.op_rri(op, rd, rn, imm);
        } else if let (Some(dual), true) = (dual, imm < 0 && imm > -256) {
            self.op_rri(dual, rd, rn, -imm);
        } else {
            let rm = self.const_reg(imm);
            self.op_rrr(op, rd, rn, rm);
        }
    }

    pub(crate) fn add_imm(&mut self, rd: Reg, rn: Reg, imm: i32) {
        self.arith_imm(ops::ADD, Some(ops::SUB), rd, rn, imm);
    }

    // Booleans: unconditionally clear, conditionally set.
    fn bool_cond(&mut self, cond: Cond, rd: Reg) {
        self.op_ri(ops::MOV, rd, 0);
        self.op_ri(mov_cc(cond), rd, 1);
    }

    /// Load a pool literal into `rd` through the pool base register.
    pub(crate) fn load_reg(&mut self, rd: Reg, val: i32) {
        let off = self.pool.intern(val as u32);
        if rd.is_float() {
            self.ldst_f(ops::FLDS.with(UBIT), rd, lp_reg(), (off / 4) as i32);
        } else {
            self.ldst_ri(ops::LDR.with(UBIT), rd, lp_reg(), off as i32);
        }
    }

    // Loads and stores for word and unsigned byte.
    pub(crate) fn load_store(&mut self, op: MachOp, ra: Reg, rb: Reg, c: i32) {
        if rb.is_none() {
            let rc = self.const_reg(c);
            self.ldst_ri(op.with(UBIT), ra, rc, 0);
            return;
        }

        if (0..4096).contains(&c) {
            self.ldst_ri(op.with(UBIT), ra, rb, c);
        } else if c < 0 && c > -4096 {
            self.ldst_ri(op, ra, rb, -c);
        } else {
            let rc = self.const_reg(c);
            self.ldst_rr(op, ra, rb, rc);
        }
    }

    // Other integer loads and stores, with the narrower offset range.
    fn load_store_x(&mut self, op: MachOp, ra: Reg, rb: Reg, c: i32) {
        if rb.is_none() {
            let rc = self.const_reg(c);
            self.ldstx_ri(op.with(UBIT), ra, rc, 0);
            return;
        }

        if (0..256).contains(&c) {
            self.ldstx_ri(op.with(UBIT), ra, rb, c);
        } else if c < 0 && c > -256 {
            self.ldstx_ri(op, ra, rb, -c);
        } else {
            let rc = self.const_reg(c);
            self.ldstx_rr(op, ra, rb, rc);
        }
    }

    // Floating point loads and stores.
    fn load_store_f(&mut self, op: MachOp, ra: Reg, rb: Reg, c: i32) {
        if c & 3 != 0 {
            fatal!("misaligned float access at offset {}", c);
        }

        if rb.is_none() {
            let rc = self.const_reg(c);
            self.ldst_f(op.with(UBIT), ra, rc, 0);
            return;
        }

        if (0..1024).contains(&c) {
            self.ldst_f(op.with(UBIT), ra, rb, c / 4);
        } else if c < 0 && c > -1024 {
            self.ldst_f(op, ra, rb, -c / 4);
        } else {
            self.add_imm(ip_reg(), rb, c);
            self.ldst_f(op.with(UBIT), ra, ip_reg(), 0);
        }
    }

    // Load or store a double as two word transfers, so an unaligned double
    // never takes an alignment trap.
    fn load_store_d(&mut self, op: MachOp, ra: Reg, rb: Reg, c: i32) {
        if rb.is_none() {
            let rc = self.const_reg(c);
            self.ldst_f(op.with(UBIT), ra, rc, 0);
            self.ldst_f(op.with(UBIT | DBIT), ra, rc, 1);
            return;
        }

        self.load_store_f(op, ra, rb, c);
        self.load_store_f(op.with(DBIT), ra, rb, c + 4);
    }

    pub(crate) fn move_reg(&mut self, rd: Reg, rm: Reg) {
        if rd != rm {
            self.op_rr(ops::MOV, rd, rm);
        }
    }

    /// Emit a branch with a zero displacement, patched immediately when the
    /// target is already known. Returns the branch site for later patching.
    fn branch_to(&mut self, op: MachOp, target: Option<*const u8>) -> *mut u8 {
        let site = self.buf.pc();
        self.branch_i(op, 0);
        if let Some(target) = target {
            patch_branch24(site, target);
        }
        site
    }

    fn branch_label(&mut self, op: MachOp, target: Label) {
        let site = self.branch_to(op, None);
        self.use_label(site, target);
    }

    /// Seal a full buffer with a jump to the next one. Falls back to an
    /// indirect jump through an inline word when the new page is out of
    /// branch range.
    pub(crate) fn chain_to(&mut self, page: *mut u8) {
        let off = page as i64 - self.buf.pc() as i64 - 8;
        if (-0x0200_0000..0x0200_0000).contains(&off) {
            self.branch_to(ops::B, Some(page as *const u8));
        } else {
            // ldr pc, [pc, #-4] reads the word that follows it.
            self.ldst_ri(ops::LDR, pc_reg(), pc_reg(), 4);
            let addr = crate::asm::code_addr(page as *const u8);
            self.buf.put4(addr as u32);
        }
    }

    fn proc_call(&mut self, ra: Reg) {
        if self.argp != 0 {
            fatal!("call with {} unfilled argument slot(s)", self.argp);
        }
        self.jump_r(ops::BLX, ra);
    }

    // ldmfd fp, {r4-r10, fp, sp, pc}
    pub(crate) fn ret_frame(&mut self) {
        self.ldstm(
            ops::LDMFD,
            fp_reg(),
            reg_range(4, 10) | reg_bit(fp_reg()) | reg_bit(sp_reg()) | reg_bit(pc_reg()),
        );
    }

    /// Lower one virtual instruction. The caller has echoed the instruction
    /// and guaranteed buffer headroom.
    pub(crate) fn emit_inst(&mut self, inst: Inst) {
        if !class_ok(&inst) {
            fatal!("operand class mismatch: {:?}", inst);
        }
        match inst {
            Inst::Ret => self.ret_frame(),

            Inst::Jump { target } => self.branch_label(ops::B, target),

            Inst::JumpInd { rm } => self.jump_r(ops::BX, rm),

            Inst::Call { dest } => match dest {
                CallDest::Reg(r) => self.proc_call(r),
                CallDest::Addr(a) => {
                    let r = self.const_reg(a);
                    self.proc_call(r);
                }
            },

            Inst::Prep { nargs } => {
                if nargs > 3 {
                    fatal!("prep: too many outgoing arguments ({})", nargs);
                }
                self.argp = nargs;
            }

            Inst::Arg { rn } => {
                if self.argp == 0 {
                    fatal!("arg {} without a prepared argument slot", rn);
                }
                self.argp -= 1;
                self.move_reg(arg_reg(self.argp), rn);
            }

            Inst::GetArg { rd, index } => {
                if index > 3 {
                    fatal!("getarg: argument index {} out of range", index);
                }
                self.move_reg(rd, arg_reg(index));
            }

            Inst::Mov { rd, rm } => {
                if rd.is_float() && rm.is_float() {
                    self.op_rr(ops::FMOVD, rd, rm);
                } else if rd.is_float() {
                    self.fmsr(rd, rm);
                } else if rm.is_float() {
                    self.fmrs(rd, rm);
                } else {
                    self.move_reg(rd, rm);
                }
            }

            Inst::MovImm { rd, imm } => self.move_imm(rd, imm),

            Inst::Ldkw { rd, addr } => {
                let val = unsafe { addr.read_unaligned() };
                if rd.is_float() {
                    self.load_reg(rd, val);
                } else {
                    self.move_imm(rd, val);
                }
            }

            Inst::ZeroF { rd } => self.load_reg(rd, 0),

            Inst::ZeroD { rd } => {
                self.load_reg(rd, 0);
                self.op_rr(ops::FCVTDS, rd, rd);
            }

            Inst::Unary { op, rd, rm } => match op {
                // Unlike the assembler's neg pseudo-instruction, this
                // doesn't set flags.
                UnaryOp::Neg => self.arith_imm(ops::RSB, None, rd, rm, 0),
                UnaryOp::Not => self.op_rr(ops::MVN, rd, rm),
                UnaryOp::NegF => self.op_rr(ops::FNEGS, rd, rm),
                UnaryOp::NegD => self.op_rr(ops::FNEGD, rd, rm),
                UnaryOp::ConvIF => {
                    self.fmsr(rd, rm);
                    self.op_rr(ops::FSITOS, rd, rd);
                }
                UnaryOp::ConvID => {
                    self.fmsr(rd, rm);
                    self.op_rr(ops::FSITOD, rd, rd);
                }
                UnaryOp::ConvIC => self.op_rr(ops::UXTB, rd, rm),
                UnaryOp::ConvIS => self.op_rr(ops::SXTH, rd, rm),
                UnaryOp::ConvFD => self.op_rr(ops::FCVTDS, rd, rm),
                UnaryOp::ConvDF => self.op_rr(ops::FCVTSD, rd, rm),
            },

            Inst::AluRRR { op, rd, rn, rm } => match op {
                AluOp::Add => self.op_rrr(ops::ADD, rd, rn, rm),
                AluOp::Sub => self.op_rrr(ops::SUB, rd, rn, rm),
                AluOp::And => self.op_rrr(ops::AND, rd, rn, rm),
                AluOp::Orr => self.op_rrr(ops::ORR, rd, rn, rm),
                AluOp::Eor => self.op_rrr(ops::EOR, rd, rn, rm),
                AluOp::Mul => self.op_mul(ops::MUL, rd, rn, rm),
                AluOp::Lsl => self.shift_r(ops::LSL, rd, rn, rm),
                AluOp::Asr => self.shift_r(ops::ASR, rd, rn, rm),
                AluOp::Lsr => self.shift_r(ops::LSR, rd, rn, rm),
                AluOp::Ror => self.shift_r(ops::ROR, rd, rn, rm),
            },

            Inst::AluRRImm { op, rd, rn, imm } => match op {
                AluOp::Add => self.add_imm(rd, rn, imm),
                AluOp::Sub => self.arith_imm(ops::SUB, Some(ops::ADD), rd, rn, imm),
                AluOp::And => self.arith_imm(ops::AND, None, rd, rn, imm),
                AluOp::Orr => self.arith_imm(ops::ORR, None, rd, rn, imm),
                AluOp::Eor => self.arith_imm(ops::EOR, None, rd, rn, imm),
                AluOp::Mul => {
                    let rc = self.const_reg(imm);
                    self.op_mul(ops::MUL, rd, rn, rc);
                }
                AluOp::Lsl => self.shift_i(ops::LSL, rd, rn, imm),
                AluOp::Asr => self.shift_i(ops::ASR, rd, rn, imm),
                AluOp::Lsr => self.shift_i(ops::LSR, rd, rn, imm),
                AluOp::Ror => self.shift_i(ops::ROR, rd, rn, imm),
            },

            Inst::FpuRRR { op, rd, rn, rm } => {
                let mop = match op {
                    FpuOp::AddF => ops::FADDS,
                    FpuOp::SubF => ops::FSUBS,
                    FpuOp::MulF => ops::FMULS,
                    FpuOp::DivF => ops::FDIVS,
                    FpuOp::AddD => ops::FADDD,
                    FpuOp::SubD => ops::FSUBD,
                    FpuOp::MulD => ops::FMULD,
                    FpuOp::DivD => ops::FDIVD,
                };
                self.op_rrr(mop, rd, rn, rm);
            }

            Inst::Cmp { cmp, rd, rn, rm } => {
                self.cmp_r(ops::CMP, rn, rm);
                self.bool_cond(cmp.cond(), rd);
            }

            Inst::CmpImm { cmp, rd, rn, imm } => {
                self.compare_imm(rn, imm);
                self.bool_cond(cmp.cond(), rd);
            }

            Inst::CmpF { cmp, rd, rn, rm } => {
                self.op_rr(ops::FCMPS, rn, rm);
                self.fmstat();
                self.bool_cond(cmp.float_cond(), rd);
            }

            Inst::CmpD { cmp, rd, rn, rm } => {
                self.op_rr(ops::FCMPD, rn, rm);
                self.fmstat();
                self.bool_cond(cmp.float_cond(), rd);
            }

            Inst::CondBr {
                cmp,
                rn,
                rm,
                target,
            } => {
                self.cmp_r(ops::CMP, rn, rm);
                self.branch_label(b_cc(cmp.cond()), target);
            }

            Inst::CondBrImm {
                cmp,
                rn,
                imm,
                target,
            } => {
                self.compare_imm(rn, imm);
                self.branch_label(b_cc(cmp.cond()), target);
            }

            Inst::CondBrF {
                cmp,
                rn,
                rm,
                target,
            } => {
                self.op_rr(ops::FCMPS, rn, rm);
                self.fmstat();
                self.branch_label(b_cc(cmp.float_cond()), target);
            }

            Inst::CondBrD {
                cmp,
                rn,
                rm,
                target,
            } => {
                self.op_rr(ops::FCMPD, rn, rm);
                self.fmstat();
                self.branch_label(b_cc(cmp.float_cond()), target);
            }

            Inst::Load {
                kind,
                rd,
                base,
                off,
            } => match kind {
                MemOp::Word => {
                    if rd.is_float() {
                        self.load_store_f(ops::FLDS, rd, base, off);
                    } else {
                        self.load_store(ops::LDR, rd, base, off);
                    }
                }
                MemOp::HalfS => self.load_store_x(ops::LDSH, rd, base, off),
                MemOp::HalfU => self.load_store_x(ops::LDRH, rd, base, off),
                MemOp::ByteS => self.load_store_x(ops::LDSB, rd, base, off),
                MemOp::ByteU => self.load_store(ops::LDRB, rd, base, off),
                MemOp::Dbl => self.load_store_d(ops::FLDS, rd, base, off),
            },

            Inst::Store {
                kind,
                rs,
                base,
                off,
            } => match kind {
                MemOp::Word => {
                    if rs.is_float() {
                        self.load_store_f(ops::FSTS, rs, base, off);
                    } else {
                        self.load_store(ops::STR, rs, base, off);
                    }
                }
                MemOp::HalfS | MemOp::HalfU => self.load_store_x(ops::STRH, rs, base, off),
                MemOp::ByteS | MemOp::ByteU => self.load_store(ops::STRB, rs, base, off),
                MemOp::Dbl => self.load_store_d(ops::FSTS, rs, base, off),
            },
        }
    }
}
