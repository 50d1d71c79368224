//! Host-runnable tests: build procedures into real executable memory and
//! inspect the emitted words. Nothing here runs the generated code, so
//! these pass on any host; see `exec.rs` for the on-target tests.

use jolt_jit::inst::*;
use jolt_jit::{code_addr, Jit, JitBuilder};

fn read_word(p: *const u8) -> u32 {
    let mut b = [0u8; 4];
    unsafe { std::ptr::copy_nonoverlapping(p, b.as_mut_ptr(), 4) };
    u32::from_le_bytes(b)
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn allocations_are_page_aligned_and_reachable() {
    init_logs();
    let mut jit = JitBuilder::new().finish();
    let a = jit.alloc(100);
    let b = jit.alloc(5000);
    assert!(!a.is_null());
    assert!(!b.is_null());
    assert_eq!(a as usize % 4096, 0);
    assert_eq!(b as usize % 4096, 0);
    #[cfg(target_pointer_width = "64")]
    {
        // Generated code addresses its pages through 32-bit registers.
        assert!((a as usize) < (1 << 31));
        assert!((b as usize) < (1 << 31));
    }
    unsafe {
        a.write(1);
        b.write(2);
    }
}

#[test]
fn identity_procedure_emits_expected_frame() {
    init_logs();
    let mut jit = JitBuilder::new().finish();
    let entry = jit.begin("id", 1);
    jit.emit(Inst::GetArg {
        rd: vreg(0),
        index: 0,
    });
    jit.emit(Inst::Mov {
        rd: ret_reg(),
        rm: vreg(0),
    });
    jit.emit(Inst::Ret);
    jit.end();

    let expected = [
        0xE1A0_C00Du32, // mov ip, sp
        0xE92D_5FF0,    // stmfd sp!, {r4-r10, fp, ip, lr}
        0xE1A0_B00D,    // mov fp, sp
        0xE51F_A018,    // ldr r10, [pc, #-24]
        0xE1A0_4000,    // mov r4, r0
        0xE1A0_0004,    // mov r0, r4
        0xE89B_AFF0,    // ldmfd fp, {r4-r10, fp, sp, pc}
    ];
    for (i, &w) in expected.iter().enumerate() {
        assert_eq!(read_word(unsafe { entry.add(4 * i) }), w, "word {}", i);
    }
    assert_eq!(jit.proc_size(), 32);
    // The pool header sits just before the entry and points past the code.
    let header = read_word(unsafe { entry.sub(4) });
    assert_eq!(header as usize, entry as usize + expected.len() * 4);
}

fn compile_fact(jit: &mut Jit) -> *const u8 {
    let entry = jit.begin("fact", 1);
    let loop_head = jit.new_label();
    let done = jit.new_label();

    jit.emit(Inst::GetArg {
        rd: vreg(0),
        index: 0,
    });
    jit.emit(Inst::MovImm {
        rd: vreg(1),
        imm: 1,
    });
    jit.bind(loop_head);
    jit.emit(Inst::CondBrImm {
        cmp: BrOp::Eq,
        rn: vreg(0),
        imm: 0,
        target: done,
    });
    jit.emit(Inst::AluRRR {
        op: AluOp::Mul,
        rd: vreg(1),
        rn: vreg(1),
        rm: vreg(0),
    });
    jit.emit(Inst::AluRRImm {
        op: AluOp::Sub,
        rd: vreg(0),
        rn: vreg(0),
        imm: 1,
    });
    jit.emit(Inst::Jump { target: loop_head });
    jit.bind(done);
    jit.emit(Inst::Mov {
        rd: ret_reg(),
        rm: vreg(1),
    });
    jit.emit(Inst::Ret);
    jit.end();
    entry
}

fn compile_fact_recursive(jit: &mut Jit) -> *const u8 {
    let entry = jit.begin("fact2", 1);
    let recurse = jit.new_label();
    let out = jit.new_label();

    jit.emit(Inst::GetArg {
        rd: vreg(0),
        index: 0,
    });
    jit.emit(Inst::CondBrImm {
        cmp: BrOp::Ne,
        rn: vreg(0),
        imm: 0,
        target: recurse,
    });
    jit.emit(Inst::MovImm {
        rd: ret_reg(),
        imm: 1,
    });
    jit.emit(Inst::Jump { target: out });
    jit.bind(recurse);
    jit.emit(Inst::AluRRImm {
        op: AluOp::Sub,
        rd: vreg(1),
        rn: vreg(0),
        imm: 1,
    });
    jit.emit(Inst::Prep { nargs: 1 });
    jit.emit(Inst::Arg { rn: vreg(1) });
    jit.emit(Inst::Call {
        dest: CallDest::Addr(code_addr(entry)),
    });
    jit.emit(Inst::AluRRR {
        op: AluOp::Mul,
        rd: ret_reg(),
        rn: vreg(0),
        rm: ret_reg(),
    });
    jit.bind(out);
    jit.emit(Inst::Ret);
    jit.end();
    entry
}

#[test]
fn factorials_build_cleanly() {
    init_logs();
    let mut jit = JitBuilder::new().finish();
    let fact = compile_fact(&mut jit);
    let fact2 = compile_fact_recursive(&mut jit);
    assert!(!fact.is_null());
    assert!(!fact2.is_null());
    // Successive procedures are laid out one after the other.
    assert!((fact2 as usize) > (fact as usize));
}

#[test]
fn recursive_call_target_comes_from_the_pool() {
    init_logs();
    let mut jit = JitBuilder::new().finish();
    let entry = compile_fact_recursive(&mut jit);
    // The procedure's own entry is its first (and only) pool literal.
    let pool = read_word(unsafe { entry.sub(4) }) as *const u8;
    assert_eq!(read_word(pool), entry as usize as u32);
}

#[test]
fn large_immediates_share_one_pool_slot() {
    init_logs();
    let mut jit = JitBuilder::new().finish();
    let entry = jit.begin("big", 1);
    jit.emit(Inst::GetArg {
        rd: vreg(0),
        index: 0,
    });
    jit.emit(Inst::AluRRImm {
        op: AluOp::Add,
        rd: vreg(0),
        rn: vreg(0),
        imm: 0x12345,
    });
    jit.emit(Inst::AluRRImm {
        op: AluOp::Add,
        rd: vreg(0),
        rn: vreg(0),
        imm: 0x12345,
    });
    jit.emit(Inst::Mov {
        rd: ret_reg(),
        rm: vreg(0),
    });
    jit.emit(Inst::Ret);
    jit.end();

    let pool = read_word(unsafe { entry.sub(4) }) as *const u8;
    assert_eq!(read_word(pool), 0x12345);
    // One literal: the pool is the last word of the procedure.
    assert_eq!(pool as usize + 4, jit.pc() as usize);
}
