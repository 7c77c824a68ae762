//! Block compiler: guest instructions to native x86-64.
//!
//! Compilation is a two-pass process per basic block:
//!
//! 1. **Decode + estimate.** The driver feeds fetched words through
//!    [`Recompiler::push_instruction`], which classifies each one and
//!    accumulates a fixed worst-case host-size constant per opcode plus the
//!    per-instruction overhead for the program-counter advance and the
//!    load-delay materialization. A control-flow-changing instruction closes
//!    the block after its mandatory delay slot.
//! 2. **Emit.** [`Recompiler::compile_block`] sizes an arena allocation from
//!    the estimate and emits prologue, per-instruction translation and
//!    epilogue straight into it, then registers the block in the cache.
//!
//! Emitted code reaches back into the VM through `extern "C"` thunks for bus
//! access and load-delay application; everything else is inline loads and
//! stores against the execution context at baked-in field offsets.

use std::mem::offset_of;

use log::{debug, trace, warn};

use super::arena::{CodeArena, JIT_RESERVE_SIZE};
use super::cache::{BlockCache, CacheStats, CodeBlock, EntryPoint, CACHE_CAPACITY};
use super::decode::opcodes::{cop0, special};
use super::decode::{opcodes, reg_name, Instruction};
use super::emitter::{Asm, Cc, Reg};
use crate::bus::Bus;
use crate::cpu::{CpuState, ExecContext, LoadDelaySlot};

/// Fixed name of the diagnostic dump of the most recently compiled block.
pub const BLOCK_DUMP_FILE: &str = "out.bin";

/// Prologue + epilogue allowance.
const BLOCK_BASE_SIZE: usize = 25;
/// `pc = next_pc; next_pc += 4` before every instruction.
const INC_PC_SIZE: usize = 20;
/// Load-delay materialization call after every instruction.
const LOAD_DELAY_SIZE: usize = 15;

fn pc_off() -> i32 {
    (offset_of!(ExecContext, cpu) + offset_of!(CpuState, pc)) as i32
}

fn next_pc_off() -> i32 {
    (offset_of!(ExecContext, cpu) + offset_of!(CpuState, next_pc)) as i32
}

fn reg_off(reg: u32) -> i32 {
    (offset_of!(ExecContext, cpu) + offset_of!(CpuState, regs) + 4 * reg as usize) as i32
}

fn cop0_off(reg: u32) -> i32 {
    (offset_of!(ExecContext, cpu) + offset_of!(CpuState, cop0) + 4 * reg as usize) as i32
}

fn staged_reg_off() -> i32 {
    (offset_of!(ExecContext, next_load_delay) + offset_of!(LoadDelaySlot, reg)) as i32
}

fn staged_data_off() -> i32 {
    (offset_of!(ExecContext, next_load_delay) + offset_of!(LoadDelaySlot, data)) as i32
}

// ═══════════════════════════════════════════════════════════════════════════
// Helper thunks called from generated code
// ═══════════════════════════════════════════════════════════════════════════

unsafe extern "C" fn jit_read8(ctx: *mut ExecContext, addr: u32) -> u32 {
    unsafe { (*ctx).bus.read8(addr) as u32 }
}

unsafe extern "C" fn jit_read32(ctx: *mut ExecContext, addr: u32) -> u32 {
    unsafe { (*ctx).bus.read32(addr) }
}

unsafe extern "C" fn jit_write8(ctx: *mut ExecContext, addr: u32, value: u32) {
    unsafe { (*ctx).bus.write8(addr, value as u8) }
}

unsafe extern "C" fn jit_write16(ctx: *mut ExecContext, addr: u32, value: u32) {
    unsafe { (*ctx).bus.write16(addr, value as u16) }
}

unsafe extern "C" fn jit_write32(ctx: *mut ExecContext, addr: u32, value: u32) {
    unsafe { (*ctx).bus.write32(addr, value) }
}

/// Make the pending delayed load visible, promote the staged pair, clear the
/// staging slot. Runs after every guest instruction.
unsafe extern "C" fn jit_apply_load_delay(ctx: *mut ExecContext) {
    let ctx = unsafe { &mut *ctx };
    ctx.cpu.regs[ctx.load_delay.reg as usize] = ctx.load_delay.data;
    ctx.load_delay = ctx.next_load_delay;
    ctx.next_load_delay = LoadDelaySlot::default();
}

// ═══════════════════════════════════════════════════════════════════════════
// Classification and size estimation
// ═══════════════════════════════════════════════════════════════════════════

/// Does this instruction change control flow? If so, the block closes after
/// one more word (the architectural delay slot).
fn modifies_pc(instr: Instruction) -> bool {
    match instr.opcode() {
        opcodes::SPECIAL => instr.funct() == special::JR,
        opcodes::J | opcodes::JAL | opcodes::BEQ | opcodes::BNE => true,
        _ => false,
    }
}

/// Worst-case host bytes for one instruction's translation, excluding the
/// per-instruction pc-advance and load-delay overhead. The constants are
/// upper bounds per opcode class, checked against the emitter by tests.
fn host_size_estimate(instr: Instruction) -> usize {
    if instr.0 == 0 {
        return 1; // nop
    }
    match instr.opcode() {
        opcodes::SPECIAL => match instr.funct() {
            special::JR => 15,
            special::ADDU | special::OR => 20,
            special::SLTU => 34,
            funct => panic!(
                "unknown special instruction {:#04x} ({:#010x})",
                funct, instr.0
            ),
        },
        opcodes::J => 24,
        opcodes::JAL => 36,
        opcodes::BEQ | opcodes::BNE => 34,
        opcodes::ADDI | opcodes::ADDIU => 19,
        opcodes::ANDI | opcodes::ORI => 20,
        opcodes::LUI => 10,
        opcodes::COP0 => match instr.rs() {
            cop0::MTC0 => 12,
            sub => panic!("unknown cop0 instruction {:#04x} ({:#010x})", sub, instr.0),
        },
        opcodes::LB | opcodes::LW => 48,
        opcodes::SB | opcodes::SH | opcodes::SW => 47,
        op => panic!("unknown instruction {:#04x} ({:#010x})", op, instr.0),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Per-opcode translation
// ═══════════════════════════════════════════════════════════════════════════

/// `pc = next_pc; next_pc += 4`.
fn emit_inc_pc(asm: &mut Asm) {
    asm.load_state(Reg::Ecx, next_pc_off());
    asm.store_state(pc_off(), Reg::Ecx);
    asm.add_state_imm8(next_pc_off(), 4);
}

fn emit_load_delay(asm: &mut Asm) {
    asm.mov64_rr(Reg::Edi, Reg::Ebp);
    asm.call_ptr(jit_apply_load_delay as usize);
}

/// `next_pc = (next_pc & 0xf0000000) | (target << 2)`.
fn emit_j(asm: &mut Asm, instr: Instruction) {
    trace!("j {:#010x}", instr.target() << 2);
    asm.load_state(Reg::Ecx, next_pc_off());
    asm.and_imm(Reg::Ecx, 0xf000_0000);
    asm.or_imm(Reg::Ecx, instr.target() << 2);
    asm.store_state(next_pc_off(), Reg::Ecx);
}

/// Like `j`, but first links the pre-jump `next_pc` into `$ra`.
fn emit_jal(asm: &mut Asm, instr: Instruction) {
    trace!("jal {:#010x}", instr.target() << 2);
    asm.load_state(Reg::Ecx, next_pc_off());
    asm.store_state(reg_off(31), Reg::Ecx);
    // ecx still holds next_pc.
    asm.and_imm(Reg::Ecx, 0xf000_0000);
    asm.or_imm(Reg::Ecx, instr.target() << 2);
    asm.store_state(next_pc_off(), Reg::Ecx);
}

/// Conditional branch. The target is the already-advanced `pc` plus the
/// sign-extended displacement; it is written to `next_pc` so the transfer
/// survives the delay slot's own pc advance.
fn emit_branch(asm: &mut Asm, instr: Instruction, on_equal: bool) {
    trace!(
        "{} {}, {}, {:+}",
        if on_equal { "beq" } else { "bne" },
        reg_name(instr.rs()),
        reg_name(instr.rt()),
        instr.simm() << 2
    );
    asm.load_state(Reg::Ecx, reg_off(instr.rs()));
    asm.load_state(Reg::Edx, reg_off(instr.rt()));
    asm.cmp_rr(Reg::Ecx, Reg::Edx);
    let skip = asm.jcc(if on_equal { Cc::Ne } else { Cc::E });
    asm.load_state(Reg::Ecx, pc_off());
    asm.add_imm(Reg::Ecx, (instr.simm() << 2) as u32);
    asm.store_state(next_pc_off(), Reg::Ecx);
    asm.bind(skip);
}

/// `rt = rs + sign_extend(imm)`. addi is handled without overflow traps,
/// exactly like addiu.
fn emit_addiu(asm: &mut Asm, instr: Instruction) {
    trace!(
        "{} {}, {}, {:#x}",
        if instr.opcode() == opcodes::ADDI { "addi" } else { "addiu" },
        reg_name(instr.rt()),
        reg_name(instr.rs()),
        instr.simm()
    );
    asm.load_state(Reg::Ecx, reg_off(instr.rs()));
    asm.add_imm(Reg::Ecx, instr.simm() as u32);
    asm.store_state(reg_off(instr.rt()), Reg::Ecx);
}

/// `rt = rs & imm` / `rt = rs | imm`, zero-extended immediate.
fn emit_logic_imm(asm: &mut Asm, instr: Instruction, and: bool) {
    trace!(
        "{} {}, {}, {:#06x}",
        if and { "andi" } else { "ori" },
        reg_name(instr.rt()),
        reg_name(instr.rs()),
        instr.imm()
    );
    asm.load_state(Reg::Ecx, reg_off(instr.rs()));
    if and {
        asm.and_imm(Reg::Ecx, instr.imm());
    } else {
        asm.or_imm(Reg::Ecx, instr.imm());
    }
    asm.store_state(reg_off(instr.rt()), Reg::Ecx);
}

/// `rt = imm << 16`.
fn emit_lui(asm: &mut Asm, instr: Instruction) {
    trace!("lui {}, {:#06x}", reg_name(instr.rt()), instr.imm());
    asm.store_state_imm(reg_off(instr.rt()), instr.imm() << 16);
}

/// Loads go through the bus thunk and stage the result into the load-delay
/// staging pair; the register file is only touched one instruction later.
fn emit_load(asm: &mut Asm, instr: Instruction, thunk: usize, mnemonic: &str) {
    trace!(
        "{} {}, {}({})",
        mnemonic,
        reg_name(instr.rt()),
        instr.simm(),
        reg_name(instr.rs())
    );
    asm.load_state(Reg::Esi, reg_off(instr.rs()));
    asm.add_imm(Reg::Esi, instr.simm() as u32);
    asm.mov64_rr(Reg::Edi, Reg::Ebp);
    asm.call_ptr(thunk);
    asm.store_state_imm(staged_reg_off(), instr.rt());
    asm.store_state(staged_data_off(), Reg::Eax);
}

/// Stores are suppressed entirely while bit 16 of cop0 register 12 (cache
/// isolation) is set; otherwise they call through to the bus thunk.
fn emit_store(asm: &mut Asm, instr: Instruction, thunk: usize, mnemonic: &str) {
    trace!(
        "{} {}, {}({})",
        mnemonic,
        reg_name(instr.rt()),
        instr.simm(),
        reg_name(instr.rs())
    );
    asm.load_state(Reg::Esi, reg_off(instr.rs()));
    asm.add_imm(Reg::Esi, instr.simm() as u32);
    asm.load_state(Reg::Edx, reg_off(instr.rt()));
    asm.load_state(Reg::Ecx, cop0_off(12));
    asm.and_imm(Reg::Ecx, 1 << 16);
    let skip = asm.jcc(Cc::Ne);
    asm.mov64_rr(Reg::Edi, Reg::Ebp);
    asm.call_ptr(thunk);
    asm.bind(skip);
}

/// `next_pc = rs`.
fn emit_jr(asm: &mut Asm, instr: Instruction) {
    trace!("jr {}", reg_name(instr.rs()));
    asm.load_state(Reg::Ecx, reg_off(instr.rs()));
    asm.store_state(next_pc_off(), Reg::Ecx);
}

/// `rd = rs + rt` / `rd = rs | rt`.
fn emit_alu_reg(asm: &mut Asm, instr: Instruction, add: bool) {
    trace!(
        "{} {}, {}, {}",
        if add { "addu" } else { "or" },
        reg_name(instr.rd()),
        reg_name(instr.rs()),
        reg_name(instr.rt())
    );
    asm.load_state(Reg::Ecx, reg_off(instr.rs()));
    asm.load_state(Reg::Edx, reg_off(instr.rt()));
    if add {
        asm.add_rr(Reg::Ecx, Reg::Edx);
    } else {
        asm.or_rr(Reg::Ecx, Reg::Edx);
    }
    asm.store_state(reg_off(instr.rd()), Reg::Ecx);
}

/// `rd = (rs < rt) as u32`, unsigned compare.
fn emit_sltu(asm: &mut Asm, instr: Instruction) {
    trace!(
        "sltu {}, {}, {}",
        reg_name(instr.rd()),
        reg_name(instr.rs()),
        reg_name(instr.rt())
    );
    asm.xor_rr(Reg::Eax, Reg::Eax);
    asm.load_state(Reg::Ecx, reg_off(instr.rs()));
    asm.load_state(Reg::Edx, reg_off(instr.rt()));
    asm.cmp_rr(Reg::Ecx, Reg::Edx);
    asm.setb(Reg::Eax);
    asm.store_state(reg_off(instr.rd()), Reg::Eax);
}

/// `cop0[rd] = rt`.
fn emit_mtc0(asm: &mut Asm, instr: Instruction) {
    trace!("mtc0 r{}, {}", instr.rd(), reg_name(instr.rt()));
    asm.load_state(Reg::Ecx, reg_off(instr.rt()));
    asm.store_state(cop0_off(instr.rd()), Reg::Ecx);
}

/// Dispatch one decoded instruction to its translation routine.
fn emit_instruction(asm: &mut Asm, instr: Instruction) {
    if instr.0 == 0 {
        trace!("nop");
        asm.nop();
        return;
    }
    match instr.opcode() {
        opcodes::SPECIAL => match instr.funct() {
            special::JR => emit_jr(asm, instr),
            special::ADDU => emit_alu_reg(asm, instr, true),
            special::OR => emit_alu_reg(asm, instr, false),
            special::SLTU => emit_sltu(asm, instr),
            funct => panic!(
                "unknown special instruction {:#04x} ({:#010x})",
                funct, instr.0
            ),
        },
        opcodes::J => emit_j(asm, instr),
        opcodes::JAL => emit_jal(asm, instr),
        opcodes::BEQ => emit_branch(asm, instr, true),
        opcodes::BNE => emit_branch(asm, instr, false),
        opcodes::ADDI | opcodes::ADDIU => emit_addiu(asm, instr),
        opcodes::ANDI => emit_logic_imm(asm, instr, true),
        opcodes::ORI => emit_logic_imm(asm, instr, false),
        opcodes::LUI => emit_lui(asm, instr),
        opcodes::COP0 => match instr.rs() {
            cop0::MTC0 => emit_mtc0(asm, instr),
            sub => panic!("unknown cop0 instruction {:#04x} ({:#010x})", sub, instr.0),
        },
        opcodes::LB => emit_load(asm, instr, jit_read8 as usize, "lb"),
        opcodes::LW => emit_load(asm, instr, jit_read32 as usize, "lw"),
        opcodes::SB => emit_store(asm, instr, jit_write8 as usize, "sb"),
        opcodes::SH => emit_store(asm, instr, jit_write16 as usize, "sh"),
        opcodes::SW => emit_store(asm, instr, jit_write32 as usize, "sw"),
        op => panic!("unknown instruction {:#04x} ({:#010x})", op, instr.0),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Recompiler
// ═══════════════════════════════════════════════════════════════════════════

/// Drives decode, size estimation, emission and caching of basic blocks.
pub struct Recompiler {
    arena: CodeArena,
    cache: BlockCache,
    /// Guest words accumulated for the open block.
    pending: Vec<u32>,
    /// Worst-case host bytes for the open block's body.
    estimate: usize,
}

impl Recompiler {
    pub fn new() -> Self {
        Self::with_limits(JIT_RESERVE_SIZE, CACHE_CAPACITY)
    }

    /// Construct with an explicit arena reservation and cache capacity.
    pub fn with_limits(reserve: usize, capacity: usize) -> Self {
        Self {
            arena: CodeArena::new(reserve),
            cache: BlockCache::new(capacity),
            pending: Vec::new(),
            estimate: 0,
        }
    }

    /// Pass 1: accumulate one fetched word into the open block.
    ///
    /// Returns `false` once the block must close (the caller then feeds the
    /// delay-slot word and compiles). Unknown opcodes are fatal here.
    pub fn push_instruction(&mut self, word: u32) -> bool {
        let instr = Instruction(word);
        self.estimate += INC_PC_SIZE + LOAD_DELAY_SIZE;
        self.estimate += host_size_estimate(instr);
        self.pending.push(word);
        !modifies_pc(instr)
    }

    /// Cache lookup for the block starting at `guest_addr`.
    pub fn cached_entry(&mut self, guest_addr: u32) -> Option<EntryPoint> {
        self.cache.lookup(guest_addr)
    }

    /// Drain the bus's pending write notices, dropping every cached block
    /// whose guest range was touched. Must run before any lookup so stale
    /// translations of self-modified code never execute.
    pub fn invalidate_written(&mut self, bus: &mut Bus) {
        for addr in bus.take_written() {
            self.cache.invalidate_covering(addr, &mut self.arena);
        }
    }

    /// Pass 2: allocate, emit and cache the accumulated block.
    pub fn compile_block(&mut self, guest_addr: u32) -> EntryPoint {
        let size = BLOCK_BASE_SIZE + self.estimate;
        debug!(
            "compiling block {:#010x}: {} instructions, {} byte estimate",
            guest_addr,
            self.pending.len(),
            size
        );

        // Evict before allocating so the freed backing memory is available
        // to this block.
        self.cache.ensure_capacity(&mut self.arena);
        let handle = self.arena.alloc(size);

        let words = std::mem::take(&mut self.pending);
        self.estimate = 0;

        let code_len = {
            let buf = self.arena.slice_mut(&handle);
            let mut asm = Asm::new(buf);
            asm.prologue();
            for &word in &words {
                emit_inc_pc(&mut asm);
                emit_instruction(&mut asm, Instruction(word));
                emit_load_delay(&mut asm);
            }
            asm.epilogue();
            asm.len()
        };

        let code = &self.arena.slice(&handle)[..code_len];
        if let Err(err) = std::fs::write(BLOCK_DUMP_FILE, code) {
            warn!("couldn't write {BLOCK_DUMP_FILE}: {err}");
        }

        let entry = EntryPoint::new(self.arena.entry_ptr(&handle));
        self.cache.insert(CodeBlock {
            guest_addr,
            guest_len: (words.len() * 4) as u32,
            handle,
            entry,
            hits: 1,
        });
        entry
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn arena(&self) -> &CodeArena {
        &self.arena
    }

    pub fn stats(&self) -> &CacheStats {
        self.cache.stats()
    }
}

impl Default for Recompiler {
    fn default() -> Self {
        Self::new()
    }
}
