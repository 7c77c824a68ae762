//! Guest processor state and the execution driver.
//!
//! [`ExecContext`] is the single `#[repr(C)]` structure generated code works
//! against: compiled blocks receive a pointer to it as their only argument
//! and read and write its fields at offsets baked in at compile time. There
//! is no global state; several independent contexts can coexist.
//!
//! [`Cpu`] owns the context together with the [`Recompiler`] and drives the
//! fetch/lookup/compile/dispatch loop.

use log::{debug, info};

use crate::bus::Bus;
use crate::jit::cache::EntryPoint;
use crate::jit::decode::reg_name;
use crate::jit::Recompiler;

/// Architectural reset vector (start of the BIOS in KSEG1).
pub const RESET_PC: u32 = 0xbfc0_0000;

/// One delayed load: register index and the value it will receive.
///
/// The default slot targets register 0 with value 0, so applying it when no
/// load is pending rewrites the hardwired zero register, which doubles as
/// the enforcement of its zero-by-convention contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct LoadDelaySlot {
    pub reg: u32,
    pub data: u32,
}

/// Architectural register state of the guest processor.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct CpuState {
    pub regs: [u32; 32],
    pub cop0: [u32; 32],
    pub pc: u32,
    pub next_pc: u32,
}

impl CpuState {
    pub fn new() -> Self {
        Self {
            regs: [0; 32],
            cop0: [0; 32],
            pc: RESET_PC,
            next_pc: RESET_PC.wrapping_add(4),
        }
    }

    /// Cache isolation: while bit 16 of the cop0 status register is set,
    /// guest stores must not reach the bus.
    pub fn cache_isolated(&self) -> bool {
        self.cop0[12] & (1 << 16) != 0
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything generated code touches, in one fixed-layout allocation.
///
/// `load_delay` is the load that becomes visible after the current
/// instruction; `next_load_delay` stages the load issued by the current
/// instruction for one instruction later.
#[repr(C)]
pub struct ExecContext {
    pub cpu: CpuState,
    pub load_delay: LoadDelaySlot,
    pub next_load_delay: LoadDelaySlot,
    pub bus: Bus,
}

/// The execution driver: owns the context and the translation machinery.
pub struct Cpu {
    ctx: Box<ExecContext>,
    jit: Recompiler,
}

impl Cpu {
    pub fn new(bus: Bus) -> Self {
        Self {
            ctx: Box::new(ExecContext {
                cpu: CpuState::new(),
                load_delay: LoadDelaySlot::default(),
                next_load_delay: LoadDelaySlot::default(),
                bus,
            }),
            jit: Recompiler::new(),
        }
    }

    /// Dispatch one basic block: settle pending invalidations, look the
    /// current program counter up in the cache, compile on a miss, run.
    ///
    /// `cycles` bounds the number of guest words fed into a fresh block; a
    /// block cut short by the bound simply ends, and the next call resumes
    /// at the advanced program counter.
    pub fn clock(&mut self, cycles: u32) {
        self.jit.invalidate_written(&mut self.ctx.bus);

        let pc = self.ctx.cpu.pc;
        let entry = match self.jit.cached_entry(pc) {
            Some(entry) => entry,
            None => self.compile_at(pc, cycles),
        };

        let ctx: *mut ExecContext = &mut *self.ctx;
        unsafe { entry.invoke(ctx) };
    }

    /// Fetch forward from `pc` until a control-flow instruction closes the
    /// block (taking its delay slot too) or the word bound is hit, then hand
    /// the lot to the compiler.
    fn compile_at(&mut self, pc: u32, max_words: u32) -> EntryPoint {
        let mut addr = pc;
        for _ in 0..max_words {
            let word = self.ctx.bus.read32(addr);
            addr = addr.wrapping_add(4);
            if !self.jit.push_instruction(word) {
                let delay = self.ctx.bus.read32(addr);
                self.jit.push_instruction(delay);
                break;
            }
        }
        self.jit.compile_block(pc)
    }

    pub fn state(&self) -> &CpuState {
        &self.ctx.cpu
    }

    pub fn state_mut(&mut self) -> &mut CpuState {
        &mut self.ctx.cpu
    }

    pub fn bus(&self) -> &Bus {
        &self.ctx.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.ctx.bus
    }

    pub fn jit(&self) -> &Recompiler {
        &self.jit
    }

    /// Log the full architectural state, four registers per line.
    pub fn dump_regs(&self) {
        let cpu = &self.ctx.cpu;
        for (i, chunk) in cpu.regs.chunks(4).enumerate() {
            let mut line = String::new();
            for (j, value) in chunk.iter().enumerate() {
                let reg = (i * 4 + j) as u32;
                line.push_str(&format!("{:>5}: {:08x}  ", reg_name(reg), value));
            }
            info!("{}", line.trim_end());
        }
        info!("   pc: {:08x}  next_pc: {:08x}", cpu.pc, cpu.next_pc);
        info!("  IsC: {}", cpu.cache_isolated());
        let stats = self.jit.stats();
        debug!(
            "cache: {} hits, {} misses, {} insertions, {} evictions, {} invalidations",
            stats.hits, stats.misses, stats.insertions, stats.evictions, stats.invalidations
        );
    }
}

impl Drop for Cpu {
    fn drop(&mut self) {
        self.dump_regs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_state() {
        let state = CpuState::new();
        assert_eq!(state.pc, 0xbfc0_0000);
        assert_eq!(state.next_pc, 0xbfc0_0004);
        assert!(state.regs.iter().all(|&r| r == 0));
        assert!(!state.cache_isolated());
    }

    #[test]
    fn test_cache_isolation_bit() {
        let mut state = CpuState::new();
        state.cop0[12] = 1 << 16;
        assert!(state.cache_isolated());
        state.cop0[12] = !(1u32 << 16);
        assert!(!state.cache_isolated());
    }

    #[test]
    fn test_default_load_delay_targets_zero_register() {
        let slot = LoadDelaySlot::default();
        assert_eq!(slot, LoadDelaySlot { reg: 0, data: 0 });
    }
}
