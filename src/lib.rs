//! A dynamically translating PSX-style MIPS virtual machine.
//!
//! Guest code is executed by translating basic blocks to native x86-64 on
//! first use and caching the results. The public surface is small: build a
//! [`Bus`], load a BIOS image, hand the bus to a [`Cpu`] and clock it.
//!
//! ```no_run
//! use psx_vm::{Bus, Cpu};
//!
//! let mut bus = Bus::new();
//! bus.load_bios("bios.bin")?;
//! let mut cpu = Cpu::new(bus);
//! loop {
//!     cpu.clock(32);
//! }
//! # Ok::<(), psx_vm::BusError>(())
//! ```

pub mod bus;
pub mod cpu;
pub mod jit;

pub use bus::{Bus, BusError};
pub use cpu::{Cpu, CpuState};
