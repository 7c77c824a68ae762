//! Guest instruction decoding.
//!
//! A fetched 32-bit guest word is viewed through one of three field layouts
//! depending on its major opcode: immediate form `{rs, rt, imm16}`, jump form
//! `{target26}` or register form `{rs, rt, rd, shift5, funct6}`. The view is
//! rebuilt for every word and never persisted.

/// Transient view over one 32-bit guest instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    /// Major opcode, top 6 bits.
    pub fn opcode(self) -> u32 {
        self.0 >> 26
    }

    pub fn rs(self) -> u32 {
        (self.0 >> 21) & 0x1f
    }

    pub fn rt(self) -> u32 {
        (self.0 >> 16) & 0x1f
    }

    pub fn rd(self) -> u32 {
        (self.0 >> 11) & 0x1f
    }

    /// Shift amount field of the register form.
    pub fn shift(self) -> u32 {
        (self.0 >> 6) & 0x1f
    }

    /// Function field of the register form, low 6 bits.
    pub fn funct(self) -> u32 {
        self.0 & 0x3f
    }

    /// Zero-extended 16-bit immediate.
    pub fn imm(self) -> u32 {
        self.0 & 0xffff
    }

    /// Sign-extended 16-bit immediate.
    pub fn simm(self) -> i32 {
        self.0 as u16 as i16 as i32
    }

    /// 26-bit jump target of the jump form.
    pub fn target(self) -> u32 {
        self.0 & 0x03ff_ffff
    }
}

/// Major opcodes, special function codes and cop0 sub-opcodes of the
/// supported guest instruction table. Anything outside this table is a
/// fatal decode error; the translator is deliberately closed-world.
pub mod opcodes {
    pub const SPECIAL: u32 = 0x00;
    pub const J: u32 = 0x02;
    pub const JAL: u32 = 0x03;
    pub const BEQ: u32 = 0x04;
    pub const BNE: u32 = 0x05;
    pub const ADDI: u32 = 0x08;
    pub const ADDIU: u32 = 0x09;
    pub const ANDI: u32 = 0x0c;
    pub const ORI: u32 = 0x0d;
    pub const LUI: u32 = 0x0f;
    pub const COP0: u32 = 0x10;
    pub const LB: u32 = 0x20;
    pub const LW: u32 = 0x23;
    pub const SB: u32 = 0x28;
    pub const SH: u32 = 0x29;
    pub const SW: u32 = 0x2b;

    /// Function codes under `SPECIAL`.
    pub mod special {
        pub const JR: u32 = 0x08;
        pub const ADDU: u32 = 0x21;
        pub const OR: u32 = 0x25;
        pub const SLTU: u32 = 0x2b;
    }

    /// Sub-opcodes (rs field) under `COP0`.
    pub mod cop0 {
        pub const MTC0: u32 = 0x04;
    }
}

/// Conventional MIPS register names, used for disassembly traces and the
/// register dump.
pub const REG_NAMES: [&str; 32] = [
    "$zero", "$at", "$v0", "$v1", "$a0", "$a1", "$a2", "$a3", "$t0", "$t1",
    "$t2", "$t3", "$t4", "$t5", "$t6", "$t7", "$s0", "$s1", "$s2", "$s3",
    "$s4", "$s5", "$s6", "$s7", "$t8", "$t9", "$k0", "$k1", "$gp", "$sp",
    "$fp", "$ra",
];

/// Name of a general-purpose register for trace output.
pub fn reg_name(reg: u32) -> &'static str {
    REG_NAMES.get(reg as usize).copied().unwrap_or("$NA")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_form_fields() {
        // lui $t0, 0x1234
        let i = Instruction(0x3c08_1234);
        assert_eq!(i.opcode(), opcodes::LUI);
        assert_eq!(i.rt(), 8);
        assert_eq!(i.imm(), 0x1234);

        // ori $t0, $t0, 0x0056
        let i = Instruction(0x3508_0056);
        assert_eq!(i.opcode(), opcodes::ORI);
        assert_eq!(i.rs(), 8);
        assert_eq!(i.rt(), 8);
        assert_eq!(i.imm(), 0x0056);
    }

    #[test]
    fn test_sign_extended_immediate() {
        // addiu $t0, $zero, -4
        let i = Instruction(0x2408_fffc);
        assert_eq!(i.imm(), 0xfffc);
        assert_eq!(i.simm(), -4);
    }

    #[test]
    fn test_register_form_fields() {
        // addu $v1, $at, $v0
        let i = Instruction(0x0022_1821);
        assert_eq!(i.opcode(), opcodes::SPECIAL);
        assert_eq!(i.rs(), 1);
        assert_eq!(i.rt(), 2);
        assert_eq!(i.rd(), 3);
        assert_eq!(i.shift(), 0);
        assert_eq!(i.funct(), opcodes::special::ADDU);
    }

    #[test]
    fn test_jump_form_target() {
        // j 0xbfc00000 -> target field is the word address
        let i = Instruction(0x0bf0_0000);
        assert_eq!(i.opcode(), opcodes::J);
        assert_eq!(i.target(), 0x03f0_0000);
    }

    #[test]
    fn test_reg_names() {
        assert_eq!(reg_name(0), "$zero");
        assert_eq!(reg_name(8), "$t0");
        assert_eq!(reg_name(31), "$ra");
    }
}
