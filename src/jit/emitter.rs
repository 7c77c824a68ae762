//! x86-64 code emitter.
//!
//! A small capability-style assembler that writes host instructions directly
//! into the arena slice sized by the estimate pass. The per-opcode
//! translation code talks to it through operations like [`Asm::load_state`]
//! and [`Asm::jcc`]; host encoding details stay in this module.
//!
//! ## Generated block ABI
//!
//! Compiled blocks are System V AMD64 functions taking the execution context
//! pointer as their only argument:
//!
//! ```text
//! prologue:  push rbp          ; keep rsp 16-byte aligned for helper calls
//!            mov  rbp, rdi     ; rbp = &mut ExecContext for the whole block
//! body:      ...               ; state access is [rbp + disp32]
//! epilogue:  pop  rbp
//!            ret
//! ```
//!
//! Scratch registers are caller-saved (`eax`, `ecx`, `edx`, `esi`, `edi`),
//! so helper calls need no extra spills. `eax` carries helper return values.

/// 32-bit host register numbers as encoded in ModRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

/// Condition codes for short conditional jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cc {
    /// Below (unsigned <).
    B = 0x72,
    /// Above or equal (unsigned >=).
    Ae = 0x73,
    /// Equal.
    E = 0x74,
    /// Not equal / not zero.
    Ne = 0x75,
}

/// Position of an unresolved 8-bit jump displacement.
#[must_use]
pub struct Label(usize);

/// Bounds-checked cursor over the allocation being filled.
pub struct Asm<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Asm<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes emitted so far.
    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    fn put(&mut self, bytes: &[u8]) {
        // Overflowing the allocation means the size estimator lied; stopping
        // here keeps the corruption out of the arena.
        if self.pos + bytes.len() > self.buf.len() {
            panic!(
                "code buffer overflow: {} byte block full at host offset {}",
                self.buf.len(),
                self.pos
            );
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn imm32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    /// `push rbp; mov rbp, rdi`; see the module header for the block ABI.
    pub fn prologue(&mut self) {
        self.put(&[0x55, 0x48, 0x89, 0xfd]);
    }

    /// `pop rbp; ret`.
    pub fn epilogue(&mut self) {
        self.put(&[0x5d, 0xc3]);
    }

    pub fn nop(&mut self) {
        self.put(&[0x90]);
    }

    /// `mov dst, dword [rbp + disp]`.
    pub fn load_state(&mut self, dst: Reg, disp: i32) {
        self.put(&[0x8b, 0x85 | (dst as u8) << 3]);
        self.imm32(disp as u32);
    }

    /// `mov dword [rbp + disp], src`.
    pub fn store_state(&mut self, disp: i32, src: Reg) {
        self.put(&[0x89, 0x85 | (src as u8) << 3]);
        self.imm32(disp as u32);
    }

    /// `mov dword [rbp + disp], imm`.
    pub fn store_state_imm(&mut self, disp: i32, imm: u32) {
        self.put(&[0xc7, 0x85]);
        self.imm32(disp as u32);
        self.imm32(imm);
    }

    /// `add dword [rbp + disp], imm8`.
    pub fn add_state_imm8(&mut self, disp: i32, imm: i8) {
        self.put(&[0x83, 0x85]);
        self.imm32(disp as u32);
        self.put(&[imm as u8]);
    }

    /// `mov dst, imm32`.
    pub fn mov_imm(&mut self, dst: Reg, imm: u32) {
        self.put(&[0xb8 + dst as u8]);
        self.imm32(imm);
    }

    fn alu_rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.put(&[opcode, 0xc0 | (src as u8) << 3 | dst as u8]);
    }

    /// `add dst, src`.
    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x01, dst, src);
    }

    /// `or dst, src`.
    pub fn or_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x09, dst, src);
    }

    /// `and dst, src`.
    pub fn and_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x21, dst, src);
    }

    /// `xor dst, src`.
    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x31, dst, src);
    }

    /// `cmp a, b`: flags reflect `a - b`.
    pub fn cmp_rr(&mut self, a: Reg, b: Reg) {
        self.alu_rr(0x39, a, b);
    }

    fn alu_imm(&mut self, ext: u8, dst: Reg, imm: u32) {
        self.put(&[0x81, 0xc0 | ext << 3 | dst as u8]);
        self.imm32(imm);
    }

    /// `add dst, imm32`.
    pub fn add_imm(&mut self, dst: Reg, imm: u32) {
        self.alu_imm(0, dst, imm);
    }

    /// `or dst, imm32`.
    pub fn or_imm(&mut self, dst: Reg, imm: u32) {
        self.alu_imm(1, dst, imm);
    }

    /// `and dst, imm32`.
    pub fn and_imm(&mut self, dst: Reg, imm: u32) {
        self.alu_imm(4, dst, imm);
    }

    /// `setb dst8`: dst's low byte becomes 1 on unsigned below, else 0.
    pub fn setb(&mut self, dst: Reg) {
        self.put(&[0x0f, 0x92, 0xc0 | dst as u8]);
    }

    /// `mov dst, src` (64-bit), used for shuffling pointer arguments.
    pub fn mov64_rr(&mut self, dst: Reg, src: Reg) {
        self.put(&[0x48, 0x89, 0xc0 | (src as u8) << 3 | dst as u8]);
    }

    /// `mov rax, imm64; call rax`, an absolute call into a helper thunk.
    pub fn call_ptr(&mut self, target: usize) {
        self.put(&[0x48, 0xb8]);
        self.put(&target.to_le_bytes());
        self.put(&[0xff, 0xd0]);
    }

    /// Forward short conditional jump; resolve with [`Asm::bind`].
    pub fn jcc(&mut self, cc: Cc) -> Label {
        self.put(&[cc as u8, 0x00]);
        Label(self.pos - 1)
    }

    /// Forward short unconditional jump; resolve with [`Asm::bind`].
    pub fn jmp(&mut self) -> Label {
        self.put(&[0xeb, 0x00]);
        Label(self.pos - 1)
    }

    /// Point a pending short jump at the current position.
    pub fn bind(&mut self, label: Label) {
        let rel = self.pos - (label.0 + 1);
        debug_assert!(rel <= i8::MAX as usize, "short jump out of range");
        self.buf[label.0] = rel as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut Asm)) -> Vec<u8> {
        let mut buf = [0u8; 128];
        let mut asm = Asm::new(&mut buf);
        f(&mut asm);
        let len = asm.len();
        buf[..len].to_vec()
    }

    #[test]
    fn test_prologue_epilogue() {
        let code = emit(|asm| {
            asm.prologue();
            asm.epilogue();
        });
        assert_eq!(code, [0x55, 0x48, 0x89, 0xfd, 0x5d, 0xc3]);
    }

    #[test]
    fn test_state_access() {
        // mov ecx, [rbp + 8]
        let code = emit(|asm| asm.load_state(Reg::Ecx, 8));
        assert_eq!(code, [0x8b, 0x8d, 0x08, 0x00, 0x00, 0x00]);

        // mov [rbp + 0x100], edx
        let code = emit(|asm| asm.store_state(0x100, Reg::Edx));
        assert_eq!(code, [0x89, 0x95, 0x00, 0x01, 0x00, 0x00]);

        // mov dword [rbp + 4], 0xdeadbeef
        let code = emit(|asm| asm.store_state_imm(4, 0xdead_beef));
        assert_eq!(
            code,
            [0xc7, 0x85, 0x04, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde]
        );
    }

    #[test]
    fn test_alu_encodings() {
        // add ecx, edx
        assert_eq!(emit(|asm| asm.add_rr(Reg::Ecx, Reg::Edx)), [0x01, 0xd1]);
        // xor eax, eax
        assert_eq!(emit(|asm| asm.xor_rr(Reg::Eax, Reg::Eax)), [0x31, 0xc0]);
        // cmp ecx, edx
        assert_eq!(emit(|asm| asm.cmp_rr(Reg::Ecx, Reg::Edx)), [0x39, 0xd1]);
        // and ecx, 0x10000
        assert_eq!(
            emit(|asm| asm.and_imm(Reg::Ecx, 1 << 16)),
            [0x81, 0xe1, 0x00, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn test_mov_rdi_rbp() {
        // mov rdi, rbp
        assert_eq!(
            emit(|asm| asm.mov64_rr(Reg::Edi, Reg::Ebp)),
            [0x48, 0x89, 0xef]
        );
    }

    #[test]
    fn test_short_jump_fixup() {
        let code = emit(|asm| {
            let skip = asm.jcc(Cc::Ne);
            asm.nop();
            asm.nop();
            asm.nop();
            asm.bind(skip);
            asm.nop();
        });
        // jne +3 over the three nops
        assert_eq!(code, [0x75, 0x03, 0x90, 0x90, 0x90, 0x90]);
    }

    #[test]
    fn test_call_ptr_length() {
        let code = emit(|asm| asm.call_ptr(0x1122_3344_5566_7788));
        assert_eq!(code.len(), 12);
        assert_eq!(&code[..2], [0x48, 0xb8]);
        assert_eq!(&code[10..], [0xff, 0xd0]);
    }

    #[test]
    #[should_panic(expected = "code buffer overflow")]
    fn test_overflow_detected() {
        let mut buf = [0u8; 4];
        let mut asm = Asm::new(&mut buf);
        asm.store_state_imm(0, 0);
    }
}
