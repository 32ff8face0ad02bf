//! x86-64 code generation (System V AMD64 ABI).
//!
//! A minimal instruction encoder plus the `CodegenBackend` implementation
//! for 64-bit x86. Arguments arrive in rdi, rsi, rdx, rcx, r8, r9 and are
//! spilled to the frame in the prologue; the operand stack lives on the
//! hardware stack via push/pop; the result is returned in rax.

use std::collections::HashMap;

use crate::backend::CodegenBackend;
use crate::codebuf::CodeBuffer;
use crate::error::JitError;
use crate::native::FAULT_SENTINEL;
use crate::translate::{BinOp, CmpOp, LoweredOp, TranslatedFunction};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
}

impl Reg {
    /// Lower 3 bits of the register number.
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    fn rex_b(self) -> u8 {
        if self.needs_rex_ext() {
            0x01
        } else {
            0x00
        }
    }

    fn rex_r(self) -> u8 {
        if self.needs_rex_ext() {
            0x04
        } else {
            0x00
        }
    }
}

/// Argument registers in System V order.
pub const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Condition codes for Jcc / SETcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    /// Equal / zero
    E = 0x4,
    /// Not equal / not zero
    Ne = 0x5,
    /// Signed less-than
    L = 0xC,
    /// Signed greater-than
    G = 0xF,
}

/// Minimal x86-64 instruction encoder over a code buffer.
pub struct Asm<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> Asm<'a> {
    /// Wrap a code buffer.
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    fn rex_w(&mut self, reg: Reg, rm: Reg) {
        self.buf.emit_u8(0x48 | reg.rex_r() | rm.rex_b());
    }

    fn rex_w_single(&mut self, rm: Reg) {
        self.buf.emit_u8(0x48 | rm.rex_b());
    }

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.rex_w_single(dst);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r64, [base + disp]
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(dst, base);
        self.buf.emit_u8(0x8B);
        self.mem_operand(dst.code(), base, disp);
    }

    /// MOV [base + disp], r64
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_w(src, base);
        self.buf.emit_u8(0x89);
        self.mem_operand(src.code(), base, disp);
    }

    fn mem_operand(&mut self, reg: u8, base: Reg, disp: i32) {
        // RSP as base needs a SIB byte; RBP with mod=00 means rip-relative,
        // so it always carries a displacement
        let needs_sib = base == Reg::Rsp;
        let rm = if needs_sib { 0b100 } else { base.code() };

        if disp == 0 && base != Reg::Rbp {
            self.buf.emit_u8(Self::modrm(0b00, reg, rm));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
        } else if (-128..=127).contains(&disp) {
            self.buf.emit_u8(Self::modrm(0b01, reg, rm));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
            self.buf.emit_u8(disp as u8);
        } else {
            self.buf.emit_u8(Self::modrm(0b10, reg, rm));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
            self.buf.emit_u32(disp as u32);
        }
    }

    /// ADD r64, r64
    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.buf.emit_u8(0x01);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// SUB r64, r64
    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.buf.emit_u8(0x29);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// SUB r64, imm32
    pub fn sub_ri32(&mut self, dst: Reg, imm: i32) {
        self.rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, 5, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, 5, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// IMUL r64, r64
    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(dst, src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// CQO (sign-extend rax into rdx:rax before IDIV)
    pub fn cqo(&mut self) {
        self.buf.emit_u8(0x48);
        self.buf.emit_u8(0x99);
    }

    /// IDIV r64 (divide rdx:rax, quotient in rax)
    pub fn idiv(&mut self, src: Reg) {
        self.rex_w_single(src);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 7, src.code()));
    }

    /// CMP r64, r64 (flags from dst - src)
    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.buf.emit_u8(0x39);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// CMP r64, imm32
    pub fn cmp_ri32(&mut self, dst: Reg, imm: i32) {
        self.rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, 7, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, 7, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// TEST r64, r64
    pub fn test_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.buf.emit_u8(0x85);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// XOR r64, r64
    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.buf.emit_u8(0x31);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// SETcc al
    pub fn setcc_al(&mut self, cond: Cond) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x90 + cond as u8);
        self.buf.emit_u8(Self::modrm(0b11, 0, Reg::Rax.code()));
    }

    /// MOVZX rax, al
    pub fn movzx_rax_al(&mut self) {
        self.buf.emit_u8(0x48);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6);
        self.buf.emit_u8(Self::modrm(0b11, Reg::Rax.code(), Reg::Rax.code()));
    }

    /// JMP rel32 with a placeholder offset; returns the patch location.
    pub fn jmp_rel32_placeholder(&mut self) -> usize {
        self.buf.emit_u8(0xE9);
        let at = self.buf.len();
        self.buf.emit_u32(0);
        at
    }

    /// Jcc rel32 with a placeholder offset; returns the patch location.
    pub fn jcc_rel32_placeholder(&mut self, cond: Cond) -> usize {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        let at = self.buf.len();
        self.buf.emit_u32(0);
        at
    }

    /// Jcc rel8 with a known short offset.
    pub fn jcc_rel8(&mut self, cond: Cond, offset: i8) {
        self.buf.emit_u8(0x70 + cond as u8);
        self.buf.emit_u8(offset as u8);
    }

    /// LEAVE (mov rsp, rbp; pop rbp)
    pub fn leave(&mut self) {
        self.buf.emit_u8(0xC9);
    }

    /// RET
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }
}

/// Code generator for 64-bit x86.
#[derive(Debug, Default)]
pub struct X86_64Backend {
    arg_count: u8,
    slot_count: u16,
    native_offsets: HashMap<usize, usize>,
    branch_fixups: Vec<(usize, usize)>,
    fault_fixups: Vec<usize>,
}

impl X86_64Backend {
    /// Create a fresh backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn arg_disp(index: u8) -> i32 {
        -8 * (index as i32 + 1)
    }

    fn slot_disp(&self, slot: u16) -> i32 {
        -8 * (self.arg_count as i32 + slot as i32 + 1)
    }
}

impl CodegenBackend for X86_64Backend {
    fn architecture(&self) -> &'static str {
        "x86_64"
    }

    fn emit_prologue(&mut self, buf: &mut CodeBuffer, func: &TranslatedFunction) -> Result<(), JitError> {
        self.arg_count = func.arg_count;
        self.slot_count = func.slot_count;
        self.native_offsets.clear();

        let mut asm = Asm::new(buf);
        asm.push(Reg::Rbp);
        asm.mov_rr(Reg::Rbp, Reg::Rsp);

        let frame = 8 * (func.arg_count as i32 + func.slot_count as i32);
        let frame = (frame + 15) & !15;
        if frame > 0 {
            asm.sub_ri32(Reg::Rsp, frame);
        }

        for index in 0..func.arg_count {
            asm.mov_mr(Reg::Rbp, Self::arg_disp(index), ARG_REGS[index as usize]);
        }

        // Named-variable slots start zeroed
        if func.slot_count > 0 {
            asm.xor_rr(Reg::Rax, Reg::Rax);
            for slot in 0..func.slot_count {
                let disp = self.slot_disp(slot);
                asm.mov_mr(Reg::Rbp, disp, Reg::Rax);
            }
        }
        Ok(())
    }

    fn emit_body(&mut self, buf: &mut CodeBuffer, func: &TranslatedFunction) -> Result<(), JitError> {
        for inst in &func.insts {
            self.native_offsets.insert(inst.offset, buf.len());
            let mut asm = Asm::new(buf);
            match inst.op {
                LoweredOp::PushConst(value) => {
                    asm.mov_ri64(Reg::Rax, value);
                    asm.push(Reg::Rax);
                }
                LoweredOp::PushArg(index) => {
                    asm.mov_rm(Reg::Rax, Reg::Rbp, Self::arg_disp(index));
                    asm.push(Reg::Rax);
                }
                LoweredOp::PushSlot(slot) => {
                    let disp = self.slot_disp(slot);
                    asm.mov_rm(Reg::Rax, Reg::Rbp, disp);
                    asm.push(Reg::Rax);
                }
                LoweredOp::StoreSlot(slot) => {
                    let disp = self.slot_disp(slot);
                    asm.mov_rm(Reg::Rax, Reg::Rsp, 0);
                    asm.mov_mr(Reg::Rbp, disp, Reg::Rax);
                }
                LoweredOp::Binary(op) => {
                    // rsi is caller-saved scratch; the argument registers
                    // were spilled in the prologue
                    asm.pop(Reg::Rsi);
                    asm.pop(Reg::Rax);
                    match op {
                        BinOp::Add => asm.add_rr(Reg::Rax, Reg::Rsi),
                        BinOp::Sub => asm.sub_rr(Reg::Rax, Reg::Rsi),
                        BinOp::Mul => asm.imul_rr(Reg::Rax, Reg::Rsi),
                        BinOp::Div => {
                            // Zero divisor and MIN / -1 both route to the
                            // fault epilogue; IDIV traps on either
                            asm.test_rr(Reg::Rsi, Reg::Rsi);
                            let at = asm.jcc_rel32_placeholder(Cond::E);
                            self.fault_fixups.push(at);

                            asm.cmp_ri32(Reg::Rsi, -1);
                            // Skip the MIN comparison: movabs(10) + cmp(3)
                            // + je rel32(6) = 19 bytes
                            asm.jcc_rel8(Cond::Ne, 19);
                            asm.mov_ri64(Reg::Rcx, i64::MIN);
                            asm.cmp_rr(Reg::Rax, Reg::Rcx);
                            let at = asm.jcc_rel32_placeholder(Cond::E);
                            self.fault_fixups.push(at);

                            asm.cqo();
                            asm.idiv(Reg::Rsi);
                        }
                    }
                    asm.push(Reg::Rax);
                }
                LoweredOp::Compare(op) => {
                    asm.pop(Reg::Rsi);
                    asm.pop(Reg::Rax);
                    asm.cmp_rr(Reg::Rax, Reg::Rsi);
                    let cond = match op {
                        CmpOp::Eq => Cond::E,
                        CmpOp::Gt => Cond::G,
                        CmpOp::Lt => Cond::L,
                    };
                    asm.setcc_al(cond);
                    asm.movzx_rax_al();
                    asm.push(Reg::Rax);
                }
                LoweredOp::Jump { target } => {
                    let at = asm.jmp_rel32_placeholder();
                    self.branch_fixups.push((at, target));
                }
                LoweredOp::JumpIfFalse { target } => {
                    asm.pop(Reg::Rax);
                    asm.test_rr(Reg::Rax, Reg::Rax);
                    let at = asm.jcc_rel32_placeholder(Cond::E);
                    self.branch_fixups.push((at, target));
                }
                LoweredOp::Return => {
                    asm.pop(Reg::Rax);
                    asm.leave();
                    asm.ret();
                }
            }
        }

        for (at, target) in self.branch_fixups.drain(..) {
            let native = *self
                .native_offsets
                .get(&target)
                .ok_or_else(|| JitError::Malformed(format!("unresolved branch target {}", target)))?;
            let rel = native as i64 - (at as i64 + 4);
            buf.patch_u32(at, rel as i32 as u32);
        }
        Ok(())
    }

    fn emit_epilogue(&mut self, buf: &mut CodeBuffer) -> Result<(), JitError> {
        if self.fault_fixups.is_empty() {
            return Ok(());
        }
        let fault_at = buf.len();
        for at in self.fault_fixups.drain(..) {
            let rel = fault_at as i64 - (at as i64 + 4);
            buf.patch_u32(at, rel as i32 as u32);
        }
        let mut asm = Asm::new(buf);
        asm.mov_ri64(Reg::Rax, FAULT_SENTINEL);
        asm.leave();
        asm.ret();
        Ok(())
    }
}
