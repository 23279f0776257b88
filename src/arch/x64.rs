//! AMD64 instruction encoder.
//!
//! Every method emits one instruction in its 64-bit form. Operand shapes are
//! checked at emission time; a shape the encoder has no form for is an
//! [`AsmError`], never a silently different instruction.

use std::fmt;

use thiserror::Error;

// ─── Registers and operands ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    pub const ALL: [Reg; 16] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    /// Hardware encoding, 0..16.
    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: u32) -> Option<Reg> {
        Self::ALL.get(n as usize).copied()
    }

    fn low(self) -> u8 {
        self.number() & 7
    }

    fn extended(self) -> bool {
        self.number() >= 8
    }

    pub fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rbx => "rbx",
            Reg::Rsp => "rsp",
            Reg::Rbp => "rbp",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Condition codes, numbered as in the `jcc` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cond {
    pub const ALL: [Cond; 16] = [
        Cond::O,
        Cond::No,
        Cond::B,
        Cond::Ae,
        Cond::E,
        Cond::Ne,
        Cond::Be,
        Cond::A,
        Cond::S,
        Cond::Ns,
        Cond::P,
        Cond::Np,
        Cond::L,
        Cond::Ge,
        Cond::Le,
        Cond::G,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Cond> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn negate(self) -> Cond {
        Self::ALL[(self.code() ^ 1) as usize]
    }

    pub fn suffix(self) -> &'static str {
        [
            "o", "no", "b", "ae", "e", "ne", "be", "a", "s", "ns", "p", "np", "l", "ge", "le", "g",
        ][self.code() as usize]
    }
}

/// `[base + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub base: Reg,
    pub disp: i32,
}

impl Address {
    pub fn new(base: Reg, disp: i32) -> Self {
        Self { base, disp }
    }
}

/// Signed hex as the disassembler prints it: `0x10`, `-0x8`.
pub fn fmt_signed(n: i64) -> String {
    if n < 0 {
        format!("-{:#x}", n.unsigned_abs())
    } else {
        format!("{n:#x}")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.disp {
            0 => write!(f, "[{}]", self.base),
            d if d < 0 => write!(f, "[{}-{:#x}]", self.base, (d as i64).unsigned_abs()),
            d => write!(f, "[{}+{d:#x}]", self.base),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Mem(Address),
    Imm(i64),
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Self {
        Operand::Reg(r)
    }
}

impl From<Address> for Operand {
    fn from(a: Address) -> Self {
        Operand::Mem(a)
    }
}

impl From<i64> for Operand {
    fn from(n: i64) -> Self {
        Operand::Imm(n)
    }
}

impl From<i32> for Operand {
    fn from(n: i32) -> Self {
        Operand::Imm(n as i64)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Mem(a) => write!(f, "{a}"),
            Operand::Imm(n) => f.write_str(&fmt_signed(*n)),
        }
    }
}

// ─── Errors and output ──────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AsmError {
    #[error("no encoding for `{mnemonic} {operands}`")]
    InvalidOperands {
        mnemonic: &'static str,
        operands: String,
    },

    #[error("immediate {value} does not fit in {bits} bits")]
    ImmediateOutOfRange { value: i64, bits: u32 },

    #[error("label {0} marked twice")]
    LabelRebound(usize),

    #[error("label {0} has pending jumps but was never marked")]
    UnboundLabel(usize),
}

/// A jump target, possibly not yet placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// A location in the emitted bytes that depends on where things end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A rel32 field at `at` pointing to offset `target`.
    Relative {
        at: usize,
        target: usize,
        direction: Direction,
    },
    /// A 64-bit absolute address embedded at `at`.
    Absolute { at: usize, address: u64 },
}

/// Finished machine code.
#[derive(Debug, Clone, Default)]
pub struct Code {
    pub bytes: Vec<u8>,
    pub references: Vec<Reference>,
}

#[derive(Debug, Default)]
struct LabelState {
    offset: Option<usize>,
    patches: Vec<usize>,
}

// ─── Assembler ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Assembler {
    buf: Vec<u8>,
    labels: Vec<LabelState>,
    references: Vec<Reference>,
}

fn invalid(mnemonic: &'static str, operands: &[Operand]) -> AsmError {
    AsmError::InvalidOperands {
        mnemonic,
        operands: operands
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn imm32(value: i64) -> Result<i32, AsmError> {
    i32::try_from(value).map_err(|_| AsmError::ImmediateOutOfRange { value, bits: 32 })
}

/// Opcode extensions of the 0x81/0x83 group.
#[derive(Clone, Copy)]
enum AluOp {
    Add,
    And,
    Sub,
    Cmp,
}

impl AluOp {
    fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::And => "and",
            AluOp::Sub => "sub",
            AluOp::Cmp => "cmp",
        }
    }

    /// Opcode of the `r/m64, r64` form.
    fn rr_opcode(self) -> u8 {
        match self {
            AluOp::Add => 0x01,
            AluOp::And => 0x21,
            AluOp::Sub => 0x29,
            AluOp::Cmp => 0x39,
        }
    }

    fn extension(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Cmp => 7,
        }
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current emission offset.
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn rex(&mut self, w: bool, reg: u8, base: Reg) {
        let rex = 0x40 | (u8::from(w) << 3) | ((reg >> 3) << 2) | u8::from(base.extended());
        if rex != 0x40 {
            self.byte(rex);
        }
    }

    /// ModRM with a register `rm`.
    fn modrm_reg(&mut self, reg: u8, rm: Reg) {
        self.byte(0xC0 | ((reg & 7) << 3) | rm.low());
    }

    /// ModRM (plus SIB and displacement) for `[base + disp]`.
    fn modrm_mem(&mut self, reg: u8, addr: Address) {
        let base = addr.base;
        let disp = addr.disp;
        let mode = if disp == 0 && base.low() != 5 {
            0b00
        } else if i8::try_from(disp).is_ok() {
            0b01
        } else {
            0b10
        };
        self.byte((mode << 6) | ((reg & 7) << 3) | base.low());
        if base.low() == 4 {
            self.byte(0x24);
        }
        match mode {
            0b01 => self.byte(disp as i8 as u8),
            0b10 => self.buf.extend_from_slice(&disp.to_le_bytes()),
            _ => {}
        }
    }

    /// REX.W + opcode + ModRM for a register-or-memory operand.
    fn op_rm(&mut self, opcode: &[u8], reg: u8, rm: Operand) {
        match rm {
            Operand::Reg(r) => {
                self.rex(true, reg, r);
                self.buf.extend_from_slice(opcode);
                self.modrm_reg(reg, r);
            }
            Operand::Mem(a) => {
                self.rex(true, reg, a.base);
                self.buf.extend_from_slice(opcode);
                self.modrm_mem(reg, a);
            }
            Operand::Imm(_) => unreachable!("immediate as r/m operand"),
        }
    }

    pub fn mov(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> Result<(), AsmError> {
        let (dst, src) = (dst.into(), src.into());
        match (dst, src) {
            (Operand::Reg(_), Operand::Reg(s)) | (Operand::Mem(_), Operand::Reg(s)) => {
                self.op_rm(&[0x89], s.number(), dst);
            }
            (Operand::Reg(d), Operand::Mem(_)) => self.op_rm(&[0x8B], d.number(), src),
            (Operand::Reg(d), Operand::Imm(n)) => match i32::try_from(n) {
                Ok(n) => {
                    self.op_rm(&[0xC7], 0, dst);
                    self.buf.extend_from_slice(&n.to_le_bytes());
                }
                Err(_) => {
                    self.rex(true, 0, d);
                    self.byte(0xB8 + d.low());
                    self.buf.extend_from_slice(&n.to_le_bytes());
                }
            },
            (Operand::Mem(_), Operand::Imm(n)) => {
                let n = imm32(n)?;
                self.op_rm(&[0xC7], 0, dst);
                self.buf.extend_from_slice(&n.to_le_bytes());
            }
            _ => return Err(invalid("mov", &[dst, src])),
        }
        Ok(())
    }

    /// `mov dst, imm64` carrying an address, recorded as an absolute
    /// reference.
    pub fn mov_address(&mut self, dst: Reg, address: u64) {
        self.rex(true, 0, dst);
        self.byte(0xB8 + dst.low());
        let at = self.offset();
        self.buf.extend_from_slice(&address.to_le_bytes());
        self.references.push(Reference::Absolute { at, address });
    }

    fn alu(&mut self, op: AluOp, dst: Operand, src: Operand) -> Result<(), AsmError> {
        match (dst, src) {
            (Operand::Reg(_), Operand::Reg(s)) => self.op_rm(&[op.rr_opcode()], s.number(), dst),
            (Operand::Reg(_), Operand::Imm(n)) => match i8::try_from(n) {
                Ok(n) => {
                    self.op_rm(&[0x83], op.extension(), dst);
                    self.byte(n as u8);
                }
                Err(_) => {
                    let n = imm32(n)?;
                    self.op_rm(&[0x81], op.extension(), dst);
                    self.buf.extend_from_slice(&n.to_le_bytes());
                }
            },
            _ => return Err(invalid(op.mnemonic(), &[dst, src])),
        }
        Ok(())
    }

    pub fn add(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.alu(AluOp::Add, dst.into(), src.into())
    }

    pub fn sub(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.alu(AluOp::Sub, dst.into(), src.into())
    }

    pub fn and(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.alu(AluOp::And, dst.into(), src.into())
    }

    pub fn cmp(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.alu(AluOp::Cmp, dst.into(), src.into())
    }

    /// `imul dst, src` (two operands) .
    pub fn imul(&mut self, dst: Reg, src: impl Into<Operand>) -> Result<(), AsmError> {
        match src.into() {
            src @ Operand::Reg(_) => {
                self.op_rm(&[0x0F, 0xAF], dst.number(), src);
                Ok(())
            }
            src => Err(invalid("imul", &[dst.into(), src])),
        }
    }

    /// `imul dst, src, imm`.
    pub fn imul_imm(&mut self, dst: Reg, src: Reg, imm: i64) -> Result<(), AsmError> {
        match i8::try_from(imm) {
            Ok(n) => {
                self.op_rm(&[0x6B], dst.number(), src.into());
                self.byte(n as u8);
            }
            Err(_) => {
                let n = imm32(imm)?;
                self.op_rm(&[0x69], dst.number(), src.into());
                self.buf.extend_from_slice(&n.to_le_bytes());
            }
        }
        Ok(())
    }

    fn shift(&mut self, mnemonic: &'static str, ext: u8, dst: Reg, amount: i64) -> Result<(), AsmError> {
        let amount = u8::try_from(amount)
            .ok()
            .filter(|n| *n < 64)
            .ok_or_else(|| invalid(mnemonic, &[dst.into(), Operand::Imm(amount)]))?;
        self.op_rm(&[0xC1], ext, dst.into());
        self.byte(amount);
        Ok(())
    }

    pub fn shl(&mut self, dst: Reg, amount: i64) -> Result<(), AsmError> {
        self.shift("shl", 4, dst, amount)
    }

    pub fn shr(&mut self, dst: Reg, amount: i64) -> Result<(), AsmError> {
        self.shift("shr", 5, dst, amount)
    }

    pub fn sar(&mut self, dst: Reg, amount: i64) -> Result<(), AsmError> {
        self.shift("sar", 7, dst, amount)
    }

    pub fn test(&mut self, a: Reg, b: Reg) {
        self.op_rm(&[0x85], b.number(), a.into());
    }

    pub fn push(&mut self, r: Reg) {
        self.rex(false, 0, r);
        self.byte(0x50 + r.low());
    }

    pub fn pop(&mut self, r: Reg) {
        self.rex(false, 0, r);
        self.byte(0x58 + r.low());
    }

    /// Indirect `call r`.
    pub fn call(&mut self, target: Reg) {
        self.rex(false, 0, target);
        self.byte(0xFF);
        self.modrm_reg(2, target);
    }

    pub fn ret(&mut self) {
        self.byte(0xC3);
    }

    pub fn leave(&mut self) {
        self.byte(0xC9);
    }

    pub fn nop(&mut self) {
        self.byte(0x90);
    }

    pub fn int3(&mut self) {
        self.byte(0xCC);
    }

    // ─── Labels ─────────────────────────────────────────────────────────────

    pub fn label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        Label(self.labels.len() - 1)
    }

    /// Places `label` at the current offset and patches the jumps waiting
    /// for it.
    pub fn mark(&mut self, label: Label) -> Result<(), AsmError> {
        let target = self.offset();
        let state = &mut self.labels[label.0];
        if state.offset.is_some() {
            return Err(AsmError::LabelRebound(label.0));
        }
        state.offset = Some(target);
        for at in std::mem::take(&mut state.patches) {
            let rel = (target as i64 - (at as i64 + 4)) as i32;
            self.buf[at..at + 4].copy_from_slice(&rel.to_le_bytes());
            self.references.push(Reference::Relative {
                at,
                target,
                direction: Direction::Forward,
            });
        }
        Ok(())
    }

    /// Emits the rel32 field of a jump to `label`.
    fn rel32(&mut self, label: Label) {
        let at = self.offset();
        match self.labels[label.0].offset {
            Some(target) => {
                let rel = (target as i64 - (at as i64 + 4)) as i32;
                self.buf.extend_from_slice(&rel.to_le_bytes());
                self.references.push(Reference::Relative {
                    at,
                    target,
                    direction: Direction::Backward,
                });
            }
            None => {
                self.buf.extend_from_slice(&[0; 4]);
                self.labels[label.0].patches.push(at);
            }
        }
    }

    pub fn jmp(&mut self, label: Label) {
        self.byte(0xE9);
        self.rel32(label);
    }

    pub fn jcc(&mut self, cond: Cond, label: Label) {
        self.byte(0x0F);
        self.byte(0x80 + cond.code());
        self.rel32(label);
    }

    /// Checks that every jump found its label and hands over the code.
    pub fn finish(self) -> Result<Code, AsmError> {
        if let Some(i) = self.labels.iter().position(|l| !l.patches.is_empty()) {
            return Err(AsmError::UnboundLabel(i));
        }
        Ok(Code {
            bytes: self.buf,
            references: self.references,
        })
    }
}
