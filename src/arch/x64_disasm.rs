//! Decoder for exactly the instruction forms [`super::x64::Assembler`] emits.
//!
//! Output text uses the same operand syntax the assembler's error messages
//! use, so an assembled listing reads back as it was written. Jump targets
//! are printed as absolute addresses relative to the `base` given.

use std::fmt;

use thiserror::Error;

use super::x64::{Address, Cond, Reg, fmt_signed};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DisasmError {
    #[error("instruction at {at:#x} runs past the end of the code")]
    Truncated { at: usize },

    #[error("unknown encoding at {at:#x} (byte {byte:#04x})")]
    Unknown { at: usize, byte: u8 },
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub len: usize,
    pub bytes: Vec<u8>,
    pub text: String,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self
            .bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        write!(f, "{:016x}  {:<30} ; {hex}", self.address, self.text)
    }
}

/// The register or memory operand of a ModRM byte.
enum Rm {
    Reg(Reg),
    Mem(Address),
}

impl fmt::Display for Rm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rm::Reg(r) => write!(f, "{r}"),
            Rm::Mem(a) => write!(f, "{a}"),
        }
    }
}

struct Cursor<'a> {
    code: &'a [u8],
    start: usize,
    pos: usize,
}

impl Cursor<'_> {
    fn byte(&mut self) -> Result<u8, DisasmError> {
        let b = *self
            .code
            .get(self.pos)
            .ok_or(DisasmError::Truncated { at: self.start })?;
        self.pos += 1;
        Ok(b)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DisasmError> {
        let bytes = self
            .code
            .get(self.pos..self.pos + N)
            .ok_or(DisasmError::Truncated { at: self.start })?;
        self.pos += N;
        let mut out = [0; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn imm8(&mut self) -> Result<i64, DisasmError> {
        Ok(self.byte()? as i8 as i64)
    }

    fn imm32(&mut self) -> Result<i64, DisasmError> {
        Ok(i32::from_le_bytes(self.array()?) as i64)
    }

    fn imm64(&mut self) -> Result<i64, DisasmError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn unknown(&self, byte: u8) -> DisasmError {
        DisasmError::Unknown {
            at: self.start,
            byte,
        }
    }
}

#[derive(Clone, Copy, Default)]
struct Rex {
    w: bool,
    r: bool,
    b: bool,
}

fn reg(low: u8, ext: bool) -> Reg {
    Reg::ALL[(low & 7) as usize + if ext { 8 } else { 0 }]
}

/// Decodes a ModRM (and SIB/displacement). Returns the `reg` field and the
/// r/m operand.
fn modrm(c: &mut Cursor<'_>, rex: Rex) -> Result<(u8, Rm), DisasmError> {
    let m = c.byte()?;
    let mode = m >> 6;
    let reg_field = ((m >> 3) & 7) | if rex.r { 8 } else { 0 };
    let rm = m & 7;
    if mode == 0b11 {
        return Ok((reg_field, Rm::Reg(reg(rm, rex.b))));
    }
    if rm == 4 {
        let sib = c.byte()?;
        // Only "no index, base = rsp/r12" is ever emitted.
        if sib != 0x24 {
            return Err(c.unknown(sib));
        }
    } else if rm == 5 && mode == 0b00 {
        return Err(c.unknown(m));
    }
    let disp = match mode {
        0b00 => 0,
        0b01 => c.imm8()? as i32,
        _ => c.imm32()? as i32,
    };
    Ok((reg_field, Rm::Mem(Address::new(reg(rm, rex.b), disp))))
}

fn alu_name(ext: u8) -> Option<&'static str> {
    match ext {
        0 => Some("add"),
        4 => Some("and"),
        5 => Some("sub"),
        7 => Some("cmp"),
        _ => None,
    }
}

fn decode_one(c: &mut Cursor<'_>, base: u64) -> Result<String, DisasmError> {
    let mut op = c.byte()?;
    let mut rex = Rex::default();
    if op & 0xF0 == 0x40 {
        rex = Rex {
            w: op & 8 != 0,
            r: op & 4 != 0,
            b: op & 1 != 0,
        };
        op = c.byte()?;
    }
    let text = match op {
        0x50..=0x57 => format!("push {}", reg(op, rex.b)),
        0x58..=0x5F => format!("pop {}", reg(op, rex.b)),
        0xC3 => "ret".into(),
        0xC9 => "leave".into(),
        0x90 => "nop".into(),
        0xCC => "int3".into(),
        _ if !rex.w && !matches!(op, 0xFF | 0xE9 | 0x0F) => return Err(c.unknown(op)),
        0x89 => {
            let (r, rm) = modrm(c, rex)?;
            format!("mov {rm}, {}", reg(r, r >= 8))
        }
        0x8B => {
            let (r, rm) = modrm(c, rex)?;
            format!("mov {}, {rm}", reg(r, r >= 8))
        }
        0xC7 => {
            let (_, rm) = modrm(c, rex)?;
            let imm = fmt_signed(c.imm32()?);
            match rm {
                Rm::Reg(r) => format!("mov {r}, {imm}"),
                Rm::Mem(a) => format!("mov qword {a}, {imm}"),
            }
        }
        0xB8..=0xBF => format!("mov {}, {}", reg(op, rex.b), fmt_signed(c.imm64()?)),
        0x01 | 0x21 | 0x29 | 0x39 | 0x85 => {
            let name = match op {
                0x01 => "add",
                0x21 => "and",
                0x29 => "sub",
                0x39 => "cmp",
                _ => "test",
            };
            let (r, rm) = modrm(c, rex)?;
            format!("{name} {rm}, {}", reg(r, r >= 8))
        }
        0x83 | 0x81 => {
            let (ext, rm) = modrm(c, rex)?;
            let name = alu_name(ext & 7).ok_or_else(|| c.unknown(op))?;
            let imm = if op == 0x83 { c.imm8()? } else { c.imm32()? };
            format!("{name} {rm}, {}", fmt_signed(imm))
        }
        0x6B | 0x69 => {
            let (r, rm) = modrm(c, rex)?;
            let imm = if op == 0x6B { c.imm8()? } else { c.imm32()? };
            format!("imul {}, {rm}, {}", reg(r, r >= 8), fmt_signed(imm))
        }
        0xC1 => {
            let (ext, rm) = modrm(c, rex)?;
            let name = match ext & 7 {
                4 => "shl",
                5 => "shr",
                7 => "sar",
                _ => return Err(c.unknown(op)),
            };
            format!("{name} {rm}, {}", fmt_signed(c.imm8()? & 0xFF))
        }
        0xFF => {
            let (ext, rm) = modrm(c, rex)?;
            match (ext & 7, rm) {
                (2, Rm::Reg(r)) => format!("call {r}"),
                _ => return Err(c.unknown(op)),
            }
        }
        0xE9 => {
            let rel = c.imm32()?;
            let target = (base + c.pos as u64).wrapping_add_signed(rel);
            format!("jmp {target:#x}")
        }
        0x0F => {
            let op2 = c.byte()?;
            match op2 {
                0xAF if rex.w => {
                    let (r, rm) = modrm(c, rex)?;
                    format!("imul {}, {rm}", reg(r, r >= 8))
                }
                0x80..=0x8F => {
                    let cond = Cond::from_code(op2 - 0x80).ok_or_else(|| c.unknown(op2))?;
                    let rel = c.imm32()?;
                    let target = (base + c.pos as u64).wrapping_add_signed(rel);
                    format!("j{} {target:#x}", cond.suffix())
                }
                _ => return Err(c.unknown(op2)),
            }
        }
        _ => return Err(c.unknown(op)),
    };
    Ok(text)
}

/// Decodes all of `code`, which is assumed to be loaded at `base`.
pub fn disassemble(code: &[u8], base: u64) -> Result<Vec<Instruction>, DisasmError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < code.len() {
        let mut cursor = Cursor {
            code,
            start: pos,
            pos,
        };
        let text = decode_one(&mut cursor, base)?;
        out.push(Instruction {
            address: base + pos as u64,
            len: cursor.pos - pos,
            bytes: code[pos..cursor.pos].to_vec(),
            text,
        });
        pos = cursor.pos;
    }
    Ok(out)
}

/// One line per instruction, for logs.
pub fn listing(code: &[u8], base: u64) -> Result<String, DisasmError> {
    Ok(disassemble(code, base)?
        .iter()
        .map(|i| format!("{i}\n"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x64::Assembler;

    /// Every form the assembler has, each paired with the text it should
    /// read back as.
    fn every_form() -> (Vec<u8>, Vec<&'static str>) {
        let mut a = Assembler::new();
        let mut texts = Vec::new();
        let mut emit = |a: &mut Assembler, text: &'static str, f: &dyn Fn(&mut Assembler)| {
            f(a);
            texts.push(text);
        };
        emit(&mut a, "push rbp", &|a| a.push(Reg::Rbp));
        emit(&mut a, "push r11", &|a| a.push(Reg::R11));
        emit(&mut a, "mov rbp, rsp", &|a| a.mov(Reg::Rbp, Reg::Rsp).unwrap());
        emit(&mut a, "mov r9, r15", &|a| a.mov(Reg::R9, Reg::R15).unwrap());
        emit(&mut a, "mov rcx, 0x1d", &|a| a.mov(Reg::Rcx, 29i64).unwrap());
        emit(&mut a, "mov rdx, -0x1", &|a| a.mov(Reg::Rdx, -1i64).unwrap());
        emit(&mut a, "mov r10, 0x10000000000", &|a| {
            a.mov(Reg::R10, 1i64 << 40).unwrap()
        });
        emit(&mut a, "mov rax, [rbp-0x8]", &|a| {
            a.mov(Reg::Rax, Address::new(Reg::Rbp, -8)).unwrap()
        });
        emit(&mut a, "mov [rsp], rdi", &|a| {
            a.mov(Address::new(Reg::Rsp, 0), Reg::Rdi).unwrap()
        });
        emit(&mut a, "mov [r13+0x400], rax", &|a| {
            a.mov(Address::new(Reg::R13, 0x400), Reg::Rax).unwrap()
        });
        emit(&mut a, "mov qword [r12+0x10], 0x7", &|a| {
            a.mov(Address::new(Reg::R12, 0x10), 7i64).unwrap()
        });
        emit(&mut a, "add rcx, rdx", &|a| a.add(Reg::Rcx, Reg::Rdx).unwrap());
        emit(&mut a, "add rcx, 0x1", &|a| a.add(Reg::Rcx, 1i64).unwrap());
        emit(&mut a, "sub r8, 0x1000", &|a| a.sub(Reg::R8, 0x1000i64).unwrap());
        emit(&mut a, "sub rsi, rdi", &|a| a.sub(Reg::Rsi, Reg::Rdi).unwrap());
        emit(&mut a, "and rdx, -0x5", &|a| a.and(Reg::Rdx, -5i64).unwrap());
        emit(&mut a, "and rax, r9", &|a| a.and(Reg::Rax, Reg::R9).unwrap());
        emit(&mut a, "cmp rax, 0x2", &|a| a.cmp(Reg::Rax, 2i64).unwrap());
        emit(&mut a, "cmp r11, rcx", &|a| a.cmp(Reg::R11, Reg::Rcx).unwrap());
        emit(&mut a, "imul rcx, r10", &|a| a.imul(Reg::Rcx, Reg::R10).unwrap());
        emit(&mut a, "imul rax, rsi, 0x3", &|a| {
            a.imul_imm(Reg::Rax, Reg::Rsi, 3).unwrap()
        });
        emit(&mut a, "imul r8, rdx, 0x100", &|a| {
            a.imul_imm(Reg::R8, Reg::Rdx, 0x100).unwrap()
        });
        emit(&mut a, "shl rcx, 0x1", &|a| a.shl(Reg::Rcx, 1).unwrap());
        emit(&mut a, "shr r9, 0x3f", &|a| a.shr(Reg::R9, 63).unwrap());
        emit(&mut a, "sar rsi, 0x1", &|a| a.sar(Reg::Rsi, 1).unwrap());
        emit(&mut a, "test rcx, rcx", &|a| a.test(Reg::Rcx, Reg::Rcx));
        emit(&mut a, "call rax", &|a| a.call(Reg::Rax));
        emit(&mut a, "call r11", &|a| a.call(Reg::R11));
        emit(&mut a, "pop r11", &|a| a.pop(Reg::R11));
        emit(&mut a, "pop rbx", &|a| a.pop(Reg::Rbx));
        emit(&mut a, "nop", &|a| a.nop());
        emit(&mut a, "int3", &|a| a.int3());
        emit(&mut a, "leave", &|a| a.leave());
        emit(&mut a, "ret", &|a| a.ret());
        (a.finish().unwrap().bytes, texts)
    }

    #[test]
    fn every_form_reads_back() {
        let (bytes, texts) = every_form();
        let decoded = disassemble(&bytes, 0).unwrap();
        let got: Vec<&str> = decoded.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(got, texts);
        assert_eq!(decoded.iter().map(|i| i.len).sum::<usize>(), bytes.len());
    }

    #[test]
    fn lengths_agree_with_yaxpeax() {
        use yaxpeax_arch::{Decoder, LengthedInstruction, U8Reader};
        use yaxpeax_x86::amd64::InstDecoder;

        let (bytes, _) = every_form();
        let decoder = InstDecoder::default();
        for ours in disassemble(&bytes, 0).unwrap() {
            let mut reader = U8Reader::new(&ours.bytes);
            let theirs = decoder.decode(&mut reader).unwrap();
            assert_eq!(
                theirs.len().to_const() as usize,
                ours.len,
                "length mismatch for `{}`",
                ours.text
            );
        }
    }

    #[test]
    fn jump_targets_are_absolute() {
        let mut a = Assembler::new();
        let top = a.label();
        a.mark(top).unwrap();
        let out = a.label();
        a.jcc(Cond::E, out);
        a.jmp(top);
        a.mark(out).unwrap();
        a.ret();
        let code = a.finish().unwrap();

        let text = listing(&code.bytes, 0x1000).unwrap();
        insta::assert_snapshot!(text.trim_end(), @r"
        0000000000001000  je 0x100b                      ; 0f 84 05 00 00 00
        0000000000001006  jmp 0x1000                     ; e9 f5 ff ff ff
        000000000000100b  ret                            ; c3
        ");
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(
            disassemble(&[0x48, 0x89], 0),
            Err(DisasmError::Truncated { at: 0 })
        );
        assert_eq!(
            disassemble(&[0x90, 0x06], 0),
            Err(DisasmError::Unknown { at: 1, byte: 0x06 })
        );
        // rip-relative addressing is never emitted
        assert!(disassemble(&[0x48, 0x8B, 0x05, 0, 0, 0, 0], 0).is_err());
    }
}
