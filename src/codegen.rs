//! Machine code for linearized blocks.
//!
//! Frame layout is `push rbp; mov rbp, rsp` with no locals: every value
//! lives in a register. The stack pointer is 16-byte aligned between
//! instructions, which is what both the managed call sequence and the
//! deopt trampolines rely on when they call out.

use std::collections::BTreeSet;

use tracing::debug;

use crate::arch::x64::{Assembler, Code, Cond, Label, Operand as MachineOperand, Reg};
use crate::deopt::{self, DeoptInfo, SAVED_REGISTERS};
use crate::error::{JitError, Result};
use crate::ir::{IntOp, Test};
use crate::linearize::{Linear, LinearOp, Operand};
use crate::regalloc::{R8, R9, RCX, RDX, RSI, Register};
use crate::runtime;

const ARG_REGISTERS: [Register; 5] = [RSI, RDX, RCX, R8, R9];

/// Generated code plus the deopt metadata its trampolines point at. The
/// boxes must outlive the code.
pub struct Generated {
    pub code: Code,
    pub deopts: Vec<Box<DeoptInfo>>,
}

fn machine(r: Register) -> Result<Reg> {
    Reg::from_number(r.0)
        .ok_or_else(|| JitError::Unsupported(format!("{r} is not a machine register")))
}

/// The condition under which `test` holds after `test r, r`.
fn holds(test: Test) -> Cond {
    match test {
        Test::NotZero => Cond::Ne,
        Test::Zero => Cond::E,
    }
}

struct Codegen {
    asm: Assembler,
    blocks: Vec<Label>,
    trampolines: Vec<Label>,
    /// Every register holding a value somewhere in the method.
    used: Vec<Reg>,
    force_deopt: bool,
}

impl Codegen {
    fn mov(&mut self, dst: Reg, src: Reg) -> Result<()> {
        if dst != src {
            self.asm.mov(dst, src)?;
        }
        Ok(())
    }

    fn int64(&mut self, op: IntOp, dst: Reg, left: Reg, right: Operand) -> Result<()> {
        match right {
            Operand::Imm(n) => match op {
                IntOp::ShiftLeft => {
                    self.mov(dst, left)?;
                    self.asm.shl(dst, n)?;
                }
                IntOp::ShiftRight => {
                    self.mov(dst, left)?;
                    self.asm.sar(dst, n)?;
                }
                IntOp::Mul => self.asm.imul_imm(dst, left, n)?,
                IntOp::Add | IntOp::Sub | IntOp::And => {
                    self.mov(dst, left)?;
                    if i32::try_from(n).is_ok() {
                        self.alu(op, dst, n.into())?;
                    } else {
                        self.asm.mov(Reg::Rax, n)?;
                        self.alu(op, dst, Reg::Rax.into())?;
                    }
                }
            },
            Operand::Reg(right) => {
                let right = machine(right)?;
                if dst == left {
                    self.alu(op, dst, right.into())?;
                } else if dst != right {
                    self.asm.mov(dst, left)?;
                    self.alu(op, dst, right.into())?;
                } else {
                    self.asm.mov(Reg::Rax, left)?;
                    self.alu(op, Reg::Rax, right.into())?;
                    self.asm.mov(dst, Reg::Rax)?;
                }
            }
        }
        Ok(())
    }

    fn alu(&mut self, op: IntOp, dst: Reg, src: MachineOperand) -> Result<()> {
        match (op, src) {
            (IntOp::Add, _) => self.asm.add(dst, src)?,
            (IntOp::Sub, _) => self.asm.sub(dst, src)?,
            (IntOp::And, _) => self.asm.and(dst, src)?,
            (IntOp::Mul, MachineOperand::Reg(r)) => self.asm.imul(dst, r)?,
            (IntOp::Mul, MachineOperand::Imm(n)) => self.asm.imul_imm(dst, dst, n)?,
            _ => {
                return Err(JitError::Unsupported(format!(
                    "{} with operand {src}",
                    op.name()
                )));
            }
        }
        Ok(())
    }

    /// Saves every live register but `dst`, builds the
    /// `[receiver, name, args...]` buffer on the stack and calls
    /// `managed_call`.
    fn call_managed(
        &mut self,
        dst: Option<Reg>,
        receiver: Reg,
        name: Reg,
        args: &[Reg],
    ) -> Result<()> {
        let saved: Vec<Reg> = self
            .used
            .iter()
            .copied()
            .filter(|r| Some(*r) != dst)
            .collect();
        let words = 2 + args.len();
        let pad = (saved.len() + words) % 2;

        for r in &saved {
            self.asm.push(*r);
        }
        if pad == 1 {
            self.asm.sub(Reg::Rsp, 8i64)?;
        }
        for r in args.iter().rev() {
            self.asm.push(*r);
        }
        self.asm.push(name);
        self.asm.push(receiver);

        self.asm.mov(Reg::Rdi, Reg::Rsp)?;
        self.asm.mov(Reg::Rsi, words as i64)?;
        self.asm.mov_address(Reg::Rax, runtime::managed_call_address());
        self.asm.call(Reg::Rax);
        self.asm.add(Reg::Rsp, (8 * (words + pad)) as i64)?;
        if let Some(dst) = dst {
            self.asm.mov(dst, Reg::Rax)?;
        }
        for r in saved.iter().rev() {
            self.asm.pop(*r);
        }
        Ok(())
    }

    fn op(&mut self, op: &LinearOp) -> Result<()> {
        match op {
            LinearOp::SelfValue { dst } => self.mov(machine(*dst)?, Reg::Rdi)?,
            LinearOp::Arg { dst, index } => {
                let abi = ARG_REGISTERS.get(*index as usize).ok_or_else(|| {
                    JitError::Unsupported(format!("argument {index} is not passed in a register"))
                })?;
                self.mov(machine(*dst)?, machine(*abi)?)?;
            }
            LinearOp::Constant { dst, value } => {
                self.asm.mov(machine(*dst)?, runtime::encode(value) as i64)?;
            }
            LinearOp::Move { dst, src } => self.mov(machine(*dst)?, machine(*src)?)?,
            LinearOp::Int64 {
                op,
                dst,
                left,
                right,
            } => self.int64(*op, machine(*dst)?, machine(*left)?, *right)?,
            LinearOp::Phi { .. } | LinearOp::FrameState { .. } | LinearOp::Nop => {}
            LinearOp::CallManaged {
                dst,
                receiver,
                name,
                args,
            } => {
                let dst = dst.map(machine).transpose()?;
                let args = args.iter().map(|a| machine(*a)).collect::<Result<Vec<_>>>()?;
                self.call_managed(dst, machine(*receiver)?, machine(*name)?, &args)?;
            }
            LinearOp::Guard {
                test,
                condition,
                frame_state,
            } => {
                let trampoline = self.trampolines[*frame_state];
                if self.force_deopt {
                    self.asm.jmp(trampoline);
                } else {
                    let r = machine(*condition)?;
                    self.asm.test(r, r);
                    self.asm.jcc(holds(*test).negate(), trampoline);
                }
            }
            LinearOp::Return { value } => {
                self.asm.mov(Reg::Rax, machine(*value)?)?;
                self.asm.leave();
                self.asm.ret();
            }
            LinearOp::Jump(b) => self.asm.jmp(self.blocks[*b]),
            LinearOp::Branch {
                test,
                condition,
                if_true,
                if_false,
            } => {
                let r = machine(*condition)?;
                self.asm.test(r, r);
                self.asm.jcc(holds(*test), self.blocks[*if_true]);
                self.asm.jmp(self.blocks[*if_false]);
            }
            LinearOp::BranchIf {
                test,
                condition,
                target,
            } => {
                let r = machine(*condition)?;
                self.asm.test(r, r);
                self.asm.jcc(holds(*test), self.blocks[*target]);
            }
            LinearOp::BranchUnless {
                test,
                condition,
                target,
            } => {
                let r = machine(*condition)?;
                self.asm.test(r, r);
                self.asm.jcc(holds(*test).negate(), self.blocks[*target]);
            }
        }
        Ok(())
    }

    /// Pushes the allocatable registers and hands them to the deopt entry.
    /// Its result becomes the method's result.
    fn trampoline(&mut self, label: Label, info: &DeoptInfo) -> Result<()> {
        self.asm.mark(label)?;
        for r in SAVED_REGISTERS {
            self.asm.push(machine(r)?);
        }
        self.asm.mov(Reg::Rdi, Reg::Rbp)?;
        self.asm.mov(Reg::Rsi, Reg::Rsp)?;
        self.asm.mov_address(Reg::Rdx, info as *const DeoptInfo as u64);
        self.asm.mov_address(Reg::Rax, deopt::deopt_entry_address());
        self.asm.call(Reg::Rax);
        self.asm.leave();
        self.asm.ret();
        Ok(())
    }
}

/// Emits the method: prologue, every block in order, then one deopt
/// trampoline per frame state.
pub fn generate(linear: &Linear, used: &BTreeSet<Register>, force_deopt: bool) -> Result<Generated> {
    let deopts: Vec<Box<DeoptInfo>> = linear
        .frame_states
        .iter()
        .map(|r| Box::new(DeoptInfo::new(r.clone())))
        .collect();

    let mut asm = Assembler::new();
    let blocks = linear.blocks.iter().map(|_| asm.label()).collect();
    let trampolines = deopts.iter().map(|_| asm.label()).collect();
    let mut cg = Codegen {
        asm,
        blocks,
        trampolines,
        used: used.iter().map(|r| machine(*r)).collect::<Result<_>>()?,
        force_deopt,
    };

    cg.asm.push(Reg::Rbp);
    cg.asm.mov(Reg::Rbp, Reg::Rsp)?;
    for (i, ops) in linear.blocks.iter().enumerate() {
        cg.asm.mark(cg.blocks[i])?;
        for op in ops {
            cg.op(op)?;
        }
    }
    for (i, info) in deopts.iter().enumerate() {
        cg.trampoline(cg.trampolines[i], info)?;
    }

    let code = cg.asm.finish()?;
    debug!(
        bytes = code.bytes.len(),
        references = code.references.len(),
        trampolines = deopts.len(),
        "generated code"
    );
    Ok(Generated { code, deopts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x64_disasm::disassemble;
    use crate::arch::x64::Reference;
    use crate::fragments::fixnum_binop;
    use crate::ir::Arith;
    use crate::linearize::linearize;
    use crate::lower::lower;
    use crate::regalloc::{RDI, RegisterSet, allocate};
    use crate::schedule::schedule;

    fn texts(code: &Code) -> Vec<String> {
        disassemble(&code.bytes, 0)
            .unwrap()
            .into_iter()
            .map(|i| i.text)
            .collect()
    }

    fn single_block(ops: Vec<LinearOp>, used: &[Register]) -> Vec<String> {
        let linear = Linear {
            blocks: vec![ops],
            frame_states: Vec::new(),
        };
        let used = used.iter().copied().collect();
        texts(&generate(&linear, &used, false).unwrap().code)
    }

    #[test]
    fn subtraction_into_its_right_operand_goes_through_rax() {
        let got = single_block(
            vec![
                LinearOp::Int64 {
                    op: IntOp::Sub,
                    dst: RCX,
                    left: RDX,
                    right: Operand::Reg(RCX),
                },
                LinearOp::Return { value: RCX },
            ],
            &[RCX, RDX],
        );
        assert_eq!(
            got,
            [
                "push rbp",
                "mov rbp, rsp",
                "mov rax, rdx",
                "sub rax, rcx",
                "mov rcx, rax",
                "mov rax, rcx",
                "leave",
                "ret",
            ]
        );
    }

    #[test]
    fn moves_within_a_register_emit_nothing() {
        let got = single_block(
            vec![
                LinearOp::Move { dst: RCX, src: RCX },
                LinearOp::Return { value: RCX },
            ],
            &[RCX],
        );
        assert_eq!(got, ["push rbp", "mov rbp, rsp", "mov rax, rcx", "leave", "ret"]);
    }

    #[test]
    fn tagging_uses_shifts_and_immediates() {
        let got = single_block(
            vec![
                LinearOp::Int64 {
                    op: IntOp::ShiftRight,
                    dst: RCX,
                    left: RSI,
                    right: Operand::Imm(1),
                },
                LinearOp::Int64 {
                    op: IntOp::ShiftLeft,
                    dst: RCX,
                    left: RCX,
                    right: Operand::Imm(1),
                },
                LinearOp::Int64 {
                    op: IntOp::Add,
                    dst: RCX,
                    left: RCX,
                    right: Operand::Imm(1),
                },
                LinearOp::Return { value: RCX },
            ],
            &[RCX, RSI],
        );
        assert_eq!(
            &got[2..6],
            ["mov rcx, rsi", "sar rcx, 0x1", "shl rcx, 0x1", "add rcx, 0x1"]
        );
    }

    #[test]
    fn managed_calls_keep_the_stack_aligned() {
        // Three live registers besides the destination, three buffer words:
        // even, so no padding.
        let got = single_block(
            vec![
                LinearOp::CallManaged {
                    dst: Some(RCX),
                    receiver: RSI,
                    name: RDX,
                    args: vec![RDI],
                },
                LinearOp::Return { value: RCX },
            ],
            &[RCX, RDX, RSI, RDI],
        );
        let body: Vec<&str> = got[2..got.len() - 3].iter().map(String::as_str).collect();
        let address = format!("mov rax, {:#x}", runtime::managed_call_address());
        assert_eq!(
            body,
            [
                "push rdx",
                "push rsi",
                "push rdi",
                "push rdi",
                "push rdx",
                "push rsi",
                "mov rdi, rsp",
                "mov rsi, 0x3",
                address.as_str(),
                "call rax",
                "add rsp, 0x18",
                "mov rcx, rax",
                "pop rdi",
                "pop rsi",
                "pop rdx",
            ]
        );
    }

    #[test]
    fn odd_pushes_get_a_pad_word() {
        let got = single_block(
            vec![
                LinearOp::CallManaged {
                    dst: Some(RCX),
                    receiver: RSI,
                    name: RDX,
                    args: vec![],
                },
                LinearOp::Return { value: RCX },
            ],
            &[RCX, RDX, RSI, RDI],
        );
        assert!(got.iter().any(|t| t == "sub rsp, 0x8"), "{got:#?}");
        assert!(got.iter().any(|t| t == "add rsp, 0x18"), "{got:#?}");
    }

    #[test]
    fn fragment_compiles_with_absolute_references() {
        let mut g = fixnum_binop(Arith::Add).graph;
        lower(&mut g).unwrap();
        let mut blocks = schedule(&mut g).unwrap();
        let alloc = allocate(&mut g, &mut blocks, &RegisterSet::amd64()).unwrap();
        let mut linear = linearize(&g, &blocks, &alloc).unwrap();
        linear.simplify();
        let generated = generate(&linear, &alloc.used(), false).unwrap();

        let got = texts(&generated.code);
        assert_eq!(got[..2], ["push rbp", "mov rbp, rsp"]);
        assert_eq!(got.last().map(String::as_str), Some("ret"));
        assert!(got.iter().any(|t| t == "call rax"));
        assert!(generated.deopts.is_empty());
        let absolute = generated
            .code
            .references
            .iter()
            .filter(|r| matches!(r, Reference::Absolute { .. }))
            .count();
        assert_eq!(absolute, 1);
    }

    #[test]
    fn forced_deopt_jumps_straight_to_the_trampoline() {
        use crate::builder::build;
        use crate::bytecode_parse::parse_listing;
        use crate::passes::run_default_passes;
        use crate::profile::Profile;
        use crate::value::Kind;

        let insns = parse_listing("[:arg, 0] [:arg, 1] [:send, :+, 1] [:return]").unwrap();
        let mut profile = Profile::new();
        profile.record(2, Kind::Fixnum, &[Kind::Fixnum]);
        let mut g = build(&insns, 2, Some(&profile)).unwrap();
        run_default_passes(&mut g);
        lower(&mut g).unwrap();
        let mut blocks = schedule(&mut g).unwrap();
        let alloc = allocate(&mut g, &mut blocks, &RegisterSet::amd64()).unwrap();
        let linear = linearize(&g, &blocks, &alloc).unwrap();

        let normal = texts(&generate(&linear, &alloc.used(), false).unwrap().code);
        let forced = generate(&linear, &alloc.used(), true).unwrap();
        assert_eq!(forced.deopts.len(), 1);
        let forced = texts(&forced.code);

        let conditional = |t: &Vec<String>| t.iter().filter(|s| s.starts_with("je ")).count();
        assert_eq!(conditional(&normal), 2);
        assert_eq!(conditional(&forced), 0);
        // Eight pushes, the entry call and the return.
        let tail: Vec<&str> = forced[forced.len() - 15..].iter().map(String::as_str).collect();
        assert_eq!(
            tail[..8],
            [
                "push rcx", "push rdx", "push rsi", "push rdi", "push r8", "push r9", "push r10",
                "push r11"
            ]
        );
        assert_eq!(tail[8..10], ["mov rdi, rbp", "mov rsi, rsp"]);
        assert_eq!(
            tail[11],
            format!("mov rax, {:#x}", deopt::deopt_entry_address())
        );
        assert_eq!(tail[12..], ["call rax", "leave", "ret"]);
    }
}
