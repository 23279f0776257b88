//! The compilation driver: bytecode in, installed machine code out.

use dynasmrt::mmap::MutableBuffer;
use dynasmrt::{AssemblyOffset, ExecutableBuffer};
use tracing::debug;

use crate::arch::x64::Reference;
use crate::arch::x64_disasm;
use crate::builder::build;
use crate::bytecode::Insn;
use crate::codegen::{self, Generated};
use crate::deopt::DeoptInfo;
use crate::error::Result;
use crate::ir::Graph;
use crate::linearize::linearize;
use crate::lower::lower;
use crate::passes::run_default_passes;
use crate::profile::Profile;
use crate::regalloc::{RegisterSet, allocate};
use crate::schedule::schedule;

#[cfg(target_arch = "x86_64")]
use crate::error::JitError;
#[cfg(target_arch = "x86_64")]
use crate::runtime;
#[cfg(target_arch = "x86_64")]
use crate::value::{self, Value};

/// Knobs for one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Run the optimization pipeline before lowering.
    pub optimize: bool,
    /// Make every guard jump to its deopt trampoline unconditionally.
    pub force_deopt: bool,
    /// Log the graph, the linear blocks and the disassembly at `debug`.
    pub dump: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            optimize: true,
            force_deopt: false,
            dump: false,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "1")
}

impl CompileOptions {
    /// Defaults, overridden by `SEAJIT_NO_OPT=1`, `SEAJIT_FORCE_DEOPT=1` and
    /// `SEAJIT_DUMP=1`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            optimize: defaults.optimize && !env_flag("SEAJIT_NO_OPT"),
            force_deopt: defaults.force_deopt || env_flag("SEAJIT_FORCE_DEOPT"),
            dump: defaults.dump || env_flag("SEAJIT_DUMP"),
        }
    }
}

/// A compiled method. Owns the executable buffer and the deopt metadata
/// the code points into; dropping it unmaps the code.
pub struct CompiledMethod {
    buf: ExecutableBuffer,
    references: Vec<Reference>,
    deopts: Vec<Box<DeoptInfo>>,
}

impl CompiledMethod {
    /// The raw executable code buffer.
    pub fn code(&self) -> &[u8] {
        &self.buf
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    /// Address the code is mapped at.
    pub fn base(&self) -> u64 {
        self.buf.ptr(AssemblyOffset(0)) as u64
    }

    /// One line per instruction, at the addresses the code runs at.
    pub fn disassemble(&self) -> Result<String> {
        Ok(x64_disasm::listing(&self.buf, self.base())?)
    }

    /// Total number of deoptimizations taken by this method so far.
    pub fn deopt_count(&self) -> u64 {
        self.deopts.iter().map(|d| d.count()).sum()
    }

    /// Runs the method. Arguments travel in the ABI argument registers, so
    /// at most five are supported; missing ones read as `nil`.
    #[cfg(target_arch = "x86_64")]
    pub fn call(&self, receiver: &Value, args: &[Value]) -> Result<Value> {
        type Entry = unsafe extern "sysv64" fn(u64, u64, u64, u64, u64, u64) -> u64;

        if args.len() > 5 {
            return Err(JitError::Unsupported(format!(
                "{} arguments; at most 5 are passed in registers",
                args.len()
            )));
        }
        let mut words = [value::NIL; 5];
        for (w, a) in words.iter_mut().zip(args) {
            *w = runtime::encode(a);
        }
        let receiver = runtime::encode(receiver);
        // SAFETY: the buffer holds a function generated with exactly this
        // signature, and `self` keeps both it and the deopt metadata alive
        // for the duration of the call.
        let word = unsafe {
            let entry: Entry = std::mem::transmute(self.buf.ptr(AssemblyOffset(0)));
            entry(receiver, words[0], words[1], words[2], words[3], words[4])
        };
        runtime::decode(word)
    }
}

/// Copies `bytes` into fresh memory and flips it from writable to
/// executable.
fn install(bytes: &[u8]) -> Result<ExecutableBuffer> {
    let mut buf = MutableBuffer::new(bytes.len())?;
    buf.set_len(bytes.len());
    buf[..].copy_from_slice(bytes);
    Ok(buf.make_exec()?)
}

/// Builds the graph for `insns` and compiles it.
pub fn compile(
    insns: &[Insn],
    arity: usize,
    profile: Option<&Profile>,
    options: &CompileOptions,
) -> Result<CompiledMethod> {
    let graph = build(insns, arity, profile)?;
    debug!(insns = insns.len(), nodes = graph.len(), "built graph");
    compile_graph(graph, options)
}

/// Optimizes (unless disabled), lowers, schedules, allocates and emits
/// `graph`, then installs the code.
pub fn compile_graph(mut graph: Graph, options: &CompileOptions) -> Result<CompiledMethod> {
    if options.optimize {
        run_default_passes(&mut graph);
        graph.verify();
        debug!(nodes = graph.len(), "optimized");
    }
    lower(&mut graph)?;
    if options.dump {
        debug!("lowered graph:\n{graph}");
    }

    let mut blocks = schedule(&mut graph)?;
    let alloc = allocate(&mut graph, &mut blocks, &RegisterSet::amd64())?;
    let mut linear = linearize(&graph, &blocks, &alloc)?;
    linear.simplify();
    if options.dump {
        debug!("linear:\n{linear}");
    }

    let Generated { code, deopts } = codegen::generate(&linear, &alloc.used(), options.force_deopt)?;
    let buf = install(&code.bytes)?;
    let method = CompiledMethod {
        buf,
        references: code.references,
        deopts,
    };
    debug!(
        bytes = method.code().len(),
        deopt_points = method.deopts.len(),
        base = method.base(),
        "installed"
    );
    if options.dump {
        debug!("disassembly:\n{}", method.disassemble()?);
    }
    Ok(method)
}
