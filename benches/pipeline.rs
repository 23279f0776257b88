use divan::{Bencher, black_box};
use std::sync::LazyLock;

use seajit::builder::build;
use seajit::ir::Graph;
use seajit::linearize::linearize;
use seajit::lower::lower;
use seajit::passes::run_default_passes;
use seajit::regalloc::{RegisterSet, allocate};
use seajit::schedule::schedule;
use seajit::{CompileOptions, Insn, Kind, Profile, compile, parse_listing};

fn main() {
    divan::main();
}

// ── Inputs ──────────────────────────────────────────────────────────────────

const ADD: &str = "[:trace, 1] [:arg, 0] [:arg, 1] [:send, :+, 1] [:return]";

const MAX: &str = "
    [:arg, 0] [:arg, 1] [:send, :>, 1] [:branchif, 6]
    [:arg, 1] [:return]
    [:arg, 0] [:return]
";

static ADD_INSNS: LazyLock<Vec<Insn>> = LazyLock::new(|| parse_listing(ADD).unwrap());
static MAX_INSNS: LazyLock<Vec<Insn>> = LazyLock::new(|| parse_listing(MAX).unwrap());

static FIXNUM_PROFILE: LazyLock<Profile> = LazyLock::new(|| {
    let mut profile = Profile::new();
    profile.record(3, Kind::Fixnum, &[Kind::Fixnum]);
    profile
});

fn optimized_add() -> Graph {
    let mut g = build(&ADD_INSNS, 2, Some(&FIXNUM_PROFILE)).unwrap();
    run_default_passes(&mut g);
    g
}

// ── Phases ──────────────────────────────────────────────────────────────────

mod phases {
    use super::*;

    #[divan::bench]
    fn build_and_optimize(bencher: Bencher) {
        bencher.bench(|| black_box(optimized_add()));
    }

    #[divan::bench]
    fn lower_and_schedule(bencher: Bencher) {
        bencher
            .with_inputs(optimized_add)
            .bench_local_values(|mut g| {
                lower(&mut g).unwrap();
                black_box(schedule(&mut g).unwrap())
            });
    }

    #[divan::bench]
    fn allocate_and_linearize(bencher: Bencher) {
        bencher
            .with_inputs(|| {
                let mut g = optimized_add();
                lower(&mut g).unwrap();
                let blocks = schedule(&mut g).unwrap();
                (g, blocks)
            })
            .bench_local_values(|(mut g, mut blocks)| {
                let alloc = allocate(&mut g, &mut blocks, &RegisterSet::amd64()).unwrap();
                black_box(linearize(&g, &blocks, &alloc).unwrap())
            });
    }
}

// ── End to end ──────────────────────────────────────────────────────────────

mod compile_to_machine_code {
    use super::*;

    #[divan::bench]
    fn speculated_add(bencher: Bencher) {
        let options = CompileOptions::default();
        bencher.bench(|| {
            black_box(compile(&ADD_INSNS, 2, Some(&FIXNUM_PROFILE), &options).unwrap())
        });
    }

    #[divan::bench]
    fn generic_max(bencher: Bencher) {
        let options = CompileOptions::default();
        bencher.bench(|| black_box(compile(&MAX_INSNS, 2, None, &options).unwrap()));
    }
}
