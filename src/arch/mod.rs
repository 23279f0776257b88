//! Target machine support. Only AMD64 is implemented; the encoder and
//! decoder are plain byte manipulation and build on every host, while
//! running the emitted code needs an x86-64 one.

pub mod x64;
pub mod x64_disasm;
