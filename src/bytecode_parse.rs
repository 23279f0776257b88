//! Parser for textual instruction listings such as
//!
//! ```text
//! [:arg, 0]
//! [:arg, 1]
//! [:send, :+, 1]
//! [:return]
//! ```
//!
//! Two passes: text → generic `[:op, operand...]` items, then items → [`Insn`].

use chumsky::prelude::*;

use crate::bytecode::Insn;
use crate::error::{JitError, Result};
use crate::value::Value;

// ─── AST ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Int(i64),
    Float(f64),
    Symbol(String),
    Nil,
    True,
    False,
}

#[derive(Debug, Clone)]
struct Item {
    op: String,
    operands: Vec<Operand>,
}

// ─── Parsers ────────────────────────────────────────────────────────────────

type Extra<'src> = extra::Err<Rich<'src, char>>;

fn symbol<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    just(':').ignore_then(
        any()
            .filter(|c: &char| c.is_alphanumeric() || "_+-*/<>=!?%&|^".contains(*c))
            .repeated()
            .at_least(1)
            .to_slice()
            .map(|s: &str| s.to_string()),
    )
}

fn number<'src>() -> impl Parser<'src, &'src str, Operand, Extra<'src>> + Clone {
    just('-')
        .or_not()
        .then(text::int::<_, Extra<'_>>(10))
        .then(just('.').then(text::digits(10)).or_not())
        .to_slice()
        .try_map(|s: &str, span| {
            if s.contains('.') {
                s.parse::<f64>()
                    .map(Operand::Float)
                    .map_err(|e| Rich::custom(span, e))
            } else {
                s.parse::<i64>()
                    .map(Operand::Int)
                    .map_err(|e| Rich::custom(span, e))
            }
        })
}

fn operand<'src>() -> impl Parser<'src, &'src str, Operand, Extra<'src>> + Clone {
    choice((
        number(),
        symbol().map(Operand::Symbol),
        just("nil").to(Operand::Nil),
        just("true").to(Operand::True),
        just("false").to(Operand::False),
    ))
}

fn item<'src>() -> impl Parser<'src, &'src str, Item, Extra<'src>> + Clone {
    symbol()
        .padded()
        .then(
            just(',')
                .padded()
                .ignore_then(operand().padded())
                .repeated()
                .collect::<Vec<_>>(),
        )
        .delimited_by(just('['), just(']'))
        .map(|(op, operands)| Item { op, operands })
        .padded()
}

fn program<'src>() -> impl Parser<'src, &'src str, Vec<Item>, Extra<'src>> {
    item().repeated().collect::<Vec<_>>().then_ignore(end())
}

// ─── Resolution ─────────────────────────────────────────────────────────────

/// Parses a listing into instructions.
pub fn parse_listing(input: &str) -> Result<Vec<Insn>> {
    let items = program().parse(input).into_result().map_err(|errs| {
        let msgs: Vec<String> = errs.into_iter().map(|e| format!("{e}")).collect();
        JitError::Parse(msgs.join("\n"))
    })?;
    items
        .into_iter()
        .enumerate()
        .map(|(ip, item)| resolve(ip, item))
        .collect()
}

fn malformed(ip: usize, item: &Item) -> JitError {
    JitError::Malformed {
        ip,
        reason: format!("bad operands for `{}`: {:?}", item.op, item.operands),
    }
}

fn index(ip: usize, item: &Item, n: i64) -> Result<usize> {
    usize::try_from(n).map_err(|_| malformed(ip, item))
}

fn resolve(ip: usize, item: Item) -> Result<Insn> {
    use Operand as O;
    let insn = match (item.op.as_str(), item.operands.as_slice()) {
        ("arg", [O::Int(n)]) => Insn::Arg(index(ip, &item, *n)?),
        ("self", []) => Insn::SelfValue,
        ("load", [O::Symbol(name)]) => Insn::Load(name.clone()),
        ("store", [O::Symbol(name)]) => Insn::Store(name.clone()),
        ("push", [value]) => Insn::Push(match value {
            O::Int(n) => Value::Fixnum(*n),
            O::Float(x) => Value::Float(*x),
            O::Symbol(s) => Value::Symbol(s.clone()),
            O::Nil => Value::Nil,
            O::True => Value::True,
            O::False => Value::False,
        }),
        ("send", [O::Symbol(name), O::Int(argc)]) => Insn::Send {
            name: name.clone(),
            argc: index(ip, &item, *argc)?,
        },
        ("branch", [O::Int(t)]) => Insn::Branch(index(ip, &item, *t)?),
        ("branchif", [O::Int(t)]) => Insn::BranchIf(index(ip, &item, *t)?),
        ("not", []) => Insn::Not,
        ("trace", [O::Int(line)]) => {
            Insn::Trace(u32::try_from(*line).map_err(|_| malformed(ip, &item))?)
        }
        ("return", []) => Insn::Return,
        ("optarg" | "restarg" | "kwarg" | "block", _) => {
            return Err(JitError::Unsupported(format!(
                "`{}` argument form at instruction {ip}",
                item.op
            )));
        }
        ("arg" | "self" | "load" | "store" | "push" | "send" | "branch" | "branchif" | "not"
        | "trace" | "return", _) => return Err(malformed(ip, &item)),
        (op, _) => return Err(JitError::UnknownOp(op.to_string())),
    };
    Ok(insn)
}
