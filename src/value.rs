//! Managed values and their single-word encoding.
//!
//! A word with the low bit set is a fixnum shifted left by one. The
//! immediates `nil`, `false` and `true` are small even words that are never
//! multiples of eight; everything else is a heap handle, a multiple of eight.

use std::fmt;
use std::hash::{Hash, Hasher};

pub const NIL: u64 = 2;
pub const FALSE: u64 = 6;
pub const TRUE: u64 = 10;

/// Bit that distinguishes `true` from `nil`/`false` once the fixnum tag is clear.
pub const TRUTHY_MASK: i64 = !4;

/// The coarse type of a value, as recorded by the profiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Nil,
    True,
    False,
    Fixnum,
    Float,
    Symbol,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Nil => "nil",
            Kind::True => "true",
            Kind::False => "false",
            Kind::Fixnum => "fixnum",
            Kind::Float => "float",
            Kind::Symbol => "symbol",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    True,
    False,
    Fixnum(i64),
    Float(f64),
    Symbol(String),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Nil => Kind::Nil,
            Value::True => Kind::True,
            Value::False => Kind::False,
            Value::Fixnum(_) => Kind::Fixnum,
            Value::Float(_) => Kind::Float,
            Value::Symbol(_) => Kind::Symbol,
        }
    }

    pub fn bool(b: bool) -> Value {
        if b { Value::True } else { Value::False }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::False)
    }

    pub fn as_fixnum(&self) -> Option<i64> {
        match self {
            Value::Fixnum(n) => Some(*n),
            _ => None,
        }
    }

    /// The word for values that do not live on the heap.
    pub fn immediate_word(&self) -> Option<u64> {
        match self {
            Value::Nil => Some(NIL),
            Value::True => Some(TRUE),
            Value::False => Some(FALSE),
            Value::Fixnum(n) => Some(tag_fixnum(*n)),
            Value::Float(_) | Value::Symbol(_) => None,
        }
    }
}

// Floats compare by bit pattern so values can be used as map keys and in
// structural identities.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) | (Value::True, Value::True) | (Value::False, Value::False) => {
                true
            }
            (Value::Fixnum(a), Value::Fixnum(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Fixnum(n) => n.hash(state),
            Value::Float(x) => x.to_bits().hash(state),
            Value::Symbol(s) => s.hash(state),
            Value::Nil | Value::True | Value::False => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::True => f.write_str("true"),
            Value::False => f.write_str("false"),
            Value::Fixnum(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Symbol(s) => write!(f, ":{s}"),
        }
    }
}

/// Truncates to the 63 bits a fixnum word can hold.
pub fn wrap_fixnum(n: i64) -> i64 {
    (n << 1) >> 1
}

pub fn tag_fixnum(n: i64) -> u64 {
    ((n << 1) | 1) as u64
}

pub fn untag_fixnum(word: u64) -> i64 {
    (word as i64) >> 1
}

pub fn is_fixnum_word(word: u64) -> bool {
    word & 1 != 0
}

pub fn is_truthy_word(word: u64) -> bool {
    (word as i64 & TRUTHY_MASK) != 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixnum_words_round_trip() {
        for n in [0, 1, -1, 14, -77, wrap_fixnum(i64::MAX)] {
            let w = tag_fixnum(n);
            assert!(is_fixnum_word(w));
            assert_eq!(untag_fixnum(w), n);
        }
    }

    #[test]
    fn only_nil_and_false_are_falsy_words() {
        assert!(!is_truthy_word(NIL));
        assert!(!is_truthy_word(FALSE));
        assert!(is_truthy_word(TRUE));
        assert!(is_truthy_word(tag_fixnum(0)));
        assert!(is_truthy_word(8));
        assert!(is_truthy_word(16));
    }

    #[test]
    fn immediates_are_not_handles() {
        for w in [NIL, FALSE, TRUE] {
            assert!(!is_fixnum_word(w));
            assert_ne!(w % 8, 0);
        }
    }

    #[test]
    fn float_equality_is_bitwise() {
        assert_eq!(Value::Float(16.3), Value::Float(16.3));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
    }

    #[test]
    fn wrapping_keeps_63_bits() {
        assert_eq!(wrap_fixnum(1 << 62), -(1 << 62));
        assert_eq!(wrap_fixnum(5), 5);
    }
}
