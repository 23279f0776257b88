//! The managed side of the native boundary: a handle heap for boxed values
//! and the built-in methods compiled code falls back to.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

use tracing::{error, trace};

use crate::error::{JitError, Result};
use crate::value::{self, Value, wrap_fixnum};

/// Boxed values, addressed by handle.
///
/// Handles are embedded into generated code and may be held by any caller,
/// so nothing is ever freed. Every boxed value is interned instead, which
/// bounds the heap by the number of distinct floats and symbols the
/// process sees rather than by the number of calls.
#[derive(Default)]
struct Heap {
    objects: Vec<Value>,
    handles: HashMap<Value, u64>,
}

impl Heap {
    fn intern(&mut self, value: &Value) -> u64 {
        if let Some(&word) = self.handles.get(value) {
            return word;
        }
        self.objects.push(value.clone());
        let word = (self.objects.len() as u64) << 3;
        self.handles.insert(value.clone(), word);
        word
    }
}

static HEAP: LazyLock<Mutex<Heap>> = LazyLock::new(|| Mutex::new(Heap::default()));

fn heap() -> MutexGuard<'static, Heap> {
    // A panic while holding the lock cannot leave the heap half-written:
    // the only mutation is `intern`, which pushes before it publishes.
    HEAP.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Converts a value into the word compiled code operates on. Floats and
/// symbols are interned: equal values share a handle.
pub fn encode(value: &Value) -> u64 {
    match value.immediate_word() {
        Some(word) => word,
        None => heap().intern(value),
    }
}

pub fn decode(word: u64) -> Result<Value> {
    if value::is_fixnum_word(word) {
        return Ok(Value::Fixnum(value::untag_fixnum(word)));
    }
    match word {
        value::NIL => Ok(Value::Nil),
        value::TRUE => Ok(Value::True),
        value::FALSE => Ok(Value::False),
        w if w != 0 && w % 8 == 0 => {
            let index = (w >> 3) as usize - 1;
            heap()
                .objects
                .get(index)
                .cloned()
                .ok_or(JitError::BadHandle(word))
        }
        _ => Err(JitError::BadHandle(word)),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Fixnum(n) => Some(*n as f64),
        Value::Float(x) => Some(*x),
        _ => None,
    }
}

fn arithmetic(name: &str, a: &Value, b: &Value) -> Option<Value> {
    if let (Value::Fixnum(x), Value::Fixnum(y)) = (a, b) {
        let n = match name {
            "+" => x.wrapping_add(*y),
            "-" => x.wrapping_sub(*y),
            "*" => x.wrapping_mul(*y),
            _ => return None,
        };
        return Some(Value::Fixnum(wrap_fixnum(n)));
    }
    let (x, y) = (numeric(a)?, numeric(b)?);
    let r = match name {
        "+" => x + y,
        "-" => x - y,
        "*" => x * y,
        _ => return None,
    };
    Some(Value::Float(r))
}

fn comparison(name: &str, a: &Value, b: &Value) -> Option<Value> {
    let ordering = match (a, b) {
        (Value::Fixnum(x), Value::Fixnum(y)) => x.cmp(y),
        _ => numeric(a)?.partial_cmp(&numeric(b)?)?,
    };
    let result = match name {
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        ">=" => ordering.is_ge(),
        _ => return None,
    };
    Some(Value::bool(result))
}

/// Dispatches one of the built-in methods.
pub fn send(receiver: &Value, name: &str, args: &[Value]) -> Result<Value> {
    let result = match (name, args) {
        ("!", []) => Some(Value::bool(!receiver.is_truthy())),
        ("==", [other]) => Some(Value::bool(match (receiver, other) {
            (Value::Fixnum(_), Value::Float(_)) | (Value::Float(_), Value::Fixnum(_)) => {
                numeric(receiver) == numeric(other)
            }
            _ => receiver == other,
        })),
        ("+" | "-" | "*", [other]) => arithmetic(name, receiver, other),
        ("<" | "<=" | ">" | ">=", [other]) => comparison(name, receiver, other),
        _ => None,
    };
    result.ok_or_else(|| JitError::NoMethod {
        name: name.to_string(),
        receiver: format!("{receiver} ({})", receiver.kind()),
    })
}

fn managed_call_inner(words: &[u64]) -> Result<u64> {
    let [receiver, name, args @ ..] = words else {
        return Err(JitError::Unsupported(format!(
            "managed call with {} words, need at least receiver and name",
            words.len()
        )));
    };
    let receiver = decode(*receiver)?;
    let name = match decode(*name)? {
        Value::Symbol(name) => name,
        other => {
            return Err(JitError::Unsupported(format!(
                "method name must be a symbol, got {other}"
            )));
        }
    };
    let args = args.iter().map(|&w| decode(w)).collect::<Result<Vec<_>>>()?;
    trace!(%receiver, name = %name, ?args, "managed call");
    Ok(encode(&send(&receiver, &name, &args)?))
}

/// The single entry point compiled code uses to reach the managed runtime.
///
/// The buffer is `[receiver, method name, arg0, ...]`; the result is the
/// encoded return value, or `nil` if the call failed.
#[cfg(target_arch = "x86_64")]
pub extern "sysv64" fn managed_call(args: *const u64, argc: u64) -> u64 {
    let result = std::panic::catch_unwind(|| {
        // SAFETY: compiled code passes a pointer to `argc` words it pushed
        // on its own stack.
        let words = unsafe { std::slice::from_raw_parts(args, argc as usize) };
        managed_call_inner(words)
    });
    match result {
        Ok(Ok(word)) => word,
        Ok(Err(e)) => {
            error!(error = %e, "managed call failed");
            value::NIL
        }
        Err(_) => {
            error!("managed call panicked");
            value::NIL
        }
    }
}

/// Address of [`managed_call`], embedded into generated code.
pub fn managed_call_address() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        managed_call as usize as u64
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        0
    }
}
