//! Built-in function dispatch
//!
//! A marshal declares its arity in the compiler's signature table; the
//! VM pops accordingly. Mutating collection methods (`append`, `pop`,
//! `clear`, `add`, `remove`, `update`) push the updated receiver last —
//! the compiler emits the write-back — and `pop` pushes its return
//! value beneath it.
//!
//! Segment-math marshals (`population`, `intersection`, `union`,
//! `difference`, `complement`) resolve names through the
//! [`SegmentReader`](crate::SegmentReader) seam. Combinators return the
//! resulting entity-id list so calls compose; `population` reduces
//! either a name or such a list to a count.

use crate::interp::{located, Interpreter};
use cohort_core::error::{Error, ErrorCode, Result, SourceLoc};
use cohort_core::value::Value;
use cohort_index::IndexBits;
use cohort_query::Marshal;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

pub(crate) fn dispatch(
    vm: &mut Interpreter<'_>,
    marshal: Marshal,
    argc: u8,
    loc: &SourceLoc,
) -> Result<()> {
    let mut args: smallvec::SmallVec<[Value; 4]> = smallvec::SmallVec::with_capacity(argc as usize);
    for _ in 0..argc {
        args.push(vm.pop(loc)?);
    }
    args.reverse();

    match marshal {
        Marshal::Log => {
            let line = args
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            tracing::info!(target: "cohort::script", "{}", line);
        }
        Marshal::Debug => {
            vm.debug_log.push(args.remove(0));
        }
        Marshal::Tally => {
            vm.tally(&args);
        }
        Marshal::Len => {
            let len = args[0].len().ok_or_else(|| {
                located(
                    Error::runtime(
                        ErrorCode::TypeMismatch,
                        format!("cannot take len of {}", args[0].type_name()),
                    ),
                    loc,
                )
            })?;
            vm.stack.push(Value::Int(len as i64));
        }
        Marshal::Round => {
            let digits = args.get(1).and_then(Value::as_int).unwrap_or(0);
            let x = float_arg(&args[0], "round", loc)?;
            let scale = 10f64.powi(digits as i32);
            vm.stack.push(Value::Float((x * scale).round() / scale));
        }
        Marshal::Bucket => {
            let value = &args[0];
            let size = &args[1];
            let out = match (value, size) {
                (Value::Int(v), Value::Int(s)) if *s != 0 => Value::Int((v / s) * s),
                _ => {
                    let v = float_arg(value, "bucket", loc)?;
                    let s = float_arg(size, "bucket", loc)?;
                    if s == 0.0 {
                        return Err(located(
                            Error::runtime(ErrorCode::DivideByZero, "bucket size of zero"),
                            loc,
                        ));
                    }
                    Value::Float((v / s).floor() * s)
                }
            };
            vm.stack.push(out);
        }
        Marshal::Fix => {
            let digits = args[1].as_int().unwrap_or(0).clamp(0, 12) as usize;
            let x = float_arg(&args[0], "fix", loc)?;
            vm.stack.push(Value::text(&format!("{:.*}", digits, x)));
        }
        Marshal::Trunc => {
            let x = float_arg(&args[0], "trunc", loc)?;
            vm.stack.push(Value::Int(x.trunc() as i64));
        }
        Marshal::UrlDecode => {
            let s = text_arg(&args[0], "url_decode", loc)?;
            vm.stack.push(Value::text(&url_decode(&s)));
        }
        Marshal::Str => {
            vm.stack.push(Value::text(&args[0].to_string()));
        }
        Marshal::Int => {
            vm.stack
                .push(args[0].as_int().map(Value::Int).unwrap_or(Value::Nil));
        }
        Marshal::Float => {
            vm.stack
                .push(args[0].as_float().map(Value::Float).unwrap_or(Value::Nil));
        }
        Marshal::Bool => {
            vm.stack.push(Value::Bool(args[0].is_truthy()));
        }
        Marshal::MakeList => {
            vm.stack.push(Value::List(args.into_vec()));
        }
        Marshal::MakeDict => {
            let mut dict = BTreeMap::new();
            let mut iter = args.into_iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                dict.insert(k, v);
            }
            vm.stack.push(Value::Dict(dict));
        }
        Marshal::MakeSet => {
            vm.stack.push(Value::Set(args.into_iter().collect()));
        }
        Marshal::PushSubscript => {
            // subscript reads compile to PushUserObj; nothing routes here
            return Err(located(
                Error::internal(ErrorCode::Internal, "unexpected subscript marshal"),
                loc,
            ));
        }
        Marshal::IterGet => {
            vm.stack.push(Value::Int(vm.cursor as i64));
        }
        Marshal::IterSet => {
            let at = args[0].as_int().unwrap_or(-1);
            if at < 0 || at as usize >= vm.grid().row_count() {
                return Err(located(
                    Error::runtime(
                        ErrorCode::IterationPastEnd,
                        format!("iter_set({}) outside the grid", at),
                    ),
                    loc,
                ));
            }
            vm.cursor = at as usize;
        }
        Marshal::IterMoveFirst => {
            vm.cursor = 0;
        }
        Marshal::IterMoveLast => {
            vm.cursor = vm.grid().row_count().saturating_sub(1);
        }
        Marshal::EventCount => {
            vm.stack.push(Value::Int(logical_event_count(vm)));
        }
        Marshal::SessionCount => {
            vm.stack.push(Value::Int(vm.grid().session_count()));
        }

        // collection methods: receiver is args[0]
        Marshal::Append => {
            let mut recv = args.remove(0);
            let item = args.remove(0);
            match &mut recv {
                Value::List(items) => items.push(item),
                Value::Set(items) => {
                    items.insert(item);
                }
                other => return Err(method_type_error("append", other, loc)),
            }
            vm.stack.push(recv);
        }
        Marshal::Pop => {
            let mut recv = args.remove(0);
            let popped = match &mut recv {
                Value::List(items) => items.pop().unwrap_or(Value::Nil),
                other => return Err(method_type_error("pop", other, loc)),
            };
            vm.stack.push(popped);
            vm.stack.push(recv);
        }
        Marshal::Clear => {
            let recv = match args.remove(0) {
                Value::List(_) => Value::List(Vec::new()),
                Value::Set(_) => Value::Set(BTreeSet::new()),
                Value::Dict(_) => Value::Dict(BTreeMap::new()),
                other => return Err(method_type_error("clear", &other, loc)),
            };
            vm.stack.push(recv);
        }
        Marshal::Keys => {
            let keys = match &args[0] {
                Value::Dict(map) => map.keys().cloned().collect(),
                other => return Err(method_type_error("keys", other, loc)),
            };
            vm.stack.push(Value::List(keys));
        }
        Marshal::Add => {
            let mut recv = args.remove(0);
            let item = args.remove(0);
            match &mut recv {
                Value::Set(items) => {
                    items.insert(item);
                }
                other => return Err(method_type_error("add", other, loc)),
            }
            vm.stack.push(recv);
        }
        Marshal::Remove => {
            let recv = args.remove(0);
            let key = args.remove(0);
            let out = recv.sub(key).map_err(|e| located(e, loc))?;
            vm.stack.push(out);
        }
        Marshal::Update => {
            let recv = args.remove(0);
            let other = args.remove(0);
            let out = recv.add(other).map_err(|e| located(e, loc))?;
            vm.stack.push(out);
        }
        Marshal::Find => {
            let hay = text_arg(&args[0], "find", loc)?;
            let needle = text_arg(&args[1], "find", loc)?;
            vm.stack.push(Value::Int(
                hay.find(&needle).map(|i| i as i64).unwrap_or(-1),
            ));
        }
        Marshal::Rfind => {
            let hay = text_arg(&args[0], "rfind", loc)?;
            let needle = text_arg(&args[1], "rfind", loc)?;
            vm.stack.push(Value::Int(
                hay.rfind(&needle).map(|i| i as i64).unwrap_or(-1),
            ));
        }
        Marshal::Split => {
            let hay = text_arg(&args[0], "split", loc)?;
            let sep = text_arg(&args[1], "split", loc)?;
            let parts = hay
                .split(sep.as_str())
                .map(|p| Value::text(p))
                .collect();
            vm.stack.push(Value::List(parts));
        }
        Marshal::Strip => {
            let s = text_arg(&args[0], "strip", loc)?;
            vm.stack.push(Value::text(s.trim()));
        }

        // segment math
        Marshal::Population => {
            let bits = segment_arg(vm, &args[0], loc)?;
            vm.stack.push(Value::Int(bits.population() as i64));
        }
        Marshal::Intersection => {
            let mut a = segment_arg(vm, &args[0], loc)?;
            let b = segment_arg(vm, &args[1], loc)?;
            a.op_and(&b);
            vm.stack.push(bits_value(&a));
        }
        Marshal::Union => {
            let mut a = segment_arg(vm, &args[0], loc)?;
            let b = segment_arg(vm, &args[1], loc)?;
            a.op_or(&b);
            vm.stack.push(bits_value(&a));
        }
        Marshal::Difference => {
            let mut a = segment_arg(vm, &args[0], loc)?;
            let b = segment_arg(vm, &args[1], loc)?;
            a.op_and_not(&b);
            vm.stack.push(bits_value(&a));
        }
        Marshal::Complement => {
            let mut a = segment_arg(vm, &args[0], loc)?;
            a.flip_all(vm.segments().entity_count());
            vm.stack.push(bits_value(&a));
        }
    }
    Ok(())
}

fn float_arg(v: &Value, what: &str, loc: &SourceLoc) -> Result<f64> {
    v.as_float().ok_or_else(|| {
        located(
            Error::runtime(
                ErrorCode::TypeMismatch,
                format!("`{}` expects a number, got {}", what, v.type_name()),
            ),
            loc,
        )
    })
}

fn text_arg(v: &Value, what: &str, loc: &SourceLoc) -> Result<String> {
    match v {
        Value::Text(t) => Ok(t.to_string()),
        other => Err(located(
            Error::runtime(
                ErrorCode::TypeMismatch,
                format!("`{}` expects text, got {}", what, other.type_name()),
            ),
            loc,
        )),
    }
}

fn method_type_error(method: &str, recv: &Value, loc: &SourceLoc) -> Error {
    located(
        Error::runtime(
            ErrorCode::TypeMismatch,
            format!("`.{}` not supported on {}", method, recv.type_name()),
        ),
        loc,
    )
}

/// Distinct logical events: physical rows collapse by row key.
fn logical_event_count(vm: &Interpreter<'_>) -> i64 {
    let grid = vm.grid();
    let mut count = 0i64;
    let mut last: Option<(i64, i32, i64)> = None;
    for i in 0..grid.row_count() {
        let row = grid.row(i);
        let key = (row.stamp, row.z, row.event);
        if last != Some(key) {
            count += 1;
            last = Some(key);
        }
    }
    count
}

/// Resolve a segment-math argument: a segment name, or the id list a
/// previous combinator produced.
fn segment_arg(vm: &Interpreter<'_>, arg: &Value, loc: &SourceLoc) -> Result<IndexBits> {
    match arg {
        Value::Text(t) => {
            let name = t.to_string();
            vm.segments().segment_bits(&name).ok_or_else(|| {
                located(
                    Error::runtime(
                        ErrorCode::TypeMismatch,
                        format!("no segment named `{}`", name),
                    ),
                    loc,
                )
            })
        }
        Value::List(ids) => Ok(ids
            .iter()
            .filter_map(Value::as_int)
            .map(|i| i as usize)
            .collect()),
        other => Err(located(
            Error::runtime(
                ErrorCode::TypeMismatch,
                format!("segment math expects a name or id list, got {}", other.type_name()),
            ),
            loc,
        )),
    }
}

fn bits_value(bits: &IndexBits) -> Value {
    Value::List(bits.ones().map(|i| Value::Int(i as i64)).collect())
}

/// Percent-decoding with `+` as space.
fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
