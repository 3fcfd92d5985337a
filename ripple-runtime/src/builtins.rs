//! Runtime intrinsics callable from generated code.
//!
//! Each builtin has a stable dotted name; the compiler resolves intrinsic
//! calls against [`Builtin::ALL`] and any program function claiming the same
//! name.

use std::rc::Rc;

use crate::error::Trap;
use crate::value::Value;
use crate::wire::WireShape;

/// A runtime intrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    IntToString,
    IntAbs,
    IntMin,
    IntMax,
    StrConcat,
    StrLen,
    FloatFromInt,
    FloatTruncate,
    BytesLen,
}

impl Builtin {
    pub const ALL: &'static [Builtin] = &[
        Builtin::IntToString,
        Builtin::IntAbs,
        Builtin::IntMin,
        Builtin::IntMax,
        Builtin::StrConcat,
        Builtin::StrLen,
        Builtin::FloatFromInt,
        Builtin::FloatTruncate,
        Builtin::BytesLen,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::IntToString => "int.to_string",
            Builtin::IntAbs => "int.abs",
            Builtin::IntMin => "int.min",
            Builtin::IntMax => "int.max",
            Builtin::StrConcat => "str.concat",
            Builtin::StrLen => "str.len",
            Builtin::FloatFromInt => "float.from_int",
            Builtin::FloatTruncate => "float.truncate",
            Builtin::BytesLen => "bytes.len",
        }
    }

    pub fn from_name(name: &str) -> Option<Builtin> {
        Self::ALL.iter().copied().find(|b| b.name() == name)
    }

    /// Parameter and return shapes.
    pub fn signature(self) -> (Vec<WireShape>, WireShape) {
        use WireShape::*;
        match self {
            Builtin::IntToString => (vec![Int], Str),
            Builtin::IntAbs => (vec![Int], Int),
            Builtin::IntMin | Builtin::IntMax => (vec![Int, Int], Int),
            Builtin::StrConcat => (vec![Str, Str], Str),
            Builtin::StrLen => (vec![Str], Int),
            Builtin::FloatFromInt => (vec![Int], Float),
            Builtin::FloatTruncate => (vec![Float], Int),
            Builtin::BytesLen => (vec![Bytes], Int),
        }
    }

    pub fn eval(self, args: &[Value]) -> Result<Value, Trap> {
        let expected = self.signature().0.len();
        if args.len() != expected {
            return Err(Trap::ArityMismatch {
                function: self.name().to_string(),
                expected: expected as u32,
                found: args.len(),
            });
        }
        Ok(match self {
            Builtin::IntToString => Value::str(&int(&args[0])?.to_string()),
            Builtin::IntAbs => Value::Int(int(&args[0])?.checked_abs().ok_or(Trap::IntegerOverflow)?),
            Builtin::IntMin => Value::Int(int(&args[0])?.min(int(&args[1])?)),
            Builtin::IntMax => Value::Int(int(&args[0])?.max(int(&args[1])?)),
            Builtin::StrConcat => {
                let mut joined = string(&args[0])?.to_string();
                joined.push_str(string(&args[1])?);
                Value::Str(Rc::from(joined))
            }
            Builtin::StrLen => Value::Int(string(&args[0])?.chars().count() as i64),
            Builtin::FloatFromInt => Value::Float(int(&args[0])? as f64),
            Builtin::FloatTruncate => match &args[0] {
                Value::Float(x) => Value::Int(x.trunc() as i64),
                other => return Err(mismatch("float", other)),
            },
            Builtin::BytesLen => match &args[0] {
                Value::Bytes(b) => Value::Int(b.len() as i64),
                other => return Err(mismatch("bytes", other)),
            },
        })
    }
}

fn mismatch(expected: &'static str, found: &Value) -> Trap {
    Trap::TypeMismatch {
        context: "builtin argument",
        expected,
        found: found.type_name(),
    }
}

fn int(value: &Value) -> Result<i64, Trap> {
    value.as_int().ok_or_else(|| mismatch("int", value))
}

fn string(value: &Value) -> Result<&str, Trap> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(mismatch("str", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_roundtrip() {
        for builtin in Builtin::ALL {
            assert_eq!(Builtin::from_name(builtin.name()), Some(*builtin));
        }
        assert_eq!(Builtin::from_name("int.unknown"), None);
    }

    #[test]
    fn test_eval() {
        assert_eq!(Builtin::IntToString.eval(&[Value::Int(42)]).unwrap(), Value::str("42"));
        assert_eq!(
            Builtin::StrConcat.eval(&[Value::str("a"), Value::str("b")]).unwrap(),
            Value::str("ab")
        );
        assert_eq!(Builtin::IntMax.eval(&[Value::Int(2), Value::Int(7)]).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_eval_errors() {
        assert!(matches!(Builtin::IntAbs.eval(&[]), Err(Trap::ArityMismatch { .. })));
        assert!(matches!(Builtin::StrLen.eval(&[Value::Int(1)]), Err(Trap::TypeMismatch { .. })));
        assert_eq!(Builtin::IntAbs.eval(&[Value::Int(i64::MIN)]), Err(Trap::IntegerOverflow));
    }
}
