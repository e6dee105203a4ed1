use crate::{ErrorKind, HandelError, Result};
use std::fmt;

/// A loosely typed value passed through item setters and backend calls.
///
/// Configuration items arrive either from the typed API or as text from the
/// configuration file, so the accessors below coerce text where the target
/// type is unambiguous.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Double(f64),
    Char(char),
    Text(String),
    Bytes(Vec<u8>),
    Words(Vec<u16>),
    Counts(Vec<u32>),
    Doubles(Vec<f64>),
}

impl Value {
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Double(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            Value::Bool(v) => Ok(f64::from(u8::from(*v))),
            Value::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| err!(BadValue, "'{s}' is not a number")),
            other => Err(wrong_type("double", other)),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Double(v) if v.fract() == 0.0 => Ok(*v as i64),
            Value::Bool(v) => Ok(i64::from(*v)),
            Value::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| err!(BadValue, "'{s}' is not an integer")),
            other => Err(wrong_type("integer", other)),
        }
    }

    pub fn as_usize(&self) -> Result<usize> {
        let v = self.as_i64()?;
        usize::try_from(v).map_err(|_| err!(BadValue, "{v} is negative"))
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(v) => Ok(*v),
            Value::Int(v) => Ok(*v != 0),
            Value::Double(v) => Ok(*v != 0.0),
            Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                _ => Err(err!(BadValue, "'{s}' is not a boolean")),
            },
            other => Err(wrong_type("boolean", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Text(s) => Ok(s),
            other => Err(wrong_type("string", other)),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(wrong_type("byte blob", other)),
        }
    }

    pub fn into_words(self) -> Result<Vec<u16>> {
        match self {
            Value::Words(w) => Ok(w),
            other => Err(wrong_type("word array", &other)),
        }
    }

    pub fn into_counts(self) -> Result<Vec<u32>> {
        match self {
            Value::Counts(c) => Ok(c),
            Value::Words(w) => Ok(w.into_iter().map(u32::from).collect()),
            other => Err(wrong_type("count array", &other)),
        }
    }

    pub fn into_doubles(self) -> Result<Vec<f64>> {
        match self {
            Value::Doubles(d) => Ok(d),
            Value::Counts(c) => Ok(c.into_iter().map(f64::from).collect()),
            Value::Words(w) => Ok(w.into_iter().map(f64::from).collect()),
            other => Err(wrong_type("double array", &other)),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

fn wrong_type(expected: &str, got: &Value) -> HandelError {
    HandelError::new(
        ErrorKind::WrongType,
        format!("expected a {expected}, got {got:?}"),
    )
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => Ok(()),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Char(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Words(v) => write!(f, "<{} words>", v.len()),
            Value::Counts(v) => write!(f, "<{} counts>", v.len()),
            Value::Doubles(v) => write!(f, "<{} doubles>", v.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<char> for Value {
    fn from(v: char) -> Self {
        Value::Char(v)
    }
}

macro_rules! from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(v as i64)
            }
        })*
    };
}

from_int!(i32, i64, u16, u32, usize);

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<u16>> for Value {
    fn from(v: Vec<u16>) -> Self {
        Value::Words(v)
    }
}

impl From<Vec<u32>> for Value {
    fn from(v: Vec<u32>) -> Self {
        Value::Counts(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Doubles(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_coerces_to_numbers() {
        assert_eq!(Value::from(" 8756 ").as_i64().unwrap(), 8756);
        assert_eq!(Value::from("1.0e-6").as_f64().unwrap(), 1.0e-6);
        assert!(Value::from("true").as_bool().unwrap());
    }

    #[test]
    fn mismatched_types_are_rejected() {
        let err = Value::Words(vec![1, 2]).as_f64().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongType);
        let err = Value::from("abc").as_i64().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadValue);
        assert!(Value::from(-3).as_usize().is_err());
    }
}
