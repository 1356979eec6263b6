use std::fmt;

use crate::variant::Variant;

/// A dynamically typed D-Bus body value.
///
/// Values do not carry their own element types; marshalling and validation
/// are driven by a [`SignatureTree`] so that an empty [`Value::Array`] can
/// still be encoded with the correct element alignment.
///
/// A [`Value::UnixFd`] holds an index into the owning message's file
/// descriptor list, not the descriptor itself.
///
/// [`SignatureTree`]: crate::SignatureTree
///
/// # Examples
///
/// ```
/// use minibus::Value;
///
/// let value = Value::from("hello");
/// assert_eq!(value.as_str(), Some("hello"));
///
/// let body = [Value::Uint32(42), Value::Array(vec![Value::Byte(1)])];
/// assert_ne!(body[0], body[1]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 8-bit unsigned integer, `y`.
    Byte(u8),
    /// Boolean, `b`.
    Bool(bool),
    /// 16-bit signed integer, `n`.
    Int16(i16),
    /// 16-bit unsigned integer, `q`.
    Uint16(u16),
    /// 32-bit signed integer, `i`.
    Int32(i32),
    /// 32-bit unsigned integer, `u`.
    Uint32(u32),
    /// 64-bit signed integer, `x`.
    Int64(i64),
    /// 64-bit unsigned integer, `t`.
    Uint64(u64),
    /// IEEE 754 double, `d`.
    Double(f64),
    /// UTF-8 string, `s`.
    String(String),
    /// Object path, `o`.
    ObjectPath(String),
    /// Signature string, `g`.
    Signature(String),
    /// Index into the message's file descriptor list, `h`.
    UnixFd(u32),
    /// Array of values of a single type, `a…`.
    Array(Vec<Value>),
    /// Array of dict entries, `a{…}`. Entries keep their insertion order.
    Dict(Vec<(Value, Value)>),
    /// Struct fields in order, `(…)`.
    Struct(Vec<Value>),
    /// A boxed variant, `v`.
    Variant(Box<Variant>),
}

impl Value {
    /// Coerce into a string slice if this is a string, object path or
    /// signature value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    /// Coerce into a `u32` if this is a 32-bit unsigned value.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(v) => Some(*v),
            _ => None,
        }
    }

    /// Coerce into a variant reference.
    pub fn as_variant(&self) -> Option<&Variant> {
        match self {
            Value::Variant(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(v) => v.fmt(f),
            Value::Bool(v) => v.fmt(f),
            Value::Int16(v) => v.fmt(f),
            Value::Uint16(v) => v.fmt(f),
            Value::Int32(v) => v.fmt(f),
            Value::Uint32(v) => v.fmt(f),
            Value::Int64(v) => v.fmt(f),
            Value::Uint64(v) => v.fmt(f),
            Value::Double(v) => v.fmt(f),
            Value::String(v) | Value::ObjectPath(v) | Value::Signature(v) => {
                write!(f, "{v:?}")
            }
            Value::UnixFd(v) => write!(f, "fd#{v}"),
            Value::Array(values) => {
                let mut list = f.debug_list();

                for value in values {
                    list.entry(&format_args!("{value}"));
                }

                list.finish()
            }
            Value::Dict(entries) => {
                let mut map = f.debug_map();

                for (key, value) in entries {
                    map.entry(&format_args!("{key}"), &format_args!("{value}"));
                }

                map.finish()
            }
            Value::Struct(fields) => {
                let mut tuple = f.debug_tuple("");

                for field in fields {
                    tuple.field(&format_args!("{field}"));
                }

                tuple.finish()
            }
            Value::Variant(v) => write!(f, "{} {}", v.signature(), v.value()),
        }
    }
}

impl From<u8> for Value {
    #[inline]
    fn from(value: u8) -> Self {
        Value::Byte(value)
    }
}

impl From<bool> for Value {
    #[inline]
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i16> for Value {
    #[inline]
    fn from(value: i16) -> Self {
        Value::Int16(value)
    }
}

impl From<u16> for Value {
    #[inline]
    fn from(value: u16) -> Self {
        Value::Uint16(value)
    }
}

impl From<i32> for Value {
    #[inline]
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}

impl From<u32> for Value {
    #[inline]
    fn from(value: u32) -> Self {
        Value::Uint32(value)
    }
}

impl From<i64> for Value {
    #[inline]
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<u64> for Value {
    #[inline]
    fn from(value: u64) -> Self {
        Value::Uint64(value)
    }
}

impl From<f64> for Value {
    #[inline]
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(value: &str) -> Self {
        Value::String(value.into())
    }
}

impl From<String> for Value {
    #[inline]
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Variant> for Value {
    #[inline]
    fn from(value: Variant) -> Self {
        Value::Variant(Box::new(value))
    }
}
