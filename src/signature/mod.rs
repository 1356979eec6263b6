//! The D-Bus signature model.
//!
//! A signature string such as `a{sv}` is parsed into a [`SignatureTree`], an
//! ordered list of [`SignatureType`] nodes. The tree drives marshalling,
//! unmarshalling and body validation. Parsing is deterministic, so trees are
//! cached process-wide by their source string through
//! [`SignatureTree::get`].

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::error;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use crate::validators::is_object_path_valid;
use crate::value::Value;

/// Maximum length of a signature in bytes.
pub(crate) const MAX_SIGNATURE: usize = 255;

/// Maximum nesting depth of containers in a signature.
pub(crate) const MAX_DEPTH: usize = 32;

/// Detailed errors raised when parsing a signature fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SignatureError {
    /// A type code not known to the protocol.
    UnknownTypeCode(u8),
    /// The signature is longer than 255 bytes.
    SignatureTooLong,
    /// An `a` with no element type following it.
    MissingArrayElementType,
    /// A `)` without a matching `(`.
    StructEndedButNotStarted,
    /// A `(` without a matching `)`.
    StructStartedButNotEnded,
    /// A struct `()` with no fields.
    StructHasNoFields,
    /// A `}` without a matching `{`.
    DictEndedButNotStarted,
    /// A `{` without a matching `}`.
    DictStartedButNotEnded,
    /// A dict entry in a position other than as an array element.
    DictEntryNotInsideArray,
    /// A dict entry key of a container type.
    DictKeyMustBeBasicType,
    /// A dict entry `{}` with no fields.
    DictEntryHasNoFields,
    /// A dict entry `{s}` missing its value type.
    DictEntryHasOnlyOneField,
    /// A dict entry `{svv}` with more than two fields.
    DictEntryHasTooManyFields,
    /// Containers nested deeper than 32 levels.
    ExceededMaximumDepth,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureError::UnknownTypeCode(c) => {
                write!(f, "unknown type code `{}`", *c as char)
            }
            SignatureError::SignatureTooLong => {
                write!(f, "signature is longer than {MAX_SIGNATURE} bytes")
            }
            SignatureError::MissingArrayElementType => {
                write!(f, "missing element type for array")
            }
            SignatureError::StructEndedButNotStarted => {
                write!(f, "`)` without a matching `(`")
            }
            SignatureError::StructStartedButNotEnded => {
                write!(f, "missing closing `)` for struct")
            }
            SignatureError::StructHasNoFields => write!(f, "struct has no fields"),
            SignatureError::DictEndedButNotStarted => {
                write!(f, "`}}` without a matching `{{`")
            }
            SignatureError::DictStartedButNotEnded => {
                write!(f, "missing closing `}}` for dict entry")
            }
            SignatureError::DictEntryNotInsideArray => {
                write!(f, "dict entry is only valid as an array element")
            }
            SignatureError::DictKeyMustBeBasicType => {
                write!(f, "dict entry key must be a basic type")
            }
            SignatureError::DictEntryHasNoFields => write!(f, "dict entry has no fields"),
            SignatureError::DictEntryHasOnlyOneField => {
                write!(f, "dict entry is missing its value type")
            }
            SignatureError::DictEntryHasTooManyFields => {
                write!(f, "dict entry has more than two fields")
            }
            SignatureError::ExceededMaximumDepth => {
                write!(f, "containers nested deeper than {MAX_DEPTH} levels")
            }
        }
    }
}

impl error::Error for SignatureError {}

/// A single-letter D-Bus type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeCode {
    /// 8-bit unsigned integer.
    Byte = b'y',
    /// Boolean value, marshalled as a 32-bit integer that is 0 or 1.
    Boolean = b'b',
    /// 16-bit signed integer.
    Int16 = b'n',
    /// 16-bit unsigned integer.
    Uint16 = b'q',
    /// 32-bit signed integer.
    Int32 = b'i',
    /// 32-bit unsigned integer.
    Uint32 = b'u',
    /// 64-bit signed integer.
    Int64 = b'x',
    /// 64-bit unsigned integer.
    Uint64 = b't',
    /// IEEE 754 double.
    Double = b'd',
    /// UTF-8 string without interior NUL bytes.
    String = b's',
    /// Name of an object instance.
    ObjectPath = b'o',
    /// A type signature.
    Signature = b'g',
    /// Index into the out-of-band array of file descriptors.
    UnixFd = b'h',
    /// Array of a single element type.
    Array = b'a',
    /// Struct of one or more fields.
    Struct = b'(',
    /// Variant, the type of the value is part of the value itself.
    Variant = b'v',
    /// Entry in a dict, an array of key-value pairs.
    DictEntry = b'{',
}

impl TypeCode {
    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'y' => Self::Byte,
            b'b' => Self::Boolean,
            b'n' => Self::Int16,
            b'q' => Self::Uint16,
            b'i' => Self::Int32,
            b'u' => Self::Uint32,
            b'x' => Self::Int64,
            b't' => Self::Uint64,
            b'd' => Self::Double,
            b's' => Self::String,
            b'o' => Self::ObjectPath,
            b'g' => Self::Signature,
            b'h' => Self::UnixFd,
            b'a' => Self::Array,
            b'(' => Self::Struct,
            b'v' => Self::Variant,
            b'{' => Self::DictEntry,
            _ => return None,
        })
    }

    /// The character spelling of this code in a signature.
    #[inline]
    pub fn as_char(self) -> char {
        self as u8 as char
    }

    /// Test if this is a basic (non-container) type.
    pub fn is_basic(self) -> bool {
        !matches!(
            self,
            TypeCode::Array | TypeCode::Struct | TypeCode::Variant | TypeCode::DictEntry
        )
    }
}

/// A single complete type within a signature.
///
/// Container nodes own their children: an array has exactly one, a struct
/// one or more, a dict entry exactly two (key then value). A variant has
/// none, its element type travels with the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureType {
    code: TypeCode,
    children: Vec<SignatureType>,
}

impl SignatureType {
    /// The type code of this node.
    #[inline]
    pub fn code(&self) -> TypeCode {
        self.code
    }

    /// The child nodes of this container, empty for basic types and
    /// variants.
    #[inline]
    pub fn children(&self) -> &[SignatureType] {
        &self.children
    }

    /// The D-Bus alignment of this type.
    ///
    /// # Examples
    ///
    /// ```
    /// use minibus::SignatureTree;
    ///
    /// let tree = SignatureTree::new("yqs(i)")?;
    /// let alignments = tree.types().iter().map(|t| t.alignment()).collect::<Vec<_>>();
    /// assert_eq!(alignments, [1, 2, 4, 8]);
    /// # Ok::<_, minibus::Error>(())
    /// ```
    pub fn alignment(&self) -> usize {
        match self.code {
            TypeCode::Byte | TypeCode::Signature | TypeCode::Variant => 1,
            TypeCode::Int16 | TypeCode::Uint16 => 2,
            TypeCode::Boolean
            | TypeCode::Int32
            | TypeCode::Uint32
            | TypeCode::String
            | TypeCode::ObjectPath
            | TypeCode::UnixFd
            | TypeCode::Array => 4,
            TypeCode::Int64
            | TypeCode::Uint64
            | TypeCode::Double
            | TypeCode::Struct
            | TypeCode::DictEntry => 8,
        }
    }

    /// Test if values of this type always marshal to the same number of
    /// bytes.
    pub fn is_fixed_size(&self) -> bool {
        match self.code {
            TypeCode::String
            | TypeCode::ObjectPath
            | TypeCode::Signature
            | TypeCode::Variant
            | TypeCode::Array => false,
            TypeCode::Struct | TypeCode::DictEntry => {
                self.children.iter().all(SignatureType::is_fixed_size)
            }
            _ => true,
        }
    }

    /// The signature spelling of this single type.
    pub fn signature(&self) -> String {
        let mut out = String::new();
        self.collapse(&mut out);
        out
    }

    fn collapse(&self, out: &mut String) {
        out.push(self.code.as_char());

        match self.code {
            TypeCode::Array => self.children[0].collapse(out),
            TypeCode::Struct => {
                for child in &self.children {
                    child.collapse(out);
                }
                out.push(')');
            }
            TypeCode::DictEntry => {
                for child in &self.children {
                    child.collapse(out);
                }
                out.push('}');
            }
            _ => {}
        }
    }

    /// Type-check a value against this node.
    pub fn verify(&self, value: &Value) -> Result<(), crate::Error> {
        let ok = match (self.code, value) {
            (TypeCode::Byte, Value::Byte(..)) => true,
            (TypeCode::Boolean, Value::Bool(..)) => true,
            (TypeCode::Int16, Value::Int16(..)) => true,
            (TypeCode::Uint16, Value::Uint16(..)) => true,
            (TypeCode::Int32, Value::Int32(..)) => true,
            (TypeCode::Uint32, Value::Uint32(..)) => true,
            (TypeCode::Int64, Value::Int64(..)) => true,
            (TypeCode::Uint64, Value::Uint64(..)) => true,
            (TypeCode::Double, Value::Double(..)) => true,
            (TypeCode::UnixFd, Value::UnixFd(..)) => true,
            (TypeCode::String, Value::String(..)) => true,
            (TypeCode::ObjectPath, Value::ObjectPath(path)) => {
                if !is_object_path_valid(path) {
                    return Err(mismatch(format_args!("`{path}` is not an object path")));
                }

                true
            }
            (TypeCode::Signature, Value::Signature(signature)) => {
                if SignatureTree::new(signature).is_err() {
                    return Err(mismatch(format_args!("`{signature}` is not a signature")));
                }

                true
            }
            (TypeCode::Variant, Value::Variant(..)) => true,
            (TypeCode::Array, Value::Array(values)) => {
                if self.children[0].code == TypeCode::DictEntry {
                    return Err(mismatch(format_args!(
                        "expected a dict for `{}`",
                        self.signature()
                    )));
                }

                for value in values {
                    self.children[0].verify(value)?;
                }

                true
            }
            (TypeCode::Array, Value::Dict(entries)) => {
                let entry = &self.children[0];

                if entry.code != TypeCode::DictEntry {
                    return Err(mismatch(format_args!(
                        "expected an array for `{}`",
                        self.signature()
                    )));
                }

                for (key, value) in entries {
                    entry.children[0].verify(key)?;
                    entry.children[1].verify(value)?;
                }

                true
            }
            (TypeCode::Struct, Value::Struct(fields)) => {
                if fields.len() != self.children.len() {
                    return Err(mismatch(format_args!(
                        "struct `{}` expects {} fields, got {}",
                        self.signature(),
                        self.children.len(),
                        fields.len()
                    )));
                }

                for (child, field) in self.children.iter().zip(fields) {
                    child.verify(field)?;
                }

                true
            }
            _ => false,
        };

        if !ok {
            return Err(mismatch(format_args!(
                "expected a value of type `{}`",
                self.signature()
            )));
        }

        Ok(())
    }
}

#[inline]
fn mismatch(what: fmt::Arguments<'_>) -> crate::Error {
    crate::Error::new(crate::error::ErrorKind::SignatureBodyMismatch(
        what.to_string().into(),
    ))
}

/// A parsed signature: an ordered list of complete types.
///
/// # Examples
///
/// ```
/// use minibus::SignatureTree;
///
/// let tree = SignatureTree::new("a{sv}u")?;
/// assert_eq!(tree.signature(), "a{sv}u");
/// assert_eq!(tree.types().len(), 2);
///
/// let empty = SignatureTree::new("")?;
/// assert!(empty.types().is_empty());
/// # Ok::<_, minibus::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct SignatureTree {
    signature: Box<str>,
    types: Vec<SignatureType>,
}

impl SignatureTree {
    /// Parse a signature string.
    pub fn new(signature: &str) -> Result<Self, SignatureError> {
        let bytes = signature.as_bytes();

        if bytes.len() > MAX_SIGNATURE {
            return Err(SignatureError::SignatureTooLong);
        }

        let mut types = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            types.push(parse_one(bytes, &mut pos, 0, false)?);
        }

        Ok(Self {
            signature: signature.into(),
            types,
        })
    }

    /// Look up a signature in the process-wide cache, parsing and inserting
    /// it on the first use.
    pub fn get(signature: &str) -> Result<Arc<Self>, SignatureError> {
        static CACHE: OnceLock<Mutex<HashMap<Box<str>, Arc<SignatureTree>>>> = OnceLock::new();

        let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));

        if let Some(tree) = cache.lock().unwrap().get(signature) {
            return Ok(tree.clone());
        }

        let tree = Arc::new(Self::new(signature)?);

        cache
            .lock()
            .unwrap()
            .entry(signature.into())
            .or_insert_with(|| tree.clone());

        Ok(tree)
    }

    /// The empty signature.
    pub fn empty() -> Arc<Self> {
        static EMPTY: OnceLock<Arc<SignatureTree>> = OnceLock::new();

        EMPTY
            .get_or_init(|| Arc::new(SignatureTree::new("").unwrap()))
            .clone()
    }

    /// The source string this tree was parsed from.
    #[inline]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The top-level types of this signature, in order.
    #[inline]
    pub fn types(&self) -> &[SignatureType] {
        &self.types
    }

    /// Type-check an ordered body against this signature.
    pub fn verify(&self, body: &[Value]) -> Result<(), crate::Error> {
        if body.len() != self.types.len() {
            return Err(mismatch(format_args!(
                "signature `{}` expects {} values, got {}",
                self.signature,
                self.types.len(),
                body.len()
            )));
        }

        for (ty, value) in self.types.iter().zip(body) {
            ty.verify(value)?;
        }

        Ok(())
    }
}

impl PartialEq for SignatureTree {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.signature == other.signature
    }
}

impl Eq for SignatureTree {}

impl fmt::Display for SignatureTree {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature)
    }
}

fn parse_one(
    bytes: &[u8],
    pos: &mut usize,
    depth: usize,
    in_array: bool,
) -> Result<SignatureType, SignatureError> {
    let byte = bytes[*pos];
    *pos += 1;

    let code = match byte {
        b')' => return Err(SignatureError::StructEndedButNotStarted),
        b'}' => return Err(SignatureError::DictEndedButNotStarted),
        byte => TypeCode::from_byte(byte).ok_or(SignatureError::UnknownTypeCode(byte))?,
    };

    match code {
        TypeCode::Array => {
            if depth == MAX_DEPTH {
                return Err(SignatureError::ExceededMaximumDepth);
            }

            if *pos == bytes.len() || bytes[*pos] == b')' || bytes[*pos] == b'}' {
                return Err(SignatureError::MissingArrayElementType);
            }

            let element = parse_one(bytes, pos, depth + 1, true)?;

            Ok(SignatureType {
                code,
                children: vec![element],
            })
        }
        TypeCode::Struct => {
            if depth == MAX_DEPTH {
                return Err(SignatureError::ExceededMaximumDepth);
            }

            let mut children = Vec::new();

            loop {
                match bytes.get(*pos) {
                    None => return Err(SignatureError::StructStartedButNotEnded),
                    Some(b')') => {
                        *pos += 1;
                        break;
                    }
                    Some(..) => {
                        children.push(parse_one(bytes, pos, depth + 1, false)?);
                    }
                }
            }

            if children.is_empty() {
                return Err(SignatureError::StructHasNoFields);
            }

            Ok(SignatureType { code, children })
        }
        TypeCode::DictEntry => {
            if !in_array {
                return Err(SignatureError::DictEntryNotInsideArray);
            }

            if depth == MAX_DEPTH {
                return Err(SignatureError::ExceededMaximumDepth);
            }

            match bytes.get(*pos) {
                None => return Err(SignatureError::DictStartedButNotEnded),
                Some(b'}') => return Err(SignatureError::DictEntryHasNoFields),
                Some(..) => {}
            }

            let key = parse_one(bytes, pos, depth + 1, false)?;

            if !key.code.is_basic() {
                return Err(SignatureError::DictKeyMustBeBasicType);
            }

            match bytes.get(*pos) {
                None => return Err(SignatureError::DictStartedButNotEnded),
                Some(b'}') => return Err(SignatureError::DictEntryHasOnlyOneField),
                Some(..) => {}
            }

            let value = parse_one(bytes, pos, depth + 1, false)?;

            match bytes.get(*pos) {
                None => Err(SignatureError::DictStartedButNotEnded),
                Some(b'}') => {
                    *pos += 1;

                    Ok(SignatureType {
                        code,
                        children: vec![key, value],
                    })
                }
                Some(..) => Err(SignatureError::DictEntryHasTooManyFields),
            }
        }
        code => Ok(SignatureType {
            code,
            children: Vec::new(),
        }),
    }
}
