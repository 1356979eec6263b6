use std::fmt;
use std::sync::Arc;

use crate::error::{ErrorKind, Result};
use crate::signature::SignatureTree;
use crate::value::Value;
use crate::Error;

/// A value boxed together with its signature.
///
/// The signature must spell exactly one complete type and the value is
/// type-checked against it at construction time, after which the variant is
/// immutable.
///
/// # Examples
///
/// ```
/// use minibus::{Value, Variant};
///
/// let variant = Variant::new("as", Value::Array(vec![Value::from("x")]))?;
/// assert_eq!(variant.signature(), "as");
///
/// // The signature of a variant must be a single complete type.
/// assert!(Variant::new("ii", Value::Int32(1)).is_err());
/// // ... and the value has to match it.
/// assert!(Variant::new("i", Value::from("nope")).is_err());
/// # Ok::<_, minibus::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    tree: Arc<SignatureTree>,
    value: Value,
}

impl Variant {
    /// Construct a new variant, checking the value against the signature.
    pub fn new(signature: &str, value: Value) -> Result<Self> {
        Self::with_tree(SignatureTree::get(signature)?, value)
    }

    /// Construct a new variant from an already parsed signature tree.
    pub fn with_tree(tree: Arc<SignatureTree>, value: Value) -> Result<Self> {
        if tree.types().len() != 1 {
            return Err(Error::new(ErrorKind::SignatureBodyMismatch(
                format!(
                    "variant signature `{}` must be a single complete type",
                    tree.signature()
                )
                .into(),
            )));
        }

        tree.types()[0].verify(&value)?;

        Ok(Self { tree, value })
    }

    /// The signature of the contained value.
    #[inline]
    pub fn signature(&self) -> &str {
        self.tree.signature()
    }

    /// The parsed signature tree of the contained value.
    #[inline]
    pub(crate) fn tree(&self) -> &Arc<SignatureTree> {
        &self.tree
    }

    /// The contained value.
    #[inline]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Unwrap the contained value.
    #[inline]
    pub fn into_value(self) -> Value {
        self.value
    }
}

impl fmt::Display for Variant {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.signature(), self.value)
    }
}
