use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;
use crate::protocol::{
    padding_to, Endianness, HeaderField, MAX_ARRAY_LENGTH, MAX_MESSAGE_LENGTH, PROTOCOL_VERSION,
};
use crate::signature::{SignatureTree, SignatureType, TypeCode};
use crate::value::Value;
use crate::variant::Variant;

/// Serializer for the D-Bus binary encoding.
///
/// Writes into a growable byte buffer. Every typed write pads the buffer up
/// to the alignment of the type first, so offsets are always relative to the
/// start of the message.
pub(crate) struct Marshaller {
    buf: Vec<u8>,
    endianness: Endianness,
}

impl Marshaller {
    pub(crate) fn new(endianness: Endianness) -> Self {
        Self {
            buf: Vec::new(),
            endianness,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Pad with zero bytes up to the given alignment.
    pub(crate) fn align(&mut self, alignment: usize) {
        let padding = padding_to(self.buf.len(), alignment);
        self.buf.resize(self.buf.len() + padding, 0);
    }

    #[inline]
    pub(crate) fn write_byte(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub(crate) fn write_u16(&mut self, value: u16) {
        self.align(2);
        self.extend(value.to_le_bytes(), value.to_be_bytes());
    }

    pub(crate) fn write_i16(&mut self, value: i16) {
        self.align(2);
        self.extend(value.to_le_bytes(), value.to_be_bytes());
    }

    pub(crate) fn write_u32(&mut self, value: u32) {
        self.align(4);
        self.extend(value.to_le_bytes(), value.to_be_bytes());
    }

    pub(crate) fn write_i32(&mut self, value: i32) {
        self.align(4);
        self.extend(value.to_le_bytes(), value.to_be_bytes());
    }

    pub(crate) fn write_u64(&mut self, value: u64) {
        self.align(8);
        self.extend(value.to_le_bytes(), value.to_be_bytes());
    }

    pub(crate) fn write_i64(&mut self, value: i64) {
        self.align(8);
        self.extend(value.to_le_bytes(), value.to_be_bytes());
    }

    pub(crate) fn write_f64(&mut self, value: f64) {
        self.align(8);
        self.extend(value.to_le_bytes(), value.to_be_bytes());
    }

    /// Write a string as a 4-byte length, the UTF-8 bytes and a trailing
    /// NUL which is not included in the length.
    pub(crate) fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    /// Write a signature as a 1-byte length, the ASCII bytes and a trailing
    /// NUL.
    pub(crate) fn write_signature(&mut self, value: &str) {
        self.write_byte(value.len() as u8);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    #[inline]
    fn extend<const N: usize>(&mut self, le: [u8; N], be: [u8; N]) {
        match self.endianness {
            Endianness::BIG => self.buf.extend_from_slice(&be),
            _ => self.buf.extend_from_slice(&le),
        }
    }

    /// Write a single value of the given type.
    pub(crate) fn write_value(&mut self, ty: &SignatureType, value: &Value) -> Result<()> {
        match (ty.code(), value) {
            (TypeCode::Byte, Value::Byte(v)) => self.write_byte(*v),
            (TypeCode::Boolean, Value::Bool(v)) => self.write_u32(*v as u32),
            (TypeCode::Int16, Value::Int16(v)) => self.write_i16(*v),
            (TypeCode::Uint16, Value::Uint16(v)) => self.write_u16(*v),
            (TypeCode::Int32, Value::Int32(v)) => self.write_i32(*v),
            (TypeCode::Uint32, Value::Uint32(v)) => self.write_u32(*v),
            (TypeCode::Int64, Value::Int64(v)) => self.write_i64(*v),
            (TypeCode::Uint64, Value::Uint64(v)) => self.write_u64(*v),
            (TypeCode::Double, Value::Double(v)) => self.write_f64(*v),
            (TypeCode::UnixFd, Value::UnixFd(v)) => self.write_u32(*v),
            (TypeCode::String, Value::String(v)) => self.write_string(v),
            (TypeCode::ObjectPath, Value::ObjectPath(v)) => self.write_string(v),
            (TypeCode::Signature, Value::Signature(v)) => self.write_signature(v),
            (TypeCode::Array, Value::Array(values)) => {
                let element = &ty.children()[0];

                if element.code() == TypeCode::DictEntry {
                    return Err(mismatch(ty, value));
                }

                self.write_array(element, |m| {
                    for value in values {
                        m.write_value(element, value)?;
                    }

                    Ok(())
                })?;
            }
            (TypeCode::Array, Value::Dict(entries)) => {
                let element = &ty.children()[0];

                if element.code() != TypeCode::DictEntry {
                    return Err(mismatch(ty, value));
                }

                self.write_array(element, |m| {
                    for (key, value) in entries {
                        m.align(8);
                        m.write_value(&element.children()[0], key)?;
                        m.write_value(&element.children()[1], value)?;
                    }

                    Ok(())
                })?;
            }
            (TypeCode::Struct, Value::Struct(fields)) => {
                if fields.len() != ty.children().len() {
                    return Err(mismatch(ty, value));
                }

                self.align(8);

                for (child, field) in ty.children().iter().zip(fields) {
                    self.write_value(child, field)?;
                }
            }
            (TypeCode::Variant, Value::Variant(variant)) => {
                self.write_signature(variant.signature());
                self.write_value(&variant.tree().types()[0], variant.value())?;
            }
            _ => return Err(mismatch(ty, value)),
        }

        Ok(())
    }

    /// Write an array: a 4-aligned length slot, padding to the element
    /// alignment (even when the array is empty), the elements, and finally
    /// the backfilled length which excludes that initial padding.
    fn write_array(
        &mut self,
        element: &SignatureType,
        write: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.write_u32(0);
        let slot = self.buf.len() - 4;

        self.align(element.alignment());
        let start = self.buf.len();

        write(self)?;

        let length = (self.buf.len() - start) as u32;

        if length > MAX_ARRAY_LENGTH {
            return Err(Error::new(ErrorKind::ArrayTooLong(length)));
        }

        let bytes = match self.endianness {
            Endianness::BIG => length.to_be_bytes(),
            _ => length.to_le_bytes(),
        };

        self.buf[slot..slot + 4].copy_from_slice(&bytes);
        Ok(())
    }

    /// Write an ordered body per its signature tree.
    pub(crate) fn write_body(&mut self, tree: &SignatureTree, body: &[Value]) -> Result<()> {
        if body.len() != tree.types().len() {
            return Err(Error::new(ErrorKind::SignatureBodyMismatch(
                format!(
                    "signature `{}` expects {} values, got {}",
                    tree.signature(),
                    tree.types().len(),
                    body.len()
                )
                .into(),
            )));
        }

        for (ty, value) in tree.types().iter().zip(body) {
            self.write_value(ty, value)?;
        }

        Ok(())
    }
}

#[inline]
fn mismatch(ty: &SignatureType, value: &Value) -> Error {
    Error::new(ErrorKind::SignatureBodyMismatch(
        format!("cannot marshal {value} as `{}`", ty.signature()).into(),
    ))
}

/// Marshal a complete message: the 12-byte fixed header, the `a(yv)` header
/// field array, padding to 8, and the body.
///
/// The message must have a serial assigned.
pub(crate) fn marshal_message(message: &Message) -> Result<Vec<u8>> {
    let Some(serial) = message.serial else {
        return Err(Error::new(ErrorKind::InvalidMessage(
            "cannot marshal a message without a serial".into(),
        )));
    };

    message.validate()?;

    let endianness = Endianness::LITTLE;

    let mut body = Marshaller::new(endianness);
    body.write_body(&message.signature, &message.body)?;

    let mut fields = Vec::new();

    let field = |code: HeaderField, variant: Variant| {
        Value::Struct(vec![Value::Byte(code.0), Value::Variant(Box::new(variant))])
    };

    if let Some(path) = &message.path {
        let variant = Variant::new("o", Value::ObjectPath(path.clone()))?;
        fields.push(field(HeaderField::PATH, variant));
    }

    if let Some(interface) = &message.interface {
        let variant = Variant::new("s", Value::String(interface.clone()))?;
        fields.push(field(HeaderField::INTERFACE, variant));
    }

    if let Some(member) = &message.member {
        let variant = Variant::new("s", Value::String(member.clone()))?;
        fields.push(field(HeaderField::MEMBER, variant));
    }

    if let Some(error_name) = &message.error_name {
        let variant = Variant::new("s", Value::String(error_name.clone()))?;
        fields.push(field(HeaderField::ERROR_NAME, variant));
    }

    if let Some(reply_serial) = message.reply_serial {
        let variant = Variant::new("u", Value::Uint32(reply_serial.get()))?;
        fields.push(field(HeaderField::REPLY_SERIAL, variant));
    }

    if let Some(destination) = &message.destination {
        let variant = Variant::new("s", Value::String(destination.clone()))?;
        fields.push(field(HeaderField::DESTINATION, variant));
    }

    if let Some(sender) = &message.sender {
        let variant = Variant::new("s", Value::String(sender.clone()))?;
        fields.push(field(HeaderField::SENDER, variant));
    }

    if !message.signature.types().is_empty() {
        let variant = Variant::new(
            "g",
            Value::Signature(message.signature.signature().to_owned()),
        )?;
        fields.push(field(HeaderField::SIGNATURE, variant));
    }

    if !message.unix_fds.is_empty() {
        let variant = Variant::new("u", Value::Uint32(message.unix_fds.len() as u32))?;
        fields.push(field(HeaderField::UNIX_FDS, variant));
    }

    let header_tree = SignatureTree::get("yyyyuua(yv)").expect("static signature");

    let mut out = Marshaller::new(endianness);
    out.write_body(
        &header_tree,
        &[
            Value::Byte(endianness.0),
            Value::Byte(message.message_type.0),
            Value::Byte(message.flags.0),
            Value::Byte(PROTOCOL_VERSION),
            Value::Uint32(body.len() as u32),
            Value::Uint32(serial.get()),
            Value::Array(fields),
        ],
    )?;
    out.align(8);

    let total = out.len() + body.len();

    if total > MAX_MESSAGE_LENGTH {
        return Err(Error::new(ErrorKind::MessageTooLarge(total)));
    }

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&body.into_bytes());
    Ok(bytes)
}
