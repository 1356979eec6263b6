use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::os::fd::RawFd;
use std::str;

use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;
use crate::protocol::{
    padding_to, Endianness, Flags, HeaderField, MessageType, FIXED_HEADER_LENGTH,
    MAX_ARRAY_LENGTH, MAX_MESSAGE_LENGTH, PROTOCOL_VERSION,
};
use crate::signature::{SignatureTree, SignatureType, TypeCode};
use crate::value::Value;
use crate::variant::Variant;

/// Resumable parser for the D-Bus binary encoding.
///
/// Bytes read off the transport are appended with [`feed`], after which
/// [`take_message`] either produces one complete message and consumes its
/// bytes, or reports that more bytes are needed by returning `None`.
///
/// [`feed`]: Unmarshaller::feed
/// [`take_message`]: Unmarshaller::take_message
pub(crate) struct Unmarshaller {
    buf: Vec<u8>,
}

impl Unmarshaller {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append a chunk of bytes received from the transport.
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to produce one complete message from the buffered bytes.
    ///
    /// File descriptors referenced by a `UNIX_FDS` header field are consumed
    /// from the transport's ancillary queue.
    pub(crate) fn take_message(
        &mut self,
        fds: &mut VecDeque<RawFd>,
    ) -> Result<Option<Message>> {
        // Fixed header plus the header field array length prefix.
        if self.buf.len() < FIXED_HEADER_LENGTH + 4 {
            return Ok(None);
        }

        let endianness = match self.buf[0] {
            b'l' => Endianness::LITTLE,
            b'B' => Endianness::BIG,
            byte => {
                return Err(Error::new(ErrorKind::InvalidMessage(
                    format!("invalid endianness marker `{byte:#04x}`").into(),
                )))
            }
        };

        if self.buf[3] != PROTOCOL_VERSION {
            return Err(Error::new(ErrorKind::InvalidMessage(
                format!("unknown protocol version {}", self.buf[3]).into(),
            )));
        }

        let mut reader = Reader::new(&self.buf, endianness);
        reader.advance(4)?;
        let body_length = reader.read_u32()? as usize;
        let serial = reader.read_u32()?;
        let fields_length = reader.read_u32()? as usize;

        let header_length = FIXED_HEADER_LENGTH + 4 + fields_length;
        let total = header_length + padding_to(header_length, 8) + body_length;

        if total > MAX_MESSAGE_LENGTH {
            return Err(Error::new(ErrorKind::MessageTooLarge(total)));
        }

        if self.buf.len() < total {
            return Ok(None);
        }

        let message_type = MessageType(self.buf[1]);
        let flags = Flags(self.buf[2]);

        let Some(serial) = NonZeroU32::new(serial) else {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "message serial is zero".into(),
            )));
        };

        let mut reader = Reader::new(&self.buf[..total], endianness);
        reader.advance(FIXED_HEADER_LENGTH)?;

        let fields_tree = SignatureTree::get("a(yv)").expect("static signature");
        let fields = reader.read_value(&fields_tree.types()[0])?;

        let mut message = Message {
            message_type,
            flags,
            serial: Some(serial),
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            sender: None,
            signature: SignatureTree::empty(),
            body: Vec::new(),
            unix_fds: Vec::new(),
        };

        let mut fd_count = 0u32;

        let Value::Array(fields) = fields else {
            unreachable!("a(yv) reads as an array");
        };

        for field in fields {
            let Value::Struct(mut field) = field else {
                unreachable!("(yv) reads as a struct");
            };

            let Some(Value::Variant(variant)) = field.pop() else {
                unreachable!("second field of (yv) reads as a variant");
            };

            let Some(Value::Byte(code)) = field.pop() else {
                unreachable!("first field of (yv) reads as a byte");
            };

            let value = variant.into_value();

            match (HeaderField(code), value) {
                (HeaderField::PATH, Value::ObjectPath(v)) => message.path = Some(v),
                (HeaderField::INTERFACE, Value::String(v)) => message.interface = Some(v),
                (HeaderField::MEMBER, Value::String(v)) => message.member = Some(v),
                (HeaderField::ERROR_NAME, Value::String(v)) => message.error_name = Some(v),
                (HeaderField::REPLY_SERIAL, Value::Uint32(v)) => {
                    message.reply_serial = NonZeroU32::new(v);

                    if message.reply_serial.is_none() {
                        return Err(Error::new(ErrorKind::InvalidMessage(
                            "REPLY_SERIAL header is zero".into(),
                        )));
                    }
                }
                (HeaderField::DESTINATION, Value::String(v)) => message.destination = Some(v),
                (HeaderField::SENDER, Value::String(v)) => message.sender = Some(v),
                (HeaderField::SIGNATURE, Value::Signature(v)) => {
                    message.signature = SignatureTree::get(&v)?;
                }
                (HeaderField::UNIX_FDS, Value::Uint32(v)) => fd_count = v,
                (HeaderField(1..=9), value) => {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        format!("header field {code} has unexpected value {value}").into(),
                    )));
                }
                // Unknown header fields must be ignored.
                _ => {}
            }
        }

        reader.align(8)?;

        for ty in message.signature.types() {
            message.body.push(reader.read_value(ty)?);
        }

        if reader.pos != total {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "trailing bytes after message body".into(),
            )));
        }

        for _ in 0..fd_count {
            let Some(fd) = fds.pop_front() else {
                return Err(Error::new(ErrorKind::InvalidMessage(
                    "message references more file descriptors than were received".into(),
                )));
            };

            message.unix_fds.push(fd);
        }

        message.validate()?;

        self.buf.drain(..total);
        Ok(Some(message))
    }
}

/// Cursor over a complete message's bytes.
///
/// Alignment is relative to the start of the message, which is what the
/// absolute position tracks.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    endianness: Endianness,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], endianness: Endianness) -> Self {
        Self {
            data,
            pos: 0,
            endianness,
        }
    }

    fn advance(&mut self, n: usize) -> Result<()> {
        if self.data.len() - self.pos < n {
            return Err(underflow());
        }

        self.pos += n;
        Ok(())
    }

    fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = padding_to(self.pos, alignment);
        self.advance(padding)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(underflow());
        }

        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn read_byte(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let bytes = self.read_bytes(2)?.try_into().unwrap();
        Ok(match self.endianness {
            Endianness::BIG => u16::from_be_bytes(bytes),
            _ => u16::from_le_bytes(bytes),
        })
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let bytes = self.read_bytes(4)?.try_into().unwrap();
        Ok(match self.endianness {
            Endianness::BIG => u32::from_be_bytes(bytes),
            _ => u32::from_le_bytes(bytes),
        })
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let bytes = self.read_bytes(8)?.try_into().unwrap();
        Ok(match self.endianness {
            Endianness::BIG => u64::from_be_bytes(bytes),
            _ => u64::from_le_bytes(bytes),
        })
    }

    /// Read a 4-byte length-prefixed string with its trailing NUL.
    fn read_string(&mut self) -> Result<String> {
        let length = self.read_u32()? as usize;
        let bytes = self.read_bytes(length)?;

        if self.read_byte()? != 0 {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "string is not NUL terminated".into(),
            )));
        }

        Ok(str::from_utf8(bytes)?.to_owned())
    }

    /// Read a 1-byte length-prefixed signature with its trailing NUL.
    fn read_signature(&mut self) -> Result<String> {
        let length = self.read_byte()? as usize;
        let bytes = self.read_bytes(length)?;

        if self.read_byte()? != 0 {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "signature is not NUL terminated".into(),
            )));
        }

        Ok(str::from_utf8(bytes)?.to_owned())
    }

    fn read_value(&mut self, ty: &SignatureType) -> Result<Value> {
        Ok(match ty.code() {
            TypeCode::Byte => Value::Byte(self.read_byte()?),
            TypeCode::Boolean => Value::Bool(self.read_u32()? != 0),
            TypeCode::Int16 => Value::Int16(self.read_u16()? as i16),
            TypeCode::Uint16 => Value::Uint16(self.read_u16()?),
            TypeCode::Int32 => Value::Int32(self.read_u32()? as i32),
            TypeCode::Uint32 => Value::Uint32(self.read_u32()?),
            TypeCode::Int64 => Value::Int64(self.read_u64()? as i64),
            TypeCode::Uint64 => Value::Uint64(self.read_u64()?),
            TypeCode::Double => Value::Double(f64::from_bits(self.read_u64()?)),
            TypeCode::UnixFd => Value::UnixFd(self.read_u32()?),
            TypeCode::String => Value::String(self.read_string()?),
            TypeCode::ObjectPath => {
                let path = self.read_string()?;

                if !crate::validators::is_object_path_valid(&path) {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        format!("`{path}` is not a valid object path").into(),
                    )));
                }

                Value::ObjectPath(path)
            }
            TypeCode::Signature => {
                let signature = self.read_signature()?;
                SignatureTree::get(&signature)?;
                Value::Signature(signature)
            }
            TypeCode::Variant => {
                let signature = self.read_signature()?;
                let tree = SignatureTree::get(&signature)?;

                if tree.types().len() != 1 {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        format!("variant signature `{signature}` is not a single complete type")
                            .into(),
                    )));
                }

                let value = self.read_value(&tree.types()[0])?;
                Value::Variant(Box::new(Variant::with_tree(tree, value)?))
            }
            TypeCode::Array => {
                let length = self.read_u32()?;

                if length > MAX_ARRAY_LENGTH {
                    return Err(Error::new(ErrorKind::ArrayTooLong(length)));
                }

                let element = &ty.children()[0];
                // The alignment padding of the first element is not part of
                // the array length.
                self.align(element.alignment())?;
                let end = self.pos + length as usize;

                if element.code() == TypeCode::DictEntry {
                    let mut entries = Vec::new();

                    while self.pos < end {
                        self.align(8)?;
                        let key = self.read_value(&element.children()[0])?;
                        let value = self.read_value(&element.children()[1])?;
                        entries.push((key, value));
                    }

                    check_array_end(self.pos, end)?;
                    Value::Dict(entries)
                } else {
                    let mut values = Vec::new();

                    while self.pos < end {
                        values.push(self.read_value(element)?);
                    }

                    check_array_end(self.pos, end)?;
                    Value::Array(values)
                }
            }
            TypeCode::Struct => {
                self.align(8)?;
                let mut fields = Vec::new();

                for child in ty.children() {
                    fields.push(self.read_value(child)?);
                }

                Value::Struct(fields)
            }
            TypeCode::DictEntry => {
                self.align(8)?;
                let key = self.read_value(&ty.children()[0])?;
                let value = self.read_value(&ty.children()[1])?;
                Value::Struct(vec![key, value])
            }
        })
    }
}

fn check_array_end(pos: usize, end: usize) -> Result<()> {
    if pos != end {
        return Err(Error::new(ErrorKind::InvalidMessage(
            "array elements overran the array length".into(),
        )));
    }

    Ok(())
}

#[inline]
fn underflow() -> Error {
    Error::new(ErrorKind::InvalidMessage(
        "message data ended short of a value".into(),
    ))
}

/// Unmarshal one complete message from a byte slice, for callers that
/// already have the full message in hand.
#[cfg(test)]
pub(crate) fn unmarshal_message(bytes: &[u8]) -> Result<Message> {
    let mut unmarshaller = Unmarshaller::new();
    let mut fds = VecDeque::new();
    unmarshaller.feed(bytes);

    match unmarshaller.take_message(&mut fds)? {
        Some(message) => Ok(message),
        None => Err(Error::new(ErrorKind::InvalidMessage(
            "byte slice does not contain a complete message".into(),
        ))),
    }
}
