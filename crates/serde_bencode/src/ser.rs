use std::io::Write;

use serde::ser::{self, Serialize};

use crate::{Error, ErrorKind};

/// Writes bencode into any [`Write`] sink.
///
/// Struct fields are emitted in declaration order and maps in iteration order, so callers that
/// need the canonical (sorted keys) form should go through [`crate::BencodeValue`] or declare
/// their fields alphabetically.
pub struct Serializer<'w, W: Write> {
    output: &'w mut W,
}

impl<'w, W: Write> Serializer<'w, W> {
    pub fn new(output: &'w mut W) -> Self {
        Serializer { output }
    }

    fn emit(&mut self, raw: &[u8]) -> Result<(), Error> {
        self.output.write_all(raw).map_err(Error::from)
    }

    fn emit_len_prefixed(&mut self, raw: &[u8]) -> Result<(), Error> {
        write!(self.output, "{}:", raw.len())?;
        self.emit(raw)
    }
}

/// Shared state for every compound value: lists, dictionaries, structs and enum variants.
///
/// `closing` holds the terminator(s) to emit once all elements are written.
pub struct Compound<'a, 'w, W: Write> {
    serializer: &'a mut Serializer<'w, W>,
    closing: &'static [u8],
}

impl<'a, 'w, W: Write> Compound<'a, 'w, W> {
    fn finish(self) -> Result<(), Error> {
        self.serializer.emit(self.closing)
    }
}

impl<'a, 'w, W: Write> ser::SerializeSeq for Compound<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Error> {
        value.serialize(&mut *self.serializer)
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}

impl<'a, 'w, W: Write> ser::SerializeTuple for Compound<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Error> {
        value.serialize(&mut *self.serializer)
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}

impl<'a, 'w, W: Write> ser::SerializeTupleStruct for Compound<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Error> {
        value.serialize(&mut *self.serializer)
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}

impl<'a, 'w, W: Write> ser::SerializeTupleVariant for Compound<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Error> {
        value.serialize(&mut *self.serializer)
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}

impl<'a, 'w, W: Write> ser::SerializeMap for Compound<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), Error> {
        key.serialize(&mut *self.serializer)
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Error> {
        value.serialize(&mut *self.serializer)
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}

impl<'a, 'w, W: Write> ser::SerializeStruct for Compound<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<(), Error> {
        self.serializer.emit_len_prefixed(key.as_bytes())?;
        value.serialize(&mut *self.serializer)
    }

    fn skip_field(&mut self, _key: &'static str) -> Result<(), Error> {
        Ok(())
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}

impl<'a, 'w, W: Write> ser::SerializeStructVariant for Compound<'a, 'w, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<(), Error> {
        self.serializer.emit_len_prefixed(key.as_bytes())?;
        value.serialize(&mut *self.serializer)
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}

impl<'a, 'w, W: Write> ser::Serializer for &'a mut Serializer<'w, W> {
    type Ok = ();
    type Error = Error;

    type SerializeSeq = Compound<'a, 'w, W>;
    type SerializeTuple = Compound<'a, 'w, W>;
    type SerializeTupleStruct = Compound<'a, 'w, W>;
    type SerializeTupleVariant = Compound<'a, 'w, W>;
    type SerializeMap = Compound<'a, 'w, W>;
    type SerializeStruct = Compound<'a, 'w, W>;
    type SerializeStructVariant = Compound<'a, 'w, W>;

    fn serialize_bool(self, _v: bool) -> Result<(), Error> {
        Err(ErrorKind::Unsupported("bool").into())
    }

    fn serialize_i8(self, v: i8) -> Result<(), Error> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i16(self, v: i16) -> Result<(), Error> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i32(self, v: i32) -> Result<(), Error> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i64(self, v: i64) -> Result<(), Error> {
        write!(self.output, "i{v}e").map_err(Error::from)
    }

    fn serialize_u8(self, v: u8) -> Result<(), Error> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u16(self, v: u16) -> Result<(), Error> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u32(self, v: u32) -> Result<(), Error> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u64(self, v: u64) -> Result<(), Error> {
        write!(self.output, "i{v}e").map_err(Error::from)
    }

    fn serialize_f32(self, _v: f32) -> Result<(), Error> {
        Err(ErrorKind::Unsupported("f32").into())
    }

    fn serialize_f64(self, _v: f64) -> Result<(), Error> {
        Err(ErrorKind::Unsupported("f64").into())
    }

    fn serialize_char(self, v: char) -> Result<(), Error> {
        let mut buf = [0u8; 4];
        self.serialize_str(v.encode_utf8(&mut buf))
    }

    fn serialize_str(self, v: &str) -> Result<(), Error> {
        self.emit_len_prefixed(v.as_bytes())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<(), Error> {
        self.emit_len_prefixed(v)
    }

    fn serialize_none(self) -> Result<(), Error> {
        self.serialize_unit()
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), Error> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), Error> {
        self.emit(b"0:")
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), Error> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(self, _name: &'static str, _idx: u32, variant: &'static str) -> Result<(), Error> {
        self.emit(b"d")?;
        self.emit_len_prefixed(variant.as_bytes())?;
        self.emit(b"0:e")
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(self, _name: &'static str, value: &T) -> Result<(), Error> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _idx: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        self.emit(b"d")?;
        self.emit_len_prefixed(variant.as_bytes())?;
        value.serialize(&mut *self)?;
        self.emit(b"e")
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, Error> {
        self.emit(b"l")?;
        Ok(Compound {
            serializer: self,
            closing: b"e",
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple, Error> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<Self::SerializeTupleStruct, Error> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _idx: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, Error> {
        self.emit(b"d")?;
        self.emit_len_prefixed(variant.as_bytes())?;
        self.emit(b"l")?;
        Ok(Compound {
            serializer: self,
            closing: b"ee",
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, Error> {
        self.emit(b"d")?;
        Ok(Compound {
            serializer: self,
            closing: b"e",
        })
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct, Error> {
        self.serialize_map(None)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _idx: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, Error> {
        self.emit(b"d")?;
        self.emit_len_prefixed(variant.as_bytes())?;
        self.emit(b"d")?;
        Ok(Compound {
            serializer: self,
            closing: b"ee",
        })
    }
}

pub fn to_writer<T: ?Sized + Serialize, W: Write>(value: &T, writer: &mut W) -> Result<(), Error> {
    value.serialize(&mut Serializer::new(writer))
}

pub fn to_bytes<T: ?Sized + Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    to_writer(value, &mut buf)?;
    Ok(buf)
}

pub fn to_string<T: ?Sized + Serialize>(value: &T) -> Result<String, Error> {
    String::from_utf8(to_bytes(value)?).map_err(|e| ErrorKind::Custom(e.to_string()).into())
}
