use std::ops::Range;

use serde::de::{self, IgnoredAny, Visitor};
use serde::{Deserialize, Deserializer};

use crate::{Error, ErrorKind};

/// Zero-copy bencode reader over a byte slice.
pub struct BencodeDeserializer<'de> {
    input: &'de [u8],
    position: usize,
}

impl<'de> BencodeDeserializer<'de> {
    pub fn from_bytes(input: &'de [u8]) -> Self {
        BencodeDeserializer { input, position: 0 }
    }

    pub fn from_str(input: &'de str) -> Self {
        Self::from_bytes(input.as_bytes())
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_exhausted(&self) -> bool {
        self.input.is_empty()
    }

    fn error(&self, kind: ErrorKind) -> Error {
        Error::from(kind).at(self.position)
    }

    fn peek(&self, expected: &'static str) -> Result<u8, Error> {
        self.input
            .first()
            .copied()
            .ok_or_else(|| self.error(ErrorKind::UnexpectedEof(expected)))
    }

    fn advance(&mut self, by: usize) {
        self.position += by;
        self.input = &self.input[by..];
    }

    /// Consumes `tag` or fails with `what`.
    fn expect(&mut self, tag: u8, what: &'static str) -> Result<(), Error> {
        if self.peek(what)? != tag {
            return Err(self.error(ErrorKind::BadInputData(what)));
        }
        self.advance(1);
        Ok(())
    }

    fn parse_integer(&mut self) -> Result<i64, Error> {
        self.expect(b'i', "integer marker 'i'")?;
        let end = self
            .input
            .iter()
            .position(|byte| *byte == b'e')
            .ok_or_else(|| self.error(ErrorKind::UnexpectedEof("integer terminator 'e'")))?;
        let digits = std::str::from_utf8(&self.input[..end])
            .map_err(|_| self.error(ErrorKind::BadInputData("integer is not ascii")))?;
        if digits.is_empty() || digits == "-0" || (digits.len() > 1 && digits.starts_with('0')) {
            return Err(self.error(ErrorKind::BadInputData("non-canonical integer")));
        }
        let value = digits
            .parse()
            .map_err(|_| self.error(ErrorKind::BadInputData("integer out of range")))?;
        self.advance(end + 1);
        Ok(value)
    }

    fn parse_bytes(&mut self) -> Result<&'de [u8], Error> {
        if !self.peek("byte string")?.is_ascii_digit() {
            return Err(self.error(ErrorKind::BadInputData("expected byte string length")));
        }
        let delim = self
            .input
            .iter()
            .position(|byte| *byte == b':')
            .ok_or_else(|| self.error(ErrorKind::BadInputData("expected byte string delimiter ':'")))?;
        let len: usize = std::str::from_utf8(&self.input[..delim])
            .ok()
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| self.error(ErrorKind::BadInputData("invalid byte string length")))?;
        let available = self.input.len() - delim - 1;
        if len > available {
            return Err(self.error(ErrorKind::UnexpectedEof("byte string contents")));
        }
        self.advance(delim + 1);
        let raw = &self.input[..len];
        self.advance(len);
        Ok(raw)
    }

    fn parse_container<V, F>(&mut self, tag: u8, what: &'static str, visit: F) -> Result<V, Error>
    where
        F: FnOnce(&mut Self) -> Result<V, Error>,
    {
        self.expect(tag, what)?;
        let value = visit(self)?;
        self.expect(b'e', "container terminator 'e'")?;
        Ok(value)
    }
}

impl<'de, 'a> Deserializer<'de> for &'a mut BencodeDeserializer<'de> {
    type Error = Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        match self.peek("any bencode value")? {
            b'd' => self.deserialize_map(visitor),
            b'l' => self.deserialize_seq(visitor),
            b'i' => self.deserialize_i64(visitor),
            _ => self.deserialize_bytes(visitor),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Error> {
        Err(self.error(ErrorKind::Unsupported("bool")))
    }

    fn deserialize_i8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_i64(self.parse_integer()?)
    }

    fn deserialize_u8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_f32<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Error> {
        Err(self.error(ErrorKind::Unsupported("f32")))
    }

    fn deserialize_f64<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Error> {
        Err(self.error(ErrorKind::Unsupported("f64")))
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        let raw = self.parse_bytes()?;
        let s = std::str::from_utf8(raw).map_err(|_| self.error(ErrorKind::BadInputData("string is not utf-8")))?;
        visitor.visit_borrowed_str(s)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_borrowed_bytes(self.parse_bytes()?)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        if self.input.starts_with(b"0:") {
            self.advance(2);
            return visitor.visit_none();
        }
        visitor.visit_some(self)
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        if !self.parse_bytes()?.is_empty() {
            return Err(self.error(ErrorKind::BadInputData("expected an empty byte string")));
        }
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(self, _name: &'static str, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(self, _name: &'static str, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.parse_container(b'l', "list marker 'l'", |de| visitor.visit_seq(Access { de }))
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.parse_container(b'd', "dictionary marker 'd'", |de| visitor.visit_map(Access { de }))
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        self.deserialize_map(visitor)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        self.parse_container(b'd', "enum dictionary marker 'd'", |de| visitor.visit_enum(Access { de }))
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_any(visitor)
    }
}

struct Access<'a, 'de> {
    de: &'a mut BencodeDeserializer<'de>,
}

impl<'a, 'de> Access<'a, 'de> {
    fn at_end(&self) -> Result<bool, Error> {
        Ok(self.de.peek("next element or 'e'")? == b'e')
    }
}

impl<'a, 'de> de::SeqAccess<'de> for Access<'a, 'de> {
    type Error = Error;

    fn next_element_seed<T: de::DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>, Error> {
        if self.at_end()? {
            return Ok(None);
        }
        seed.deserialize(&mut *self.de).map(Some)
    }
}

impl<'a, 'de> de::MapAccess<'de> for Access<'a, 'de> {
    type Error = Error;

    fn next_key_seed<K: de::DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>, Error> {
        if self.at_end()? {
            return Ok(None);
        }
        seed.deserialize(&mut *self.de).map(Some)
    }

    fn next_value_seed<V: de::DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, Error> {
        seed.deserialize(&mut *self.de)
    }
}

impl<'a, 'de> de::EnumAccess<'de> for Access<'a, 'de> {
    type Error = Error;
    type Variant = Self;

    fn variant_seed<V: de::DeserializeSeed<'de>>(self, seed: V) -> Result<(V::Value, Self), Error> {
        Ok((seed.deserialize(&mut *self.de)?, self))
    }
}

impl<'a, 'de> de::VariantAccess<'de> for Access<'a, 'de> {
    type Error = Error;

    fn unit_variant(self) -> Result<(), Error> {
        if !self.de.parse_bytes()?.is_empty() {
            return Err(self.de.error(ErrorKind::BadInputData("expected an empty byte string")));
        }
        Ok(())
    }

    fn newtype_variant_seed<T: de::DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value, Error> {
        seed.deserialize(&mut *self.de)
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value, Error> {
        self.de.deserialize_seq(visitor)
    }

    fn struct_variant<V: Visitor<'de>>(self, _fields: &'static [&'static str], visitor: V) -> Result<V::Value, Error> {
        self.de.deserialize_map(visitor)
    }
}

pub fn from_bytes<'de, T: Deserialize<'de>>(input: &'de [u8]) -> Result<T, Error> {
    let mut deserializer = BencodeDeserializer::from_bytes(input);
    let value = T::deserialize(&mut deserializer)?;
    if !deserializer.is_exhausted() {
        return Err(deserializer.error(ErrorKind::BadInputData("trailing bytes after the top-level value")));
    }
    Ok(value)
}

pub fn from_str<'de, T: Deserialize<'de>>(input: &'de str) -> Result<T, Error> {
    from_bytes(input.as_bytes())
}

/// Locates the raw encoded value stored under `key` in a top-level dictionary.
///
/// Hashing the returned slice (e.g. the `info` dictionary) stays correct even for inputs whose
/// keys aren't in canonical order, because nothing is re-encoded.
pub fn dict_value_span(input: &[u8], key: &[u8]) -> Result<Option<Range<usize>>, Error> {
    let mut de = BencodeDeserializer::from_bytes(input);
    de.expect(b'd', "dictionary marker 'd'")?;
    while de.peek("dictionary key or 'e'")? != b'e' {
        let current = de.parse_bytes()?;
        let start = de.position();
        IgnoredAny::deserialize(&mut de)?;
        if current == key {
            return Ok(Some(start..de.position()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_byte_string_is_an_error_not_a_panic() {
        let err = from_bytes::<&[u8]>(b"10:abc").expect_err("should reject a truncated string");
        assert!(matches!(err.kind, ErrorKind::UnexpectedEof(_)));
    }

    #[test]
    fn rejects_leading_zero_integers() {
        assert!(from_bytes::<i64>(b"i03e").is_err());
        assert!(from_bytes::<i64>(b"i-0e").is_err());
        assert_eq!(from_bytes::<i64>(b"i0e").expect("zero is canonical"), 0);
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert!(from_bytes::<i64>(b"i1ei2e").is_err());
    }

    #[test]
    fn finds_info_span() {
        let input = b"d8:announce3:url4:infod4:name1:xe5:extrai1ee";
        let span = dict_value_span(input, b"info")
            .expect("failed to scan the dictionary")
            .expect("info should be present");
        assert_eq!(&input[span], b"d4:name1:xe");
        assert!(dict_value_span(input, b"missing").expect("scan failed").is_none());
    }
}
