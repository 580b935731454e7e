use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Dictionary representation used by [`BencodeValue`].
///
/// Keys are raw byte strings and `BTreeMap` keeps them in raw-byte order, which is exactly the
/// order bencode requires, so every re-encoded dictionary is canonical.
pub type Dict = BTreeMap<Vec<u8>, BencodeValue>;

/// An owned, schema-less bencode tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(Dict),
}

impl BencodeValue {
    pub fn dict() -> Self {
        BencodeValue::Dict(Dict::new())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|raw| std::str::from_utf8(raw).ok())
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            BencodeValue::Dict(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut Dict> {
        match self {
            BencodeValue::Dict(v) => Some(v),
            _ => None,
        }
    }

    /// Dictionary lookup by a textual key. `None` for missing keys and non-dictionaries.
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        self.as_dict().and_then(|dict| dict.get(key.as_bytes()))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut BencodeValue> {
        self.as_dict_mut().and_then(|dict| dict.get_mut(key.as_bytes()))
    }
}

impl Serialize for BencodeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BencodeValue::Int(v) => serializer.serialize_i64(*v),
            BencodeValue::Bytes(v) => serializer.serialize_bytes(v),
            BencodeValue::List(items) => serializer.collect_seq(items),
            BencodeValue::Dict(dict) => {
                let mut map = serializer.serialize_map(Some(dict.len()))?;
                for (key, value) in dict {
                    map.serialize_entry(&RawKey(key), value)?;
                }
                map.end()
            }
        }
    }
}

/// Serializes as a byte string instead of a list of integers.
struct RawKey<'a>(&'a [u8]);

impl Serialize for RawKey<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

struct OwnedKey(Vec<u8>);

impl<'de> Deserialize<'de> for OwnedKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyVisitor;

        impl<'de> Visitor<'de> for KeyVisitor {
            type Value = OwnedKey;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a bencode byte string key")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<OwnedKey, E> {
                Ok(OwnedKey(v.to_vec()))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<OwnedKey, E> {
                Ok(OwnedKey(v.as_bytes().to_vec()))
            }
        }

        deserializer.deserialize_bytes(KeyVisitor)
    }
}

impl<'de> Deserialize<'de> for BencodeValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = BencodeValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a valid bencode value")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<BencodeValue, E> {
                Ok(BencodeValue::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<BencodeValue, E> {
                i64::try_from(v)
                    .map(BencodeValue::Int)
                    .map_err(|_| E::custom("integer doesn't fit into i64"))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<BencodeValue, E> {
                Ok(BencodeValue::Bytes(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<BencodeValue, E> {
                Ok(BencodeValue::Bytes(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<BencodeValue, E> {
                Ok(BencodeValue::Bytes(v.as_bytes().to_vec()))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<BencodeValue, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(BencodeValue::List(items))
            }

            fn visit_map<A: de::MapAccess<'de>>(self, mut map: A) -> Result<BencodeValue, A::Error> {
                let mut dict = Dict::new();
                while let Some(OwnedKey(key)) = map.next_key()? {
                    let value = map.next_value()?;
                    dict.insert(key, value);
                }
                Ok(BencodeValue::Dict(dict))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

impl From<i64> for BencodeValue {
    fn from(value: i64) -> Self {
        BencodeValue::Int(value)
    }
}

impl From<&[u8]> for BencodeValue {
    fn from(value: &[u8]) -> Self {
        BencodeValue::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for BencodeValue {
    fn from(value: Vec<u8>) -> Self {
        BencodeValue::Bytes(value)
    }
}

impl From<&str> for BencodeValue {
    fn from(value: &str) -> Self {
        BencodeValue::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for BencodeValue {
    fn from(value: String) -> Self {
        BencodeValue::Bytes(value.into_bytes())
    }
}

impl From<Vec<BencodeValue>> for BencodeValue {
    fn from(value: Vec<BencodeValue>) -> Self {
        BencodeValue::List(value)
    }
}

impl From<Dict> for BencodeValue {
    fn from(value: Dict) -> Self {
        BencodeValue::Dict(value)
    }
}
