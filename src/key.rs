//! Backend-native identifiers.

use std::convert::TryFrom;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MalformedKey;

/// A 12-byte document identifier, written as 24 hex digits.
///
/// Keys usually arrive from a query as strings; [`Loader::try_load`] parses
/// them into this type, and a string that isn't a valid id fails only the
/// caller that passed it.
///
/// [`Loader::try_load`]: crate::Loader::try_load
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }

    pub const fn bytes(&self) -> [u8; 12] {
        self.0
    }

    /// Parse 24 hex digits, in either case. Nothing else is accepted: no
    /// signs, no whitespace, no `0x` prefix.
    pub fn parse(raw: &str) -> Result<Self, MalformedKey> {
        if raw.len() != 24 {
            return Err(MalformedKey::new(raw, "expected 24 hex digits"));
        }

        let mut bytes = [0u8; 12];
        for (byte, pair) in bytes.iter_mut().zip(raw.as_bytes().chunks_exact(2)) {
            *byte = hex_digit(raw, pair[0])? << 4 | hex_digit(raw, pair[1])?;
        }

        Ok(ObjectId(bytes))
    }
}

fn hex_digit(raw: &str, digit: u8) -> Result<u8, MalformedKey> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(MalformedKey::new(raw, "invalid hex digit")),
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|byte| write!(f, "{:02x}", byte))
    }
}

impl Debug for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

impl FromStr for ObjectId {
    type Err = MalformedKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectId::parse(s)
    }
}

impl TryFrom<&str> for ObjectId {
    type Error = MalformedKey;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        ObjectId::parse(value)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = MalformedKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ObjectId::parse(&value)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ObjectId::parse(&raw).map_err(de::Error::custom)
    }
}
