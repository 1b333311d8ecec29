// Copyright 2024 The Zeta Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! 256-bit object identity.

use std::fmt;
use std::fmt::Debug;

use blake2::Blake2b;
use blake2::Digest as _;
use digest::consts::U32;

use crate::hex_util;

/// Number of bytes in an object id.
pub const HASH_LEN: usize = 32;

/// Number of hex digits in the canonical text form of an object id.
pub const HASH_HEX_LEN: usize = HASH_LEN * 2;

/// The digest that produces object ids.
pub type ObjectHasher = Blake2b<U32>;

/// Identifier for an object, derived from its canonical serialized form.
///
/// The all-zero value is reserved and means "absent".
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; HASH_LEN]);

impl ObjectId {
    /// The reserved "absent" id.
    pub const ZERO: Self = Self([0; HASH_LEN]);

    pub fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Creates an id from a byte slice. Returns `None` unless the slice is
    /// exactly [`HASH_LEN`] bytes.
    pub fn try_from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(Self(bytes.try_into().ok()?))
    }

    /// Parses the given hex string into an id.
    ///
    /// The given string must be valid. A static str is required to prevent
    /// API misuse.
    pub fn from_hex(hex: &'static str) -> Self {
        Self::try_from_hex(hex).unwrap()
    }

    /// Parses the given lowercase hex string into an id.
    pub fn try_from_hex(hex: impl AsRef<[u8]>) -> Option<Self> {
        let bytes = hex_util::decode_hex(hex)?;
        Self::try_from_bytes(&bytes)
    }

    /// Hashes `data` into an id. Callers are expected to have prefixed the
    /// data with the object kind header for domain separation.
    pub fn hash_of(data: &[u8]) -> Self {
        let mut hasher = ObjectHasher::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn from_digest(hasher: ObjectHasher) -> Self {
        Self(hasher.finalize().into())
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex_util::encode_hex(&self.0)
    }
}

impl Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_tuple("ObjectId").field(&self.hex()).finish()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.pad(&self.hex())
    }
}

impl serde::Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.hex().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::try_from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("Invalid object id: {hex}")))
    }
}

/// An id prefix with facilities for converting between bytes and a hex
/// string.
#[derive(Clone, PartialEq, Eq)]
pub struct HexPrefix {
    // For odd-length prefixes, the lower 4 bits of the last byte are
    // zero-filled (e.g. the prefix "abc" is stored in two bytes as "abc0").
    min_prefix_bytes: Vec<u8>,
    has_odd_byte: bool,
}

impl HexPrefix {
    /// Returns a new `HexPrefix` or `None` if `prefix` cannot be decoded from
    /// hex to bytes.
    pub fn try_from_hex(prefix: impl AsRef<[u8]>) -> Option<Self> {
        let (min_prefix_bytes, has_odd_byte) = hex_util::decode_hex_prefix(prefix)?;
        Some(Self {
            min_prefix_bytes,
            has_odd_byte,
        })
    }

    /// Returns a new `HexPrefix` representing the given full `id`.
    pub fn from_id(id: &ObjectId) -> Self {
        Self {
            min_prefix_bytes: id.as_bytes().to_vec(),
            has_odd_byte: false,
        }
    }

    /// Returns string representation of this prefix using hex digits.
    pub fn hex(&self) -> String {
        let mut hex_string = hex_util::encode_hex(&self.min_prefix_bytes);
        if self.has_odd_byte {
            hex_string.pop().unwrap();
        }
        hex_string
    }

    /// Number of hex digits in this prefix.
    pub fn hex_len(&self) -> usize {
        self.min_prefix_bytes.len() * 2 - usize::from(self.has_odd_byte)
    }

    /// Minimum bytes that would match this prefix. (e.g. "abc0" for "abc")
    ///
    /// Use this to partition a sorted slice, and test `matches(id)` from
    /// there.
    pub fn min_prefix_bytes(&self) -> &[u8] {
        &self.min_prefix_bytes
    }

    fn split_odd_byte(&self) -> (Option<u8>, &[u8]) {
        if self.has_odd_byte {
            let (&odd, prefix) = self.min_prefix_bytes.split_last().unwrap();
            (Some(odd), prefix)
        } else {
            (None, &self.min_prefix_bytes)
        }
    }

    /// Returns whether the stored prefix matches the prefix of `id`.
    pub fn matches(&self, id: &ObjectId) -> bool {
        let id_bytes = id.as_bytes();
        let (maybe_odd, prefix) = self.split_odd_byte();
        if id_bytes.starts_with(prefix) {
            if let Some(odd) = maybe_odd {
                matches!(id_bytes.get(prefix.len()), Some(v) if v & 0xf0 == odd)
            } else {
                true
            }
        } else {
            false
        }
    }
}

impl Debug for HexPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_tuple("HexPrefix").field(&self.hex()).finish()
    }
}

/// The result of a prefix search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixResolution<T> {
    NoMatch,
    SingleMatch(T),
    AmbiguousMatch,
}

impl<T> PrefixResolution<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PrefixResolution<U> {
        match self {
            Self::NoMatch => PrefixResolution::NoMatch,
            Self::SingleMatch(x) => PrefixResolution::SingleMatch(f(x)),
            Self::AmbiguousMatch => PrefixResolution::AmbiguousMatch,
        }
    }
}

impl<T: Clone> PrefixResolution<T> {
    pub fn plus(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::NoMatch, other) => other.clone(),
            (local, Self::NoMatch) => local.clone(),
            (Self::AmbiguousMatch, _) => Self::AmbiguousMatch,
            (_, Self::AmbiguousMatch) => Self::AmbiguousMatch,
            (Self::SingleMatch(_), Self::SingleMatch(_)) => Self::AmbiguousMatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_id() {
        assert!(ObjectId::ZERO.is_zero());
        assert_eq!(ObjectId::ZERO.hex(), "0".repeat(HASH_HEX_LEN));
        assert!(!ObjectId::hash_of(b"").is_zero());
    }

    #[test]
    fn test_display_object_id() {
        let id = ObjectId::hash_of(b"zeta");
        assert_eq!(format!("{id}"), id.hex());
        assert_eq!(format!("{id:.6}"), id.hex()[..6]);
    }

    #[test]
    fn test_try_from_hex_requires_full_length() {
        assert_eq!(ObjectId::try_from_hex("deadbeef"), None);
        let full = "ab".repeat(HASH_LEN);
        assert!(ObjectId::try_from_hex(&full).is_some());
    }

    #[test]
    fn test_hex_prefix_matches() {
        let id = ObjectId::try_from_hex("1234".to_owned() + &"0".repeat(60)).unwrap();

        assert!(HexPrefix::try_from_hex("").unwrap().matches(&id));
        assert!(HexPrefix::try_from_hex("1").unwrap().matches(&id));
        assert!(HexPrefix::try_from_hex("12").unwrap().matches(&id));
        assert!(HexPrefix::try_from_hex("123").unwrap().matches(&id));
        assert!(!HexPrefix::try_from_hex("1235").unwrap().matches(&id));
        assert!(!HexPrefix::try_from_hex("a").unwrap().matches(&id));
        assert_eq!(HexPrefix::try_from_hex("0x123"), None);
    }

    #[test]
    fn test_prefix_resolution_plus() {
        use PrefixResolution::*;
        let single = SingleMatch(1);
        assert_eq!(NoMatch::<i32>.plus(&NoMatch), NoMatch);
        assert_eq!(NoMatch.plus(&single), single);
        assert_eq!(single.plus(&NoMatch), single);
        assert_eq!(single.plus(&single), AmbiguousMatch);
        assert_eq!(AmbiguousMatch::<i32>.plus(&NoMatch), AmbiguousMatch);
    }
}
