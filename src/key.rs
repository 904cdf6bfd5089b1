use std::fmt;

use smallvec::SmallVec;

use crate::{repr::RowId, utils::EscapedBytes};

const ESCAPE: u8 = 0x01;
const TERMINATOR: u8 = 0x00;

/// An index key in its binary comparable form.
///
/// Encoded keys compare in the same order as the values they were built from and no encoded
/// key is a prefix of another key of the same kind, which the tree relies on.
/// Byte strings escape `0x00` and `0x01` and end with a `0x00` terminator,
/// integers are stored big endian with the sign bit flipped.
/// Composite keys are built by appending encoded parts.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deref)]
pub struct ArtKey(SmallVec<u8, 24>);

impl fmt::Debug for ArtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtKey({:?})", EscapedBytes(&self.0))
    }
}

impl ArtKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut key = Self::default();
        key.push_bytes(bytes);
        key
    }

    pub fn from_u64(v: u64) -> Self {
        Self(SmallVec::from_slice(&v.to_be_bytes()))
    }

    pub fn from_i64(v: i64) -> Self {
        Self::from_u64(v as u64 ^ (1 << 63))
    }

    pub fn from_u32(v: u32) -> Self {
        Self(SmallVec::from_slice(&v.to_be_bytes()))
    }

    pub fn from_i32(v: i32) -> Self {
        Self::from_u32(v as u32 ^ (1 << 31))
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.0.reserve(bytes.len() + 1);
        for &b in bytes {
            match b {
                TERMINATOR | ESCAPE => {
                    self.0.push(ESCAPE);
                    self.0.push(b + 1);
                }
                _ => self.0.push(b),
            }
        }
        self.0.push(TERMINATOR);
    }

    /// Appends another encoded key, e.g. the next column of a composite key
    pub fn append(&mut self, other: &ArtKey) {
        self.0.extend_from_slice(&other.0);
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decodes a byte string encoded by [ArtKey::from_bytes] at the start of `encoded`.
    /// Returns the decoded bytes and the number of encoded bytes consumed.
    pub fn decode_bytes(encoded: &[u8]) -> Option<(Vec<u8>, usize)> {
        let mut out = Vec::with_capacity(encoded.len());
        let mut iter = encoded.iter().copied().enumerate();
        while let Some((i, b)) = iter.next() {
            match b {
                TERMINATOR => return Some((out, i + 1)),
                ESCAPE => match iter.next()? {
                    (_, e @ 1..=2) => out.push(e - 1),
                    _ => return None,
                },
                _ => out.push(b),
            }
        }
        None
    }
}

impl From<&[u8]> for ArtKey {
    fn from(value: &[u8]) -> Self {
        Self::from_bytes(value)
    }
}

impl From<&str> for ArtKey {
    fn from(value: &str) -> Self {
        Self::from_bytes(value.as_bytes())
    }
}

impl From<u64> for ArtKey {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl From<i64> for ArtKey {
    fn from(value: i64) -> Self {
        Self::from_i64(value)
    }
}

impl From<u32> for ArtKey {
    fn from(value: u32) -> Self {
        Self::from_u32(value)
    }
}

impl From<i32> for ArtKey {
    fn from(value: i32) -> Self {
        Self::from_i32(value)
    }
}

/// Length of the keys of the row id sets nested under gates
pub const ROW_KEY_LEN: usize = 8;

pub type RowKey = [u8; ROW_KEY_LEN];

/// The binary comparable form of a row id, as stored under a gate
#[inline]
pub fn row_key(row_id: RowId) -> RowKey {
    (row_id as u64 ^ (1 << 63)).to_be_bytes()
}

#[inline]
pub fn row_id_from_key(key: &[u8]) -> RowId {
    let mut bytes = [0; ROW_KEY_LEN];
    bytes.copy_from_slice(key);
    (u64::from_be_bytes(bytes) ^ (1 << 63)) as RowId
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_escaping() {
        assert_eq!(ArtKey::from("a").as_bytes(), b"a\0");
        assert_eq!(ArtKey::from(&b"a\0b\x01"[..]).as_bytes(), b"a\x01\x01b\x01\x02\0");
        assert_eq!(ArtKey::from("").as_bytes(), b"\0");
        assert_eq!(
            ArtKey::decode_bytes(b"a\x01\x01b\x01\x02\0rest"),
            Some((b"a\0b\x01".to_vec(), 7))
        );
        assert_eq!(ArtKey::decode_bytes(b"abc"), None);
        assert_eq!(ArtKey::decode_bytes(b"a\x01\x05\0"), None);
    }

    #[test]
    fn test_row_key() {
        for row_id in [i64::MIN, -1, 0, 1, 42, i64::MAX] {
            assert_eq!(row_id_from_key(&row_key(row_id)), row_id);
        }
        assert!(row_key(-1) < row_key(0));
        assert!(row_key(0) < row_key(1));
        assert_eq!(row_key(0), [0x80, 0, 0, 0, 0, 0, 0, 0]);
    }

    proptest! {
        #[test]
        fn bytes_order_preserved(a in prop::collection::vec(0u8..4, 0..8), b in prop::collection::vec(0u8..4, 0..8)) {
            let (ka, kb) = (ArtKey::from(&a[..]), ArtKey::from(&b[..]));
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
            if a != b {
                prop_assert!(!ka.starts_with(&kb) && !kb.starts_with(&ka));
            }
            prop_assert_eq!(ArtKey::decode_bytes(&ka), Some((a, ka.len())));
        }

        #[test]
        fn integer_order_preserved(a: i64, b: i64, c: i32, d: i32) {
            prop_assert_eq!(a.cmp(&b), ArtKey::from(a).cmp(&ArtKey::from(b)));
            prop_assert_eq!(c.cmp(&d), ArtKey::from(c).cmp(&ArtKey::from(d)));
            prop_assert_eq!(row_key(a).cmp(&row_key(b)), a.cmp(&b));
        }

        #[test]
        fn composite_order_preserved(a: (u32, String), b: (u32, String)) {
            let encode = |(n, s): &(u32, String)| {
                let mut key = ArtKey::from(*n);
                key.append(&ArtKey::from(s.as_str()));
                key
            };
            prop_assert_eq!(a.cmp(&b), encode(&a).cmp(&encode(&b)));
        }
    }
}
