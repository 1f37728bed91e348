//! Keyed byte substitution applied to enciphered flash regions.
//!
//! Each key is four bytes, applied cyclically over the data. Bytes that
//! would collide with erased flash (`0xFF`), terminators (`0x00`) or the
//! key itself are passed through, which makes the transform its own inverse.

use core::convert::TryFrom;
use core::fmt;

/// Number of entries in the key table
pub const KEY_COUNT: usize = 20;

/// Key byte that disables substitution at its position
pub const KEY_SKIP: u8 = 0x20;

const KEYS: [[u8; 4]; KEY_COUNT] = [
    *b"BHT ", *b"CO 7", *b"A ES", *b" EIY", *b"M PQ",
    *b"XN Y", *b"RVB ", *b" HQP", *b"W RC", *b"MS N",
    *b" SAT", *b"K DH", *b"ZO R", *b"C SL", *b"6RB ",
    *b" JCG", *b"PN V", *b"J PK", *b"EK L", *b"I LZ",
];

/// Range-checked index into the key table
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct KeyIndex(u8);

impl KeyIndex {
    /// Create a key index, returning `None` if outside `0..KEY_COUNT`
    pub fn new(index: u8) -> Option<Self> {
        if (index as usize) < KEY_COUNT {
            Some(Self(index))
        } else {
            None
        }
    }

    /// Convert a signed index where any negative value means "no cipher".
    ///
    /// Panics on indices past the end of the key table.
    pub fn from_raw(index: i32) -> Option<Self> {
        if index < 0 {
            return None;
        }

        assert!(
            (index as usize) < KEY_COUNT,
            "key index {} outside of 0..{}",
            index,
            KEY_COUNT
        );

        Some(Self(index as u8))
    }

    /// Iterate over every key in the table
    pub fn all() -> impl Iterator<Item = KeyIndex> {
        (0..KEY_COUNT as u8).map(KeyIndex)
    }

    pub fn index(&self) -> u8 {
        self.0
    }

    /// Fetch the key bytes for this index
    pub fn key(&self) -> &'static [u8; 4] {
        &KEYS[self.0 as usize]
    }
}

impl TryFrom<u8> for KeyIndex {
    type Error = u8;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        Self::new(index).ok_or(index)
    }
}

impl fmt::Display for KeyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encipher or decipher `data` with the selected key.
///
/// The same call is used in both directions.
pub fn crypt(data: &[u8], key: KeyIndex) -> Vec<u8> {
    let key = key.key();

    data.iter()
        .zip(key.iter().cycle())
        .map(|(&b, &k)| substitute(b, k))
        .collect()
}

fn substitute(b: u8, k: u8) -> u8 {
    if k == KEY_SKIP || b == 0x00 || b == 0xFF || k == b || k ^ b == 0xFF {
        b
    } else {
        b ^ k
    }
}
