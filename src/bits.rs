//! Bit algebra over store bitmaps
//!
//! Bitmaps are plain byte strings as stored by a Redis-compatible store.
//! Bit `n` lives in byte `n / 8` at mask `0x80 >> (n % 8)`, i.e. bit 0 is the
//! most significant bit of byte 0 (SETBIT/GETBIT addressing).
//!
//! # Alignment
//!
//! Operands of different lengths are combined as if the shorter ones were
//! zero-extended to the longest length:
//!
//! - AND beyond the shortest operand is always 0
//! - OR and XOR beyond it pass the longer operand's bits through
//! - NOT flips exactly the operand's own bytes and never grows it
//!
//! # Example
//!
//! ```rust
//! use kuba_cohort::bits::Bitmap;
//!
//! let a = Bitmap::from_bits([1, 12]).unwrap();
//! let b = Bitmap::from_bits([12, 77]).unwrap();
//!
//! assert_eq!(a.and(&b).set_bits().collect::<Vec<_>>(), vec![12]);
//! assert_eq!(a.or(&b).population_count(), 3);
//! ```

use crate::error::{Error, Result};
use crate::types::{EntityId, MAX_ENTITY_ID};
use bytes::Bytes;
use std::fmt;

/// Boolean operation applied across bitmaps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitOp {
    /// Intersection
    And,
    /// Union
    Or,
    /// Symmetric difference
    Xor,
    /// Complement (single operand)
    Not,
}

impl BitOp {
    /// Store command keyword
    pub fn as_str(&self) -> &'static str {
        match self {
            BitOp::And => "AND",
            BitOp::Or => "OR",
            BitOp::Xor => "XOR",
            BitOp::Not => "NOT",
        }
    }
}

impl fmt::Display for BitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte index and mask of bit `offset`
#[inline]
fn locate(offset: EntityId) -> (usize, u8) {
    ((offset / 8) as usize, 0x80u8 >> (offset % 8))
}

/// Combine `sources` byte-wise with `op`
///
/// Result length is the longest source length; an empty source list yields
/// an empty result.
fn fold(sources: &[&[u8]], op: impl Fn(u8, u8) -> u8) -> Vec<u8> {
    let len = sources.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut iter = sources.iter();
    let mut result = match iter.next() {
        Some(first) => {
            let mut out = first.to_vec();
            out.resize(len, 0);
            out
        },
        None => return Vec::new(),
    };

    for source in iter {
        for (i, byte) in result.iter_mut().enumerate() {
            let other = source.get(i).copied().unwrap_or(0);
            *byte = op(*byte, other);
        }
    }
    result
}

/// Bitwise AND of all sources
pub fn bit_and(sources: &[&[u8]]) -> Vec<u8> {
    fold(sources, |a, b| a & b)
}

/// Bitwise OR of all sources
pub fn bit_or(sources: &[&[u8]]) -> Vec<u8> {
    fold(sources, |a, b| a | b)
}

/// Bitwise XOR of all sources
pub fn bit_xor(sources: &[&[u8]]) -> Vec<u8> {
    fold(sources, |a, b| a ^ b)
}

/// Bitwise complement of `source`, same length
pub fn bit_not(source: &[u8]) -> Vec<u8> {
    source.iter().map(|b| !b).collect()
}

/// Apply `op` to `sources`
///
/// `BitOp::Not` complements the first source only; callers that need the
/// store's strict single-operand rule check it themselves.
pub fn apply(op: BitOp, sources: &[&[u8]]) -> Vec<u8> {
    match op {
        BitOp::And => bit_and(sources),
        BitOp::Or => bit_or(sources),
        BitOp::Xor => bit_xor(sources),
        BitOp::Not => sources.first().map(|s| bit_not(s)).unwrap_or_default(),
    }
}

/// Number of set bits between byte indexes `start` and `end` (inclusive)
///
/// Negative indexes count from the end, `-1` being the last byte, matching
/// the store's BITCOUNT range semantics.
pub fn population_count(bytes: &[u8], start: i64, end: i64) -> u64 {
    let len = bytes.len() as i64;
    if len == 0 {
        return 0;
    }

    let normalize = |index: i64| if index < 0 { (len + index).max(0) } else { index };
    let start = normalize(start);
    let end = normalize(end).min(len - 1);
    if start > end {
        return 0;
    }

    bytes[start as usize..=end as usize]
        .iter()
        .map(|b| b.count_ones() as u64)
        .sum()
}

/// Value of bit `offset`; bits past the end read as 0
pub fn get_bit(bytes: &[u8], offset: EntityId) -> bool {
    let (index, mask) = locate(offset);
    bytes.get(index).is_some_and(|b| b & mask != 0)
}

/// Set bit `offset` to `value`, growing `bytes` with zeros as needed
///
/// Returns the previous value of the bit. Offsets above [`MAX_ENTITY_ID`]
/// are rejected before anything is allocated.
pub fn set_bit(bytes: &mut Vec<u8>, offset: EntityId, value: bool) -> Result<bool> {
    if offset > MAX_ENTITY_ID {
        return Err(Error::EntityOutOfRange(offset));
    }
    let (index, mask) = locate(offset);
    if index >= bytes.len() {
        bytes.resize(index + 1, 0);
    }
    let previous = bytes[index] & mask != 0;
    if value {
        bytes[index] |= mask;
    } else {
        bytes[index] &= !mask;
    }
    Ok(previous)
}

// ============================================================================
// Bitmap value
// ============================================================================

/// An immutable bitmap fetched from, or destined for, the store
///
/// Cloning is cheap: the bytes are reference counted.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Bitmap {
    bytes: Bytes,
}

impl Bitmap {
    /// Empty bitmap (all bits 0)
    pub fn new() -> Self {
        Self::default()
    }

    /// Bitmap with the given ids set
    ///
    /// Fails with [`Error::EntityOutOfRange`] if any id is above
    /// [`MAX_ENTITY_ID`].
    pub fn from_bits<I: IntoIterator<Item = EntityId>>(ids: I) -> Result<Self> {
        let mut bytes = Vec::new();
        for id in ids {
            set_bit(&mut bytes, id, true)?;
        }
        Ok(Self::from(bytes))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Allocated length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if no bytes are allocated
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Value of bit `offset`
    pub fn contains(&self, offset: EntityId) -> bool {
        get_bit(&self.bytes, offset)
    }

    /// Number of set bits
    pub fn population_count(&self) -> u64 {
        population_count(&self.bytes, 0, -1)
    }

    /// Intersection
    pub fn and(&self, other: &Bitmap) -> Bitmap {
        bit_and(&[self.as_bytes(), other.as_bytes()]).into()
    }

    /// Union
    pub fn or(&self, other: &Bitmap) -> Bitmap {
        bit_or(&[self.as_bytes(), other.as_bytes()]).into()
    }

    /// Symmetric difference
    pub fn xor(&self, other: &Bitmap) -> Bitmap {
        bit_xor(&[self.as_bytes(), other.as_bytes()]).into()
    }

    /// Complement over the allocated length
    #[allow(clippy::should_implement_trait)]
    pub fn not(&self) -> Bitmap {
        bit_not(&self.bytes).into()
    }

    /// Combine many bitmaps with `op`
    pub fn combine<'a, I>(op: BitOp, bitmaps: I) -> Bitmap
    where
        I: IntoIterator<Item = &'a Bitmap>,
    {
        let sources: Vec<&[u8]> = bitmaps.into_iter().map(|b| b.as_bytes()).collect();
        apply(op, &sources).into()
    }

    /// Ascending iterator over set bit positions
    ///
    /// Each call starts a fresh pass over the same bytes.
    pub fn set_bits(&self) -> SetBits {
        SetBits::new(self.bytes.clone())
    }
}

impl From<Vec<u8>> for Bitmap {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Bytes::from(bytes),
        }
    }
}

impl From<Bytes> for Bitmap {
    fn from(bytes: Bytes) -> Self {
        Self { bytes }
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("len", &self.bytes.len())
            .field("population", &self.population_count())
            .finish()
    }
}

impl IntoIterator for &Bitmap {
    type Item = EntityId;
    type IntoIter = SetBits;

    fn into_iter(self) -> SetBits {
        self.set_bits()
    }
}

/// Iterator over set bit positions of a byte buffer
///
/// Scans byte by byte, most significant bit first, skipping zero bytes.
#[derive(Debug, Clone)]
pub struct SetBits {
    bytes: Bytes,
    byte_idx: usize,
    /// Remaining unvisited bits of the current byte
    pending: u8,
}

impl SetBits {
    /// Start a pass over `bytes`
    pub fn new(bytes: Bytes) -> Self {
        let pending = bytes.first().copied().unwrap_or(0);
        Self {
            bytes,
            byte_idx: 0,
            pending,
        }
    }

    /// Restart from the first bit
    pub fn restart(&mut self) {
        self.byte_idx = 0;
        self.pending = self.bytes.first().copied().unwrap_or(0);
    }
}

impl Iterator for SetBits {
    type Item = EntityId;

    fn next(&mut self) -> Option<Self::Item> {
        while self.byte_idx < self.bytes.len() {
            if self.pending != 0 {
                let bit = self.pending.leading_zeros() as usize;
                self.pending &= !(0x80u8 >> bit);
                return Some((self.byte_idx * 8 + bit) as EntityId);
            }

            self.byte_idx += 1;
            self.pending = self.bytes.get(self.byte_idx).copied().unwrap_or(0);
        }
        None
    }
}
