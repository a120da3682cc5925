//! A fixed-length bit vector where every bit is either `0`, `1`, or unknown.
//!
//! Bit zero is the LAST bit scanned into a scan chain, so bit and character indices match the
//! position of the corresponding element along the chain's scan-in path, and strings read left to
//! right in the order elements appear in schematics.  Unknown bits print as `X`.
//!
//! Single-bit accessors panic on an out-of-range index, the way slice indexing does.  Bulk copies
//! between vectors return `Err` instead, since their offsets are usually computed from chain
//! lengths at run time.
use alloc::format;
use alloc::string::String;
use core::fmt;
use core::ops::Range;
use core::str::FromStr;

use bitvec::prelude::*;

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct BitVector {
    name: String,
    // Invalid bits are always stored as 0 here so whole-vector comparisons stay cheap.
    bits: BitVec,
    valid: BitVec,
}

impl BitVector {
    /// Create a vector of `len` bits, all unknown.
    pub fn new(len: usize, name: &str) -> Self {
        Self {
            name: String::from(name),
            bits: BitVec::repeat(false, len),
            valid: BitVec::repeat(false, len),
        }
    }

    /// Create a vector of `len` bits, all valid and cleared.
    pub fn zeros(len: usize, name: &str) -> Self {
        Self {
            name: String::from(name),
            bits: BitVec::repeat(false, len),
            valid: BitVec::repeat(true, len),
        }
    }

    /// Parse a string of `0`, `1` and `X` (or `-`) characters.
    pub fn from_str_named(state: &str, name: &str) -> Result<Self> {
        let mut v = Self::new(state.chars().count(), name);
        v.put_str(0, state)?;
        Ok(v)
    }

    /// Right-justified, big-endian integer view: bit `len-1` receives the LSB of `value`.
    pub fn from_u64(len: usize, mut value: u64, name: &str) -> Self {
        let mut v = Self::zeros(len, name);
        for ind in (0..len).rev() {
            v.bits.set(ind, value & 1 == 1);
            value >>= 1;
        }
        v
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = String::from(name);
    }

    fn check_index(&self, index: usize) {
        assert!(
            index < self.len(),
            "bit index {} outside allowed range 0..{} in bit vector '{}'",
            index,
            self.len(),
            self.name
        );
    }

    fn check_range(&self, from: usize, nbits: usize) -> Result<()> {
        if from + nbits > self.len() {
            return Err(Error::IndexOutOfRange {
                name: self.name.clone(),
                index: from + nbits - 1,
                len: self.len(),
            });
        }
        Ok(())
    }

    /// Read a bit.
    ///
    /// # Panics
    /// If `index` is out of range or the bit is unknown.
    pub fn get(&self, index: usize) -> bool {
        match self.try_get(index) {
            Ok(v) => v,
            Err(e) => panic!("{}", e),
        }
    }

    /// Read a bit, returning an error for an out-of-range index or an unknown bit.
    pub fn try_get(&self, index: usize) -> Result<bool> {
        if index >= self.len() {
            return Err(Error::IndexOutOfRange {
                name: self.name.clone(),
                index,
                len: self.len(),
            });
        }
        if !self.valid[index] {
            return Err(Error::InvalidBit {
                name: self.name.clone(),
                index,
                state: self.state(),
            });
        }
        Ok(self.bits[index])
    }

    /// The bit's value, or `None` if it is unknown.
    pub fn value(&self, index: usize) -> Option<bool> {
        self.check_index(index);
        if self.valid[index] {
            Some(self.bits[index])
        } else {
            None
        }
    }

    pub fn is_valid(&self, index: usize) -> bool {
        self.check_index(index);
        self.valid[index]
    }

    pub fn set(&mut self, index: usize, value: bool) {
        self.check_index(index);
        self.bits.set(index, value);
        self.valid.set(index, true);
    }

    pub fn clear(&mut self, index: usize) {
        self.set(index, false);
    }

    /// Mark a bit as unknown.
    pub fn invalidate(&mut self, index: usize) {
        self.check_index(index);
        self.bits.set(index, false);
        self.valid.set(index, false);
    }

    pub fn invalidate_all(&mut self) {
        self.bits.fill(false);
        self.valid.fill(false);
    }

    /// Set every bit in `range` to `value`.
    pub fn set_range(&mut self, range: Range<usize>, value: bool) {
        assert!(
            range.start <= range.end && range.end <= self.len(),
            "range {:?} outside bit vector '{}' of length {}",
            range,
            self.name,
            self.len()
        );
        self.bits[range.clone()].fill(value);
        self.valid[range].fill(true);
    }

    pub fn flip(&mut self, index: usize) {
        self.flip_range(index..index + 1);
    }

    /// Invert every known bit in `range`.  Unknown bits stay unknown.
    pub fn flip_range(&mut self, range: Range<usize>) {
        assert!(
            range.start <= range.end && range.end <= self.len(),
            "range {:?} outside bit vector '{}' of length {}",
            range,
            self.name,
            self.len()
        );
        for ind in range {
            if self.valid[ind] {
                let v = self.bits[ind];
                self.bits.set(ind, !v);
            }
        }
    }

    /// Copy the values of `source` to `offset..`.  Every bit of `source` must be known.
    pub fn put(&mut self, offset: usize, source: &BitVector) -> Result<()> {
        self.check_range(offset, source.len())?;
        if let Some(ind) = source.valid.first_zero() {
            return Err(Error::InvalidBit {
                name: source.name.clone(),
                index: ind,
                state: source.state(),
            });
        }
        self.put_indiscriminate(offset, source)
    }

    /// Copy both values and validity of `source` to `offset..`.
    pub fn put_indiscriminate(&mut self, offset: usize, source: &BitVector) -> Result<()> {
        self.check_range(offset, source.len())?;
        let end = offset + source.len();
        self.bits[offset..end].copy_from_bitslice(&source.bits);
        self.valid[offset..end].copy_from_bitslice(&source.valid);
        Ok(())
    }

    /// Write a `0`/`1`/`X` string starting at `offset`.
    pub fn put_str(&mut self, offset: usize, state: &str) -> Result<()> {
        self.check_range(offset, state.chars().count())?;
        for (ind, ch) in state.chars().enumerate() {
            match ch {
                '0' => self.clear(offset + ind),
                '1' => self.set(offset + ind, true),
                'X' | 'x' | '-' => self.invalidate(offset + ind),
                other => return Err(Error::BadBitChar(other)),
            }
        }
        Ok(())
    }

    /// Copy of bits `from..from+nbits`, validity included.
    pub fn slice(&self, from: usize, nbits: usize) -> Result<BitVector> {
        self.check_range(from, nbits)?;
        Ok(BitVector {
            name: format!("bits [{}:{}] of {}", from, (from + nbits).saturating_sub(1), self.name),
            bits: self.bits[from..from + nbits].to_bitvec(),
            valid: self.valid[from..from + nbits].to_bitvec(),
        })
    }

    /// Serialize as a string of `0`, `1` and `X`.
    pub fn state(&self) -> String {
        self.bits
            .iter()
            .by_vals()
            .zip(self.valid.iter().by_vals())
            .map(|(b, v)| match (v, b) {
                (false, _) => 'X',
                (true, true) => '1',
                (true, false) => '0',
            })
            .collect()
    }

    /// Whether every bit is unknown.
    pub fn is_invalid(&self) -> bool {
        self.valid.not_any()
    }

    pub fn is_fully_valid(&self) -> bool {
        self.valid.all()
    }

    fn require_valid(&self) -> Result<()> {
        match self.valid.first_zero() {
            Some(index) => Err(Error::InvalidBit {
                name: self.name.clone(),
                index,
                state: self.state(),
            }),
            None => Ok(()),
        }
    }

    /// Number of set bits.  Only defined on a fully-known vector.
    pub fn cardinality(&self) -> Result<usize> {
        self.require_valid()?;
        Ok(self.bits.count_ones())
    }

    /// Whether every bit is `0`.  Only defined on a fully-known vector.
    pub fn is_zero(&self) -> Result<bool> {
        self.require_valid()?;
        Ok(self.bits.not_any())
    }

    /// Big-endian integer value, truncating high-order bits beyond 64.
    pub fn to_u64(&self) -> Result<u64> {
        self.require_valid()?;
        Ok(self
            .bits
            .iter()
            .by_vals()
            .fold(0u64, |acc, b| (acc << 1) | b as u64))
    }

    /// Complement of every known bit.
    pub fn not(&self) -> BitVector {
        let mut r = self.clone();
        r.flip_range(0..r.len());
        r
    }

    /// Concatenation, with `other` on the right.
    pub fn cat(&self, other: &BitVector) -> BitVector {
        let mut bits = self.bits.clone();
        bits.extend_from_bitslice(&other.bits);
        let mut valid = self.valid.clone();
        valid.extend_from_bitslice(&other.valid);
        BitVector {
            name: String::from("cat"),
            bits,
            valid,
        }
    }

    pub fn bit_reverse(&self) -> BitVector {
        let mut r = self.clone();
        r.bits.reverse();
        r.valid.reverse();
        r
    }
}

impl PartialEq for BitVector {
    fn eq(&self, other: &Self) -> bool {
        self.valid == other.valid && self.bits == other.bits
    }
}

impl Eq for BitVector {}

impl FromStr for BitVector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BitVector::from_str_named(s, "unnamed")
    }
}

impl fmt::Display for BitVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.state())
    }
}
