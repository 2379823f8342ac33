//! Per-query distance computers.
//!
//! A computer is built once per query and then compared against many database codes.
//! Fixed code sizes get computers that keep the query in registers as whole words; every
//! metric also has a `Default` computer for arbitrary sizes.

use super::ops::{self, load_u32, load_u64};
use super::tlsh::TlshDigest;

/// Distance between one query code and database codes of the same size.
pub trait BinaryComputer: Send + Sync {
    /// Distance (or match) type.
    type Output: Copy + Send + Sync;

    /// Prepare for `query`, whose first `code_size` bytes are the code.
    fn new(query: &[u8], code_size: usize) -> Self;

    /// Compare against one database code.
    fn compute(&self, code: &[u8]) -> Self::Output;
}

#[inline]
fn words<const W: usize>(code: &[u8]) -> [u64; W] {
    std::array::from_fn(|i| load_u64(&code[8 * i..]))
}

/// Hamming distance for 4-byte codes.
#[derive(Debug, Clone, Copy)]
pub struct HammingComputer4 {
    a: u32,
}

impl BinaryComputer for HammingComputer4 {
    type Output = i32;

    #[inline]
    fn new(query: &[u8], _code_size: usize) -> Self {
        Self { a: load_u32(query) }
    }

    #[inline]
    fn compute(&self, code: &[u8]) -> i32 {
        (self.a ^ load_u32(code)).count_ones() as i32
    }
}

/// Hamming distance for codes of `W` 64-bit words.
#[derive(Debug, Clone, Copy)]
pub struct HammingComputerWords<const W: usize> {
    a: [u64; W],
}

impl<const W: usize> BinaryComputer for HammingComputerWords<W> {
    type Output = i32;

    #[inline]
    fn new(query: &[u8], _code_size: usize) -> Self {
        Self { a: words(query) }
    }

    #[inline]
    fn compute(&self, code: &[u8]) -> i32 {
        let b = words::<W>(code);
        self.a
            .iter()
            .zip(&b)
            .map(|(x, y)| (x ^ y).count_ones())
            .sum::<u32>() as i32
    }
}

pub type HammingComputer8 = HammingComputerWords<1>;
pub type HammingComputer16 = HammingComputerWords<2>;
pub type HammingComputer32 = HammingComputerWords<4>;
pub type HammingComputer64 = HammingComputerWords<8>;

/// Hamming distance for 20-byte codes.
#[derive(Debug, Clone, Copy)]
pub struct HammingComputer20 {
    a0: u64,
    a1: u64,
    a2: u32,
}

impl BinaryComputer for HammingComputer20 {
    type Output = i32;

    #[inline]
    fn new(query: &[u8], _code_size: usize) -> Self {
        Self {
            a0: load_u64(query),
            a1: load_u64(&query[8..]),
            a2: load_u32(&query[16..]),
        }
    }

    #[inline]
    fn compute(&self, code: &[u8]) -> i32 {
        ((self.a0 ^ load_u64(code)).count_ones()
            + (self.a1 ^ load_u64(&code[8..])).count_ones()
            + (self.a2 ^ load_u32(&code[16..])).count_ones()) as i32
    }
}

/// Hamming distance for any code size.
#[derive(Debug, Clone)]
pub struct HammingComputerDefault {
    a: Box<[u8]>,
}

impl BinaryComputer for HammingComputerDefault {
    type Output = i32;

    fn new(query: &[u8], code_size: usize) -> Self {
        Self {
            a: query[..code_size].into(),
        }
    }

    #[inline]
    fn compute(&self, code: &[u8]) -> i32 {
        ops::xor_popcount(&self.a, &code[..self.a.len()]) as i32
    }
}

/// Jaccard distance for codes of `W` 64-bit words.
#[derive(Debug, Clone, Copy)]
pub struct JaccardComputerWords<const W: usize> {
    a: [u64; W],
}

impl<const W: usize> BinaryComputer for JaccardComputerWords<W> {
    type Output = f32;

    #[inline]
    fn new(query: &[u8], _code_size: usize) -> Self {
        Self { a: words(query) }
    }

    #[inline]
    fn compute(&self, code: &[u8]) -> f32 {
        let b = words::<W>(code);
        let (mut num, mut den) = (0u32, 0u32);
        for (x, y) in self.a.iter().zip(&b) {
            num += (x & y).count_ones();
            den += (x | y).count_ones();
        }
        if num == 0 {
            1.0
        } else {
            1.0 - num as f32 / den as f32
        }
    }
}

/// Jaccard distance for any code size.
#[derive(Debug, Clone)]
pub struct JaccardComputerDefault {
    a: Box<[u8]>,
}

impl BinaryComputer for JaccardComputerDefault {
    type Output = f32;

    fn new(query: &[u8], code_size: usize) -> Self {
        Self {
            a: query[..code_size].into(),
        }
    }

    #[inline]
    fn compute(&self, code: &[u8]) -> f32 {
        ops::jaccard_distance(&self.a, &code[..self.a.len()])
    }
}

/// Structure match for codes of `W` words: with `SUB` the query must be contained in the
/// code, otherwise the code must be contained in the query.
#[derive(Debug, Clone, Copy)]
pub struct StructureComputerWords<const W: usize, const SUB: bool> {
    a: [u64; W],
}

impl<const W: usize, const SUB: bool> BinaryComputer for StructureComputerWords<W, SUB> {
    type Output = bool;

    #[inline]
    fn new(query: &[u8], _code_size: usize) -> Self {
        Self { a: words(query) }
    }

    #[inline]
    fn compute(&self, code: &[u8]) -> bool {
        let b = words::<W>(code);
        self.a.iter().zip(&b).all(|(&x, &y)| {
            let both = x & y;
            if SUB {
                both == x
            } else {
                both == y
            }
        })
    }
}

/// Structure match for any code size.
#[derive(Debug, Clone)]
pub struct StructureComputerDefault<const SUB: bool> {
    a: Box<[u8]>,
}

impl<const SUB: bool> BinaryComputer for StructureComputerDefault<SUB> {
    type Output = bool;

    fn new(query: &[u8], code_size: usize) -> Self {
        Self {
            a: query[..code_size].into(),
        }
    }

    #[inline]
    fn compute(&self, code: &[u8]) -> bool {
        let code = &code[..self.a.len()];
        if SUB {
            ops::is_subset(&self.a, code)
        } else {
            ops::is_subset(code, &self.a)
        }
    }
}

/// TLSH digest distance; codes must be 35 bytes.
#[derive(Debug, Clone, Copy)]
pub struct TlshComputer {
    a: TlshDigest,
}

impl BinaryComputer for TlshComputer {
    type Output = f32;

    fn new(query: &[u8], _code_size: usize) -> Self {
        Self {
            a: TlshDigest::read(query),
        }
    }

    #[inline]
    fn compute(&self, code: &[u8]) -> f32 {
        self.a.diff(&TlshDigest::read(code), true) as f32
    }
}
