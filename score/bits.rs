// ========================================================================================
//
//                        Bit-sets: the currency of the comparer
//
// ========================================================================================
//
// Every profile is reduced to two bit-sets keyed by interned tokens. Once that is done
// a distance is nothing more than two popcounts over block-wise ANDs. This module owns
// both representations: a growable dense array of `u64` blocks, and a frozen sparse
// list of the non-zero blocks only. The two must always agree on intersection counts.

const BLOCK_BITS: u64 = 64;

/// A growable dense bit-set. Bit `i` lives in block `i / 64` at offset `i % 64`.
///
/// Invariant: `blocks.len() * 64 > max_set_bit` at all times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitArray {
    blocks: Vec<u64>,
}

impl BitArray {
    /// Creates a zeroed bit-set with room for bits `0..=max_bit` without growing.
    pub fn new(max_bit: u64) -> Self {
        let n_blocks = (max_bit / BLOCK_BITS) as usize + 1;
        Self {
            blocks: vec![0; n_blocks],
        }
    }

    /// Sets bit `i`, growing the backing array to exactly the block that holds it.
    #[inline]
    pub fn set_bit(&mut self, i: u64) {
        let block = (i / BLOCK_BITS) as usize;
        let bit = i % BLOCK_BITS;
        if block >= self.blocks.len() {
            self.blocks.resize(block + 1, 0);
        }
        self.blocks[block] |= 1u64 << bit;
    }

    #[inline]
    pub fn get_bit(&self, i: u64) -> bool {
        let block = (i / BLOCK_BITS) as usize;
        self.blocks
            .get(block)
            .is_some_and(|value| value & (1u64 << (i % BLOCK_BITS)) != 0)
    }

    #[inline]
    pub fn blocks(&self) -> &[u64] {
        &self.blocks
    }

    #[inline]
    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn count_ones(&self) -> u32 {
        self.blocks.iter().map(|block| block.count_ones()).sum()
    }

    pub fn non_zero_blocks(&self) -> usize {
        self.blocks.iter().filter(|&&block| block != 0).count()
    }

    /// Produces the read-only sparse form, keeping only the non-zero blocks.
    pub fn freeze(&self) -> FrozenBitArray {
        let blocks = self
            .blocks
            .iter()
            .enumerate()
            .filter(|&(_, &block)| block != 0)
            .map(|(idx, &block)| (idx, block))
            .collect();
        FrozenBitArray { blocks }
    }
}

/// A frozen sparse bit-set: `(block_index, block_value)` pairs in increasing index
/// order, with every `block_value != 0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrozenBitArray {
    blocks: Vec<(usize, u64)>,
}

impl FrozenBitArray {
    #[inline]
    pub fn blocks(&self) -> &[(usize, u64)] {
        &self.blocks
    }

    pub fn count_ones(&self) -> u32 {
        self.blocks.iter().map(|&(_, block)| block.count_ones()).sum()
    }
}

/// Counts the bits set in both dense arrays.
pub fn compare_bits(a: &BitArray, b: &BitArray) -> u32 {
    let mut count = 0;
    for (&left, &right) in a.blocks.iter().zip(b.blocks.iter()) {
        if left == 0 || right == 0 {
            continue;
        }
        count += (left & right).count_ones();
    }
    count
}

/// Counts the bits set in both frozen arrays with a merge walk over block indices.
pub fn compare_frozen_bits(a: &FrozenBitArray, b: &FrozenBitArray) -> u32 {
    let (left, right) = (&a.blocks, &b.blocks);
    let (mut i, mut j) = (0, 0);
    let mut count = 0;
    while i < left.len() && j < right.len() {
        let (left_idx, left_block) = left[i];
        let (right_idx, right_block) = right[j];
        if left_idx < right_idx {
            i += 1;
        } else if left_idx > right_idx {
            j += 1;
        } else {
            count += (left_block & right_block).count_ones();
            i += 1;
            j += 1;
        }
    }
    count
}

/// Counts the bits set in both a dense and a frozen array.
pub fn compare_mixed_bits(dense: &BitArray, frozen: &FrozenBitArray) -> u32 {
    let mut count = 0;
    for &(idx, block) in &frozen.blocks {
        match dense.blocks.get(idx) {
            Some(&other) => count += (other & block).count_ones(),
            None => break,
        }
    }
    count
}

/// Either representation of a profile's bit-set, as stored in a frozen index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitSet {
    Dense(BitArray),
    Sparse(FrozenBitArray),
}

impl BitSet {
    /// Number of bits set in both `self` and `other`, whatever their representations.
    #[inline]
    pub fn intersection_count(&self, other: &BitSet) -> u32 {
        match (self, other) {
            (Self::Dense(a), Self::Dense(b)) => compare_bits(a, b),
            (Self::Sparse(a), Self::Sparse(b)) => compare_frozen_bits(a, b),
            (Self::Dense(a), Self::Sparse(b)) | (Self::Sparse(b), Self::Dense(a)) => {
                compare_mixed_bits(a, b)
            }
        }
    }

    pub fn count_ones(&self) -> u32 {
        match self {
            Self::Dense(bits) => bits.count_ones(),
            Self::Sparse(bits) => bits.count_ones(),
        }
    }
}
