//! Index sets naming the entries that take part in a scatter.

use itertools::Either;
use serde::{Deserialize, Serialize};

/// An ordered list of indices, stored compactly when it has structure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexSet {
    /// Arbitrary indices.
    General(Vec<usize>),
    /// `first, first + step, ..., first + (len - 1) * step`.
    Stride {
        first: usize,
        step: usize,
        len: usize,
    },
    /// Each block index `b` expands to `b * block_size .. (b + 1) * block_size`.
    Block {
        block_size: usize,
        blocks: Vec<usize>,
    },
}

impl IndexSet {
    pub fn general(indices: Vec<usize>) -> Self {
        IndexSet::General(indices)
    }

    pub fn stride(first: usize, step: usize, len: usize) -> Self {
        IndexSet::Stride { first, step, len }
    }

    /// `0..len`.
    pub fn identity(len: usize) -> Self {
        IndexSet::stride(0, 1, len)
    }

    pub fn block(block_size: usize, blocks: Vec<usize>) -> Self {
        IndexSet::Block { block_size, blocks }
    }

    /// Number of indices after expansion.
    pub fn len(&self) -> usize {
        match self {
            IndexSet::General(v) => v.len(),
            IndexSet::Stride { len, .. } => *len,
            IndexSet::Block { block_size, blocks } => block_size * blocks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expanded indices in order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        match self {
            IndexSet::General(v) => Either::Left(v.iter().copied()),
            IndexSet::Stride { first, step, len } => {
                let (first, step) = (*first, *step);
                Either::Right(Either::Left((0..*len).map(move |i| first + i * step)))
            }
            IndexSet::Block { block_size, blocks } => {
                let bs = *block_size;
                Either::Right(Either::Right(
                    blocks.iter().flat_map(move |&b| b * bs..(b + 1) * bs),
                ))
            }
        }
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }
}

impl From<Vec<usize>> for IndexSet {
    fn from(v: Vec<usize>) -> Self {
        IndexSet::General(v)
    }
}
