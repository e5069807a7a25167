//! Combine modes: rules for merging an incoming value into a stored one.

use std::fmt::Debug;
use std::ops::{AddAssign, Mul};

/// Element type of distributed containers.
///
/// Any primitive numeric type qualifies; values travel as raw little-endian
/// bytes, so compound types are not supported.
pub trait Scalar:
    bytemuck::Pod
    + num_traits::Zero
    + AddAssign
    + Mul<Output = Self>
    + PartialEq
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<T> Scalar for T where
    T: bytemuck::Pod
        + num_traits::Zero
        + AddAssign
        + Mul<Output = T>
        + PartialEq
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// How an incoming value merges with the stored one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CombineMode {
    /// Overwrite (last write wins).
    Insert,
    /// Accumulate.
    Add,
}

impl CombineMode {
    /// Merge `incoming` into `local`.
    #[inline]
    pub fn apply<T: Scalar>(self, local: &mut T, incoming: T) {
        match self {
            CombineMode::Insert => *local = incoming,
            CombineMode::Add => *local += incoming,
        }
    }

    pub(crate) fn to_wire(mode: Option<CombineMode>) -> u16 {
        match mode {
            None => 0,
            Some(CombineMode::Insert) => 1,
            Some(CombineMode::Add) => 2,
        }
    }

    pub(crate) fn from_wire(raw: u16) -> Result<Option<CombineMode>, String> {
        match raw {
            0 => Ok(None),
            1 => Ok(Some(CombineMode::Insert)),
            2 => Ok(Some(CombineMode::Add)),
            other => Err(format!("unknown combine mode tag {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_overwrites_add_accumulates() {
        let mut v = 2.0f64;
        CombineMode::Add.apply(&mut v, 3.0);
        assert_eq!(v, 5.0);
        CombineMode::Insert.apply(&mut v, -1.0);
        assert_eq!(v, -1.0);
    }

    #[test]
    fn wire_tags_roundtrip() {
        for m in [None, Some(CombineMode::Insert), Some(CombineMode::Add)] {
            assert_eq!(CombineMode::from_wire(CombineMode::to_wire(m)).unwrap(), m);
        }
        assert!(CombineMode::from_wire(9).is_err());
    }
}
