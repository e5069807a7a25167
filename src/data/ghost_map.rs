//! Ghost mapping: which remotely owned global indices are cached locally.

use crate::data::layout::Layout;
use crate::debug_invariants::DebugInvariants;
use crate::dist_error::DistError;
use hashbrown::HashMap;

/// Ordered `(global index, local slot)` pairs for the ghost region.
///
/// The k-th ghost lives in slot `n_owned + k`. Built once when a container is
/// set up and reused by every ghost update.
#[derive(Clone, Debug, Default)]
pub struct GhostMap {
    n_owned: usize,
    ghosts: Vec<usize>,
    slot_of: HashMap<usize, usize>,
}

impl GhostMap {
    /// Validate `ghosts` against `layout` as seen from `rank`.
    ///
    /// Fails on indices out of range, owned by `rank`, or listed twice.
    pub fn new(layout: &Layout, rank: usize, ghosts: Vec<usize>) -> Result<Self, DistError> {
        let n_owned = layout.local_size(rank);
        let mut slot_of = HashMap::with_capacity(ghosts.len());
        for (k, &g) in ghosts.iter().enumerate() {
            if layout.owner_of(g)? == rank {
                return Err(DistError::InvalidGhost {
                    index: g,
                    reason: "index is owned by this rank",
                });
            }
            if slot_of.insert(g, n_owned + k).is_some() {
                return Err(DistError::InvalidGhost {
                    index: g,
                    reason: "listed more than once",
                });
            }
        }
        let map = Self {
            n_owned,
            ghosts,
            slot_of,
        };
        map.debug_assert_invariants();
        Ok(map)
    }

    /// Local slot caching global index `g`, if it is a ghost here.
    #[inline]
    pub fn slot_of(&self, g: usize) -> Option<usize> {
        self.slot_of.get(&g).copied()
    }

    /// Ghost global indices in slot order.
    pub fn indices(&self) -> &[usize] {
        &self.ghosts
    }

    pub fn len(&self) -> usize {
        self.ghosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ghosts.is_empty()
    }

    /// `(global index, local slot)` pairs in slot order.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.ghosts
            .iter()
            .enumerate()
            .map(move |(k, &g)| (g, self.n_owned + k))
    }
}

impl DebugInvariants for GhostMap {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "GhostMap");
    }

    fn validate_invariants(&self) -> Result<(), DistError> {
        if self.slot_of.len() != self.ghosts.len() {
            return Err(DistError::InvalidLayout(format!(
                "ghost lookup holds {} entries for {} ghosts",
                self.slot_of.len(),
                self.ghosts.len()
            )));
        }
        for (g, slot) in self.pairs() {
            if self.slot_of(g) != Some(slot) {
                return Err(DistError::InvalidGhost {
                    index: g,
                    reason: "lookup disagrees with slot order",
                });
            }
        }
        Ok(())
    }
}
