//! Configuration for containers and their assembly.

use serde::{Deserialize, Serialize};

/// Knobs for the insertion buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyOptions {
    /// Drop entries destined for other ranks instead of stashing them.
    pub ignore_off_process_entries: bool,
    /// Skip zero values inserted in ADD mode (matrices only).
    pub ignore_zero_entries: bool,
}

/// Options for [`crate::vec::DistVec`] construction through the registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VecOptions {
    /// Global indices to cache as ghosts (used by the `"ghosted"` type).
    pub ghosts: Vec<usize>,
    pub assembly: AssemblyOptions,
}

/// Options for [`crate::mat::DistMatrix`] construction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatOptions {
    pub assembly: AssemblyOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let v: VecOptions = serde_json::from_str(r#"{"ghosts":[3,4]}"#).unwrap();
        assert_eq!(v.ghosts, vec![3, 4]);
        assert_eq!(v.assembly, AssemblyOptions::default());

        let m: MatOptions =
            serde_json::from_str(r#"{"assembly":{"ignore_zero_entries":true}}"#).unwrap();
        assert!(m.assembly.ignore_zero_entries);
        assert!(!m.assembly.ignore_off_process_entries);
    }
}
