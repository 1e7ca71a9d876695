//! Pure change-detection policy for one update cycle. Nothing here touches
//! the chain or the store.

use registry_database::models::{Meta, Operator};
use serde::{Deserialize, Serialize};

/// Which slice of each operator's key set this deployment mirrors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorKind {
    /// Mirror every key the operator advertises.
    Key,
    /// Mirror used keys only.
    Validator,
}

/// Cheap fast path: the registry counter and the pinned block are both
/// unchanged, so no operator or key traffic is needed.
pub fn meta_unchanged(prev: Option<&Meta>, curr: &Meta) -> bool {
    prev.map_or(false, |prev| {
        prev.keys_op_index == curr.keys_op_index && prev.block_hash == curr.block_hash
    })
}

/// Field-wise equality of all operator columns. A missing previous operator
/// counts as changed.
pub fn operator_unchanged(prev: Option<&Operator>, curr: &Operator) -> bool {
    prev.map_or(false, |prev| prev == curr)
}

/// Right bound (exclusive) of the key range to refetch for `curr`.
pub fn to_index(kind: MirrorKind, curr: &Operator) -> u64 {
    match kind {
        MirrorKind::Key => curr.total_signing_keys,
        MirrorKind::Validator => curr.used_signing_keys,
    }
}

/// Left bound (inclusive) of the key range to refetch.
///
/// Keys below `used_signing_keys` are immutable on chain, so when the only
/// change since the last cycle is appended keys the immutable prefix can be
/// skipped. Any other change forces a full refetch from 0, as does a prefix
/// that would start past `to` (a testnet contract may delete used keys).
pub fn from_index(prev: Option<&Operator>, curr: &Operator, to: u64) -> u64 {
    let Some(prev) = prev else { return 0 };
    if prev.total_signing_keys > curr.total_signing_keys {
        return 0;
    }
    // A key append moves total_signing_keys without touching the immutable
    // prefix, so align the total before the field-wise compare.
    let aligned = Operator {
        total_signing_keys: curr.total_signing_keys,
        ..prev.clone()
    };
    if !operator_unchanged(Some(&aligned), curr) {
        return 0;
    }
    let from = prev.used_signing_keys;
    if from > to {
        0
    } else {
        from
    }
}
