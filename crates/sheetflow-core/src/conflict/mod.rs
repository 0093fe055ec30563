//! Optimistic-concurrency conflict detection and resolution.
//!
//! - `version_cache` -- non-evicting version ledger plus the bounded record cache
//! - `merge` -- cell diffing and three-way merge of base/theirs/ours grids
//! - `detector` -- `ConflictDetector`: check, detect, resolve, record mutations

pub mod detector;
pub mod merge;
pub mod version_cache;

pub use detector::{ConflictDetector, PendingWrite, Resolution, ResolutionInput};

use sha2::{Digest, Sha256};
use sheetflow_types::error::StoreError;
use sheetflow_types::range::Grid;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("failed to read range '{key}': {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },
}

/// SHA-256 over the canonical JSON of a grid, hex encoded.
///
/// `serde_json` writes object keys in sorted order (no `preserve_order`), so
/// equal grids always hash equally.
pub fn checksum(grid: &Grid) -> String {
    let canonical = serde_json::to_string(grid).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checksum_is_stable_and_content_sensitive() {
        let a: Grid = vec![vec![json!(1), json!("x")]];
        let b: Grid = vec![vec![json!(1), json!("x")]];
        let c: Grid = vec![vec![json!(1), json!("y")]];
        assert_eq!(checksum(&a), checksum(&b));
        assert_ne!(checksum(&a), checksum(&c));
        assert_eq!(checksum(&a).len(), 64);
    }
}
