//! Commit batch planning.
//!
//! Operations arrive in stable dependency order. Each is placed in the
//! earliest batch that (a) comes after every batch holding an operation it
//! depends on or overlaps, (b) targets the same resource, and (c) has room.
//! Overlapping operations therefore keep their relative order, while
//! independent ones may move forward to share a dispatch.

use sheetflow_types::operation::Operation;

/// Group `operations` (already in commit order) into dispatch batches.
///
/// Returns indices into `operations`; within a batch, indices are ascending.
pub fn plan_batches(operations: &[Operation], max_batch_size: usize) -> Vec<Vec<usize>> {
    let max_batch_size = max_batch_size.max(1);
    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut batch_of: Vec<usize> = Vec::with_capacity(operations.len());

    for (i, op) in operations.iter().enumerate() {
        let min_batch = operations[..i]
            .iter()
            .enumerate()
            .filter(|(_, earlier)| {
                earlier.target.overlaps(&op.target) || op.depends_on.contains(&earlier.id)
            })
            .map(|(j, _)| batch_of[j] + 1)
            .max()
            .unwrap_or(0);

        let slot = (min_batch..batches.len()).find(|&b| {
            let batch = &batches[b];
            batch.len() < max_batch_size
                && operations[batch[0]].target.resource_id == op.target.resource_id
        });

        let b = match slot {
            Some(b) => {
                batches[b].push(i);
                b
            }
            None => {
                batches.push(vec![i]);
                batches.len() - 1
            }
        };
        batch_of.push(b);
    }

    batches
}

/// One operation per dispatch, in commit order.
pub fn sequential_batches(operations: &[Operation]) -> Vec<Vec<usize>> {
    (0..operations.len()).map(|i| vec![i]).collect()
}
