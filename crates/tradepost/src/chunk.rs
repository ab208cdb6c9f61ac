//! Chunk bucketing for observations.

use crate::types::ChunkKey;
use std::collections::BTreeMap;

/// Group `items` by the chunk `chunk_of` assigns them.
///
/// `seed` always gets a bucket, even an empty one, so a scan that reports
/// nothing still prunes its own chunk. Items keep their input order inside
/// a bucket; buckets iterate in key order.
pub fn group_by_chunk<T, I, F>(seed: Option<ChunkKey>, items: I, chunk_of: F) -> BTreeMap<ChunkKey, Vec<T>>
where
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> ChunkKey,
{
    let mut buckets: BTreeMap<ChunkKey, Vec<T>> = BTreeMap::new();
    if let Some(key) = seed {
        buckets.entry(key).or_default();
    }
    for item in items {
        buckets.entry(chunk_of(&item)).or_default().push(item);
    }
    buckets
}
