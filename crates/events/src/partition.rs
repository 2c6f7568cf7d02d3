//! Key to partition mapping.

/// Partition for `key` on a channel with `partitions` partitions.
///
/// FNV-1a over the key bytes: stable across processes and builds, so every
/// publisher of a deployment agrees on where a job's messages go.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    if partitions <= 1 {
        return 0;
    }

    let hash = key
        .as_bytes()
        .iter()
        .fold(OFFSET_BASIS, |h, b| (h ^ u32::from(*b)).wrapping_mul(PRIME));
    hash % partitions
}
