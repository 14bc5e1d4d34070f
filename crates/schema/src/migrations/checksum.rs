//! Content digests used for drift detection.
//!
//! Only the up source is hashed: editing a down file changes how a migration
//! is reverted, not the schema state it already produced.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

use super::definitions::{LedgerEntry, Migration, Version};
use crate::error::ChecksumMismatch;

/// Lowercase hex SHA-256 of `sql`
pub fn compute(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `migration` still hashes to `stored`
pub fn verify(migration: &Migration, stored: &str) -> bool {
    migration
        .checksum()
        .map(|computed| computed.eq_ignore_ascii_case(stored.trim()))
        .unwrap_or(false)
}

/// Compare every ledger entry that has an up source on disk, collecting all
/// mismatches rather than stopping at the first.
pub fn find_mismatches<'a, I>(
    entries: I,
    migrations: &HashMap<Version, &Migration>,
) -> Vec<ChecksumMismatch>
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    entries
        .into_iter()
        .filter_map(|entry| {
            let migration = migrations.get(&entry.version)?;
            let computed = migration.checksum()?;
            if verify(migration, &entry.checksum) {
                None
            } else {
                Some(ChecksumMismatch {
                    version: entry.version,
                    name: entry.name.clone(),
                    stored: entry.checksum.clone(),
                    computed: computed.to_string(),
                })
            }
        })
        .collect()
}
