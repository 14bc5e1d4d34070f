//! Migration Rollback - Reverts applied migrations
//!
//! Reverts follow the exact reverse of the forward apply order. A migration
//! is never reverted while another applied migration still depends on it.

use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, error, info};

use super::checksum;
use super::definitions::*;
use super::runner::MigrationEngine;
use crate::error::{DependencyError, DiscoveryError, SchemaError, SchemaResult};

/// Extension trait adding rollback to [`MigrationEngine`]
pub trait MigrationRollback {
    /// Revert applied migrations selected by `options.target`
    async fn down(&self, options: DownOptions) -> SchemaResult<RollbackReport>;
}

impl MigrationRollback for MigrationEngine {
    async fn down(&self, options: DownOptions) -> SchemaResult<RollbackReport> {
        let loaded = self.load()?;
        let by_version = loaded.by_version();
        let entries = self.applied_entries().await?;
        let sequence = sequence_for(&loaded.order, &entries);

        let selected: Vec<Version> = match options.target {
            DownTarget::Steps(steps) => sequence.iter().take(steps).copied().collect(),
            DownTarget::To(target) => sequence.iter().filter(|v| **v > target).copied().collect(),
            DownTarget::Only(version) => sequence.iter().filter(|v| **v == version).copied().collect(),
        };

        let mut report = RollbackReport {
            dry_run: options.dry_run,
            ..RollbackReport::default()
        };

        if selected.is_empty() {
            info!("No migrations to roll back");
            return Ok(report);
        }

        let mut migrations = Vec::with_capacity(selected.len());
        for version in &selected {
            let migration = by_version
                .get(version)
                .copied()
                .ok_or(DiscoveryError::MissingSource {
                    version: *version,
                    direction: Direction::Down,
                })?;
            migrations.push(migration);
        }

        if !options.force {
            let selected_set: HashSet<Version> = selected.iter().copied().collect();
            let mismatches = checksum::find_mismatches(
                entries.iter().filter(|e| selected_set.contains(&e.version)),
                &by_version,
            );
            if !mismatches.is_empty() {
                return Err(SchemaError::Checksum { mismatches });
            }
        } else {
            debug!("Skipping checksum validation (force)");
        }

        // Dependents reverted earlier in this run no longer hold their
        // dependencies in place.
        let mut remaining: HashSet<Version> = entries.iter().map(|e| e.version).collect();
        for migration in &migrations {
            remaining.remove(&migration.version);
            let blocking: Vec<Version> = loaded
                .graph
                .dependents(migration.version)
                .into_iter()
                .filter(|d| remaining.contains(d))
                .collect();
            if !blocking.is_empty() {
                return Err(DependencyError::StillRequired {
                    migration: migration.version,
                    dependents: blocking,
                }
                .into());
            }
        }

        report.planned = migrations
            .iter()
            .map(|m| MigrationPlan::new(m, Direction::Down))
            .collect();

        if options.dry_run {
            info!("Dry run: {} migration(s) would be rolled back", migrations.len());
            return Ok(report);
        }

        info!("Rolling back {} migration(s)", migrations.len());
        for migration in migrations {
            let start = Instant::now();
            match self.run_in_transaction(migration, Direction::Down).await {
                Ok(()) => {
                    info!(
                        "✅ Rolled back migration {} ({}) in {}ms",
                        migration.version,
                        migration.name,
                        start.elapsed().as_millis()
                    );
                    report.reverted.push(migration.version);
                }
                Err(e) => {
                    error!(
                        "Rollback of migration {} ({}) failed: {}",
                        migration.version, migration.name, e
                    );
                    report.failed = Some(FailedMigration {
                        version: migration.version,
                        name: migration.name.clone(),
                        error: e.for_migration(migration.version),
                    });
                    break;
                }
            }
        }

        Ok(report)
    }
}

/// Order applied versions for reverting.
///
/// Versions in the graph follow the reverse apply order. Ledger entries with no
/// complete source on disk come first, newest first, so a step-wise rollback
/// hits them (and fails loudly) before touching anything older.
fn sequence_for(order: &[Version], entries: &[LedgerEntry]) -> Vec<Version> {
    let position: HashMap<Version, usize> = order.iter().enumerate().map(|(i, v)| (*v, i)).collect();

    let mut orphans: Vec<Version> = entries
        .iter()
        .map(|e| e.version)
        .filter(|v| !position.contains_key(v))
        .collect();
    orphans.sort_by(|a, b| b.cmp(a));

    let mut known: Vec<Version> = entries
        .iter()
        .map(|e| e.version)
        .filter(|v| position.contains_key(v))
        .collect();
    known.sort_by_key(|v| std::cmp::Reverse(position[v]));

    orphans.extend(known);
    orphans
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(version: i64) -> LedgerEntry {
        LedgerEntry {
            version: Version::new(version),
            name: format!("m{}", version),
            checksum: String::new(),
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn test_sequence_reverses_apply_order() {
        // 3 was applied before 1 because 1 depends on 3
        let order = vec![Version::new(2), Version::new(3), Version::new(1)];
        let entries = vec![entry(1), entry(2), entry(3)];
        let sequence: Vec<i64> = sequence_for(&order, &entries).iter().map(|v| v.as_i64()).collect();
        assert_eq!(sequence, vec![1, 3, 2]);
    }

    #[test]
    fn test_orphans_come_first() {
        let order = vec![Version::new(1), Version::new(2)];
        let entries = vec![entry(1), entry(2), entry(5), entry(9)];
        let sequence: Vec<i64> = sequence_for(&order, &entries).iter().map(|v| v.as_i64()).collect();
        assert_eq!(sequence, vec![9, 5, 2, 1]);
    }
}
