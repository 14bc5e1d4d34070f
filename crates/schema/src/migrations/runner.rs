//! Migration Runner - Plans and applies migrations against a database
//!
//! Every migration runs in its own transaction together with its ledger row.
//! Structural problems (discovery, dependencies, checksums) are reported before
//! the first transaction opens; a failing statement stops the queue but keeps
//! whatever committed before it.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::checksum;
use super::definitions::*;
use super::graph::DependencyGraph;
use super::ledger::Ledger;
use super::scanner::{self, Discovery};
use crate::backends::{DatabasePool, DatabaseTransaction};
use crate::error::{DependencyError, DiscoveryError, SchemaError, SchemaResult};

/// Discovered migrations together with their validated graph
pub(crate) struct LoadedMigrations {
    pub discovery: Discovery,
    pub graph: DependencyGraph,
    pub order: Vec<Version>,
}

impl LoadedMigrations {
    pub fn by_version(&self) -> HashMap<Version, &Migration> {
        self.discovery
            .complete
            .iter()
            .map(|m| (m.version, m))
            .collect()
    }
}

/// Entry point for every schema operation
pub struct MigrationEngine {
    pool: Arc<dyn DatabasePool>,
    config: MigrationConfig,
    ledger: Ledger,
}

impl MigrationEngine {
    pub fn new(pool: Arc<dyn DatabasePool>, config: MigrationConfig) -> SchemaResult<Self> {
        let ledger = Ledger::new(config.migrations_table.clone())?;
        Ok(Self {
            pool,
            config,
            ledger,
        })
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<dyn DatabasePool> {
        &self.pool
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Close the underlying pool; later calls fail with a connection error
    pub async fn close(&self) -> SchemaResult<()> {
        debug!("Closing migration pool");
        self.pool.close().await
    }

    /// Scan the configured directories
    pub fn discover(&self) -> SchemaResult<Discovery> {
        scanner::scan(&self.config.migrations_dirs, self.config.strict)
    }

    /// Discover, build the graph and reject cycles
    pub(crate) fn load(&self) -> SchemaResult<LoadedMigrations> {
        let discovery = self.discover()?;
        let graph = DependencyGraph::build(&discovery.complete)?;
        graph.ensure_acyclic()?;
        let order = graph.topological_order()?;
        Ok(LoadedMigrations {
            discovery,
            graph,
            order,
        })
    }

    /// Forward apply order of every complete migration
    pub fn apply_order(&self) -> SchemaResult<Vec<Version>> {
        Ok(self.load()?.order)
    }

    /// Run `fut` under the configured command timeout
    pub(crate) async fn timed<T, F>(&self, fut: F) -> SchemaResult<T>
    where
        F: Future<Output = SchemaResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SchemaError::Timeout {
                seconds: self.config.command_timeout.as_secs_f64(),
            }),
        }
    }

    pub(crate) async fn applied_entries(&self) -> SchemaResult<Vec<LedgerEntry>> {
        self.timed(self.ledger.ensure(self.pool.as_ref())).await?;
        self.timed(self.ledger.entries(self.pool.as_ref())).await
    }

    /// Apply pending migrations in dependency order
    pub async fn up(&self, options: UpOptions) -> SchemaResult<ApplyReport> {
        let loaded = self.load()?;
        let by_version = loaded.by_version();
        let entries = self.applied_entries().await?;
        let applied: HashSet<Version> = entries.iter().map(|e| e.version).collect();

        for entry in &entries {
            if !by_version.contains_key(&entry.version) {
                warn!(
                    "Applied migration {} ({}) has no complete source on disk",
                    entry.version, entry.name
                );
            }
        }

        if !options.force {
            let mismatches = checksum::find_mismatches(&entries, &by_version);
            if !mismatches.is_empty() {
                return Err(SchemaError::Checksum { mismatches });
            }
        } else {
            debug!("Skipping checksum validation (force)");
        }

        let pending: Vec<&Migration> = loaded
            .order
            .iter()
            .filter(|v| !applied.contains(v))
            .filter(|v| options.target.map_or(true, |target| **v <= target))
            .filter_map(|v| by_version.get(v).copied())
            .collect();

        let mut scheduled: HashSet<Version> = HashSet::new();
        for migration in &pending {
            for dependency in &migration.depends_on {
                if !applied.contains(dependency) && !scheduled.contains(dependency) {
                    return Err(DependencyError::Unmet {
                        migration: migration.version,
                        dependency: *dependency,
                    }
                    .into());
                }
            }
            scheduled.insert(migration.version);
        }

        let mut report = ApplyReport {
            planned: pending
                .iter()
                .map(|m| MigrationPlan::new(m, Direction::Up))
                .collect(),
            dry_run: options.dry_run,
            ..ApplyReport::default()
        };

        if pending.is_empty() {
            info!("No pending migrations");
            return Ok(report);
        }

        if options.dry_run {
            info!("Dry run: {} migration(s) would be applied", pending.len());
            return Ok(report);
        }

        info!("Applying {} migration(s)", pending.len());
        for migration in pending {
            let start = Instant::now();
            match self.run_in_transaction(migration, Direction::Up).await {
                Ok(()) => {
                    info!(
                        "✅ Applied migration {} ({}) in {}ms",
                        migration.version,
                        migration.name,
                        start.elapsed().as_millis()
                    );
                    report.applied.push(migration.version);
                }
                Err(e) => {
                    error!(
                        "Migration {} ({}) failed: {}",
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

    /// Execute one direction of `migration` and update the ledger, atomically
    pub(crate) async fn run_in_transaction(
        &self,
        migration: &Migration,
        direction: Direction,
    ) -> SchemaResult<()> {
        let sql = migration.source(direction).ok_or(DiscoveryError::MissingSource {
            version: migration.version,
            direction,
        })?;

        let mut tx = self.timed(self.pool.begin_transaction()).await?;
        let outcome = self.execute_steps(tx.as_mut(), migration, direction, sql).await;

        match outcome {
            Ok(()) => self.timed(tx.commit()).await,
            Err(e) => {
                if let Err(rollback_error) = self.timed(tx.rollback()).await {
                    warn!(
                        "Rollback of migration {} failed: {}",
                        migration.version, rollback_error
                    );
                }
                Err(e)
            }
        }
    }

    async fn execute_steps(
        &self,
        tx: &mut dyn DatabaseTransaction,
        migration: &Migration,
        direction: Direction,
        sql: &str,
    ) -> SchemaResult<()> {
        debug!("Running {} for migration {}", direction, migration.version);
        self.timed(tx.execute_script(sql)).await?;
        match direction {
            Direction::Up => self.timed(self.ledger.record(tx, migration)).await,
            Direction::Down => self.timed(self.ledger.remove(tx, migration.version)).await,
        }
    }

    /// Compare discovered migrations with the ledger
    pub async fn status(&self) -> SchemaResult<MigrationStatusReport> {
        let discovery = self.discover()?;
        let entries = self.applied_entries().await?;
        let applied: HashSet<Version> = entries.iter().map(|e| e.version).collect();

        let applied_list = entries
            .into_iter()
            .map(|entry| {
                let on_disk = discovery.find(entry.version);
                AppliedMigration {
                    on_disk: on_disk.is_some(),
                    checksum_valid: on_disk
                        .filter(|m| m.up_sql.is_some())
                        .map(|m| checksum::verify(m, &entry.checksum)),
                    entry,
                }
            })
            .collect::<Vec<_>>();

        let mut pending: Vec<PendingMigration> = discovery
            .complete
            .iter()
            .chain(discovery.incomplete.iter())
            .filter(|m| !applied.contains(&m.version))
            .map(|m| PendingMigration {
                version: m.version,
                name: m.name.clone(),
                is_complete: m.is_complete(),
            })
            .collect();
        pending.sort_by_key(|p| p.version);

        Ok(MigrationStatusReport {
            current_version: applied_list.iter().map(|a| a.entry.version).max(),
            applied: applied_list,
            pending,
        })
    }

    /// Dump the dependency graph; cycles are reported, not raised
    pub async fn deps(&self) -> SchemaResult<DependencyReport> {
        let discovery = self.discover()?;
        let graph = DependencyGraph::build(&discovery.complete)?;
        let applied: HashSet<Version> = self
            .applied_entries()
            .await?
            .into_iter()
            .map(|e| e.version)
            .collect();

        let cycles = graph.detect_cycles();
        let order = if cycles.is_empty() {
            Some(graph.topological_order()?)
        } else {
            None
        };

        let nodes = discovery
            .complete
            .iter()
            .map(|m| DependencyNode {
                version: m.version,
                name: m.name.clone(),
                depends_on: graph.dependencies(m.version).to_vec(),
                dependents: graph.dependents(m.version),
                applied: applied.contains(&m.version),
            })
            .collect();

        Ok(DependencyReport {
            nodes,
            cycles,
            order,
        })
    }

    /// Recompute the checksum of every applied migration
    pub async fn verify(&self) -> SchemaResult<VerifyReport> {
        let discovery = self.discover()?;
        let entries = self.applied_entries().await?;

        let entries = entries
            .into_iter()
            .map(|entry| {
                let outcome = match discovery.find(entry.version).and_then(|m| m.checksum()) {
                    None => VerifyOutcome::MissingOnDisk,
                    Some(computed) if computed.eq_ignore_ascii_case(entry.checksum.trim()) => {
                        VerifyOutcome::Valid
                    }
                    Some(computed) => VerifyOutcome::Mismatch {
                        stored: entry.checksum.clone(),
                        computed: computed.to_string(),
                    },
                };
                VerifyEntry {
                    version: entry.version,
                    name: entry.name,
                    outcome,
                }
            })
            .collect();

        Ok(VerifyReport { entries })
    }

    /// Plan entry for one discovered migration
    pub fn preview(&self, version: Version) -> SchemaResult<MigrationPlan> {
        let discovery = self.discover()?;
        let migration = discovery.find(version).ok_or(DiscoveryError::MissingSource {
            version,
            direction: Direction::Up,
        })?;
        Ok(MigrationPlan::new(migration, Direction::Up))
    }

    /// Write a new up/down pair into the first migrations directory
    pub fn create_migration(&self, name: &str, auto_depend: bool) -> SchemaResult<CreatedMigration> {
        let dir = self
            .config
            .migrations_dirs
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from(pgfast_core::DEFAULT_MIGRATIONS_DIR));
        create_migration(&dir, &self.config.migrations_dirs, name, auto_depend)
    }
}

/// Normalise a migration name to `[a-z0-9_]+`
pub fn normalize_name(name: &str) -> SchemaResult<String> {
    let normalized: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect();

    if normalized.is_empty()
        || !normalized
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(DiscoveryError::InvalidFilename {
            path: PathBuf::from(name),
            reason: "migration names may only contain letters, digits, spaces, '-' and '_'"
                .to_string(),
        }
        .into());
    }
    Ok(normalized)
}

/// Create `{version}_{name}_up.sql` and `_down.sql` in `dir`.
///
/// The version is the current timestamp, bumped past the newest version found
/// under `roots` so rapid successive calls stay unique and ordered.
pub fn create_migration(
    dir: &Path,
    roots: &[PathBuf],
    name: &str,
    auto_depend: bool,
) -> SchemaResult<CreatedMigration> {
    let name = normalize_name(name)?;
    fs::create_dir_all(dir)?;

    let mut roots = roots.to_vec();
    if !roots.iter().any(|r| r == dir) {
        roots.push(dir.to_path_buf());
    }
    let discovery = scanner::scan(&roots, false)?;
    let latest = discovery.latest_version();

    let now = Utc::now();
    let mut version = Version::from_timestamp(now);
    if let Some(latest) = latest {
        if version <= latest {
            version = Version::new(latest.as_i64() + 1);
        }
    }

    let depends_on = if auto_depend {
        discovery.latest_complete_version()
    } else {
        None
    };

    let up_path = dir.join(format!("{}_{}_up.sql", version, name));
    let down_path = dir.join(format!("{}_{}_down.sql", version, name));

    let mut up = format!("-- Migration: {}\n-- Created: {}\n", name, now.to_rfc3339());
    if let Some(dependency) = depends_on {
        up.push_str(&format!("-- depends_on: {}\n", dependency));
    }
    up.push_str("\n-- Add your forward migration SQL here\n");

    let down = format!(
        "-- Migration: {} (rollback)\n-- Created: {}\n\n-- Add the SQL that undoes {} here\n",
        name,
        now.to_rfc3339(),
        name
    );

    fs::write(&up_path, up)?;
    fs::write(&down_path, down)?;
    info!("Created migration {} ({})", version, name);

    Ok(CreatedMigration {
        version,
        name,
        up_path,
        down_path,
        depends_on,
    })
}
