//! Migration Scanner - Reads `{version}_{name}_up.sql` / `_down.sql` pairs
//!
//! Roots are walked recursively. Nesting has no effect on ordering; it only
//! lets projects group migrations by module.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::definitions::{Direction, Migration, Version};
use crate::error::{DiscoveryError, SchemaResult};

/// How many leading lines of an up file are searched for the marker
const DEPENDENCY_SCAN_LINES: usize = 20;

static DEPENDS_ON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*--\s*depends_on\s*:(.*)$").expect("static regex is valid")
});

/// Everything found under the configured roots
#[derive(Debug, Default, Clone)]
pub struct Discovery {
    /// Complete migrations, sorted by version
    pub complete: Vec<Migration>,
    /// Migrations missing their up or down file, sorted by version
    pub incomplete: Vec<Migration>,
}

impl Discovery {
    pub fn is_empty(&self) -> bool {
        self.complete.is_empty() && self.incomplete.is_empty()
    }

    pub fn find(&self, version: Version) -> Option<&Migration> {
        self.complete
            .iter()
            .chain(self.incomplete.iter())
            .find(|m| m.version == version)
    }

    pub fn latest_version(&self) -> Option<Version> {
        self.complete
            .iter()
            .chain(self.incomplete.iter())
            .map(|m| m.version)
            .max()
    }

    /// Newest version that has both files and can therefore enter the graph
    pub fn latest_complete_version(&self) -> Option<Version> {
        self.complete.iter().map(|m| m.version).max()
    }
}

#[derive(Default)]
struct Pair {
    name: String,
    up: Option<PathBuf>,
    down: Option<PathBuf>,
}

/// Scan `roots` for migrations.
///
/// Missing roots are skipped with a warning unless `strict` is set, in which
/// case they are an error, as are incomplete migrations.
pub fn scan(roots: &[PathBuf], strict: bool) -> SchemaResult<Discovery> {
    let mut files = Vec::new();
    for root in roots {
        if !root.is_dir() {
            if strict {
                return Err(DiscoveryError::MissingDirectory { path: root.clone() }.into());
            }
            warn!("Migrations directory {} does not exist, skipping", root.display());
            continue;
        }
        collect_sql_files(root, &mut files)?;
    }

    let mut pairs: BTreeMap<Version, Pair> = BTreeMap::new();
    for path in files {
        let Some((version, name, direction)) = parse_filename(&path)? else {
            continue;
        };

        let pair = pairs.entry(version).or_insert_with(|| Pair {
            name: name.clone(),
            ..Pair::default()
        });

        let taken = match direction {
            Direction::Up => pair.up.as_ref(),
            Direction::Down => pair.down.as_ref(),
        };

        if pair.name != name || taken.is_some() {
            let first = taken
                .or(pair.up.as_ref())
                .or(pair.down.as_ref())
                .cloned()
                .unwrap_or_default();
            return Err(DiscoveryError::DuplicateVersion {
                version,
                first,
                second: path,
            }
            .into());
        }

        match direction {
            Direction::Up => pair.up = Some(path),
            Direction::Down => pair.down = Some(path),
        }
    }

    let mut discovery = Discovery::default();
    for (version, pair) in pairs {
        let mut migration = Migration::new(version, pair.name);

        if let Some(path) = pair.up {
            let sql = fs::read_to_string(&path)?;
            let depends_on = parse_dependencies(&sql, &path)?;
            migration = migration.with_up(path, sql).with_dependencies(depends_on);
        }
        if let Some(path) = pair.down {
            let sql = fs::read_to_string(&path)?;
            migration = migration.with_down(path, sql);
        }

        match migration.missing_direction() {
            None => discovery.complete.push(migration),
            Some(missing) if strict => {
                return Err(DiscoveryError::Incomplete {
                    version,
                    name: migration.name,
                    missing,
                }
                .into());
            }
            Some(missing) => {
                warn!(
                    "Migration {} ({}) is missing its {} file and will be ignored",
                    version, migration.name, missing
                );
                discovery.incomplete.push(migration);
            }
        }
    }

    debug!(
        "Discovered {} complete and {} incomplete migrations",
        discovery.complete.len(),
        discovery.incomplete.len()
    );

    Ok(discovery)
}

fn collect_sql_files(dir: &Path, out: &mut Vec<PathBuf>) -> SchemaResult<()> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            collect_sql_files(&path, out)?;
        } else if path.extension().map_or(false, |ext| ext == "sql") {
            out.push(path);
        }
    }
    Ok(())
}

/// Split `{version}_{name}_{up|down}.sql`.
///
/// Returns `Ok(None)` for `.sql` files without a direction suffix.
pub fn parse_filename(path: &Path) -> SchemaResult<Option<(Version, String, Direction)>> {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return Ok(None);
    };

    let (rest, direction) = if let Some(rest) = stem.strip_suffix(Direction::Up.suffix()) {
        (rest, Direction::Up)
    } else if let Some(rest) = stem.strip_suffix(Direction::Down.suffix()) {
        (rest, Direction::Down)
    } else {
        return Ok(None);
    };

    let invalid = |reason: &str| DiscoveryError::InvalidFilename {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let (version, name) = rest
        .split_once('_')
        .ok_or_else(|| invalid("expected {version}_{name}_{up|down}.sql"))?;

    let version: Version = version
        .parse()
        .map_err(|_| invalid("version must be digits only"))?;

    if name.is_empty() {
        return Err(invalid("migration name is empty").into());
    }

    Ok(Some((version, name.to_string(), direction)))
}

/// Read the `-- depends_on: v1, v2` marker near the top of an up source.
///
/// The first marker line wins. Duplicates are dropped, keeping declaration
/// order.
pub fn parse_dependencies(sql: &str, path: &Path) -> Result<Vec<Version>, DiscoveryError> {
    let Some(list) = sql
        .lines()
        .take(DEPENDENCY_SCAN_LINES)
        .find_map(|line| DEPENDS_ON.captures(line))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
    else {
        return Ok(Vec::new());
    };

    let malformed = |token: &str| DiscoveryError::MalformedDependency {
        path: path.to_path_buf(),
        token: token.to_string(),
    };

    let mut versions = Vec::new();
    for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let version: Version = token.parse().map_err(|_| malformed(token))?;
        if !versions.contains(&version) {
            versions.push(version);
        }
    }

    if versions.is_empty() {
        return Err(malformed(list.trim()));
    }

    Ok(versions)
}
