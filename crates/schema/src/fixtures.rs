//! Fixture loading in migration dependency order.
//!
//! A fixture named `{version}_{name}_fixture.sql` seeds the tables created by
//! migration `version`, so fixtures load in the same order their migrations
//! apply. Other `.sql` files load afterwards, sorted by filename.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backends::DatabasePool;
use crate::error::{DiscoveryError, SchemaError, SchemaResult};
use crate::migrations::{MigrationEngine, Version};

const FIXTURE_SUFFIX: &str = "_fixture";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixture {
    /// Migration this fixture belongs to; `None` for free-form files
    pub version: Option<Version>,
    pub name: String,
    pub path: PathBuf,
}

impl Fixture {
    /// Parse `{version}_{name}_fixture.sql`; `None` for any other filename
    pub fn from_path(path: &Path) -> Option<Self> {
        if path.extension().map_or(true, |ext| ext != "sql") {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let rest = stem.strip_suffix(FIXTURE_SUFFIX)?;
        let (version, name) = rest.split_once('_')?;
        let version: Version = version.parse().ok()?;
        if name.is_empty() {
            return None;
        }

        Some(Self {
            version: Some(version),
            name: name.to_string(),
            path: path.to_path_buf(),
        })
    }

    /// Any `.sql` file: versioned when the name allows it, free-form otherwise
    pub fn any(path: &Path) -> Option<Self> {
        if path.extension().map_or(true, |ext| ext != "sql") {
            return None;
        }
        Self::from_path(path).or_else(|| {
            Some(Self {
                version: None,
                name: path.file_stem()?.to_str()?.to_string(),
                path: path.to_path_buf(),
            })
        })
    }
}

pub struct FixtureLoader {
    pool: Arc<dyn DatabasePool>,
    dirs: Vec<PathBuf>,
    order: HashMap<Version, usize>,
    command_timeout: Duration,
}

impl FixtureLoader {
    /// `order` is the forward migration order used to sort versioned fixtures
    pub fn new(
        pool: Arc<dyn DatabasePool>,
        dirs: Vec<PathBuf>,
        order: &[Version],
        command_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            dirs,
            order: order.iter().enumerate().map(|(i, v)| (*v, i)).collect(),
            command_timeout,
        }
    }

    /// Loader sharing the engine's pool, timeout and migration order
    pub fn for_engine(engine: &MigrationEngine, dirs: Vec<PathBuf>) -> SchemaResult<Self> {
        let order = engine.apply_order()?;
        Ok(Self::new(
            Arc::clone(engine.pool()),
            dirs,
            &order,
            engine.config().command_timeout,
        ))
    }

    /// Every fixture under the configured directories, in load order
    pub fn discover(&self) -> SchemaResult<Vec<Fixture>> {
        let mut paths = Vec::new();
        for dir in &self.dirs {
            if dir.is_dir() {
                collect(dir, &mut paths)?;
            } else {
                debug!("Fixtures directory {} does not exist, skipping", dir.display());
            }
        }
        let fixtures = paths.iter().filter_map(|p| Fixture::any(p)).collect();
        Ok(self.sort(fixtures))
    }

    /// Sort fixtures by their migration's apply position.
    ///
    /// Versions unknown to the migration graph follow the known ones in
    /// ascending order; free-form fixtures come last by filename.
    pub fn sort(&self, mut fixtures: Vec<Fixture>) -> Vec<Fixture> {
        fixtures.sort_by(|a, b| self.sort_key(a).cmp(&self.sort_key(b)));
        fixtures
    }

    fn sort_key(&self, fixture: &Fixture) -> (u8, usize, i64, Option<String>) {
        let file = fixture
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        match fixture.version {
            Some(v) => match self.order.get(&v) {
                Some(position) => (0, *position, v.as_i64(), file),
                None => (1, 0, v.as_i64(), file),
            },
            None => (2, 0, 0, file),
        }
    }

    /// Pick discovered fixtures by name, failing on any unknown name
    pub fn select(&self, names: &[String]) -> SchemaResult<Vec<Fixture>> {
        let discovered = self.discover()?;
        let selected: Vec<Fixture> = discovered
            .into_iter()
            .filter(|f| names.contains(&f.name))
            .collect();

        let found: BTreeSet<&str> = selected.iter().map(|f| f.name.as_str()).collect();
        let missing: Vec<String> = names
            .iter()
            .filter(|n| !found.contains(n.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(DiscoveryError::MissingFixture { names: missing }.into());
        }

        Ok(selected)
    }

    /// Load the given files, or everything discovered when `paths` is empty.
    ///
    /// Each file runs in its own transaction; the first failure stops loading.
    pub async fn load(&self, paths: &[PathBuf]) -> SchemaResult<Vec<PathBuf>> {
        let fixtures = if paths.is_empty() {
            self.discover()?
        } else {
            let mut fixtures = Vec::with_capacity(paths.len());
            for path in paths {
                if !path.is_file() {
                    return Err(DiscoveryError::MissingFixture {
                        names: vec![path.display().to_string()],
                    }
                    .into());
                }
                match Fixture::any(path) {
                    Some(fixture) => fixtures.push(fixture),
                    None => warn!("Skipping {}: fixtures must be .sql files", path.display()),
                }
            }
            self.sort(fixtures)
        };

        let mut loaded = Vec::with_capacity(fixtures.len());
        for fixture in fixtures {
            self.load_one(&fixture).await?;
            info!("Loaded fixture {}", fixture.path.display());
            loaded.push(fixture.path);
        }
        Ok(loaded)
    }

    async fn load_one(&self, fixture: &Fixture) -> SchemaResult<()> {
        let sql = fs::read_to_string(&fixture.path)?;
        let mut tx = self.timed(self.pool.begin_transaction()).await?;

        match self.timed(tx.execute_script(&sql)).await {
            Ok(()) => self.timed(tx.commit()).await,
            Err(e) => {
                if let Err(rollback_error) = self.timed(tx.rollback()).await {
                    warn!("Rollback after fixture failure failed: {}", rollback_error);
                }
                Err(SchemaError::Statement(format!(
                    "fixture {} failed: {}",
                    fixture.path.display(),
                    e
                )))
            }
        }
    }

    async fn timed<T, F>(&self, fut: F) -> SchemaResult<T>
    where
        F: std::future::Future<Output = SchemaResult<T>>,
    {
        tokio::time::timeout(self.command_timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(SchemaError::Timeout {
                    seconds: self.command_timeout.as_secs_f64(),
                })
            })
    }
}

fn collect(dir: &Path, out: &mut Vec<PathBuf>) -> SchemaResult<()> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            collect(&path, out)?;
        } else if path.extension().map_or(false, |ext| ext == "sql") {
            out.push(path);
        }
    }
    Ok(())
}
