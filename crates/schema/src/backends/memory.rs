//! In-process stand-in for PostgreSQL used by the engine's unit tests.
//!
//! It understands just enough SQL to track which tables exist, how many rows
//! were inserted into each, and the contents of ledger tables. Anything it
//! does not recognise is reported as a syntax error, which is how tests inject
//! failing migrations. Statements mentioning `pg_sleep` stall for several
//! seconds so timeout handling can be exercised.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::core::*;
use crate::error::{SchemaError, SchemaResult};

#[derive(Debug, Clone)]
struct LedgerRow {
    name: String,
    checksum: String,
    applied_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Default)]
struct State {
    tables: BTreeSet<String>,
    rows: BTreeMap<String, usize>,
    ledgers: BTreeMap<String, BTreeMap<i64, LedgerRow>>,
}

#[derive(Debug, Default)]
struct Journal {
    scripts: Vec<String>,
    begun: usize,
    committed: usize,
    rolled_back: usize,
    closed: bool,
}

#[derive(Clone, Default)]
pub struct MemoryPool {
    state: Arc<Mutex<State>>,
    journal: Arc<Mutex<Journal>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_table(&self, table: &str) -> bool {
        lock(&self.state).tables.contains(table)
    }

    pub fn row_count(&self, table: &str) -> usize {
        lock(&self.state).rows.get(table).copied().unwrap_or(0)
    }

    pub fn ledger_versions(&self, table: &str) -> Vec<i64> {
        lock(&self.state)
            .ledgers
            .get(table)
            .map(|rows| rows.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Overwrite a stored checksum, as if the row had been written by an
    /// older copy of the migration
    pub fn set_checksum(&self, table: &str, version: i64, checksum: &str) {
        if let Some(row) = lock(&self.state)
            .ledgers
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&version))
        {
            row.checksum = checksum.to_string();
        }
    }

    /// Insert a ledger row directly, bypassing any migration
    pub fn insert_ledger_row(&self, table: &str, version: i64, name: &str, checksum: &str) {
        let mut state = lock(&self.state);
        state.tables.insert(table.to_string());
        state.ledgers.entry(table.to_string()).or_default().insert(
            version,
            LedgerRow {
                name: name.to_string(),
                checksum: checksum.to_string(),
                applied_at: chrono::Utc::now(),
            },
        );
    }

    /// Every script run through `execute_script`, committed or not
    pub fn executed_scripts(&self) -> Vec<String> {
        lock(&self.journal).scripts.clone()
    }

    pub fn transactions_begun(&self) -> usize {
        lock(&self.journal).begun
    }

    pub fn transactions_committed(&self) -> usize {
        lock(&self.journal).committed
    }

    pub fn transactions_rolled_back(&self) -> usize {
        lock(&self.journal).rolled_back
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.journal).closed
    }

    fn ensure_open(&self) -> SchemaResult<()> {
        if self.is_closed() {
            return Err(SchemaError::Connection("pool is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabasePool for MemoryPool {
    async fn begin_transaction(&self) -> SchemaResult<Box<dyn DatabaseTransaction>> {
        self.ensure_open()?;
        lock(&self.journal).begun += 1;
        let staged = lock(&self.state).clone();
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.state),
            journal: Arc::clone(&self.journal),
            staged,
        }))
    }

    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> SchemaResult<u64> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        execute_with_params(&mut state, sql, params)
    }

    async fn fetch_all(&self, sql: &str, _params: &[DatabaseValue]) -> SchemaResult<Vec<Box<dyn DatabaseRow>>> {
        self.ensure_open()?;
        let state = lock(&self.state);
        select_ledger(&state, sql)
    }

    async fn close(&self) -> SchemaResult<()> {
        lock(&self.journal).closed = true;
        Ok(())
    }
}

struct MemoryTransaction {
    shared: Arc<Mutex<State>>,
    journal: Arc<Mutex<Journal>>,
    staged: State,
}

#[async_trait]
impl DatabaseTransaction for MemoryTransaction {
    async fn execute_script(&mut self, sql: &str) -> SchemaResult<()> {
        lock(&self.journal).scripts.push(sql.to_string());
        if sql.to_lowercase().contains("pg_sleep") {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        for statement in sql.split(';') {
            apply_statement(&mut self.staged, statement)?;
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> SchemaResult<u64> {
        execute_with_params(&mut self.staged, sql, params)
    }

    async fn commit(self: Box<Self>) -> SchemaResult<()> {
        let this = *self;
        *lock(&this.shared) = this.staged;
        lock(&this.journal).committed += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> SchemaResult<()> {
        lock(&self.journal).rolled_back += 1;
        Ok(())
    }
}

fn strip_comments(sql: &str) -> String {
    sql.lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn tokens(sql: &str) -> Vec<String> {
    strip_comments(sql)
        .replace('(', " ( ")
        .split_whitespace()
        .map(|t| t.trim_matches('"').to_lowercase())
        .collect()
}

fn missing_relation(name: &str) -> SchemaError {
    SchemaError::Statement(format!("relation \"{}\" does not exist", name))
}

fn require_table(state: &State, name: &str) -> SchemaResult<()> {
    if state.tables.contains(name) {
        Ok(())
    } else {
        Err(missing_relation(name))
    }
}

fn apply_statement(state: &mut State, statement: &str) -> SchemaResult<()> {
    let words = tokens(statement);
    let word = |i: usize| words.get(i).map(String::as_str).unwrap_or("");

    match (word(0), word(1)) {
        ("", _) | ("select", _) => Ok(()),
        ("create", "table") => {
            let if_not_exists = word(2) == "if" && word(3) == "not" && word(4) == "exists";
            let name = if if_not_exists { word(5) } else { word(2) }.to_string();
            if name.is_empty() || name == "(" {
                return Err(SchemaError::Statement("syntax error at end of input".into()));
            }
            if state.tables.contains(&name) && !if_not_exists {
                return Err(SchemaError::Statement(format!(
                    "relation \"{}\" already exists",
                    name
                )));
            }
            state.tables.insert(name);
            Ok(())
        }
        ("drop", "table") => {
            let if_exists = word(2) == "if" && word(3) == "exists";
            let name = if if_exists { word(4) } else { word(2) }.to_string();
            if !state.tables.remove(&name) && !if_exists {
                return Err(missing_relation(&name));
            }
            state.rows.remove(&name);
            Ok(())
        }
        ("create", "index") | ("create", "unique") => {
            match words.iter().position(|w| w == "on") {
                Some(i) => require_table(state, word(i + 1)),
                None => Err(SchemaError::Statement("syntax error in CREATE INDEX".into())),
            }
        }
        ("alter", "table") | ("update", _) => {
            let name = if word(0) == "alter" { word(2) } else { word(1) };
            require_table(state, name)
        }
        ("insert", "into") => {
            let name = word(2).to_string();
            require_table(state, &name)?;
            *state.rows.entry(name).or_default() += 1;
            Ok(())
        }
        ("delete", "from") => require_table(state, word(2)),
        (first, _) => Err(SchemaError::Statement(format!(
            "syntax error at or near \"{}\"",
            first
        ))),
    }
}

fn execute_with_params(state: &mut State, sql: &str, params: &[DatabaseValue]) -> SchemaResult<u64> {
    let words = tokens(sql);
    let word = |i: usize| words.get(i).map(String::as_str).unwrap_or("");

    match (word(0), word(1), params.len()) {
        ("insert", "into", 4) => {
            let table = word(2).to_string();
            require_table(state, &table)?;
            let version = params[0]
                .as_i64()
                .ok_or_else(|| SchemaError::Statement("version must be an integer".into()))?;
            let ledger = state.ledgers.entry(table).or_default();
            if ledger.contains_key(&version) {
                return Err(SchemaError::Statement(format!(
                    "duplicate key value violates unique constraint: version={}",
                    version
                )));
            }
            ledger.insert(
                version,
                LedgerRow {
                    name: params[1].as_str().unwrap_or_default().to_string(),
                    checksum: params[2].as_str().unwrap_or_default().to_string(),
                    applied_at: params[3].as_datetime().unwrap_or_else(chrono::Utc::now),
                },
            );
            Ok(1)
        }
        ("delete", "from", 1) => {
            let table = word(2).to_string();
            require_table(state, &table)?;
            let version = params[0].as_i64().unwrap_or_default();
            let removed = state
                .ledgers
                .get_mut(&table)
                .and_then(|rows| rows.remove(&version))
                .is_some();
            Ok(u64::from(removed))
        }
        _ => {
            apply_statement(state, sql)?;
            Ok(0)
        }
    }
}

struct MemoryRow {
    values: HashMap<String, DatabaseValue>,
}

impl DatabaseRow for MemoryRow {
    fn get_by_name(&self, name: &str) -> SchemaResult<DatabaseValue> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::Ledger(format!("Column '{}' not found", name)))
    }
}

fn select_ledger(state: &State, sql: &str) -> SchemaResult<Vec<Box<dyn DatabaseRow>>> {
    let words = tokens(sql);
    let table = words
        .iter()
        .position(|w| w == "from")
        .and_then(|i| words.get(i + 1))
        .cloned()
        .unwrap_or_default();
    require_table(state, &table)?;

    let rows = state
        .ledgers
        .get(&table)
        .map(|rows| {
            rows.iter()
                .map(|(version, row)| {
                    let values = HashMap::from([
                        ("version".to_string(), DatabaseValue::Int64(*version)),
                        ("name".to_string(), DatabaseValue::String(row.name.clone())),
                        ("checksum".to_string(), DatabaseValue::String(row.checksum.clone())),
                        ("applied_at".to_string(), DatabaseValue::DateTime(row.applied_at)),
                    ]);
                    Box::new(MemoryRow { values }) as Box<dyn DatabaseRow>
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(rows)
}
