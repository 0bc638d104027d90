//! SQLite-backed semantic store: connection, schema lifecycle, durability.
//!
//! The store owns the database connection and exposes transaction control to
//! the engines layered above it (symbol hashing, activation, query,
//! installation). All public operations run to completion on the caller's
//! thread; the store is single-writer, single-reader by design.

pub(crate) mod schema;
pub(crate) mod variables;

pub use schema::{SCHEMA_SYSTEM, SCHEMA_VERSION};

use crate::activation::ActivationMode;
use crate::config::{Optimization, StoreConfig};
use crate::error::{Error, Result};
use crate::lti;
use crate::symbol::{self, SymbolCache, SymbolHash, SymbolValue};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use variables::Variable;

/// Source for attach generations. Process-wide so a store reopened at the
/// same path never revalidates ids cached against the previous attachment.
static GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// In-memory counters mirrored to the variables table at checkpoints.
///
/// Mutating operations copy these out, thread them through the connection
/// helpers, and write them back only when the transaction succeeds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Counters {
    pub lti_counter: u64,
    pub max_cycle: u64,
    pub node_count: u64,
    pub edge_count: u64,
}

/// What was found at the target path.
enum Disposition {
    Fresh,
    Current,
    Legacy,
    Unusable(String),
}

/// The persistent long-term memory store.
pub struct SemanticStore {
    conn: Arc<Mutex<Connection>>,
    config: StoreConfig,
    symbols: SymbolCache,
    pub(crate) lti_counter: u64,
    pub(crate) max_cycle: u64,
    pub(crate) node_count: u64,
    pub(crate) edge_count: u64,
    generation: u64,
    ephemeral: bool,
}

impl SemanticStore {
    /// Open (or create) a durable store at the given path.
    ///
    /// A store stamped with an unrecognized or unreadable schema is never
    /// used: the call falls back to a fresh ephemeral in-memory store and
    /// logs a warning instead of failing. Only connection-level problems
    /// (unreachable/unwritable path) surface as errors.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| Error::connection(format!("cannot open {}: {e}", path.display())))?;

        match Self::assess(&conn) {
            Ok(Disposition::Fresh) => {
                debug!(path = %path.display(), "initializing new semantic store");
                Self::finish_init(conn, config, true, false)
            }
            Ok(Disposition::Current) => {
                if config.append {
                    debug!(path = %path.display(), "attaching to existing semantic store");
                    Self::finish_init(conn, config, false, false)
                } else {
                    info!(path = %path.display(), "erasing store contents (append = off)");
                    schema::drop_structure(&conn)?;
                    Self::finish_init(conn, config, true, false)
                }
            }
            Ok(Disposition::Legacy) => {
                info!(path = %path.display(), "legacy schema detected, migrating in place");
                match schema::migrate_v1_to_v2(&conn) {
                    Ok(()) => Self::finish_init(conn, config, false, false),
                    Err(e) => {
                        warn!(error = %e, "migration failed, switching to in-memory store");
                        Self::fallback(config)
                    }
                }
            }
            Ok(Disposition::Unusable(reason)) => {
                warn!(%reason, "cannot use on-disk store, switching to in-memory store");
                Self::fallback(config)
            }
            Err(e) => {
                warn!(error = %e, "cannot read store meta info, switching to in-memory store");
                Self::fallback(config)
            }
        }
    }

    /// Create an ephemeral in-memory store.
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let conn = Connection::open_in_memory().map_err(|e| Error::connection(e.to_string()))?;
        Self::finish_init(conn, config, true, true)
    }

    fn fallback(config: StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::connection(e.to_string()))?;
        Self::finish_init(conn, config, true, true)
    }

    fn assess(conn: &Connection) -> Result<Disposition> {
        if schema::is_empty_db(conn)? {
            return Ok(Disposition::Fresh);
        }
        match schema::stored_version(conn)? {
            Some(v) if v == SCHEMA_VERSION => Ok(Disposition::Current),
            Some(v) => Ok(Disposition::Unusable(format!(
                "unrecognized schema version {v} (expected {SCHEMA_VERSION})"
            ))),
            None => {
                if schema::is_legacy_v1(conn)? {
                    Ok(Disposition::Legacy)
                } else {
                    Ok(Disposition::Unusable(
                        "no version stamp and no recognized legacy layout".into(),
                    ))
                }
            }
        }
    }

    fn finish_init(
        conn: Connection,
        mut config: StoreConfig,
        tabula_rasa: bool,
        ephemeral: bool,
    ) -> Result<Self> {
        // Performance pragmas, applied once before any structure work.
        conn.pragma_update(None, "page_size", config.page_size as i64)?;
        conn.pragma_update(None, "cache_size", config.cache_size)?;
        match config.optimization {
            Optimization::Safety => {
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.pragma_update(None, "synchronous", "NORMAL")?;
            }
            Optimization::Performance => {
                conn.pragma_update(None, "synchronous", "OFF")?;
                conn.pragma_update(None, "journal_mode", "OFF")?;
                conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
            }
        }
        conn.set_prepared_statement_cache_capacity(64);

        let mut max_cycle = 1u64;
        let mut node_count = 0u64;
        let mut edge_count = 0u64;

        if tabula_rasa {
            run_in_txn(&conn, |c| {
                schema::create_structure(c)?;
                seed_variables(c, &config)
            })?;
        } else {
            max_cycle = variables::get(&conn, Variable::MaxCycle)?.unwrap_or(1).max(1) as u64;
            node_count = variables::get(&conn, Variable::NodeCount)?.unwrap_or(0) as u64;
            edge_count = variables::get(&conn, Variable::EdgeCount)?.unwrap_or(0) as u64;
            // Stored activation settings win over the caller's, so a store
            // resumes under the model it was built with.
            if let Some(t) = variables::get(&conn, Variable::ActThreshold)? {
                config.activation.threshold = t as u64;
            }
            if let Some(tag) = variables::get(&conn, Variable::ActMode)? {
                if let Some(mode) = mode_from_tag(tag) {
                    config.activation.mode = mode;
                }
            }
        }

        let lti_counter = lti::max_id(&conn)?.max(config.initial_lti_id - 1);

        if config.lazy_commit {
            conn.execute_batch("BEGIN")?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
            symbols: SymbolCache::default(),
            lti_counter,
            max_cycle,
            node_count,
            edge_count,
            generation: next_generation(),
            ephemeral,
        })
    }

    /// Attach generation. Bumped by every open and by [`reinit`](Self::reinit);
    /// ids cached against an older generation must be looked up again.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True when the store lives in memory (requested, or schema fallback).
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ==================== Symbol hashing ====================

    /// Map a constant value to its stable id, inserting on first sight.
    /// Repeated calls within one attach generation hit the client cache.
    pub fn intern(&mut self, value: &SymbolValue) -> Result<SymbolHash> {
        if let Some(hash) = self.symbols.get(value, self.generation) {
            return Ok(hash);
        }
        let hash = self.mutate(|conn| symbol::intern(conn, value))?;
        self.symbols.put(value, hash, self.generation);
        Ok(hash)
    }

    /// Id of an already-interned value, without inserting.
    pub fn lookup_symbol(&self, value: &SymbolValue) -> Result<Option<SymbolHash>> {
        self.with_conn(|conn| symbol::lookup(conn, value))
    }

    /// Exact inverse of [`intern`](Self::intern).
    pub fn resolve_symbol(&self, hash: SymbolHash) -> Result<SymbolValue> {
        self.with_conn(|conn| symbol::resolve(conn, hash))
    }

    // ==================== Durability ====================

    /// Persist counters and, in lazy mode, commit the long-lived
    /// transaction and immediately open a new one.
    pub fn checkpoint(&mut self) -> Result<()> {
        let counters = self.counters();
        let lazy = self.config.lazy_commit;
        self.with_conn(|conn| {
            let commit = |c: &Connection| -> Result<()> {
                store_globals(c, &counters)?;
                if lazy {
                    c.execute_batch("COMMIT")?;
                    c.execute_batch("BEGIN")?;
                }
                Ok(())
            };
            if lazy {
                commit(conn)
            } else {
                run_in_txn(conn, |c| store_globals(c, &counters))
            }
        })
    }

    /// Persist counters, commit, and release the store.
    pub fn close(self) -> Result<()> {
        let counters = self.counters();
        let lazy = self.config.lazy_commit;
        self.with_conn(|conn| {
            store_globals(conn, &counters)?;
            if lazy {
                conn.execute_batch("COMMIT")?;
            }
            Ok(())
        })
    }

    /// Write a consistent copy of the store to `path`.
    ///
    /// Acts as a checkpoint: in lazy mode the open transaction is committed
    /// before the copy and a fresh one is begun after it.
    pub fn backup(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let counters = self.counters();
        let lazy = self.config.lazy_commit;
        let target = path.as_ref().to_string_lossy().into_owned();
        self.with_conn(|conn| {
            store_globals(conn, &counters)?;
            if lazy {
                conn.execute_batch("COMMIT")?;
            }
            let copied = conn.execute("VACUUM INTO ?1", params![target]);
            if lazy {
                conn.execute_batch("BEGIN")?;
            }
            copied?;
            Ok(())
        })
    }

    /// Erase all contents and reinitialize the schema. Bumps the attach
    /// generation so every cached symbol id is invalidated.
    pub fn reinit(&mut self) -> Result<()> {
        let lazy = self.config.lazy_commit;
        let config = self.config.clone();
        self.with_conn(|conn| {
            if lazy {
                // A failed statement may already have poisoned the open
                // transaction; a reinit starts from a clean slate anyway.
                let _ = conn.execute_batch("COMMIT");
            }
            run_in_txn(conn, |c| {
                schema::drop_structure(c)?;
                schema::create_structure(c)?;
                seed_variables(c, &config)
            })?;
            if lazy {
                conn.execute_batch("BEGIN")?;
            }
            Ok(())
        })?;
        self.lti_counter = self.config.initial_lti_id - 1;
        self.max_cycle = 1;
        self.node_count = 0;
        self.edge_count = 0;
        self.generation = next_generation();
        self.symbols.clear();
        Ok(())
    }

    // ==================== Statistics ====================

    pub fn stats(&self) -> Result<StoreStats> {
        let symbols = self.with_conn(symbol::count)?;
        Ok(StoreStats {
            nodes: self.node_count,
            edges: self.edge_count,
            symbols,
            next_cycle: self.max_cycle,
            next_lti_id: self.lti_counter + 1,
            ephemeral: self.ephemeral,
            generated_at: Utc::now(),
        })
    }

    /// Force the node id allocator so the next automatic allocation starts
    /// at `next_id` (subject to collision skipping).
    pub fn set_id_counter(&mut self, next_id: u64) {
        self.lti_counter = next_id.saturating_sub(1);
    }

    // ==================== Internal plumbing ====================

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("connection lock poisoned: {e}")))?;
        f(&conn)
    }

    /// Run a mutating sequence under the configured durability mode: its
    /// own transaction when eager, the open long-lived one when lazy.
    pub(crate) fn mutate<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("connection lock poisoned: {e}")))?;
        if self.config.lazy_commit {
            f(&conn)
        } else {
            run_in_txn(&conn, f)
        }
    }

    pub(crate) fn counters(&self) -> Counters {
        Counters {
            lti_counter: self.lti_counter,
            max_cycle: self.max_cycle,
            node_count: self.node_count,
            edge_count: self.edge_count,
        }
    }

    pub(crate) fn apply_counters(&mut self, counters: Counters) {
        self.lti_counter = counters.lti_counter;
        self.max_cycle = counters.max_cycle;
        self.node_count = counters.node_count;
        self.edge_count = counters.edge_count;
    }
}

fn run_in_txn<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn seed_variables(conn: &Connection, config: &StoreConfig) -> Result<()> {
    variables::create(conn, Variable::MaxCycle, 1)?;
    variables::create(conn, Variable::NodeCount, 0)?;
    variables::create(conn, Variable::EdgeCount, 0)?;
    variables::create(conn, Variable::ActThreshold, config.activation.threshold as i64)?;
    variables::create(conn, Variable::ActMode, mode_tag(config.activation.mode))?;
    Ok(())
}

fn store_globals(conn: &Connection, counters: &Counters) -> Result<()> {
    variables::set(conn, Variable::MaxCycle, counters.max_cycle as i64)?;
    variables::set(conn, Variable::NodeCount, counters.node_count as i64)?;
    variables::set(conn, Variable::EdgeCount, counters.edge_count as i64)?;
    Ok(())
}

fn mode_tag(mode: ActivationMode) -> i64 {
    match mode {
        ActivationMode::Recency => 1,
        ActivationMode::Frequency => 2,
        ActivationMode::BaseLevel => 3,
    }
}

fn mode_from_tag(tag: i64) -> Option<ActivationMode> {
    match tag {
        1 => Some(ActivationMode::Recency),
        2 => Some(ActivationMode::Frequency),
        3 => Some(ActivationMode::BaseLevel),
        _ => None,
    }
}

/// Snapshot of the store's size and bookkeeping state.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub nodes: u64,
    pub edges: u64,
    pub symbols: u64,
    pub next_cycle: u64,
    pub next_lti_id: u64,
    pub ephemeral: bool,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn in_memory_store_is_ephemeral() {
        let store = SemanticStore::in_memory(StoreConfig::default()).unwrap();
        assert!(store.is_ephemeral());
        assert_eq!(store.stats().unwrap().nodes, 0);
    }

    #[test]
    fn file_store_persists_across_sessions() {
        let dir = dir();
        let path = dir.path().join("ltm.db");

        let mut store = SemanticStore::open(&path, StoreConfig::default()).unwrap();
        assert!(!store.is_ephemeral());
        let hash = store.intern(&"color".into()).unwrap();
        let id = store.allocate_lti().unwrap();
        store.close().unwrap();

        let reopened = SemanticStore::open(&path, StoreConfig::default()).unwrap();
        assert_eq!(
            reopened.resolve_symbol(hash).unwrap(),
            SymbolValue::Str("color".into())
        );
        assert!(reopened.lti_exists(id).unwrap());
        assert_eq!(reopened.stats().unwrap().nodes, 1);
    }

    #[test]
    fn unrecognized_version_falls_back_to_memory() {
        let dir = dir();
        let path = dir.path().join("weird.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE versions (system TEXT PRIMARY KEY, version_number TEXT);
                 INSERT INTO versions VALUES ('ltm', '9.9');",
            )
            .unwrap();
        }

        let store = SemanticStore::open(&path, StoreConfig::default()).unwrap();
        assert!(store.is_ephemeral());
        // Original file untouched.
        let conn = Connection::open(&path).unwrap();
        let v: String = conn
            .query_row(
                "SELECT version_number FROM versions WHERE system='ltm'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(v, "9.9");
    }

    #[test]
    fn garbage_file_falls_back_to_memory() {
        let dir = dir();
        let path = dir.path().join("garbage.db");
        fs::write(&path, b"this is not a database").unwrap();

        let store = SemanticStore::open(&path, StoreConfig::default()).unwrap();
        assert!(store.is_ephemeral());
    }

    #[test]
    fn legacy_store_is_migrated_on_open() {
        let dir = dir();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            schema::seed_legacy_v1(&conn);
        }

        let store = SemanticStore::open(&path, StoreConfig::default()).unwrap();
        assert!(!store.is_ephemeral());
        assert!(store.lti_exists(1).unwrap());
        assert_eq!(
            store.lookup_symbol(&"color".into()).unwrap(),
            Some(1)
        );
        // Counters restored from the migrated variables table.
        assert_eq!(store.stats().unwrap().nodes, 1);
        assert_eq!(store.stats().unwrap().edges, 2);
    }

    #[test]
    fn append_off_erases_existing_contents() {
        let dir = dir();
        let path = dir.path().join("ltm.db");

        let mut store = SemanticStore::open(&path, StoreConfig::default()).unwrap();
        store.allocate_lti().unwrap();
        store.close().unwrap();

        let config = StoreConfig {
            append: false,
            ..StoreConfig::default()
        };
        let store = SemanticStore::open(&path, config).unwrap();
        assert_eq!(store.stats().unwrap().nodes, 0);
    }

    #[test]
    fn eager_commit_survives_simulated_crash() {
        let dir = dir();
        let path = dir.path().join("ltm.db");

        let mut store = SemanticStore::open(&path, StoreConfig::eager()).unwrap();
        let id = store.allocate_lti().unwrap();
        drop(store); // no close: simulated crash

        let reopened = SemanticStore::open(&path, StoreConfig::eager()).unwrap();
        assert!(reopened.lti_exists(id).unwrap());
    }

    #[test]
    fn lazy_commit_loses_uncheckpointed_work_on_crash() {
        let dir = dir();
        let path = dir.path().join("ltm.db");

        let mut store = SemanticStore::open(&path, StoreConfig::default()).unwrap();
        let kept = store.allocate_lti().unwrap();
        store.checkpoint().unwrap();
        let lost = store.allocate_lti().unwrap();
        drop(store); // open transaction rolls back

        let reopened = SemanticStore::open(&path, StoreConfig::default()).unwrap();
        assert!(reopened.lti_exists(kept).unwrap());
        assert!(!reopened.lti_exists(lost).unwrap());
    }

    #[test]
    fn backup_produces_openable_copy() {
        let dir = dir();
        let path = dir.path().join("ltm.db");
        let copy = dir.path().join("backup.db");

        let mut store = SemanticStore::open(&path, StoreConfig::default()).unwrap();
        let id = store.allocate_lti().unwrap();
        store.backup(&copy).unwrap();
        // Work continues after the checkpoint.
        store.allocate_lti().unwrap();
        store.close().unwrap();

        let restored = SemanticStore::open(&copy, StoreConfig::default()).unwrap();
        assert!(restored.lti_exists(id).unwrap());
    }

    #[test]
    fn reinit_clears_everything_and_bumps_generation() {
        let mut store = SemanticStore::in_memory(StoreConfig::default()).unwrap();
        store.intern(&"color".into()).unwrap();
        store.allocate_lti().unwrap();
        let generation = store.generation();

        store.reinit().unwrap();

        assert!(store.generation() > generation);
        assert_eq!(store.stats().unwrap().nodes, 0);
        assert_eq!(store.stats().unwrap().symbols, 0);
        assert_eq!(store.lookup_symbol(&"color".into()).unwrap(), None);
    }

    #[test]
    fn stored_activation_settings_win_on_reattach() {
        let dir = dir();
        let path = dir.path().join("ltm.db");

        let config =
            StoreConfig::default().with_activation_mode(ActivationMode::BaseLevel);
        let store = SemanticStore::open(&path, config).unwrap();
        store.close().unwrap();

        // Reattach with a different requested mode; the stored one sticks.
        let store = SemanticStore::open(&path, StoreConfig::default()).unwrap();
        assert_eq!(store.config().activation.mode, ActivationMode::BaseLevel);
    }
}
