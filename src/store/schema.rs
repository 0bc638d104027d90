//! Physical schema: tables, indices, version stamping, and the in-place
//! migration from the recognized legacy layout.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// System key under which the schema version is stamped.
pub const SCHEMA_SYSTEM: &str = "ltm";

/// Schema version this implementation reads and writes.
pub const SCHEMA_VERSION: &str = "2.0";

const TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS versions (system TEXT PRIMARY KEY, version_number TEXT)",
    "CREATE TABLE IF NOT EXISTS ltm_variables (variable_id INTEGER PRIMARY KEY, variable_value INTEGER)",
    "CREATE TABLE IF NOT EXISTS ltm_symbols_type (s_id INTEGER PRIMARY KEY, symbol_type INTEGER)",
    "CREATE TABLE IF NOT EXISTS ltm_symbols_integer (s_id INTEGER PRIMARY KEY, symbol_value INTEGER)",
    "CREATE TABLE IF NOT EXISTS ltm_symbols_float (s_id INTEGER PRIMARY KEY, symbol_value REAL)",
    "CREATE TABLE IF NOT EXISTS ltm_symbols_string (s_id INTEGER PRIMARY KEY, symbol_value TEXT)",
    "CREATE TABLE IF NOT EXISTS ltm_lti (lti_id INTEGER PRIMARY KEY, total_augmentations INTEGER, \
     activation_value REAL, activations_total INTEGER, activations_last INTEGER, activations_first INTEGER)",
    "CREATE TABLE IF NOT EXISTS ltm_activation_history (lti_id INTEGER PRIMARY KEY, \
     t1 INTEGER, t2 INTEGER, t3 INTEGER, t4 INTEGER, t5 INTEGER, \
     t6 INTEGER, t7 INTEGER, t8 INTEGER, t9 INTEGER, t10 INTEGER)",
    // value_constant_s_id/value_lti_id use a 0 sentinel instead of NULL so
    // the covering indices stay usable for equality probes.
    "CREATE TABLE IF NOT EXISTS ltm_augmentations (lti_id INTEGER, attribute_s_id INTEGER, \
     value_constant_s_id INTEGER, value_lti_id INTEGER, activation_value REAL)",
    "CREATE TABLE IF NOT EXISTS ltm_attribute_frequency (attribute_s_id INTEGER PRIMARY KEY, edge_frequency INTEGER)",
    "CREATE TABLE IF NOT EXISTS ltm_constant_frequency (attribute_s_id INTEGER, \
     value_constant_s_id INTEGER, edge_frequency INTEGER)",
    "CREATE TABLE IF NOT EXISTS ltm_lti_frequency (attribute_s_id INTEGER, \
     value_lti_id INTEGER, edge_frequency INTEGER)",
];

const INDICES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS ltm_symbols_int_const ON ltm_symbols_integer (symbol_value)",
    "CREATE UNIQUE INDEX IF NOT EXISTS ltm_symbols_float_const ON ltm_symbols_float (symbol_value)",
    "CREATE UNIQUE INDEX IF NOT EXISTS ltm_symbols_str_const ON ltm_symbols_string (symbol_value)",
    "CREATE INDEX IF NOT EXISTS ltm_lti_t ON ltm_lti (activations_last)",
    "CREATE INDEX IF NOT EXISTS ltm_augmentations_parent_attr_val_lti \
     ON ltm_augmentations (lti_id, attribute_s_id, value_constant_s_id, value_lti_id)",
    "CREATE INDEX IF NOT EXISTS ltm_augmentations_attr_val_lti_act \
     ON ltm_augmentations (attribute_s_id, value_constant_s_id, value_lti_id, activation_value)",
    "CREATE INDEX IF NOT EXISTS ltm_augmentations_attr_act \
     ON ltm_augmentations (attribute_s_id, activation_value)",
    "CREATE UNIQUE INDEX IF NOT EXISTS ltm_constant_frequency_attr_val \
     ON ltm_constant_frequency (attribute_s_id, value_constant_s_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS ltm_lti_frequency_attr_val \
     ON ltm_lti_frequency (attribute_s_id, value_lti_id)",
];

const DROP_TABLES: &[&str] = &[
    "DROP TABLE IF EXISTS ltm_variables",
    "DROP TABLE IF EXISTS ltm_symbols_type",
    "DROP TABLE IF EXISTS ltm_symbols_integer",
    "DROP TABLE IF EXISTS ltm_symbols_float",
    "DROP TABLE IF EXISTS ltm_symbols_string",
    "DROP TABLE IF EXISTS ltm_lti",
    "DROP TABLE IF EXISTS ltm_activation_history",
    "DROP TABLE IF EXISTS ltm_augmentations",
    "DROP TABLE IF EXISTS ltm_attribute_frequency",
    "DROP TABLE IF EXISTS ltm_constant_frequency",
    "DROP TABLE IF EXISTS ltm_lti_frequency",
];

/// Create all tables and indices and stamp the current version. Safe to
/// call on a database that already has the structure.
pub(crate) fn create_structure(conn: &Connection) -> Result<()> {
    for sql in TABLES.iter().chain(INDICES) {
        conn.execute(sql, [])?;
    }
    conn.execute(
        "REPLACE INTO versions (system, version_number) VALUES (?1, ?2)",
        params![SCHEMA_SYSTEM, SCHEMA_VERSION],
    )?;
    Ok(())
}

/// Drop every store table and clear the version stamp (tabula rasa /
/// reinit path).
pub(crate) fn drop_structure(conn: &Connection) -> Result<()> {
    for sql in DROP_TABLES {
        conn.execute(sql, [])?;
    }
    conn.execute(
        "DELETE FROM versions WHERE system=?1",
        params![SCHEMA_SYSTEM],
    )
    .ok(); // versions may not exist yet
    Ok(())
}

/// True when the database file contains no objects at all.
pub(crate) fn is_empty_db(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table','index')",
        [],
        |row| row.get(0),
    )?;
    Ok(count == 0)
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Version stamped in the store, if readable.
pub(crate) fn stored_version(conn: &Connection) -> Result<Option<String>> {
    if !table_exists(conn, "versions")? {
        return Ok(None);
    }
    let version = conn
        .query_row(
            "SELECT version_number FROM versions WHERE system=?1",
            params![SCHEMA_SYSTEM],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(version)
}

/// True when the database carries the recognized legacy (v1) layout.
pub(crate) fn is_legacy_v1(conn: &Connection) -> Result<bool> {
    table_exists(conn, "ltm1_signature")
}

/// In-place migration from the legacy v1 layout: create the current
/// tables, copy every row, drop the legacy tables, rebuild indices, and
/// stamp the version, all inside one transaction.
pub(crate) fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
         CREATE TABLE ltm_symbols_type (s_id INTEGER PRIMARY KEY, symbol_type INTEGER);
         INSERT INTO ltm_symbols_type (s_id, symbol_type) SELECT id, sym_type FROM ltm1_symbols_type;
         DROP TABLE ltm1_symbols_type;

         CREATE TABLE ltm_symbols_integer (s_id INTEGER PRIMARY KEY, symbol_value INTEGER);
         INSERT INTO ltm_symbols_integer (s_id, symbol_value) SELECT id, sym_const FROM ltm1_symbols_int;
         DROP TABLE ltm1_symbols_int;

         CREATE TABLE ltm_symbols_float (s_id INTEGER PRIMARY KEY, symbol_value REAL);
         INSERT INTO ltm_symbols_float (s_id, symbol_value) SELECT id, sym_const FROM ltm1_symbols_float;
         DROP TABLE ltm1_symbols_float;

         CREATE TABLE ltm_symbols_string (s_id INTEGER PRIMARY KEY, symbol_value TEXT);
         INSERT INTO ltm_symbols_string (s_id, symbol_value) SELECT id, sym_const FROM ltm1_symbols_str;
         DROP TABLE ltm1_symbols_str;

         CREATE TABLE ltm_lti (lti_id INTEGER PRIMARY KEY, total_augmentations INTEGER, \
             activation_value REAL, activations_total INTEGER, activations_last INTEGER, activations_first INTEGER);
         INSERT INTO ltm_lti (lti_id, total_augmentations, activation_value, activations_total, activations_last, activations_first) \
             SELECT id, child_ct, act_value, access_n, access_t, access_1 FROM ltm1_lti;
         DROP TABLE ltm1_lti;

         CREATE TABLE ltm_activation_history (lti_id INTEGER PRIMARY KEY, \
             t1 INTEGER, t2 INTEGER, t3 INTEGER, t4 INTEGER, t5 INTEGER, \
             t6 INTEGER, t7 INTEGER, t8 INTEGER, t9 INTEGER, t10 INTEGER);
         INSERT INTO ltm_activation_history (lti_id, t1, t2, t3, t4, t5, t6, t7, t8, t9, t10) \
             SELECT id, t1, t2, t3, t4, t5, t6, t7, t8, t9, t10 FROM ltm1_history;
         DROP TABLE ltm1_history;

         CREATE TABLE ltm_augmentations (lti_id INTEGER, attribute_s_id INTEGER, \
             value_constant_s_id INTEGER, value_lti_id INTEGER, activation_value REAL);
         INSERT INTO ltm_augmentations (lti_id, attribute_s_id, value_constant_s_id, value_lti_id, activation_value) \
             SELECT parent_id, attr, val_const, val_lti, act_value FROM ltm1_web;
         DROP TABLE ltm1_web;

         CREATE TABLE ltm_attribute_frequency (attribute_s_id INTEGER PRIMARY KEY, edge_frequency INTEGER);
         INSERT INTO ltm_attribute_frequency (attribute_s_id, edge_frequency) SELECT attr, ct FROM ltm1_ct_attr;
         DROP TABLE ltm1_ct_attr;

         CREATE TABLE ltm_constant_frequency (attribute_s_id INTEGER, value_constant_s_id INTEGER, edge_frequency INTEGER);
         INSERT INTO ltm_constant_frequency (attribute_s_id, value_constant_s_id, edge_frequency) \
             SELECT attr, val_const, ct FROM ltm1_ct_const;
         DROP TABLE ltm1_ct_const;

         CREATE TABLE ltm_lti_frequency (attribute_s_id INTEGER, value_lti_id INTEGER, edge_frequency INTEGER);
         INSERT INTO ltm_lti_frequency (attribute_s_id, value_lti_id, edge_frequency) \
             SELECT attr, val_lti, ct FROM ltm1_ct_lti;
         DROP TABLE ltm1_ct_lti;

         CREATE TABLE ltm_variables (variable_id INTEGER PRIMARY KEY, variable_value INTEGER);
         INSERT INTO ltm_variables (variable_id, variable_value) SELECT id, value FROM ltm1_vars;
         DROP TABLE ltm1_vars;
         DROP TABLE ltm1_signature;

         CREATE TABLE IF NOT EXISTS versions (system TEXT PRIMARY KEY, version_number TEXT);
         REPLACE INTO versions (system, version_number) VALUES ('ltm', '2.0');

         CREATE UNIQUE INDEX ltm_symbols_int_const ON ltm_symbols_integer (symbol_value);
         CREATE UNIQUE INDEX ltm_symbols_float_const ON ltm_symbols_float (symbol_value);
         CREATE UNIQUE INDEX ltm_symbols_str_const ON ltm_symbols_string (symbol_value);
         CREATE INDEX ltm_lti_t ON ltm_lti (activations_last);
         CREATE INDEX ltm_augmentations_parent_attr_val_lti \
             ON ltm_augmentations (lti_id, attribute_s_id, value_constant_s_id, value_lti_id);
         CREATE INDEX ltm_augmentations_attr_val_lti_act \
             ON ltm_augmentations (attribute_s_id, value_constant_s_id, value_lti_id, activation_value);
         CREATE INDEX ltm_augmentations_attr_act ON ltm_augmentations (attribute_s_id, activation_value);
         CREATE UNIQUE INDEX ltm_constant_frequency_attr_val \
             ON ltm_constant_frequency (attribute_s_id, value_constant_s_id);
         CREATE UNIQUE INDEX ltm_lti_frequency_attr_val ON ltm_lti_frequency (attribute_s_id, value_lti_id);
         COMMIT;",
    )
    .map_err(|e| Error::schema(format!("legacy migration failed: {e}")))?;
    Ok(())
}

/// Build a tiny legacy v1 database by hand. Shared by migration tests here
/// and the open-path tests in the store module.
#[cfg(test)]
pub(crate) fn seed_legacy_v1(conn: &Connection) {
    conn.execute_batch(
        "CREATE TABLE ltm1_signature (uid INTEGER);
         CREATE TABLE ltm1_symbols_type (id INTEGER PRIMARY KEY, sym_type INTEGER);
         CREATE TABLE ltm1_symbols_int (id INTEGER PRIMARY KEY, sym_const INTEGER);
         CREATE TABLE ltm1_symbols_float (id INTEGER PRIMARY KEY, sym_const REAL);
         CREATE TABLE ltm1_symbols_str (id INTEGER PRIMARY KEY, sym_const TEXT);
         CREATE TABLE ltm1_lti (id INTEGER PRIMARY KEY, child_ct INTEGER, act_value REAL, \
             access_n INTEGER, access_t INTEGER, access_1 INTEGER);
         CREATE TABLE ltm1_history (id INTEGER PRIMARY KEY, t1 INTEGER, t2 INTEGER, t3 INTEGER, \
             t4 INTEGER, t5 INTEGER, t6 INTEGER, t7 INTEGER, t8 INTEGER, t9 INTEGER, t10 INTEGER);
         CREATE TABLE ltm1_web (parent_id INTEGER, attr INTEGER, val_const INTEGER, \
             val_lti INTEGER, act_value REAL);
         CREATE TABLE ltm1_ct_attr (attr INTEGER PRIMARY KEY, ct INTEGER);
         CREATE TABLE ltm1_ct_const (attr INTEGER, val_const INTEGER, ct INTEGER);
         CREATE TABLE ltm1_ct_lti (attr INTEGER, val_lti INTEGER, ct INTEGER);
         CREATE TABLE ltm1_vars (id INTEGER PRIMARY KEY, value INTEGER);

         INSERT INTO ltm1_symbols_type VALUES (1, 3), (2, 3), (3, 1);
         INSERT INTO ltm1_symbols_str VALUES (1, 'color'), (2, 'red');
         INSERT INTO ltm1_symbols_int VALUES (3, 5);
         INSERT INTO ltm1_lti VALUES (1, 2, 0.0, 0, 0, 0);
         INSERT INTO ltm1_history VALUES (1, 0,0,0,0,0,0,0,0,0,0);
         INSERT INTO ltm1_web VALUES (1, 1, 2, 0, 0.0), (1, 1, 3, 0, 0.0);
         INSERT INTO ltm1_ct_attr VALUES (1, 2);
         INSERT INTO ltm1_ct_const VALUES (1, 2, 1), (1, 3, 1);
         INSERT INTO ltm1_vars VALUES (1, 1), (2, 1), (3, 2), (4, 100), (5, 0);",
    )
    .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structure_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_structure(&conn).unwrap();
        create_structure(&conn).unwrap();
        assert_eq!(stored_version(&conn).unwrap().as_deref(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn empty_db_detected() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(is_empty_db(&conn).unwrap());
        create_structure(&conn).unwrap();
        assert!(!is_empty_db(&conn).unwrap());
    }

    #[test]
    fn drop_clears_version() {
        let conn = Connection::open_in_memory().unwrap();
        create_structure(&conn).unwrap();
        drop_structure(&conn).unwrap();
        assert_eq!(stored_version(&conn).unwrap(), None);
    }

    #[test]
    fn migration_preserves_rows_and_drops_legacy_tables() {
        let conn = Connection::open_in_memory().unwrap();
        seed_legacy_v1(&conn);
        assert!(is_legacy_v1(&conn).unwrap());

        migrate_v1_to_v2(&conn).unwrap();

        assert_eq!(stored_version(&conn).unwrap().as_deref(), Some(SCHEMA_VERSION));
        assert!(!is_legacy_v1(&conn).unwrap());

        let symbols: i64 = conn
            .query_row("SELECT COUNT(*) FROM ltm_symbols_type", [], |r| r.get(0))
            .unwrap();
        let edges: i64 = conn
            .query_row("SELECT COUNT(*) FROM ltm_augmentations", [], |r| r.get(0))
            .unwrap();
        let nodes: i64 = conn
            .query_row("SELECT COUNT(*) FROM ltm_lti", [], |r| r.get(0))
            .unwrap();
        assert_eq!(symbols, 3);
        assert_eq!(edges, 2);
        assert_eq!(nodes, 1);

        let legacy: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name LIKE 'ltm1_%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(legacy, 0);
    }
}
