//! Symbol hashing: stable integer ids for typed constant values.
//!
//! In-memory symbol identity is only reliable for the lifetime of the host
//! process, so durable edges reference symbols through a lookup table keyed
//! by value. Ids are allocated from the type table's rowid and never reused
//! while the store is attached.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Stable integer id of an interned constant.
pub type SymbolHash = u64;

/// Type tag of a stored constant, as persisted in the type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    Int = 1,
    Float = 2,
    Str = 3,
}

impl SymbolType {
    pub(crate) fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            1 => Some(Self::Int),
            2 => Some(Self::Float),
            3 => Some(Self::Str),
            _ => None,
        }
    }
}

/// A typed constant value: attribute or edge value in the semantic graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SymbolValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl SymbolValue {
    pub fn symbol_type(&self) -> SymbolType {
        match self {
            Self::Int(_) => SymbolType::Int,
            Self::Float(_) => SymbolType::Float,
            Self::Str(_) => SymbolType::Str,
        }
    }

    /// Numeric view for math cues; strings are not numeric.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    /// Deterministic ordering key (type tag, then rendered value) used when
    /// serializing edges.
    pub(crate) fn sort_key(&self) -> (u8, String) {
        match self {
            Self::Int(v) => (1, format!("{v:020}")),
            Self::Float(v) => (2, format!("{v:?}")),
            Self::Str(v) => (3, v.clone()),
        }
    }
}

impl fmt::Display for SymbolValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for SymbolValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SymbolValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SymbolValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for SymbolValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Look up the id of an already-interned value, without inserting.
pub(crate) fn lookup(conn: &Connection, value: &SymbolValue) -> Result<Option<SymbolHash>> {
    let found = match value {
        SymbolValue::Int(v) => conn
            .query_row(
                "SELECT s_id FROM ltm_symbols_integer WHERE symbol_value=?1",
                params![v],
                |row| row.get::<_, u64>(0),
            )
            .optional()?,
        SymbolValue::Float(v) => conn
            .query_row(
                "SELECT s_id FROM ltm_symbols_float WHERE symbol_value=?1",
                params![v],
                |row| row.get::<_, u64>(0),
            )
            .optional()?,
        SymbolValue::Str(v) => conn
            .query_row(
                "SELECT s_id FROM ltm_symbols_string WHERE symbol_value=?1",
                params![v],
                |row| row.get::<_, u64>(0),
            )
            .optional()?,
    };
    Ok(found)
}

/// Intern a value: look up by value first, allocate a fresh id only on miss.
///
/// The type row is inserted first; its rowid becomes the symbol id and the
/// matching value-table row is inserted at the same id. Runs inside the
/// caller's active transaction.
pub(crate) fn intern(conn: &Connection, value: &SymbolValue) -> Result<SymbolHash> {
    if let Some(id) = lookup(conn, value)? {
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO ltm_symbols_type (symbol_type) VALUES (?1)",
        params![value.symbol_type() as i64],
    )?;
    let id = conn.last_insert_rowid() as u64;

    match value {
        SymbolValue::Int(v) => conn.execute(
            "INSERT INTO ltm_symbols_integer (s_id, symbol_value) VALUES (?1, ?2)",
            params![id, v],
        )?,
        SymbolValue::Float(v) => conn.execute(
            "INSERT INTO ltm_symbols_float (s_id, symbol_value) VALUES (?1, ?2)",
            params![id, v],
        )?,
        SymbolValue::Str(v) => conn.execute(
            "INSERT INTO ltm_symbols_string (s_id, symbol_value) VALUES (?1, ?2)",
            params![id, v],
        )?,
    };

    Ok(id)
}

/// Exact inverse of [`intern`]. Fails only on caller error: committed ids
/// are never left dangling.
pub(crate) fn resolve(conn: &Connection, hash: SymbolHash) -> Result<SymbolValue> {
    let tag: Option<i64> = conn
        .query_row(
            "SELECT symbol_type FROM ltm_symbols_type WHERE s_id=?1",
            params![hash],
            |row| row.get(0),
        )
        .optional()?;

    let symbol_type = tag
        .and_then(SymbolType::from_tag)
        .ok_or_else(|| Error::integrity(format!("unknown symbol hash {hash}")))?;

    let value = match symbol_type {
        SymbolType::Int => SymbolValue::Int(conn.query_row(
            "SELECT symbol_value FROM ltm_symbols_integer WHERE s_id=?1",
            params![hash],
            |row| row.get(0),
        )?),
        SymbolType::Float => SymbolValue::Float(conn.query_row(
            "SELECT symbol_value FROM ltm_symbols_float WHERE s_id=?1",
            params![hash],
            |row| row.get(0),
        )?),
        SymbolType::Str => SymbolValue::Str(conn.query_row(
            "SELECT symbol_value FROM ltm_symbols_string WHERE s_id=?1",
            params![hash],
            |row| row.get(0),
        )?),
    };

    Ok(value)
}

/// Count of interned symbols.
pub(crate) fn count(conn: &Connection) -> Result<u64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM ltm_symbols_type", [], |row| row.get(0))?)
}

/// Hashable identity for the client-side cache. Floats are keyed by bit
/// pattern; exact equality is what the value tables enforce anyway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Int(i64),
    Float(u64),
    Str(String),
}

impl CacheKey {
    fn of(value: &SymbolValue) -> Self {
        match value {
            SymbolValue::Int(v) => Self::Int(*v),
            SymbolValue::Float(v) => Self::Float(v.to_bits()),
            SymbolValue::Str(v) => Self::Str(v.clone()),
        }
    }
}

/// Client-side symbol cache: value → (id, generation).
///
/// Entries stamped with an older generation than the store's current one
/// force a fresh lookup, so reopening or reinitializing the store (which
/// bumps the generation) invalidates every cached id at once.
#[derive(Debug, Default)]
pub(crate) struct SymbolCache {
    entries: HashMap<CacheKey, (SymbolHash, u64)>,
}

impl SymbolCache {
    pub(crate) fn get(&self, value: &SymbolValue, generation: u64) -> Option<SymbolHash> {
        match self.entries.get(&CacheKey::of(value)) {
            Some(&(hash, stamped)) if stamped == generation => Some(hash),
            _ => None,
        }
    }

    pub(crate) fn put(&mut self, value: &SymbolValue, hash: SymbolHash, generation: u64) {
        self.entries.insert(CacheKey::of(value), (hash, generation));
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
