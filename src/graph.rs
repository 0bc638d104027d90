//! Graph edges and the installation engine: moving structure between the
//! durable store and a working memory.
//!
//! Edges (augmentations) reference interned symbols for attributes and
//! constant values, and node ids for links. The frequency tables are kept
//! exactly in step with the edge multiset on every insert and delete; the
//! query engine depends on that for its selectivity ordering.

use crate::error::{Error, Result};
use crate::lti::{self, LtiId};
use crate::store::{Counters, SemanticStore};
use crate::symbol::{self, SymbolHash};
use crate::wm::{WmId, WmTriple, WmValue, WorkingMemory};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::warn;

/// Stored value side of an edge: an interned constant or a node link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoredValue {
    Constant(SymbolHash),
    Lti(LtiId),
}

impl StoredValue {
    /// (value_constant_s_id, value_lti_id) column pair; 0 is the sentinel
    /// for the unused side.
    fn columns(self) -> (u64, u64) {
        match self {
            Self::Constant(hash) => (hash, 0),
            Self::Lti(id) => (0, id),
        }
    }
}

pub(crate) fn has_augmentation(
    conn: &Connection,
    parent: LtiId,
    attribute: SymbolHash,
    value: StoredValue,
) -> Result<bool> {
    let (constant, link) = value.columns();
    let found: Option<i64> = conn
        .prepare_cached(
            "SELECT 1 FROM ltm_augmentations \
             WHERE lti_id=?1 AND attribute_s_id=?2 AND value_constant_s_id=?3 AND value_lti_id=?4",
        )?
        .query_row(params![parent, attribute, constant, link], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Insert an edge unless an identical one exists. Maintains the frequency
/// tables and the edge counter. Returns true when a row was inserted.
pub(crate) fn add_augmentation(
    conn: &Connection,
    c: &mut Counters,
    parent: LtiId,
    attribute: SymbolHash,
    value: StoredValue,
    activation: f64,
) -> Result<bool> {
    if has_augmentation(conn, parent, attribute, value)? {
        return Ok(false);
    }

    let (constant, link) = value.columns();
    conn.prepare_cached(
        "INSERT INTO ltm_augmentations \
         (lti_id, attribute_s_id, value_constant_s_id, value_lti_id, activation_value) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?
    .execute(params![parent, attribute, constant, link, activation])?;

    conn.prepare_cached(
        "INSERT INTO ltm_attribute_frequency (attribute_s_id, edge_frequency) VALUES (?1, 1) \
         ON CONFLICT(attribute_s_id) DO UPDATE SET edge_frequency=edge_frequency+1",
    )?
    .execute(params![attribute])?;

    match value {
        StoredValue::Constant(hash) => {
            conn.prepare_cached(
                "INSERT INTO ltm_constant_frequency (attribute_s_id, value_constant_s_id, edge_frequency) \
                 VALUES (?1, ?2, 1) \
                 ON CONFLICT(attribute_s_id, value_constant_s_id) \
                 DO UPDATE SET edge_frequency=edge_frequency+1",
            )?
            .execute(params![attribute, hash])?;
        }
        StoredValue::Lti(id) => {
            conn.prepare_cached(
                "INSERT INTO ltm_lti_frequency (attribute_s_id, value_lti_id, edge_frequency) \
                 VALUES (?1, ?2, 1) \
                 ON CONFLICT(attribute_s_id, value_lti_id) \
                 DO UPDATE SET edge_frequency=edge_frequency+1",
            )?
            .execute(params![attribute, id])?;
        }
    }

    c.edge_count += 1;
    Ok(true)
}

/// All edges of a node: (attribute, value, edge activation).
pub(crate) fn augmentations_of(
    conn: &Connection,
    id: LtiId,
) -> Result<Vec<(SymbolHash, StoredValue, f64)>> {
    let mut statement = conn.prepare_cached(
        "SELECT attribute_s_id, value_constant_s_id, value_lti_id, activation_value \
         FROM ltm_augmentations WHERE lti_id=?1",
    )?;
    let rows = statement.query_map(params![id], |row| {
        Ok((
            row.get::<_, u64>(0)?,
            row.get::<_, u64>(1)?,
            row.get::<_, u64>(2)?,
            row.get::<_, f64>(3)?,
        ))
    })?;

    let mut edges = Vec::new();
    for row in rows {
        let (attribute, constant, link, activation) = row?;
        let value = if link != 0 {
            StoredValue::Lti(link)
        } else {
            StoredValue::Constant(constant)
        };
        edges.push((attribute, value, activation));
    }
    Ok(edges)
}

fn decrement_attribute_frequency(conn: &Connection, attribute: SymbolHash, by: u64) -> Result<()> {
    conn.prepare_cached(
        "UPDATE ltm_attribute_frequency SET edge_frequency=edge_frequency-?2 \
         WHERE attribute_s_id=?1",
    )?
    .execute(params![attribute, by])?;
    conn.prepare_cached("DELETE FROM ltm_attribute_frequency WHERE edge_frequency<=0")?
        .execute([])?;
    Ok(())
}

fn decrement_value_frequency(conn: &Connection, attribute: SymbolHash, value: StoredValue) -> Result<()> {
    match value {
        StoredValue::Constant(hash) => {
            conn.prepare_cached(
                "UPDATE ltm_constant_frequency SET edge_frequency=edge_frequency-1 \
                 WHERE attribute_s_id=?1 AND value_constant_s_id=?2",
            )?
            .execute(params![attribute, hash])?;
            conn.prepare_cached("DELETE FROM ltm_constant_frequency WHERE edge_frequency<=0")?
                .execute([])?;
        }
        StoredValue::Lti(id) => {
            conn.prepare_cached(
                "UPDATE ltm_lti_frequency SET edge_frequency=edge_frequency-1 \
                 WHERE attribute_s_id=?1 AND value_lti_id=?2",
            )?
            .execute(params![attribute, id])?;
            conn.prepare_cached("DELETE FROM ltm_lti_frequency WHERE edge_frequency<=0")?
                .execute([])?;
        }
    }
    Ok(())
}

/// Delete every outgoing edge of a node, unwinding the frequency tables and
/// the edge counter. Does not touch the node row itself.
pub(crate) fn remove_augmentations_of(conn: &Connection, c: &mut Counters, id: LtiId) -> Result<()> {
    let edges = augmentations_of(conn, id)?;
    for (attribute, value, _) in &edges {
        decrement_attribute_frequency(conn, *attribute, 1)?;
        decrement_value_frequency(conn, *attribute, *value)?;
    }
    conn.prepare_cached("DELETE FROM ltm_augmentations WHERE lti_id=?1")?
        .execute(params![id])?;
    c.edge_count -= edges.len() as u64;
    Ok(())
}

/// Number of edges in other nodes that link to this one.
pub(crate) fn incoming_references(conn: &Connection, id: LtiId) -> Result<u64> {
    Ok(conn
        .prepare_cached(
            "SELECT COUNT(*) FROM ltm_augmentations WHERE value_lti_id=?1 AND lti_id<>?2",
        )?
        .query_row(params![id, id], |row| row.get(0))?)
}

/// Sever every edge that links to this node, fixing the referencing
/// parents' augmentation counts and the frequency tables.
pub(crate) fn remove_incoming(conn: &Connection, c: &mut Counters, id: LtiId) -> Result<()> {
    let mut statement = conn.prepare_cached(
        "SELECT lti_id, attribute_s_id FROM ltm_augmentations WHERE value_lti_id=?1 AND lti_id<>?2",
    )?;
    let rows = statement.query_map(params![id, id], |row| {
        Ok((row.get::<_, u64>(0)?, row.get::<_, u64>(1)?))
    })?;

    let mut per_parent: HashMap<LtiId, u64> = HashMap::new();
    let mut severed = 0u64;
    for row in rows {
        let (parent, attribute) = row?;
        decrement_attribute_frequency(conn, attribute, 1)?;
        decrement_value_frequency(conn, attribute, StoredValue::Lti(id))?;
        *per_parent.entry(parent).or_default() += 1;
        severed += 1;
    }
    drop(statement);

    conn.prepare_cached("DELETE FROM ltm_augmentations WHERE value_lti_id=?1 AND lti_id<>?2")?
        .execute(params![id, id])?;

    for (parent, removed) in per_parent {
        let count = lti::augmentation_count(conn, parent)?;
        lti::set_augmentation_count(conn, parent, count.saturating_sub(removed))?;
    }
    c.edge_count -= severed;
    Ok(())
}

/// How many edges across the store carry this attribute. 0 when unseen.
pub(crate) fn attribute_frequency(conn: &Connection, attribute: SymbolHash) -> Result<u64> {
    let found: Option<u64> = conn
        .prepare_cached(
            "SELECT edge_frequency FROM ltm_attribute_frequency WHERE attribute_s_id=?1",
        )?
        .query_row(params![attribute], |row| row.get(0))
        .optional()?;
    Ok(found.unwrap_or(0))
}

/// How many edges carry this exact (attribute, value) pair. 0 when unseen.
pub(crate) fn pair_frequency(
    conn: &Connection,
    attribute: SymbolHash,
    value: StoredValue,
) -> Result<u64> {
    let found: Option<u64> = match value {
        StoredValue::Constant(hash) => conn
            .prepare_cached(
                "SELECT edge_frequency FROM ltm_constant_frequency \
                 WHERE attribute_s_id=?1 AND value_constant_s_id=?2",
            )?
            .query_row(params![attribute, hash], |row| row.get(0))
            .optional()?,
        StoredValue::Lti(id) => conn
            .prepare_cached(
                "SELECT edge_frequency FROM ltm_lti_frequency \
                 WHERE attribute_s_id=?1 AND value_lti_id=?2",
            )?
            .query_row(params![attribute, id], |row| row.get(0))
            .optional()?,
    };
    Ok(found.unwrap_or(0))
}

/// Why a graph is being installed into working memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallKind {
    /// Diagnostic walk: no activation side effects, no durable mapping.
    Meta,
    /// Retrieval on behalf of the reasoner: activates the installed root
    /// and records the node↔WM mapping for later store-backs.
    Retrieval,
}

/// How an existing node's edges combine with newly stored structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Previously stored edges of each written node are discarded first.
    Replace,
    /// New edges are added alongside the existing ones.
    Append,
}

/// Bidirectional mapping between durable node ids and working-memory ids,
/// owned by the embedder and threaded through install/store calls.
#[derive(Debug, Default)]
pub struct InstallMap {
    lti_to_wm: HashMap<LtiId, WmId>,
    wm_to_lti: HashMap<WmId, LtiId>,
}

impl InstallMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lti_of(&self, wm: WmId) -> Option<LtiId> {
        self.wm_to_lti.get(&wm).copied()
    }

    pub fn wm_of(&self, lti: LtiId) -> Option<WmId> {
        self.lti_to_wm.get(&lti).copied()
    }

    pub fn bind(&mut self, lti: LtiId, wm: WmId) {
        self.lti_to_wm.insert(lti, wm);
        self.wm_to_lti.insert(wm, lti);
    }

    /// Drop the binding for a working-memory node (stale id, removed node).
    pub fn unbind_wm(&mut self, wm: WmId) {
        if let Some(lti) = self.wm_to_lti.remove(&wm) {
            self.lti_to_wm.remove(&lti);
        }
    }

    pub fn len(&self) -> usize {
        self.wm_to_lti.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wm_to_lti.is_empty()
    }
}

impl SemanticStore {
    /// Install a stored graph into working memory, breadth-first and
    /// depth-bounded. `depth` 1 installs only the root's own edges.
    ///
    /// Already-mapped nodes reuse their working-memory counterparts, so
    /// repeated installs of an unchanged region add nothing the second
    /// time. Links to nodes that no longer exist are skipped with a
    /// warning rather than failing the whole install.
    pub fn install<W: WorkingMemory + ?Sized>(
        &mut self,
        wm: &mut W,
        map: &mut InstallMap,
        root: LtiId,
        depth: u64,
        kind: InstallKind,
    ) -> Result<Vec<WmTriple>> {
        if !self.lti_exists(root)? {
            return Err(Error::integrity(format!("unknown node {root}")));
        }
        if kind == InstallKind::Retrieval {
            self.activate(root)?;
        }

        // Meta installs keep their node mapping local to the call.
        let mut local: HashMap<LtiId, WmId> = HashMap::new();
        let mut wm_node = |wm: &mut W, map: &mut InstallMap, lti: LtiId| -> WmId {
            match kind {
                InstallKind::Retrieval => map.wm_of(lti).unwrap_or_else(|| {
                    let id = wm.create_node();
                    map.bind(lti, id);
                    id
                }),
                InstallKind::Meta => *local.entry(lti).or_insert_with(|| wm.create_node()),
            }
        };

        let root_wm = wm_node(wm, map, root);
        let mut added = Vec::new();
        let mut visited: HashSet<LtiId> = HashSet::new();
        let mut worklist: VecDeque<(LtiId, WmId, u64)> = VecDeque::new();
        worklist.push_back((root, root_wm, depth));

        while let Some((lti, wm_id, remaining)) = worklist.pop_front() {
            if remaining == 0 || !visited.insert(lti) {
                continue;
            }
            let edges = self.with_conn(|conn| augmentations_of(conn, lti))?;
            for (attribute_hash, value, _) in edges {
                let attribute = self.resolve_symbol(attribute_hash)?;
                let wm_value = match value {
                    StoredValue::Constant(hash) => WmValue::Constant(self.resolve_symbol(hash)?),
                    StoredValue::Lti(child) => {
                        if !self.lti_exists(child)? {
                            warn!(parent = lti, child, "skipping link to missing node");
                            continue;
                        }
                        let child_wm = wm_node(wm, map, child);
                        if remaining > 1 {
                            worklist.push_back((child, child_wm, remaining - 1));
                        }
                        WmValue::Node(child_wm)
                    }
                };
                if wm.add_triple(wm_id, attribute.clone(), wm_value.clone()) {
                    added.push(WmTriple {
                        id: wm_id,
                        attribute,
                        value: wm_value,
                    });
                }
            }
        }

        Ok(added)
    }

    /// Store the working-memory graph reachable from `root` into the
    /// durable store and return the root's node id.
    ///
    /// Each reachable node reuses its mapped id when the mapping is still
    /// live (stale bindings are dropped and reallocated), is activated,
    /// and has its triples written as edges, replacing or appending to
    /// existing edges per `mode`. Runs as one transaction in eager mode.
    pub fn store_graph<W: WorkingMemory + ?Sized>(
        &mut self,
        wm: &W,
        map: &mut InstallMap,
        root: WmId,
        mode: StoreMode,
    ) -> Result<LtiId> {
        // Reachable closure, breadth-first for stable allocation order.
        let mut order = Vec::new();
        let mut seen: HashSet<WmId> = HashSet::new();
        let mut worklist: VecDeque<WmId> = VecDeque::new();
        worklist.push_back(root);
        while let Some(id) = worklist.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            for (_, value) in wm.triples_of(id) {
                if let WmValue::Node(child) = value {
                    worklist.push_back(child);
                }
            }
        }

        let config = self.config().activation.clone();
        let mut c = self.counters();
        let result = self.mutate(|conn| {
            // Pass 1: bind every reachable WM node to a live LTI.
            let mut bound: HashMap<WmId, LtiId> = HashMap::new();
            for &wm_id in &order {
                let lti = match map.lti_of(wm_id) {
                    Some(existing) if lti::exists(conn, existing)? => existing,
                    Some(_) => {
                        map.unbind_wm(wm_id);
                        let fresh = lti::allocate_new(conn, &mut c)?;
                        map.bind(fresh, wm_id);
                        fresh
                    }
                    None => {
                        let fresh = lti::allocate_new(conn, &mut c)?;
                        map.bind(fresh, wm_id);
                        fresh
                    }
                };
                bound.insert(wm_id, lti);
            }

            // Pass 2: activate and write edges.
            for &wm_id in &order {
                let lti = bound[&wm_id];
                let activation = lti::activate_in(conn, &config, &mut c, lti, true)?;
                if mode == StoreMode::Replace {
                    remove_augmentations_of(conn, &mut c, lti)?;
                    lti::set_augmentation_count(conn, lti, 0)?;
                }
                for (attribute, value) in wm.triples_of(wm_id) {
                    let attribute_hash = symbol::intern(conn, &attribute)?;
                    let stored = match value {
                        WmValue::Constant(constant) => {
                            StoredValue::Constant(symbol::intern(conn, &constant)?)
                        }
                        WmValue::Node(child) => StoredValue::Lti(bound[&child]),
                    };
                    add_augmentation(conn, &mut c, lti, attribute_hash, stored, activation)?;
                }
                let count: u64 = conn
                    .prepare_cached("SELECT COUNT(*) FROM ltm_augmentations WHERE lti_id=?1")?
                    .query_row(params![lti], |row| row.get(0))?;
                lti::set_augmentation_count(conn, lti, count)?;
            }

            Ok(bound[&root])
        })?;
        self.apply_counters(c);
        Ok(result)
    }
}
