//! Long-term identifier (LTI) lifecycle and the activation engine.
//!
//! An LTI is the durable identity of a graph node. Allocation hands out ids
//! from a monotone counter, skipping ids that are already live (installed
//! from an earlier session or forced by the caller); a collision jumps the
//! counter past the largest stored id so allocation stays O(1) regardless
//! of how the id space is populated.

use crate::activation::{self, ACT_LOW, HISTORY_SLOTS};
use crate::config::ActivationConfig;
use crate::error::{Error, Result};
use crate::graph;
use crate::store::{Counters, SemanticStore};
use rusqlite::{params, Connection, OptionalExtension};

/// Durable identifier of a semantic graph node. Never 0; 0 is the stored
/// sentinel for "no node".
pub type LtiId = u64;

pub(crate) fn exists(conn: &Connection, id: LtiId) -> Result<bool> {
    let found: Option<i64> = conn
        .prepare_cached("SELECT 1 FROM ltm_lti WHERE lti_id=?1")?
        .query_row(params![id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Largest stored id, or 0 for an empty store.
pub(crate) fn max_id(conn: &Connection) -> Result<u64> {
    let max: Option<u64> = conn.query_row("SELECT MAX(lti_id) FROM ltm_lti", [], |row| row.get(0))?;
    Ok(max.unwrap_or(0))
}

fn insert_row(conn: &Connection, id: LtiId) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO ltm_lti (lti_id, total_augmentations, activation_value, \
         activations_total, activations_last, activations_first) VALUES (?1, 0, ?2, 0, 0, 0)",
    )?
    .execute(params![id, ACT_LOW])?;
    Ok(())
}

/// Allocate a fresh id: next counter value, or one past the largest stored
/// id when the counter has run into a live one.
pub(crate) fn allocate_new(conn: &Connection, c: &mut Counters) -> Result<LtiId> {
    let mut candidate = c.lti_counter + 1;
    if exists(conn, candidate)? {
        candidate = max_id(conn)?.max(candidate) + 1;
    }
    insert_row(conn, candidate)?;
    c.lti_counter = candidate;
    c.node_count += 1;
    Ok(candidate)
}

/// Materialize a node at a caller-chosen id (re-import, text add).
pub(crate) fn allocate_at(conn: &Connection, c: &mut Counters, id: LtiId) -> Result<()> {
    if id == 0 {
        return Err(Error::integrity("node id 0 is reserved"));
    }
    if exists(conn, id)? {
        return Err(Error::integrity(format!("node {id} already exists")));
    }
    insert_row(conn, id)?;
    c.node_count += 1;
    Ok(())
}

pub(crate) fn activation_of(conn: &Connection, id: LtiId) -> Result<f64> {
    conn.prepare_cached("SELECT activation_value FROM ltm_lti WHERE lti_id=?1")?
        .query_row(params![id], |row| row.get(0))
        .optional()?
        .ok_or_else(|| Error::integrity(format!("unknown node {id}")))
}

pub(crate) fn augmentation_count(conn: &Connection, id: LtiId) -> Result<u64> {
    conn.prepare_cached("SELECT total_augmentations FROM ltm_lti WHERE lti_id=?1")?
        .query_row(params![id], |row| row.get(0))
        .optional()?
        .ok_or_else(|| Error::integrity(format!("unknown node {id}")))
}

pub(crate) fn set_augmentation_count(conn: &Connection, id: LtiId, count: u64) -> Result<()> {
    conn.prepare_cached("UPDATE ltm_lti SET total_augmentations=?1 WHERE lti_id=?2")?
        .execute(params![count, id])?;
    Ok(())
}

/// Retained access history of a node, newest first, empty slots dropped.
fn history(conn: &Connection, id: LtiId) -> Result<Vec<u64>> {
    let row: Option<[u64; HISTORY_SLOTS]> = conn
        .prepare_cached(
            "SELECT t1, t2, t3, t4, t5, t6, t7, t8, t9, t10 \
             FROM ltm_activation_history WHERE lti_id=?1",
        )?
        .query_row(params![id], |row| {
            let mut slots = [0u64; HISTORY_SLOTS];
            for (i, slot) in slots.iter_mut().enumerate() {
                *slot = row.get(i)?;
            }
            Ok(slots)
        })
        .optional()?;

    Ok(row
        .map(|slots| slots.into_iter().filter(|&t| t > 0).collect())
        .unwrap_or_default())
}

/// Shift-insert an access cycle at the front of the node's history ring.
fn push_history(conn: &Connection, id: LtiId, cycle: u64) -> Result<()> {
    let changed = conn
        .prepare_cached(
            "UPDATE ltm_activation_history SET \
             t10=t9, t9=t8, t8=t7, t7=t6, t6=t5, t5=t4, t4=t3, t3=t2, t2=t1, t1=?2 \
             WHERE lti_id=?1",
        )?
        .execute(params![id, cycle])?;
    if changed == 0 {
        conn.prepare_cached(
            "INSERT INTO ltm_activation_history \
             (lti_id, t1, t2, t3, t4, t5, t6, t7, t8, t9, t10) \
             VALUES (?1, ?2, 0, 0, 0, 0, 0, 0, 0, 0, 0)",
        )?
        .execute(params![id, cycle])?;
    }
    Ok(())
}

/// Touch a node: advance the logical clock, update its access statistics
/// (when `add_access`), recompute activation under the configured model,
/// and write the value back to the node row, plus its edges when the
/// node's augmentation count is within the edge budget.
///
/// Returns the new activation value.
pub(crate) fn activate_in(
    conn: &Connection,
    config: &ActivationConfig,
    c: &mut Counters,
    id: LtiId,
    add_access: bool,
) -> Result<f64> {
    let row: Option<(u64, u64, u64, u64)> = conn
        .prepare_cached(
            "SELECT total_augmentations, activations_total, activations_last, activations_first \
             FROM ltm_lti WHERE lti_id=?1",
        )?
        .query_row(params![id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .optional()?;
    let (augmentations, mut total, mut last, mut first) =
        row.ok_or_else(|| Error::integrity(format!("unknown node {id}")))?;

    c.max_cycle += 1;
    let now = c.max_cycle;

    if add_access {
        total += 1;
        last = now;
        if first == 0 {
            first = now;
        }
        push_history(conn, id, now)?;
    }

    let ring = history(conn, id)?;
    let value = activation::compute(
        config.mode,
        total,
        last,
        first,
        &ring,
        // Strictly after the access just recorded.
        now + 1,
        config.decay_rate,
    );

    conn.prepare_cached(
        "UPDATE ltm_lti SET activation_value=?1, activations_total=?2, \
         activations_last=?3, activations_first=?4 WHERE lti_id=?5",
    )?
    .execute(params![value, total, last, first, id])?;

    if augmentations <= config.threshold {
        conn.prepare_cached("UPDATE ltm_augmentations SET activation_value=?1 WHERE lti_id=?2")?
            .execute(params![value, id])?;
    }

    Ok(value)
}

/// Delete a node, its edges, history, and frequency contributions.
///
/// Refuses when other nodes still reference it unless `force`, which also
/// removes the incoming edges.
pub(crate) fn remove_in(
    conn: &Connection,
    c: &mut Counters,
    id: LtiId,
    force: bool,
) -> Result<()> {
    if !exists(conn, id)? {
        return Err(Error::integrity(format!("unknown node {id}")));
    }

    let incoming = graph::incoming_references(conn, id)?;
    if incoming > 0 {
        if !force {
            return Err(Error::integrity(format!(
                "node {id} is referenced by {incoming} edge(s); remove with force to sever them"
            )));
        }
        graph::remove_incoming(conn, c, id)?;
    }

    graph::remove_augmentations_of(conn, c, id)?;

    conn.prepare_cached("DELETE FROM ltm_activation_history WHERE lti_id=?1")?
        .execute(params![id])?;
    conn.prepare_cached("DELETE FROM ltm_lti WHERE lti_id=?1")?
        .execute(params![id])?;
    c.node_count -= 1;
    Ok(())
}

impl SemanticStore {
    /// Allocate a fresh node id.
    pub fn allocate_lti(&mut self) -> Result<LtiId> {
        let mut c = self.counters();
        let id = self.mutate(|conn| allocate_new(conn, &mut c))?;
        self.apply_counters(c);
        Ok(id)
    }

    /// Materialize a node at a specific id. Fails with an integrity error
    /// when the id is already live.
    pub fn allocate_specific_lti(&mut self, id: LtiId) -> Result<()> {
        let mut c = self.counters();
        self.mutate(|conn| allocate_at(conn, &mut c, id))?;
        self.apply_counters(c);
        Ok(())
    }

    pub fn lti_exists(&self, id: LtiId) -> Result<bool> {
        self.with_conn(|conn| exists(conn, id))
    }

    /// Largest stored node id, or 0 for an empty store.
    pub fn max_lti_id(&self) -> Result<u64> {
        self.with_conn(max_id)
    }

    /// Record an access to a node and return its recomputed activation.
    pub fn activate(&mut self, id: LtiId) -> Result<f64> {
        let config = self.config().activation.clone();
        let mut c = self.counters();
        let value = self.mutate(|conn| activate_in(conn, &config, &mut c, id, true))?;
        self.apply_counters(c);
        Ok(value)
    }

    /// Current activation of a node.
    pub fn node_activation(&self, id: LtiId) -> Result<f64> {
        self.with_conn(|conn| activation_of(conn, id))
    }

    /// Remove a node. See [`remove_in`] for the `force` contract.
    pub fn remove_lti(&mut self, id: LtiId, force: bool) -> Result<()> {
        let mut c = self.counters();
        self.mutate(|conn| remove_in(conn, &mut c, id, force))?;
        self.apply_counters(c);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationMode;
    use crate::config::StoreConfig;
    use crate::store::SemanticStore;
    use crate::wm::WorkingMemory;

    fn store() -> SemanticStore {
        SemanticStore::in_memory(StoreConfig::default()).unwrap()
    }

    #[test]
    fn allocation_is_sequential_from_initial_id() {
        let config = StoreConfig {
            initial_lti_id: 100,
            ..StoreConfig::default()
        };
        let mut s = SemanticStore::in_memory(config).unwrap();
        assert_eq!(s.allocate_lti().unwrap(), 100);
        assert_eq!(s.allocate_lti().unwrap(), 101);
    }

    #[test]
    fn allocation_skips_live_ids_in_one_jump() {
        let mut s = store();
        assert_eq!(s.allocate_lti().unwrap(), 1);
        s.allocate_specific_lti(2).unwrap();
        s.allocate_specific_lti(50).unwrap();
        // Counter would hand out 2 next; it collides and jumps past the max.
        assert_eq!(s.allocate_lti().unwrap(), 51);
        assert_eq!(s.allocate_lti().unwrap(), 52);
    }

    #[test]
    fn specific_allocation_rejects_live_and_zero_ids() {
        let mut s = store();
        let id = s.allocate_lti().unwrap();
        assert!(s.allocate_specific_lti(id).is_err());
        assert!(s.allocate_specific_lti(0).is_err());
    }

    #[test]
    fn set_id_counter_steers_allocation() {
        let mut s = store();
        s.set_id_counter(500);
        assert_eq!(s.allocate_lti().unwrap(), 500);
    }

    #[test]
    fn fresh_node_sits_at_the_floor() {
        let mut s = store();
        let id = s.allocate_lti().unwrap();
        assert_eq!(s.node_activation(id).unwrap(), crate::activation::ACT_LOW);
    }

    #[test]
    fn recency_activation_is_monotone_across_accesses() {
        let mut s = store();
        let a = s.allocate_lti().unwrap();
        let b = s.allocate_lti().unwrap();
        let first = s.activate(a).unwrap();
        let second = s.activate(b).unwrap();
        let third = s.activate(a).unwrap();
        assert!(second > first);
        assert!(third > second);
        assert_eq!(s.node_activation(a).unwrap(), third);
    }

    #[test]
    fn base_level_activation_stays_finite() {
        let config = StoreConfig::default().with_activation_mode(ActivationMode::BaseLevel);
        let mut s = SemanticStore::in_memory(config).unwrap();
        let id = s.allocate_lti().unwrap();
        // More accesses than the history retains exercises the tail term.
        let mut last = f64::NEG_INFINITY;
        for _ in 0..25 {
            last = s.activate(id).unwrap();
            assert!(last.is_finite());
        }
        assert!(last > crate::activation::ACT_LOW);
    }

    #[test]
    fn frequency_activation_counts_accesses() {
        let config = StoreConfig::default().with_activation_mode(ActivationMode::Frequency);
        let mut s = SemanticStore::in_memory(config).unwrap();
        let id = s.allocate_lti().unwrap();
        for expected in 1..=4 {
            assert_eq!(s.activate(id).unwrap(), expected as f64);
        }
    }

    #[test]
    fn remove_refuses_referenced_node_without_force() {
        let mut s = store();
        let mut wm = crate::wm::SimpleWorkingMemory::new();
        let root = wm.create_node();
        let child = wm.create_node();
        wm.add_triple(root, "next".into(), crate::wm::WmValue::Node(child));

        let mut map = crate::graph::InstallMap::new();
        let root_id = s
            .store_graph(&wm, &mut map, root, crate::graph::StoreMode::Append)
            .unwrap();
        let child_id = map.lti_of(child).unwrap();

        assert!(s.remove_lti(child_id, false).is_err());
        s.remove_lti(child_id, true).unwrap();
        assert!(!s.lti_exists(child_id).unwrap());
        // The severed edge is gone from the parent too.
        assert_eq!(s.stats().unwrap().edges, 0);
        assert!(s.lti_exists(root_id).unwrap());
    }

    #[test]
    fn remove_unreferenced_node_updates_counters() {
        let mut s = store();
        let id = s.allocate_lti().unwrap();
        assert_eq!(s.stats().unwrap().nodes, 1);
        s.remove_lti(id, false).unwrap();
        assert_eq!(s.stats().unwrap().nodes, 0);
        assert!(s.remove_lti(id, false).is_err());
    }
}
