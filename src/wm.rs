//! Working-memory interface consumed by the installation/export engine.
//!
//! The host reasoning engine owns its working-memory representation; the
//! store only needs to create nodes and add/remove/read attribute-value
//! triples. [`SimpleWorkingMemory`] is a minimal in-crate implementation for
//! embedders without a host engine, and for tests.

use crate::symbol::SymbolValue;
use std::collections::BTreeMap;

/// Identifier of a working-memory node, assigned by the host engine.
pub type WmId = u64;

/// Value side of a working-memory triple: a constant or another node.
#[derive(Debug, Clone, PartialEq)]
pub enum WmValue {
    Constant(SymbolValue),
    Node(WmId),
}

/// A working-memory edge: (node, attribute, value).
#[derive(Debug, Clone, PartialEq)]
pub struct WmTriple {
    pub id: WmId,
    pub attribute: SymbolValue,
    pub value: WmValue,
}

/// The small surface of the host engine's working memory that the store
/// consumes.
pub trait WorkingMemory {
    /// Create a fresh node and return its id.
    fn create_node(&mut self) -> WmId;

    /// Add a triple. Returns false when an identical triple already exists
    /// (the caller relies on duplicate suppression).
    fn add_triple(&mut self, id: WmId, attribute: SymbolValue, value: WmValue) -> bool;

    /// Remove a triple. Returns true when something was removed.
    fn remove_triple(&mut self, id: WmId, attribute: &SymbolValue, value: &WmValue) -> bool;

    /// All triples hanging off a node, in insertion order.
    fn triples_of(&self, id: WmId) -> Vec<(SymbolValue, WmValue)>;
}

/// Plain map-backed working memory with duplicate suppression.
#[derive(Debug, Default)]
pub struct SimpleWorkingMemory {
    next_id: WmId,
    slots: BTreeMap<WmId, Vec<(SymbolValue, WmValue)>>,
}

impl SimpleWorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of triples across all nodes.
    pub fn len(&self) -> usize {
        self.slots.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All triples in the structure, ordered by node id.
    pub fn all_triples(&self) -> Vec<WmTriple> {
        self.slots
            .iter()
            .flat_map(|(&id, slots)| {
                slots.iter().map(move |(attribute, value)| WmTriple {
                    id,
                    attribute: attribute.clone(),
                    value: value.clone(),
                })
            })
            .collect()
    }
}

impl WorkingMemory for SimpleWorkingMemory {
    fn create_node(&mut self) -> WmId {
        self.next_id += 1;
        self.slots.entry(self.next_id).or_default();
        self.next_id
    }

    fn add_triple(&mut self, id: WmId, attribute: SymbolValue, value: WmValue) -> bool {
        let slots = self.slots.entry(id).or_default();
        if slots.iter().any(|(a, v)| *a == attribute && *v == value) {
            return false;
        }
        slots.push((attribute, value));
        true
    }

    fn remove_triple(&mut self, id: WmId, attribute: &SymbolValue, value: &WmValue) -> bool {
        if let Some(slots) = self.slots.get_mut(&id) {
            let before = slots.len();
            slots.retain(|(a, v)| !(a == attribute && v == value));
            return slots.len() < before;
        }
        false
    }

    fn triples_of(&self, id: WmId) -> Vec<(SymbolValue, WmValue)> {
        self.slots.get(&id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_triples_suppressed() {
        let mut wm = SimpleWorkingMemory::new();
        let n = wm.create_node();
        assert!(wm.add_triple(n, "color".into(), WmValue::Constant("red".into())));
        assert!(!wm.add_triple(n, "color".into(), WmValue::Constant("red".into())));
        assert_eq!(wm.len(), 1);
    }

    #[test]
    fn remove_triple_works() {
        let mut wm = SimpleWorkingMemory::new();
        let n = wm.create_node();
        wm.add_triple(n, "size".into(), WmValue::Constant(SymbolValue::Int(5)));
        assert!(wm.remove_triple(n, &"size".into(), &WmValue::Constant(SymbolValue::Int(5))));
        assert!(wm.is_empty());
    }

    #[test]
    fn node_links() {
        let mut wm = SimpleWorkingMemory::new();
        let a = wm.create_node();
        let b = wm.create_node();
        wm.add_triple(a, "next".into(), WmValue::Node(b));
        assert_eq!(wm.triples_of(a), vec![("next".into(), WmValue::Node(b))]);
    }
}
