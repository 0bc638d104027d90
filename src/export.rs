//! Textual surface: add graph structure from clause text, export stored
//! structure back out, and render human-readable dumps.
//!
//! Clause syntax, one parenthesized clause per node:
//!
//! ```text
//! (@7 ^color red ^size 5 ^next @9)
//! (<w> ^label |hot stuff| ^next @7)
//! ```
//!
//! `@N` names a durable node id (created at that id if absent), `<name>`
//! a variable bound to one fresh node across the whole text. Strings that
//! are not plain identifiers are pipe-quoted; `\|` and `\\` escape inside
//! quotes. Export emits text that re-imports to an identical structure.

use crate::error::{Error, Result};
use crate::graph::{self, StoredValue};
use crate::lti::{self, LtiId};
use crate::store::SemanticStore;
use crate::symbol::{self, SymbolValue};
use rusqlite::params;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NodeRef {
    Id(LtiId),
    Var(String),
}

#[derive(Debug, Clone, PartialEq)]
enum ParsedValue {
    Constant(SymbolValue),
    Link(NodeRef),
}

#[derive(Debug, Clone)]
struct Clause {
    node: NodeRef,
    triples: Vec<(SymbolValue, ParsedValue)>,
}

// ---------------------------------------------------------------- lexer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Caret,
    Id(LtiId),
    Var(String),
    Constant(SymbolValue),
}

struct Lexer<'a> {
    text: &'a str,
    offset: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, offset: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.offset..]
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.offset = self.text.len() - trimmed.len();
    }

    /// Next token with its starting byte offset, or None at end of input.
    fn next(&mut self) -> Result<Option<(usize, Token)>> {
        self.skip_whitespace();
        let start = self.offset;
        let mut chars = self.rest().chars();
        let Some(first) = chars.next() else {
            return Ok(None);
        };

        let token = match first {
            '(' => {
                self.offset += 1;
                Token::Open
            }
            ')' => {
                self.offset += 1;
                Token::Close
            }
            '^' => {
                self.offset += 1;
                Token::Caret
            }
            '@' => {
                self.offset += 1;
                let digits: String = self
                    .rest()
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                if digits.is_empty() {
                    return Err(Error::parse(start, "expected digits after '@'"));
                }
                self.offset += digits.len();
                let id: LtiId = digits
                    .parse()
                    .map_err(|_| Error::parse(start, format!("node id @{digits} out of range")))?;
                if id == 0 {
                    return Err(Error::parse(start, "node id @0 is reserved"));
                }
                Token::Id(id)
            }
            '<' => {
                let Some(end) = self.rest().find('>') else {
                    return Err(Error::parse(start, "unterminated variable, expected '>'"));
                };
                let name = &self.rest()[1..end];
                if name.is_empty() {
                    return Err(Error::parse(start, "empty variable name"));
                }
                let name = name.to_string();
                self.offset += end + 1;
                Token::Var(name)
            }
            '|' => {
                let mut value = String::new();
                let mut escaped = false;
                let mut consumed = None;
                for (i, c) in self.rest().char_indices().skip(1) {
                    if escaped {
                        value.push(c);
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == '|' {
                        consumed = Some(i + 1);
                        break;
                    } else {
                        value.push(c);
                    }
                }
                let Some(consumed) = consumed else {
                    return Err(Error::parse(start, "unterminated quoted string"));
                };
                self.offset += consumed;
                Token::Constant(SymbolValue::Str(value))
            }
            _ => {
                let word: String = self
                    .rest()
                    .chars()
                    .take_while(|&c| !c.is_whitespace() && !"()^".contains(c))
                    .collect();
                self.offset += word.len();
                Token::Constant(classify(&word))
            }
        };

        Ok(Some((start, token)))
    }
}

/// Bare tokens become integers or floats when they read as numbers.
fn classify(word: &str) -> SymbolValue {
    if let Ok(int) = word.parse::<i64>() {
        return SymbolValue::Int(int);
    }
    if let Ok(float) = word.parse::<f64>() {
        // "nan"/"inf" read as f64 but stay strings; stored floats are finite.
        if float.is_finite() {
            return SymbolValue::Float(float);
        }
    }
    SymbolValue::Str(word.to_string())
}

// --------------------------------------------------------------- parser

fn parse(text: &str) -> Result<Vec<Clause>> {
    let mut lexer = Lexer::new(text);
    let mut clauses = Vec::new();

    while let Some((offset, token)) = lexer.next()? {
        if token != Token::Open {
            return Err(Error::parse(offset, "expected '(' to start a clause"));
        }

        let node = match lexer.next()? {
            Some((_, Token::Id(id))) => NodeRef::Id(id),
            Some((_, Token::Var(name))) => NodeRef::Var(name),
            Some((at, _)) => {
                return Err(Error::parse(at, "expected @id or <var> after '('"));
            }
            None => return Err(Error::parse(lexer.offset, "unexpected end of input")),
        };

        let mut triples = Vec::new();
        loop {
            match lexer.next()? {
                Some((_, Token::Close)) => break,
                Some((_, Token::Caret)) => {}
                Some((at, _)) => {
                    return Err(Error::parse(at, "expected '^attribute' or ')'"));
                }
                None => return Err(Error::parse(lexer.offset, "unterminated clause")),
            }

            let attribute = match lexer.next()? {
                Some((_, Token::Constant(value))) => value,
                Some((at, _)) => return Err(Error::parse(at, "expected attribute after '^'")),
                None => return Err(Error::parse(lexer.offset, "unterminated clause")),
            };

            let value = match lexer.next()? {
                Some((_, Token::Constant(constant))) => ParsedValue::Constant(constant),
                Some((_, Token::Id(id))) => ParsedValue::Link(NodeRef::Id(id)),
                Some((_, Token::Var(name))) => ParsedValue::Link(NodeRef::Var(name)),
                Some((at, _)) => return Err(Error::parse(at, "expected value after attribute")),
                None => return Err(Error::parse(lexer.offset, "unterminated clause")),
            };

            triples.push((attribute, value));
        }

        if triples.is_empty() {
            return Err(Error::parse(offset, "clause has no augmentations"));
        }
        clauses.push(Clause { node, triples });
    }

    if clauses.is_empty() {
        return Err(Error::parse(0, "no clauses in input"));
    }
    Ok(clauses)
}

// ------------------------------------------------------------ rendering

/// Plain identifiers print bare; anything else is pipe-quoted.
fn render_constant(value: &SymbolValue) -> String {
    match value {
        SymbolValue::Str(text) => {
            let mut chars = text.chars();
            let plain = matches!(
                chars.next(),
                Some(c) if c.is_ascii_alphabetic() || c == '_'
            ) && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if plain {
                text.clone()
            } else {
                let escaped = text.replace('\\', "\\\\").replace('|', "\\|");
                format!("|{escaped}|")
            }
        }
        other => other.to_string(),
    }
}

impl SemanticStore {
    /// Parse clause text and store the described structure, appending to
    /// whatever the named nodes already hold. Returns the node id of each
    /// clause, in input order.
    pub fn add_from_text(&mut self, text: &str) -> Result<Vec<LtiId>> {
        let clauses = parse(text)?;

        let config = self.config().activation.clone();
        let mut c = self.counters();
        let result = self.mutate(|conn| {
            // Bind every referenced node first: named ids materialize at
            // their id when absent, each distinct variable gets one fresh
            // node across the whole text.
            let mut vars: HashMap<String, LtiId> = HashMap::new();
            let mut bind = |conn: &rusqlite::Connection,
                            c: &mut crate::store::Counters,
                            node: &NodeRef|
             -> Result<LtiId> {
                match node {
                    NodeRef::Id(id) => {
                        if !lti::exists(conn, *id)? {
                            lti::allocate_at(conn, c, *id)?;
                        }
                        Ok(*id)
                    }
                    NodeRef::Var(name) => {
                        if let Some(&id) = vars.get(name) {
                            return Ok(id);
                        }
                        let id = lti::allocate_new(conn, c)?;
                        vars.insert(name.clone(), id);
                        Ok(id)
                    }
                }
            };

            let mut roots = Vec::with_capacity(clauses.len());
            for clause in &clauses {
                roots.push(bind(conn, &mut c, &clause.node)?);
            }
            for clause in &clauses {
                for (_, value) in &clause.triples {
                    if let ParsedValue::Link(node) = value {
                        bind(conn, &mut c, node)?;
                    }
                }
            }

            for (clause, &id) in clauses.iter().zip(&roots) {
                let activation = lti::activate_in(conn, &config, &mut c, id, true)?;
                for (attribute, value) in &clause.triples {
                    let attribute_hash = symbol::intern(conn, attribute)?;
                    let stored = match value {
                        ParsedValue::Constant(constant) => {
                            StoredValue::Constant(symbol::intern(conn, constant)?)
                        }
                        ParsedValue::Link(node) => StoredValue::Lti(bind(conn, &mut c, node)?),
                    };
                    graph::add_augmentation(conn, &mut c, id, attribute_hash, stored, activation)?;
                }
                let count: u64 = conn
                    .prepare_cached("SELECT COUNT(*) FROM ltm_augmentations WHERE lti_id=?1")?
                    .query_row(params![id], |row| row.get(0))?;
                lti::set_augmentation_count(conn, id, count)?;
            }

            Ok(roots)
        })?;
        self.apply_counters(c);
        Ok(result)
    }

    /// Serialize stored structure as clause text: the whole store, or the
    /// region reachable from `root` within `depth` link hops (`depth` 1 is
    /// the root clause alone). One clause per node, deterministic order.
    pub fn export_to_text(&self, root: Option<LtiId>, depth: u64) -> Result<String> {
        let nodes = self.collect_nodes(root, depth)?;
        let mut out = String::new();
        for id in nodes {
            let clause = self.render_clause(id)?;
            if let Some(clause) = clause {
                out.push_str(&clause);
                out.push('\n');
            }
        }
        Ok(out)
    }

    /// Human-readable dump of one node and its surroundings, activation
    /// values included.
    pub fn print_node(&self, id: LtiId, depth: u64) -> Result<String> {
        let nodes = self.collect_nodes(Some(id), depth)?;
        let mut out = String::new();
        for node in nodes {
            let activation = self.node_activation(node)?;
            match self.render_clause(node)? {
                Some(clause) => writeln!(out, "{clause} [{activation:.3}]"),
                None => writeln!(out, "(@{node}) [{activation:.3}]"),
            }
            .map_err(|e| Error::Internal(e.to_string()))?;
        }
        Ok(out)
    }

    /// Dump of every node in the store.
    pub fn print_store(&self) -> Result<String> {
        let mut out = String::new();
        for id in self.all_node_ids()? {
            let activation = self.node_activation(id)?;
            match self.render_clause(id)? {
                Some(clause) => writeln!(out, "{clause} [{activation:.3}]"),
                None => writeln!(out, "(@{id}) [{activation:.3}]"),
            }
            .map_err(|e| Error::Internal(e.to_string()))?;
        }
        Ok(out)
    }

    fn all_node_ids(&self) -> Result<Vec<LtiId>> {
        self.with_conn(|conn| {
            let mut statement = conn.prepare_cached("SELECT lti_id FROM ltm_lti ORDER BY lti_id")?;
            let rows = statement.query_map([], |row| row.get::<_, u64>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }

    /// Nodes to serialize, ascending by id: the whole store, or a
    /// depth-bounded breadth-first closure from `root`.
    fn collect_nodes(&self, root: Option<LtiId>, depth: u64) -> Result<Vec<LtiId>> {
        let Some(root) = root else {
            return self.all_node_ids();
        };
        if !self.lti_exists(root)? {
            return Err(Error::integrity(format!("unknown node {root}")));
        }

        let mut keep: BTreeSet<LtiId> = BTreeSet::new();
        let mut worklist: VecDeque<(LtiId, u64)> = VecDeque::new();
        worklist.push_back((root, depth));
        while let Some((id, remaining)) = worklist.pop_front() {
            if remaining == 0 || !keep.insert(id) {
                continue;
            }
            for (_, value, _) in self.with_conn(|conn| graph::augmentations_of(conn, id))? {
                if let StoredValue::Lti(child) = value {
                    if self.lti_exists(child)? {
                        worklist.push_back((child, remaining - 1));
                    }
                }
            }
        }
        Ok(keep.into_iter().collect())
    }

    /// One clause for a node's edges, or None for a node with no edges.
    fn render_clause(&self, id: LtiId) -> Result<Option<String>> {
        let edges = self.with_conn(|conn| graph::augmentations_of(conn, id))?;
        if edges.is_empty() {
            return Ok(None);
        }

        let mut rendered = Vec::with_capacity(edges.len());
        for (attribute_hash, value, _) in edges {
            let attribute = self.resolve_symbol(attribute_hash)?;
            let (value_key, value_text) = match value {
                StoredValue::Constant(hash) => {
                    let constant = self.resolve_symbol(hash)?;
                    (constant.sort_key(), render_constant(&constant))
                }
                StoredValue::Lti(child) => ((4, format!("{child:020}")), format!("@{child}")),
            };
            rendered.push((attribute.sort_key(), value_key, attribute, value_text));
        }
        rendered.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

        let mut clause = format!("(@{id}");
        for (_, _, attribute, value_text) in rendered {
            clause.push_str(" ^");
            clause.push_str(&render_constant(&attribute));
            clause.push(' ');
            clause.push_str(&value_text);
        }
        clause.push(')');
        Ok(Some(clause))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use pretty_assertions::assert_eq;

    fn store() -> SemanticStore {
        SemanticStore::in_memory(StoreConfig::default()).unwrap()
    }

    #[test]
    fn add_from_text_creates_named_nodes() {
        let mut s = store();
        let roots = s
            .add_from_text("(@7 ^color red ^size 5 ^next @9) (@9 ^color blue)")
            .unwrap();
        assert_eq!(roots, vec![7, 9]);
        assert!(s.lti_exists(7).unwrap());
        assert!(s.lti_exists(9).unwrap());
        assert_eq!(s.stats().unwrap().edges, 4);
    }

    #[test]
    fn variables_bind_once_across_clauses() {
        let mut s = store();
        let roots = s
            .add_from_text("(<a> ^next <b>) (<b> ^back <a>)")
            .unwrap();
        assert_eq!(roots.len(), 2);
        assert_ne!(roots[0], roots[1]);
        assert_eq!(s.stats().unwrap().nodes, 2);
        assert_eq!(s.stats().unwrap().edges, 2);
    }

    #[test]
    fn quoted_strings_and_escapes() {
        let mut s = store();
        let roots = s
            .add_from_text(r"(<n> ^label |hot stuff| ^path |a\|b\\c|)")
            .unwrap();
        let text = s.export_to_text(Some(roots[0]), 1).unwrap();
        assert!(text.contains("|hot stuff|"));
        assert!(text.contains(r"|a\|b\\c|"));

        let mut reimported = store();
        reimported.add_from_text(&text).unwrap();
        assert!(reimported
            .lookup_symbol(&"hot stuff".into())
            .unwrap()
            .is_some());
        assert!(reimported.lookup_symbol(&r"a|b\c".into()).unwrap().is_some());
    }

    #[test]
    fn numeric_tokens_classify() {
        let mut s = store();
        s.add_from_text("(@1 ^count 5 ^ratio 2.5 ^name 5x)").unwrap();
        assert!(s.lookup_symbol(&SymbolValue::Int(5)).unwrap().is_some());
        assert!(s.lookup_symbol(&SymbolValue::Float(2.5)).unwrap().is_some());
        assert!(s.lookup_symbol(&"5x".into()).unwrap().is_some());
    }

    #[test]
    fn add_is_append() {
        let mut s = store();
        s.add_from_text("(@3 ^color red)").unwrap();
        s.add_from_text("(@3 ^color blue)").unwrap();
        assert_eq!(s.stats().unwrap().edges, 2);
        // Identical re-add is suppressed.
        s.add_from_text("(@3 ^color red)").unwrap();
        assert_eq!(s.stats().unwrap().edges, 2);
    }

    #[test]
    fn export_round_trips_structure() {
        let mut s = store();
        s.add_from_text("(@7 ^color red ^size 5 ^next @9) (@9 ^color blue ^back @7)")
            .unwrap();
        let text = s.export_to_text(None, 0).unwrap();

        let mut copy = store();
        copy.add_from_text(&text).unwrap();
        assert_eq!(copy.export_to_text(None, 0).unwrap(), text);
        assert_eq!(copy.stats().unwrap().edges, s.stats().unwrap().edges);
        assert_eq!(copy.stats().unwrap().nodes, s.stats().unwrap().nodes);
    }

    #[test]
    fn export_depth_bounds_the_walk() {
        let mut s = store();
        s.add_from_text("(@1 ^next @2) (@2 ^next @3) (@3 ^color red)")
            .unwrap();

        let shallow = s.export_to_text(Some(1), 1).unwrap();
        assert_eq!(shallow.lines().count(), 1);
        assert!(shallow.contains("(@1"));

        let deeper = s.export_to_text(Some(1), 3).unwrap();
        assert_eq!(deeper.lines().count(), 3);
    }

    #[test]
    fn export_output_is_deterministic() {
        let mut s = store();
        s.add_from_text("(@1 ^zeta last ^alpha first ^mid 3 ^next @2) (@2 ^color red)")
            .unwrap();
        // Attributes sorted, not in insertion order.
        let text = s.export_to_text(Some(1), 1).unwrap();
        assert_eq!(text, "(@1 ^alpha first ^mid 3 ^next @2 ^zeta last)\n");
    }

    #[test]
    fn print_includes_activation() {
        let mut s = store();
        s.add_from_text("(@1 ^color red)").unwrap();
        let text = s.print_node(1, 1).unwrap();
        assert!(text.starts_with("(@1 ^color red) ["));

        let all = s.print_store().unwrap();
        assert_eq!(all.lines().count(), 1);
    }

    #[test]
    fn parse_errors_carry_offsets() {
        let mut s = store();
        for bad in [
            "(@0 ^color red)",
            "(@1 ^color)",
            "(@1 color red)",
            "(<a ^color red)",
            "(@1 ^label |unterminated)",
            "@1 ^color red",
            "",
            "(@1)",
        ] {
            match s.add_from_text(bad) {
                Err(Error::Parse { .. }) => {}
                other => panic!("expected parse error for {bad:?}, got {other:?}"),
            }
        }
        // Nothing leaked into the store from failed parses.
        assert_eq!(s.stats().unwrap().nodes, 0);
    }

    #[test]
    fn unknown_export_root_is_integrity_error() {
        let s = store();
        assert!(s.export_to_text(Some(42), 1).is_err());
    }
}
