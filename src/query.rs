//! Cue-based retrieval: find stored nodes matching a conjunction of
//! attribute/value cues, ranked by cue weight and activation.
//!
//! Evaluation starts from the most selective cue (lowest edge frequency)
//! and verifies the full conjunction per candidate, so the cost tracks the
//! rarest cue rather than the store size. Queries never mutate the store;
//! retrieval-driven activation happens at install time.

use crate::error::{Error, Result};
use crate::graph::{self, InstallKind, InstallMap, StoredValue};
use crate::lti::{self, LtiId};
use crate::store::SemanticStore;
use crate::symbol::{self, SymbolValue};
use crate::wm::WorkingMemory;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;

/// Value side of a positive or negative cue.
#[derive(Debug, Clone, PartialEq)]
pub enum CueValue {
    /// The edge must carry exactly this constant.
    Constant(SymbolValue),
    /// The edge must link to exactly this node.
    Lti(LtiId),
    /// Any value under the attribute qualifies.
    Any,
}

/// One attribute/value condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub attribute: SymbolValue,
    pub value: CueValue,
}

/// Numeric predicate over the constants stored under an attribute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MathOp {
    Less(f64),
    LessOrEqual(f64),
    Greater(f64),
    GreaterOrEqual(f64),
    Equal(f64),
    Between(f64, f64),
    /// Keep only candidates holding the largest value among all matches.
    Max,
    /// Keep only candidates holding the smallest value among all matches.
    Min,
}

impl MathOp {
    fn accepts(&self, value: f64) -> bool {
        match *self {
            Self::Less(x) => value < x,
            Self::LessOrEqual(x) => value <= x,
            Self::Greater(x) => value > x,
            Self::GreaterOrEqual(x) => value >= x,
            Self::Equal(x) => value == x,
            Self::Between(lo, hi) => (lo..=hi).contains(&value),
            // Extremum ops filter across candidates afterwards; any numeric
            // value qualifies per candidate.
            Self::Max | Self::Min => true,
        }
    }
}

/// Math condition: the candidate must hold a numeric constant under the
/// attribute that satisfies the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct MathCue {
    pub attribute: SymbolValue,
    pub op: MathOp,
}

/// A retrieval request, built up cue by cue.
///
/// ```
/// use ltm_core::{QuerySpec, MathOp};
///
/// let spec = QuerySpec::new()
///     .require("color", "red")
///     .forbid_attr("broken")
///     .math("size", MathOp::Greater(3.0))
///     .limit(5);
/// # let _ = spec;
/// ```
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    positive: Vec<Cue>,
    negative: Vec<Cue>,
    math: Vec<MathCue>,
    prohibited: HashSet<LtiId>,
    limit: usize,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self {
            limit: 1,
            ..Self::default()
        }
    }

    /// Require an edge with this attribute and constant value.
    pub fn require(mut self, attribute: impl Into<SymbolValue>, value: impl Into<SymbolValue>) -> Self {
        self.positive.push(Cue {
            attribute: attribute.into(),
            value: CueValue::Constant(value.into()),
        });
        self
    }

    /// Require an edge with this attribute, any value.
    pub fn require_attr(mut self, attribute: impl Into<SymbolValue>) -> Self {
        self.positive.push(Cue {
            attribute: attribute.into(),
            value: CueValue::Any,
        });
        self
    }

    /// Require an edge linking to a specific node.
    pub fn require_link(mut self, attribute: impl Into<SymbolValue>, target: LtiId) -> Self {
        self.positive.push(Cue {
            attribute: attribute.into(),
            value: CueValue::Lti(target),
        });
        self
    }

    /// Reject candidates holding this exact edge.
    pub fn forbid(mut self, attribute: impl Into<SymbolValue>, value: impl Into<SymbolValue>) -> Self {
        self.negative.push(Cue {
            attribute: attribute.into(),
            value: CueValue::Constant(value.into()),
        });
        self
    }

    /// Reject candidates holding any edge with this attribute.
    pub fn forbid_attr(mut self, attribute: impl Into<SymbolValue>) -> Self {
        self.negative.push(Cue {
            attribute: attribute.into(),
            value: CueValue::Any,
        });
        self
    }

    /// Add a numeric predicate over an attribute's constants.
    pub fn math(mut self, attribute: impl Into<SymbolValue>, op: MathOp) -> Self {
        self.math.push(MathCue {
            attribute: attribute.into(),
            op,
        });
        self
    }

    /// Exclude a specific node from the results.
    pub fn prohibit(mut self, id: LtiId) -> Self {
        self.prohibited.insert(id);
        self
    }

    /// Maximum number of results (default 1). Results are never padded
    /// with partial matches.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// A qualifying node, with its accumulated cue weight and activation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMatch {
    pub lti: LtiId,
    pub weight: f64,
    pub activation: f64,
}

/// A positive cue with its symbols resolved to stored ids.
struct ResolvedCue {
    attribute: u64,
    value: Option<StoredValue>,
    frequency: u64,
}

/// A math cue with its attribute resolved.
struct ResolvedMath {
    attribute: u64,
    op: MathOp,
    frequency: u64,
}

impl SemanticStore {
    /// Run a cue query. Returns up to `limit` fully-qualifying nodes,
    /// ranked by weight, then activation, then id.
    ///
    /// A positive or math cue naming an attribute or value the store has
    /// never seen yields an empty result, not an error.
    pub fn query(&self, spec: &QuerySpec) -> Result<Vec<QueryMatch>> {
        if spec.positive.is_empty() && spec.math.is_empty() {
            return Err(Error::query(
                "a query needs at least one positive or math cue",
            ));
        }
        if spec.limit == 0 {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| run(conn, spec))
    }

    /// Query and install the qualifying nodes into working memory, each to
    /// `depth` link hops, as retrievals (activating and mapping them).
    pub fn retrieve<W: WorkingMemory + ?Sized>(
        &mut self,
        spec: &QuerySpec,
        wm: &mut W,
        map: &mut InstallMap,
        depth: u64,
    ) -> Result<Vec<QueryMatch>> {
        let matches = self.query(spec)?;
        for found in &matches {
            self.install(wm, map, found.lti, depth, InstallKind::Retrieval)?;
        }
        Ok(matches)
    }
}

fn run(conn: &Connection, spec: &QuerySpec) -> Result<Vec<QueryMatch>> {
    // Resolve positive cues; an unseen attribute or value means nothing
    // can match.
    let mut positive = Vec::with_capacity(spec.positive.len());
    for cue in &spec.positive {
        let Some(resolved) = resolve_cue(conn, cue)? else {
            return Ok(Vec::new());
        };
        if resolved.frequency == 0 {
            return Ok(Vec::new());
        }
        positive.push(resolved);
    }

    // Math cues demand presence too.
    let mut math = Vec::with_capacity(spec.math.len());
    for cue in &spec.math {
        let Some(attribute) = symbol::lookup(conn, &cue.attribute)? else {
            return Ok(Vec::new());
        };
        let frequency = graph::attribute_frequency(conn, attribute)?;
        if frequency == 0 {
            return Ok(Vec::new());
        }
        math.push(ResolvedMath {
            attribute,
            op: cue.op,
            frequency,
        });
    }

    // Negative cues over unseen symbols are trivially satisfied.
    let mut negative = Vec::new();
    for cue in &spec.negative {
        if let Some(resolved) = resolve_cue(conn, cue)? {
            if resolved.frequency > 0 {
                negative.push(resolved);
            }
        }
    }

    // Seed from the most selective condition.
    let seed_positive = positive.iter().min_by_key(|c| c.frequency);
    let seed = match (seed_positive, math.iter().min_by_key(|c| c.frequency)) {
        (Some(p), Some(m)) if m.frequency < p.frequency => Seed::Attribute(m.attribute),
        (Some(p), _) => match p.value {
            Some(value) => Seed::Pair(p.attribute, value),
            None => Seed::Attribute(p.attribute),
        },
        (None, Some(m)) => Seed::Attribute(m.attribute),
        (None, None) => unreachable!("query() requires at least one cue"),
    };

    let mut seen: HashSet<LtiId> = HashSet::new();
    let mut qualifying: Vec<Candidate> = Vec::new();

    for candidate in seed.candidates(conn)? {
        if !seen.insert(candidate) || spec.prohibited.contains(&candidate) {
            continue;
        }
        if let Some(found) = qualify(conn, candidate, &positive, &negative, &math)? {
            qualifying.push(found);
        }
    }

    // Extremum ops keep only the candidates holding the global best value.
    for (i, cue) in math.iter().enumerate() {
        match cue.op {
            MathOp::Max => {
                if let Some(best) = qualifying
                    .iter()
                    .map(|c| c.extrema[i])
                    .max_by(f64::total_cmp)
                {
                    qualifying.retain(|c| c.extrema[i] == best);
                }
            }
            MathOp::Min => {
                if let Some(best) = qualifying
                    .iter()
                    .map(|c| c.extrema[i])
                    .min_by(f64::total_cmp)
                {
                    qualifying.retain(|c| c.extrema[i] == best);
                }
            }
            _ => {}
        }
    }

    qualifying.sort_by(|a, b| {
        b.weight
            .total_cmp(&a.weight)
            .then(b.activation.total_cmp(&a.activation))
            .then(a.lti.cmp(&b.lti))
    });
    qualifying.truncate(spec.limit);

    Ok(qualifying
        .into_iter()
        .map(|c| QueryMatch {
            lti: c.lti,
            weight: c.weight,
            activation: c.activation,
        })
        .collect())
}

struct Candidate {
    lti: LtiId,
    weight: f64,
    activation: f64,
    /// Best numeric value per math cue, aligned with the resolved list
    /// (max under the attribute for Max, min for Min, best match otherwise).
    extrema: Vec<f64>,
}

enum Seed {
    Attribute(u64),
    Pair(u64, StoredValue),
}

impl Seed {
    /// Candidate node ids under the seed condition, best edge activation
    /// first.
    fn candidates(&self, conn: &Connection) -> Result<Vec<LtiId>> {
        let mut collect = |sql: &str, p: &[&dyn rusqlite::ToSql]| -> Result<Vec<LtiId>> {
            let mut statement = conn.prepare_cached(sql)?;
            let rows = statement.query_map(p, |row| row.get::<_, u64>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        };

        match self {
            Self::Attribute(attribute) => collect(
                "SELECT lti_id FROM ltm_augmentations WHERE attribute_s_id=?1 \
                 ORDER BY activation_value DESC",
                &[attribute as &dyn rusqlite::ToSql],
            ),
            Self::Pair(attribute, StoredValue::Constant(constant)) => collect(
                "SELECT lti_id FROM ltm_augmentations \
                 WHERE attribute_s_id=?1 AND value_constant_s_id=?2 \
                 ORDER BY activation_value DESC",
                &[attribute as &dyn rusqlite::ToSql, constant],
            ),
            Self::Pair(attribute, StoredValue::Lti(target)) => collect(
                "SELECT lti_id FROM ltm_augmentations \
                 WHERE attribute_s_id=?1 AND value_lti_id=?2 \
                 ORDER BY activation_value DESC",
                &[attribute as &dyn rusqlite::ToSql, target],
            ),
        }
    }
}

fn resolve_cue(conn: &Connection, cue: &Cue) -> Result<Option<ResolvedCue>> {
    let Some(attribute) = symbol::lookup(conn, &cue.attribute)? else {
        return Ok(None);
    };
    let value = match &cue.value {
        CueValue::Any => None,
        CueValue::Constant(constant) => match symbol::lookup(conn, constant)? {
            Some(hash) => Some(StoredValue::Constant(hash)),
            None => return Ok(None),
        },
        CueValue::Lti(target) => Some(StoredValue::Lti(*target)),
    };
    let frequency = match value {
        Some(value) => graph::pair_frequency(conn, attribute, value)?,
        None => graph::attribute_frequency(conn, attribute)?,
    };
    Ok(Some(ResolvedCue {
        attribute,
        value,
        frequency,
    }))
}

/// Highest edge activation among a candidate's edges matching the cue, or
/// None when no edge matches.
fn max_matching_activation(
    conn: &Connection,
    lti: LtiId,
    cue: &ResolvedCue,
) -> Result<Option<f64>> {
    let found: Option<Option<f64>> = match cue.value {
        None => conn
            .prepare_cached(
                "SELECT MAX(activation_value) FROM ltm_augmentations \
                 WHERE lti_id=?1 AND attribute_s_id=?2",
            )?
            .query_row(params![lti, cue.attribute], |row| row.get(0))
            .optional()?,
        Some(StoredValue::Constant(constant)) => conn
            .prepare_cached(
                "SELECT MAX(activation_value) FROM ltm_augmentations \
                 WHERE lti_id=?1 AND attribute_s_id=?2 AND value_constant_s_id=?3",
            )?
            .query_row(params![lti, cue.attribute, constant], |row| row.get(0))
            .optional()?,
        Some(StoredValue::Lti(target)) => conn
            .prepare_cached(
                "SELECT MAX(activation_value) FROM ltm_augmentations \
                 WHERE lti_id=?1 AND attribute_s_id=?2 AND value_lti_id=?3",
            )?
            .query_row(params![lti, cue.attribute, target], |row| row.get(0))
            .optional()?,
    };
    Ok(found.flatten())
}

/// Verify the full conjunction for one candidate. Returns its accumulated
/// weight and math extrema when it qualifies.
fn qualify(
    conn: &Connection,
    lti: LtiId,
    positive: &[ResolvedCue],
    negative: &[ResolvedCue],
    math: &[ResolvedMath],
) -> Result<Option<Candidate>> {
    let mut weight = 0.0;
    for cue in positive {
        let Some(edge_activation) = max_matching_activation(conn, lti, cue)? else {
            return Ok(None);
        };
        // Rarer cues weigh more; the edge's own activation scales the
        // contribution.
        weight += edge_activation / cue.frequency as f64;
    }

    for cue in negative {
        if max_matching_activation(conn, lti, cue)?.is_some() {
            return Ok(None);
        }
    }

    let mut extrema = Vec::with_capacity(math.len());
    for cue in math {
        // Numeric constants stored under the attribute; strings and links
        // never satisfy a math predicate.
        let mut statement = conn.prepare_cached(
            "SELECT value_constant_s_id FROM ltm_augmentations \
             WHERE lti_id=?1 AND attribute_s_id=?2 AND value_constant_s_id<>0",
        )?;
        let rows = statement.query_map(params![lti, cue.attribute], |row| row.get::<_, u64>(0))?;

        let mut best: Option<f64> = None;
        for row in rows {
            let Some(number) = symbol::resolve(conn, row?)?.as_number() else {
                continue;
            };
            if !cue.op.accepts(number) {
                continue;
            }
            best = Some(match (best, cue.op) {
                (None, _) => number,
                (Some(b), MathOp::Min) => b.min(number),
                (Some(b), _) => b.max(number),
            });
        }
        let Some(value) = best else {
            return Ok(None);
        };
        extrema.push(value);
    }

    let activation = lti::activation_of(conn, lti)?;
    Ok(Some(Candidate {
        lti,
        weight,
        activation,
        extrema,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::graph::{InstallMap, StoreMode};
    use crate::wm::{SimpleWorkingMemory, WmValue};

    /// A: (^color red ^size 2), B: (^color red ^size 5 ^next C),
    /// C: (^color blue ^label |hot stuff|).
    fn seeded() -> (SemanticStore, LtiId, LtiId, LtiId) {
        let mut s = SemanticStore::in_memory(StoreConfig::default()).unwrap();
        let mut wm = SimpleWorkingMemory::new();
        let a = wm.create_node();
        let b = wm.create_node();
        let c = wm.create_node();
        wm.add_triple(a, "color".into(), WmValue::Constant("red".into()));
        wm.add_triple(a, "size".into(), WmValue::Constant(SymbolValue::Int(2)));
        wm.add_triple(b, "color".into(), WmValue::Constant("red".into()));
        wm.add_triple(b, "size".into(), WmValue::Constant(SymbolValue::Int(5)));
        wm.add_triple(b, "next".into(), WmValue::Node(c));
        wm.add_triple(c, "color".into(), WmValue::Constant("blue".into()));
        wm.add_triple(c, "label".into(), WmValue::Constant("hot stuff".into()));

        let mut map = InstallMap::new();
        s.store_graph(&wm, &mut map, a, StoreMode::Append).unwrap();
        let a_id = map.lti_of(a).unwrap();
        s.store_graph(&wm, &mut map, b, StoreMode::Append).unwrap();
        (s, a_id, map.lti_of(b).unwrap(), map.lti_of(c).unwrap())
    }

    fn ids(matches: &[QueryMatch]) -> Vec<LtiId> {
        matches.iter().map(|m| m.lti).collect()
    }

    #[test]
    fn constant_cue_finds_all_holders() {
        let (s, a, b, _) = seeded();
        let matches = s
            .query(&QuerySpec::new().require("color", "red").limit(10))
            .unwrap();
        let mut found = ids(&matches);
        found.sort_unstable();
        assert_eq!(found, vec![a.min(b), a.max(b)]);
    }

    #[test]
    fn limit_one_returns_single_best() {
        let (s, _, _, _) = seeded();
        let matches = s.query(&QuerySpec::new().require("color", "red")).unwrap();
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn conjunction_narrows() {
        let (s, _, b, _) = seeded();
        let matches = s
            .query(
                &QuerySpec::new()
                    .require("color", "red")
                    .require_attr("next")
                    .limit(10),
            )
            .unwrap();
        assert_eq!(ids(&matches), vec![b]);
    }

    #[test]
    fn link_cue_matches_exact_target() {
        let (s, _, b, c) = seeded();
        let matches = s
            .query(&QuerySpec::new().require_link("next", c).limit(10))
            .unwrap();
        assert_eq!(ids(&matches), vec![b]);
        assert!(s
            .query(&QuerySpec::new().require_link("next", 9999).limit(10))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn negative_cue_rejects() {
        let (s, a, _, _) = seeded();
        let matches = s
            .query(
                &QuerySpec::new()
                    .require("color", "red")
                    .forbid_attr("next")
                    .limit(10),
            )
            .unwrap();
        assert_eq!(ids(&matches), vec![a]);
    }

    #[test]
    fn math_cue_filters_numerically() {
        let (s, a, b, _) = seeded();
        let gt = s
            .query(&QuerySpec::new().math("size", MathOp::Greater(3.0)).limit(10))
            .unwrap();
        assert_eq!(ids(&gt), vec![b]);

        let le = s
            .query(
                &QuerySpec::new()
                    .math("size", MathOp::LessOrEqual(2.0))
                    .limit(10),
            )
            .unwrap();
        assert_eq!(ids(&le), vec![a]);

        let between = s
            .query(
                &QuerySpec::new()
                    .math("size", MathOp::Between(1.0, 10.0))
                    .limit(10),
            )
            .unwrap();
        assert_eq!(between.len(), 2);
    }

    #[test]
    fn max_and_min_keep_extremes_only() {
        let (s, a, b, _) = seeded();
        let max = s
            .query(&QuerySpec::new().math("size", MathOp::Max).limit(10))
            .unwrap();
        assert_eq!(ids(&max), vec![b]);

        let min = s
            .query(&QuerySpec::new().math("size", MathOp::Min).limit(10))
            .unwrap();
        assert_eq!(ids(&min), vec![a]);
    }

    #[test]
    fn string_values_never_satisfy_math() {
        let (s, _, _, _) = seeded();
        // "label" holds only a string constant.
        let matches = s
            .query(&QuerySpec::new().math("label", MathOp::Greater(0.0)).limit(10))
            .unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn unknown_attribute_or_value_is_empty_not_error() {
        let (s, _, _, _) = seeded();
        assert!(s
            .query(&QuerySpec::new().require_attr("flavor").limit(10))
            .unwrap()
            .is_empty());
        assert!(s
            .query(&QuerySpec::new().require("color", "mauve").limit(10))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unknown_symbol_in_negative_cue_is_trivially_satisfied() {
        let (s, _, _, _) = seeded();
        let matches = s
            .query(
                &QuerySpec::new()
                    .require("color", "red")
                    .forbid_attr("flavor")
                    .limit(10),
            )
            .unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn prohibited_ids_are_skipped() {
        let (s, a, b, _) = seeded();
        let matches = s
            .query(
                &QuerySpec::new()
                    .require("color", "red")
                    .prohibit(a)
                    .limit(10),
            )
            .unwrap();
        assert_eq!(ids(&matches), vec![b]);
    }

    #[test]
    fn empty_spec_is_an_error() {
        let (s, _, _, _) = seeded();
        assert!(s.query(&QuerySpec::new()).is_err());
    }

    #[test]
    fn queries_do_not_touch_activation() {
        let (mut s, a, _, _) = seeded();
        let before = s.node_activation(a).unwrap();
        s.query(&QuerySpec::new().require("color", "red").limit(10))
            .unwrap();
        assert_eq!(s.node_activation(a).unwrap(), before);
        // Installing a retrieval does move it.
        let mut wm = SimpleWorkingMemory::new();
        let mut map = InstallMap::new();
        s.install(&mut wm, &mut map, a, 1, crate::graph::InstallKind::Retrieval)
            .unwrap();
        assert!(s.node_activation(a).unwrap() > before);
    }

    #[test]
    fn retrieve_installs_the_winners() {
        let (mut s, _, b, c) = seeded();
        let mut wm = SimpleWorkingMemory::new();
        let mut map = InstallMap::new();
        let matches = s
            .retrieve(
                &QuerySpec::new().require("color", "red").require_attr("next"),
                &mut wm,
                &mut map,
                2,
            )
            .unwrap();
        assert_eq!(ids(&matches), vec![b]);
        // B's 3 edges plus C's 2, installed through the ^next link.
        assert_eq!(wm.len(), 5);
        assert!(map.wm_of(b).is_some());
        assert!(map.wm_of(c).is_some());
    }

    #[test]
    fn recently_activated_candidate_ranks_first() {
        let (mut s, a, b, _) = seeded();
        // Tie on weight (identical cue structure); activation breaks it.
        s.activate(a).unwrap();
        s.activate(b).unwrap();
        s.activate(a).unwrap();
        let matches = s
            .query(&QuerySpec::new().require("color", "red").limit(2))
            .unwrap();
        assert_eq!(matches[0].lti, a);
        assert_eq!(matches[1].lti, b);
    }
}
