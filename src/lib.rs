//! # ltm-core
//!
//! Persistent semantic long-term memory for cognitive agents: a durable,
//! SQLite-backed graph of nodes and attribute/value edges with
//! activation-based ranking, cue queries, and bidirectional transfer to a
//! host working memory.
//!
//! ## Quick start
//!
//! ```
//! use ltm_core::{QuerySpec, SemanticStore, StoreConfig};
//!
//! # fn main() -> ltm_core::Result<()> {
//! let mut store = SemanticStore::in_memory(StoreConfig::default())?;
//! store.add_from_text("(@1 ^kind landmark ^name |north gate| ^next @2) (@2 ^kind landmark)")?;
//!
//! let found = store.query(&QuerySpec::new().require_attr("name"))?;
//! assert_eq!(found[0].lti, 1);
//! # Ok(())
//! # }
//! ```
//!
//! File-backed stores (`SemanticStore::open`) survive process restarts;
//! a store with an unrecognized schema falls back to an in-memory one
//! instead of failing, and a recognized legacy layout is migrated in
//! place. Durability is transactional: lazy (one long transaction per
//! attach, committed at checkpoints) or eager (every operation commits).

mod activation;
mod config;
mod error;
mod export;
mod graph;
mod lti;
mod query;
mod store;
mod symbol;
mod wm;

pub use activation::{ActivationMode, ACT_LOW, HISTORY_SLOTS};
pub use config::{ActivationConfig, Optimization, StoreConfig};
pub use error::{Error, Result};
pub use graph::{InstallKind, InstallMap, StoreMode};
pub use lti::LtiId;
pub use query::{Cue, CueValue, MathCue, MathOp, QueryMatch, QuerySpec};
pub use store::{SemanticStore, StoreStats, SCHEMA_SYSTEM, SCHEMA_VERSION};
pub use symbol::{SymbolHash, SymbolType, SymbolValue};
pub use wm::{SimpleWorkingMemory, WmId, WmTriple, WmValue, WorkingMemory};
