//! Activation math: recency, frequency, and base-level decay models.
//!
//! All functions here are pure; the logical clock is a cycle counter owned
//! by the store and passed in as `now`. Using cycles instead of wall time
//! keeps activation reproducible and lets tests step time deterministically.

use serde::{Deserialize, Serialize};

/// Floor activation for a node with no recorded accesses. Finite so it can
/// be stored and compared without NaN/infinity leaking into rankings.
pub const ACT_LOW: f64 = -1.0e9;

/// Number of access timestamps retained per node.
pub const HISTORY_SLOTS: usize = 10;

/// How a node's activation value is computed from its access statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationMode {
    /// Most-recently-touched nodes score highest.
    Recency,
    /// Most-frequently-touched nodes score highest.
    Frequency,
    /// ACT-R style base-level decay over the access history.
    BaseLevel,
}

/// Compute a node's activation under the given model.
///
/// `history` holds the most recent access cycles, newest first, at most
/// [`HISTORY_SLOTS`] entries. `now` must be strictly greater than every
/// entry (the store bumps its cycle counter after recording an access).
pub fn compute(
    mode: ActivationMode,
    total_accesses: u64,
    last_access: u64,
    first_access: u64,
    history: &[u64],
    now: u64,
    decay_rate: f64,
) -> f64 {
    if total_accesses == 0 {
        return ACT_LOW;
    }

    match mode {
        ActivationMode::Recency => last_access as f64,
        ActivationMode::Frequency => total_accesses as f64,
        ActivationMode::BaseLevel => {
            base_level(history, total_accesses, first_access, now, decay_rate)
        }
    }
}

/// Base-level activation: `ln(Σ (now − tᵢ)^−d)` over the retained history.
///
/// When more accesses occurred than the ring retains, the unretained tail is
/// approximated analytically between the oldest retained access and the very
/// first access (Petrov's uniform-spacing estimate).
pub fn base_level(
    history: &[u64],
    total_accesses: u64,
    first_access: u64,
    now: u64,
    decay_rate: f64,
) -> f64 {
    if total_accesses == 0 || history.is_empty() {
        return ACT_LOW;
    }

    let mut sum = 0.0;
    for &t in history.iter().take(HISTORY_SLOTS) {
        let age = now.saturating_sub(t).max(1) as f64;
        sum += age.powf(-decay_rate);
    }

    let retained = history.len().min(HISTORY_SLOTS) as u64;
    if total_accesses > retained {
        // Ages of the first access and of the oldest retained access.
        let t_n = now.saturating_sub(first_access).max(1) as f64;
        let t_k = now.saturating_sub(history[history.len().min(HISTORY_SLOTS) - 1]).max(1) as f64;
        let one_minus_d = 1.0 - decay_rate;
        if (t_n - t_k).abs() > f64::EPSILON && one_minus_d.abs() > f64::EPSILON {
            sum += (total_accesses - retained) as f64
                * (t_n.powf(one_minus_d) - t_k.powf(one_minus_d))
                / (one_minus_d * (t_n - t_k));
        }
    }

    if sum > 0.0 && sum.is_finite() {
        sum.ln()
    } else {
        ACT_LOW
    }
}
