//! Circuit breakers: budget and failure-rate limits.
//!
//! The breaker values live inside the persistent [`State`] record; this
//! module only holds the limits and the check/update logic. Checks require
//! the exclusive state lock as a parameter so that the check and the
//! subsequent transition cannot race a concurrent writer.

use crate::config::PricingConfig;
use crate::store::{ModelTier, State, StateLock, state::MAX_ERROR_KEYS};

pub const MAX_TOKENS: u64 = 500_000;
pub const MAX_COST_USD: f64 = 40.0;
pub const MAX_SAME_ERROR: u32 = 3;
pub const MAX_HEAL_ATTEMPTS: u32 = 5;

/// Orphan count at which the process-registry sweep pauses the project.
pub const ORPHAN_TRIP_THRESHOLD: usize = 3;

/// Why a breaker tripped.
#[derive(Debug, Clone, PartialEq)]
pub enum TripReason {
    TokenBudget { total: u64 },
    CostBudget { total: f64 },
    RepeatedError { key: String, count: u32 },
    HealAttempts { attempts: u32 },
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::TokenBudget { total } => {
                write!(f, "Circuit breaker: Token limit exceeded ({} > {})", total, MAX_TOKENS)
            }
            TripReason::CostBudget { total } => write!(
                f,
                "Circuit breaker: Cost limit exceeded (${:.2} > ${:.2})",
                total, MAX_COST_USD
            ),
            TripReason::RepeatedError { key, count } => {
                write!(f, "Circuit breaker: Same error occurred {} times: {}", count, key)
            }
            TripReason::HealAttempts { attempts } => write!(
                f,
                "Circuit breaker: Max heal attempts exceeded ({} >= {})",
                attempts, MAX_HEAL_ATTEMPTS
            ),
        }
    }
}

/// Check every breaker against the current state. Returns the first trip
/// reason, or `None` when all budgets hold. The `StateLock` parameter is the
/// proof that the caller holds the lock for the whole check-then-transition
/// cycle.
pub fn check(state: &State, _lock: &StateLock) -> Option<TripReason> {
    let breakers = &state.circuit_breakers;

    if breakers.total_tokens > MAX_TOKENS {
        return Some(TripReason::TokenBudget {
            total: breakers.total_tokens,
        });
    }
    if breakers.total_cost_usd > MAX_COST_USD {
        return Some(TripReason::CostBudget {
            total: breakers.total_cost_usd,
        });
    }
    for (key, count) in &breakers.error_counts {
        if *count >= MAX_SAME_ERROR {
            return Some(TripReason::RepeatedError {
                key: key.clone(),
                count: *count,
            });
        }
    }
    if state.heal_attempts >= MAX_HEAL_ATTEMPTS {
        return Some(TripReason::HealAttempts {
            attempts: state.heal_attempts,
        });
    }
    None
}

/// Accumulate token/cost usage and error counts.
///
/// The error key is the first 100 chars of the message; when the map grows
/// past [`MAX_ERROR_KEYS`] entries the least-frequent key is evicted.
pub fn update(
    state: &mut State,
    tokens: u64,
    tier: ModelTier,
    error: Option<&str>,
    pricing: &PricingConfig,
) {
    let breakers = &mut state.circuit_breakers;
    breakers.total_tokens += tokens;
    breakers.total_cost_usd += pricing.estimate_cost(tokens, tier);

    if let Some(error) = error {
        let key: String = error.chars().take(100).collect();
        *breakers.error_counts.entry(key).or_insert(0) += 1;

        if breakers.error_counts.len() > MAX_ERROR_KEYS {
            // BTreeMap iteration order makes the eviction deterministic:
            // smallest count, first key in sort order.
            if let Some(least) = breakers
                .error_counts
                .iter()
                .min_by_key(|(_, count)| **count)
                .map(|(key, _)| key.clone())
            {
                breakers.error_counts.remove(&least);
            }
        }
    }
}
