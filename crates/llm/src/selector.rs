//! Weighted provider selection.

use std::sync::Arc;

use rand::Rng;
use tokio::time::Instant;

use crate::{
    breaker::{BreakerPermit, CircuitBreakers},
    error::LlmError,
    snapshot::{Credential, ProviderEntry, Snapshot},
};

/// The outcome of a selection: where the request goes and under which model name.
#[derive(Debug)]
pub struct Selection<'a> {
    pub provider: &'a ProviderEntry,
    /// Model name sent upstream.
    pub model: String,
    pub permit: BreakerPermit,
}

/// Picks the index whose cumulative weight first exceeds `draw`, for a draw in `[0, sum)`.
pub fn pick_weighted(weights: &[u32], draw: u64) -> Option<usize> {
    let mut cumulative = 0u64;

    for (index, weight) in weights.iter().enumerate() {
        cumulative += u64::from(*weight);

        if draw < cumulative {
            return Some(index);
        }
    }

    None
}

/// Selects a provider for `requested` with a random draw.
pub fn select<'a>(
    snapshot: &'a Snapshot,
    breakers: &Arc<CircuitBreakers>,
    requested: &str,
    credential: &Credential,
) -> crate::Result<Selection<'a>> {
    select_with(snapshot, breakers, requested, credential, |total| {
        rand::thread_rng().gen_range(0..total)
    })
}

/// Selects a provider with a caller-supplied draw in `[0, total)`.
pub fn select_with<'a, F>(
    snapshot: &'a Snapshot,
    breakers: &Arc<CircuitBreakers>,
    requested: &str,
    credential: &Credential,
    mut draw: F,
) -> crate::Result<Selection<'a>>
where
    F: FnMut(u64) -> u64,
{
    let requested = snapshot.strip_prefix(requested);
    let now = Instant::now();

    let allowed: Vec<(&ProviderEntry, String)> = snapshot
        .providers
        .iter()
        .filter(|provider| provider.enabled)
        .filter_map(|provider| provider.resolve_model(requested).map(|model| (provider, model)))
        .filter(|(_, model)| credential.allows(requested) || credential.allows(model))
        .collect();

    if allowed.is_empty() && credential.is_restricted() && !credential.allows(requested) {
        return Err(LlmError::ModelNotAllowed(requested.to_string()));
    }

    let mut candidates: Vec<_> = allowed
        .into_iter()
        .filter(|(provider, _)| breakers.is_eligible(&provider.id, &snapshot.breaker, now))
        .collect();

    // A probe can be taken by a concurrent selection between the filter and the permit.
    while !candidates.is_empty() {
        let weights: Vec<u32> = candidates.iter().map(|(provider, _)| provider.weight).collect();
        let total: u64 = weights.iter().map(|weight| u64::from(*weight)).sum();

        let Some(index) = pick_weighted(&weights, draw(total)) else {
            break;
        };

        let (provider, model) = candidates.swap_remove(index);

        if let Some(permit) = breakers.try_acquire(&provider.id, &snapshot.breaker, now) {
            log::debug!("Selected provider '{}' for model '{requested}' as '{model}'", provider.id);

            return Ok(Selection {
                provider,
                model,
                permit,
            });
        }
    }

    log::warn!("No eligible provider for model '{requested}'");

    Err(LlmError::NoEligibleProvider(requested.to_string()))
}
