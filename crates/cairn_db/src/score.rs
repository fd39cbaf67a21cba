//! Stale-data scoring for write routing.

use std::collections::HashMap;

use crate::part::{MemEntry, ENTRY_OVERHEAD};

/// Estimates how many stale, reclaimable bytes a part holds.
///
/// Simulates evicting the oldest half of the part's capacity and sums
/// `size * age_scale` over the simulated eviction set, where the age scale
/// grows linearly with the entry's age and doubles every `period_ms`
/// milliseconds. The router writes to the highest-scoring part when every
/// shard is full, forcing that part's own eviction to run.
pub(crate) fn eviction_score(
    entries: &HashMap<u64, MemEntry>,
    capacity: u64,
    period_ms: u64,
    now: u64,
) -> f64 {
    let mut candidates: Vec<&MemEntry> = entries.values().collect();
    candidates.sort_by_key(|entry| entry.last_access);

    let half = capacity / 2;
    let mut simulated = 0u64;
    let mut score = 0.0;
    for entry in candidates {
        if simulated >= half {
            break;
        }
        let age_ms = now.saturating_sub(entry.last_access);
        let age_scale = 1.0 + age_ms as f64 / period_ms as f64;
        score += entry.size as f64 * age_scale;
        simulated += ENTRY_OVERHEAD + entry.size as u64;
    }
    score
}
