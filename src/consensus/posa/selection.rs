//! Weighted random sampling of eligible validators into the next span.

use super::{PosaError, Validator};
use alloy_consensus::Header;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Sample the producer list for the next span.
///
/// The draw is seeded from the leading eight bytes of the seed header's hash,
/// so every node selecting from the same chain state computes the same
/// committee. Validators appear once per draw: a validator holding more
/// voting power is sampled (and therefore scheduled) proportionally more
/// often, duplicates included.
pub fn select_next_validator_set(
    seed_header: &Header,
    eligible: &[Validator],
    span: u64,
) -> Result<Vec<Validator>, PosaError> {
    let seed_hash = seed_header.hash_slow();
    let mut seed_bytes = [0u8; 8];
    seed_bytes.copy_from_slice(&seed_hash[..8]);
    let mut rng = StdRng::seed_from_u64(u64::from_be_bytes(seed_bytes));

    let weights: Vec<u64> = eligible
        .iter()
        .map(|validator| validator.voting_power)
        .collect();
    let (ranges, total_power) = create_weighted_ranges(&weights);
    if total_power == 0 {
        return Err(PosaError::InvalidSpan);
    }

    let mut producers = Vec::with_capacity(span as usize);
    for _ in 0..span {
        // Draws live in [1, total_power]: with two single-stake validators
        // the ranges are (1, 2), and an inclusive roll over 0..=2 would skew
        // the first one to a 2/3 chance.
        let target = random_range_inclusive(&mut rng, 1, total_power);
        let index = binary_search(&ranges, target);
        producers.push(eligible[index]);
    }

    Ok(producers)
}

/// First index whose cumulative weight is >= `search`.
fn binary_search(ranges: &[u64], search: u64) -> usize {
    let mut low = 0;
    let mut high = ranges.len().saturating_sub(1);
    while low < high {
        let mid = (low + high) / 2;
        if ranges[mid] >= search {
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    low
}

/// Unbiased uniform draw in `[min, max]`, reject-sampling values that would
/// wrap unevenly over the range.
fn random_range_inclusive(rng: &mut StdRng, min: u64, max: u64) -> u64 {
    if max <= min {
        return max;
    }
    let range = max - min + 1;
    let max_allowed = u64::MAX - u64::MAX % range - 1;
    let mut value: u64 = rng.gen();
    while value >= max_allowed {
        value = rng.gen();
    }
    min + value % range
}

/// Convert weights `[1, 2, 3]` into cumulative form `[1, 3, 6]`.
fn create_weighted_ranges(weights: &[u64]) -> (Vec<u64>, u64) {
    let mut ranges = Vec::with_capacity(weights.len());
    let mut total = 0u64;
    for weight in weights {
        total += weight;
        ranges.push(total);
    }
    (ranges, total)
}
