//! Utility functions.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Seed libtorch (when enabled) and return the rank's RNG.
///
/// Each rank draws from its own stream so learners do not sample the same
/// exploration noise as the player.
pub fn seed_rank(seed: u64, rank: usize) -> ChaCha8Rng {
    #[cfg(feature = "torch")]
    tch::manual_seed(seed.wrapping_add(rank as u64) as i64);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(rank as u64);
    rng
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_rank_streams_differ() {
        let a: u64 = seed_rank(7, 0).gen();
        let b: u64 = seed_rank(7, 1).gen();
        let a_again: u64 = seed_rank(7, 0).gen();
        assert_ne!(a, b);
        assert_eq!(a, a_again);
    }
}
