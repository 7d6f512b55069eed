//! Seedable randomness for the venue simulators.

use rand::rngs::StdRng;
use rand::SeedableRng;

/// Build the simulator RNG. `Some(seed)` gives fully reproducible runs
/// (`SWD_MOCK_SEED`); `None` pulls from OS entropy for production-ish noise.
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}
