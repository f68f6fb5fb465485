//! Seed derivation for the random streams of a generation job.
//!
//! Every random draw is taken from an rng seeded by `(job seed, stream, round, item)`, so a
//! round reproduces the same numbers regardless of thread scheduling or of how many
//! invocations the job took to get there.

use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Fractions = 1,
    Cells = 2,
    Noise = 3,
    LowValueFill = 4,
    Patients = 5,
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

pub fn derive_seed(seed: u64, stream: Stream, round: u64, item: u64) -> u64 {
    let mut h = splitmix64(seed);
    h = splitmix64(h ^ stream as u64);
    h = splitmix64(h ^ round);
    splitmix64(h ^ item)
}

pub fn stream_rng(seed: u64, stream: Stream, round: u64, item: u64) -> StdRng {
    StdRng::seed_from_u64(derive_seed(seed, stream, round, item))
}
