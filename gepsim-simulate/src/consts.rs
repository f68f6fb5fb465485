pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// fractions
pub const FRACTION_DECIMALS: i32 = 4;
pub const DEFAULT_SEGMENT_MAX_VALUE: u32 = 10_000;
pub const DEFAULT_FRAGMENT_BINS: usize = 10;
pub const DEFAULT_MINIMAL_FRACTION: f64 = 0.005;
pub const MAX_PRIOR_ATTEMPTS: usize = 100_000;

// mixing
pub const TPM_DECIMALS: i32 = 3;
pub const PROFILE_DECIMALS: i32 = 2;
pub const DEFAULT_TOTAL_CELLS: usize = 500;
pub const DEFAULT_NOISE_MEAN: f64 = 0.0;
pub const DEFAULT_NOISE_S: f64 = 566.1;
pub const DEFAULT_NOISE_F: f64 = 0.25;
pub const DEFAULT_ZERO_RATIO_THRESHOLD: f64 = 0.97;

// filtering
pub const DEFAULT_N_TOP: usize = 20;
pub const DEFAULT_MIN_ACCEPTED_PER_ROUND: usize = 50;
pub const QUANTILE_STEP: f64 = 0.001;
pub const QUANTILE_FINE_STEP: f64 = 0.0001;
pub const QUANTILE_FINE_FROM: f64 = 0.999;
pub const QUANTILE_CEILING: f64 = 0.9999;
pub const QUANTILE_DECIMALS: i32 = 4;
pub const DEFAULT_GENE_QUANTILES: [f64; 3] = [0.005, 0.5, 0.995];
pub const DEFAULT_MIN_FRACTION_IN_RANGE: f64 = 0.95;

// generation
pub const FILTERED_BATCH_SIZE: usize = 5000;
pub const UNFILTERED_BATCH_SIZE: usize = 1000;
/// Consecutive rounds without a single accepted candidate before a job gives up
pub const MAX_EMPTY_ROUNDS: u64 = 20;
pub const RESERVED_THREADS: usize = 2;

pub fn get_thread_count(requested: Option<usize>) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(RESERVED_THREADS)
        .max(1);
    match requested {
        Some(n) => n.clamp(1, available),
        None => available,
    }
}
