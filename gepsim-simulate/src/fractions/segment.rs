use rand::Rng;
use rand::seq::SliceRandom;

use super::round_fractions;
use crate::consts::MAX_PRIOR_ATTEMPTS;
use crate::errors::{Result, SimulationError};

///
/// Partition `max_value` units over `k` types: each of the first `k - 1` types takes a
/// random cut of what is left, the last type takes the remainder. The cuts are then
/// shuffled across types and scaled to sum to 1.
///
fn draw<R: Rng + ?Sized>(k: usize, max_value: u32, rng: &mut R) -> Vec<f64> {
    let mut left = max_value;
    let mut cuts = Vec::with_capacity(k);
    for _ in 0..k.saturating_sub(1) {
        let cut = match left {
            0 => 0,
            1 => 1,
            _ => rng.random_range(0..left),
        };
        left -= cut;
        cuts.push(cut);
    }
    cuts.push(left);
    cuts.shuffle(rng);

    cuts.into_iter()
        .map(|c| c as f64 / max_value as f64)
        .collect()
}

pub(super) fn generate<R: Rng + ?Sized>(
    n: usize,
    k: usize,
    max_value: u32,
    prior: Option<&[[f64; 2]]>,
    rng: &mut R,
) -> Result<Vec<Vec<f64>>> {
    let mut rows = Vec::with_capacity(n);
    let mut attempts = 0usize;
    while rows.len() < n {
        // the prior is checked on the values that will be written
        let mut row = draw(k, max_value, rng);
        round_fractions(&mut row);
        let within_prior = prior.is_none_or(|bounds| {
            row.iter()
                .zip(bounds)
                .all(|(f, [low, high])| *f >= *low && *f <= *high)
        });

        if within_prior {
            rows.push(row);
            attempts = 0;
        } else {
            attempts += 1;
            if attempts >= MAX_PRIOR_ATTEMPTS {
                return Err(SimulationError::InvalidArgument(format!(
                    "no segment draw satisfied the prior ranges in {} attempts",
                    MAX_PRIOR_ATTEMPTS
                )));
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::*;

    #[rstest]
    #[case(3, 10_000)]
    #[case(8, 10)]
    #[case(5, 1)]
    fn test_draw_uses_whole_budget(#[case] k: usize, #[case] max_value: u32) {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..50 {
            let row = draw(k, max_value, &mut rng);
            assert_eq!(row.len(), k);
            let units: f64 = row.iter().map(|f| f * max_value as f64).sum();
            assert!((units - max_value as f64).abs() < 1e-6);
        }
    }

    #[rstest]
    fn test_impossible_prior_gives_up() {
        let mut rng = StdRng::seed_from_u64(5);
        // both types above 0.6 can never happen
        let prior = [[0.6, 1.0], [0.6, 1.0]];
        let result = generate(1, 2, 100, Some(&prior), &mut rng);
        assert!(matches!(result, Err(SimulationError::InvalidArgument(_))));
    }

    #[rstest]
    fn test_prior_holds_after_rounding() {
        let mut rng = StdRng::seed_from_u64(9);
        // thirds round to 0.3333 and the residual lands on the first type as 0.3334
        let prior = [[0.0, 0.33335], [0.0, 1.0], [0.0, 1.0]];
        let rows = generate(300, 3, 3, Some(&prior), &mut rng).unwrap();
        assert_eq!(rows.len(), 300);
        for row in &rows {
            assert!(row[0] <= 0.33335, "{:?}", row);
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
    }
}
