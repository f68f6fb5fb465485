use rand::Rng;
use rand::seq::SliceRandom;

use super::normalize;

pub(super) fn seg_random<R: Rng + ?Sized>(n: usize, k: usize, rng: &mut R) -> Vec<Vec<f64>> {
    (0..n)
        .map(|_| {
            let dominant: f64 = rng.random();
            let mut others: Vec<f64> = (1..k).map(|_| rng.random()).collect();
            normalize(&mut others);

            let mut row = Vec::with_capacity(k);
            row.push(dominant);
            row.extend(others.iter().map(|o| o * (1.0 - dominant)));
            normalize(&mut row);
            row.shuffle(rng);
            row
        })
        .collect()
}

///
/// Independent uniform draws per type. With `percent_ranges`, type `i` draws an integer
/// percentage from `[low, high)` instead.
///
pub(super) fn random<R: Rng + ?Sized>(
    n: usize,
    k: usize,
    percent_ranges: Option<&[[u32; 2]]>,
    rng: &mut R,
) -> Vec<Vec<f64>> {
    (0..n)
        .map(|_| {
            let mut row: Vec<f64> = match percent_ranges {
                Some(ranges) => ranges
                    .iter()
                    .map(|[low, high]| rng.random_range(*low..*high) as f64 / 100.0)
                    .collect(),
                None => (0..k).map(|_| rng.random()).collect(),
            };
            if row.iter().all(|v| *v == 0.0) {
                row = vec![1.0; k];
            }
            normalize(&mut row);
            row
        })
        .collect()
}
