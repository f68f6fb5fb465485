use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::seq::SliceRandom;

use super::{argmax, normalize};
use crate::errors::{Result, SimulationError};

///
/// One fraction per type: pick a bin of that type's histogram over [0, 1] by its weight,
/// then a uniform point inside the bin. Rows are scaled to 1, entries under
/// `minimal_fraction` are zeroed and rows are scaled again.
///
pub(super) fn generate<R: Rng + ?Sized>(
    n: usize,
    weights: &[Vec<f64>],
    minimal_fraction: f64,
    rng: &mut R,
) -> Result<Vec<Vec<f64>>> {
    let histograms = weights
        .iter()
        .map(|w| {
            WeightedIndex::new(w)
                .map(|index| (index, 1.0 / w.len() as f64))
                .map_err(|e| SimulationError::InvalidArgument(format!("bin weights: {}", e)))
        })
        .collect::<Result<Vec<_>>>()?;

    let rows = (0..n)
        .map(|_| {
            let mut row: Vec<f64> = histograms
                .iter()
                .map(|(index, width)| {
                    let bin = index.sample(rng) as f64;
                    (bin + rng.random::<f64>()) * width
                })
                .collect();
            normalize(&mut row);

            let largest = argmax(&row);
            row.iter_mut()
                .filter(|v| **v < minimal_fraction)
                .for_each(|v| *v = 0.0);
            if row.iter().all(|v| *v == 0.0) {
                row[largest] = 1.0;
            }
            normalize(&mut row);
            row
        })
        .collect();

    Ok(rows)
}

///
/// Sub-datasets over random cell-type subsets. The `n` rows are split evenly over
/// `sizes` (the first sizes take the remainder). Each sub-dataset draws fractions for
/// `size` types and every row then has its entries shuffled across all types, so each
/// row has its own active subset.
///
pub(super) fn generate_subsets<R: Rng + ?Sized>(
    n: usize,
    weights: &[Vec<f64>],
    minimal_fraction: f64,
    sizes: &[usize],
    rng: &mut R,
) -> Result<Vec<Vec<f64>>> {
    let k = weights.len();
    let per_size = n / sizes.len();
    let extra = n % sizes.len();

    let mut rows = Vec::with_capacity(n);
    for (i, size) in sizes.iter().enumerate() {
        let count = per_size + usize::from(i < extra);
        for mut row in generate(count, &weights[..*size], minimal_fraction, rng)? {
            row.resize(k, 0.0);
            row.shuffle(rng);
            rows.push(row);
        }
    }
    Ok(rows)
}
