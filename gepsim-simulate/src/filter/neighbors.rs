//! Brute-force radius queries in the marker-ratio space.
//!
//! The projected spaces are small (one dimension per cell type), so an exhaustive scan
//! parallelised over the reference points is enough.

use gepsim_core::utils::euclidean_distance;
use ndarray::Array2;
use rayon::prelude::*;

/// Distance from every row of `points` to its nearest other row, sorted ascending.
pub fn nearest_other_distances(points: &Array2<f64>) -> Vec<f64> {
    let n = points.nrows();
    let mut distances: Vec<f64> = (0..n)
        .into_par_iter()
        .map(|i| {
            (0..n)
                .filter(|j| *j != i)
                .map(|j| euclidean_distance(points.row(i), points.row(j)))
                .fold(f64::INFINITY, f64::min)
        })
        .collect();
    distances.sort_by(|a, b| a.total_cmp(b));
    distances
}

///
/// For each reference row in `references`, the candidates within `radius` (inclusive),
/// ordered by distance and then by candidate index.
///
pub fn within_radius(
    reference: &Array2<f64>,
    references: &[usize],
    candidates: &Array2<f64>,
    radius: f64,
) -> Vec<Vec<(usize, f64)>> {
    references
        .par_iter()
        .map(|r| {
            let mut hits: Vec<(usize, f64)> = candidates
                .rows()
                .into_iter()
                .enumerate()
                .map(|(c, point)| (c, euclidean_distance(reference.row(*r), point)))
                .filter(|(_, d)| *d <= radius)
                .collect();
            hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            hits
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::array;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[rstest]
    fn test_nearest_other_distances() {
        let points = array![[0.0, 0.0], [3.0, 4.0], [3.0, 5.0]];
        assert_eq!(nearest_other_distances(&points), vec![1.0, 1.0, 5.0]);
    }

    #[rstest]
    fn test_radius_is_inclusive() {
        let reference = array![[0.0, 0.0], [10.0, 10.0]];
        let candidates = array![[3.0, 4.0], [0.0, 1.0], [3.0, 4.1]];
        let hits = within_radius(&reference, &[0, 1], &candidates, 5.0);
        assert_eq!(hits[0], vec![(1, 1.0), (0, 5.0)]);
        assert!(hits[1].is_empty());
    }
}
