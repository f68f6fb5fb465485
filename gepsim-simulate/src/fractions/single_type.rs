use rand::Rng;
use rand::seq::index;

/// `n` one-hot rows, the same number per type (earlier types take the remainder).
pub(super) fn positive(n: usize, k: usize) -> Vec<Vec<f64>> {
    (0..k)
        .flat_map(|t| {
            let count = n / k + usize::from(t < n % k);
            std::iter::repeat_n(t, count)
        })
        .map(|t| {
            let mut row = vec![0.0; k];
            row[t] = 1.0;
            row
        })
        .collect()
}

/// Rows mixing `m` random types at `1/m` each, with `n` split evenly over `m = 2..=k`.
pub(super) fn negative<R: Rng + ?Sized>(n: usize, k: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let sizes: Vec<usize> = (2..=k).collect();
    let mut rows = Vec::with_capacity(n);
    for (i, m) in sizes.iter().enumerate() {
        let count = n / sizes.len() + usize::from(i < n % sizes.len());
        for _ in 0..count {
            let mut row = vec![0.0; k];
            for t in index::sample(rng, k, *m) {
                row[t] = 1.0 / *m as f64;
            }
            rows.push(row);
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::*;

    #[rstest]
    fn test_positive_balances_types() {
        let rows = positive(7, 3);
        assert_eq!(rows.len(), 7);
        let per_type: Vec<usize> = (0..3)
            .map(|t| rows.iter().filter(|r| r[t] == 1.0).count())
            .collect();
        assert_eq!(per_type, vec![3, 2, 2]);
    }

    #[rstest]
    fn test_negative_mixes_at_least_two_types() {
        let mut rng = StdRng::seed_from_u64(4);
        let rows = negative(30, 4, &mut rng);
        assert_eq!(rows.len(), 30);
        for row in rows {
            let active: Vec<&f64> = row.iter().filter(|v| **v > 0.0).collect();
            assert!(active.len() >= 2);
            assert!(active.iter().all(|v| **v == *active[0]));
        }
    }
}
