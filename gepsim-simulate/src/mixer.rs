use gepsim_core::utils::{log2_p1, normalize_to_tpm, round_to};
use gepsim_core::{CellPool, FractionTable, FractionVector};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::consts::{
    DEFAULT_NOISE_F, DEFAULT_NOISE_MEAN, DEFAULT_NOISE_S, PROFILE_DECIMALS, TPM_DECIMALS,
};
use crate::errors::{Result, SimulationError};
use crate::picker::SampledCellSet;
use crate::rng::{Stream, stream_rng};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixMethod {
    /// Mean of every selected cell; for single-cell-type profiles
    Average,
    /// Fraction-weighted sum of one representative profile per cell type
    #[default]
    WeightedMix,
}

impl MixMethod {
    ///
    /// Weighted mixing needs one drawn cell for every cell type in a sample, so a cell
    /// budget below the number of cell types cannot be honoured. 0 means one cell per type.
    ///
    pub fn check_cell_budget(&self, total_cells: usize, n_cell_types: usize) -> Result<()> {
        if *self == MixMethod::WeightedMix && total_cells > 0 && total_cells < n_cell_types {
            return Err(SimulationError::InvalidArgument(format!(
                "weighted_mix needs total_cells = 0 or at least one cell per cell type ({}), got {}",
                n_cell_types, total_cells
            )));
        }
        Ok(())
    }
}

///
/// Multiplicative log-normal noise: `2^x` per gene with `x ~ Normal(mean, f * log2(s))`.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseModel {
    #[serde(default = "default_noise_mean")]
    pub mean: f64,
    #[serde(default = "default_noise_s")]
    pub s: f64,
    #[serde(default = "default_noise_f")]
    pub f: f64,
    /// Upper bound on the summed noise of one profile
    pub max_total: f64,
}

fn default_noise_mean() -> f64 {
    DEFAULT_NOISE_MEAN
}

fn default_noise_s() -> f64 {
    DEFAULT_NOISE_S
}

fn default_noise_f() -> f64 {
    DEFAULT_NOISE_F
}

impl NoiseModel {
    pub fn sigma(&self) -> f64 {
        self.f * self.s.log2()
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sigma() > 0.0) || !(self.max_total > 0.0) {
            return Err(SimulationError::InvalidArgument(format!(
                "noise needs f * log2(s) > 0 and max_total > 0, got sigma {} and max_total {}",
                self.sigma(),
                self.max_total
            )));
        }
        Ok(())
    }

    pub fn sample<R: Rng + ?Sized>(&self, n_genes: usize, rng: &mut R) -> Result<Array1<f64>> {
        let normal = Normal::new(self.mean, self.sigma())
            .map_err(|e| SimulationError::InvalidArgument(format!("noise distribution: {}", e)))?;
        let mut noise: Array1<f64> = (0..n_genes).map(|_| normal.sample(rng).exp2()).collect();

        let total = noise.sum();
        if total > self.max_total {
            noise.mapv_inplace(|v| v / total * self.max_total);
        }
        Ok(noise)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MixerOptions {
    pub method: MixMethod,
    pub noise: Option<NoiseModel>,
    /// Add uniform(0, 1) to averaged genes below 1
    pub fill_low_values: bool,
}

///
/// Synthetic profiles of one round, in TPM units.
///
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileBatch {
    pub sample_ids: Vec<String>,
    pub genes: Vec<String>,
    pub tpm: Array2<f64>,
}

impl ProfileBatch {
    pub fn len(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_ids.is_empty()
    }

    pub fn row(&self, i: usize) -> ArrayView1<'_, f64> {
        self.tpm.row(i)
    }

    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            sample_ids: indices.iter().map(|i| self.sample_ids[*i].clone()).collect(),
            genes: self.genes.clone(),
            tpm: self.tpm.select(Axis(0), indices),
        }
    }

    /// The persisted representation: `log2(TPM + 1)`, rounded.
    pub fn to_log2(&self) -> Array2<f64> {
        self.tpm
            .mapv(|v| round_to(log2_p1(v), PROFILE_DECIMALS))
    }
}

///
/// `expression.t() · fractions`: one representative row per cell type in `expression`,
/// weighted by the matching entry of `fractions`.
///
pub fn weighted_mix(expression: ArrayView2<f64>, fractions: ArrayView1<f64>) -> Array1<f64> {
    expression.t().dot(&fractions)
}

pub struct Mixer<'a> {
    pool: &'a CellPool,
    options: MixerOptions,
}

impl<'a> Mixer<'a> {
    pub fn new(pool: &'a CellPool, options: MixerOptions) -> Result<Self> {
        if let Some(noise) = &options.noise {
            noise.validate()?;
        }
        Ok(Self { pool, options })
    }

    ///
    /// Mix every sampled cell set into a TPM profile, in the order of `sets`.
    ///
    pub fn mix(
        &self,
        sets: &[SampledCellSet],
        fractions: &FractionTable,
        seed: u64,
        round: u64,
    ) -> Result<ProfileBatch> {
        if sets.len() != fractions.len() {
            return Err(SimulationError::InvalidArgument(format!(
                "{} cell sets for {} fraction vectors",
                sets.len(),
                fractions.len()
            )));
        }

        let profiles = sets
            .par_iter()
            .zip(fractions.rows.par_iter())
            .enumerate()
            .map(|(i, (set, fraction))| {
                let mut profile = self.mix_linear(set, fraction, &fractions.cell_types, seed, round, i as u64)?;
                normalize_to_tpm(profile.view_mut());
                profile.mapv_inplace(|v| round_to(v, TPM_DECIMALS));
                Ok(profile)
            })
            .collect::<Result<Vec<Array1<f64>>>>()?;

        let mut tpm = Array2::<f64>::zeros((profiles.len(), self.pool.genes().len()));
        for (mut row, profile) in tpm.axis_iter_mut(Axis(0)).zip(profiles) {
            row.assign(&profile);
        }

        Ok(ProfileBatch {
            sample_ids: sets.iter().map(|s| s.sample_id.clone()).collect(),
            genes: self.pool.genes().to_vec(),
            tpm,
        })
    }

    ///
    /// The linear-space profile of one sample, before TPM normalisation.
    ///
    pub fn mix_linear(
        &self,
        set: &SampledCellSet,
        fraction: &FractionVector,
        cell_types: &[String],
        seed: u64,
        round: u64,
        item: u64,
    ) -> Result<Array1<f64>> {
        if set.draws.is_empty() {
            return Err(SimulationError::InsufficientData(format!(
                "no cells were drawn for sample {}",
                set.sample_id
            )));
        }

        let mut profile = match self.options.method {
            MixMethod::Average => {
                let positions: Vec<usize> = set
                    .draws
                    .iter()
                    .flat_map(|d| d.positions.iter().copied())
                    .collect();
                let mut profile = self.mean_expression(&positions);
                if self.options.fill_low_values {
                    let mut rng = stream_rng(seed, Stream::LowValueFill, round, item);
                    profile.mapv_inplace(|v| if v < 1.0 { v + rng.random::<f64>() } else { v });
                }
                profile
            }
            MixMethod::WeightedMix => {
                let mut weights = Vec::with_capacity(set.draws.len());
                let mut representatives = Array2::<f64>::zeros((set.draws.len(), self.pool.genes().len()));
                for (draw, mut row) in set.draws.iter().zip(representatives.axis_iter_mut(Axis(0))) {
                    let t = cell_types
                        .iter()
                        .position(|c| *c == draw.cell_type)
                        .filter(|t| fraction.fractions[*t] > 0.0)
                        .ok_or_else(|| {
                            SimulationError::InvalidArgument(format!(
                                "cell type {} of sample {} has no non-zero fraction",
                                draw.cell_type, set.sample_id
                            ))
                        })?;
                    weights.push(fraction.fractions[t]);
                    row.assign(&self.mean_expression(&draw.positions));
                }
                if weights.len() != fraction.active().len() {
                    return Err(SimulationError::InvalidArgument(format!(
                        "sample {} mixes {} cell types but has {} non-zero fractions",
                        set.sample_id,
                        weights.len(),
                        fraction.active().len()
                    )));
                }
                weighted_mix(representatives.view(), Array1::from(weights).view())
            }
        };

        if let Some(noise) = &self.options.noise {
            let mut rng = stream_rng(seed, Stream::Noise, round, item);
            profile += &noise.sample(profile.len(), &mut rng)?;
        }
        Ok(profile)
    }

    fn mean_expression(&self, positions: &[usize]) -> Array1<f64> {
        let mut total = Array1::<f64>::zeros(self.pool.genes().len());
        for p in positions {
            total += &self.pool.expression_row(*p);
        }
        total / positions.len().max(1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::picker::{CellPicker, PickerOptions};
    use gepsim_core::CellRecord;
    use ndarray::array;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::*;

    #[fixture]
    fn pool() -> CellPool {
        let cells = vec![
            CellRecord::new("a1".into(), "A".into(), "p1".into()),
            CellRecord::new("b1".into(), "B".into(), "p1".into()),
        ];
        CellPool::new(
            cells,
            vec!["g1".into(), "g2".into()],
            array![[10.0, 0.0], [0.0, 20.0]],
        )
        .unwrap()
    }

    fn fractions(rows: Vec<Vec<f64>>) -> FractionTable {
        FractionTable::with_rows(
            vec!["A".into(), "B".into()],
            rows.into_iter()
                .enumerate()
                .map(|(i, f)| FractionVector::new(format!("s_{}", i), f))
                .collect(),
        )
        .unwrap()
    }

    fn pick(pool: &CellPool, table: &FractionTable) -> Vec<SampledCellSet> {
        let options = PickerOptions {
            total_cells: 0,
            per_patient: false,
            with_replacement: false,
            threads: Some(1),
        };
        CellPicker::new(pool, options).unwrap().pick(table, 1, 0).unwrap()
    }

    #[rstest]
    fn test_weighted_mix_is_a_matrix_product() {
        let expression = array![[10.0, 0.0], [0.0, 20.0]];
        let profile = weighted_mix(expression.view(), array![0.3, 0.7].view());
        assert!((profile[0] - 3.0).abs() < 1e-12);
        assert!((profile[1] - 14.0).abs() < 1e-12);
    }

    #[rstest]
    fn test_mix_linear_weighted(pool: CellPool) {
        let table = fractions(vec![vec![0.3, 0.7]]);
        let sets = pick(&pool, &table);
        let mixer = Mixer::new(&pool, MixerOptions::default()).unwrap();
        let profile = mixer
            .mix_linear(&sets[0], &table.rows[0], &table.cell_types, 1, 0, 0)
            .unwrap();
        assert!((profile[0] - 3.0).abs() < 1e-12);
        assert!((profile[1] - 14.0).abs() < 1e-12);
    }

    #[rstest]
    fn test_mix_batch_in_tpm(pool: CellPool) {
        let table = fractions(vec![vec![0.3, 0.7], vec![1.0, 0.0]]);
        let sets = pick(&pool, &table);
        let batch = Mixer::new(&pool, MixerOptions::default())
            .unwrap()
            .mix(&sets, &table, 1, 0)
            .unwrap();
        assert_eq!(batch.sample_ids, vec!["s_0".to_string(), "s_1".to_string()]);
        assert_eq!(batch.row(1).to_vec(), vec![1e6, 0.0]);
        // 3 / 17 and 14 / 17 of a million
        assert_eq!(batch.row(0).to_vec(), vec![176470.588, 823529.412]);
        assert_eq!(batch.to_log2().row(1).to_vec(), vec![19.93, 0.0]);
    }

    #[rstest]
    fn test_average_with_fill(pool: CellPool) {
        let table = fractions(vec![vec![1.0, 0.0]]);
        let sets = pick(&pool, &table);
        let options = MixerOptions {
            method: MixMethod::Average,
            noise: None,
            fill_low_values: true,
        };
        let profile = Mixer::new(&pool, options)
            .unwrap()
            .mix_linear(&sets[0], &table.rows[0], &table.cell_types, 1, 0, 0)
            .unwrap();
        assert_eq!(profile[0], 10.0);
        assert!(profile[1] >= 0.0 && profile[1] < 1.0);
    }

    #[rstest]
    fn test_noise_is_capped() {
        let noise = NoiseModel {
            mean: 0.0,
            s: 566.1,
            f: 0.25,
            max_total: 100.0,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let sample = noise.sample(1000, &mut rng).unwrap();
        assert!(sample.iter().all(|v| *v > 0.0));
        assert!(sample.sum() <= 100.0 + 1e-9);
    }

    #[rstest]
    fn test_invalid_noise_rejected(pool: CellPool) {
        let options = MixerOptions {
            method: MixMethod::WeightedMix,
            noise: Some(NoiseModel {
                mean: 0.0,
                s: 1.0,
                f: 0.25,
                max_total: 10.0,
            }),
            fill_low_values: false,
        };
        assert!(Mixer::new(&pool, options).is_err());
    }
}
