//!
//! Cell-type fraction generation.
//!
//! A [`FractionStrategy`] turns a sample count and a list of cell types into a
//! [`FractionTable`] whose rows are non-negative and sum to 1 after rounding to
//! [`FRACTION_DECIMALS`](crate::consts::FRACTION_DECIMALS) decimals.
//!
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use gepsim_core::utils::round_to;
use gepsim_core::{FractionTable, FractionVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::consts::{
    DEFAULT_FRAGMENT_BINS, DEFAULT_MINIMAL_FRACTION, DEFAULT_SEGMENT_MAX_VALUE, FRACTION_DECIMALS,
};
use crate::errors::{Result, SimulationError};

mod fragment;
mod segment;
mod single_type;
mod uniform;

pub const SUPPORTED_STRATEGIES: &[&str] =
    &["segment", "seg_random", "fragment", "random", "single_cell_type"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingleTypeKind {
    /// One cell type per sample, at fraction 1
    #[default]
    Positive,
    /// Two or more cell types per sample, in equal parts
    Negative,
}

///
/// How fraction vectors are drawn.
///
/// In a job file the strategy is a table tagged by `method`:
///
/// ```toml
/// [fractions]
/// method = "fragment"
/// minimal_fraction = 0.005
/// subset_sizes = [2, 4, 6]
/// ```
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum FractionStrategy {
    /// Split an integer budget by successive random cuts.
    Segment {
        #[serde(default = "default_max_value")]
        max_value: u32,
        /// Per-cell-type `[low, high]` fraction range, draws outside any range are discarded
        #[serde(default)]
        prior: Option<BTreeMap<String, [f64; 2]>>,
    },
    /// One dominant uniform draw, the remainder spread over the other types.
    SegRandom,
    /// Per-cell-type histogram draws with jitter inside the drawn bin.
    Fragment {
        /// Per-cell-type bin weights over [0, 1]; types left out are uniform
        #[serde(default)]
        reference_distribution: Option<BTreeMap<String, Vec<f64>>>,
        #[serde(default = "default_minimal_fraction")]
        minimal_fraction: f64,
        /// Sizes of the random cell-type subsets to generate sub-datasets for
        #[serde(default)]
        subset_sizes: Option<Vec<usize>>,
    },
    /// Independent uniform draws per type, normalised.
    Random {
        /// Per-cell-type `[low, high)` integer percent ranges
        #[serde(default)]
        ranges: Option<BTreeMap<String, [u32; 2]>>,
    },
    /// Single-cell-type (positive) or equal-mix (negative) samples.
    SingleCellType {
        #[serde(default)]
        kind: SingleTypeKind,
    },
}

fn default_max_value() -> u32 {
    DEFAULT_SEGMENT_MAX_VALUE
}

fn default_minimal_fraction() -> f64 {
    DEFAULT_MINIMAL_FRACTION
}

impl Default for FractionStrategy {
    fn default() -> Self {
        FractionStrategy::Segment {
            max_value: DEFAULT_SEGMENT_MAX_VALUE,
            prior: None,
        }
    }
}

impl FractionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            FractionStrategy::Segment { .. } => "segment",
            FractionStrategy::SegRandom => "seg_random",
            FractionStrategy::Fragment { .. } => "fragment",
            FractionStrategy::Random { .. } => "random",
            FractionStrategy::SingleCellType { .. } => "single_cell_type",
        }
    }

    ///
    /// Check the strategy parameters against the cell types they will be used with.
    ///
    pub fn validate(&self, cell_types: &[String]) -> Result<()> {
        if cell_types.is_empty() {
            return Err(SimulationError::InvalidArgument(
                "at least one cell type is required".to_string(),
            ));
        }

        match self {
            FractionStrategy::Segment { max_value, prior } => {
                if *max_value == 0 {
                    return Err(SimulationError::InvalidArgument(
                        "segment max_value must be at least 1".to_string(),
                    ));
                }
                if let Some(prior) = prior {
                    for (cell_type, [low, high]) in prior {
                        check_known(cell_types, cell_type, "prior")?;
                        if !(0.0..=1.0).contains(low) || !(0.0..=1.0).contains(high) || low > high {
                            return Err(SimulationError::InvalidArgument(format!(
                                "prior range for {} must satisfy 0 <= low <= high <= 1, got [{}, {}]",
                                cell_type, low, high
                            )));
                        }
                    }
                }
            }
            FractionStrategy::Fragment {
                reference_distribution,
                minimal_fraction,
                subset_sizes,
            } => {
                if !(0.0..1.0).contains(minimal_fraction) {
                    return Err(SimulationError::InvalidArgument(format!(
                        "minimal_fraction must be in [0, 1), got {}",
                        minimal_fraction
                    )));
                }
                if let Some(distributions) = reference_distribution {
                    for (cell_type, weights) in distributions {
                        check_known(cell_types, cell_type, "reference_distribution")?;
                        if weights.is_empty()
                            || weights.iter().any(|w| *w < 0.0 || !w.is_finite())
                            || weights.iter().sum::<f64>() <= 0.0
                        {
                            return Err(SimulationError::InvalidArgument(format!(
                                "reference distribution of {} needs non-negative bin weights with a positive sum",
                                cell_type
                            )));
                        }
                    }
                }
                if let Some(sizes) = subset_sizes {
                    if sizes.is_empty() {
                        return Err(SimulationError::InvalidArgument(
                            "subset_sizes must not be empty".to_string(),
                        ));
                    }
                    if let Some(bad) = sizes.iter().find(|k| **k < 2 || **k > cell_types.len()) {
                        return Err(SimulationError::InvalidArgument(format!(
                            "subset sizes must lie in 2..={}, got {}",
                            cell_types.len(),
                            bad
                        )));
                    }
                }
            }
            FractionStrategy::Random { ranges: Some(ranges) } => {
                for (cell_type, [low, high]) in ranges {
                    if low >= high || *high > 100 {
                        return Err(SimulationError::InvalidArgument(format!(
                            "random range for {} must satisfy low < high <= 100, got [{}, {})",
                            cell_type, low, high
                        )));
                    }
                }
            }
            FractionStrategy::SingleCellType {
                kind: SingleTypeKind::Negative,
            } if cell_types.len() < 2 => {
                return Err(SimulationError::InvalidArgument(
                    "negative single-cell-type samples need at least 2 cell types".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    ///
    /// Draw `n` fraction vectors over `cell_types`.
    ///
    /// # Arguments
    ///
    /// - n: number of vectors
    /// - cell_types: cell types, in column order
    /// - sample_prefix: rows are named `<sample_prefix>_<i>`
    /// - rng: source of randomness
    ///
    pub fn generate<R: Rng + ?Sized>(
        &self,
        n: usize,
        cell_types: &[String],
        sample_prefix: &str,
        rng: &mut R,
    ) -> Result<FractionTable> {
        self.validate(cell_types)?;
        let k = cell_types.len();

        let rows = match self {
            FractionStrategy::Segment { max_value, prior } => {
                let prior = prior.as_ref().map(|p| prior_bounds(p, cell_types));
                segment::generate(n, k, *max_value, prior.as_deref(), rng)?
            }
            FractionStrategy::SegRandom => uniform::seg_random(n, k, rng),
            FractionStrategy::Fragment {
                reference_distribution,
                minimal_fraction,
                subset_sizes,
            } => {
                let weights: Vec<Vec<f64>> = cell_types
                    .iter()
                    .map(|c| {
                        reference_distribution
                            .as_ref()
                            .and_then(|d| d.get(c).cloned())
                            .unwrap_or_else(|| vec![1.0; DEFAULT_FRAGMENT_BINS])
                    })
                    .collect();
                match subset_sizes {
                    Some(sizes) => {
                        fragment::generate_subsets(n, &weights, *minimal_fraction, sizes, rng)?
                    }
                    None => fragment::generate(n, &weights, *minimal_fraction, rng)?,
                }
            }
            FractionStrategy::Random { ranges } => {
                let bounds = ranges.as_ref().and_then(|r| percent_bounds(r, cell_types));
                uniform::random(n, k, bounds.as_deref(), rng)
            }
            FractionStrategy::SingleCellType { kind } => match kind {
                SingleTypeKind::Positive => single_type::positive(n, k),
                SingleTypeKind::Negative => single_type::negative(n, k, rng),
            },
        };

        let mut table = FractionTable::new(cell_types.to_vec());
        for (i, mut row) in rows.into_iter().enumerate() {
            round_fractions(&mut row);
            table.push(FractionVector::new(format!("{}_{}", sample_prefix, i), row))?;
        }
        Ok(table)
    }
}

impl fmt::Display for FractionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for FractionStrategy {
    type Err = SimulationError;

    /// Parse a strategy name into the strategy with its default parameters.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "segment" => Ok(FractionStrategy::default()),
            "seg_random" => Ok(FractionStrategy::SegRandom),
            "fragment" => Ok(FractionStrategy::Fragment {
                reference_distribution: None,
                minimal_fraction: DEFAULT_MINIMAL_FRACTION,
                subset_sizes: None,
            }),
            "random" => Ok(FractionStrategy::Random { ranges: None }),
            "single_cell_type" => Ok(FractionStrategy::SingleCellType {
                kind: SingleTypeKind::Positive,
            }),
            other => Err(SimulationError::InvalidArgument(format!(
                "unsupported fraction strategy '{}', expected one of: {}",
                other,
                SUPPORTED_STRATEGIES.join(", ")
            ))),
        }
    }
}

fn check_known(cell_types: &[String], cell_type: &str, what: &str) -> Result<()> {
    if cell_types.iter().any(|c| c == cell_type) {
        Ok(())
    } else {
        Err(SimulationError::InvalidArgument(format!(
            "{} names unknown cell type {}",
            what, cell_type
        )))
    }
}

/// Positional `[low, high]` bounds; unconstrained types get `[0, 1]`.
fn prior_bounds(prior: &BTreeMap<String, [f64; 2]>, cell_types: &[String]) -> Vec<[f64; 2]> {
    cell_types
        .iter()
        .map(|c| prior.get(c).copied().unwrap_or([0.0, 1.0]))
        .collect()
}

/// Positional percent ranges, or `None` when some cell type has no range.
fn percent_bounds(
    ranges: &BTreeMap<String, [u32; 2]>,
    cell_types: &[String],
) -> Option<Vec<[u32; 2]>> {
    let bounds: Option<Vec<[u32; 2]>> = cell_types.iter().map(|c| ranges.get(c).copied()).collect();
    if bounds.is_none() {
        tracing::warn!(
            "random ranges cover {} of {} cell types, ignoring them and sampling uniformly",
            ranges.len(),
            cell_types.len()
        );
    }
    bounds
}

///
/// Round to [`FRACTION_DECIMALS`] and push the rounding residual onto the largest entry,
/// so that the row sums to 1 at that precision.
///
pub fn round_fractions(row: &mut [f64]) {
    for v in row.iter_mut() {
        *v = round_to(*v, FRACTION_DECIMALS);
    }
    let total: f64 = row.iter().sum();
    if total <= 0.0 {
        return;
    }
    let residual = round_to(1.0 - total, FRACTION_DECIMALS);
    if residual != 0.0 {
        let largest = argmax(row);
        row[largest] = round_to((row[largest] + residual).max(0.0), FRACTION_DECIMALS);
    }
}

pub(crate) fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| {
            if *v > best.1 { (i, *v) } else { best }
        })
        .0
}

/// Scale a row in place so it sums to 1; rows summing to 0 are left untouched.
pub(crate) fn normalize(row: &mut [f64]) {
    let total: f64 = row.iter().sum();
    if total > 0.0 {
        row.iter_mut().for_each(|v| *v /= total);
    }
}
