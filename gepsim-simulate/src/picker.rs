//!
//! Turns fraction vectors into concrete single-cell draws.
//!
//! Every (sample, cell type) pair is an independent work item with its own seeded rng, so
//! the draws are spread over a rayon pool and joined back in sample/cell-type order
//! without any shared mutable state.
//!
use std::collections::BTreeMap;

use fxhash::FxHashMap;
use gepsim_core::{CellPool, FractionTable};
use rand::Rng;
use rand::seq::index;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::consts::get_thread_count;
use crate::errors::{Result, SimulationError};
use crate::rng::{Stream, stream_rng};

/// Cells drawn for one cell type of one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct CellDraw {
    pub cell_type: String,
    pub n_cell: usize,
    pub cell_ids: Vec<String>,
    pub(crate) positions: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampledCellSet {
    pub sample_id: String,
    /// Patient all cells were drawn from, when draws are restricted to one patient
    pub patient_id: Option<String>,
    /// One entry per cell type with a non-zero count, sorted by cell type
    pub draws: Vec<CellDraw>,
}

impl SampledCellSet {
    pub fn total_cells(&self) -> usize {
        self.draws.iter().map(|d| d.n_cell).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PickerOptions {
    /// Cells per sample; 0 means one cell per cell type with a non-zero fraction
    pub total_cells: usize,
    pub per_patient: bool,
    pub with_replacement: bool,
    pub threads: Option<usize>,
}

///
/// Integer cell counts for one fraction vector.
///
/// With `total == 0` every type with a non-zero fraction gets one cell. Otherwise counts
/// follow the largest-remainder method: floors of `fraction * total` first, then the
/// leftover cells go to the largest fractional parts (lower index first on ties), so the
/// counts always sum to `total`. When `total` allows it, a type with a non-zero fraction
/// that rounded to no cell takes one from the largest count.
///
pub fn cell_counts(fractions: &[f64], total: usize) -> Vec<usize> {
    if total == 0 {
        return fractions.iter().map(|f| usize::from(*f > 0.0)).collect();
    }

    let sum: f64 = fractions.iter().sum();
    if sum <= 0.0 {
        return vec![0; fractions.len()];
    }

    let exact: Vec<f64> = fractions.iter().map(|f| f / sum * total as f64).collect();
    let mut counts: Vec<usize> = exact.iter().map(|e| e.floor() as usize).collect();
    let assigned: usize = counts.iter().sum();

    let mut order: Vec<usize> = (0..fractions.len()).filter(|i| fractions[*i] > 0.0).collect();
    order.sort_by(|a, b| {
        let ra = exact[*a] - exact[*a].floor();
        let rb = exact[*b] - exact[*b].floor();
        rb.total_cmp(&ra).then(a.cmp(b))
    });
    for i in order.iter().cycle().take(total.saturating_sub(assigned)) {
        counts[*i] += 1;
    }

    // every active type keeps at least one cell, taken from the largest count
    if total >= order.len() {
        for i in order {
            if counts[i] == 0 {
                let donor = argmax(&counts);
                counts[donor] -= 1;
                counts[i] += 1;
            }
        }
    }
    counts
}

fn argmax(counts: &[usize]) -> usize {
    counts
        .iter()
        .enumerate()
        .fold(0, |best, (i, c)| if *c > counts[best] { i } else { best })
}

struct WorkItem<'a> {
    sample: usize,
    cell_type: usize,
    count: usize,
    eligible: &'a [usize],
}

pub struct CellPicker<'a> {
    pool: &'a CellPool,
    options: PickerOptions,
    by_patient: BTreeMap<String, FxHashMap<String, Vec<usize>>>,
    threads: ThreadPool,
}

impl<'a> CellPicker<'a> {
    pub fn new(pool: &'a CellPool, options: PickerOptions) -> Result<Self> {
        let threads = ThreadPoolBuilder::new()
            .num_threads(get_thread_count(options.threads))
            .build()?;

        let mut by_patient: BTreeMap<String, FxHashMap<String, Vec<usize>>> = BTreeMap::new();
        if options.per_patient {
            for (i, cell) in pool.cells().iter().enumerate() {
                by_patient
                    .entry(cell.patient_id.clone())
                    .or_default()
                    .entry(cell.cell_type.clone())
                    .or_default()
                    .push(i);
            }
        }

        Ok(Self {
            pool,
            options,
            by_patient,
            threads,
        })
    }

    pub fn options(&self) -> &PickerOptions {
        &self.options
    }

    /// Run `op` on the picker's thread pool, so later parallel stages share its size.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.threads.install(op)
    }

    ///
    /// Draw cells for every sample of `fractions`.
    ///
    /// # Arguments
    ///
    /// - fractions: one row per sample
    /// - seed: job seed
    /// - round: generation round, part of every work item's rng seed
    ///
    pub fn pick(&self, fractions: &FractionTable, seed: u64, round: u64) -> Result<Vec<SampledCellSet>> {
        let k = fractions.cell_types.len();
        let mut items = Vec::new();
        let mut patients = Vec::with_capacity(fractions.len());

        for (s, row) in fractions.rows.iter().enumerate() {
            let counts = cell_counts(&row.fractions, self.options.total_cells);
            let patient = if self.options.per_patient {
                Some(self.choose_patient(&fractions.cell_types, &counts, seed, round, s)?)
            } else {
                None
            };

            for (t, count) in counts.iter().enumerate().filter(|(_, c)| **c > 0) {
                let cell_type = &fractions.cell_types[t];
                let eligible = match &patient {
                    Some(p) => self.patient_cells(p, cell_type),
                    None => self.pool.cells_of_type(cell_type),
                };
                self.check_eligible(cell_type, eligible.len(), *count, &row.sample_id)?;
                items.push(WorkItem {
                    sample: s,
                    cell_type: t,
                    count: *count,
                    eligible,
                });
            }
            patients.push(patient);
        }

        let with_replacement = self.options.with_replacement;
        let drawn: Vec<Vec<usize>> = self.threads.install(|| {
            items
                .par_iter()
                .map(|item| {
                    let key = (item.sample * k + item.cell_type) as u64;
                    let mut rng = stream_rng(seed, Stream::Cells, round, key);
                    draw_positions(item.eligible, item.count, with_replacement, &mut rng)
                })
                .collect()
        });

        let mut sets: Vec<SampledCellSet> = fractions
            .rows
            .iter()
            .zip(patients)
            .map(|(row, patient_id)| SampledCellSet {
                sample_id: row.sample_id.clone(),
                patient_id,
                draws: Vec::new(),
            })
            .collect();

        for (item, positions) in items.iter().zip(drawn) {
            sets[item.sample].draws.push(CellDraw {
                cell_type: fractions.cell_types[item.cell_type].clone(),
                n_cell: item.count,
                cell_ids: positions
                    .iter()
                    .map(|p| self.pool.cell(*p).cell_id.clone())
                    .collect(),
                positions,
            });
        }
        for set in sets.iter_mut() {
            set.draws.sort_by(|a, b| a.cell_type.cmp(&b.cell_type));
        }

        Ok(sets)
    }

    fn check_eligible(&self, cell_type: &str, available: usize, needed: usize, sample_id: &str) -> Result<()> {
        if available == 0 || (!self.options.with_replacement && available < needed) {
            return Err(SimulationError::InsufficientData(format!(
                "cell type {} has {} eligible cells, sample {} needs {}",
                cell_type, available, sample_id, needed
            )));
        }
        Ok(())
    }

    fn patient_cells(&self, patient: &str, cell_type: &str) -> &[usize] {
        self.by_patient
            .get(patient)
            .and_then(|types| types.get(cell_type))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn choose_patient(
        &self,
        cell_types: &[String],
        counts: &[usize],
        seed: u64,
        round: u64,
        sample: usize,
    ) -> Result<String> {
        let needed = |count: usize| if self.options.with_replacement { 1 } else { count };
        let candidates: Vec<&String> = self
            .by_patient
            .iter()
            .filter(|(_, cells)| {
                counts.iter().enumerate().filter(|(_, c)| **c > 0).all(|(t, c)| {
                    cells.get(&cell_types[t]).map_or(0, Vec::len) >= needed(*c)
                })
            })
            .map(|(p, _)| p)
            .collect();

        if candidates.is_empty() {
            let wanted: Vec<&str> = counts
                .iter()
                .enumerate()
                .filter(|(_, c)| **c > 0)
                .map(|(t, _)| cell_types[t].as_str())
                .collect();
            return Err(SimulationError::InsufficientData(format!(
                "no single patient has enough cells of {:?}",
                wanted
            )));
        }

        let mut rng = stream_rng(seed, Stream::Patients, round, sample as u64);
        Ok(candidates[rng.random_range(0..candidates.len())].clone())
    }
}

fn draw_positions<R: Rng + ?Sized>(
    eligible: &[usize],
    count: usize,
    with_replacement: bool,
    rng: &mut R,
) -> Vec<usize> {
    if with_replacement {
        (0..count)
            .map(|_| eligible[rng.random_range(0..eligible.len())])
            .collect()
    } else {
        index::sample(rng, eligible.len(), count)
            .into_iter()
            .map(|j| eligible[j])
            .collect()
    }
}
