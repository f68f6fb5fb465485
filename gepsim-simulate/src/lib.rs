//! # gepsim-simulate: synthetic bulk gene-expression profiles
//!
//! Generates labeled bulk GEPs by mixing single-cell expression according to random
//! cell-type fractions, keeping only the profiles that look like a real reference cohort.
//!
//! ## Overview
//!
//! A job runs in rounds. Each round:
//!
//! 1. draws fraction vectors with a [`FractionStrategy`](fractions::FractionStrategy),
//! 2. turns them into cell counts and draws cells with the [`CellPicker`](picker::CellPicker),
//! 3. mixes the drawn cells into TPM profiles with the [`Mixer`](mixer::Mixer),
//! 4. filters the profiles against the reference with a [`FilterChain`](filter::FilterChain),
//! 5. appends the accepted samples to the output tables and persists the job state.
//!
//! Rounds repeat until the target count is reached. An interrupted job resumes after its
//! last complete round and produces the same samples as an uninterrupted one.
//!
//! ## Example
//!
//! ```rust,ignore
//! use gepsim_simulate::{BulkGepGenerator, JobConfig};
//!
//! let config = JobConfig::from_file(Path::new("job.toml"))?;
//! config.validate()?;
//! let pool = config.load_pool()?;
//! let reference = config.load_reference(pool.genes())?;
//! let filters = config.build_filters(&reference, pool.genes())?;
//!
//! let summary = BulkGepGenerator::new(&pool, config.params(true), filters)?.run()?;
//! println!("{} samples, acceptance ratio {}", summary.accepted, summary.acceptance_ratio);
//! ```
//!
//! ## Module Structure
//!
//! - [`fractions`] - fraction vector strategies
//! - [`picker`] - cell counts and parallel cell draws
//! - [`mixer`] - averaging, weighted mixing and noise
//! - [`filter`] - reference-similarity filters
//! - [`generator`] - the resumable generation loop
//! - [`state`] / [`artifacts`] - persisted job state and output tables
//! - [`config`] - TOML job files

pub mod artifacts;
pub mod config;
pub mod consts;
pub mod errors;
pub mod filter;
pub mod fractions;
pub mod generator;
pub mod mixer;
pub mod picker;
pub mod rng;
pub mod state;

// Re-export commonly used types
pub use artifacts::{ArtifactPaths, DatasetBundle, GenerationSummary};
pub use config::{EXAMPLE_CONFIG, JobConfig};
pub use errors::{Result, SimulationError};
pub use filter::{FilterChain, FilterPolicy, ProfileFilter, ReferenceData};
pub use fractions::FractionStrategy;
pub use generator::{BulkGepGenerator, GenerationParams};
pub use mixer::{MixMethod, Mixer, MixerOptions, NoiseModel, ProfileBatch};
pub use picker::{CellPicker, PickerOptions, SampledCellSet};
pub use state::GenerationState;
