//!
//! Job files.
//!
//! A job is described by one TOML file. Relative paths in it are resolved against the
//! directory holding the file.
//!
use std::path::{Path, PathBuf};

use gepsim_core::io::{
    read_cell_pool, read_expression_table, read_gene_list, read_id_mapping, read_marker_genes,
};
use gepsim_core::models::cell_pool::DATASET_COLUMN;
use gepsim_core::{CellPool, ExpressionScale, ReferenceCohort};
use serde::{Deserialize, Serialize};

use crate::consts::{DEFAULT_TOTAL_CELLS, DEFAULT_ZERO_RATIO_THRESHOLD};
use crate::errors::{Result, SimulationError};
use crate::filter::{FilterChain, FilterPolicy, ReferenceData, SUPPORTED_POLICIES};
use crate::fractions::{FractionStrategy, SUPPORTED_STRATEGIES};
use crate::generator::GenerationParams;
use crate::mixer::{MixMethod, MixerOptions, NoiseModel};
use crate::picker::PickerOptions;

fn default_zero_ratio_threshold() -> f64 {
    DEFAULT_ZERO_RATIO_THRESHOLD
}

fn default_total_cells() -> usize {
    DEFAULT_TOTAL_CELLS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleCellConfig {
    /// Cell-by-gene expression table
    pub expression: PathBuf,
    /// Per-cell metadata with `cell_id`, `cell_type` and `sample_id` columns
    pub metadata: PathBuf,
    #[serde(default)]
    pub scale: ExpressionScale,
    /// Cells with a larger share of genes below 1 are dropped
    #[serde(default = "default_zero_ratio_threshold")]
    pub zero_ratio_threshold: f64,
    /// Keep only cells of these `dataset_id` values
    #[serde(default)]
    pub keep_datasets: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixingConfig {
    #[serde(default)]
    pub method: MixMethod,
    #[serde(default = "default_total_cells")]
    pub total_cells: usize,
    #[serde(default)]
    pub per_patient: bool,
    #[serde(default)]
    pub with_replacement: bool,
    #[serde(default)]
    pub noise: Option<NoiseModel>,
    #[serde(default)]
    pub fill_low_values: bool,
}

impl Default for MixingConfig {
    fn default() -> Self {
        Self {
            method: MixMethod::default(),
            total_cells: DEFAULT_TOTAL_CELLS,
            per_patient: false,
            with_replacement: false,
            noise: None,
            fill_low_values: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReferenceConfig {
    /// Sample-by-gene table of the reference cohort
    #[serde(default)]
    pub expression: Option<PathBuf>,
    #[serde(default)]
    pub scale: ExpressionScale,
    /// Two-column sample id to group table
    #[serde(default)]
    pub groups: Option<PathBuf>,
    #[serde(default)]
    pub keep_groups: Option<Vec<String>>,
    /// `cell_type,gene` marker table
    #[serde(default)]
    pub markers: Option<PathBuf>,
    /// Precomputed marker-ratio projection, one column per cell type
    #[serde(default)]
    pub projection: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub output_dir: PathBuf,
    pub n_samples: usize,
    pub cell_types: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_rounds: Option<u64>,
    pub single_cell: SingleCellConfig,
    #[serde(default)]
    pub fractions: FractionStrategy,
    #[serde(default)]
    pub mixing: MixingConfig,
    #[serde(default)]
    pub reference: Option<ReferenceConfig>,
    #[serde(default, rename = "filter")]
    pub filters: Vec<FilterPolicy>,
    /// Gene list the filters compare on
    #[serde(default)]
    pub filter_genes: Option<PathBuf>,
}

fn check_tag(section: Option<&toml::Value>, tag: &str, supported: &[&str], what: &str) -> Result<()> {
    let Some(name) = section
        .and_then(|s| s.get(tag))
        .and_then(toml::Value::as_str)
    else {
        return Ok(());
    };
    if supported.contains(&name) {
        Ok(())
    } else {
        Err(SimulationError::InvalidArgument(format!(
            "unsupported {} '{}', expected one of: {}",
            what,
            name,
            supported.join(", ")
        )))
    }
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() && !path.as_os_str().is_empty() {
        *path = base.join(&*path);
    }
}

fn resolve_opt(base: &Path, path: &mut Option<PathBuf>) {
    if let Some(path) = path {
        resolve(base, path);
    }
}

impl JobConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    ///
    /// Parse a job file. Unknown strategy or policy names are reported with the supported
    /// ones before the rest of the file is deserialised.
    ///
    pub fn from_toml(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)?;
        check_tag(
            table.get("fractions"),
            "method",
            SUPPORTED_STRATEGIES,
            "fraction strategy",
        )?;
        if let Some(filters) = table.get("filter").and_then(toml::Value::as_array) {
            for filter in filters {
                check_tag(Some(filter), "policy", SUPPORTED_POLICIES, "filter policy")?;
            }
        }
        Ok(toml::Value::Table(table).try_into()?)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        resolve(base, &mut self.output_dir);
        resolve(base, &mut self.single_cell.expression);
        resolve(base, &mut self.single_cell.metadata);
        resolve_opt(base, &mut self.filter_genes);
        if let Some(reference) = &mut self.reference {
            resolve_opt(base, &mut reference.expression);
            resolve_opt(base, &mut reference.groups);
            resolve_opt(base, &mut reference.markers);
            resolve_opt(base, &mut reference.projection);
        }
    }

    ///
    /// Check the job before any table is read.
    ///
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            return Err(SimulationError::InvalidArgument(format!(
                "job name {:?} must be a non-empty file name",
                self.name
            )));
        }
        if self.n_samples == 0 {
            return Err(SimulationError::InvalidArgument(
                "n_samples must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.single_cell.zero_ratio_threshold) {
            return Err(SimulationError::InvalidArgument(format!(
                "zero_ratio_threshold {} is outside [0, 1]",
                self.single_cell.zero_ratio_threshold
            )));
        }
        self.fractions.validate(&self.cell_types)?;
        self.mixing
            .method
            .check_cell_budget(self.mixing.total_cells, self.cell_types.len())?;
        if let Some(noise) = &self.mixing.noise {
            noise.validate()?;
        }

        if self
            .filters
            .iter()
            .filter(|f| matches!(f, FilterPolicy::MarkerRatio { .. }))
            .count()
            > 1
        {
            return Err(SimulationError::InvalidArgument(
                "at most one marker_ratio filter per job".to_string(),
            ));
        }

        let reference = match (&self.reference, self.filters.is_empty()) {
            (_, true) => return Ok(()),
            (Some(reference), false) => reference,
            (None, false) => {
                return Err(SimulationError::MissingReference(format!(
                    "filters {:?} need a [reference] section",
                    self.filters.iter().map(FilterPolicy::name).collect::<Vec<_>>()
                )));
            }
        };
        if reference.keep_groups.is_some() && reference.groups.is_none() {
            return Err(SimulationError::InvalidArgument(
                "reference keep_groups needs a groups table".to_string(),
            ));
        }

        for filter in &self.filters {
            filter.validate()?;
            let missing = match filter {
                FilterPolicy::MarkerRatio { .. } => {
                    reference.markers.is_none()
                        || (reference.expression.is_none() && reference.projection.is_none())
                }
                _ => reference.expression.is_none(),
            };
            if missing {
                return Err(SimulationError::MissingReference(format!(
                    "{} filter: the [reference] section lacks the tables it needs",
                    filter.name()
                )));
            }
        }
        Ok(())
    }

    ///
    /// Read the single-cell pool: join expression and metadata, keep the configured
    /// datasets and cell types, and drop sparse cells.
    ///
    pub fn load_pool(&self) -> Result<CellPool> {
        let sc = &self.single_cell;
        let mut pool = read_cell_pool(&sc.expression, &sc.metadata, sc.scale)?;
        if let Some(datasets) = &sc.keep_datasets {
            pool = pool.restrict_to_groups(DATASET_COLUMN, datasets)?;
        }
        let before = pool.len();
        let pool = pool
            .drop_sparse_cells(sc.zero_ratio_threshold)?
            .restrict_to_cell_types(&self.cell_types)?;
        tracing::info!(
            "{} cells of {} cell types over {} genes ({} dropped as sparse or of other types)",
            pool.len(),
            pool.cell_types().len(),
            pool.genes().len(),
            before - pool.len()
        );
        Ok(pool)
    }

    ///
    /// Read the reference material the filters need, aligned to `genes`.
    ///
    pub fn load_reference(&self, genes: &[String]) -> Result<ReferenceData> {
        let Some(reference) = &self.reference else {
            return Ok(ReferenceData::default());
        };

        let cohort = match &reference.expression {
            Some(path) => {
                let mut cohort = ReferenceCohort::new(read_expression_table(path)?, reference.scale)?;
                if let (Some(groups), Some(keep)) = (&reference.groups, &reference.keep_groups) {
                    cohort = cohort.restrict_to_groups(&read_id_mapping(groups)?, keep)?;
                }
                tracing::info!("{} reference samples", cohort.len());
                Some(cohort.align_to_genes(genes))
            }
            None => None,
        };
        let markers = reference
            .markers
            .as_deref()
            .map(read_marker_genes)
            .transpose()?;
        let projection = reference
            .projection
            .as_deref()
            .map(read_expression_table)
            .transpose()?;

        Ok(ReferenceData {
            cohort,
            markers,
            projection,
        })
    }

    ///
    /// Build the filter chain on `genes`, or on the configured gene subset of them.
    ///
    pub fn build_filters(&self, reference: &ReferenceData, genes: &[String]) -> Result<FilterChain> {
        if self.filters.is_empty() {
            return Ok(FilterChain::default());
        }

        let (reference, filter_genes, columns) = match &self.filter_genes {
            Some(path) => {
                let wanted = read_gene_list(path)?;
                let (subset, columns): (Vec<String>, Vec<usize>) = wanted
                    .into_iter()
                    .filter_map(|g| genes.iter().position(|x| *x == g).map(|c| (g, c)))
                    .unzip();
                if subset.is_empty() {
                    return Err(SimulationError::InvalidArgument(format!(
                        "none of the genes in {} are in the single-cell data",
                        path.display()
                    )));
                }
                tracing::info!("filters compare on {} genes", subset.len());
                let restricted = ReferenceData {
                    cohort: reference
                        .cohort
                        .as_ref()
                        .map(|c| c.restrict_genes(&subset))
                        .transpose()?,
                    ..reference.clone()
                };
                (restricted, subset, Some(columns))
            }
            None => (reference.clone(), genes.to_vec(), None),
        };

        let filters = self
            .filters
            .iter()
            .map(|f| f.build(&reference, &filter_genes, self.n_samples))
            .collect::<Result<Vec<_>>>()?;
        let chain = FilterChain::new(filters);
        Ok(match columns {
            Some(columns) => chain.with_gene_subset(columns),
            None => chain,
        })
    }

    pub fn params(&self, show_progress: bool) -> GenerationParams {
        GenerationParams {
            name: self.name.clone(),
            output_dir: self.output_dir.clone(),
            n_samples: self.n_samples,
            cell_types: self.cell_types.clone(),
            strategy: self.fractions.clone(),
            picker: PickerOptions {
                total_cells: self.mixing.total_cells,
                per_patient: self.mixing.per_patient,
                with_replacement: self.mixing.with_replacement,
                threads: self.threads,
            },
            mixer: MixerOptions {
                method: self.mixing.method,
                noise: self.mixing.noise.clone(),
                fill_low_values: self.mixing.fill_low_values,
            },
            seed: self.seed,
            batch_size: self.batch_size,
            max_rounds: self.max_rounds,
            show_progress,
        }
    }
}

pub const EXAMPLE_CONFIG: &str = r#"# gepsim job file
name = "demo"
output_dir = "results"
n_samples = 10000
cell_types = ["B Cells", "CD4 T", "CD8 T", "Cancer Cells", "Endothelial Cells", "Fibroblasts"]
# seed = 42
# threads = 8
# batch_size = 5000
# max_rounds = 10

[single_cell]
expression = "sc_expression.csv.gz"   # cells x genes
metadata = "sc_metadata.csv"          # cell_id,cell_type,sample_id[,dataset_id,...]
scale = "log2_p1"                     # or "linear"
zero_ratio_threshold = 0.97
# keep_datasets = ["hnscc_2017"]

[fractions]
method = "fragment"                   # segment | seg_random | fragment | random | single_cell_type
minimal_fraction = 0.005
# subset_sizes = [2, 4, 6]

[mixing]
method = "weighted_mix"               # or "average"
total_cells = 500
per_patient = false
with_replacement = false
# [mixing.noise]
# max_total = 10000.0

[reference]
expression = "tcga_tpm.csv.gz"
scale = "log2_p1"
# groups = "tcga_cancer_types.csv"
# keep_groups = ["HNSC", "LUSC"]
# markers = "marker_genes.csv"

[[filter]]
policy = "centroid_band"
centroid = "median"
upper_quantile = 0.95

# [[filter]]
# policy = "marker_ratio"
# quantile = 0.95
# reducer = "max"

# filter_genes = "filter_genes.txt"
"#;
