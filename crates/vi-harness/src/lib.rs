#![forbid(unsafe_code)]

//! Drives blind and gradient input search over many generated graphs and
//! collects one result row per graph.

use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};
use vi_core::Device;
use vi_graph::{ExecutableGraph, GenerationRequest, GeneratorError, GraphError, GraphGenerator};
use vi_search::{GradientOutcome, Outcome, blind_search, generate_candidates, gradient_search};

pub const CSV_HEADER: &str =
    "model_seed,n_nodes,v3-time,v3-try,v3-succ,grad-time,grad-try,grad-succ";

/// Salt separating the candidate-noise stream from the model-seed stream.
const NOISE_STREAM_SALT: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentConfig {
    pub max_nodes: usize,
    pub exp_seed: Option<u64>,
    pub n_inp_sample: usize,
    pub n_model: usize,
    pub min_dims: Vec<usize>,
    pub timeout_ms: u64,
    pub use_cuda: bool,
    pub verbose: bool,
    pub use_bitvec: bool,
    pub output: Option<PathBuf>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            max_nodes: 25,
            exp_seed: None,
            n_inp_sample: 10,
            n_model: 50,
            min_dims: vec![1, 3, 48, 48],
            timeout_ms: 50_000,
            use_cuda: false,
            verbose: false,
            use_bitvec: false,
            output: None,
        }
    }
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.max_nodes == 0 {
            return Err(HarnessError::Config("max_nodes must be positive".into()));
        }
        if self.n_inp_sample == 0 {
            return Err(HarnessError::Config("n_inp_sample must be positive".into()));
        }
        if self.min_dims.is_empty() || self.min_dims.contains(&0) {
            return Err(HarnessError::Config(format!(
                "min_dims must be non-empty with positive extents, got {:?}",
                self.min_dims
            )));
        }
        Ok(())
    }

    pub fn candidate_count(&self) -> Result<NonZeroUsize, HarnessError> {
        NonZeroUsize::new(self.n_inp_sample)
            .ok_or_else(|| HarnessError::Config("n_inp_sample must be positive".into()))
    }

    /// The configured seed, or a fresh one from system entropy.
    #[must_use]
    pub fn resolve_seed(&self) -> u64 {
        self.exp_seed.unwrap_or_else(|| u64::from(rand::rng().random::<u32>()))
    }

    #[must_use]
    pub fn device(&self) -> Device {
        Device::preferred(self.use_cuda)
    }

    #[must_use]
    pub fn default_output_path(&self, exp_seed: u64) -> PathBuf {
        PathBuf::from(format!(
            "r{exp_seed}-model{}-node{}-inp-search.csv",
            self.n_model, self.max_nodes
        ))
    }

    #[must_use]
    pub fn output_path(&self, exp_seed: u64) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| self.default_output_path(exp_seed))
    }

    fn request(&self, seed: u32) -> GenerationRequest {
        GenerationRequest {
            seed,
            max_nodes: self.max_nodes,
            min_dims: self.min_dims.clone(),
            use_bitvec: self.use_bitvec,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HarnessError {
    Config(String),
    Generator(GeneratorError),
    Graph { model_seed: u32, error: GraphError },
    Io { path: PathBuf, message: String },
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(reason) => write!(f, "invalid experiment config: {reason}"),
            Self::Generator(error) => write!(f, "graph generation failed: {error}"),
            Self::Graph { model_seed, error } => {
                write!(f, "search on model {model_seed} failed: {error}")
            }
            Self::Io { path, message } => {
                write!(f, "failed to write {}: {message}", path.display())
            }
        }
    }
}

impl std::error::Error for HarnessError {}

impl From<GeneratorError> for HarnessError {
    fn from(value: GeneratorError) -> Self {
        Self::Generator(value)
    }
}

/// Two independent random streams derived from one experiment seed.
#[derive(Debug, Clone)]
pub struct ExperimentSeeds {
    exp_seed: u64,
    models: StdRng,
    noise: StdRng,
}

impl ExperimentSeeds {
    #[must_use]
    pub fn new(exp_seed: u64) -> Self {
        Self {
            exp_seed,
            models: StdRng::seed_from_u64(exp_seed),
            noise: StdRng::seed_from_u64(exp_seed ^ NOISE_STREAM_SALT),
        }
    }

    #[must_use]
    pub fn exp_seed(&self) -> u64 {
        self.exp_seed
    }

    pub fn next_model_seed(&mut self) -> u32 {
        self.models.random()
    }

    pub fn noise(&mut self) -> &mut StdRng {
        &mut self.noise
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub model_seed: u32,
    pub n_nodes: usize,
    pub blind_time_s: f64,
    pub blind_attempts: usize,
    pub blind_success: bool,
    pub grad_time_s: f64,
    pub grad_attempts: usize,
    pub grad_success: bool,
    pub grad_fallback_at: Option<usize>,
}

impl ResultRow {
    #[must_use]
    pub fn new(model_seed: u32, n_nodes: usize, blind: &Outcome, grad: &GradientOutcome) -> Self {
        Self {
            model_seed,
            n_nodes,
            blind_time_s: blind.elapsed.as_secs_f64(),
            blind_attempts: blind.attempts,
            blind_success: blind.success,
            grad_time_s: grad.outcome.elapsed.as_secs_f64(),
            grad_attempts: grad.outcome.attempts,
            grad_success: grad.outcome.success,
            grad_fallback_at: grad.fallback_at,
        }
    }

    fn csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{}",
            self.model_seed,
            self.n_nodes,
            self.blind_time_s,
            self.blind_attempts,
            csv_bool(self.blind_success),
            self.grad_time_s,
            self.grad_attempts,
            csv_bool(self.grad_success),
        )
    }
}

fn csv_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// Append-only table, one row per generated graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    exp_seed: u64,
    rows: Vec<ResultRow>,
}

impl ResultTable {
    #[must_use]
    pub fn new(exp_seed: u64) -> Self {
        Self {
            exp_seed,
            rows: Vec::new(),
        }
    }

    #[must_use]
    pub fn exp_seed(&self) -> u64 {
        self.exp_seed
    }

    pub fn append(&mut self, row: ResultRow) {
        self.rows.push(row);
    }

    #[must_use]
    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn to_csv_string(&self) -> String {
        let mut out = String::with_capacity(CSV_HEADER.len() + 1 + self.rows.len() * 64);
        out.push_str(CSV_HEADER);
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.csv_line());
            out.push('\n');
        }
        out
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), HarnessError> {
        let io_error = |error: std::io::Error| HarnessError::Io {
            path: path.to_path_buf(),
            message: error.to_string(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(path, self.to_csv_string()).map_err(io_error)
    }

    #[must_use]
    pub fn summary(&self) -> RunSummary {
        let models = self.rows.len();
        let mean = |value: fn(&ResultRow) -> f64| -> f64 {
            if models == 0 {
                0.0
            } else {
                self.rows.iter().map(value).sum::<f64>() / models as f64
            }
        };
        RunSummary {
            exp_seed: self.exp_seed,
            models,
            blind_successes: self.rows.iter().filter(|row| row.blind_success).count(),
            grad_successes: self.rows.iter().filter(|row| row.grad_success).count(),
            mean_blind_time_s: mean(|row| row.blind_time_s),
            mean_grad_time_s: mean(|row| row.grad_time_s),
            mean_blind_attempts: mean(|row| row.blind_attempts as f64),
            mean_grad_attempts: mean(|row| row.grad_attempts as f64),
            grad_fallbacks: self
                .rows
                .iter()
                .filter(|row| row.grad_fallback_at.is_some())
                .count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub exp_seed: u64,
    pub models: usize,
    pub blind_successes: usize,
    pub grad_successes: usize,
    pub mean_blind_time_s: f64,
    pub mean_grad_time_s: f64,
    pub mean_blind_attempts: f64,
    pub mean_grad_attempts: f64,
    pub grad_fallbacks: usize,
}

/// Runs both strategies against one graph and candidate sequence.
pub fn search_model<G: ExecutableGraph + ?Sized>(
    graph: &mut G,
    model_seed: u32,
    n_samples: NonZeroUsize,
    device: Device,
    noise: &mut StdRng,
) -> Result<ResultRow, GraphError> {
    let candidates = generate_candidates(&graph.input_shapes(), n_samples, noise);
    let blind = blind_search(graph, &candidates)?;
    let grad = gradient_search(graph, &candidates, device, &blind)?;
    Ok(ResultRow::new(model_seed, graph.node_count(), &blind, &grad))
}

/// Appends one row per model to `table`. On error the rows already appended
/// stay in place and no row is added for the failing model.
pub fn run_comparison_into<G: GraphGenerator>(
    config: &ExperimentConfig,
    seeds: &mut ExperimentSeeds,
    generator: &mut G,
    table: &mut ResultTable,
) -> Result<(), HarnessError> {
    config.validate()?;
    let n_samples = config.candidate_count()?;
    let device = config.device();

    for model in 0..config.n_model {
        let model_seed = seeds.next_model_seed();
        let mut graph = generator.generate(&config.request(model_seed))?;
        debug!(model, model_seed, nodes = graph.node_count(), "generated graph");

        let row = search_model(&mut graph, model_seed, n_samples, device, seeds.noise())
            .map_err(|error| HarnessError::Graph { model_seed, error })?;
        info!(
            model,
            model_seed,
            nodes = row.n_nodes,
            blind_success = row.blind_success,
            blind_attempts = row.blind_attempts,
            grad_success = row.grad_success,
            grad_attempts = row.grad_attempts,
            fallback = row.grad_fallback_at.is_some(),
            "model searched"
        );
        table.append(row);
    }
    Ok(())
}

pub fn run_comparison<G: GraphGenerator>(
    config: &ExperimentConfig,
    generator: &mut G,
) -> Result<ResultTable, HarnessError> {
    let exp_seed = config.resolve_seed();
    info!(exp_seed, models = config.n_model, "starting input search comparison");

    let mut seeds = ExperimentSeeds::new(exp_seed);
    let mut table = ResultTable::new(exp_seed);
    run_comparison_into(config, &mut seeds, generator, &mut table)?;
    Ok(table)
}
