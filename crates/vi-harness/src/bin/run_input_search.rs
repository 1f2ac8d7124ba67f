#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use vi_graph::RandomGraphGenerator;
use vi_harness::{ExperimentConfig, ExperimentSeeds, ResultTable, run_comparison_into};

/// Compare blind and gradient-guided valid-input search over random graphs.
#[derive(Debug, Parser)]
#[command(name = "run_input_search", version)]
struct Cli {
    /// Maximum number of nodes per generated graph
    #[arg(long, alias = "max_nodes", default_value_t = 25)]
    max_nodes: usize,
    /// Experiment seed; drawn from system entropy when omitted
    #[arg(long, alias = "exp_seed")]
    exp_seed: Option<u64>,
    /// Number of candidate inputs per graph
    #[arg(long, alias = "n_inp_sample", default_value_t = 10)]
    n_inp_sample: usize,
    /// Number of graphs to generate
    #[arg(long, alias = "n_model", default_value_t = 50)]
    n_model: usize,
    /// Shape of every graph input
    #[arg(long, alias = "min_dims", value_delimiter = ',', num_args = 1.., default_values_t = [1, 3, 48, 48])]
    min_dims: Vec<usize>,
    /// Generation timeout in milliseconds
    #[arg(long, default_value_t = 50_000)]
    timeout: u64,
    #[arg(long, alias = "use_cuda")]
    use_cuda: bool,
    #[arg(long)]
    verbose: bool,
    #[arg(long, alias = "use_bitvec")]
    use_bitvec: bool,
    /// CSV destination; defaults to a name derived from the run parameters
    #[arg(long)]
    output: Option<PathBuf>,
}

impl From<Cli> for ExperimentConfig {
    fn from(cli: Cli) -> Self {
        Self {
            max_nodes: cli.max_nodes,
            exp_seed: cli.exp_seed,
            n_inp_sample: cli.n_inp_sample,
            n_model: cli.n_model,
            min_dims: cli.min_dims,
            timeout_ms: cli.timeout,
            use_cuda: cli.use_cuda,
            verbose: cli.verbose,
            use_bitvec: cli.use_bitvec,
            output: cli.output,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<(), String> {
    let config = ExperimentConfig::from(Cli::parse());
    init_tracing(config.verbose);
    config.validate().map_err(|error| error.to_string())?;

    let exp_seed = config.resolve_seed();
    tracing::info!(exp_seed, "experiment seed");

    let mut generator = RandomGraphGenerator::default();
    let mut seeds = ExperimentSeeds::new(exp_seed);
    let mut table = ResultTable::new(exp_seed);
    run_comparison_into(&config, &mut seeds, &mut generator, &mut table).map_err(|error| {
        format!(
            "run aborted after {} of {} models (exp_seed={exp_seed}): {error}",
            table.len(),
            config.n_model
        )
    })?;

    let output_path = config.output_path(exp_seed);
    table
        .write_csv(&output_path)
        .map_err(|error| error.to_string())?;

    let summary = table.summary();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": "ok",
            "output_path": output_path.display().to_string(),
            "summary": summary,
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, ExperimentConfig};

    #[test]
    fn underscore_flags_are_accepted() {
        let cli = Cli::try_parse_from([
            "run_input_search",
            "--max_nodes",
            "7",
            "--exp_seed",
            "42",
            "--n_inp_sample",
            "3",
            "--n_model",
            "2",
            "--min_dims",
            "1,2",
            "--use_cuda",
            "--use_bitvec",
        ])
        .expect("underscore spellings should parse");
        let config = ExperimentConfig::from(cli);
        assert_eq!(config.max_nodes, 7);
        assert_eq!(config.exp_seed, Some(42));
        assert_eq!(config.n_inp_sample, 3);
        assert_eq!(config.n_model, 2);
        assert_eq!(config.min_dims, vec![1, 2]);
        assert!(config.use_cuda);
        assert!(config.use_bitvec);
    }

    #[test]
    fn kebab_flags_and_defaults_still_parse() {
        let cli = Cli::try_parse_from(["run_input_search", "--max-nodes", "9", "--use-cuda"])
            .expect("kebab spellings should parse");
        let config = ExperimentConfig::from(cli);
        assert_eq!(config.max_nodes, 9);
        assert!(config.use_cuda);
        assert_eq!(config.n_inp_sample, 10);
        assert_eq!(config.min_dims, vec![1, 3, 48, 48]);
        assert_eq!(config.timeout_ms, 50_000);
    }
}
