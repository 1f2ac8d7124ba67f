use std::time::Duration;

use vi_graph::{
    GenerationRequest, GeneratorError, GradientSearchConfig, GraphError, GraphGenerator,
    GraphInterpreter, OpGraph, RandomGraphGenerator,
};
use vi_harness::{
    CSV_HEADER, ExperimentConfig, ExperimentSeeds, HarnessError, ResultRow, ResultTable,
    run_comparison, run_comparison_into,
};
use vi_kernel_cpu::{BinaryOp, UnaryOp};

fn small_config(exp_seed: u64) -> ExperimentConfig {
    ExperimentConfig {
        max_nodes: 8,
        exp_seed: Some(exp_seed),
        n_inp_sample: 4,
        n_model: 4,
        min_dims: vec![2, 3],
        timeout_ms: 10_000,
        ..ExperimentConfig::default()
    }
}

fn without_times(rows: &[ResultRow]) -> Vec<(u32, usize, bool, usize, bool, usize, Option<usize>)> {
    rows.iter()
        .map(|row| {
            (
                row.model_seed,
                row.n_nodes,
                row.blind_success,
                row.blind_attempts,
                row.grad_success,
                row.grad_attempts,
                row.grad_fallback_at,
            )
        })
        .collect()
}

enum Sabotage {
    Timeout,
    MismatchedGraph,
}

/// Delegates to the random generator until `fail_at`, then misbehaves.
struct FlakyGenerator {
    inner: RandomGraphGenerator,
    calls: usize,
    fail_at: usize,
    sabotage: Sabotage,
}

impl GraphGenerator for FlakyGenerator {
    type Graph = GraphInterpreter;

    fn generate(&mut self, request: &GenerationRequest) -> Result<Self::Graph, GeneratorError> {
        let call = self.calls;
        self.calls += 1;
        if call != self.fail_at {
            return self.inner.generate(request);
        }
        match self.sabotage {
            Sabotage::Timeout => Err(GeneratorError::Timeout {
                seed: request.seed,
                budget: request.timeout,
            }),
            Sabotage::MismatchedGraph => {
                let mut graph = OpGraph::new(vec![vec![2], vec![3]]);
                graph.binary(BinaryOp::Add, graph.input(0), graph.input(1))?;
                Ok(GraphInterpreter::new(graph, GradientSearchConfig::default()))
            }
        }
    }
}

/// Always hands out `log(floor(x))`, which has no gradient path.
struct FloorGenerator;

impl GraphGenerator for FloorGenerator {
    type Graph = GraphInterpreter;

    fn generate(&mut self, request: &GenerationRequest) -> Result<Self::Graph, GeneratorError> {
        let mut graph = OpGraph::new(vec![request.min_dims.clone()]);
        let floored = graph.unary(UnaryOp::Floor, graph.input(0))?;
        graph.unary(UnaryOp::Log, floored)?;
        Ok(GraphInterpreter::new(graph, GradientSearchConfig::default()))
    }
}

#[test]
fn comparison_runs_end_to_end() {
    let config = small_config(5);
    let mut generator = RandomGraphGenerator::default();
    let table = run_comparison(&config, &mut generator).expect("comparison should run");

    assert_eq!(table.exp_seed(), 5);
    assert_eq!(table.len(), config.n_model);
    for row in table.rows() {
        assert_eq!(row.n_nodes, config.max_nodes);
        assert!((1..=config.n_inp_sample).contains(&row.blind_attempts));
        assert!((1..=config.n_inp_sample).contains(&row.grad_attempts));
        if !row.blind_success {
            assert_eq!(row.blind_attempts, config.n_inp_sample);
        }
        if row.grad_fallback_at.is_some() {
            assert_eq!(row.grad_success, row.blind_success);
            assert_eq!(row.grad_attempts, row.blind_attempts);
        }
    }

    let summary = table.summary();
    assert_eq!(summary.models, config.n_model);
    assert!(summary.blind_successes <= summary.models);
}

#[test]
fn comparison_is_reproducible_for_fixed_seed() {
    let config = small_config(11);
    let first = run_comparison(&config, &mut RandomGraphGenerator::default())
        .expect("first run should succeed");
    let second = run_comparison(&config, &mut RandomGraphGenerator::default())
        .expect("second run should succeed");
    assert_eq!(without_times(first.rows()), without_times(second.rows()));
}

#[test]
fn csv_is_written_with_fixed_header() {
    let config = small_config(3);
    let table = run_comparison(&config, &mut RandomGraphGenerator::default())
        .expect("comparison should run");

    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir
        .path()
        .join("nested")
        .join(config.default_output_path(table.exp_seed()));
    table.write_csv(&path).expect("csv should be written");

    let raw = std::fs::read_to_string(&path).expect("csv should be readable");
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines[0], CSV_HEADER);
    assert_eq!(lines.len(), 1 + config.n_model);
    for line in &lines[1..] {
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 8);
        assert!(matches!(fields[4], "True" | "False"));
        assert!(matches!(fields[7], "True" | "False"));
        assert!(fields[2].parse::<f64>().is_ok());
    }
    assert!(
        path.file_name()
            .is_some_and(|name| name == "r3-model4-node8-inp-search.csv")
    );
}

#[test]
fn generator_failure_keeps_earlier_rows() {
    let config = small_config(21);
    let mut generator = FlakyGenerator {
        inner: RandomGraphGenerator::default(),
        calls: 0,
        fail_at: 2,
        sabotage: Sabotage::Timeout,
    };
    let mut seeds = ExperimentSeeds::new(21);
    let mut table = ResultTable::new(21);

    let err = run_comparison_into(&config, &mut seeds, &mut generator, &mut table)
        .expect_err("third model should time out");
    assert!(matches!(
        err,
        HarnessError::Generator(GeneratorError::Timeout { .. })
    ));
    assert_eq!(table.len(), 2);

    let complete = run_comparison(&config, &mut RandomGraphGenerator::default())
        .expect("clean run should succeed");
    assert_eq!(
        without_times(table.rows()),
        without_times(&complete.rows()[..2])
    );
}

#[test]
fn evaluation_error_aborts_without_a_row() {
    let config = small_config(8);
    let mut generator = FlakyGenerator {
        inner: RandomGraphGenerator::default(),
        calls: 0,
        fail_at: 1,
        sabotage: Sabotage::MismatchedGraph,
    };
    let mut seeds = ExperimentSeeds::new(8);
    let mut table = ResultTable::new(8);

    let err = run_comparison_into(&config, &mut seeds, &mut generator, &mut table)
        .expect_err("mismatched operands should fail evaluation");
    assert!(matches!(
        err,
        HarnessError::Graph {
            error: GraphError::Autograd(_),
            ..
        }
    ));
    assert_eq!(table.len(), 1);
}

#[test]
fn non_differentiable_graphs_fall_back_to_blind() {
    let config = ExperimentConfig {
        n_model: 3,
        ..small_config(13)
    };
    let table = run_comparison(&config, &mut FloorGenerator).expect("comparison should run");

    for row in table.rows() {
        assert_eq!(row.grad_fallback_at, Some(1));
        assert_eq!(row.grad_success, row.blind_success);
        assert_eq!(row.grad_attempts, row.blind_attempts);
    }
    assert_eq!(table.summary().grad_fallbacks, 3);
}

#[test]
fn zero_generation_budget_aborts_first_model() {
    let config = ExperimentConfig {
        timeout_ms: 0,
        ..small_config(2)
    };
    let err = run_comparison(&config, &mut RandomGraphGenerator::default())
        .expect_err("zero budget should abort");
    assert!(matches!(
        err,
        HarnessError::Generator(GeneratorError::Timeout { budget, .. }) if budget == Duration::ZERO
    ));
}
